use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

/// One outgoing notification. Template rendering and SMTP delivery live
/// outside this crate; senders receive the structured payload only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeEmail {
    /// Invitation to a candidate guide, carrying the fragment action links.
    GuideInvited {
        request_id: String,
        student_id: String,
        city: String,
        accept_link: String,
        decline_link: String,
        view_link: String,
    },
    /// Tells the tourist which guide accepted.
    TouristMatched {
        request_id: String,
        city: String,
        student_id: String,
    },
    /// Tells a still-pending guide that the request was filled by someone else.
    GuideFilled {
        request_id: String,
        student_id: String,
    },
}

impl OutcomeEmail {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::GuideInvited { .. } => "guide_invited",
            Self::TouristMatched { .. } => "tourist_matched",
            Self::GuideFilled { .. } => "guide_filled",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("email delivery failed: {message}")]
    Delivery { message: String },
}

/// Outbound email seam.
///
/// Sends are fire-and-forget from the arbiter's perspective: callers log
/// failures and never propagate them to the guide who clicked the link.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: OutcomeEmail) -> Result<(), EmailError>;
}

/// Captures outgoing emails for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<OutcomeEmail>>,
}

impl RecordingEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<OutcomeEmail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, email: OutcomeEmail) -> Result<(), EmailError> {
        self.sent.lock().await.push(email);
        Ok(())
    }
}
