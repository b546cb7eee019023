use async_trait::async_trait;
use matching_domain::notify::{EmailError, EmailSender, OutcomeEmail};
use tracing::info;

/// Production [`EmailSender`]: hands the structured payload to the log
/// pipeline the mailer consumes. Template rendering and SMTP delivery are
/// external collaborators; nothing in this service blocks on them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEmailSender;

#[async_trait]
impl EmailSender for TracingEmailSender {
    async fn send(&self, email: OutcomeEmail) -> Result<(), EmailError> {
        let payload = serde_json::to_string(&email).map_err(|error| EmailError::Delivery {
            message: format!("failed to encode email payload: {error}"),
        })?;
        info!(
            target: "tripmatch.email",
            kind = email.kind(),
            payload = %payload,
            "queueing outcome email",
        );
        Ok(())
    }
}
