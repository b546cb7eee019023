//! TripMatch match core: selection arbitration, signed action tokens, and
//! guide reliability scoring.
//!
//! Three components cooperate to turn an emailed action link into exactly one
//! matched guide:
//!
//! - [`match_token::MatchTokenCodec`] mints and verifies the stateless signed
//!   tokens embedded in email links. Verification proves provenance and
//!   freshness only; it says nothing about whether the referenced selection
//!   is still actionable.
//! - [`selection::SelectionArbiter`] arbitrates responses. Its correctness —
//!   at most one accepted selection per request, ever — lives in the store's
//!   atomic conditional transitions, never in application-level
//!   check-then-act, so any number of stateless server instances can race
//!   safely.
//! - [`reliability::ReliabilityScorer`] records reviews and recomputes a
//!   guide's derived metrics in the same transaction.
//!
//! Collaborators are injected as traits ([`store::MatchStore`],
//! [`notify::EmailSender`], [`clock::Clock`]); the crate holds no
//! process-wide mutable state of its own.
#![cfg_attr(
    test,
    allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)
)]

pub mod clock;
pub mod match_token;
pub mod notify;
pub mod reliability;
pub mod selection;
pub mod store;
