//! Consumer-side event handlers.

pub mod email;

pub use email::{EmailHandler, LogMailer, MailError, Mailer, OutgoingEmail};
