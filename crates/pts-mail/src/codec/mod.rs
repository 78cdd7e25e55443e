//! Message and VERP codecs shared by the mail engines.

pub mod message;
pub mod verp;

pub use message::MailMessage;
