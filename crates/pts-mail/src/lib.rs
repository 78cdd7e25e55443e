//! # pts-mail
//!
//! The mail engines of the Package Tracking System: the message and VERP
//! codecs, the dispatch engine fanning package mail out to subscribers, the
//! bounce engine with automatic unsubscription, the control command
//! processor, and the vendor hook surface.

pub mod bounces;
pub mod codec;
pub mod control;
pub mod dispatch;
pub mod vendor;

pub use bounces::{BounceEngine, BounceOutcome};
pub use codec::MailMessage;
pub use control::{ControlOutcome, ControlProcessor};
pub use dispatch::{DispatchEngine, DispatchOutcome};
pub use vendor::{select_vendor, Vendor};
