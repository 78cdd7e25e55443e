//! # pts-shared
//!
//! Shared foundation of the Package Tracking System: the workspace error
//! type, configuration, durable data models, and the storage and mail
//! transport contracts with their reference implementations.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod storage;
pub mod transport;

pub use config::PtsConfig;
pub use error::{PtsError, PtsResult};
