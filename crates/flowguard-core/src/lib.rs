pub mod action;
pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod policy;
pub mod prediction;
pub mod queue;

pub use error::{FlowguardError, Result};
