// Core infrastructure shared by every engine component

pub mod config;
pub mod errors;

pub use config::RunConfig;
pub use errors::{FlowError, Result};
