pub mod config;
pub mod error;
pub mod types;

pub use config::GlanceConfig;
pub use error::{GlanceError, Result};
pub use types::*;
