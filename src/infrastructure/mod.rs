pub mod config;
pub mod error;
pub mod logging;
pub mod periodic;

pub use config::{ConfigFormat, CoreConfig};
pub use error::{BatchFailed, CacheError, ConfigError, TaskError};
pub use logging::{setup_logging, LogFormat, LogOutput, LoggingConfig};
pub use periodic::{spawn_periodic, PeriodicHandle};
