//! Telemetry for the broker.
//!
//! Structured logging via `tracing`, plus adoption of the default
//! trace-category set a broker hands out in its announce responses.

mod categories;
mod logging;

pub use categories::{
    default_categories_filter, filter_from_categories, set_default_categories_json, CategoryError,
};
pub use logging::{init_logging, LogConfig, LogError, LogFormat};
