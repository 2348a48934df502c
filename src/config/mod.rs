//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → UploadConfig (validated)
//!     → BreakerConfig / BatchingConfig handed to each controller
//!
//! Runtime adjustment:
//!     BreakerConfigUpdate
//!     → merged onto current BreakerConfig
//!     → validation.rs
//!     → applied only if valid
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Controllers re-validate their own section on construction

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BatchingConfig, BreakerConfig, BreakerConfigUpdate, LogFormat, ObservabilityConfig,
    PipelineConfig, UploadConfig,
};
pub use validation::ValidationError;
