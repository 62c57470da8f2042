//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → NetConfig (validated, immutable)
//!     → sections cloned into stubs and listeners at construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a stub keeps the section it was built with
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::NetConfig;
pub use schema::ObservabilityConfig;
pub use schema::PipeConfig;
pub use schema::RandomPortConfig;
pub use schema::RateLimitConfig;
pub use schema::TcpConfig;
pub use schema::UdpConfig;
