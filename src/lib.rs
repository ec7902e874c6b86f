//! Local SQLite bootstrap helper.
//!
//! # Intention
//!
//! - Guarantee a writable copy of an application database exists in the
//!   platform data directory, seeded from a read-only template.
//! - Hand out handles to that file and offer a schema-preserving reset.
//!
//! # Architectural Boundaries
//!
//! - Only file bootstrap and handle plumbing belongs here.
//! - No schema design, query building, pooling or migrations.

pub mod config;
pub mod error;
pub mod helper;
pub mod shared;
pub mod sqlite;

pub use config::{EmbeddedTemplate, HelperConfig, TemplateSource};
pub use error::{BootstrapError, BootstrapResult};
pub use helper::{BootstrapOutcome, DataAccessHelper};
pub use shared::SharedDataAccessHelper;
pub use sqlite::{
    ClearSummary, DatabaseEngine, DatabaseHandle, Row, SqliteEngine, SqliteHandle, Value,
};
