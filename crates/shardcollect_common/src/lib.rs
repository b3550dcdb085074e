//! Shared building blocks of the shard collect layer: the value model,
//! identifiers, the error taxonomy and configuration.

pub mod config;
pub mod datum;
pub mod error;
pub mod types;

pub use config::CollectConfig;
pub use datum::{DataType, Datum, Row};
pub use error::{CollectError, CollectResult, ErrorKind, SourceError};
pub use types::{IndexName, RowId, ShardId};
