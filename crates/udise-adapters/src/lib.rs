//! UDISE+ source adapters: API client, column mapping tables, enrollment
//! key naming and identifier file parsing.

pub mod client;
pub mod mapping;
pub mod naming;
pub mod source_file;

pub use client::{school_id_of, ApiEnvelope, SchoolSource, SourceError, UdiseClient};
pub use mapping::{transform, ColumnMapping, MappingCategory};
pub use source_file::{parse_identifiers, SourceFile, SourceFileError};

pub const CRATE_NAME: &str = "udise-adapters";
