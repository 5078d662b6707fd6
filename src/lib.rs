pub mod cli;
pub mod config;
pub mod connection_url;
pub mod connectors;
pub mod database;
pub mod date_parser;
pub mod error;
pub mod geometry;
pub mod load;
pub mod query;
pub mod schema;
pub mod typemap;
pub mod writer;

pub use database::{Database, Table};
pub use error::{DatumError, Result};
pub use query::ReadQuery;
pub use schema::{CanonicalType, FieldDescriptor, Row, Value};
pub use writer::{WriteOptions, WriteSummary};
