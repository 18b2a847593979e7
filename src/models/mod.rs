pub mod dataset;
pub mod package;
pub mod query;
pub mod schema;
pub mod urlon;

pub use dataset::{DatasetRecord, VersionEntry};
pub use query::DdfQuery;
pub use schema::SchemaModel;
