mod parser;
mod registry;
mod types;

pub use parser::{parse_schema, parse_schema_str};
pub use registry::{SchemaId, SchemaNode, SchemaRegistry};
pub use types::{CollectionDefinition, ModelDeclaration, SchemaDefinition};
