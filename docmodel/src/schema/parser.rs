use super::types::{CollectionDefinition, SchemaDefinition};
use crate::error::{DocModelError, Result};
use std::path::Path;

/// Read and parse a schema file. A file holding only comments or
/// whitespace yields an empty schema.
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let content = std::fs::read_to_string(path)?;
    let definition = parse_schema_str(&content)?;
    log::debug!(
        "Loaded {} top-level collections from {}",
        definition.collections.len(),
        path.display()
    );
    Ok(definition)
}

pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let is_blank = content
        .lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with('#'));
    if is_blank {
        return Ok(SchemaDefinition::default());
    }

    let definition: SchemaDefinition = serde_yaml::from_str(content)?;
    for (name, collection) in &definition.collections {
        check_defaults(name, collection)?;
    }
    Ok(definition)
}

/// Every default must name a declared property.
fn check_defaults(name: &str, collection: &CollectionDefinition) -> Result<()> {
    if let Some(stray) = collection
        .defaults
        .keys()
        .find(|key| !collection.properties.contains(*key))
    {
        return Err(DocModelError::Configuration(format!(
            "collection '{name}' has a default for undeclared property '{stray}'"
        )));
    }
    for (child, nested) in &collection.collections {
        check_defaults(&format!("{name}/{child}"), nested)?;
    }
    Ok(())
}
