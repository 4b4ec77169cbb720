// Schema-driven shaping of document data

use crate::document::{DocumentRef, Fields, RawDocument, SanitizedDocument};
use crate::error::{DocModelError, Result};
use serde_json::Value;
use std::collections::BTreeSet;

/// Filters document data down to a declared property set.
///
/// Never rejects data: unknown properties are dropped on the way in and on
/// the way out. The only failure is a schema with no properties, caught at
/// construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitizer {
    properties: BTreeSet<String>,
    defaults: Fields,
}

impl Sanitizer {
    pub fn new<I>(properties: I, defaults: Fields) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let properties: BTreeSet<String> = properties.into_iter().collect();
        if properties.is_empty() {
            return Err(DocModelError::Configuration(
                "at least one property is required".into(),
            ));
        }
        if let Some(stray) = defaults.keys().find(|k| !properties.contains(*k)) {
            return Err(DocModelError::Configuration(format!(
                "default for '{stray}' is not a declared property"
            )));
        }
        Ok(Sanitizer {
            properties,
            defaults,
        })
    }

    pub fn properties(&self) -> &BTreeSet<String> {
        &self.properties
    }

    pub fn defaults(&self) -> &Fields {
        &self.defaults
    }

    /// Shape caller data for a write. Keys outside the declared properties are
    /// dropped; with `merge_defaults`, declared defaults fill in absent keys.
    /// A non-object `data` is treated as empty.
    pub fn prepare_for_write(&self, data: &Value, merge_defaults: bool) -> Fields {
        let mut prepared = match data.as_object() {
            Some(map) => self.filter(map),
            None => {
                log::trace!("Non-object write payload treated as empty");
                Fields::new()
            }
        };

        if merge_defaults {
            for (key, default) in &self.defaults {
                if !prepared.contains_key(key) {
                    prepared.insert(key.clone(), default.clone());
                }
            }
        }

        prepared
    }

    /// Restrict stored fields to the declared properties.
    pub fn filter(&self, fields: &Fields) -> Fields {
        fields
            .iter()
            .filter(|(key, _)| {
                let known = self.properties.contains(*key);
                if !known {
                    log::trace!("Dropping undeclared property '{key}'");
                }
                known
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Sanitize a single document read. A document that does not exist
    /// yields `None`. The returned document has no children attached.
    pub fn sanitize_document(&self, raw: &RawDocument) -> Option<SanitizedDocument> {
        let fields = raw.fields.as_ref()?;
        Some(SanitizedDocument {
            id: raw.reference.id().to_string(),
            reference: raw.reference.clone(),
            fields: self.filter(fields),
            create_time: raw.create_time,
            update_time: raw.update_time,
            children: Default::default(),
        })
    }

    /// Sanitize a query result, keeping the store's order. Entries that do not
    /// exist are skipped.
    pub fn sanitize_documents(&self, raw: &[RawDocument]) -> Vec<SanitizedDocument> {
        raw.iter()
            .filter_map(|doc| self.sanitize_document(doc))
            .collect()
    }

    /// Build the document returned from a write, before it is read back.
    pub fn written_document(&self, reference: DocumentRef, fields: Fields) -> SanitizedDocument {
        SanitizedDocument {
            id: reference.id().to_string(),
            reference,
            fields,
            create_time: None,
            update_time: None,
            children: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::DocPath;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn profile_sanitizer() -> Sanitizer {
        let mut defaults = Fields::new();
        defaults.insert("email".into(), json!("n/a"));
        Sanitizer::new(
            vec!["displayName".to_string(), "email".to_string()],
            defaults,
        )
        .unwrap()
    }

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn raw(path: &str, data: Option<Value>) -> RawDocument {
        RawDocument {
            reference: DocumentRef::new(DocPath::parse_document(path).unwrap()),
            fields: data.map(fields),
            create_time: None,
            update_time: None,
        }
    }

    #[test]
    fn test_prepare_drops_unknown_keys() {
        let sanitizer = profile_sanitizer();
        let prepared =
            sanitizer.prepare_for_write(&json!({"displayName": "john", "admin": true}), false);
        assert_eq!(prepared, fields(json!({"displayName": "john"})));
    }

    #[test]
    fn test_prepare_without_defaults_leaves_absent() {
        let sanitizer = profile_sanitizer();
        let prepared = sanitizer.prepare_for_write(&json!({"displayName": "john"}), false);
        assert!(!prepared.contains_key("email"));
    }

    #[test]
    fn test_prepare_applies_defaults() {
        let sanitizer = profile_sanitizer();
        let prepared = sanitizer.prepare_for_write(&json!({"displayName": "john"}), true);
        assert_eq!(
            prepared,
            fields(json!({"displayName": "john", "email": "n/a"}))
        );
    }

    #[test]
    fn test_defaults_dont_overwrite() {
        let sanitizer = profile_sanitizer();
        let prepared = sanitizer.prepare_for_write(&json!({"email": "j@x.io"}), true);
        assert_eq!(prepared, fields(json!({"email": "j@x.io"})));
    }

    #[test]
    fn test_explicit_null_is_kept() {
        let sanitizer = profile_sanitizer();
        let prepared = sanitizer.prepare_for_write(&json!({"email": null}), true);
        assert_eq!(prepared["email"], Value::Null);
    }

    #[test]
    fn test_prepare_non_object_is_empty() {
        let sanitizer = profile_sanitizer();
        assert!(sanitizer.prepare_for_write(&json!("oops"), false).is_empty());
        assert_eq!(sanitizer.prepare_for_write(&json!(42), true).len(), 1);
    }

    #[test]
    fn test_empty_properties_rejected() {
        let err = Sanitizer::new(Vec::<String>::new(), Fields::new()).unwrap_err();
        assert!(matches!(err, DocModelError::Configuration(_)));
    }

    #[test]
    fn test_sanitize_missing_document() {
        let sanitizer = profile_sanitizer();
        assert!(sanitizer.sanitize_document(&raw("profiles/a", None)).is_none());
    }

    #[test]
    fn test_sanitize_drops_legacy_fields() {
        let sanitizer = profile_sanitizer();
        let doc = sanitizer
            .sanitize_document(&raw(
                "profiles/a",
                Some(json!({"displayName": "ann", "legacyScore": 12})),
            ))
            .unwrap();
        assert_eq!(doc.id, "a");
        assert_eq!(doc.fields, fields(json!({"displayName": "ann"})));
        assert!(doc.children.is_empty());
    }

    #[test]
    fn test_sanitize_set_preserves_order() {
        let sanitizer = profile_sanitizer();
        let docs = sanitizer.sanitize_documents(&[
            raw("profiles/z", Some(json!({"displayName": "zed"}))),
            raw("profiles/a", Some(json!({"displayName": "ann"}))),
        ]);
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a"]);
        assert!(sanitizer.sanitize_documents(&[]).is_empty());
    }
}
