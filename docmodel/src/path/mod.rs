// Hierarchical store paths: alternating collection and document segments

use crate::error::{DocModelError, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// A path into the document hierarchy, e.g. `profiles/abc/groups/g1`.
///
/// Odd-length paths address collections, even-length paths address documents.
/// The empty path is the database root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath {
    segments: Vec<String>,
}

impl DocPath {
    /// The database root (no segments).
    pub fn root() -> Self {
        DocPath::default()
    }

    /// Parse a slash-separated path. Leading and trailing slashes are ignored;
    /// empty segments in the middle are rejected.
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(DocPath::root());
        }

        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            validate_id(segment).map_err(|_| {
                DocModelError::InvalidPath(format!("'{path}' contains an invalid segment '{segment}'"))
            })?;
            segments.push(segment.to_string());
        }
        Ok(DocPath { segments })
    }

    /// Parse a path and require it to address a document.
    pub fn parse_document(path: &str) -> Result<Self> {
        let parsed = DocPath::parse(path)?;
        if !parsed.is_document() {
            return Err(DocModelError::InvalidPath(format!(
                "'{path}' does not address a document"
            )));
        }
        Ok(parsed)
    }

    /// Parse a path and require it to address a collection.
    pub fn parse_collection(path: &str) -> Result<Self> {
        let parsed = DocPath::parse(path)?;
        if !parsed.is_collection() {
            return Err(DocModelError::InvalidPath(format!(
                "'{path}' does not address a collection"
            )));
        }
        Ok(parsed)
    }

    /// Append one segment. The caller is responsible for the segment being valid.
    pub fn child(&self, segment: &str) -> DocPath {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        DocPath { segments }
    }

    pub fn parent(&self) -> Option<DocPath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(DocPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_document(&self) -> bool {
        !self.segments.is_empty() && self.segments.len() % 2 == 0
    }

    pub fn is_collection(&self) -> bool {
        self.segments.len() % 2 == 1
    }

    /// The last segment, i.e. the document ID or collection name.
    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Document ID for document paths.
    pub fn id(&self) -> Option<&str> {
        if self.is_document() {
            self.last()
        } else {
            None
        }
    }

    /// Name of the collection this path lives in: the path's own name for
    /// collection paths, the containing collection's name for document paths.
    pub fn collection_id(&self) -> Option<&str> {
        if self.is_collection() {
            self.last()
        } else if self.is_document() {
            Some(self.segments[self.segments.len() - 2].as_str())
        } else {
            None
        }
    }

    /// True when `self` is an immediate child of `parent`.
    pub fn is_child_of(&self, parent: &DocPath) -> bool {
        self.segments.len() == parent.segments.len() + 1
            && self.segments.starts_with(&parent.segments)
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

fn reserved_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^__.*__$").expect("static regex is valid"))
}

/// Check that a string can be used as a single path segment
/// (document ID or collection name).
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(DocModelError::InvalidPath("identifier must not be empty".into()));
    }
    if id.contains('/') {
        return Err(DocModelError::InvalidPath(format!(
            "identifier '{id}' must not contain '/'"
        )));
    }
    if id == "." || id == ".." {
        return Err(DocModelError::InvalidPath(format!(
            "identifier '{id}' is not allowed"
        )));
    }
    if reserved_id_pattern().is_match(id) {
        return Err(DocModelError::InvalidPath(format!(
            "identifier '{id}' uses the reserved __name__ form"
        )));
    }
    Ok(())
}
