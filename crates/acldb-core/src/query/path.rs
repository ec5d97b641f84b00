//! Dotted path resolution against the schema.
//!
//! A path such as `author.profile.name` is split into segments and each
//! segment is classified by the field it lands on. Crossing a pointer or a
//! relation moves resolution to the target class; shapes stay within the
//! current class; untyped containers end typing for the rest of the path.

use serde::Serialize;

use acldb_proto::{is_builtin, PLACEHOLDER};

use crate::catalog::{DefaultMatch, FieldType, PrimitiveType, Schema};
use crate::error::ValidationError;

/// How a path segment was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SegmentKind {
    /// Nested shape field, same class.
    Shape,
    /// Single-valued reference; the next segment resolves on the target.
    Pointer,
    /// Multi-valued reference; the next segment resolves on the target.
    Relation,
    /// Scalar, builtin, or a key inside an untyped container.
    Leaf,
}

/// One resolved path segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSegment {
    /// Class whose records store this segment.
    pub class_name: String,
    /// The raw segment name.
    pub field: String,
    /// Dotted path of this segment from the root of its class.
    pub local_path: String,
    pub kind: SegmentKind,
    /// Declared type; `None` for builtins and untyped keys.
    #[serde(skip)]
    pub field_type: Option<FieldType>,
}

impl PathSegment {
    /// Target class of a pointer or relation segment.
    pub fn target(&self) -> Option<&str> {
        self.field_type.as_ref().and_then(FieldType::target)
    }

    /// Check if this segment moves resolution to another class.
    pub fn is_boundary(&self) -> bool {
        matches!(self.kind, SegmentKind::Pointer | SegmentKind::Relation)
    }

    /// Foreign field of an implicit relation.
    pub fn foreign_field(&self) -> Option<&str> {
        self.field_type.as_ref().and_then(FieldType::foreign_field)
    }

    /// Check if this segment is a relation derived from its target.
    pub fn is_implicit(&self) -> bool {
        self.foreign_field().is_some()
    }

    /// Default match of a relation segment.
    pub fn default_match(&self) -> Option<&DefaultMatch> {
        self.field_type.as_ref().and_then(FieldType::default_match)
    }

    /// Top-level field of the owning class.
    pub fn top_field(&self) -> &str {
        self.local_path.split('.').next().unwrap_or(&self.local_path)
    }
}

/// A fully resolved path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPlan {
    /// Class the path was resolved against.
    pub class_name: String,
    /// The original dotted path.
    pub path: String,
    /// Resolved segments, never empty.
    pub segments: Vec<PathSegment>,
}

impl PathPlan {
    /// Index of the first pointer or relation segment.
    pub fn first_boundary(&self) -> Option<usize> {
        self.segments.iter().position(PathSegment::is_boundary)
    }

    /// Check if the path continues past a pointer or relation.
    pub fn crosses_boundary(&self) -> bool {
        self.first_boundary()
            .map(|index| index + 1 < self.segments.len())
            .unwrap_or(false)
    }

    /// The dotted path after segment `index`, if any.
    pub fn remainder(&self, index: usize) -> Option<String> {
        let rest = self.segments.get(index + 1..)?;
        if rest.is_empty() {
            return None;
        }
        Some(
            rest.iter()
                .map(|segment| segment.field.as_str())
                .collect::<Vec<_>>()
                .join("."),
        )
    }

    /// The final segment.
    pub fn last(&self) -> &PathSegment {
        // resolve() never produces an empty plan
        &self.segments[self.segments.len() - 1]
    }

    /// Top-level field on the root class.
    pub fn top_field(&self) -> &str {
        &self.segments[0].field
    }

    /// Check if the final segment is an implicit relation.
    pub fn ends_at_implicit(&self) -> bool {
        self.last().is_implicit()
    }
}

/// Resolves dotted paths against a schema.
pub struct PathResolver<'a> {
    schema: &'a Schema,
}

impl<'a> PathResolver<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// Resolve `path` starting at `class_name`.
    pub fn resolve(&self, class_name: &str, path: &str) -> Result<PathPlan, ValidationError> {
        let root = self.schema.require(class_name)?;
        let raw = split_segments(path)?;
        if raw.iter().any(|segment| segment.starts_with(PLACEHOLDER)) {
            return Err(ValidationError::PlaceholderOutsideQuantifier(path.to_string()));
        }

        let mut owner = root;
        let mut scope = &root.fields;
        let mut local: Vec<&str> = Vec::new();
        let mut untyped = false;
        let mut segments = Vec::with_capacity(raw.len());

        for (index, name) in raw.iter().copied().enumerate() {
            local.push(name);
            let local_path = local.join(".");
            let leaf = |field_type: Option<FieldType>| PathSegment {
                class_name: owner.name.clone(),
                field: name.to_string(),
                local_path: local_path.clone(),
                kind: SegmentKind::Leaf,
                field_type,
            };

            if untyped {
                segments.push(leaf(None));
                continue;
            }
            if local.len() == 1 && is_builtin(name) {
                segments.push(leaf(None));
                untyped = true;
                continue;
            }

            let field = scope.get(name).ok_or_else(|| ValidationError::UnknownField {
                class: owner.name.clone(),
                path: path.to_string(),
            })?;
            match field {
                FieldType::Primitive(primitive) => {
                    let has_more = index + 1 < raw.len();
                    if has_more && !primitive.is_open() && *primitive != PrimitiveType::File {
                        return Err(ValidationError::UnknownField {
                            class: owner.name.clone(),
                            path: path.to_string(),
                        });
                    }
                    segments.push(leaf(Some(field.clone())));
                    untyped = true;
                }
                FieldType::Shape { fields } => {
                    segments.push(PathSegment {
                        kind: SegmentKind::Shape,
                        ..leaf(Some(field.clone()))
                    });
                    scope = fields;
                }
                FieldType::Pointer { target } | FieldType::Relation { target, .. } => {
                    let kind = if matches!(field, FieldType::Pointer { .. }) {
                        SegmentKind::Pointer
                    } else {
                        SegmentKind::Relation
                    };
                    segments.push(PathSegment {
                        kind,
                        ..leaf(Some(field.clone()))
                    });
                    owner = self.schema.require(target)?;
                    scope = &owner.fields;
                    local.clear();
                }
            }
        }

        Ok(PathPlan {
            class_name: class_name.to_string(),
            path: path.to_string(),
            segments,
        })
    }
}

/// Split a dotted path, rejecting empty segments.
pub fn split_segments(path: &str) -> Result<Vec<&str>, ValidationError> {
    let segments: Vec<&str> = path.split('.').collect();
    if path.is_empty() || segments.iter().any(|segment| segment.is_empty()) {
        return Err(ValidationError::MalformedPath(path.to_string()));
    }
    Ok(segments)
}

/// Validate a path relative to the element under test inside a quantifier.
///
/// Accepts `$`, `$.key.sub`, or a bare relative key.
pub fn validate_element_path(path: &str) -> Result<(), ValidationError> {
    let segments = split_segments(path)?;
    let nested_placeholder = segments
        .iter()
        .skip(1)
        .any(|segment| segment.starts_with(PLACEHOLDER));
    if nested_placeholder || (segments[0].starts_with(PLACEHOLDER) && segments[0] != PLACEHOLDER)
    {
        return Err(ValidationError::MalformedPath(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ClassDef;

    fn schema() -> Schema {
        Schema::new(vec![
            ClassDef::new("Post")
                .with_field("title", PrimitiveType::String)
                .with_field("meta", PrimitiveType::Object)
                .with_field(
                    "stats",
                    FieldType::shape([("views", FieldType::from(PrimitiveType::Number))]),
                )
                .with_field("author", FieldType::pointer("_User"))
                .with_field("comments", FieldType::implicit_relation("Comment", "post")),
            ClassDef::new("Comment")
                .with_field("text", PrimitiveType::String)
                .with_field("post", FieldType::pointer("Post")),
        ])
        .unwrap()
    }

    #[test]
    fn test_resolve_crossing_pointer() {
        let schema = schema();
        let plan = PathResolver::new(&schema)
            .resolve("Comment", "post.author.username")
            .unwrap();
        let kinds: Vec<_> = plan.segments.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![SegmentKind::Pointer, SegmentKind::Pointer, SegmentKind::Leaf]
        );
        assert_eq!(plan.first_boundary(), Some(0));
        assert_eq!(plan.remainder(0).as_deref(), Some("author.username"));
        assert_eq!(plan.last().class_name, "_User");
        assert!(plan.crosses_boundary());
    }

    #[test]
    fn test_resolve_shape_and_untyped() {
        let schema = schema();
        let resolver = PathResolver::new(&schema);
        let plan = resolver.resolve("Post", "stats.views").unwrap();
        assert_eq!(plan.segments[0].kind, SegmentKind::Shape);
        assert_eq!(plan.last().local_path, "stats.views");

        let plan = resolver.resolve("Post", "meta.anything.goes").unwrap();
        assert_eq!(plan.segments.len(), 3);
        assert!(!plan.crosses_boundary());
    }

    #[test]
    fn test_resolve_errors() {
        let schema = schema();
        let resolver = PathResolver::new(&schema);
        assert!(matches!(
            resolver.resolve("Post", "nope"),
            Err(ValidationError::UnknownField { .. })
        ));
        assert!(matches!(
            resolver.resolve("Post", "title.length"),
            Err(ValidationError::UnknownField { .. })
        ));
        assert!(matches!(
            resolver.resolve("Post", "author..name"),
            Err(ValidationError::MalformedPath(_))
        ));
        assert!(matches!(
            resolver.resolve("Post", "$.title"),
            Err(ValidationError::PlaceholderOutsideQuantifier(_))
        ));
        assert!(matches!(
            resolver.resolve("Ghost", "title"),
            Err(ValidationError::UnknownClass(_))
        ));
    }

    #[test]
    fn test_builtins_resolve() {
        let schema = schema();
        let plan = PathResolver::new(&schema).resolve("Post", "_rperm").unwrap();
        assert_eq!(plan.last().kind, SegmentKind::Leaf);
        assert!(plan.last().field_type.is_none());
    }

    #[test]
    fn test_element_paths() {
        assert!(validate_element_path("$").is_ok());
        assert!(validate_element_path("$.text").is_ok());
        assert!(validate_element_path("text").is_ok());
        assert!(validate_element_path("$.$").is_err());
        assert!(validate_element_path("$x").is_err());
    }
}
