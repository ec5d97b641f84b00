//! The immutable schema: every class, its fields, and its permission tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use acldb_proto::is_builtin;

use super::class::ClassDef;
use super::types::{FieldType, PrimitiveType};
use crate::error::{Error, Result, ValidationError};
use crate::query::{PathResolver, SegmentKind};

/// Built-in class holding roles.
pub const ROLE_CLASS: &str = "_Role";

/// Built-in class holding users.
pub const USER_CLASS: &str = "_User";

/// Role name field.
pub const ROLE_NAME_FIELD: &str = "name";

/// Role-to-user membership relation.
pub const ROLE_USERS_FIELD: &str = "users";

/// Role-to-role membership relation.
pub const ROLE_ROLES_FIELD: &str = "roles";

/// A validated, immutable schema.
///
/// Loaded once at startup and shared read-only by every request.
#[derive(Debug, Clone, Serialize)]
pub struct Schema {
    classes: BTreeMap<String, ClassDef>,
    #[serde(skip)]
    field_count: usize,
}

#[derive(Deserialize)]
struct SchemaDef {
    #[serde(default)]
    classes: BTreeMap<String, ClassDef>,
}

impl Schema {
    /// Build and validate a schema from class definitions.
    pub fn new(classes: impl IntoIterator<Item = ClassDef>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for class in classes {
            let name = class.name.clone();
            if map.insert(name.clone(), class).is_some() {
                return Err(invalid(format!("class {name} is defined twice")));
            }
        }
        Self::from_map(map)
    }

    /// Parse and validate a schema from JSON: `{"classes": {"Post": {...}}}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let def: SchemaDef =
            serde_json::from_str(json).map_err(|e| invalid(format!("malformed schema: {e}")))?;
        let classes = def
            .classes
            .into_iter()
            .map(|(name, mut class)| {
                class.name = name.clone();
                (name, class)
            })
            .collect();
        Self::from_map(classes)
    }

    fn from_map(mut classes: BTreeMap<String, ClassDef>) -> Result<Self> {
        inject_builtins(&mut classes);
        let field_count = classes.values().map(ClassDef::field_count).sum();
        let schema = Self {
            classes,
            field_count,
        };
        schema.validate()?;
        debug!(
            classes = schema.classes.len(),
            fields = schema.field_count,
            "schema loaded"
        );
        Ok(schema)
    }

    /// Look up a class.
    pub fn class(&self, name: &str) -> Option<&ClassDef> {
        self.classes.get(name)
    }

    /// Look up a class, failing with `UnknownClass`.
    pub fn require(&self, name: &str) -> std::result::Result<&ClassDef, ValidationError> {
        self.classes
            .get(name)
            .ok_or_else(|| ValidationError::UnknownClass(name.to_string()))
    }

    /// Iterate over all classes.
    pub fn classes(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.values()
    }

    /// Total declared fields across all classes.
    ///
    /// Bounds the length of any relation chain the engine will follow.
    pub fn field_count(&self) -> usize {
        self.field_count
    }

    fn validate(&self) -> Result<()> {
        for class in self.classes.values() {
            validate_name(&class.name, "class")?;
            for (name, field) in &class.fields {
                self.validate_field(class, name, field)?;
            }
            for name in class.field_level_permissions.keys() {
                if !class.fields.contains_key(name) {
                    return Err(invalid(format!(
                        "field-level permission on undefined field {}.{name}",
                        class.name
                    )));
                }
            }
            let resolver = PathResolver::new(self);
            for index in &class.indexes {
                for key in &index.keys {
                    resolver.resolve(&class.name, &key.path).map_err(|e| {
                        invalid(format!("index {} on {}: {e}", index.name, class.name))
                    })?;
                }
            }
        }
        Ok(())
    }

    fn validate_field(&self, class: &ClassDef, path: &str, field: &FieldType) -> Result<()> {
        let name = path.rsplit('.').next().unwrap_or(path);
        validate_name(name, "field")?;
        match field {
            FieldType::Primitive(_) => Ok(()),
            FieldType::Shape { fields } => {
                for (child, field) in fields {
                    self.validate_field(class, &format!("{path}.{child}"), field)?;
                }
                Ok(())
            }
            FieldType::Pointer { target } => self.require_target(class, path, target),
            FieldType::Relation {
                target,
                foreign_field,
                default_match,
            } => {
                self.require_target(class, path, target)?;
                let resolver = PathResolver::new(self);
                if let Some(foreign_field) = foreign_field {
                    let plan = resolver.resolve(target, foreign_field).map_err(|e| {
                        invalid(format!("foreign field of {}.{path}: {e}", class.name))
                    })?;
                    let last = plan.last();
                    let lands_on_owner = matches!(last.kind, SegmentKind::Pointer | SegmentKind::Relation)
                        && last.target() == Some(class.name.as_str());
                    if !lands_on_owner {
                        return Err(invalid(format!(
                            "foreign field {target}.{foreign_field} of {}.{path} must end at a reference to {}",
                            class.name, class.name
                        )));
                    }
                }
                if let Some(default_match) = default_match {
                    for sort in &default_match.sort {
                        resolver.resolve(target, &sort.path).map_err(|e| {
                            invalid(format!("default match of {}.{path}: {e}", class.name))
                        })?;
                    }
                }
                Ok(())
            }
        }
    }

    fn require_target(&self, class: &ClassDef, path: &str, target: &str) -> Result<()> {
        if self.classes.contains_key(target) {
            Ok(())
        } else {
            Err(invalid(format!(
                "{}.{path} references unknown class {target}",
                class.name
            )))
        }
    }
}

fn invalid(message: String) -> Error {
    ValidationError::InvalidSchema(message).into()
}

fn validate_name(name: &str, kind: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.contains('.')
        && !name.starts_with('$')
        && name != "className"
        && (kind == "class" || !is_builtin(name));
    if valid {
        Ok(())
    } else {
        Err(invalid(format!("invalid {kind} name `{name}`")))
    }
}

fn inject_builtins(classes: &mut BTreeMap<String, ClassDef>) {
    let user = classes
        .entry(USER_CLASS.to_string())
        .or_insert_with(|| ClassDef::new(USER_CLASS));
    user.fields
        .entry("username".into())
        .or_insert(PrimitiveType::String.into());
    user.fields
        .entry("email".into())
        .or_insert(PrimitiveType::String.into());

    let role = classes
        .entry(ROLE_CLASS.to_string())
        .or_insert_with(|| ClassDef::new(ROLE_CLASS));
    role.fields
        .entry(ROLE_NAME_FIELD.into())
        .or_insert(PrimitiveType::String.into());
    role.fields
        .entry(ROLE_USERS_FIELD.into())
        .or_insert(FieldType::relation(USER_CLASS));
    role.fields
        .entry(ROLE_ROLES_FIELD.into())
        .or_insert(FieldType::relation(ROLE_CLASS));
}
