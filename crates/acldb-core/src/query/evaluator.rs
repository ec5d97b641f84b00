//! In-memory evaluation of compiled filters.
//!
//! Backends without native query support evaluate [`CompiledFilter`] trees
//! with [`matches`]. The same evaluator checks quantifier sub-filters against
//! array elements and residual predicates against attached values.

use std::borrow::Cow;

use acldb_proto::{CompareOp, ObjectRecord, Value, PLACEHOLDER};

use super::expr;
use super::order;
use super::plan::{CompiledFilter, SetOp};

/// Anything a filter can be evaluated against.
pub trait Document {
    /// Value at a dotted path, if present.
    fn value_at(&self, path: &str) -> Option<Cow<'_, Value>>;

    /// Insertion sequence, used as the final sort tie-break.
    fn seq(&self) -> u64 {
        0
    }
}

impl Document for ObjectRecord {
    fn value_at(&self, path: &str) -> Option<Cow<'_, Value>> {
        ObjectRecord::value_at(self, path)
    }

    fn seq(&self) -> u64 {
        self.seq
    }
}

impl<D: Document + ?Sized> Document for &D {
    fn value_at(&self, path: &str) -> Option<Cow<'_, Value>> {
        (**self).value_at(path)
    }

    fn seq(&self) -> u64 {
        (**self).seq()
    }
}

/// A single array element under test.
///
/// `$` addresses the element itself; `$.key` and bare `key` address its
/// children.
pub struct ElementDoc<'a> {
    element: &'a Value,
    position: u64,
}

impl<'a> ElementDoc<'a> {
    pub fn new(element: &'a Value, position: usize) -> Self {
        Self {
            element,
            position: position as u64,
        }
    }
}

impl Document for ElementDoc<'_> {
    fn value_at(&self, path: &str) -> Option<Cow<'_, Value>> {
        if path == PLACEHOLDER {
            return Some(Cow::Borrowed(self.element));
        }
        let relative = path
            .strip_prefix(PLACEHOLDER)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(path);
        self.element.get_path(relative)
    }

    fn seq(&self) -> u64 {
        self.position
    }
}

/// A document with no fields. Used to fold predicates on hidden fields.
pub struct EmptyDocument;

impl Document for EmptyDocument {
    fn value_at(&self, _path: &str) -> Option<Cow<'_, Value>> {
        None
    }
}

/// Evaluate a compiled filter against a document.
pub fn matches(filter: &CompiledFilter, doc: &dyn Document) -> bool {
    match filter {
        CompiledFilter::True => true,
        CompiledFilter::False => false,
        CompiledFilter::And(filters) => filters.iter().all(|f| matches(f, doc)),
        CompiledFilter::Or(filters) => filters.iter().any(|f| matches(f, doc)),
        CompiledFilter::Not(inner) => !matches(inner, doc),
        CompiledFilter::Compare { path, op, value } => {
            compare(doc.value_at(path).as_deref(), *op, value)
        }
        CompiledFilter::Exists { path, exists } => {
            let present = doc.value_at(path).map(|v| !v.is_null()).unwrap_or(false);
            present == *exists
        }
        CompiledFilter::StartsWith { path, prefix } => {
            any_string(doc.value_at(path).as_deref(), |s| s.starts_with(prefix.as_str()))
        }
        CompiledFilter::EndsWith { path, suffix } => {
            any_string(doc.value_at(path).as_deref(), |s| s.ends_with(suffix.as_str()))
        }
        CompiledFilter::Pattern { path, regex } => {
            any_string(doc.value_at(path).as_deref(), |s| regex.is_match(s))
        }
        CompiledFilter::Size { path, size } => match doc.value_at(path).as_deref() {
            Some(Value::Array(items)) => items.len() == *size,
            Some(Value::String(s)) => s.chars().count() == *size,
            _ => false,
        },
        CompiledFilter::Empty { path } => is_empty(doc.value_at(path).as_deref()),
        CompiledFilter::NotEmpty { path } => !is_empty(doc.value_at(path).as_deref()),
        CompiledFilter::In {
            path,
            values,
            negate,
        } => {
            let hit = contained_in(doc.value_at(path).as_deref(), values);
            hit != *negate
        }
        CompiledFilter::Set { path, op, values } => {
            let actual = doc.value_at(path);
            let elements = elements_of(actual.as_deref());
            let member = |v: &Value| values.iter().any(|candidate| candidate.loose_eq(v));
            match op {
                SetOp::Subset => elements.iter().all(|v| member(*v)),
                SetOp::Superset => values
                    .iter()
                    .all(|v| elements.iter().any(|e| e.loose_eq(v))),
                SetOp::Disjoint => !elements.iter().any(|v| member(*v)),
                SetOp::Intersect => elements.iter().any(|v| member(*v)),
            }
        }
        CompiledFilter::RefIn { path, ids } => {
            let actual = doc.value_at(path);
            elements_of(actual.as_deref())
                .iter()
                .any(|v| reference_id(v).map(|id| ids.contains(id)).unwrap_or(false))
        }
        CompiledFilter::IdIn(ids) => doc
            .value_at("id")
            .and_then(|v| v.as_str().map(|id| ids.contains(id)))
            .unwrap_or(false),
        CompiledFilter::Quantified {
            path,
            every,
            filter,
        } => {
            let actual = doc.value_at(path);
            let elements = elements_of(actual.as_deref());
            let check = |(index, element): (usize, &&Value)| {
                matches(filter, &ElementDoc::new(element, index))
            };
            if *every {
                elements.iter().enumerate().all(check)
            } else {
                elements.iter().enumerate().any(check)
            }
        }
        CompiledFilter::Expr(e) => expr::evaluate(e, doc).is_truthy(),
        CompiledFilter::Readable(subjects) => acl_admits(doc.value_at("_rperm"), subjects),
        CompiledFilter::Writable(subjects) => acl_admits(doc.value_at("_wperm"), subjects),
        CompiledFilter::After(cursor) => {
            order::compare_to_cursor(doc, cursor) == std::cmp::Ordering::Greater
        }
    }
}

fn compare(actual: Option<&Value>, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Eq => equals(actual, expected),
        CompareOp::Ne => !equals(actual, expected),
        _ => match actual {
            Some(Value::Array(items)) if !matches!(expected, Value::Array(_)) => items
                .iter()
                .any(|item| ordered(item, op, expected)),
            Some(value) => ordered(value, op, expected),
            None => false,
        },
    }
}

fn ordered(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    actual
        .compare(expected)
        .map(|ordering| op.accepts(ordering))
        .unwrap_or(false)
}

/// Equality where null matches a missing field and arrays match any element.
fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None | Some(Value::Null) => expected.is_null(),
        Some(value) if value.loose_eq(expected) => true,
        Some(Value::Array(items)) => items.iter().any(|item| item.loose_eq(expected)),
        Some(_) => false,
    }
}

fn contained_in(actual: Option<&Value>, values: &[Value]) -> bool {
    match actual {
        None | Some(Value::Null) => values.iter().any(Value::is_null),
        Some(value) => values.iter().any(|candidate| equals(Some(value), candidate)),
    }
}

fn any_string(actual: Option<&Value>, check: impl Fn(&str) -> bool) -> bool {
    match actual {
        Some(Value::String(s)) => check(s),
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).any(check),
        _ => false,
    }
}

fn is_empty(actual: Option<&Value>) -> bool {
    match actual {
        None | Some(Value::Null) => true,
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// Treat a value as a sequence: arrays yield their items, scalars themselves.
fn elements_of(actual: Option<&Value>) -> Vec<&Value> {
    match actual {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(value) => vec![value],
    }
}

fn reference_id(value: &Value) -> Option<&str> {
    match value {
        Value::Pointer(r) => Some(&r.id),
        Value::String(id) => Some(id),
        _ => None,
    }
}

fn acl_admits(acl: Option<Cow<'_, Value>>, subjects: &[String]) -> bool {
    match acl.as_deref() {
        None | Some(Value::Null) => true,
        Some(Value::Array(entries)) => entries
            .iter()
            .filter_map(Value::as_str)
            .any(|entry| subjects.iter().any(|subject| subject == entry)),
        Some(_) => false,
    }
}
