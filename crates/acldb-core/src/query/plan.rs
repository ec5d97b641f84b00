//! Compiled query IR.
//!
//! Filters arrive as [`FilterNode`](acldb_proto::FilterNode) trees written in
//! terms of the schema. Compilation lowers them to [`CompiledFilter`], which
//! only refers to paths stored on the records of a single class. Relation
//! predicates become id sets; row ACLs become `Readable`/`Writable` nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::{Serialize, Serializer};

use acldb_proto::{AccumulatorSpec, CompareOp, Expr, SortSpec, Value};

use crate::error::ValidationError;
use crate::query::path::PathSegment;

/// A compiled regular expression that serializes as its source.
#[derive(Clone)]
pub struct PatternRegex(Arc<Regex>);

impl PatternRegex {
    pub fn new(pattern: &str, case_insensitive: bool) -> Result<Self, ValidationError> {
        RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map(|regex| Self(Arc::new(regex)))
            .map_err(|e| ValidationError::InvalidArgument(format!("invalid pattern: {e}")))
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for PatternRegex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.0.as_str())
    }
}

impl PartialEq for PatternRegex {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for PatternRegex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Set relations between an array field and a literal set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SetOp {
    Subset,
    Superset,
    Disjoint,
    Intersect,
}

/// Keyset position used by batch iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cursor {
    pub sort: Vec<SortSpec>,
    /// Sort key of the last delivered record; `None` where the key was missing.
    pub values: Vec<Option<Value>>,
    /// Sequence of the last delivered record.
    pub seq: u64,
}

/// A filter over records of one class.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CompiledFilter {
    True,
    False,
    And(Vec<CompiledFilter>),
    Or(Vec<CompiledFilter>),
    Not(Box<CompiledFilter>),
    Compare {
        path: String,
        op: CompareOp,
        value: Value,
    },
    Exists {
        path: String,
        exists: bool,
    },
    StartsWith {
        path: String,
        prefix: String,
    },
    EndsWith {
        path: String,
        suffix: String,
    },
    Pattern {
        path: String,
        regex: PatternRegex,
    },
    Size {
        path: String,
        size: usize,
    },
    Empty {
        path: String,
    },
    NotEmpty {
        path: String,
    },
    In {
        path: String,
        values: Vec<Value>,
        negate: bool,
    },
    Set {
        path: String,
        op: SetOp,
        values: Vec<Value>,
    },
    /// Pointer (or pointer array) at `path` references one of `ids`.
    RefIn {
        path: String,
        ids: BTreeSet<String>,
    },
    /// Record id is one of the set.
    IdIn(BTreeSet<String>),
    /// Some or every element of the array at `path` satisfies `filter`.
    Quantified {
        path: String,
        every: bool,
        filter: Box<CompiledFilter>,
    },
    Expr(Expr),
    /// Row read ACL admits one of the subjects.
    Readable(Vec<String>),
    /// Row write ACL admits one of the subjects.
    Writable(Vec<String>),
    /// Record sorts strictly after the cursor.
    After(Cursor),
}

impl CompiledFilter {
    /// Conjunction with constant folding.
    pub fn and(filters: impl IntoIterator<Item = CompiledFilter>) -> Self {
        let mut out = Vec::new();
        for filter in filters {
            match filter {
                CompiledFilter::True => {}
                CompiledFilter::False => return CompiledFilter::False,
                CompiledFilter::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => CompiledFilter::True,
            1 => out.remove(0),
            _ => CompiledFilter::And(out),
        }
    }

    /// Disjunction with constant folding.
    pub fn or(filters: impl IntoIterator<Item = CompiledFilter>) -> Self {
        let mut out = Vec::new();
        for filter in filters {
            match filter {
                CompiledFilter::False => {}
                CompiledFilter::True => return CompiledFilter::True,
                CompiledFilter::Or(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => CompiledFilter::False,
            1 => out.remove(0),
            _ => CompiledFilter::Or(out),
        }
    }

    /// Negation with constant folding.
    pub fn negate(filter: CompiledFilter) -> Self {
        match filter {
            CompiledFilter::True => CompiledFilter::False,
            CompiledFilter::False => CompiledFilter::True,
            CompiledFilter::Not(inner) => *inner,
            other => CompiledFilter::Not(Box::new(other)),
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, CompiledFilter::True)
    }

    pub fn is_false(&self) -> bool {
        matches!(self, CompiledFilter::False)
    }
}

/// A query against one class, executable by a storage backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledQuery {
    pub class_name: String,
    pub filter: CompiledFilter,
    pub sort: Vec<SortSpec>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl CompiledQuery {
    /// Match every record of a class.
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            filter: CompiledFilter::True,
            sort: Vec::new(),
            skip: None,
            limit: None,
        }
    }

    pub fn with_filter(mut self, filter: CompiledFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_sort(mut self, sort: Vec<SortSpec>) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_skip(mut self, skip: Option<usize>) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

/// Sort/skip/limit and extra filter applied to relation members.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Narrowing {
    pub filter: Option<CompiledFilter>,
    pub sort: Vec<SortSpec>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

/// Where attachment members come from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AttachmentSource {
    /// Members of a pointer or relation on the record.
    Relation {
        segment: PathSegment,
        narrowing: Narrowing,
    },
    /// Elements of a local array.
    Elements {
        filter: CompiledFilter,
        sort: Vec<SortSpec>,
        skip: Option<usize>,
        limit: Option<usize>,
    },
}

/// What an attachment surfaces under its path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AttachmentOutput {
    Members,
    Count,
    Group(BTreeMap<String, AccumulatorSpec>),
}

/// A synthetic attribute computed per record after the backend query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub path: String,
    pub source: AttachmentSource,
    pub output: AttachmentOutput,
}

/// A fully compiled read.
///
/// `query` is pushed to the backend. `attachments` are computed per record,
/// and `residual` filters on the attached values. When the residual is not
/// trivially true, `skip` and `limit` are applied after it instead of being
/// pushed down.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledPlan {
    pub query: CompiledQuery,
    pub attachments: Vec<Attachment>,
    pub residual: CompiledFilter,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl CompiledPlan {
    /// Check if every predicate runs in the backend.
    pub fn is_pushdown(&self) -> bool {
        self.attachments.is_empty() && self.residual.is_true()
    }
}
