//! Filter trees, selectors, and `$expr` expressions.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregate::AccumulatorSpec;
use crate::value::Value;

/// Path placeholder for the element under test inside a quantifier.
pub const PLACEHOLDER: &str = "$";

/// Comparison operators shared by selectors and expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    /// Check whether an ordering satisfies this operator.
    pub fn accepts(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Lte => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Gte => ordering != Ordering::Less,
        }
    }
}

/// Arithmetic operators in `$expr` trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
}

/// A small interpreted expression tree over `$key`/`$value`/`$array` operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Expr {
    /// Value at a dotted path on the document under test.
    Key(String),
    /// Literal value.
    Value(Value),
    /// Array built from sub-expressions.
    Array(Vec<Expr>),
    /// Logical negation.
    Not(Box<Expr>),
    /// Logical conjunction.
    And(Vec<Expr>),
    /// Logical disjunction.
    Or(Vec<Expr>),
    /// Comparison of two operands.
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Arithmetic on two operands.
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    /// Reference a document path.
    pub fn key(path: impl Into<String>) -> Self {
        Expr::Key(path.into())
    }

    /// A literal operand.
    pub fn value(value: impl Into<Value>) -> Self {
        Expr::Value(value.into())
    }

    /// Compare two operands.
    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Combine two operands arithmetically.
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Collect every `$key` path referenced by this expression.
    pub fn keys<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Key(path) => out.push(path),
            Expr::Value(_) => {}
            Expr::Array(items) | Expr::And(items) | Expr::Or(items) => {
                items.iter().for_each(|item| item.keys(out))
            }
            Expr::Not(inner) => inner.keys(out),
            Expr::Compare { left, right, .. } | Expr::Binary { left, right, .. } => {
                left.keys(out);
                right.keys(out);
            }
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    /// Dotted path to sort by.
    pub path: String,
    /// Direction.
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortSpec {
    /// Ascending sort on a path.
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Asc,
        }
    }

    /// Descending sort on a path.
    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Sub-query attached to a relation or array path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSpec {
    /// Filter applied to each member.
    #[serde(default)]
    pub filter: Option<Box<FilterNode>>,
    /// Member ordering.
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    /// Members to skip.
    #[serde(default)]
    pub skip: Option<usize>,
    /// Maximum members kept.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl MatchSpec {
    /// An unrestricted match.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict members with a filter.
    pub fn with_filter(mut self, filter: FilterNode) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Add a sort key.
    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }

    /// Skip members.
    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Limit members.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A predicate applied to the value at a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Selector {
    Eq(Value),
    Ne(Value),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    /// Field is present and not null (`true`), or absent (`false`).
    Exists(bool),
    StartsWith(String),
    EndsWith(String),
    Pattern {
        regex: String,
        #[serde(default)]
        case_insensitive: bool,
    },
    /// Array length or string length.
    Size(usize),
    Empty,
    NotEmpty,
    ContainedIn(Vec<Value>),
    NotContainedIn(Vec<Value>),
    IsSubset(Vec<Value>),
    IsSuperset(Vec<Value>),
    IsDisjoint(Vec<Value>),
    IsIntersect(Vec<Value>),
    /// At least one element satisfies the nested filter.
    Some(Box<FilterNode>),
    /// Every element satisfies the nested filter.
    Every(Box<FilterNode>),
    /// Narrow a relation or array and surface the members under the path.
    Match(MatchSpec),
    /// Surface the number of matching members under the path.
    CountMatches(MatchSpec),
    /// Surface accumulator results over matching members under the path.
    GroupMatches {
        #[serde(default)]
        spec: MatchSpec,
        accumulators: BTreeMap<String, AccumulatorSpec>,
    },
}

impl Selector {
    /// Check whether this selector surfaces a synthetic attribute.
    pub fn is_attachment(&self) -> bool {
        matches!(
            self,
            Selector::Match(_) | Selector::CountMatches(_) | Selector::GroupMatches { .. }
        )
    }
}

/// A filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterNode {
    /// All children must match.
    All(Vec<FilterNode>),
    /// At least one child must match.
    Any(Vec<FilterNode>),
    /// The child must not match.
    Not(Box<FilterNode>),
    /// A selector applied at a path.
    Field { path: String, selector: Selector },
    /// A `$expr` condition.
    Expr(Expr),
}

impl FilterNode {
    /// Apply a selector at a path.
    pub fn field(path: impl Into<String>, selector: Selector) -> Self {
        FilterNode::Field {
            path: path.into(),
            selector,
        }
    }

    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Selector::Eq(value.into()))
    }

    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Selector::Ne(value.into()))
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Selector::Lt(value.into()))
    }

    pub fn lte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Selector::Lte(value.into()))
    }

    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Selector::Gt(value.into()))
    }

    pub fn gte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Selector::Gte(value.into()))
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Self::field(path, Selector::Exists(true))
    }

    pub fn contained_in(path: impl Into<String>, values: Vec<Value>) -> Self {
        Self::field(path, Selector::ContainedIn(values))
    }

    /// At least one element at `path` satisfies `filter`.
    pub fn some(path: impl Into<String>, filter: FilterNode) -> Self {
        Self::field(path, Selector::Some(Box::new(filter)))
    }

    /// Every element at `path` satisfies `filter`.
    pub fn every(path: impl Into<String>, filter: FilterNode) -> Self {
        Self::field(path, Selector::Every(Box::new(filter)))
    }

    /// Narrow the members at `path`.
    pub fn matching(path: impl Into<String>, spec: MatchSpec) -> Self {
        Self::field(path, Selector::Match(spec))
    }

    /// Replace the members at `path` with their count.
    pub fn count_matches(path: impl Into<String>, spec: MatchSpec) -> Self {
        Self::field(path, Selector::CountMatches(spec))
    }

    /// Replace the members at `path` with accumulator results.
    pub fn group_matches(
        path: impl Into<String>,
        spec: MatchSpec,
        accumulators: BTreeMap<String, AccumulatorSpec>,
    ) -> Self {
        Self::field(path, Selector::GroupMatches { spec, accumulators })
    }

    pub fn all(nodes: Vec<FilterNode>) -> Self {
        FilterNode::All(nodes)
    }

    pub fn any(nodes: Vec<FilterNode>) -> Self {
        FilterNode::Any(nodes)
    }

    pub fn not(node: FilterNode) -> Self {
        FilterNode::Not(Box::new(node))
    }

    pub fn expr(expr: Expr) -> Self {
        FilterNode::Expr(expr)
    }

    /// Conjoin two filters, flattening nested conjunctions.
    pub fn and(self, other: FilterNode) -> Self {
        match self {
            FilterNode::All(mut nodes) => {
                nodes.push(other);
                FilterNode::All(nodes)
            }
            node => FilterNode::All(vec![node, other]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_json_shape() {
        let filter = FilterNode::eq("title", "hello").and(FilterNode::some(
            "tags",
            FilterNode::eq("$", "rust"),
        ));
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "all": [
                    {"field": {"path": "title", "selector": {"eq": "hello"}}},
                    {"field": {"path": "tags", "selector": {"some":
                        {"field": {"path": "$", "selector": {"eq": "rust"}}}}}}
                ]
            })
        );
        let decoded: FilterNode = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, filter);
    }

    #[test]
    fn test_expr_keys() {
        let expr = Expr::compare(
            CompareOp::Gt,
            Expr::binary(BinaryOp::Add, Expr::key("a"), Expr::key("b.c")),
            Expr::value(3),
        );
        let mut keys = Vec::new();
        expr.keys(&mut keys);
        assert_eq!(keys, vec!["a", "b.c"]);
    }

    #[test]
    fn test_compare_op_accepts() {
        assert!(CompareOp::Lte.accepts(Ordering::Equal));
        assert!(!CompareOp::Gt.accepts(Ordering::Equal));
        assert!(CompareOp::Ne.accepts(Ordering::Less));
    }
}
