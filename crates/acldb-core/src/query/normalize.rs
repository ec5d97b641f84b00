//! Literal normalization.
//!
//! Every string literal entering the pipeline is rewritten to Unicode NFD so
//! that canonically equivalent strings compare equal. The walk also enforces
//! a nesting bound, which turns cyclic or runaway payloads into a validation
//! error instead of unbounded recursion.

use std::collections::BTreeMap;

use unicode_normalization::UnicodeNormalization;

use acldb_proto::{Expr, FilterNode, MatchSpec, Selector, Update, UpdateOp, Value};

use crate::error::ValidationError;

/// Normalize a string to NFD.
pub fn nfd(s: &str) -> String {
    s.nfd().collect()
}

/// Walks request literals, normalizing strings and bounding depth.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    max_depth: usize,
}

type Result<T> = std::result::Result<T, ValidationError>;

impl Normalizer {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    fn descend(&self, depth: usize) -> Result<usize> {
        if depth >= self.max_depth {
            Err(ValidationError::CyclicLiteral(self.max_depth))
        } else {
            Ok(depth + 1)
        }
    }

    /// Normalize a literal value.
    pub fn value(&self, value: Value) -> Result<Value> {
        self.value_at(value, 0)
    }

    fn value_at(&self, value: Value, depth: usize) -> Result<Value> {
        let depth = self.descend(depth)?;
        Ok(match value {
            Value::String(s) => Value::String(nfd(&s)),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.value_at(item, depth))
                    .collect::<Result<_>>()?,
            ),
            Value::Object(map) => Value::Object(self.map_at(map, depth)?),
            other => other,
        })
    }

    fn values_at(&self, values: Vec<Value>, depth: usize) -> Result<Vec<Value>> {
        values
            .into_iter()
            .map(|value| self.value_at(value, depth))
            .collect()
    }

    fn map_at(
        &self,
        map: BTreeMap<String, Value>,
        depth: usize,
    ) -> Result<BTreeMap<String, Value>> {
        map.into_iter()
            .map(|(key, value)| Ok::<_, ValidationError>((key, self.value_at(value, depth)?)))
            .collect()
    }

    /// Normalize object attributes.
    pub fn attributes(&self, map: BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>> {
        self.map_at(map, 0)
    }

    /// Normalize every literal in a filter tree.
    pub fn filter(&self, node: FilterNode) -> Result<FilterNode> {
        self.filter_at(node, 0)
    }

    fn filter_at(&self, node: FilterNode, depth: usize) -> Result<FilterNode> {
        let depth = self.descend(depth)?;
        Ok(match node {
            FilterNode::All(nodes) => FilterNode::All(self.filters_at(nodes, depth)?),
            FilterNode::Any(nodes) => FilterNode::Any(self.filters_at(nodes, depth)?),
            FilterNode::Not(inner) => FilterNode::Not(Box::new(self.filter_at(*inner, depth)?)),
            FilterNode::Field { path, selector } => FilterNode::Field {
                path,
                selector: self.selector_at(selector, depth)?,
            },
            FilterNode::Expr(expr) => FilterNode::Expr(self.expr_at(expr, depth)?),
        })
    }

    fn filters_at(&self, nodes: Vec<FilterNode>, depth: usize) -> Result<Vec<FilterNode>> {
        nodes
            .into_iter()
            .map(|node| self.filter_at(node, depth))
            .collect()
    }

    fn selector_at(&self, selector: Selector, depth: usize) -> Result<Selector> {
        Ok(match selector {
            Selector::Eq(v) => Selector::Eq(self.value_at(v, depth)?),
            Selector::Ne(v) => Selector::Ne(self.value_at(v, depth)?),
            Selector::Lt(v) => Selector::Lt(self.value_at(v, depth)?),
            Selector::Lte(v) => Selector::Lte(self.value_at(v, depth)?),
            Selector::Gt(v) => Selector::Gt(self.value_at(v, depth)?),
            Selector::Gte(v) => Selector::Gte(self.value_at(v, depth)?),
            Selector::StartsWith(s) => Selector::StartsWith(nfd(&s)),
            Selector::EndsWith(s) => Selector::EndsWith(nfd(&s)),
            Selector::Pattern {
                regex,
                case_insensitive,
            } => Selector::Pattern {
                regex: nfd(&regex),
                case_insensitive,
            },
            Selector::ContainedIn(vs) => Selector::ContainedIn(self.values_at(vs, depth)?),
            Selector::NotContainedIn(vs) => Selector::NotContainedIn(self.values_at(vs, depth)?),
            Selector::IsSubset(vs) => Selector::IsSubset(self.values_at(vs, depth)?),
            Selector::IsSuperset(vs) => Selector::IsSuperset(self.values_at(vs, depth)?),
            Selector::IsDisjoint(vs) => Selector::IsDisjoint(self.values_at(vs, depth)?),
            Selector::IsIntersect(vs) => Selector::IsIntersect(self.values_at(vs, depth)?),
            Selector::Some(inner) => Selector::Some(Box::new(self.filter_at(*inner, depth)?)),
            Selector::Every(inner) => Selector::Every(Box::new(self.filter_at(*inner, depth)?)),
            Selector::Match(spec) => Selector::Match(self.match_at(spec, depth)?),
            Selector::CountMatches(spec) => Selector::CountMatches(self.match_at(spec, depth)?),
            Selector::GroupMatches { spec, accumulators } => Selector::GroupMatches {
                spec: self.match_at(spec, depth)?,
                accumulators,
            },
            other @ (Selector::Exists(_) | Selector::Size(_) | Selector::Empty | Selector::NotEmpty) => {
                other
            }
        })
    }

    fn match_at(&self, mut spec: MatchSpec, depth: usize) -> Result<MatchSpec> {
        if let Some(filter) = spec.filter.take() {
            spec.filter = Some(Box::new(self.filter_at(*filter, depth)?));
        }
        Ok(spec)
    }

    fn expr_at(&self, expr: Expr, depth: usize) -> Result<Expr> {
        let depth = self.descend(depth)?;
        Ok(match expr {
            Expr::Value(value) => Expr::Value(self.value_at(value, depth)?),
            Expr::Array(items) => Expr::Array(self.exprs_at(items, depth)?),
            Expr::And(items) => Expr::And(self.exprs_at(items, depth)?),
            Expr::Or(items) => Expr::Or(self.exprs_at(items, depth)?),
            Expr::Not(inner) => Expr::Not(Box::new(self.expr_at(*inner, depth)?)),
            Expr::Compare { op, left, right } => Expr::Compare {
                op,
                left: Box::new(self.expr_at(*left, depth)?),
                right: Box::new(self.expr_at(*right, depth)?),
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op,
                left: Box::new(self.expr_at(*left, depth)?),
                right: Box::new(self.expr_at(*right, depth)?),
            },
            key @ Expr::Key(_) => key,
        })
    }

    fn exprs_at(&self, items: Vec<Expr>, depth: usize) -> Result<Vec<Expr>> {
        items
            .into_iter()
            .map(|item| self.expr_at(item, depth))
            .collect()
    }

    /// Normalize every literal in an update.
    pub fn update(&self, update: Update) -> Result<Update> {
        let ops = update
            .ops
            .into_iter()
            .map(|(path, op)| {
                let op = match op {
                    UpdateOp::Set(v) => UpdateOp::Set(self.value(v)?),
                    UpdateOp::Inc(v) => UpdateOp::Inc(self.value(v)?),
                    UpdateOp::Dec(v) => UpdateOp::Dec(self.value(v)?),
                    UpdateOp::Mul(v) => UpdateOp::Mul(self.value(v)?),
                    UpdateOp::Div(v) => UpdateOp::Div(self.value(v)?),
                    UpdateOp::Min(v) => UpdateOp::Min(self.value(v)?),
                    UpdateOp::Max(v) => UpdateOp::Max(self.value(v)?),
                    UpdateOp::AddToSet(vs) => UpdateOp::AddToSet(self.values_at(vs, 0)?),
                    UpdateOp::Push(vs) => UpdateOp::Push(self.values_at(vs, 0)?),
                    UpdateOp::RemoveAll(vs) => UpdateOp::RemoveAll(self.values_at(vs, 0)?),
                    other => other,
                };
                Ok::<_, ValidationError>((path, op))
            })
            .collect::<Result<_>>()?;
        Ok(Update { ops })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strings_become_nfd() {
        let normalizer = Normalizer::new(16);
        let composed = "caf\u{e9}";
        let filter = normalizer.filter(FilterNode::eq("name", composed)).unwrap();
        assert_eq!(filter, FilterNode::eq("name", "cafe\u{301}"));
    }

    #[test]
    fn test_depth_bound() {
        let normalizer = Normalizer::new(4);
        let mut value = Value::from("leaf");
        for _ in 0..8 {
            value = Value::Array(vec![value]);
        }
        assert!(matches!(
            normalizer.value(value),
            Err(ValidationError::CyclicLiteral(4))
        ));

        let shallow = Value::Array(vec![Value::from(1)]);
        assert!(normalizer.value(shallow).is_ok());
    }
}
