//! Update operations applied per dotted path.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A single update operation.
///
/// Numeric operations switch to decimal arithmetic when either the stored or
/// the incoming value is a decimal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum UpdateOp {
    Set(Value),
    Unset,
    Inc(Value),
    Dec(Value),
    Mul(Value),
    Div(Value),
    Min(Value),
    Max(Value),
    AddToSet(Vec<Value>),
    Push(Vec<Value>),
    RemoveAll(Vec<Value>),
    PopFirst(usize),
    PopLast(usize),
}

impl UpdateOp {
    /// Check if this is an arithmetic operation.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            UpdateOp::Inc(_) | UpdateOp::Dec(_) | UpdateOp::Mul(_) | UpdateOp::Div(_)
        )
    }

    /// Check if this operation works on arrays.
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            UpdateOp::AddToSet(_)
                | UpdateOp::Push(_)
                | UpdateOp::RemoveAll(_)
                | UpdateOp::PopFirst(_)
                | UpdateOp::PopLast(_)
        )
    }
}

/// An ordered list of path updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Update {
    pub ops: Vec<(String, UpdateOp)>,
}

impl Update {
    /// Create an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation.
    pub fn with(mut self, path: impl Into<String>, op: UpdateOp) -> Self {
        self.ops.push((path.into(), op));
        self
    }

    pub fn set(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, UpdateOp::Set(value.into()))
    }

    pub fn unset(self, path: impl Into<String>) -> Self {
        self.with(path, UpdateOp::Unset)
    }

    pub fn inc(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, UpdateOp::Inc(value.into()))
    }

    pub fn push(self, path: impl Into<String>, values: Vec<Value>) -> Self {
        self.with(path, UpdateOp::Push(values))
    }

    /// Check if there are no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_json_shape() {
        let update = Update::new().inc("count", 1).unset("stale");
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                ["count", {"kind": "inc", "value": 1}],
                ["stale", {"kind": "unset"}]
            ])
        );
        let decoded: Update = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, update);
    }
}
