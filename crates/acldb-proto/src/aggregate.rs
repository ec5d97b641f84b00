//! Accumulator specifications.

use serde::{Deserialize, Serialize};

use crate::filter::Expr;

/// Interpolation mode for percentiles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PercentileMode {
    /// Linear interpolation between closest ranks.
    #[default]
    Continuous,
    /// Nearest-rank value from the input.
    Discrete,
}

/// The per-element operand of an accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccExpr {
    /// Value at a dotted path (`$key`).
    Key(String),
    /// Computed expression.
    Expr(Expr),
    /// Nested accumulator evaluated over the array at `path` of each element.
    Nested {
        path: String,
        spec: Box<AccumulatorSpec>,
    },
}

impl From<&str> for AccExpr {
    fn from(path: &str) -> Self {
        AccExpr::Key(path.to_string())
    }
}

impl From<String> for AccExpr {
    fn from(path: String) -> Self {
        AccExpr::Key(path)
    }
}

/// A reduction over a sequence of documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccumulatorSpec {
    Count,
    Sum(AccExpr),
    Avg(AccExpr),
    Min(AccExpr),
    Max(AccExpr),
    StdDevPop(AccExpr),
    StdDevSamp(AccExpr),
    VarPop(AccExpr),
    VarSamp(AccExpr),
    Percentile {
        expr: AccExpr,
        p: f64,
        #[serde(default)]
        mode: PercentileMode,
    },
    /// Most frequent value.
    Most(AccExpr),
    /// Partition by key and evaluate `value` per partition.
    Group {
        key: AccExpr,
        value: Box<AccumulatorSpec>,
    },
}

impl AccumulatorSpec {
    pub fn sum(expr: impl Into<AccExpr>) -> Self {
        AccumulatorSpec::Sum(expr.into())
    }

    pub fn avg(expr: impl Into<AccExpr>) -> Self {
        AccumulatorSpec::Avg(expr.into())
    }

    pub fn min(expr: impl Into<AccExpr>) -> Self {
        AccumulatorSpec::Min(expr.into())
    }

    pub fn max(expr: impl Into<AccExpr>) -> Self {
        AccumulatorSpec::Max(expr.into())
    }

    pub fn percentile(expr: impl Into<AccExpr>, p: f64, mode: PercentileMode) -> Self {
        AccumulatorSpec::Percentile {
            expr: expr.into(),
            p,
            mode,
        }
    }

    pub fn group(key: impl Into<AccExpr>, value: AccumulatorSpec) -> Self {
        AccumulatorSpec::Group {
            key: key.into(),
            value: Box::new(value),
        }
    }
}
