//! Accumulator evaluation.
//!
//! Reductions over documents in the style of a `$group` stage. Numeric
//! accumulators ignore non-numeric operands and return null when nothing
//! contributed; `Count` counts documents and never returns null. When any
//! contributing operand is a decimal, the whole reduction runs in decimal.

use std::collections::BTreeMap;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use acldb_proto::{AccExpr, AccumulatorSpec, PercentileMode, Value};

use super::evaluator::{Document, ElementDoc};
use super::expr;
use super::numeric::Numeric;
use crate::error::ValidationError;

type Result<T> = std::result::Result<T, ValidationError>;

/// Evaluates accumulator specifications over document sequences.
pub struct AggregationEngine;

impl AggregationEngine {
    /// Evaluate one accumulator.
    pub fn evaluate<D: Document>(spec: &AccumulatorSpec, docs: &[D]) -> Result<Value> {
        let docs: Vec<&dyn Document> = docs.iter().map(|doc| doc as &dyn Document).collect();
        reduce(spec, &docs)
    }

    /// Evaluate named accumulators into an object keyed by name.
    pub fn evaluate_all<D: Document>(
        accumulators: &BTreeMap<String, AccumulatorSpec>,
        docs: &[D],
    ) -> Result<Value> {
        let docs: Vec<&dyn Document> = docs.iter().map(|doc| doc as &dyn Document).collect();
        let mut out = BTreeMap::new();
        for (name, spec) in accumulators {
            out.insert(name.clone(), reduce(spec, &docs)?);
        }
        Ok(Value::Object(out))
    }
}

fn reduce(spec: &AccumulatorSpec, docs: &[&dyn Document]) -> Result<Value> {
    match spec {
        AccumulatorSpec::Count => Ok(Value::Number(docs.len() as f64)),
        AccumulatorSpec::Sum(e) => Ok(sum(&numbers(e, docs)?)
            .map(Numeric::into_value)
            .unwrap_or(Value::Null)),
        AccumulatorSpec::Avg(e) => {
            let values = numbers(e, docs)?;
            Ok(sum(&values)
                .and_then(|total| total.div_count(values.len()))
                .map(Numeric::into_value)
                .unwrap_or(Value::Null))
        }
        AccumulatorSpec::Min(e) => Ok(extreme(operands(e, docs)?, true)),
        AccumulatorSpec::Max(e) => Ok(extreme(operands(e, docs)?, false)),
        AccumulatorSpec::VarPop(e) => Ok(variance(&numbers(e, docs)?, false)
            .map(Numeric::into_value)
            .unwrap_or(Value::Null)),
        AccumulatorSpec::VarSamp(e) => Ok(variance(&numbers(e, docs)?, true)
            .map(Numeric::into_value)
            .unwrap_or(Value::Null)),
        AccumulatorSpec::StdDevPop(e) => Ok(variance(&numbers(e, docs)?, false)
            .and_then(Numeric::sqrt)
            .map(Numeric::into_value)
            .unwrap_or(Value::Null)),
        AccumulatorSpec::StdDevSamp(e) => Ok(variance(&numbers(e, docs)?, true)
            .and_then(Numeric::sqrt)
            .map(Numeric::into_value)
            .unwrap_or(Value::Null)),
        AccumulatorSpec::Percentile { expr, p, mode } => {
            if !(0.0..=1.0).contains(p) {
                return Err(ValidationError::InvalidArgument(format!(
                    "percentile must be within [0, 1], got {p}"
                )));
            }
            Ok(percentile(numbers(expr, docs)?, *p, *mode)
                .map(Numeric::into_value)
                .unwrap_or(Value::Null))
        }
        AccumulatorSpec::Most(e) => Ok(most(operands(e, docs)?)),
        AccumulatorSpec::Group { key, value } => group(key, value, docs),
    }
}

/// Evaluate the operand for every document, dropping missing and null.
fn operands(expr: &AccExpr, docs: &[&dyn Document]) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let value = operand(expr, *doc)?;
        if !value.is_null() {
            out.push(value);
        }
    }
    Ok(out)
}

fn operand(expr: &AccExpr, doc: &dyn Document) -> Result<Value> {
    Ok(match expr {
        AccExpr::Key(path) => doc
            .value_at(path)
            .map(|v| v.into_owned())
            .unwrap_or(Value::Null),
        AccExpr::Expr(e) => expr::evaluate(e, doc),
        AccExpr::Nested { path, spec } => {
            let array = doc.value_at(path);
            let elements: Vec<ElementDoc<'_>> = match array.as_deref() {
                Some(Value::Array(items)) => items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| ElementDoc::new(item, index))
                    .collect(),
                _ => Vec::new(),
            };
            let elements: Vec<&dyn Document> =
                elements.iter().map(|doc| doc as &dyn Document).collect();
            reduce(spec, &elements)?
        }
    })
}

/// Numeric operands, promoted to decimal when any of them is a decimal.
fn numbers(expr: &AccExpr, docs: &[&dyn Document]) -> Result<Vec<Numeric>> {
    let values: Vec<Numeric> = operands(expr, docs)?
        .iter()
        .filter_map(Numeric::from_value)
        .collect();
    if !values.iter().any(Numeric::is_decimal) {
        return Ok(values);
    }
    let promoted: Option<Vec<Numeric>> = values
        .iter()
        .map(|n| n.to_decimal().map(Numeric::Decimal))
        .collect();
    Ok(promoted.unwrap_or_else(|| values.iter().map(|n| Numeric::Float(n.to_f64())).collect()))
}

fn sum(values: &[Numeric]) -> Option<Numeric> {
    let (first, rest) = values.split_first()?;
    rest.iter().try_fold(*first, |acc, n| acc.add(*n))
}

fn variance(values: &[Numeric], sample: bool) -> Option<Numeric> {
    let n = values.len();
    if n == 0 || (sample && n < 2) {
        return None;
    }
    let mean = sum(values)?.div_count(n)?;
    let squares = values
        .iter()
        .map(|x| x.sub(mean).and_then(|d| d.mul(d)))
        .collect::<Option<Vec<_>>>()?;
    sum(&squares)?.div_count(if sample { n - 1 } else { n })
}

fn percentile(mut values: Vec<Numeric>, p: f64, mode: PercentileMode) -> Option<Numeric> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.compare(*b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    match mode {
        PercentileMode::Discrete => {
            let rank = (p * n as f64).ceil() as usize;
            values.get(rank.saturating_sub(1).min(n - 1)).copied()
        }
        PercentileMode::Continuous => {
            let rank = p * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let (low, high) = (values[lo], values[hi]);
            if lo == hi {
                return Some(low);
            }
            let fraction = rank - lo as f64;
            let fraction = if low.is_decimal() {
                Numeric::Decimal(Decimal::from_f64(fraction)?)
            } else {
                Numeric::Float(fraction)
            };
            high.sub(low)?.mul(fraction)?.add(low)
        }
    }
}

fn extreme(values: Vec<Value>, min: bool) -> Value {
    values
        .into_iter()
        .reduce(|best, value| {
            let ordering = value.total_cmp(&best);
            let better = if min { ordering.is_lt() } else { ordering.is_gt() };
            if better {
                value
            } else {
                best
            }
        })
        .map(|value| match Numeric::from_value(&value) {
            Some(n) if n.is_decimal() => n.into_value(),
            _ => value,
        })
        .unwrap_or(Value::Null)
}

/// Most frequent value; ties go to the value seen first.
fn most(values: Vec<Value>) -> Value {
    let mut counts: Vec<(Value, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(seen, _)| seen.loose_eq(&value)) {
            Some((_, count)) => *count += 1,
            None => counts.push((value, 1)),
        }
    }
    let mut best: Option<(Value, usize)> = None;
    for (value, count) in counts {
        if best.as_ref().map(|(_, top)| count > *top).unwrap_or(true) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value).unwrap_or(Value::Null)
}

fn group(key: &AccExpr, value: &AccumulatorSpec, docs: &[&dyn Document]) -> Result<Value> {
    let mut partitions: Vec<(Value, Vec<&dyn Document>)> = Vec::new();
    for doc in docs {
        let k = operand(key, *doc)?;
        match partitions.iter_mut().find(|(seen, _)| seen.loose_eq(&k)) {
            Some((_, members)) => members.push(*doc),
            None => partitions.push((k, vec![*doc])),
        }
    }
    partitions.sort_by(|(a, _), (b, _)| a.total_cmp(b));
    let mut out = Vec::with_capacity(partitions.len());
    for (k, members) in partitions {
        let mut entry = BTreeMap::new();
        entry.insert("key".to_string(), k);
        entry.insert("value".to_string(), reduce(value, &members)?);
        out.push(Value::Object(entry));
    }
    Ok(Value::Array(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use acldb_proto::ObjectRecord;
    use std::str::FromStr;

    fn scores(values: &[Value]) -> Vec<ObjectRecord> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut record = ObjectRecord::new("Score", format!("s{i}"));
                record.attributes.insert("value".into(), v.clone());
                record
            })
            .collect()
    }

    fn numbers_of(values: &[f64]) -> Vec<ObjectRecord> {
        scores(&values.iter().map(|v| Value::Number(*v)).collect::<Vec<_>>())
    }

    fn dec(s: &str) -> Value {
        Value::Decimal(Decimal::from_str(s).unwrap())
    }

    #[test]
    fn test_empty_input_is_null_except_count() {
        let empty: Vec<ObjectRecord> = Vec::new();
        for spec in [
            AccumulatorSpec::sum("value"),
            AccumulatorSpec::avg("value"),
            AccumulatorSpec::min("value"),
            AccumulatorSpec::max("value"),
            AccumulatorSpec::StdDevPop("value".into()),
            AccumulatorSpec::VarSamp("value".into()),
            AccumulatorSpec::percentile("value", 0.5, PercentileMode::Continuous),
            AccumulatorSpec::Most("value".into()),
        ] {
            assert_eq!(AggregationEngine::evaluate(&spec, &empty).unwrap(), Value::Null);
        }
        assert_eq!(
            AggregationEngine::evaluate(&AccumulatorSpec::Count, &empty).unwrap(),
            Value::Number(0.0)
        );
    }

    #[test]
    fn test_sample_statistics_need_two_values() {
        let docs = numbers_of(&[4.0]);
        let samp = AggregationEngine::evaluate(&AccumulatorSpec::StdDevSamp("value".into()), &docs);
        assert_eq!(samp.unwrap(), Value::Null);
        let pop = AggregationEngine::evaluate(&AccumulatorSpec::StdDevPop("value".into()), &docs);
        assert_eq!(pop.unwrap(), Value::Number(0.0));
    }

    #[test]
    fn test_variance_and_stddev() {
        let docs = numbers_of(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        let var = AggregationEngine::evaluate(&AccumulatorSpec::VarPop("value".into()), &docs);
        assert_eq!(var.unwrap(), Value::Number(4.0));
        let sd = AggregationEngine::evaluate(&AccumulatorSpec::StdDevPop("value".into()), &docs);
        assert_eq!(sd.unwrap(), Value::Number(2.0));
    }

    #[test]
    fn test_decimal_sum_is_exact() {
        let docs = scores(&[dec("10.5"), dec("20.25"), dec("30.75")]);
        let total = AggregationEngine::evaluate(&AccumulatorSpec::sum("value"), &docs).unwrap();
        assert_eq!(total, dec("61.5"));
        let avg = AggregationEngine::evaluate(&AccumulatorSpec::avg("value"), &docs).unwrap();
        assert_eq!(avg, dec("20.5"));
    }

    #[test]
    fn test_percentiles() {
        let docs = numbers_of(&[1.0, 2.0, 3.0, 4.0]);
        let median = AccumulatorSpec::percentile("value", 0.5, PercentileMode::Continuous);
        assert_eq!(
            AggregationEngine::evaluate(&median, &docs).unwrap(),
            Value::Number(2.5)
        );
        let discrete = AccumulatorSpec::percentile("value", 0.5, PercentileMode::Discrete);
        assert_eq!(
            AggregationEngine::evaluate(&discrete, &docs).unwrap(),
            Value::Number(2.0)
        );
        let bad = AccumulatorSpec::percentile("value", 1.5, PercentileMode::Discrete);
        assert!(AggregationEngine::evaluate(&bad, &docs).is_err());
    }

    #[test]
    fn test_most_and_group() {
        let docs = scores(&[
            Value::from("b"),
            Value::from("a"),
            Value::from("a"),
            Value::from("b"),
            Value::from("c"),
        ]);
        assert_eq!(
            AggregationEngine::evaluate(&AccumulatorSpec::Most("value".into()), &docs).unwrap(),
            Value::from("b")
        );
        let grouped = AggregationEngine::evaluate(
            &AccumulatorSpec::group("value", AccumulatorSpec::Count),
            &docs,
        )
        .unwrap();
        let counts: Vec<(Value, Value)> = grouped
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| {
                let entry = entry.as_object().unwrap();
                (entry["key"].clone(), entry["value"].clone())
            })
            .collect();
        assert_eq!(
            counts,
            vec![
                (Value::from("a"), Value::Number(2.0)),
                (Value::from("b"), Value::Number(2.0)),
                (Value::from("c"), Value::Number(1.0)),
            ]
        );
    }

    #[test]
    fn test_nested_accumulator() {
        let mut record = ObjectRecord::new("Cart", "c1");
        record.attributes.insert(
            "items".into(),
            Value::Array(vec![Value::from(2), Value::from(3)]),
        );
        let spec = AccumulatorSpec::sum(AccExpr::Nested {
            path: "items".into(),
            spec: Box::new(AccumulatorSpec::sum("$")),
        });
        assert_eq!(
            AggregationEngine::evaluate(&spec, &[record]).unwrap(),
            Value::Number(5.0)
        );
    }
}
