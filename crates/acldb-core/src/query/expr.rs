//! `$expr` evaluation.

use acldb_proto::{CompareOp, Expr, Value};

use super::evaluator::Document;
use super::numeric::Numeric;

/// Evaluate an expression against a document. Missing keys evaluate to null.
pub fn evaluate(expr: &Expr, doc: &dyn Document) -> Value {
    match expr {
        Expr::Key(path) => doc
            .value_at(path)
            .map(|v| v.into_owned())
            .unwrap_or(Value::Null),
        Expr::Value(value) => value.clone(),
        Expr::Array(items) => Value::Array(items.iter().map(|item| evaluate(item, doc)).collect()),
        Expr::Not(inner) => Value::Bool(!evaluate(inner, doc).is_truthy()),
        Expr::And(items) => Value::Bool(items.iter().all(|item| evaluate(item, doc).is_truthy())),
        Expr::Or(items) => Value::Bool(items.iter().any(|item| evaluate(item, doc).is_truthy())),
        Expr::Compare { op, left, right } => {
            let left = evaluate(left, doc);
            let right = evaluate(right, doc);
            let result = match op {
                CompareOp::Eq => left.loose_eq(&right),
                CompareOp::Ne => !left.loose_eq(&right),
                op => left
                    .compare(&right)
                    .map(|ordering| op.accepts(ordering))
                    .unwrap_or(false),
            };
            Value::Bool(result)
        }
        Expr::Binary { op, left, right } => {
            let left = evaluate(left, doc);
            let right = evaluate(right, doc);
            match (&left, &right) {
                (Value::String(a), Value::String(b)) if *op == acldb_proto::BinaryOp::Add => {
                    Value::String(format!("{a}{b}"))
                }
                _ => Numeric::from_value(&left)
                    .zip(Numeric::from_value(&right))
                    .and_then(|(a, b)| a.apply(*op, b))
                    .map(Numeric::into_value)
                    .unwrap_or(Value::Null),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acldb_proto::{BinaryOp, ObjectRecord};

    #[test]
    fn test_compare_computed_fields() {
        let doc = ObjectRecord::new("Order", "o1")
            .with_attribute("price", 4)
            .with_attribute("quantity", 3)
            .with_attribute("budget", 10);
        let total = Expr::binary(BinaryOp::Multiply, Expr::key("price"), Expr::key("quantity"));
        assert_eq!(evaluate(&total, &doc), Value::Number(12.0));
        let over = Expr::compare(CompareOp::Gt, total, Expr::key("budget"));
        assert_eq!(evaluate(&over, &doc), Value::Bool(true));
    }

    #[test]
    fn test_missing_and_division_by_zero_are_null() {
        let doc = ObjectRecord::new("Order", "o1").with_attribute("price", 4);
        let missing = Expr::binary(BinaryOp::Add, Expr::key("price"), Expr::key("nope"));
        assert_eq!(evaluate(&missing, &doc), Value::Null);
        let div = Expr::binary(BinaryOp::Divide, Expr::key("price"), Expr::value(0));
        assert_eq!(evaluate(&div, &doc), Value::Null);
    }
}
