//! Applying update operations to a record image.

use acldb_proto::{ObjectRecord, Update, UpdateOp, Value};

use super::numeric::Numeric;
use crate::error::ValidationError;

type Result<T> = std::result::Result<T, ValidationError>;

/// Apply every operation of `update` to `record`, in order.
///
/// Version and timestamps are left to the caller.
pub fn apply_update(record: &mut ObjectRecord, update: &Update) -> Result<()> {
    for (path, op) in &update.ops {
        apply_op(record, path, op)?;
    }
    Ok(())
}

fn apply_op(record: &mut ObjectRecord, path: &str, op: &UpdateOp) -> Result<()> {
    match op {
        UpdateOp::Set(value) => record.set_path(path, value.clone()),
        UpdateOp::Unset => {
            record.remove_path(path);
        }
        UpdateOp::Inc(operand)
        | UpdateOp::Dec(operand)
        | UpdateOp::Mul(operand)
        | UpdateOp::Div(operand) => {
            let operand = numeric(path, operand)?;
            let current = match record.value_at(path).as_deref() {
                None | Some(Value::Null) => operand.zero_like(),
                Some(value) => numeric(path, value)?,
            };
            let result = match op {
                UpdateOp::Inc(_) => current.add(operand),
                UpdateOp::Dec(_) => current.sub(operand),
                UpdateOp::Mul(_) => current.mul(operand),
                _ => current.div(operand),
            }
            .ok_or_else(|| {
                ValidationError::InvalidArgument(format!(
                    "arithmetic on {path} overflowed or divided by zero"
                ))
            })?;
            record.set_path(path, result.into_value());
        }
        UpdateOp::Min(value) | UpdateOp::Max(value) => {
            let replace = match record.value_at(path).as_deref() {
                None | Some(Value::Null) => true,
                Some(current) => {
                    let ordering = value.total_cmp(current);
                    match op {
                        UpdateOp::Min(_) => ordering.is_lt(),
                        _ => ordering.is_gt(),
                    }
                }
            };
            if replace {
                record.set_path(path, value.clone());
            }
        }
        UpdateOp::AddToSet(values)
        | UpdateOp::Push(values)
        | UpdateOp::RemoveAll(values) => {
            let mut items = current_array(record, path)?;
            match op {
                UpdateOp::AddToSet(_) => {
                    for value in values {
                        if !items.iter().any(|item| item.loose_eq(value)) {
                            items.push(value.clone());
                        }
                    }
                }
                UpdateOp::Push(_) => items.extend(values.iter().cloned()),
                _ => items.retain(|item| !values.iter().any(|value| value.loose_eq(item))),
            }
            record.set_path(path, Value::Array(items));
        }
        UpdateOp::PopFirst(count) => {
            let mut items = current_array(record, path)?;
            let count = (*count).min(items.len());
            items.drain(..count);
            record.set_path(path, Value::Array(items));
        }
        UpdateOp::PopLast(count) => {
            let mut items = current_array(record, path)?;
            let keep = items.len().saturating_sub(*count);
            items.truncate(keep);
            record.set_path(path, Value::Array(items));
        }
    }
    Ok(())
}

fn numeric(path: &str, value: &Value) -> Result<Numeric> {
    Numeric::from_value(value).ok_or_else(|| ValidationError::TypeMismatch {
        path: path.to_string(),
        expected: "number".into(),
        actual: value.type_name().into(),
    })
}

fn current_array(record: &ObjectRecord, path: &str) -> Result<Vec<Value>> {
    match record.value_at(path).map(|v| v.into_owned()) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(ValidationError::TypeMismatch {
            path: path.to_string(),
            expected: "array".into(),
            actual: other.type_name().into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn test_numeric_ops() {
        let mut record = ObjectRecord::new("Account", "a1").with_attribute("balance", 10);
        let update = Update::new()
            .inc("balance", 5)
            .inc("visits", 1)
            .with("balance", UpdateOp::Mul(Value::from(2)));
        apply_update(&mut record, &update).unwrap();
        assert_eq!(record.attributes["balance"], Value::Number(30.0));
        assert_eq!(record.attributes["visits"], Value::Number(1.0));

        let divide = Update::new().with("balance", UpdateOp::Div(Value::from(0)));
        assert!(apply_update(&mut record, &divide).is_err());
    }

    #[test]
    fn test_decimal_inc_stays_exact() {
        let amount = |s: &str| Value::Decimal(Decimal::from_str(s).unwrap());
        let mut record = ObjectRecord::new("Account", "a1").with_attribute("balance", amount("0.1"));
        apply_update(&mut record, &Update::new().inc("balance", amount("0.2"))).unwrap();
        assert_eq!(record.attributes["balance"], amount("0.3"));
    }

    #[test]
    fn test_array_ops() {
        let mut record = ObjectRecord::new("Post", "p1")
            .with_attribute("tags", vec![Value::from("a"), Value::from("b")]);
        let update = Update::new()
            .with("tags", UpdateOp::AddToSet(vec![Value::from("b"), Value::from("c")]))
            .with("tags", UpdateOp::RemoveAll(vec![Value::from("a")]))
            .with("tags", UpdateOp::PopLast(1));
        apply_update(&mut record, &update).unwrap();
        assert_eq!(record.attributes["tags"], Value::Array(vec![Value::from("b")]));

        let mut record = ObjectRecord::new("Post", "p1").with_attribute("title", "x");
        let push = Update::new().push("title", vec![Value::from(1)]);
        assert!(matches!(
            apply_update(&mut record, &push),
            Err(ValidationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_min_max_and_unset() {
        let mut record = ObjectRecord::new("Stat", "s1").with_attribute("low", 5);
        let update = Update::new()
            .with("low", UpdateOp::Min(Value::from(3)))
            .with("high", UpdateOp::Max(Value::from(9)))
            .unset("low");
        apply_update(&mut record, &update).unwrap();
        assert!(!record.attributes.contains_key("low"));
        assert_eq!(record.attributes["high"], Value::from(9));
    }
}
