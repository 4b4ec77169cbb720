use crate::document::{Fields, RawDocument};
use serde_json::Value;
use std::cmp::Ordering;

/// Comparison used by a `Where` constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    /// The field is an array holding the value.
    ArrayContains,
    /// The value is an array holding the field.
    In,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// A pre-built query predicate. Field names may use dots to reach into
/// nested objects (`address.city`).
#[derive(Debug, Clone, PartialEq)]
pub enum QueryConstraint {
    Where {
        field: String,
        op: FilterOp,
        value: Value,
    },
    OrderBy {
        field: String,
        direction: Direction,
    },
    Limit(usize),
}

impl QueryConstraint {
    pub fn filter(field: &str, op: FilterOp, value: Value) -> Self {
        QueryConstraint::Where {
            field: field.to_string(),
            op,
            value,
        }
    }

    pub fn eq(field: &str, value: Value) -> Self {
        QueryConstraint::filter(field, FilterOp::Equal, value)
    }

    pub fn order_by(field: &str, direction: Direction) -> Self {
        QueryConstraint::OrderBy {
            field: field.to_string(),
            direction,
        }
    }

    pub fn limit(count: usize) -> Self {
        QueryConstraint::Limit(count)
    }

    /// Whether a document's fields pass this constraint. Ordering and limit
    /// constraints accept everything.
    pub fn matches(&self, fields: &Fields) -> bool {
        let QueryConstraint::Where { field, op, value } = self else {
            return true;
        };
        let Some(actual) = lookup_field(fields, field) else {
            return false;
        };

        let ordering = compare_values(actual, value);
        match op {
            FilterOp::Equal => ordering == Some(Ordering::Equal),
            FilterOp::NotEqual => ordering != Some(Ordering::Equal),
            FilterOp::LessThan => ordering == Some(Ordering::Less),
            FilterOp::LessThanOrEqual => {
                matches!(ordering, Some(Ordering::Less | Ordering::Equal))
            }
            FilterOp::GreaterThan => ordering == Some(Ordering::Greater),
            FilterOp::GreaterThanOrEqual => {
                matches!(ordering, Some(Ordering::Greater | Ordering::Equal))
            }
            FilterOp::ArrayContains => actual
                .as_array()
                .map(|items| items.iter().any(|item| values_equal(item, value)))
                .unwrap_or(false),
            FilterOp::In => value
                .as_array()
                .map(|options| options.iter().any(|option| values_equal(actual, option)))
                .unwrap_or(false),
        }
    }
}

/// Run constraints over documents that are already in identifier order:
/// every filter, then the order-by keys in declaration order, then the limit.
/// Documents missing an order-by field are excluded.
pub fn apply_constraints(
    documents: Vec<RawDocument>,
    constraints: &[QueryConstraint],
) -> Vec<RawDocument> {
    let mut order_keys: Vec<(&str, Direction)> = Vec::new();
    let mut limit = None;
    for constraint in constraints {
        match constraint {
            QueryConstraint::OrderBy { field, direction } => {
                order_keys.push((field.as_str(), *direction));
            }
            QueryConstraint::Limit(count) => limit = Some(*count),
            QueryConstraint::Where { .. } => {}
        }
    }

    let mut matched: Vec<RawDocument> = documents
        .into_iter()
        .filter(|doc| {
            let Some(fields) = doc.fields.as_ref() else {
                return false;
            };
            constraints.iter().all(|c| c.matches(fields))
                && order_keys
                    .iter()
                    .all(|(field, _)| lookup_field(fields, field).is_some())
        })
        .collect();

    if !order_keys.is_empty() {
        matched.sort_by(|a, b| {
            for (field, direction) in &order_keys {
                let left = a.fields.as_ref().and_then(|f| lookup_field(f, field));
                let right = b.fields.as_ref().and_then(|f| lookup_field(f, field));
                let ordering = match (left, right) {
                    (Some(l), Some(r)) => total_order(l, r),
                    _ => Ordering::Equal,
                };
                let ordering = match direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    if let Some(count) = limit {
        matched.truncate(count);
    }
    matched
}

fn lookup_field<'a>(fields: &'a Fields, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let mut current = fields.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Some(Ordering::Equal)
}

/// Compare two values of the same kind. Values of different kinds are
/// incomparable, so range filters never match across types.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                match compare_values(left, right)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(x.len().cmp(&y.len()))
        }
        (Value::Object(x), Value::Object(y)) => {
            if x == y {
                Some(Ordering::Equal)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Ordering used by `OrderBy`: by kind first, then by value.
fn total_order(a: &Value, b: &Value) -> Ordering {
    type_rank(a)
        .cmp(&type_rank(b))
        .then_with(|| compare_values(a, b).unwrap_or(Ordering::Equal))
}
