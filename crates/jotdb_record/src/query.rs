//! Query filter parsing and evaluation.
//!
//! A filter is a JSON object mapping field names to constraints. Each
//! constraint is either a literal value (shorthand for `$eq`) or an
//! operator object such as `{"$gte": 18, "$lt": 65}`. The contract is
//! AND-of-fields, AND-of-operators-per-field; there is no OR and no
//! nested boolean composition.
//!
//! Parsing is strict: an unrecognized `$` key fails with
//! [`QueryError::InvalidOperator`] rather than silently skipping the
//! constraint. Evaluation is total and side-effect-free - a missing
//! field or a type mismatch makes the predicate false, never an error.
//!
//! Field names starting with the internal prefix (`_`) are ignored as
//! predicates; callers cannot query on bookkeeping fields.

use crate::error::{QueryError, QueryResult};
use crate::record::{Record, INTERNAL_PREFIX};
use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A single parsed field constraint.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Field strictly equals the value.
    Eq(Value),
    /// Field does not equal the value (a missing field is "not equal").
    Ne(Value),
    /// Field is strictly greater than the value.
    Gt(Value),
    /// Field is greater than or equal to the value.
    Gte(Value),
    /// Field is strictly less than the value.
    Lt(Value),
    /// Field is less than or equal to the value.
    Lte(Value),
    /// Field (or one of its elements, for array fields) is a member of
    /// the given array.
    In(Vec<Value>),
    /// Negation of [`Predicate::In`]; a missing field is "not a member".
    Nin(Vec<Value>),
    /// Stringified field matches the pattern.
    Regex(Regex),
    /// Presence of the field equals the boolean.
    Exists(bool),
}

/// A parsed, validated filter.
///
/// Construct with [`Query::parse`], evaluate with [`Query::matches`].
#[derive(Debug, Clone, Default)]
pub struct Query {
    predicates: Vec<(String, Vec<Predicate>)>,
}

impl Query {
    /// Parses a filter object into a query.
    ///
    /// # Errors
    ///
    /// Fails when a constraint uses an unrecognized operator, an operand
    /// of the wrong shape, or a `$regex` pattern that does not compile.
    pub fn parse(filter: &Map<String, Value>) -> QueryResult<Self> {
        let mut predicates = Vec::new();

        for (field, constraint) in filter {
            if field.starts_with('$') {
                // Top-level operators (boolean composition) are not part
                // of the contract.
                return Err(QueryError::invalid_operator(field));
            }
            if field.starts_with(INTERNAL_PREFIX) {
                continue;
            }

            let ops = match constraint {
                Value::Object(spec) if spec.keys().any(|k| k.starts_with('$')) => {
                    let mut ops = Vec::with_capacity(spec.len());
                    for (op, operand) in spec {
                        ops.push(parse_operator(op, operand)?);
                    }
                    ops
                }
                literal => vec![Predicate::Eq(literal.clone())],
            };

            predicates.push((field.clone(), ops));
        }

        Ok(Self { predicates })
    }

    /// Returns true if the record satisfies every field constraint.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        self.predicates.iter().all(|(field, ops)| {
            let value = record.get(field);
            ops.iter().all(|op| eval(op, value))
        })
    }

    /// Returns true if the query has no constraints (matches everything).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Returns the parsed per-field constraints.
    ///
    /// Used by backends that compile queries down to their own predicate
    /// language instead of evaluating in process.
    #[must_use]
    pub fn predicates(&self) -> &[(String, Vec<Predicate>)] {
        &self.predicates
    }
}

fn parse_operator(op: &str, operand: &Value) -> QueryResult<Predicate> {
    match op {
        "$eq" => Ok(Predicate::Eq(operand.clone())),
        "$ne" => Ok(Predicate::Ne(operand.clone())),
        "$gt" => Ok(Predicate::Gt(operand.clone())),
        "$gte" => Ok(Predicate::Gte(operand.clone())),
        "$lt" => Ok(Predicate::Lt(operand.clone())),
        "$lte" => Ok(Predicate::Lte(operand.clone())),
        "$in" | "$nin" => {
            let members = operand
                .as_array()
                .ok_or_else(|| QueryError::bad_operand(op, "an array"))?
                .clone();
            if op == "$in" {
                Ok(Predicate::In(members))
            } else {
                Ok(Predicate::Nin(members))
            }
        }
        "$regex" => {
            let pattern = operand
                .as_str()
                .ok_or_else(|| QueryError::bad_operand(op, "a string pattern"))?;
            let regex = Regex::new(pattern).map_err(|e| QueryError::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
            Ok(Predicate::Regex(regex))
        }
        "$exists" => {
            let flag = operand
                .as_bool()
                .ok_or_else(|| QueryError::bad_operand(op, "a boolean"))?;
            Ok(Predicate::Exists(flag))
        }
        other => Err(QueryError::invalid_operator(other)),
    }
}

fn eval(op: &Predicate, value: Option<&Value>) -> bool {
    match op {
        Predicate::Eq(expected) => value.is_some_and(|v| values_equal(v, expected)),
        Predicate::Ne(expected) => !value.is_some_and(|v| values_equal(v, expected)),
        Predicate::Gt(bound) => ordered(value, bound, &[Ordering::Greater]),
        Predicate::Gte(bound) => ordered(value, bound, &[Ordering::Greater, Ordering::Equal]),
        Predicate::Lt(bound) => ordered(value, bound, &[Ordering::Less]),
        Predicate::Lte(bound) => ordered(value, bound, &[Ordering::Less, Ordering::Equal]),
        Predicate::In(members) => value.is_some_and(|v| is_member(v, members)),
        Predicate::Nin(members) => !value.is_some_and(|v| is_member(v, members)),
        Predicate::Regex(regex) => value.is_some_and(|v| regex.is_match(&stringify(v))),
        Predicate::Exists(flag) => value.is_some() == *flag,
    }
}

fn ordered(value: Option<&Value>, bound: &Value, accept: &[Ordering]) -> bool {
    match value.and_then(|v| compare_values(v, bound)) {
        Some(ord) => accept.contains(&ord),
        None => false,
    }
}

/// Membership test for `$in`/`$nin`.
///
/// An array-valued field is a member when the whole array equals a member
/// or when any of its elements does.
fn is_member(value: &Value, members: &[Value]) -> bool {
    if members.iter().any(|m| values_equal(value, m)) {
        return true;
    }
    match value {
        Value::Array(elements) => elements
            .iter()
            .any(|e| members.iter().any(|m| values_equal(e, m))),
        _ => false,
    }
}

/// Structural equality, with numbers compared numerically so that `1`
/// and `1.0` are equal.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Ordered comparison in the field's native type: numbers numerically,
/// strings lexicographically, booleans false-before-true. Mixed or
/// unordered types compare as `None`.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Renders a value for `$regex` matching: strings as-is, everything else
/// via its JSON rendering.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
