//! Mango-style selectors, sorting and projection for `find`, plus the key
//! ordering used by `all_docs` and `query`.

use std::cmp::Ordering;

use serde_json::Map;
use serde_json::Value;

use crate::EngineError;

/// Orders JSON values the way view keys collate:
/// null < booleans < numbers < strings < arrays < objects.
pub(crate) fn collate(
    a: &Value,
    b: &Value,
) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ordering = collate(l, r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => type_rank(a).cmp(&type_rank(b)),
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

/// Resolves a dot-separated path inside a document.
pub(crate) fn field_value<'a>(
    doc: &'a Value,
    path: &str,
) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Evaluates a selector against a rendered document.
pub(crate) fn matches(
    doc: &Value,
    selector: &Value,
) -> Result<bool, EngineError> {
    let conditions = selector
        .as_object()
        .ok_or_else(|| EngineError::bad_request("selector must be an object"))?;

    for (key, condition) in conditions {
        let matched = match key.as_str() {
            "$and" => all_of(doc, condition)?,
            "$or" => any_of(doc, condition)?,
            "$not" => !matches(doc, condition)?,
            field => field_matches(field_value(doc, field), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn all_of(
    doc: &Value,
    selectors: &Value,
) -> Result<bool, EngineError> {
    for selector in as_array(selectors, "$and")? {
        if !matches(doc, selector)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_of(
    doc: &Value,
    selectors: &Value,
) -> Result<bool, EngineError> {
    for selector in as_array(selectors, "$or")? {
        if matches(doc, selector)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn as_array<'a>(
    value: &'a Value,
    operator: &str,
) -> Result<&'a Vec<Value>, EngineError> {
    value
        .as_array()
        .ok_or_else(|| EngineError::bad_request(format!("{} expects an array", operator)))
}

fn is_operator_object(value: &Value) -> bool {
    match value.as_object() {
        Some(map) if !map.is_empty() => map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn field_matches(
    value: Option<&Value>,
    condition: &Value,
) -> Result<bool, EngineError> {
    if !is_operator_object(condition) {
        return Ok(value == Some(condition));
    }

    let Some(operators) = condition.as_object() else {
        return Ok(false);
    };
    for (operator, operand) in operators {
        if !operator_matches(value, operator, operand)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn operator_matches(
    value: Option<&Value>,
    operator: &str,
    operand: &Value,
) -> Result<bool, EngineError> {
    let ordered = |accept: fn(Ordering) -> bool| match value {
        Some(v) if type_rank(v) == type_rank(operand) => accept(collate(v, operand)),
        _ => false,
    };

    let matched = match operator {
        "$eq" => value == Some(operand),
        "$ne" => value != Some(operand),
        "$gt" => ordered(|o| o == Ordering::Greater),
        "$gte" => ordered(|o| o != Ordering::Less),
        "$lt" => ordered(|o| o == Ordering::Less),
        "$lte" => ordered(|o| o != Ordering::Greater),
        "$in" => {
            let candidates = as_array(operand, "$in")?;
            value.map(|v| candidates.contains(v)).unwrap_or(false)
        }
        "$nin" => {
            let candidates = as_array(operand, "$nin")?;
            value.map(|v| !candidates.contains(v)).unwrap_or(true)
        }
        "$exists" => {
            let wanted = operand
                .as_bool()
                .ok_or_else(|| EngineError::bad_request("$exists expects a boolean"))?;
            value.is_some() == wanted
        }
        other => {
            return Err(EngineError::bad_request(format!("unsupported operator {}", other)));
        }
    };
    Ok(matched)
}

/// Parsed `sort` clause: field paths with a descending flag
pub(crate) fn parse_sort(sort: Option<&Value>) -> Result<Vec<(String, bool)>, EngineError> {
    let Some(sort) = sort else {
        return Ok(Vec::new());
    };
    let entries = as_array(sort, "sort")?;

    let mut fields = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Value::String(field) => fields.push((field.clone(), false)),
            Value::Object(map) if map.len() == 1 => {
                for (field, direction) in map {
                    let descending = match direction.as_str() {
                        Some("asc") => false,
                        Some("desc") => true,
                        _ => return Err(EngineError::bad_request("sort direction must be asc or desc")),
                    };
                    fields.push((field.clone(), descending));
                }
            }
            _ => return Err(EngineError::bad_request("invalid sort entry")),
        }
    }
    Ok(fields)
}

pub(crate) fn sort_docs(
    docs: &mut [Value],
    sort: &[(String, bool)],
) {
    if sort.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for (field, descending) in sort {
            let left = field_value(a, field).unwrap_or(&Value::Null);
            let right = field_value(b, field).unwrap_or(&Value::Null);
            let ordering = collate(left, right);
            let ordering = if *descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Keeps only the requested fields (dot paths are kept at top level).
pub(crate) fn project(
    doc: &Value,
    fields: &[String],
) -> Value {
    let mut projected = Map::new();
    for field in fields {
        if let Some(value) = field_value(doc, field) {
            projected.insert(field.clone(), value.clone());
        }
    }
    Value::Object(projected)
}

/// Field names referenced at the top level of a selector
pub(crate) fn selector_fields(selector: &Value) -> Vec<String> {
    selector
        .as_object()
        .map(|map| map.keys().filter(|k| !k.starts_with('$')).cloned().collect())
        .unwrap_or_default()
}

/// Reads a non-negative integer option.
pub(crate) fn usize_option(
    options: &Map<String, Value>,
    key: &str,
) -> Result<Option<usize>, EngineError> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| EngineError::bad_request(format!("{} must be a non-negative integer", key))),
    }
}

pub(crate) fn bool_option(
    options: &Map<String, Value>,
    key: &str,
    default: bool,
) -> bool {
    options.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Applies `skip` then `limit`.
pub(crate) fn paginate<T>(
    items: Vec<T>,
    skip: Option<usize>,
    limit: Option<usize>,
) -> Vec<T> {
    items
        .into_iter()
        .skip(skip.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}
