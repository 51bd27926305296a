//! Aggregation pipeline evaluation for the query endpoints
//!
//! A reduced, in-process rendition of the aggregation stages the API
//! accepts. Stage names outside the whitelist are rejected before
//! evaluation.

use serde_json::{json, Map, Value};

/// Stages a query pipeline may contain.
pub const ALLOWED_STAGES: [&str; 11] = [
    "$match",
    "$project",
    "$limit",
    "$skip",
    "$count",
    "$sort",
    "$unwind",
    "$group",
    "$sample",
    "$replaceRoot",
    "$addFields",
];

/// Run a pipeline over a collection snapshot.
pub fn run_pipeline(mut docs: Vec<Value>, pipeline: &[Value]) -> Result<Vec<Value>, String> {
    for stage in pipeline {
        let Some(object) = stage.as_object() else {
            return Err("pipeline stage must be an object".to_string());
        };
        let (name, spec) = match object.iter().next() {
            Some(entry) if object.len() == 1 => entry,
            _ => return Err("pipeline stage must hold exactly one operator".to_string()),
        };

        if !ALLOWED_STAGES.contains(&name.as_str()) {
            return Err(format!("pipeline stage {} not allowed", name));
        }

        docs = match name.as_str() {
            "$match" => apply_match(docs, spec)?,
            "$project" => apply_project(docs, spec)?,
            "$limit" => apply_limit(docs, spec)?,
            "$skip" => apply_skip(docs, spec)?,
            "$count" => apply_count(docs, spec)?,
            "$sort" => apply_sort(docs, spec)?,
            "$unwind" => apply_unwind(docs, spec)?,
            "$group" => apply_group(docs, spec)?,
            "$sample" => apply_sample(docs, spec)?,
            "$replaceRoot" => apply_replace_root(docs, spec)?,
            "$addFields" => apply_add_fields(docs, spec)?,
            other => return Err(format!("pipeline stage {} not supported", other)),
        };
    }
    Ok(docs)
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn apply_match(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>, String> {
    let conditions = spec
        .as_object()
        .ok_or_else(|| "$match requires an object".to_string())?;
    Ok(docs
        .into_iter()
        .filter(|doc| conditions.iter().all(|(path, cond)| matches(doc, path, cond)))
        .collect())
}

fn matches(doc: &Value, path: &str, cond: &Value) -> bool {
    let found = lookup(doc, path);

    if let Some(operators) = cond.as_object() {
        if operators.keys().any(|key| key.starts_with('$')) {
            return operators.iter().all(|(op, operand)| {
                let found = found.unwrap_or(&Value::Null);
                match op.as_str() {
                    "$eq" => found == operand,
                    "$ne" => found != operand,
                    "$lt" => compare(found, operand) == Some(std::cmp::Ordering::Less),
                    "$lte" => matches!(
                        compare(found, operand),
                        Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                    ),
                    "$gt" => compare(found, operand) == Some(std::cmp::Ordering::Greater),
                    "$gte" => matches!(
                        compare(found, operand),
                        Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                    ),
                    "$in" => operand
                        .as_array()
                        .map(|values| values.contains(found))
                        .unwrap_or(false),
                    "$nin" => operand
                        .as_array()
                        .map(|values| !values.contains(found))
                        .unwrap_or(false),
                    _ => false,
                }
            });
        }
    }

    // Arrays match like mongo: equality against the array or any element
    match found {
        Some(Value::Array(items)) => items.contains(cond) || Some(cond) == found,
        Some(value) => value == cond,
        None => cond.is_null(),
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn apply_project(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>, String> {
    let fields = spec
        .as_object()
        .ok_or_else(|| "$project requires an object".to_string())?;

    let including = fields
        .iter()
        .any(|(path, flag)| path != "_id" && truthy(flag));

    Ok(docs
        .into_iter()
        .map(|doc| {
            let Some(object) = doc.as_object() else {
                return doc;
            };
            let mut result = Map::new();
            if including {
                if fields.get("_id").map(truthy).unwrap_or(true) {
                    if let Some(id) = object.get("_id") {
                        result.insert("_id".to_string(), id.clone());
                    }
                }
                for (path, flag) in fields {
                    if truthy(flag) {
                        if let Some(value) = object.get(path) {
                            result.insert(path.clone(), value.clone());
                        }
                    }
                }
            } else {
                result = object.clone();
                for (path, flag) in fields {
                    if !truthy(flag) {
                        result.remove(path);
                    }
                }
            }
            Value::Object(result)
        })
        .collect())
}

fn truthy(flag: &Value) -> bool {
    match flag {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        _ => false,
    }
}

fn apply_limit(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>, String> {
    let limit = spec
        .as_u64()
        .ok_or_else(|| "$limit requires a number".to_string())? as usize;
    Ok(docs.into_iter().take(limit).collect())
}

fn apply_skip(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>, String> {
    let skip = spec
        .as_u64()
        .ok_or_else(|| "$skip requires a number".to_string())? as usize;
    Ok(docs.into_iter().skip(skip).collect())
}

fn apply_count(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>, String> {
    let name = spec
        .as_str()
        .ok_or_else(|| "$count requires a field name".to_string())?;
    Ok(vec![json!({ name: docs.len() })])
}

fn apply_sort(mut docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>, String> {
    let keys = spec
        .as_object()
        .ok_or_else(|| "$sort requires an object".to_string())?;

    for (path, direction) in keys.iter().rev() {
        let descending = direction.as_i64().unwrap_or(1) < 0;
        docs.sort_by(|a, b| {
            let av = lookup(a, path).unwrap_or(&Value::Null);
            let bv = lookup(b, path).unwrap_or(&Value::Null);
            let ordering = compare(av, bv).unwrap_or(std::cmp::Ordering::Equal);
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }
    Ok(docs)
}

fn apply_unwind(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>, String> {
    let path = spec
        .as_str()
        .ok_or_else(|| "$unwind requires a field path".to_string())?
        .trim_start_matches('$');

    let mut result = Vec::new();
    for doc in docs {
        match lookup(&doc, path).cloned() {
            Some(Value::Array(items)) => {
                for item in items {
                    let mut expanded = doc.clone();
                    if let Some(object) = expanded.as_object_mut() {
                        object.insert(path.to_string(), item);
                    }
                    result.push(expanded);
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => result.push(doc),
        }
    }
    Ok(result)
}

/// `"$path"` strings dereference into the document, everything else is a
/// literal.
fn resolve_expression(doc: &Value, expr: &Value) -> Value {
    match expr.as_str() {
        Some(reference) if reference.starts_with('$') => {
            lookup(doc, &reference[1..]).cloned().unwrap_or(Value::Null)
        }
        _ => expr.clone(),
    }
}

fn apply_group(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>, String> {
    let fields = spec
        .as_object()
        .ok_or_else(|| "$group requires an object".to_string())?;
    let id_expr = fields
        .get("_id")
        .ok_or_else(|| "$group requires an _id expression".to_string())?;

    // Buckets keep first-seen order so the output is deterministic
    let mut keys: Vec<String> = Vec::new();
    let mut buckets: std::collections::HashMap<String, (Value, Vec<Value>)> =
        std::collections::HashMap::new();

    for doc in docs {
        let id = resolve_expression(&doc, id_expr);
        let key = id.to_string();
        buckets
            .entry(key.clone())
            .or_insert_with(|| {
                keys.push(key);
                (id, Vec::new())
            })
            .1
            .push(doc);
    }

    let mut result = Vec::with_capacity(keys.len());
    for key in keys {
        let Some((id, members)) = buckets.remove(&key) else {
            continue;
        };
        let mut object = Map::new();
        object.insert("_id".to_string(), id);
        for (name, accumulator) in fields {
            if name == "_id" {
                continue;
            }
            object.insert(name.clone(), accumulate(&members, accumulator)?);
        }
        result.push(Value::Object(object));
    }
    Ok(result)
}

fn accumulate(members: &[Value], accumulator: &Value) -> Result<Value, String> {
    let object = accumulator
        .as_object()
        .ok_or_else(|| "accumulator must be an object".to_string())?;
    let (op, operand) = match object.iter().next() {
        Some(entry) if object.len() == 1 => entry,
        _ => return Err("accumulator must hold exactly one operator".to_string()),
    };

    let resolved = || members.iter().map(|doc| resolve_expression(doc, operand));

    match op.as_str() {
        "$sum" => {
            let total: f64 = resolved().filter_map(|value| value.as_f64()).sum();
            Ok(number(total))
        }
        "$avg" => {
            let values: Vec<f64> = resolved().filter_map(|value| value.as_f64()).collect();
            if values.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(number(values.iter().sum::<f64>() / values.len() as f64))
            }
        }
        "$min" => Ok(fold_by_order(resolved(), std::cmp::Ordering::Less)),
        "$max" => Ok(fold_by_order(resolved(), std::cmp::Ordering::Greater)),
        "$first" => Ok(resolved().next().unwrap_or(Value::Null)),
        "$last" => Ok(resolved().last().unwrap_or(Value::Null)),
        "$push" => Ok(Value::Array(resolved().collect())),
        other => Err(format!("group accumulator {} not supported", other)),
    }
}

fn fold_by_order(values: impl Iterator<Item = Value>, keep: std::cmp::Ordering) -> Value {
    let mut best: Option<Value> = None;
    for value in values {
        if value.is_null() {
            continue;
        }
        match &best {
            None => best = Some(value),
            Some(current) => {
                if compare(&value, current) == Some(keep) {
                    best = Some(value);
                }
            }
        }
    }
    best.unwrap_or(Value::Null)
}

/// Keep whole results as integers, like the store's aggregation would.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

fn apply_sample(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>, String> {
    let size = spec
        .get("size")
        .and_then(Value::as_u64)
        .ok_or_else(|| "$sample requires a size".to_string())? as usize;
    Ok(docs.into_iter().take(size).collect())
}

fn apply_replace_root(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>, String> {
    let path = spec
        .get("newRoot")
        .and_then(Value::as_str)
        .ok_or_else(|| "$replaceRoot requires a newRoot path".to_string())?
        .trim_start_matches('$');

    Ok(docs
        .into_iter()
        .filter_map(|doc| lookup(&doc, path).cloned())
        .collect())
}

fn apply_add_fields(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>, String> {
    let fields = spec
        .as_object()
        .ok_or_else(|| "$addFields requires an object".to_string())?;

    Ok(docs
        .into_iter()
        .map(|mut doc| {
            let resolved: Vec<(String, Value)> = fields
                .iter()
                .map(|(path, value)| (path.clone(), resolve_expression(&doc, value)))
                .collect();
            if let Some(object) = doc.as_object_mut() {
                for (path, value) in resolved {
                    object.insert(path, value);
                }
            }
            doc
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs() -> Vec<Value> {
        vec![
            json!({"_id": "a", "state": 1, "username": "alice", "tags": ["x", "y"]}),
            json!({"_id": "b", "state": 4, "username": "bob", "tags": []}),
            json!({"_id": "c", "state": 3, "username": "alice", "tags": ["y"]}),
        ]
    }

    #[test]
    fn test_match_equality_and_operators() {
        let result = run_pipeline(docs(), &[json!({"$match": {"username": "alice"}})]).unwrap();
        assert_eq!(result.len(), 2);

        let result =
            run_pipeline(docs(), &[json!({"$match": {"state": {"$in": [3, 4]}}})]).unwrap();
        assert_eq!(result.len(), 2);

        let result = run_pipeline(docs(), &[json!({"$match": {"state": {"$gte": 4}}})]).unwrap();
        assert_eq!(result[0]["_id"], "b");
    }

    #[test]
    fn test_match_array_contains() {
        let result = run_pipeline(docs(), &[json!({"$match": {"tags": "y"}})]).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_sort_skip_limit() {
        let result = run_pipeline(
            docs(),
            &[
                json!({"$sort": {"state": -1}}),
                json!({"$skip": 1}),
                json!({"$limit": 1}),
            ],
        )
        .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0]["state"], 3);
    }

    #[test]
    fn test_project_inclusion() {
        let result = run_pipeline(docs(), &[json!({"$project": {"username": 1}})]).unwrap();
        assert_eq!(result[0], json!({"_id": "a", "username": "alice"}));
    }

    #[test]
    fn test_project_exclusion() {
        let result = run_pipeline(docs(), &[json!({"$project": {"tags": 0, "state": 0}})]).unwrap();
        assert_eq!(result[0], json!({"_id": "a", "username": "alice"}));
    }

    #[test]
    fn test_count() {
        let result = run_pipeline(docs(), &[json!({"$count": "total"})]).unwrap();
        assert_eq!(result, vec![json!({"total": 3})]);
    }

    #[test]
    fn test_unwind() {
        let result = run_pipeline(docs(), &[json!({"$unwind": "$tags"})]).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0]["tags"], "x");
    }

    #[test]
    fn test_group_by_field_with_accumulators() {
        let result = run_pipeline(
            docs(),
            &[json!({"$group": {
                "_id": "$username",
                "count": {"$sum": 1},
                "max_state": {"$max": "$state"},
                "ids": {"$push": "$_id"},
            }})],
        )
        .unwrap();

        assert_eq!(result.len(), 2);
        let alice = result.iter().find(|doc| doc["_id"] == "alice").unwrap();
        assert_eq!(alice["count"], 2);
        assert_eq!(alice["max_state"], 3);
        assert_eq!(alice["ids"], json!(["a", "c"]));
        let bob = result.iter().find(|doc| doc["_id"] == "bob").unwrap();
        assert_eq!(bob["count"], 1);
        assert_eq!(bob["max_state"], 4);
    }

    #[test]
    fn test_group_null_id_aggregates_everything() {
        let result = run_pipeline(
            docs(),
            &[json!({"$group": {
                "_id": null,
                "total": {"$sum": "$state"},
                "mean": {"$avg": "$state"},
                "lowest": {"$min": "$state"},
                "first": {"$first": "$_id"},
                "last": {"$last": "$_id"},
            }})],
        )
        .unwrap();

        assert_eq!(result.len(), 1);
        assert!(result[0]["_id"].is_null());
        assert_eq!(result[0]["total"], 8);
        assert!((result[0]["mean"].as_f64().unwrap() - 8.0 / 3.0).abs() < 1e-9);
        assert_eq!(result[0]["lowest"], 1);
        assert_eq!(result[0]["first"], "a");
        assert_eq!(result[0]["last"], "c");
    }

    #[test]
    fn test_group_requires_id() {
        let err = run_pipeline(docs(), &[json!({"$group": {"count": {"$sum": 1}}})]).unwrap_err();
        assert!(err.contains("_id"));
    }

    #[test]
    fn test_rejects_unknown_stage() {
        let err = run_pipeline(docs(), &[json!({"$merge": {}})]).unwrap_err();
        assert!(err.contains("$merge"));
    }
}
