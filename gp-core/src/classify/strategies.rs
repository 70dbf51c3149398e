//! Diagnostic document shapes
//!
//! Each strategy recognizes one known layout and returns the tests it found,
//! or None when the layout is absent or empty. They are tried in
//! [`STRATEGIES`] order and the first hit wins.

use serde_json::{Map, Value};
use std::collections::HashSet;

/// One result entry of a test, before classification
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub status: String,
    pub info: String,
    pub gpu_id: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawTest {
    pub name: String,
    pub entries: Vec<RawEntry>,
}

pub type Strategy = fn(&Value) -> Option<Vec<RawTest>>;

pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("commissioning_envelope", commissioning_envelope),
    ("dcgm_categories", dcgm_categories),
    ("flat_test_list", flat_test_list),
    ("generic_search", generic_search),
];

/// Info may be a string or a list of strings
pub fn info_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("; "),
        _ => String::new(),
    }
}

fn status_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn entry(obj: &Map<String, Value>) -> RawEntry {
    RawEntry {
        status: status_text(obj.get("status")),
        info: info_text(obj.get("info")),
        gpu_id: obj.get("gpu_id").cloned(),
    }
}

fn entries(results: &[Value]) -> Vec<RawEntry> {
    results.iter().filter_map(Value::as_object).map(entry).collect()
}

fn name_of<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

fn non_empty(tests: Vec<RawTest>) -> Option<Vec<RawTest>> {
    if tests.is_empty() {
        None
    } else {
        Some(tests)
    }
}

/// `dcgm_diagnostics.test_results[]` with `test` and `results[]`
pub fn commissioning_envelope(doc: &Value) -> Option<Vec<RawTest>> {
    let tests = doc.get("dcgm_diagnostics")?.get("test_results")?.as_array()?;
    non_empty(
        tests
            .iter()
            .filter_map(Value::as_object)
            .filter_map(|t| {
                let name = t.get("test")?.as_str()?;
                let results = t.get("results")?.as_array()?;
                Some(RawTest {
                    name: name.to_string(),
                    entries: entries(results),
                })
            })
            .collect(),
    )
}

/// `"DCGM GPU Diagnostic".test_categories[].tests[]` with `name` and `results[]`
pub fn dcgm_categories(doc: &Value) -> Option<Vec<RawTest>> {
    let categories = doc.get("DCGM GPU Diagnostic")?.get("test_categories")?.as_array()?;
    non_empty(
        categories
            .iter()
            .filter_map(|c| c.get("tests")?.as_array())
            .flatten()
            .filter_map(Value::as_object)
            .filter_map(|t| {
                let name = t.get("name")?.as_str()?;
                let results = t.get("results")?.as_array()?;
                Some(RawTest {
                    name: name.to_string(),
                    entries: entries(results),
                })
            })
            .collect(),
    )
}

/// Top-level `test_results[]` or `tests[]` items with `results[]` or one `status`
pub fn flat_test_list(doc: &Value) -> Option<Vec<RawTest>> {
    let list = doc
        .get("test_results")
        .and_then(Value::as_array)
        .or_else(|| doc.get("tests").and_then(Value::as_array))?;
    non_empty(
        list.iter()
            .filter_map(Value::as_object)
            .filter_map(|t| {
                let name = name_of(t, &["test", "name"])?;
                let entries = match t.get("results").and_then(Value::as_array) {
                    Some(results) => entries(results),
                    None if t.contains_key("status") => vec![entry(t)],
                    None => return None,
                };
                Some(RawTest {
                    name: name.to_string(),
                    entries,
                })
            })
            .collect(),
    )
}

fn is_result_list(value: &Value) -> Option<&Vec<Value>> {
    let results = value.as_array()?;
    let shaped = !results.is_empty()
        && results
            .iter()
            .all(|r| r.as_object().is_some_and(|o| o.contains_key("status")));
    shaped.then_some(results)
}

fn search(value: &Value, seen: &mut HashSet<String>, found: &mut Vec<RawTest>) {
    match value {
        Value::Object(obj) => {
            if let (Some(name), Some(results)) = (
                name_of(obj, &["name", "test"]),
                obj.get("results").and_then(is_result_list),
            ) {
                if seen.insert(name.to_string()) {
                    found.push(RawTest {
                        name: name.to_string(),
                        entries: entries(results),
                    });
                }
                return;
            }
            for child in obj.values() {
                search(child, seen, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                search(item, seen, found);
            }
        }
        _ => {}
    }
}

/// Any object with a string `name`/`test` and `results[]` of objects carrying `status`
pub fn generic_search(doc: &Value) -> Option<Vec<RawTest>> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    search(doc, &mut seen, &mut found);
    non_empty(found)
}

/// First strategy that recognizes the document
pub fn run_strategies(doc: &Value) -> Option<(&'static str, Vec<RawTest>)> {
    STRATEGIES
        .iter()
        .find_map(|(name, strategy)| strategy(doc).map(|tests| (*name, tests)))
}
