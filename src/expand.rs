//! `%(name)` placeholder expansion over parsed configuration trees
//!
//! Expansion is a pure transform over [`toml::Value`]:
//! - strings have every `%(identifier)` whose identifier is a known variable
//!   replaced with that variable's value; unknown placeholders stay verbatim
//! - tables first expand their own string entries with the incoming variables,
//!   layer those on top of the incoming set, then expand every entry with the
//!   merged set, so a field can refer to a sibling by name
//! - arrays expand each element with the incoming variables only

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use toml::Value;

/// Variable set used while expanding
pub type Vars = HashMap<String, String>;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%\((\w+)\)").expect("valid placeholder pattern"));

/// Expand placeholders in a single string
pub fn expand_str(text: &str, vars: &Vars) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Expand placeholders throughout a configuration tree
pub fn expand(value: &Value, vars: &Vars) -> Value {
    match value {
        Value::String(s) => Value::String(expand_str(s, vars)),
        Value::Table(table) => Value::Table(expand_table(table, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| expand(v, vars)).collect()),
        other => other.clone(),
    }
}

/// Expand a table, returning the expanded entries
pub fn expand_table(table: &toml::Table, vars: &Vars) -> toml::Table {
    let mut merged = vars.clone();
    merged.extend(local_vars(table, vars));

    table
        .iter()
        .map(|(key, value)| (key.clone(), expand(value, &merged)))
        .collect()
}

/// String-valued entries of a table, expanded with `vars`.
///
/// These are the variables a table contributes to its own descendants.
pub fn local_vars(table: &toml::Table, vars: &Vars) -> Vars {
    table
        .iter()
        .filter_map(|(key, value)| {
            value
                .as_str()
                .map(|s| (key.clone(), expand_str(s, vars)))
        })
        .collect()
}
