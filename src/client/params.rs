use crate::db_types::{PlaceholderStyle, RowValue};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static NAMED_PARAM: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z_][A-Za-z0-9_]*)"));

fn named_param_regex() -> Result<&'static Regex, String> {
    NAMED_PARAM
        .as_ref()
        .map_err(|e| format!("Invalid parameter pattern: {}", e))
}

/// `@name` references in a source query, in order of appearance.
pub fn extract_parameters(query: &str) -> Result<Vec<String>, String> {
    let regex = named_param_regex()?;
    Ok(regex
        .captures_iter(query)
        .filter_map(|captures| captures.get(1))
        .map(|name| name.as_str().to_string())
        .collect())
}

/// Reads a command-line value as the narrowest matching scalar.
pub fn parse_param_value(raw: &str) -> RowValue {
    let trimmed = raw.trim();
    if let Ok(v) = trimmed.parse::<i64>() {
        return RowValue::Int(v);
    }
    if let Ok(v) = trimmed.parse::<f64>() {
        return RowValue::Float(v);
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => RowValue::Bool(true),
        "false" => RowValue::Bool(false),
        "null" => RowValue::Null,
        _ => RowValue::Text(raw.to_string()),
    }
}

/// Rewrites `@name` references into driver placeholders and returns the
/// values to bind, one per occurrence.
pub fn bind_named_parameters(
    query: &str,
    style: PlaceholderStyle,
    values: &HashMap<String, String>,
) -> Result<(String, Vec<RowValue>), String> {
    let regex = named_param_regex()?;
    let mut rewritten = String::with_capacity(query.len());
    let mut params = Vec::new();
    let mut last = 0;

    for captures in regex.captures_iter(query) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let raw = values
            .get(name.as_str())
            .ok_or_else(|| format!("No value given for query parameter '@{}'", name.as_str()))?;
        params.push(parse_param_value(raw));
        rewritten.push_str(&query[last..whole.start()]);
        rewritten.push_str(&style.placeholder(params.len()));
        last = whole.end();
    }
    rewritten.push_str(&query[last..]);

    Ok((rewritten, params))
}

/// Parses a `name=value` command-line pair.
pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("Expected name=value, got '{}'", raw))?;
    let key = key.trim().trim_start_matches('@');
    if key.is_empty() {
        return Err(format!("Parameter name is empty in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}
