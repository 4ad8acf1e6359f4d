//! Leaf matchers shared by the simple target types and the compound engine.

use globset::{Glob, GlobBuilder, GlobMatcher};
use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::error::TargetResolutionError;

pub(crate) const DEFAULT_DELIMITER: char = ':';

pub(crate) fn compile_glob(expr: &str) -> Result<GlobMatcher, TargetResolutionError> {
    Glob::new(expr)
        .map(|g| g.compile_matcher())
        .map_err(|e| TargetResolutionError::InvalidGlob {
            expr: expr.to_string(),
            reason: e.to_string(),
        })
}

/// Compiles a regex anchored at the start of the subject.
pub(crate) fn compile_pcre(expr: &str) -> Result<Regex, TargetResolutionError> {
    build_pcre(expr, false)
}

fn build_pcre(expr: &str, case_insensitive: bool) -> Result<Regex, TargetResolutionError> {
    RegexBuilder::new(&format!("^(?:{expr})"))
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| TargetResolutionError::InvalidRegex {
            expr: expr.to_string(),
            reason: e.to_string(),
        })
}

fn build_leaf_glob(expr: &str) -> Result<GlobMatcher, TargetResolutionError> {
    GlobBuilder::new(expr)
        .case_insensitive(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| TargetResolutionError::InvalidGlob {
            expr: expr.to_string(),
            reason: e.to_string(),
        })
}

/// How the leaf of a `key:sub:pattern` expression is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafMode {
    Glob,
    Pcre,
}

/// Matches `expr` (`key<delim>sub<delim>pattern`) against a grains or pillar
/// document. Every split point is tried so patterns may contain the delimiter.
/// Leaf values are compared case-insensitively; keys in the path are not.
pub(crate) fn match_data(
    data: &Value,
    expr: &str,
    delimiter: char,
    mode: LeafMode,
) -> Result<bool, TargetResolutionError> {
    let parts: Vec<&str> = expr.split(delimiter).collect();
    if parts.len() < 2 {
        return Ok(false);
    }

    for split in (1..parts.len()).rev() {
        let path = &parts[..split];
        let pattern = parts[split..].join(&delimiter.to_string());
        for leaf in traverse(data, path) {
            if match_leaf(leaf, &pattern, mode)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Every value reachable through `path`. Lists fan out over their mapping elements.
fn traverse<'a>(data: &'a Value, path: &[&str]) -> Vec<&'a Value> {
    let Some((key, rest)) = path.split_first() else {
        return vec![data];
    };
    match data {
        Value::Object(map) => map
            .get(*key)
            .map(|next| traverse(next, rest))
            .unwrap_or_default(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_object().and_then(|m| m.get(*key)))
            .flat_map(|next| traverse(next, rest))
            .collect(),
        _ => Vec::new(),
    }
}

fn match_leaf(leaf: &Value, pattern: &str, mode: LeafMode) -> Result<bool, TargetResolutionError> {
    match leaf {
        Value::Array(items) => {
            for item in items {
                if match_leaf(item, pattern, mode)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Object(map) => {
            for key in map.keys() {
                if match_str(key, pattern, mode)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::String(s) => match_str(s, pattern, mode),
        Value::Null => Ok(false),
        other => match_str(&other.to_string(), pattern, mode),
    }
}

fn match_str(subject: &str, pattern: &str, mode: LeafMode) -> Result<bool, TargetResolutionError> {
    match mode {
        LeafMode::Glob => Ok(build_leaf_glob(pattern)?.is_match(subject)),
        LeafMode::Pcre => Ok(build_pcre(pattern, true)?.is_match(subject)),
    }
}
