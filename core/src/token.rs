//! Token extraction and substitution for `${NAME}`-style placeholders.
//!
//! Placeholder names are restricted to `[A-Z_]+`. Substitution is pure and
//! deterministic: given the same string, allowed set, and dictionary it
//! always produces the same output or the same error.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ShinyError;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([A-Z_]+)\}").unwrap());

/// Returns every placeholder name referenced in `s`, deduplicated.
pub fn extract_tokens(s: &str) -> HashSet<String> {
    TOKEN_RE
        .captures_iter(s)
        .map(|cap| cap[1].to_string())
        .collect()
}

/// Substitutes every `${NAME}` in `s` with `dict[NAME]`.
///
/// Fails if `s` references a name outside `allowed`, or a name with no entry
/// in `dict` (even if it is itself allowed).
pub fn substitute(
    s: &str,
    allowed: &HashSet<&str>,
    dict: &HashMap<String, String>,
) -> Result<String, ShinyError> {
    let found = extract_tokens(s);

    let disallowed: Vec<&str> = found
        .iter()
        .map(String::as_str)
        .filter(|name| !allowed.contains(name))
        .collect();
    if !disallowed.is_empty() {
        return Err(ShinyError::Token(format!(
            "placeholder(s) not allowed here: {}",
            disallowed.join(", ")
        )));
    }

    let missing: Vec<&str> = found
        .iter()
        .map(String::as_str)
        .filter(|name| !dict.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        return Err(ShinyError::Token(format!(
            "no value bound for placeholder(s): {}",
            missing.join(", ")
        )));
    }

    Ok(TOKEN_RE
        .replace_all(s, |cap: &regex::Captures| dict[&cap[1]].clone())
        .into_owned())
}
