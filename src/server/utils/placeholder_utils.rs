use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

// templated cdn host aliases look like {v1}, {v12}
static TEMPLATE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{v\d+\}").expect("static token regex should compile"));

/// literal substitution of every known token in one left to right pass. values are inserted as
/// is and never rescanned, unknown tokens are left alone so the navigator's validator can decide
/// what to do with them
pub fn resolve(decoded: &str, table: &HashMap<String, String>) -> String {
    TEMPLATE_TOKEN
        .replace_all(decoded, |caps: &Captures| {
            let token = &caps[0];
            table.get(token).cloned().unwrap_or_else(|| token.to_string())
        })
        .into_owned()
}

/// template tokens still present after resolution
pub fn unresolved_tokens(value: &str) -> Vec<String> {
    TEMPLATE_TOKEN
        .find_iter(value)
        .map(|m| m.as_str().to_string())
        .collect()
}
