//! System-prompt template rendering.
//!
//! Templates interpolate `${path}` placeholders from the effective context.
//! Dotted paths walk nested objects. Unresolved placeholders are left
//! verbatim so a typo is visible in the prompt rather than silently blank.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Does this template contain rendering directives?
///
/// Both interpolation (`${…}`) and block-directive (`<#…>`) markers count;
/// a template without either is used as a literal system prompt.
pub fn contains_directives(template: &str) -> bool {
    template.contains("${") || template.contains("<#")
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_.]+)\}").expect("valid placeholder regex"))
}

/// Render a template against a context map.
pub fn render(template: &str, context: &Map<String, Value>) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let path = &caps[1];
            match lookup(context, path) {
                Some(value) => value_to_string(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Walk a dotted path into the context.
fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = context.get(first)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Stringify a context value for interpolation.
///
/// Strings render bare; everything else renders as JSON.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
