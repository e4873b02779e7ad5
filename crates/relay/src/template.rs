//! Template pre-pass for stage documents.
//!
//! Documents may reference the process configuration with
//! `{{ config.some.key }}` before they are parsed. Lookups are lenient:
//! an unknown variable renders as the empty string. Strings render raw,
//! other scalars with their JSON text, objects and arrays as compact JSON.

use crate::error::{RelayError, Result};
use regex::Regex;
use serde_json::Value as Json;
use std::sync::LazyLock;
use tracing::error;

/// Root variable exposing the process configuration.
pub const CONFIG_VAR: &str = "config";

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
        .expect("valid regex")
});

/// Renders `body` against `config`.
///
/// # Errors
///
/// [`RelayError::Template`] when an opening `{{` is not a well-formed
/// variable expression.
pub fn render(name: &str, body: &str, config: &Json) -> Result<String> {
    let rendered = EXPRESSION.replace_all(body, |caps: &regex::Captures<'_>| {
        lookup(config, &caps[1]).unwrap_or_default()
    });

    if let Some(pos) = find_unrendered(body) {
        let message = format!("malformed expression at byte {pos}");
        error!(document = %name, %message, "template rendering failed");
        return Err(RelayError::Template {
            name: name.to_string(),
            message,
        });
    }
    Ok(rendered.into_owned())
}

fn lookup(config: &Json, expression: &str) -> Option<String> {
    let mut parts = expression.split('.');
    if parts.next() != Some(CONFIG_VAR) {
        return None;
    }
    let value = parts.try_fold(config, |node, key| match node {
        Json::Object(map) => map.get(key),
        Json::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })?;
    match value {
        Json::Null => None,
        Json::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Position of the first `{{` not starting a valid expression.
fn find_unrendered(body: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(found) = body[offset..].find("{{") {
        let start = offset + found;
        match EXPRESSION.find_at(body, start) {
            Some(m) if m.start() == start => offset = m.end(),
            _ => return Some(start),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_nested_config_values() {
        let config = json!({"http": {"port": 8080, "host": "localhost"}, "tags": ["a", "b"]});
        let out = render(
            "doc",
            "port: {{ config.http.port }}\nhost: {{config.http.host}}\nfirst: {{ config.tags.0 }}",
            &config,
        )
        .unwrap();
        assert_eq!(out, "port: 8080\nhost: localhost\nfirst: a");
    }

    #[test]
    fn expression_pattern_compiles_and_captures_the_path() {
        let captures = EXPRESSION.captures("x {{ config.a-b.c_1 }} y").unwrap();
        assert_eq!(&captures[1], "config.a-b.c_1");
        assert!(!EXPRESSION.is_match("{{ .bad }}"));
    }

    #[test]
    fn unknown_variables_render_empty() {
        let out = render("doc", "a: '{{ config.missing.key }}' b: '{{ other }}'", &json!({})).unwrap();
        assert_eq!(out, "a: '' b: ''");
    }

    #[test]
    fn containers_render_as_json() {
        let out = render("doc", "{{ config.list }}", &json!({"list": [1, 2]})).unwrap();
        assert_eq!(out, "[1,2]");
    }

    #[test]
    fn malformed_expression_is_an_error() {
        let err = render("bad.yml", "x: {{ config.a ", &json!({})).unwrap_err();
        assert!(matches!(err, RelayError::Template { ref name, .. } if name == "bad.yml"));
    }

    #[test]
    fn plain_documents_pass_through() {
        let doc = "namespace: ns\ninstanceName: A\n";
        assert_eq!(render("doc", doc, &json!(null)).unwrap(), doc);
    }
}
