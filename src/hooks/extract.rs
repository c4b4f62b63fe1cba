//! Parameter extraction from free-form host params.
//!
//! Closed keyword tables scanned in order, with a shape heuristic as the
//! fallback. This is the only place duck-typed host params are interpreted.

use std::collections::BTreeMap;

use serde_json::Value;

const COMMAND_KEYS: &[&str] = &[
    "command",
    "cmd",
    "script",
    "shell_command",
    "exec",
    "shell",
    "bash_command",
    "run",
    "execute",
    "sh",
];

const PATH_KEYS: &[&str] = &[
    "file_path",
    "filePath",
    "path",
    "filename",
    "file",
    "target_path",
    "source_path",
    "dest",
    "destination",
    "src",
    "target",
    "filepath",
];

const URL_KEYS: &[&str] = &[
    "url",
    "uri",
    "href",
    "endpoint",
    "target_url",
    "link",
    "address",
    "remote",
    "server",
];

fn by_keys(params: &BTreeMap<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(Value::String(s)) = params.get(*key) {
            if !s.is_empty() {
                return Some(s.clone());
            }
        }
    }
    None
}

fn first_string_where(
    params: &BTreeMap<String, Value>,
    predicate: impl Fn(&str) -> bool,
) -> Option<String> {
    params.values().find_map(|v| match v {
        Value::String(s) if predicate(s) => Some(s.clone()),
        _ => None,
    })
}

/// Command-like value: known keys, else the first string that looks like
/// shell (pipes, redirects, separators, substitution).
pub fn command(params: &BTreeMap<String, Value>) -> Option<String> {
    by_keys(params, COMMAND_KEYS).or_else(|| {
        first_string_where(params, |s| {
            s.contains('|')
                || s.contains('>')
                || s.contains('<')
                || s.contains(';')
                || s.contains('`')
                || s.contains("$(")
        })
    })
}

/// Path-like value: known keys, else the first string starting with `/` or
/// `~`.
pub fn path(params: &BTreeMap<String, Value>) -> Option<String> {
    by_keys(params, PATH_KEYS)
        .or_else(|| first_string_where(params, |s| s.starts_with('/') || s.starts_with('~')))
}

/// URL-like value: known keys, else the first http(s) string.
pub fn url(params: &BTreeMap<String, Value>) -> Option<String> {
    by_keys(params, URL_KEYS).or_else(|| {
        first_string_where(params, |s| {
            s.starts_with("http://") || s.starts_with("https://")
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn known_keys_win_in_table_order() {
        let p = params(&[("cmd", "ls"), ("command", "rm -rf /")]);
        // "command" precedes "cmd" in the table regardless of map order.
        assert_eq!(command(&p).as_deref(), Some("rm -rf /"));
    }

    #[test]
    fn command_fallback_needs_shell_shape() {
        let p = params(&[("note", "hello world")]);
        assert_eq!(command(&p), None);

        let p = params(&[("note", "cat a | sort")]);
        assert_eq!(command(&p).as_deref(), Some("cat a | sort"));

        let p = params(&[("note", "echo $(whoami)")]);
        assert_eq!(command(&p).as_deref(), Some("echo $(whoami)"));
    }

    #[test]
    fn path_keys_and_fallback() {
        let p = params(&[("filePath", "/etc/passwd")]);
        assert_eq!(path(&p).as_deref(), Some("/etc/passwd"));

        let p = params(&[("whatever", "~/notes.txt")]);
        assert_eq!(path(&p).as_deref(), Some("~/notes.txt"));

        let p = params(&[("whatever", "notes.txt")]);
        assert_eq!(path(&p), None);
    }

    #[test]
    fn url_keys_and_fallback() {
        let p = params(&[("endpoint", "https://api.example.com")]);
        assert_eq!(url(&p).as_deref(), Some("https://api.example.com"));

        let p = params(&[("x", "http://example.com/a")]);
        assert_eq!(url(&p).as_deref(), Some("http://example.com/a"));

        let p = params(&[("x", "ftp://example.com/a")]);
        assert_eq!(url(&p), None);
    }

    #[test]
    fn non_string_values_are_ignored() {
        let mut p = BTreeMap::new();
        p.insert("command".to_string(), Value::Number(5.into()));
        p.insert("url".to_string(), Value::Bool(true));
        assert_eq!(command(&p), None);
        assert_eq!(url(&p), None);
    }

    #[test]
    fn empty_strings_do_not_match_keys() {
        let p = params(&[("command", ""), ("cmd", "ls")]);
        assert_eq!(command(&p).as_deref(), Some("ls"));
    }
}
