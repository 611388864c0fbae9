//! Environment variable interpolation and env-file loading.
//!
//! Expands `${NAME:-default}`, `${NAME}`, and `$NAME` inside scalar strings
//! against a supplied environment. Expansion is a single left-to-right pass:
//! substituted text is never re-expanded.

use crate::error::{CompoteError, Result};
use std::collections::BTreeMap;
use std::path::Path;

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Interpolate variable references in `input` against `env`.
///
/// Unset variables expand to the empty string; `${NAME:-default}` falls back
/// to the literal default (which may contain any character except `}`).
/// Malformed references (unterminated `${`, invalid name) are copied through
/// verbatim.
pub fn interpolate(input: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(stripped) = after.strip_prefix('{') {
            if let Some(end) = stripped.find('}') {
                if let Some(value) = expand_braced(&stripped[..end], env) {
                    out.push_str(&value);
                    rest = &stripped[end + 1..];
                    continue;
                }
            }
            out.push('$');
            rest = after;
        } else {
            let mut len = 0;
            for (i, c) in after.char_indices() {
                let ok = if i == 0 { is_ident_start(c) } else { is_ident_char(c) };
                if !ok {
                    break;
                }
                len = i + c.len_utf8();
            }

            if len == 0 {
                out.push('$');
                rest = after;
            } else {
                out.push_str(env.get(&after[..len]).map(String::as_str).unwrap_or(""));
                rest = &after[len..];
            }
        }
    }

    out.push_str(rest);
    out
}

/// Expand the body of a `${...}` reference. Returns `None` when the body is
/// not a valid reference, in which case the caller emits the text verbatim.
fn expand_braced(body: &str, env: &BTreeMap<String, String>) -> Option<String> {
    let (name, default) = match body.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (body, None),
    };

    let mut chars = name.chars();
    let first = chars.next()?;
    if !is_ident_start(first) || !chars.all(is_ident_char) {
        return None;
    }

    Some(match env.get(name) {
        Some(value) => value.clone(),
        None => default.unwrap_or("").to_string(),
    })
}

/// Load a `KEY=VALUE` env file. Blank lines and `#` comments are skipped;
/// surrounding single or double quotes on the value are stripped.
pub fn load_env_file(path: impl AsRef<Path>) -> Result<BTreeMap<String, String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| CompoteError::FileRead {
        path: path.to_string_lossy().to_string(),
        source: e,
    })?;

    parse_env_file(&content, &path.to_string_lossy())
}

/// Parse env-file content. `name` is used for error reporting only.
pub fn parse_env_file(content: &str, name: &str) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| CompoteError::EnvFileParse {
            file: name.to_string(),
            line: lineno + 1,
            reason: "expected KEY=VALUE".to_string(),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(CompoteError::EnvFileParse {
                file: name.to_string(),
                line: lineno + 1,
                reason: "empty key".to_string(),
            });
        }

        vars.insert(key.to_string(), strip_quotes(value.trim()).to_string());
    }

    Ok(vars)
}

fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Merge environment layers; later layers override earlier ones.
pub fn merge(layers: &[BTreeMap<String, String>]) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for layer in layers {
        merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

/// Snapshot of the calling process environment, for manifest interpolation.
pub fn process_env() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_braced_with_default() {
        let vars = env(&[]);
        assert_eq!(interpolate("${X:-D}", &vars), "D");

        let vars = env(&[("X", "set")]);
        assert_eq!(interpolate("${X:-D}", &vars), "set");
    }

    #[test]
    fn test_braced_without_default() {
        let vars = env(&[("HOST", "db")]);
        assert_eq!(interpolate("tcp://${HOST}:5432", &vars), "tcp://db:5432");
        assert_eq!(interpolate("${MISSING}", &vars), "");
    }

    #[test]
    fn test_bare_reference() {
        let vars = env(&[("USER", "amy")]);
        assert_eq!(interpolate("hello $USER!", &vars), "hello amy!");
        assert_eq!(interpolate("$UNSET", &vars), "");
    }

    #[test]
    fn test_no_reexpansion() {
        // A substituted value containing `$FOO` is emitted literally.
        let vars = env(&[("A", "$B"), ("B", "deep")]);
        assert_eq!(interpolate("$A", &vars), "$B");
    }

    #[test]
    fn test_idempotent_when_value_is_plain() {
        let vars = env(&[("X", "plain")]);
        let once = interpolate("$X", &vars);
        assert_eq!(interpolate(&once, &vars), once);
    }

    #[test]
    fn test_default_may_contain_specials() {
        let vars = env(&[]);
        assert_eq!(interpolate("${X:-a:b/c d}", &vars), "a:b/c d");
    }

    #[test]
    fn test_malformed_copied_verbatim() {
        let vars = env(&[("X", "v")]);
        assert_eq!(interpolate("${", &vars), "${");
        assert_eq!(interpolate("${1bad}", &vars), "${1bad}");
        assert_eq!(interpolate("$ {X}", &vars), "$ {X}");
        assert_eq!(interpolate("100$", &vars), "100$");
    }

    #[test]
    fn test_parse_env_file() {
        let content = r#"
            # database settings
            DB_HOST=localhost
            DB_PORT=5432
            DB_NAME="app db"
            DB_PASS='s3cret'

            EMPTY=
        "#;
        let vars = parse_env_file(content, "test.env").unwrap();
        assert_eq!(vars.get("DB_HOST"), Some(&"localhost".to_string()));
        assert_eq!(vars.get("DB_PORT"), Some(&"5432".to_string()));
        assert_eq!(vars.get("DB_NAME"), Some(&"app db".to_string()));
        assert_eq!(vars.get("DB_PASS"), Some(&"s3cret".to_string()));
        assert_eq!(vars.get("EMPTY"), Some(&"".to_string()));
    }

    #[test]
    fn test_parse_env_file_reports_line() {
        let content = "GOOD=1\nnot a pair\n";
        let err = parse_env_file(content, "bad.env").unwrap_err();
        match err {
            CompoteError::EnvFileParse { file, line, .. } => {
                assert_eq!(file, "bad.env");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_merge_later_wins() {
        let base = env(&[("A", "1"), ("B", "1")]);
        let over = env(&[("B", "2"), ("C", "2")]);
        let merged = merge(&[base, over]);
        assert_eq!(merged.get("A"), Some(&"1".to_string()));
        assert_eq!(merged.get("B"), Some(&"2".to_string()));
        assert_eq!(merged.get("C"), Some(&"2".to_string()));
    }
}
