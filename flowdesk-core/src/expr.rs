//! Sequence-flow conditions and task assignment expressions.
//!
//! Supported condition forms:
//! - `${approved}`            truthiness of a variable
//! - `${!approved}`           negated truthiness
//! - `${form.days > 3}`       comparison against a literal (`== != > < >= <=`)
//!
//! Variable paths may descend into JSON objects with `.`. Literals are numbers,
//! `true`/`false`, `null` or single/double quoted strings.

use crate::types::Variables;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CompareOp {
    // Two-character operators first so `>=` is not read as `>`.
    const TOKENS: [(&'static str, CompareOp); 6] = [
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
    ];
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Truthy(String),
    Falsy(String),
    Compare {
        path: String,
        op: CompareOp,
        literal: Value,
    },
}

impl Condition {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let inner = strip_braces(raw)
            .ok_or_else(|| format!("condition must have the form ${{...}}: {}", raw.trim()))?;

        if let Some(rest) = inner.strip_prefix('!') {
            if !rest.starts_with('=') {
                let path = rest.trim();
                check_path(path)?;
                return Ok(Condition::Falsy(path.to_string()));
            }
        }

        let mut found: Option<(usize, &str, CompareOp)> = None;
        for (token, op) in CompareOp::TOKENS {
            if let Some(pos) = inner.find(token) {
                if found.map_or(true, |(p, _, _)| pos < p) {
                    found = Some((pos, token, op));
                }
            }
        }

        match found {
            None => {
                check_path(inner)?;
                Ok(Condition::Truthy(inner.to_string()))
            }
            Some((pos, token, op)) => {
                let path = inner[..pos].trim();
                check_path(path)?;
                let literal = parse_literal(inner[pos + token.len()..].trim())?;
                Ok(Condition::Compare {
                    path: path.to_string(),
                    op,
                    literal,
                })
            }
        }
    }

    pub fn evaluate(&self, vars: &Variables) -> bool {
        match self {
            Condition::Truthy(path) => lookup(vars, path).is_some_and(is_truthy),
            Condition::Falsy(path) => !lookup(vars, path).is_some_and(is_truthy),
            Condition::Compare { path, op, literal } => {
                let value = lookup(vars, path).unwrap_or(&Value::Null);
                compare(value, *op, literal)
            }
        }
    }
}

/// Resolve a task assignment attribute into a single user id.
///
/// `${initiator}` is the starting user; `${path}` reads a string variable;
/// anything else is taken literally.
pub fn resolve_assignee(raw: &str, vars: &Variables, initiator: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match strip_braces(raw) {
        Some("initiator") => Some(initiator.to_string()),
        Some(path) => match lookup(vars, path)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        },
        None => Some(raw.to_string()),
    }
}

/// Resolve a comma separated candidate list. A variable may hold a string or an
/// array of strings.
pub fn resolve_candidates(raw: &str, vars: &Variables, initiator: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match strip_braces(part) {
            Some(path) if path != "initiator" => match lookup(vars, path) {
                Some(Value::Array(items)) => {
                    out.extend(items.iter().filter_map(|v| v.as_str().map(str::to_string)))
                }
                Some(Value::String(s)) => out.push(s.clone()),
                _ => {}
            },
            _ => out.extend(resolve_assignee(part, vars, initiator)),
        }
    }
    out
}

fn strip_braces(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    raw.strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .map(str::trim)
}

fn check_path(path: &str) -> Result<(), String> {
    let valid = !path.is_empty()
        && path.split('.').all(|seg| {
            let mut chars = seg.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(format!("invalid variable reference '{}'", path))
    }
}

fn parse_literal(raw: &str) -> Result<Value, String> {
    match raw {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    for quote in ['\'', '"'] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
        }
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Ok(Value::from(n));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| format!("invalid literal '{}'", raw))
}

fn lookup<'a>(vars: &'a Variables, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = vars.get(segments.next()?)?;
    for seg in segments {
        current = current.as_object()?.get(seg)?;
    }
    Some(current)
}

fn is_truthy(val: &Value) -> bool {
    match val {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn compare(value: &Value, op: CompareOp, literal: &Value) -> bool {
    let ordering = match (value, literal) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
        // Form fields often arrive as strings.
        (Value::String(s), Value::Number(b)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    };
    match (op, ordering) {
        (CompareOp::Eq, o) => o == Some(Ordering::Equal),
        (CompareOp::Ne, o) => o != Some(Ordering::Equal),
        (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
        (CompareOp::Lt, Some(o)) => o == Ordering::Less,
        (CompareOp::Ge, Some(o)) => o != Ordering::Less,
        (CompareOp::Le, Some(o)) => o != Ordering::Greater,
        (_, None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(v: Value) -> Variables {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            Condition::parse("${approved}").unwrap(),
            Condition::Truthy("approved".into())
        );
        assert_eq!(
            Condition::parse(" ${ !approved } ").unwrap(),
            Condition::Falsy("approved".into())
        );
        assert_eq!(
            Condition::parse("${form.days >= 3}").unwrap(),
            Condition::Compare {
                path: "form.days".into(),
                op: CompareOp::Ge,
                literal: json!(3)
            }
        );
        assert_eq!(
            Condition::parse("${kind != 'vacation'}").unwrap(),
            Condition::Compare {
                path: "kind".into(),
                op: CompareOp::Ne,
                literal: json!("vacation")
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(Condition::parse("approved").is_err());
        assert!(Condition::parse("${}").is_err());
        assert!(Condition::parse("${days > three}").is_err());
        assert!(Condition::parse("${1days > 3}").is_err());
    }

    #[test]
    fn test_evaluate() {
        let v = vars(json!({"approved": true, "form": {"days": "5", "kind": "sick"}}));
        assert!(Condition::parse("${approved}").unwrap().evaluate(&v));
        assert!(!Condition::parse("${!approved}").unwrap().evaluate(&v));
        assert!(Condition::parse("${form.days > 3}").unwrap().evaluate(&v));
        assert!(!Condition::parse("${form.days <= 3}").unwrap().evaluate(&v));
        assert!(Condition::parse("${form.kind == \"sick\"}").unwrap().evaluate(&v));
        // Missing variables are falsy and compare unequal.
        assert!(!Condition::parse("${missing}").unwrap().evaluate(&v));
        assert!(Condition::parse("${!missing}").unwrap().evaluate(&v));
        assert!(!Condition::parse("${missing > 1}").unwrap().evaluate(&v));
    }

    #[test]
    fn test_assignment_expressions() {
        let v = vars(json!({"manager": "bob", "reviewers": ["carol", "dave"]}));
        assert_eq!(resolve_assignee("${initiator}", &v, "alice").as_deref(), Some("alice"));
        assert_eq!(resolve_assignee("${manager}", &v, "alice").as_deref(), Some("bob"));
        assert_eq!(resolve_assignee("kermit", &v, "alice").as_deref(), Some("kermit"));
        assert_eq!(resolve_assignee("${nobody}", &v, "alice"), None);
        assert_eq!(
            resolve_candidates("${reviewers}, erin", &v, "alice"),
            vec!["carol", "dave", "erin"]
        );
    }
}
