//! Argument normalization and schema validation.

use serde_json::{Map, Number, Value};

use super::repair::parse_number_words;
use crate::tools::{ParamType, ToolDefinition, ToolError, ToolErrorKind};

/// Map declared synonyms to canonical parameter names. When both a synonym
/// and its canonical name (or two synonyms) are present, the first one in
/// argument order wins. Unknown keys pass through for validation to reject.
pub fn normalize_argument_names(def: &ToolDefinition, args: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(args.len());
    for (key, value) in args {
        let canonical = def.canonical_param(&key).unwrap_or(key.as_str()).to_string();
        if out.contains_key(&canonical) {
            tracing::debug!(tool = %def.name, key = %key, canonical = %canonical, "dropping duplicate argument");
            continue;
        }
        out.insert(canonical, value);
    }
    out
}

/// Coerce numeric-like values for numeric parameters: integral floats,
/// numeric strings and number words.
pub fn coerce_numeric(def: &ToolDefinition, args: &mut Map<String, Value>) {
    for param in def.parameters.iter().filter(|p| p.param_type.is_numeric()) {
        let Some(value) = args.get_mut(&param.name) else {
            continue;
        };
        if let Some(coerced) = coerce_value(param.param_type, value) {
            *value = coerced;
        }
    }
}

fn coerce_value(param_type: ParamType, value: &Value) -> Option<Value> {
    match value {
        Value::Number(n) if param_type == ParamType::Integer && !(n.is_i64() || n.is_u64()) => {
            let f = n.as_f64()?;
            (f.fract() == 0.0 && f.is_finite()).then(|| Value::from(f as i64))
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Some(Value::from(i));
            }
            if let Ok(f) = trimmed.parse::<f64>() {
                return match param_type {
                    ParamType::Integer if f.fract() == 0.0 && f.is_finite() => {
                        Some(Value::from(f as i64))
                    }
                    ParamType::Number => Number::from_f64(f).map(Value::Number),
                    _ => None,
                };
            }
            parse_number_words(trimmed).map(Value::from)
        }
        _ => None,
    }
}

/// Check `args` against the declared parameters.
pub fn validate_arguments(
    def: &ToolDefinition,
    display: &str,
    args: &Map<String, Value>,
) -> Result<(), ToolError> {
    if def.parameters.is_empty() {
        return Ok(());
    }

    let mut unknown: Vec<&str> = args
        .keys()
        .filter(|k| def.param(k).is_none())
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        unknown.sort_unstable();
        let valid: Vec<&str> = def.parameters.iter().map(|p| p.name.as_str()).collect();
        return Err(ToolError::new(
            ToolErrorKind::UnknownParameter,
            format!(
                "unknown parameter(s) for tool '{display}': {}. Valid parameters: {}",
                unknown.join(", "),
                valid.join(", ")
            ),
        ));
    }

    let mut missing: Vec<&str> = def
        .required_params()
        .filter(|p| !args.contains_key(&p.name))
        .map(|p| p.name.as_str())
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        return Err(ToolError::new(
            ToolErrorKind::MissingParameter,
            format!(
                "missing required parameter(s) for tool '{display}': {}. Example: {}",
                missing.join(", "),
                def.example_call(display)
            ),
        ));
    }

    for (key, value) in args {
        let Some(param) = def.param(key) else {
            continue;
        };
        if value.is_null() && param.optional {
            continue;
        }
        if !param.param_type.accepts(value) {
            return Err(ToolError::new(
                ToolErrorKind::InvalidParameterType,
                format!(
                    "invalid type for parameter '{key}' on tool '{display}': expected {}",
                    param.param_type.as_str()
                ),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(name: &str) -> ToolDefinition {
        ToolDefinition::builtin()
            .unwrap()
            .into_iter()
            .find(|d| d.name == name)
            .unwrap()
    }

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_normalize_synonyms_first_wins() {
        let edit = def("edit");
        let args = obj(json!({"file": "a.rs", "old_text": "x", "old": "y", "new_string": "z"}));
        let normalized = normalize_argument_names(&edit, args);
        assert_eq!(
            Value::Object(normalized),
            json!({"path": "a.rs", "old": "x", "new": "z"})
        );
    }

    #[test]
    fn test_coerce_numeric() {
        let read = def("read");
        let mut args = obj(json!({
            "path": "a",
            "line_start": "12",
            "line_end": 20.0,
            "limit": "fifty",
            "offset": "one hundred and five",
        }));
        coerce_numeric(&read, &mut args);
        assert_eq!(args["line_start"], json!(12));
        assert_eq!(args["line_end"], json!(20));
        assert_eq!(args["limit"], json!(50));
        assert_eq!(args["offset"], json!(105));

        let mut args = obj(json!({"path": "a", "limit": 2.5, "offset": "soon"}));
        coerce_numeric(&read, &mut args);
        assert_eq!(args["limit"], json!(2.5));
        assert_eq!(args["offset"], json!("soon"));
    }

    #[test]
    fn test_validate_unknown_and_missing() {
        let write = def("write");
        let err = validate_arguments(&write, "write", &obj(json!({"path": "a", "mode": "x"})))
            .unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::UnknownParameter);
        assert!(err
            .to_string()
            .starts_with("unknown parameter(s) for tool 'write': mode"));

        let err = validate_arguments(&write, "write", &obj(json!({"path": "a"}))).unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::MissingParameter);
        assert!(err.to_string().contains("content"));
        assert!(err.to_string().contains(r#"write({"path":"...","content":"..."})"#));
    }

    #[test]
    fn test_validate_types() {
        let read = def("read");
        let err = validate_arguments(&read, "read", &obj(json!({"path": 3}))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid type for parameter 'path' on tool 'read': expected string"
        );
        let err =
            validate_arguments(&read, "read", &obj(json!({"path": "a", "diff": "yes"}))).unwrap_err();
        assert_eq!(err.kind(), ToolErrorKind::InvalidParameterType);

        assert!(validate_arguments(&read, "read", &obj(json!({"path": "a", "limit": null}))).is_ok());
        assert!(validate_arguments(&read, "read", &obj(json!({"path": null}))).is_err());
    }
}
