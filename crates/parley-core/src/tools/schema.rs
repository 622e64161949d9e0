use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

/// Checks tool arguments against a JSON Schema (draft 7). A null or empty
/// schema accepts anything. Returns the first violation as a message.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let unconstrained = match schema {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if unconstrained {
        return Ok(());
    }

    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|err| format!("tool schema is invalid: {err}"))?;

    compiled.validate(args).map_err(|mut errors| {
        match errors.next() {
            Some(first) => {
                let path = first.instance_path.to_string();
                if path.is_empty() {
                    first.to_string()
                } else {
                    format!("{path}: {first}")
                }
            }
            None => "arguments failed validation".to_owned(),
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::validate_args;

    #[test]
    fn accepts_matching_args_and_reports_violations() {
        let schema = json!({
            "type": "object",
            "properties": { "city": { "type": "string" }, "days": { "type": "integer" } },
            "required": ["city"]
        });

        assert!(validate_args(&schema, &json!({ "city": "Oslo", "days": 3 })).is_ok());

        let missing = validate_args(&schema, &json!({ "days": 3 })).expect_err("missing city");
        assert!(missing.contains("city"));

        let wrong_type =
            validate_args(&schema, &json!({ "city": "Oslo", "days": "3" })).expect_err("bad type");
        assert!(wrong_type.starts_with("/days"));
    }

    #[test]
    fn empty_schema_accepts_anything() {
        assert!(validate_args(&json!({}), &json!({ "anything": true })).is_ok());
        assert!(validate_args(&serde_json::Value::Null, &json!([1, 2])).is_ok());
    }

    #[test]
    fn broken_schema_is_reported() {
        let err = validate_args(&json!({ "type": 12 }), &json!({})).expect_err("invalid schema");
        assert!(err.starts_with("tool schema is invalid"));
    }
}
