// JSON Schema contracts for structured generation
//
// Providers with native structured outputs enforce the schema server-side; the
// post-parse validator below re-checks the subset we rely on so that malformed
// outputs are caught regardless of the backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LlmError, Result};

/// Named JSON Schema sent along with a structured generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSchema {
    pub name: String,
    pub schema: Value,
    #[serde(default = "default_strict")]
    pub strict: bool,
}

fn default_strict() -> bool {
    true
}

impl JsonSchema {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
            strict: true,
        }
    }

    /// Validate a parsed value against this schema
    pub fn validate(&self, value: &Value) -> Result<()> {
        validate_node(&self.schema, value, "$").map_err(|reason| LlmError::SchemaViolation {
            schema: self.name.clone(),
            reason,
        })
    }

    /// Parse raw model output and validate it
    pub fn parse(&self, raw: &str) -> Result<Value> {
        let trimmed = strip_code_fence(raw);
        let value: Value = serde_json::from_str(trimmed).map_err(|e| LlmError::SchemaViolation {
            schema: self.name.clone(),
            reason: format!("not valid JSON: {}", e),
        })?;
        self.validate(&value)?;
        Ok(value)
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(body) = rest.strip_suffix("```") {
            return body.trim();
        }
    }
    trimmed
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn validate_node(schema: &Value, value: &Value, path: &str) -> std::result::Result<(), String> {
    let Some(obj) = schema.as_object() else {
        return Ok(());
    };

    match obj.get("type") {
        Some(Value::String(t)) => {
            if !type_matches(t, value) {
                return Err(format!("{} expected {}", path, t));
            }
        }
        Some(Value::Array(types)) => {
            let ok = types
                .iter()
                .filter_map(|t| t.as_str())
                .any(|t| type_matches(t, value));
            if !ok {
                return Err(format!("{} matched none of {:?}", path, types));
            }
        }
        _ => {}
    }

    if let Some(Value::Array(allowed)) = obj.get("enum") {
        if !allowed.contains(value) {
            return Err(format!("{} not in enum", path));
        }
    }

    if let Some(map) = value.as_object() {
        if let Some(Value::Array(required)) = obj.get("required") {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !map.contains_key(key) {
                    return Err(format!("{} missing required '{}'", path, key));
                }
            }
        }
        if let Some(Value::Object(props)) = obj.get("properties") {
            for (key, sub) in props {
                if let Some(child) = map.get(key) {
                    validate_node(sub, child, &format!("{}.{}", path, key))?;
                }
            }
        }
    }

    if let (Some(items), Some(arr)) = (obj.get("items"), value.as_array()) {
        for (idx, child) in arr.iter().enumerate() {
            validate_node(items, child, &format!("{}[{}]", path, idx))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rerank_schema() -> JsonSchema {
        JsonSchema::new(
            "rerank",
            json!({
                "type": "object",
                "required": ["results"],
                "properties": {
                    "results": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["id", "score"],
                            "properties": {
                                "id": {"type": "string"},
                                "score": {"type": "number"}
                            }
                        }
                    }
                }
            }),
        )
    }

    #[test]
    fn test_valid_payload_passes() {
        let value = json!({"results": [{"id": "a", "score": 80}]});
        assert!(rerank_schema().validate(&value).is_ok());
    }

    #[test]
    fn test_missing_required_field_fails() {
        let value = json!({"results": [{"id": "a"}]});
        let err = rerank_schema().validate(&value).unwrap_err();
        assert!(err.to_string().contains("score"));
    }

    #[test]
    fn test_wrong_type_fails() {
        let value = json!({"results": "nope"});
        assert!(rerank_schema().validate(&value).is_err());
    }

    #[test]
    fn test_enum_enforced() {
        let schema = JsonSchema::new(
            "mode",
            json!({"type": "object", "properties": {"mode": {"type": "string", "enum": ["explain", "edit"]}}}),
        );
        assert!(schema.validate(&json!({"mode": "edit"})).is_ok());
        assert!(schema.validate(&json!({"mode": "delete"})).is_err());
    }

    #[test]
    fn test_parse_strips_code_fence() {
        let schema = JsonSchema::new("q", json!({"type": "object", "required": ["contextual_query"]}));
        let raw = "```json\n{\"contextual_query\": \"units in path\"}\n```";
        let value = schema.parse(raw).unwrap();
        assert_eq!(value["contextual_query"], "units in path");
    }
}
