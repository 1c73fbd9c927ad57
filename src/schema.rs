//! Validation of structured results submitted by the agent
//!
//! The callback server only needs "give me the schema" and "check this value".
//! [`SchemaValidator`] is that seam; [`TypedSchema`] implements it for any
//! type that derives `schemars::JsonSchema` and `serde::Deserialize`, and
//! [`JsonSchemaValidator`] for a raw JSON schema document. Both compile their
//! schema once with `jsonschema` and report every failing location.

use std::fmt;
use std::marker::PhantomData;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// One problem at one location in the submitted value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Location such as `$.items[2].name`
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
    pub field_errors: Vec<FieldError>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field_errors: Vec::new(),
        }
    }

    fn from_fields(field_errors: Vec<FieldError>) -> Self {
        Self {
            message: format!("{} validation error(s)", field_errors.len()),
            field_errors,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for field in &self.field_errors {
            write!(f, "\n  {}: {}", field.path, field.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Capability used by the callback server to check submitted results
pub trait SchemaValidator: Send + Sync {
    /// JSON schema sent to the agent with the request
    fn json_schema(&self) -> Value;

    /// Check a raw value; on success return the normalized value to store
    fn validate(&self, raw: &Value) -> Result<Value, ValidationError>;
}

// ═══════════════════════════════════════════════════════════════════════════
// CompiledSchema
// ═══════════════════════════════════════════════════════════════════════════

/// A schema document plus its compiled validator
///
/// A document that fails to compile is kept, and every value checked against
/// it is rejected with the compile error.
struct CompiledSchema {
    document: Value,
    validator: Result<jsonschema::Validator, String>,
}

impl CompiledSchema {
    fn compile(document: Value) -> Self {
        let validator = jsonschema::validator_for(&document).map_err(|e| format!("invalid schema: {}", e));
        Self { document, validator }
    }

    fn check(&self, value: &Value) -> Result<(), ValidationError> {
        let validator = self.validator.as_ref().map_err(|e| ValidationError::new(e.clone()))?;
        let errors: Vec<FieldError> = validator
            .iter_errors(value)
            .map(|e| FieldError {
                path: field_path(&e.instance_path().to_string()),
                message: e.to_string(),
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::from_fields(errors))
        }
    }
}

/// `/items/2/name` becomes `$.items[2].name`
fn field_path(pointer: &str) -> String {
    let mut path = String::from("$");
    for segment in pointer.split('/').skip(1) {
        let segment = segment.replace("~1", "/").replace("~0", "~");
        if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
            path.push('[');
            path.push_str(&segment);
            path.push(']');
        } else {
            path.push('.');
            path.push_str(&segment);
        }
    }
    path
}

// ═══════════════════════════════════════════════════════════════════════════
// TypedSchema<T>
// ═══════════════════════════════════════════════════════════════════════════
// Schema generated by schemars, checked with jsonschema, then a serde round
// trip through T. The stored value is T re-serialized, so defaults and
// renames are applied before the caller sees it.
// ═══════════════════════════════════════════════════════════════════════════

pub struct TypedSchema<T> {
    schema: CompiledSchema,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T>
where
    T: JsonSchema + DeserializeOwned + Serialize,
{
    pub fn new() -> Self {
        let root = schemars::schema_for!(T);
        let document = serde_json::to_value(root).unwrap_or(Value::Bool(true));
        Self {
            schema: CompiledSchema::compile(document),
            _marker: PhantomData,
        }
    }

    /// Convert a validated value into `T`
    pub fn decode(&self, value: Value) -> Result<T, ValidationError> {
        serde_json::from_value(value).map_err(|e| ValidationError::new(e.to_string()))
    }
}

impl<T> Default for TypedSchema<T>
where
    T: JsonSchema + DeserializeOwned + Serialize,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SchemaValidator for TypedSchema<T>
where
    T: JsonSchema + DeserializeOwned + Serialize,
{
    fn json_schema(&self) -> Value {
        self.schema.document.clone()
    }

    fn validate(&self, raw: &Value) -> Result<Value, ValidationError> {
        self.schema.check(raw)?;
        let typed: T = self.decode(raw.clone())?;
        serde_json::to_value(typed).map_err(|e| ValidationError::new(e.to_string()))
    }
}

/// Validator over a JSON schema document, without a Rust type behind it
pub struct JsonSchemaValidator {
    schema: CompiledSchema,
}

impl JsonSchemaValidator {
    pub fn new(schema: Value) -> Self {
        Self {
            schema: CompiledSchema::compile(schema),
        }
    }
}

impl fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSchemaValidator")
            .field("schema", &self.schema.document)
            .field("compiled", &self.schema.validator.is_ok())
            .finish()
    }
}

impl SchemaValidator for JsonSchemaValidator {
    fn json_schema(&self) -> Value {
        self.schema.document.clone()
    }

    fn validate(&self, raw: &Value) -> Result<Value, ValidationError> {
        self.schema.check(raw)?;
        Ok(raw.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
    struct SortResult {
        sorted: Vec<i64>,
    }

    #[derive(Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
    struct Order {
        id: u32,
        customer: Customer,
        note: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
    }

    #[derive(Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
    struct Customer {
        name: String,
    }

    #[test]
    fn test_typed_schema_accepts_valid_value() {
        let schema = TypedSchema::<SortResult>::new();
        let stored = schema.validate(&json!({"sorted": [90, 64, 11]})).unwrap();
        assert_eq!(stored, json!({"sorted": [90, 64, 11]}));
        assert_eq!(
            schema.decode(stored).unwrap(),
            SortResult {
                sorted: vec![90, 64, 11]
            }
        );
    }

    #[test]
    fn test_typed_schema_reports_field_errors() {
        let schema = TypedSchema::<SortResult>::new();
        let err = schema.validate(&json!({"sorted": [1, "two"]})).unwrap_err();
        assert_eq!(err.field_errors.len(), 1);
        assert_eq!(err.field_errors[0].path, "$.sorted[1]");
        assert!(err.to_string().contains("integer"));

        let err = schema.validate(&json!({})).unwrap_err();
        assert_eq!(err.field_errors[0].path, "$");
        assert!(err.field_errors[0].message.contains("sorted"));
    }

    #[test]
    fn test_refs_and_optional_fields() {
        let schema = TypedSchema::<Order>::new();
        let stored = schema
            .validate(&json!({"id": 7, "customer": {"name": "Ada"}, "note": null}))
            .unwrap();
        assert_eq!(stored["tags"], json!([]));

        let err = schema
            .validate(&json!({"id": 7, "customer": {"name": 3}}))
            .unwrap_err();
        assert_eq!(err.field_errors[0].path, "$.customer.name");

        assert!(schema.validate(&json!({"id": -1, "customer": {"name": "x"}})).is_err());
    }

    #[test]
    fn test_schema_document_is_exposed() {
        let schema = TypedSchema::<SortResult>::new().json_schema();
        assert_eq!(schema["properties"]["sorted"]["type"], "array");
    }

    #[test]
    fn test_raw_json_schema() {
        let validator = JsonSchemaValidator::new(json!({
            "type": "object",
            "required": ["status"],
            "properties": {"status": {"enum": ["ok", "degraded"]}},
            "additionalProperties": false
        }));
        assert!(validator.validate(&json!({"status": "ok"})).is_ok());
        assert!(validator.validate(&json!({"status": "down"})).is_err());
        assert!(validator.validate(&json!({"status": "ok", "extra": 1})).is_err());
    }

    #[test]
    fn test_string_and_array_constraints() {
        let validator = JsonSchemaValidator::new(json!({"type": "string", "minLength": 3, "pattern": "^[a-z]+$"}));
        assert!(validator.validate(&json!("abc")).is_ok());
        assert!(validator.validate(&json!("")).is_err());
        assert!(validator.validate(&json!("ABC")).is_err());

        let validator = JsonSchemaValidator::new(json!({
            "type": "object",
            "properties": {"sorted": {"type": "array", "minItems": 1, "items": {"type": "integer"}}},
            "required": ["sorted"]
        }));
        let err = validator.validate(&json!({"sorted": []})).unwrap_err();
        assert_eq!(err.field_errors[0].path, "$.sorted");
    }

    #[test]
    fn test_recursive_reference() {
        let validator = JsonSchemaValidator::new(json!({
            "$defs": {
                "node": {
                    "type": "object",
                    "properties": {"children": {"type": "array", "items": {"$ref": "#/$defs/node"}}},
                    "required": ["children"]
                }
            },
            "$ref": "#/$defs/node"
        }));
        assert!(validator.validate(&json!({"children": [{"children": []}]})).is_ok());
        let err = validator.validate(&json!({"children": [{"children": [{}]}]})).unwrap_err();
        assert_eq!(err.field_errors[0].path, "$.children[0].children[0]");
    }

    #[test]
    fn test_invalid_schema_rejects_everything() {
        let validator = JsonSchemaValidator::new(json!({"type": 12}));
        let err = validator.validate(&json!("anything")).unwrap_err();
        assert!(err.message.starts_with("invalid schema"));
    }

    #[test]
    fn test_field_path() {
        assert_eq!(field_path(""), "$");
        assert_eq!(field_path("/items/2/name"), "$.items[2].name");
        assert_eq!(field_path("/a~1b"), "$.a/b");
    }
}
