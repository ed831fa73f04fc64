use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Payload was not a well-formed JSON document
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Payload is not well-formed JSON (line {line}, column {column}): {message}")]
pub struct DecodeError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            message: err.to_string(),
            line: err.line(),
            column: err.column(),
        }
    }
}

/// Decode a raw record payload into a generic JSON value
///
/// `null`, scalars and arrays are all valid results; emptiness is the
/// handler's concern.
pub fn decode_payload(raw: &[u8]) -> Result<Value, DecodeError> {
    Ok(serde_json::from_slice(raw)?)
}

/// Payload did not match the shape an agent expects
#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("Schema for shape '{shape}' does not compile: {message}")]
    Schema { shape: String, message: String },
    #[error("Payload does not match shape '{shape}': {violations}")]
    Invalid { shape: String, violations: String },
    #[error("Payload could not be deserialized: {0}")]
    Deserialize(#[from] serde_json::Error),
}

/// Describes the decoded structure an agent expects
///
/// The engine never enforces a shape. Handlers call [`PayloadShape::decode`]
/// (or use [`crate::agent::Agent::typed`]) to validate and type the payload.
#[derive(Clone)]
pub struct PayloadShape {
    name: String,
    schema: Option<Arc<Value>>,
    compiled: Arc<OnceLock<Result<jsonschema::Validator, String>>>,
}

impl PayloadShape {
    /// Accepts any decoded value
    pub fn any() -> Self {
        Self {
            name: "any".to_string(),
            schema: None,
            compiled: Arc::new(OnceLock::new()),
        }
    }

    /// Shape backed by an explicit JSON Schema document
    pub fn from_schema<S: Into<String>>(name: S, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema: Some(Arc::new(schema)),
            compiled: Arc::new(OnceLock::new()),
        }
    }

    /// Shape derived from a Rust type's JSON Schema
    pub fn of<T: JsonSchema>() -> Self {
        let root = schemars::gen::SchemaGenerator::default().into_root_schema_for::<T>();
        let schema = serde_json::to_value(root).unwrap_or(Value::Bool(true));
        Self::from_schema(T::schema_name(), schema)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> Option<&Value> {
        self.schema.as_deref()
    }

    /// Check a decoded payload against this shape
    pub fn validate(&self, value: &Value) -> Result<(), ShapeError> {
        let Some(schema) = &self.schema else {
            return Ok(());
        };

        let compiled = self.compiled.get_or_init(|| {
            jsonschema::validator_for(schema).map_err(|e| e.to_string())
        });

        let validator = compiled.as_ref().map_err(|message| ShapeError::Schema {
            shape: self.name.clone(),
            message: message.clone(),
        })?;

        validator.validate(value).map_err(|errors| {
            let violations: Vec<String> = errors
                .map(|e| format!("At '{}': {}", e.instance_path, e))
                .collect();
            ShapeError::Invalid {
                shape: self.name.clone(),
                violations: violations.join("; "),
            }
        })
    }

    /// Validate, then deserialize into `T`
    pub fn decode<T: DeserializeOwned>(&self, value: &Value) -> Result<T, ShapeError> {
        self.validate(value)?;
        Ok(T::deserialize(value)?)
    }
}

impl Default for PayloadShape {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Debug for PayloadShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadShape")
            .field("name", &self.name)
            .field("has_schema", &self.schema.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, JsonSchema, PartialEq)]
    struct Order {
        orderid: u64,
        ordertime: Option<u64>,
    }

    #[test]
    fn test_decode_valid_json() {
        let value = decode_payload(br#"{"orderid": 18}"#).unwrap();
        assert_eq!(value, json!({"orderid": 18}));
    }

    #[test]
    fn test_decode_null_is_valid() {
        assert_eq!(decode_payload(b"null").unwrap(), Value::Null);
    }

    #[test]
    fn test_decode_malformed_json() {
        let err = decode_payload(b"not-json{").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.to_string().contains("not well-formed JSON"));
    }

    #[test]
    fn test_decode_empty_payload_is_error() {
        assert!(decode_payload(b"").is_err());
    }

    #[test]
    fn test_any_shape_accepts_everything() {
        let shape = PayloadShape::any();
        assert_eq!(shape.name(), "any");
        assert!(shape.validate(&Value::Null).is_ok());
        assert!(shape.validate(&json!([1, 2, 3])).is_ok());
    }

    #[test]
    fn test_typed_shape_validates_and_decodes() {
        let shape = PayloadShape::of::<Order>();
        assert_eq!(shape.name(), "Order");

        let order: Order = shape.decode(&json!({"orderid": 18})).unwrap();
        assert_eq!(
            order,
            Order {
                orderid: 18,
                ordertime: None
            }
        );
    }

    #[test]
    fn test_typed_shape_rejects_mismatch() {
        let shape = PayloadShape::of::<Order>();
        let err = shape.validate(&json!({"orderid": "eighteen"})).unwrap_err();

        match err {
            ShapeError::Invalid { shape, violations } => {
                assert_eq!(shape, "Order");
                assert!(violations.contains("orderid"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_explicit_schema_shape() {
        let shape = PayloadShape::from_schema(
            "flat-record",
            json!({"type": "object", "required": ["id"]}),
        );

        assert!(shape.validate(&json!({"id": 1})).is_ok());
        assert!(shape.validate(&json!({"other": 1})).is_err());
        assert!(shape.schema().is_some());
    }
}
