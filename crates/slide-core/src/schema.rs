//! Structural schemas for values that cross the process boundary.
//!
//! Every ref value, pub/sub message and RPC payload passes through a
//! [`Schema`] on the way out (`encode`) and on the way in (`decode`). Decoding
//! is where untrusted data is rejected, so it always validates.

use crate::error::{Result, SlideError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Encode/decode contract for one value type.
pub trait Schema: Send + Sync + 'static {
    /// The in-process representation.
    type Value: Clone + PartialEq + Send + Sync + 'static;

    /// Human-readable schema name used in logs and errors.
    fn name(&self) -> &str;

    /// Encode a value into its wire representation.
    fn encode(&self, value: &Self::Value) -> Result<Value>;

    /// Decode and validate a wire value.
    fn decode(&self, raw: &Value) -> Result<Self::Value>;
}

type Validator<T> = Arc<dyn Fn(&T) -> std::result::Result<(), String> + Send + Sync>;

/// A [`Schema`] backed by serde with an optional validation hook.
///
/// ```
/// use slide_core::schema::{Schema, SerdeSchema};
///
/// let schema = SerdeSchema::<i64>::new("Counter").with_validator(|v| {
///     if *v >= 0 { Ok(()) } else { Err("must be non-negative".into()) }
/// });
/// assert!(schema.decode(&serde_json::json!(3)).is_ok());
/// assert!(schema.decode(&serde_json::json!(-1)).is_err());
/// ```
pub struct SerdeSchema<T> {
    name: Cow<'static, str>,
    validator: Option<Validator<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeSchema<T> {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            validator: None,
            _marker: PhantomData,
        }
    }

    /// Attach a validation hook run on both encode and decode.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    fn validate(&self, value: &T) -> Result<()> {
        match &self.validator {
            Some(validator) => {
                validator(value).map_err(|message| SlideError::validation(self.name.as_ref(), message))
            }
            None => Ok(()),
        }
    }
}

impl<T> Clone for SerdeSchema<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            validator: self.validator.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for SerdeSchema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerdeSchema")
            .field("name", &self.name)
            .field("validated", &self.validator.is_some())
            .finish()
    }
}

impl<T> Schema for SerdeSchema<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
{
    type Value = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, value: &T) -> Result<Value> {
        self.validate(value)?;
        serde_json::to_value(value).map_err(|e| SlideError::validation(self.name.as_ref(), e))
    }

    fn decode(&self, raw: &Value) -> Result<T> {
        let value: T = T::deserialize(raw)
            .map_err(|e| SlideError::validation(self.name.as_ref(), e))?;
        self.validate(&value)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct AppReadyState {
        is_ready: bool,
        timestamp: f64,
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let schema = SerdeSchema::<AppReadyState>::new("AppReadyState");
        let err = schema.decode(&json!({"isReady": "yes"})).unwrap_err();
        assert!(matches!(err, SlideError::Validation { ref context, .. } if context == "AppReadyState"));
    }

    #[test]
    fn test_encode_uses_wire_field_names() {
        let schema = SerdeSchema::<AppReadyState>::new("AppReadyState");
        let raw = schema
            .encode(&AppReadyState {
                is_ready: true,
                timestamp: 1.0,
            })
            .unwrap();
        assert_eq!(raw, json!({"isReady": true, "timestamp": 1.0}));
    }

    #[test]
    fn test_validator_runs_on_encode() {
        let schema = SerdeSchema::<String>::new("Title")
            .with_validator(|s| if s.is_empty() { Err("empty".into()) } else { Ok(()) });
        assert!(schema.encode(&String::new()).is_err());
        assert_eq!(schema.encode(&"Slide".to_string()).unwrap(), json!("Slide"));
    }

    #[test]
    fn test_number_schema_rejects_string() {
        let schema = SerdeSchema::<i64>::new("Counter");
        assert!(schema.decode(&json!("x")).is_err());
        assert_eq!(schema.decode(&json!(7)).unwrap(), 7);
    }
}
