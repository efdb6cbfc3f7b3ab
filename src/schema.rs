//! JSON-Schema construction for tool input parameters.
//!
//! Without runtime reflection, parameter shape is declared explicitly at
//! registration time. Each exposed parameter carries a name/description/
//! required triple plus a schema fragment; dependency and LLM slots never
//! appear here, so the advertised schema contains exactly the user-declared
//! parameters.

use serde_json::{json, Map, Value};

/// Description of one exposed (user-declared) tool parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    /// Property name in the input schema
    pub name: String,

    /// Human-readable description
    pub description: Option<String>,

    /// Whether the argument must be present on invocation
    pub required: bool,

    /// Schema fragment for the parameter value
    pub schema: Value,
}

impl ParamSpec {
    fn typed(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: None,
            // Primitive non-nullability: required until declared optional
            required: true,
            schema,
        }
    }

    /// A string parameter.
    pub fn string(name: impl Into<String>) -> Self {
        Self::typed(name, json!({"type": "string"}))
    }

    /// An integer parameter.
    pub fn integer(name: impl Into<String>) -> Self {
        Self::typed(name, json!({"type": "integer"}))
    }

    /// A floating-point parameter.
    pub fn number(name: impl Into<String>) -> Self {
        Self::typed(name, json!({"type": "number"}))
    }

    /// A boolean parameter.
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::typed(name, json!({"type": "boolean"}))
    }

    /// A structured object parameter with named fields.
    ///
    /// `fields` are walked like nested record types: each becomes a property
    /// with its own schema and requiredness.
    pub fn object(name: impl Into<String>, fields: Vec<ParamSpec>) -> Self {
        Self::typed(name, object_schema(fields))
    }

    /// A sequence parameter with a resolved element schema.
    pub fn array(name: impl Into<String>, items: Value) -> Self {
        Self::typed(name, json!({"type": "array", "items": items}))
    }

    /// A map parameter: a generic object with unconstrained properties.
    pub fn map(name: impl Into<String>) -> Self {
        Self::typed(name, json!({"type": "object", "additionalProperties": true}))
    }

    /// A parameter with an explicit schema fragment.
    pub fn with_schema(name: impl Into<String>, schema: Value) -> Self {
        Self::typed(name, schema)
    }

    /// Attach a description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark the parameter optional.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Build an object schema from field descriptors.
pub fn object_schema(fields: Vec<ParamSpec>) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for field in fields {
        let mut schema = field.schema;
        if let Some(desc) = field.description {
            if let Some(obj) = schema.as_object_mut() {
                obj.insert("description".to_string(), Value::String(desc));
            }
        }
        if field.required {
            required.push(Value::String(field.name.clone()));
        }
        properties.insert(field.name, schema);
    }

    let mut schema = Map::new();
    schema.insert("type".to_string(), Value::String("object".to_string()));
    schema.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        schema.insert("required".to_string(), Value::Array(required));
    }
    Value::Object(schema)
}

/// Build the MCP input schema for a tool from its exposed parameters.
pub fn build_input_schema(params: &[ParamSpec]) -> Value {
    object_schema(params.to_vec())
}

/// Element schema helpers for array parameters.
pub mod items {
    use serde_json::{json, Value};

    pub fn string() -> Value {
        json!({"type": "string"})
    }

    pub fn integer() -> Value {
        json!({"type": "integer"})
    }

    pub fn number() -> Value {
        json!({"type": "number"})
    }

    pub fn boolean() -> Value {
        json!({"type": "boolean"})
    }

    pub fn object(fields: Vec<super::ParamSpec>) -> Value {
        super::object_schema(fields)
    }
}
