use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tool descriptor advertised to the language model.
///
/// `input_schema` is a JSON Schema object; it is what providers with native
/// function calling receive as the function `parameters`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

impl ToolDescriptor {
    /// Builds a descriptor whose input schema is derived from an argument type.
    pub fn for_args<T: JsonSchema>(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: schema_value::<T>(),
            output_schema: None,
        }
    }
}

/// Root schema for `T` with the draft/title noise removed.
pub fn schema_value<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(object) = value.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
        object
            .entry("properties")
            .or_insert_with(|| serde_json::json!({}));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(JsonSchema, Deserialize)]
    struct SampleArgs {
        /// Path relative to the workspace root.
        path: String,
        #[serde(default)]
        limit: Option<u32>,
    }

    #[allow(dead_code)]
    #[derive(JsonSchema, Deserialize)]
    struct NoArgs {}

    #[test]
    fn schema_lists_required_fields() {
        let descriptor = ToolDescriptor::for_args::<SampleArgs>("sample", "Sample tool");
        let schema = &descriptor.input_schema;
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["path"]["type"], "string");
        assert_eq!(schema["required"], serde_json::json!(["path"]));
        assert!(schema.get("$schema").is_none());
        assert!(schema.get("title").is_none());
    }

    #[test]
    fn empty_args_still_have_properties() {
        let schema = schema_value::<NoArgs>();
        assert_eq!(schema["properties"], serde_json::json!({}));
    }
}
