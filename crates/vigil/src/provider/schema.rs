//! Tool-name sanitization and JSON Schema dialect transforms.
//!
//! Providers constrain tool names to `[a-zA-Z0-9_]` and reject several JSON
//! Schema constructs that MCP servers emit freely (nullable unions, empty
//! `properties` objects). Tools are rewritten here before binding; the
//! returned [`NameMap`] recovers the original name at dispatch time.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::chat::Tool;
use crate::mcp::ToolDescriptor;

/// Maps sanitized tool names back to their originals.
pub type NameMap = HashMap<String, String>;

/// Rewrite a tool name into the provider-safe alphabet.
///
/// Every character outside `[a-zA-Z0-9_]` becomes `_`. An empty input stays
/// empty (and is rejected downstream by the orchestrator).
pub fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Sanitize names and transform schemas for a set of tool descriptors.
///
/// Returns the provider-facing tools plus the sanitized→original name map.
/// When two distinct originals collide after sanitization, the later one gets
/// a numeric suffix so the map stays invertible.
pub fn prepare_tools(descriptors: &[ToolDescriptor]) -> (Vec<Tool>, NameMap) {
    let mut tools = Vec::with_capacity(descriptors.len());
    let mut name_map: NameMap = HashMap::new();

    for descriptor in descriptors {
        let mut safe = sanitize_tool_name(&descriptor.name);
        if name_map.contains_key(&safe) && name_map[&safe] != descriptor.name {
            let mut suffix = 2usize;
            while name_map.contains_key(&format!("{}_{}", safe, suffix)) {
                suffix += 1;
            }
            safe = format!("{}_{}", safe, suffix);
        }
        name_map.insert(safe.clone(), descriptor.name.clone());

        tools.push(Tool {
            name: safe,
            description: descriptor.description.clone(),
            parameters: transform_schema(&descriptor.input_schema),
        });
    }

    (tools, name_map)
}

/// Transform a JSON Schema fragment into the constrained provider dialect.
///
/// - `["string", "null"]` unions drop the `null`; singleton unions collapse
///   to their only member; mixed unions fall back to a generic object shape.
/// - Objects and arrays are transformed recursively.
/// - Empty `properties` maps are removed entirely.
pub fn transform_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(obj) => transform_object(obj),
        other => other.clone(),
    }
}

fn transform_object(obj: &Map<String, Value>) -> Value {
    let mut out = Map::new();

    for (key, value) in obj {
        match key.as_str() {
            "type" => {
                out.insert("type".to_string(), flatten_type(value));
            }
            "properties" => {
                if let Value::Object(props) = value {
                    if props.is_empty() {
                        continue;
                    }
                    let transformed: Map<String, Value> = props
                        .iter()
                        .map(|(name, prop)| (name.clone(), transform_schema(prop)))
                        .collect();
                    out.insert("properties".to_string(), Value::Object(transformed));
                }
            }
            "items" => {
                out.insert("items".to_string(), transform_schema(value));
            }
            "anyOf" | "oneOf" => {
                // Union of subschemas: drop nulls, collapse singletons,
                // otherwise degrade to a permissive object.
                let members: Vec<&Value> = value
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter(|member| {
                                member.get("type").and_then(Value::as_str) != Some("null")
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                match members.as_slice() {
                    [only] => {
                        if let Value::Object(merged) = transform_schema(only) {
                            for (k, v) in merged {
                                out.entry(k).or_insert(v);
                            }
                        }
                    }
                    _ => {
                        out.entry("type".to_string())
                            .or_insert(Value::String("object".to_string()));
                    }
                }
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    Value::Object(out)
}

/// Flatten a `type` entry that may be a union array.
fn flatten_type(value: &Value) -> Value {
    match value {
        Value::Array(types) => {
            let non_null: Vec<&Value> = types
                .iter()
                .filter(|t| t.as_str() != Some("null"))
                .collect();
            match non_null.as_slice() {
                [only] => (*only).clone(),
                _ => Value::String("object".to_string()),
            }
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(name: &str, schema: Value) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: String::new(),
            input_schema: schema,
        }
    }

    #[test]
    fn sanitize_replaces_forbidden_characters() {
        assert_eq!(sanitize_tool_name("fs.read-file"), "fs_read_file");
        assert_eq!(sanitize_tool_name("Sequential-Thinking__go"), "Sequential_Thinking__go");
        assert_eq!(sanitize_tool_name("plain_name_1"), "plain_name_1");
    }

    #[test]
    fn name_map_round_trips_originals() {
        let originals = ["fs.read", "net:ping", "search web", "already_safe"];
        let descriptors: Vec<ToolDescriptor> = originals
            .iter()
            .map(|name| descriptor(name, json!({"type": "object"})))
            .collect();

        let (tools, map) = prepare_tools(&descriptors);
        for (tool, original) in tools.iter().zip(originals.iter()) {
            assert_eq!(map[&tool.name], *original);
        }
    }

    #[test]
    fn sanitize_collisions_get_suffixed() {
        let descriptors = vec![
            descriptor("a.b", json!({"type": "object"})),
            descriptor("a-b", json!({"type": "object"})),
        ];
        let (tools, map) = prepare_tools(&descriptors);
        assert_eq!(tools[0].name, "a_b");
        assert_eq!(tools[1].name, "a_b_2");
        assert_eq!(map["a_b"], "a.b");
        assert_eq!(map["a_b_2"], "a-b");
    }

    #[test]
    fn nullable_union_drops_null() {
        let schema = json!({"type": ["string", "null"], "description": "maybe"});
        let out = transform_schema(&schema);
        assert_eq!(out["type"], "string");
        assert_eq!(out["description"], "maybe");
    }

    #[test]
    fn mixed_union_falls_back_to_object() {
        let schema = json!({"type": ["string", "integer"]});
        assert_eq!(transform_schema(&schema)["type"], "object");
    }

    #[test]
    fn any_of_singleton_collapses() {
        let schema = json!({
            "anyOf": [
                {"type": "null"},
                {"type": "string", "description": "the value"}
            ]
        });
        let out = transform_schema(&schema);
        assert_eq!(out["type"], "string");
        assert_eq!(out["description"], "the value");
    }

    #[test]
    fn empty_properties_are_dropped() {
        let schema = json!({"type": "object", "properties": {}});
        let out = transform_schema(&schema);
        assert!(out.get("properties").is_none());
    }

    #[test]
    fn nested_objects_and_arrays_transform_recursively() {
        let schema = json!({
            "type": "object",
            "properties": {
                "tags": {
                    "type": "array",
                    "items": {"type": ["string", "null"]}
                },
                "nested": {
                    "type": "object",
                    "properties": {}
                }
            }
        });
        let out = transform_schema(&schema);
        assert_eq!(out["properties"]["tags"]["items"]["type"], "string");
        assert!(out["properties"]["nested"].get("properties").is_none());
    }
}
