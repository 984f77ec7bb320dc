//! Structural JSON schema validation for inbound payloads.
//!
//! Supports the subset operators the receiver config actually uses:
//! `type`, `required`, `properties`, `items`, and `enum`, checked
//! recursively. Compilation is cached against the serialized schema and
//! refreshed only when the schema source changes; a schema that fails to
//! compile clears the cached artifact so a broken schema never rejects
//! traffic.

use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// One violation, with a JSON-pointer-ish path.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone)]
enum SchemaNode {
    Any,
    Node {
        types: Vec<String>,
        required: Vec<String>,
        properties: BTreeMap<String, SchemaNode>,
        items: Option<Box<SchemaNode>>,
        allowed: Option<Vec<Value>>,
    },
}

struct CompiledSchema {
    fingerprint: String,
    root: SchemaNode,
}

/// Caching validator shared by the pipeline and the reload controller.
#[derive(Default)]
pub struct SchemaValidator {
    cache: Mutex<Option<Arc<CompiledSchema>>>,
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "integer"
            } else {
                "number"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        other => type_name(value) == other,
    }
}

fn compile_node(schema: &Value) -> Result<SchemaNode> {
    let Value::Object(map) = schema else {
        // `true` / `{}` style permissive schemas
        if matches!(schema, Value::Bool(true)) {
            return Ok(SchemaNode::Any);
        }
        return Err(Error::Config(format!(
            "unsupported schema node: {}",
            schema
        )));
    };

    let types = match map.get("type") {
        Some(Value::String(t)) => vec![t.clone()],
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(other) => {
            return Err(Error::Config(format!("invalid schema type: {}", other)));
        }
        None => Vec::new(),
    };

    let required = match map.get("required") {
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(other) => {
            return Err(Error::Config(format!("invalid schema required: {}", other)));
        }
        None => Vec::new(),
    };

    let mut properties = BTreeMap::new();
    if let Some(props) = map.get("properties") {
        let Value::Object(props) = props else {
            return Err(Error::Config("schema properties must be an object".to_string()));
        };
        for (name, sub) in props {
            properties.insert(name.clone(), compile_node(sub)?);
        }
    }

    let items = match map.get("items") {
        Some(sub) => Some(Box::new(compile_node(sub)?)),
        None => None,
    };

    let allowed = match map.get("enum") {
        Some(Value::Array(list)) => Some(list.clone()),
        Some(other) => {
            return Err(Error::Config(format!("invalid schema enum: {}", other)));
        }
        None => None,
    };

    Ok(SchemaNode::Node {
        types,
        required,
        properties,
        items,
        allowed,
    })
}

fn check_node(node: &SchemaNode, value: &Value, path: &str, violations: &mut Vec<SchemaViolation>) {
    let SchemaNode::Node {
        types,
        required,
        properties,
        items,
        allowed,
    } = node
    else {
        return;
    };

    if !types.is_empty() && !types.iter().any(|t| type_matches(t, value)) {
        violations.push(SchemaViolation {
            path: path.to_string(),
            message: format!(
                "expected type {}, got {}",
                types.join(" or "),
                type_name(value)
            ),
        });
        return;
    }

    if let Some(allowed) = allowed
        && !allowed.contains(value)
    {
        violations.push(SchemaViolation {
            path: path.to_string(),
            message: format!("value {} not in enum", value),
        });
    }

    if let Value::Object(map) = value {
        for name in required {
            if !map.contains_key(name) {
                violations.push(SchemaViolation {
                    path: format!("{}/{}", path, name),
                    message: "required property missing".to_string(),
                });
            }
        }
        for (name, sub) in properties {
            if let Some(child) = map.get(name) {
                check_node(sub, child, &format!("{}/{}", path, name), violations);
            }
        }
    }

    if let (Some(item_schema), Value::Array(list)) = (items, value) {
        for (i, child) in list.iter().enumerate() {
            check_node(item_schema, child, &format!("{}/{}", path, i), violations);
        }
    }
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `schema` and cache the result. A failed compile clears the
    /// cached artifact and returns the error.
    pub fn prepare(&self, schema: &Value) -> Result<()> {
        let fingerprint = schema.to_string();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.as_ref().is_some_and(|c| c.fingerprint == fingerprint) {
            return Ok(());
        }
        match compile_node(schema) {
            Ok(root) => {
                *cache = Some(Arc::new(CompiledSchema { fingerprint, root }));
                Ok(())
            }
            Err(e) => {
                *cache = None;
                Err(e)
            }
        }
    }

    /// Drop the cached compilation.
    pub fn clear(&self) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Validate `payload` against `schema`. An uncompilable schema skips
    /// validation (fail-open, logged) to match the reload contract.
    pub fn validate(&self, schema: &Value, payload: &Value) -> Vec<SchemaViolation> {
        let compiled = {
            let fingerprint = schema.to_string();
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            match cache.as_ref() {
                Some(c) if c.fingerprint == fingerprint => Some(Arc::clone(c)),
                _ => None,
            }
        };
        let compiled = match compiled {
            Some(c) => c,
            None => match self.prepare(schema) {
                Ok(()) => {
                    let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                    match cache.as_ref() {
                        Some(c) => Arc::clone(c),
                        None => return Vec::new(),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "JSON schema failed to compile; skipping validation");
                    return Vec::new();
                }
            },
        };

        let mut violations = Vec::new();
        check_node(&compiled.root, payload, "", &mut violations);
        violations
    }
}
