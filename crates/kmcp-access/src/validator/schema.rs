//! Request-body validation against the server's OpenAPI v2 document
//!
//! The document at `/openapi/v2` is indexed by the
//! `x-kubernetes-group-version-kind` extension and cached for
//! [`SCHEMA_CACHE_TTL`]. Bodies are checked for unknown fields and for
//! primitive type mismatches, the way `kubectl --validate` reports them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{HttpValidator, ValidationRequest};
use crate::client_cell::ClientCell;
use crate::error::AccessError;

/// Registry name of the schema validator
pub const SCHEMA_VALIDATOR: &str = "schema";

/// How long a fetched OpenAPI document is reused
pub const SCHEMA_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

const OPENAPI_PATH: &str = "/openapi/v2";
const DEFINITION_REF_PREFIX: &str = "#/definitions/";

/// OpenAPI v2 definitions indexed by group/version/kind
#[derive(Debug, Default)]
pub struct SchemaIndex {
    definitions: Map<String, Value>,
    by_kind: HashMap<(String, String, String), String>,
}

impl SchemaIndex {
    /// Index the definitions of an OpenAPI v2 document
    pub fn from_document(document: Value) -> Self {
        let definitions = match document {
            Value::Object(mut root) => match root.remove("definitions") {
                Some(Value::Object(definitions)) => definitions,
                _ => Map::new(),
            },
            _ => Map::new(),
        };

        let mut by_kind = HashMap::new();
        for (name, definition) in &definitions {
            let Some(gvks) = definition
                .get("x-kubernetes-group-version-kind")
                .and_then(Value::as_array)
            else {
                continue;
            };
            for gvk in gvks {
                let field = |key: &str| {
                    gvk.get(key)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                by_kind.insert((field("group"), field("version"), field("kind")), name.clone());
            }
        }

        Self { definitions, by_kind }
    }

    /// Number of kinds with a schema
    pub fn kinds(&self) -> usize {
        self.by_kind.len()
    }

    /// Validate an object; returns every violation found
    ///
    /// Objects whose kind has no schema are accepted.
    pub fn validate(&self, object: &Value) -> Result<(), Vec<String>> {
        let api_version = object.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
        let kind = object.get("kind").and_then(Value::as_str).unwrap_or_default();
        let (group, version) = api_version.rsplit_once('/').unwrap_or(("", api_version));

        let key = (group.to_string(), version.to_string(), kind.to_string());
        let Some(name) = self.by_kind.get(&key) else {
            return Ok(());
        };
        let Some(schema) = self.definitions.get(name) else {
            return Ok(());
        };

        let mut errors = Vec::new();
        self.check(name, schema, object, kind, &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn resolve<'a>(&'a self, name: &'a str, schema: &'a Value) -> (&'a str, &'a Value) {
        match schema
            .get("$ref")
            .and_then(Value::as_str)
            .and_then(|r| r.strip_prefix(DEFINITION_REF_PREFIX))
        {
            Some(target) => match self.definitions.get_key_value(target) {
                Some((target, definition)) => (target.as_str(), definition),
                None => (name, schema),
            },
            None => (name, schema),
        }
    }

    fn check(
        &self,
        name: &str,
        schema: &Value,
        value: &Value,
        path: &str,
        errors: &mut Vec<String>,
    ) {
        let (name, schema) = self.resolve(name, schema);
        if value.is_null() {
            return;
        }

        if let Some(expected) = schema.get("type").and_then(Value::as_str) {
            if !type_matches(expected, schema, value) {
                errors.push(format!(
                    "ValidationError({path}): invalid type for {name}: got \"{}\", expected \"{expected}\"",
                    json_type(value)
                ));
                return;
            }
        }

        match value {
            Value::Object(fields) => {
                let preserve_unknown = schema
                    .get("x-kubernetes-preserve-unknown-fields")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                    for (key, child) in fields {
                        match properties.get(key) {
                            Some(property) => {
                                self.check(name, property, child, &format!("{path}.{key}"), errors)
                            }
                            None if preserve_unknown || schema.get("additionalProperties").is_some() => {}
                            None => errors.push(format!(
                                "ValidationError({path}): unknown field \"{key}\" in {name}"
                            )),
                        }
                    }
                } else if let Some(additional) =
                    schema.get("additionalProperties").filter(|a| a.is_object())
                {
                    for (key, child) in fields {
                        self.check(name, additional, child, &format!("{path}.{key}"), errors);
                    }
                }
            }
            Value::Array(items) => {
                if let Some(item_schema) = schema.get("items") {
                    for (i, item) in items.iter().enumerate() {
                        self.check(name, item_schema, item, &format!("{path}[{i}]"), errors);
                    }
                }
            }
            _ => {}
        }
    }
}

fn type_matches(expected: &str, schema: &Value, value: &Value) -> bool {
    let int_or_string = schema.get("format").and_then(Value::as_str) == Some("int-or-string")
        || schema
            .get("x-kubernetes-int-or-string")
            .and_then(Value::as_bool)
            .unwrap_or(false);
    if int_or_string {
        return value.is_string() || value.is_i64() || value.is_u64();
    }
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Field name from an `unknown field "<name>"` message
pub(crate) fn unknown_field(message: &str) -> Option<&str> {
    let start = message.find("unknown field \"")? + "unknown field \"".len();
    let rest = &message[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// JSON or YAML body as a JSON value
fn parse_body(body: &[u8]) -> Option<Value> {
    serde_json::from_slice(body)
        .ok()
        .or_else(|| serde_yaml::from_slice(body).ok())
        .filter(Value::is_object)
}

struct CachedIndex {
    index: Arc<SchemaIndex>,
    fetched_at: Instant,
}

/// Validates create and update bodies against the OpenAPI schema
pub struct SchemaValidator {
    client: ClientCell,
    ttl: Duration,
    cache: RwLock<Option<CachedIndex>>,
}

impl SchemaValidator {
    /// Validator fetching schemas through `client`
    pub fn new(client: ClientCell) -> Self {
        Self::with_ttl(client, SCHEMA_CACHE_TTL)
    }

    /// Validator with a custom cache lifetime
    pub fn with_ttl(client: ClientCell, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            cache: RwLock::new(None),
        }
    }

    async fn index(&self) -> Result<Arc<SchemaIndex>, String> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.index.clone());
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.index.clone());
            }
        }

        let client = self
            .client
            .get()
            .ok_or_else(|| "schema client is not initialized".to_string())?;
        let request = http::Request::get(OPENAPI_PATH)
            .body(Vec::new())
            .map_err(|e| e.to_string())?;
        let text = client.request_text(request).await.map_err(|e| e.to_string())?;
        let document: Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;

        let index = Arc::new(SchemaIndex::from_document(document));
        debug!(kinds = index.kinds(), "Loaded OpenAPI schema");
        *cache = Some(CachedIndex {
            index: index.clone(),
            fetched_at: Instant::now(),
        });
        Ok(index)
    }
}

#[async_trait]
impl HttpValidator for SchemaValidator {
    fn name(&self) -> &'static str {
        SCHEMA_VALIDATOR
    }

    async fn validate(&self, request: &ValidationRequest) -> Result<(), AccessError> {
        if !matches!(request.verb.as_str(), "create" | "update") {
            return Ok(());
        }
        let Some(body) = request.body.as_ref().filter(|b| !b.is_empty()) else {
            return Ok(());
        };
        let Some(object) = parse_body(body) else {
            debug!(
                resource = %request.gvr.qualified_resource(),
                "Body is not a parseable object, skipping schema check"
            );
            return Ok(());
        };

        let index = match self.index().await {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "Failed to load OpenAPI schema, allowing request");
                return Ok(());
            }
        };

        index.validate(&object).map_err(|errors| {
            let field = errors
                .iter()
                .find_map(|e| unknown_field(e))
                .unwrap_or_default()
                .to_string();
            AccessError::InvalidField {
                field,
                message: errors.join("; "),
            }
        })
    }
}
