//! OpenAPI 3 documents reduced to what the fuzzer consumes: operations,
//! their parameters, request bodies and responses, each with one
//! deterministic example value.

use serde_json::{Map, Value as Json};

use std::collections::BTreeMap;
use std::path::Path;

use crate::{Location, Method, RestFuzzError, RestFuzzResult};

/// Response keys never used as generation or coverage targets.
pub const EXCLUDED_STATUS: [&str; 4] = ["default", "401", "403", "500"];

const MAX_EXAMPLE_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct ApiSpec {
    pub title: String,
    pub servers: Vec<String>,
    /// Sorted by path; this order is the global coverage ordering.
    pub paths: BTreeMap<String, PathSpec>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathSpec {
    pub parameters: Vec<ParameterSpec>,
    pub operations: BTreeMap<Method, OperationSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub location: Location,
    pub example: Json,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSpec {
    pub content_type: String,
    pub example: Json,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSpec {
    pub status: String,
    pub content: Vec<MediaSpec>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationSpec {
    pub parameters: Vec<ParameterSpec>,
    pub request_body: Vec<MediaSpec>,
    pub responses: Vec<ResponseSpec>,
}

impl ResponseSpec {
    pub fn is_excluded(&self) -> bool {
        EXCLUDED_STATUS.contains(&self.status.as_str())
    }

    /// Numeric status code; `None` for keys like `default` or `2XX`.
    pub fn code(&self) -> Option<u16> {
        self.status.parse().ok()
    }
}

impl OperationSpec {
    /// Responses that are generation and coverage targets: numeric and not excluded.
    pub fn included_responses(&self) -> impl Iterator<Item = &ResponseSpec> {
        self.responses.iter().filter(|r| !r.is_excluded() && r.code().is_some())
    }
}

impl ApiSpec {
    pub fn load(path: &Path) -> RestFuzzResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.eq_ignore_ascii_case("json"));
        let doc: Json = if is_json {
            serde_json::from_str(&text)?
        } else {
            serde_yaml::from_str(&text)?
        };
        Self::from_document(&doc).map_err(|e| match e {
            RestFuzzError::Config(msg) => RestFuzzError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn from_document(doc: &Json) -> RestFuzzResult<Self> {
        let version = match doc.get("openapi") {
            Some(Json::String(s)) => s.clone(),
            Some(Json::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        if !version.starts_with('3') {
            return Err(RestFuzzError::Config(format!(
                "unsupported document version {version:?} (expected openapi 3.x)"
            )));
        }

        let title = doc
            .pointer("/info/title")
            .and_then(Json::as_str)
            .unwrap_or("untitled")
            .to_string();
        let servers = doc
            .get("servers")
            .and_then(Json::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|s| s.get("url").and_then(Json::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let Some(raw_paths) = doc.get("paths").and_then(Json::as_object) else {
            return Err(RestFuzzError::Config("document has no paths".to_string()));
        };

        let examples = ExampleGenerator { doc };
        let mut paths = BTreeMap::new();
        for (path, item) in raw_paths {
            let item = examples.resolve(item)?;
            let parameters = examples.parameters(item.get("parameters"))?;
            let mut operations = BTreeMap::new();
            for method in Method::PRIORITY {
                let Some(op) = item.get(method.as_str().to_ascii_lowercase()) else {
                    continue;
                };
                operations.insert(method, examples.operation(op)?);
            }
            paths.insert(path.clone(), PathSpec { parameters, operations });
        }

        Ok(Self { title, servers, paths })
    }

    pub fn operation(&self, path: &str, method: Method) -> Option<&OperationSpec> {
        self.paths.get(path)?.operations.get(&method)
    }

    pub fn operation_count(&self) -> usize {
        self.paths.values().map(|p| p.operations.len()).sum()
    }

    /// Path-level and operation-level parameters, operation-level winning on a
    /// name collision, ordered by name.
    pub fn merged_parameters(&self, path: &str, method: Method) -> Vec<&ParameterSpec> {
        let mut merged: BTreeMap<&str, &ParameterSpec> = BTreeMap::new();
        if let Some(item) = self.paths.get(path) {
            for p in &item.parameters {
                merged.insert(&p.name, p);
            }
            if let Some(op) = item.operations.get(&method) {
                for p in &op.parameters {
                    merged.insert(&p.name, p);
                }
            }
        }
        merged.into_values().collect()
    }

    /// First usable server URL: not "/", not a ".local" host, not templated.
    pub fn server(&self) -> RestFuzzResult<String> {
        self.servers
            .iter()
            .find(|s| s.as_str() != "/" && !s.ends_with(".local") && !s.ends_with('}'))
            .map(|s| s.trim_end_matches('/').to_string())
            .ok_or_else(|| RestFuzzError::Config("invalid server url".to_string()))
    }
}

struct ExampleGenerator<'a> {
    doc: &'a Json,
}

impl<'a> ExampleGenerator<'a> {
    fn resolve(&self, node: &'a Json) -> RestFuzzResult<&'a Json> {
        let mut cur = node;
        for _ in 0..MAX_EXAMPLE_DEPTH {
            let Some(reference) = cur.get("$ref").and_then(Json::as_str) else {
                return Ok(cur);
            };
            let pointer = reference
                .strip_prefix('#')
                .ok_or_else(|| RestFuzzError::Config(format!("external reference {reference:?} is not supported")))?;
            cur = self
                .doc
                .pointer(pointer)
                .ok_or_else(|| RestFuzzError::Config(format!("dangling reference {reference:?}")))?;
        }
        Err(RestFuzzError::Config("reference chain too deep".to_string()))
    }

    fn parameters(&self, list: Option<&'a Json>) -> RestFuzzResult<Vec<ParameterSpec>> {
        let mut out = Vec::new();
        for raw in list.and_then(Json::as_array).into_iter().flatten() {
            let p = self.resolve(raw)?;
            let Some(name) = p.get("name").and_then(Json::as_str) else {
                return Err(RestFuzzError::Config("parameter without a name".to_string()));
            };
            let location = p.get("in").and_then(Json::as_str).unwrap_or("query").to_string();
            out.push(ParameterSpec {
                name: name.to_string(),
                location: Location::from(location),
                example: self.declared_example(p)?.unwrap_or_else(|| Json::String(String::new())),
            });
        }
        Ok(out)
    }

    fn operation(&self, op: &'a Json) -> RestFuzzResult<OperationSpec> {
        let parameters = self.parameters(op.get("parameters"))?;
        let request_body = match op.get("requestBody") {
            Some(rb) => self.content(self.resolve(rb)?.get("content"))?,
            None => Vec::new(),
        };
        let mut responses = Vec::new();
        if let Some(map) = op.get("responses").and_then(Json::as_object) {
            for (status, raw) in map {
                let resp = self.resolve(raw)?;
                responses.push(ResponseSpec {
                    status: status.clone(),
                    content: self.content(resp.get("content"))?,
                });
            }
        }
        Ok(OperationSpec {
            parameters,
            request_body,
            responses,
        })
    }

    fn content(&self, content: Option<&'a Json>) -> RestFuzzResult<Vec<MediaSpec>> {
        let mut out = Vec::new();
        if let Some(map) = content.and_then(Json::as_object) {
            for (content_type, media) in map {
                out.push(MediaSpec {
                    content_type: content_type.clone(),
                    example: self.declared_example(media)?.unwrap_or(Json::Null),
                });
            }
        }
        Ok(out)
    }

    /// `example`, first of `examples`, then the schema's example.
    fn declared_example(&self, holder: &'a Json) -> RestFuzzResult<Option<Json>> {
        if let Some(ex) = holder.get("example") {
            return Ok(Some(ex.clone()));
        }
        if let Some(first) = holder.get("examples").and_then(Json::as_object).and_then(|m| m.values().next()) {
            let ex = self.resolve(first)?;
            if let Some(v) = ex.get("value") {
                return Ok(Some(v.clone()));
            }
        }
        match holder.get("schema") {
            Some(schema) => self.schema_example(schema, 0).map(Some),
            None => Ok(None),
        }
    }

    fn schema_example(&self, schema: &'a Json, depth: usize) -> RestFuzzResult<Json> {
        if depth > MAX_EXAMPLE_DEPTH {
            return Ok(Json::Null);
        }
        let schema = self.resolve(schema)?;
        for key in ["example", "default"] {
            if let Some(v) = schema.get(key) {
                return Ok(v.clone());
            }
        }
        if let Some(first) = schema.get("enum").and_then(Json::as_array).and_then(|e| e.first()) {
            return Ok(first.clone());
        }
        if let Some(parts) = schema.get("allOf").and_then(Json::as_array) {
            let mut merged = Map::new();
            for part in parts {
                if let Json::Object(m) = self.schema_example(part, depth + 1)? {
                    merged.extend(m);
                }
            }
            return Ok(Json::Object(merged));
        }
        for key in ["oneOf", "anyOf"] {
            if let Some(first) = schema.get(key).and_then(Json::as_array).and_then(|e| e.first()) {
                return self.schema_example(first, depth + 1);
            }
        }

        let ty = match schema.get("type") {
            Some(Json::String(t)) => Some(t.as_str()),
            Some(Json::Array(types)) => types.iter().filter_map(Json::as_str).find(|t| *t != "null"),
            _ => None,
        };
        let ty = ty.or_else(|| schema.get("properties").map(|_| "object"));

        Ok(match ty {
            Some("string") => Json::String(
                match schema.get("format").and_then(Json::as_str) {
                    Some("date-time") => "1970-01-01T00:00:00Z",
                    Some("date") => "1970-01-01",
                    Some("uuid") => "00000000-0000-0000-0000-000000000000",
                    Some("email") => "user@example.com",
                    Some("uri") | Some("url") => "http://example.com",
                    Some("byte") => "c3RyaW5n",
                    _ => "string",
                }
                .to_string(),
            ),
            Some("integer") => Json::from(schema.get("minimum").and_then(Json::as_i64).unwrap_or(0)),
            Some("number") => schema
                .get("minimum")
                .and_then(Json::as_f64)
                .and_then(serde_json::Number::from_f64)
                .map(Json::Number)
                .unwrap_or_else(|| Json::from(0)),
            Some("boolean") => Json::Bool(true),
            Some("array") => match schema.get("items") {
                Some(items) => Json::Array(vec![self.schema_example(items, depth + 1)?]),
                None => Json::Array(Vec::new()),
            },
            Some("object") => {
                let mut out = Map::new();
                if let Some(props) = schema.get("properties").and_then(Json::as_object) {
                    for (name, prop) in props {
                        out.insert(name.clone(), self.schema_example(prop, depth + 1)?);
                    }
                }
                Json::Object(out)
            }
            _ => Json::Null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PETSTORE: &str = r##"
openapi: 3.0.3
info:
  title: Pet Store
servers:
  - url: http://{host}
  - url: /
  - url: http://petstore.local
  - url: http://localhost:8080/v1/
paths:
  /pets:
    get:
      parameters:
        - name: limit
          in: query
          schema: { type: integer, minimum: 1 }
      responses:
        "200":
          description: ok
          content:
            application/json:
              schema:
                type: array
                items: { $ref: "#/components/schemas/Pet" }
        default:
          description: err
    post:
      requestBody:
        content:
          application/json:
            schema: { $ref: "#/components/schemas/Pet" }
          application/xml:
            schema: { $ref: "#/components/schemas/Pet" }
      responses:
        "201": { description: created }
        "401": { description: unauthorized }
  /pets/{petId}:
    parameters:
      - name: petId
        in: path
        schema: { type: string }
      - $ref: "#/components/parameters/Trace"
    delete:
      parameters:
        - name: petId
          in: path
          example: 42
      responses:
        "204": { description: gone }
components:
  parameters:
    Trace:
      name: X-Trace
      in: header
      schema: { type: string, format: uuid }
  schemas:
    Pet:
      type: object
      properties:
        id: { type: integer }
        name: { type: string, example: doggie }
        status: { type: string, enum: [available, sold] }
        tags:
          type: array
          items: { type: string }
"##;

    fn petstore() -> ApiSpec {
        let doc: Json = serde_yaml::from_str(PETSTORE).expect("yaml");
        ApiSpec::from_document(&doc).expect("spec")
    }

    #[test]
    fn operations_and_counts() {
        let spec = petstore();
        assert_eq!(spec.title, "Pet Store");
        assert_eq!(spec.operation_count(), 3);
        assert_eq!(spec.paths.keys().collect::<Vec<_>>(), vec!["/pets", "/pets/{petId}"]);
        assert!(spec.operation("/pets", Method::Post).is_some());
        assert!(spec.operation("/pets", Method::Delete).is_none());
    }

    #[test]
    fn server_skips_unusable_urls() {
        assert_eq!(petstore().server().expect("server"), "http://localhost:8080/v1");
        let mut spec = petstore();
        spec.servers = vec!["/".to_string()];
        assert!(spec.server().is_err());
    }

    #[test]
    fn examples_follow_refs_and_preferences() {
        let spec = petstore();
        let post = spec.operation("/pets", Method::Post).expect("post");
        let json = post
            .request_body
            .iter()
            .find(|m| m.content_type == "application/json")
            .expect("json body");
        assert_eq!(
            json.example,
            serde_json::json!({"id": 0, "name": "doggie", "status": "available", "tags": ["string"]})
        );

        let get = spec.operation("/pets", Method::Get).expect("get");
        assert_eq!(get.parameters[0].example, serde_json::json!(1));
        assert_eq!(get.included_responses().count(), 1);
        assert_eq!(post.included_responses().map(|r| r.status.as_str()).collect::<Vec<_>>(), vec!["201"]);
    }

    #[test]
    fn operation_parameters_override_path_parameters() {
        let spec = petstore();
        let merged = spec.merged_parameters("/pets/{petId}", Method::Delete);
        let names: Vec<&str> = merged.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["X-Trace", "petId"]);
        assert_eq!(merged[1].example, serde_json::json!(42));
        assert_eq!(merged[0].location, Location::Header);
        assert_eq!(merged[0].example, serde_json::json!("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn swagger_two_is_rejected() {
        let doc = serde_json::json!({"swagger": "2.0", "paths": {}});
        assert!(matches!(ApiSpec::from_document(&doc), Err(RestFuzzError::Config(_))));
    }
}
