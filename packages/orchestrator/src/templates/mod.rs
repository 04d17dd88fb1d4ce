// ABOUTME: Template renderer turning a service kind plus overrides into a concrete mock definition
// ABOUTME: Pure data substitution into a fixed per-kind schema; no caller expression is ever evaluated

mod builtin;

use crate::error::TemplateError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Path every mock answers for readiness and health probes
pub const HEALTH_PATH: &str = "/_mockbox/health";

const RESPONSES_KEY: &str = "responses";
const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// One endpoint of a template before substitution
#[derive(Debug, Clone)]
pub struct EndpointTemplate {
    pub method: &'static str,
    pub path: &'static str,
    pub status: u16,
    pub body: Value,
}

impl EndpointTemplate {
    pub fn new(method: &'static str, path: &'static str, status: u16, body: Value) -> Self {
        Self {
            method,
            path,
            status,
            body,
        }
    }

    pub fn get(path: &'static str, body: Value) -> Self {
        Self::new("GET", path, 200, body)
    }
}

/// A known service kind: typed parameters with defaults and endpoint shapes
#[derive(Debug, Clone)]
pub struct ServiceTemplate {
    pub kind: &'static str,
    pub description: &'static str,
    pub parameters: Vec<(&'static str, Value)>,
    pub endpoints: Vec<EndpointTemplate>,
}

/// A fully substituted endpoint served by a mock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedEndpoint {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub body: Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Concrete behaviour definition for one mock service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedArtifact {
    pub service_name: String,
    pub endpoints: Vec<RenderedEndpoint>,
}

impl RenderedArtifact {
    /// Distinct endpoint paths, sorted
    pub fn endpoint_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.endpoints.iter().map(|e| e.path.clone()).collect();
        paths.dedup();
        paths
    }

    pub fn find(&self, method: &str, path: &str) -> Option<&RenderedEndpoint> {
        self.endpoints
            .iter()
            .find(|e| e.method.eq_ignore_ascii_case(method) && e.path == path)
    }
}

/// Catalog entry for `GET /templates`
#[derive(Debug, Clone, Serialize)]
pub struct TemplateSummary {
    pub kind: String,
    pub description: String,
    pub parameters: Map<String, Value>,
    pub endpoints: Vec<String>,
}

pub struct TemplateRenderer {
    templates: BTreeMap<&'static str, ServiceTemplate>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self::with_templates(builtin::builtin_templates())
    }

    pub fn with_templates(templates: Vec<ServiceTemplate>) -> Self {
        Self {
            templates: templates.into_iter().map(|t| (t.kind, t)).collect(),
        }
    }

    pub fn is_known(&self, service_name: &str) -> bool {
        self.templates.contains_key(service_name)
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.templates.keys().copied().collect()
    }

    pub fn catalog(&self) -> Vec<TemplateSummary> {
        self.templates
            .values()
            .map(|template| {
                let parameters = template
                    .parameters
                    .iter()
                    .map(|(name, default)| (name.to_string(), default.clone()))
                    .collect();
                TemplateSummary {
                    kind: template.kind.to_string(),
                    description: template.description.to_string(),
                    parameters,
                    endpoints: template
                        .endpoints
                        .iter()
                        .map(|e| format!("{} {}", e.method, e.path))
                        .collect(),
                }
            })
            .collect()
    }

    /// Render `service_name` with `custom_config` overrides.
    ///
    /// The result depends only on the arguments; identical inputs give identical artifacts.
    pub fn render(
        &self,
        service_name: &str,
        custom_config: &Value,
    ) -> Result<RenderedArtifact, TemplateError> {
        let template = self
            .templates
            .get(service_name)
            .ok_or_else(|| TemplateError::unknown_service(service_name))?;

        let overrides = match custom_config {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(TemplateError::invalid_config(
                    service_name,
                    format!("expected a JSON object, got {}", json_type(other)),
                ))
            }
        };

        let mut params: BTreeMap<&str, Value> = template
            .parameters
            .iter()
            .map(|(name, default)| (*name, default.clone()))
            .collect();
        let mut response_overrides = Vec::new();

        for (key, value) in &overrides {
            if key == RESPONSES_KEY {
                response_overrides = parse_response_overrides(service_name, value)?;
                continue;
            }
            let slot = params.get_mut(key.as_str()).ok_or_else(|| {
                TemplateError::invalid_config(service_name, format!("unknown parameter '{}'", key))
            })?;
            if json_type(slot) != json_type(value) {
                return Err(TemplateError::invalid_config(
                    service_name,
                    format!(
                        "parameter '{}' must be {}, got {}",
                        key,
                        json_type(slot),
                        json_type(value)
                    ),
                ));
            }
            *slot = value.clone();
        }

        let mut endpoints: Vec<RenderedEndpoint> = template
            .endpoints
            .iter()
            .map(|endpoint| RenderedEndpoint {
                method: endpoint.method.to_string(),
                path: substitute_text(endpoint.path, &params),
                status: endpoint.status,
                body: substitute(&endpoint.body, &params),
                headers: BTreeMap::new(),
            })
            .collect();

        for ov in response_overrides {
            let path = substitute_text(&ov.path, &params);
            match endpoints
                .iter_mut()
                .find(|e| e.method == ov.method && e.path == path)
            {
                Some(existing) => {
                    if let Some(status) = ov.status {
                        existing.status = status;
                    }
                    if let Some(body) = ov.body {
                        existing.body = body;
                    }
                    existing.headers.extend(ov.headers);
                }
                None => endpoints.push(RenderedEndpoint {
                    method: ov.method,
                    path,
                    status: ov.status.unwrap_or(200),
                    body: ov.body.unwrap_or_else(|| Value::Object(Map::new())),
                    headers: ov.headers,
                }),
            }
        }

        if let Some(clash) = endpoints.iter().find(|e| e.path == HEALTH_PATH) {
            return Err(TemplateError::invalid_config(
                service_name,
                format!("{} {} is reserved", clash.method, HEALTH_PATH),
            ));
        }

        endpoints.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.method.cmp(&b.method)));
        endpoints.dedup_by(|a, b| a.path == b.path && a.method == b.method);

        Ok(RenderedArtifact {
            service_name: service_name.to_string(),
            endpoints,
        })
    }
}

struct ResponseOverride {
    method: String,
    path: String,
    status: Option<u16>,
    body: Option<Value>,
    headers: BTreeMap<String, String>,
}

fn parse_response_overrides(
    service: &str,
    value: &Value,
) -> Result<Vec<ResponseOverride>, TemplateError> {
    let entries = value.as_object().ok_or_else(|| {
        TemplateError::invalid_config(service, "'responses' must be an object")
    })?;

    let mut parsed = Vec::with_capacity(entries.len());
    for (key, entry) in entries {
        let (method, path) = key
            .trim()
            .split_once(' ')
            .map(|(m, p)| (m.to_ascii_uppercase(), p.trim().to_string()))
            .ok_or_else(|| {
                TemplateError::invalid_config(
                    service,
                    format!("response key '{}' must look like 'GET /path'", key),
                )
            })?;
        if !ALLOWED_METHODS.contains(&method.as_str()) || !path.starts_with('/') {
            return Err(TemplateError::invalid_config(
                service,
                format!("response key '{}' must look like 'GET /path'", key),
            ));
        }

        let fields = entry.as_object().ok_or_else(|| {
            TemplateError::invalid_config(service, format!("response '{}' must be an object", key))
        })?;

        let mut ov = ResponseOverride {
            method,
            path,
            status: None,
            body: None,
            headers: BTreeMap::new(),
        };
        for (field, v) in fields {
            match field.as_str() {
                "status" => {
                    let status = v
                        .as_u64()
                        .filter(|s| (100..=599).contains(s))
                        .ok_or_else(|| {
                            TemplateError::invalid_config(
                                service,
                                format!("response '{}' status must be 100-599", key),
                            )
                        })?;
                    ov.status = Some(status as u16);
                }
                "body" => ov.body = Some(v.clone()),
                "headers" => {
                    let headers = v.as_object().ok_or_else(|| {
                        TemplateError::invalid_config(
                            service,
                            format!("response '{}' headers must be an object", key),
                        )
                    })?;
                    for (name, hv) in headers {
                        let hv = hv.as_str().ok_or_else(|| {
                            TemplateError::invalid_config(
                                service,
                                format!("header '{}' must be a string", name),
                            )
                        })?;
                        ov.headers.insert(name.to_ascii_lowercase(), hv.to_string());
                    }
                }
                other => {
                    return Err(TemplateError::invalid_config(
                        service,
                        format!("response '{}' has unknown field '{}'", key, other),
                    ))
                }
            }
        }
        parsed.push(ov);
    }
    Ok(parsed)
}

fn substitute(value: &Value, params: &BTreeMap<&str, Value>) -> Value {
    match value {
        Value::String(s) => match whole_placeholder(s).and_then(|name| params.get(name)) {
            Some(param) => param.clone(),
            None => Value::String(substitute_text(s, params)),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, params)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn whole_placeholder(s: &str) -> Option<&str> {
    s.strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map(str::trim)
        .filter(|name| !name.contains("{{") && !name.contains("}}"))
}

/// Replace inline `{{name}}` occurrences with scalar parameter text; anything else stays verbatim.
fn substitute_text(input: &str, params: &BTreeMap<&str, Value>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = after[..close].trim();
        match params.get(name).and_then(scalar_text) {
            Some(text) => out.push_str(&text),
            None => out.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TemplateErrorKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_unknown_service() {
        let renderer = TemplateRenderer::new();
        let err = renderer.render("jira", &json!({})).unwrap_err();
        assert_eq!(err.kind, TemplateErrorKind::UnknownService);
    }

    #[test]
    fn test_generic_defaults() {
        let renderer = TemplateRenderer::new();
        let artifact = renderer.render("generic", &Value::Null).unwrap();
        assert_eq!(artifact.endpoint_paths(), vec!["/items", "/status"]);

        let list = artifact.find("GET", "/items").unwrap();
        assert_eq!(list.body[0]["name"], "Item 1");
        let create = artifact.find("post", "/items").unwrap();
        assert_eq!(create.status, 201);
    }

    #[test]
    fn test_parameter_substitution() {
        let renderer = TemplateRenderer::new();
        let artifact = renderer
            .render(
                "slack",
                &json!({ "workspace": "acme", "channels": ["eng"] }),
            )
            .unwrap();

        let auth = artifact.find("POST", "/api/auth.test").unwrap();
        assert_eq!(auth.body["team"], "acme");
        assert_eq!(auth.body["url"], "https://acme.slack.com/");

        let channels = artifact.find("GET", "/api/conversations.list").unwrap();
        assert_eq!(channels.body["channels"], json!(["eng"]));
    }

    #[test]
    fn test_path_substitution() {
        let renderer = TemplateRenderer::new();
        let artifact = renderer
            .render("github", &json!({ "owner": "octo", "repo": "demo" }))
            .unwrap();
        assert!(artifact.find("GET", "/repos/octo/demo").is_some());
        assert_eq!(
            artifact.find("GET", "/repos/octo/demo").unwrap().body["full_name"],
            "octo/demo"
        );
    }

    #[test]
    fn test_response_overrides() {
        let renderer = TemplateRenderer::new();
        let config = json!({
            "responses": {
                "GET /status": { "status": 503, "body": { "status": "down" } },
                "delete /items/1": { "status": 204, "headers": { "X-Mock": "yes" } }
            }
        });
        let artifact = renderer.render("generic", &config).unwrap();

        let status = artifact.find("GET", "/status").unwrap();
        assert_eq!(status.status, 503);
        assert_eq!(status.body, json!({ "status": "down" }));

        let added = artifact.find("DELETE", "/items/1").unwrap();
        assert_eq!(added.status, 204);
        assert_eq!(added.headers.get("x-mock").map(String::as_str), Some("yes"));
    }

    #[test]
    fn test_invalid_configs() {
        let renderer = TemplateRenderer::new();
        let cases = [
            json!("not an object"),
            json!({ "unknown_key": 1 }),
            json!({ "workspace": 42 }),
            json!({ "responses": [] }),
            json!({ "responses": { "/no-method": {} } }),
            json!({ "responses": { "GET /x": { "status": 42 } } }),
            json!({ "responses": { "GET /x": { "script": "rm -rf /" } } }),
            json!({ "responses": { "GET /_mockbox/health": {} } }),
        ];
        for config in cases {
            let err = renderer.render("slack", &config).unwrap_err();
            assert_eq!(err.kind, TemplateErrorKind::InvalidConfig, "config: {}", config);
        }
    }

    #[test]
    fn test_placeholders_are_not_evaluated() {
        let renderer = TemplateRenderer::new();
        let artifact = renderer
            .render("generic", &json!({ "service_name": "{{items}}" }))
            .unwrap();
        let status = artifact.find("GET", "/status").unwrap();
        assert_eq!(status.body["service"], "{{items}}");
    }

    #[test]
    fn test_render_is_deterministic() {
        let renderer = TemplateRenderer::new();
        let config = json!({ "file_key": "abc", "responses": { "GET /v1/extra": {} } });
        let a = renderer.render("figma", &config).unwrap();
        let b = renderer.render("figma", &config).unwrap();
        assert_eq!(a, b);
        let mut sorted = a.endpoints.clone();
        sorted.sort_by(|x, y| x.path.cmp(&y.path).then_with(|| x.method.cmp(&y.method)));
        assert_eq!(a.endpoints, sorted);
    }

    #[test]
    fn test_catalog_lists_builtin_kinds() {
        let renderer = TemplateRenderer::new();
        let kinds: Vec<String> = renderer.catalog().into_iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec!["figma", "generic", "github", "slack"]);
    }
}
