use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::context::ExecContext;
use crate::error::ExecutorError;
use crate::registry::Executor;

/// Expected config shape for HTTP nodes.
#[derive(Debug, Deserialize)]
struct HttpConfig {
  method: String,
  url: String,
  #[serde(default)]
  headers: HashMap<String, String>,
  #[serde(default)]
  body: Option<Value>,
}

/// HTTP request executor.
///
/// 4xx responses are permanent failures, 5xx and transport errors are
/// transient. The response body is parsed as JSON when possible.
pub struct HttpExecutor {
  client: Client,
}

impl HttpExecutor {
  pub fn new() -> Self {
    Self {
      client: Client::new(),
    }
  }
}

impl Default for HttpExecutor {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Executor for HttpExecutor {
  fn validate(&self, config: &Map<String, Value>) -> Vec<String> {
    let mut errs = Vec::new();
    match config.get("method").and_then(|v| v.as_str()) {
      Some(method) if parse_method(method).is_ok() => {}
      Some(method) => errs.push(format!("unsupported HTTP method: {}", method)),
      None => errs.push("missing 'method'".to_string()),
    }
    if config.get("url").and_then(|v| v.as_str()).is_none() {
      errs.push("missing 'url'".to_string());
    }
    errs
  }

  async fn execute(
    &self,
    ctx: &ExecContext,
    resolved_config: &Map<String, Value>,
    _input: &Value,
  ) -> Result<Value, ExecutorError> {
    let config: HttpConfig = serde_json::from_value(Value::Object(resolved_config.clone()))
      .map_err(|e| ExecutorError::permanent(format!("invalid http config: {}", e)))?;

    let method = parse_method(&config.method)
      .map_err(|m| ExecutorError::permanent(format!("unsupported HTTP method: {}", m)))?;

    let mut request = self.client.request(method, &config.url);
    for (key, value) in &config.headers {
      request = request.header(key, value);
    }
    if let Some(body) = &config.body {
      request = request.json(body);
    }
    if let Some(remaining) = ctx.remaining() {
      request = request.timeout(remaining.max(Duration::from_millis(1)));
    }

    let response = tokio::select! {
      r = request.send() => r,
      _ = ctx.cancel.cancelled() => {
        return Err(ExecutorError::permanent("cancelled"));
      }
    }
    .map_err(|e| {
      if e.is_timeout() || e.is_connect() {
        ExecutorError::transient(e.to_string())
      } else {
        ExecutorError::permanent(e.to_string())
      }
    })?;

    let status = response.status();
    let headers: HashMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(k, v)| {
        v.to_str()
          .ok()
          .map(|val| (k.as_str().to_string(), val.to_string()))
      })
      .collect();

    let body = response
      .text()
      .await
      .map_err(|e| ExecutorError::transient(e.to_string()))?;
    let body_value = serde_json::from_str(&body).unwrap_or(Value::String(body));

    if status.is_server_error() {
      return Err(ExecutorError::transient(format!(
        "upstream returned {}",
        status
      )));
    }
    if status.is_client_error() {
      return Err(ExecutorError::permanent(format!(
        "upstream returned {}",
        status
      )));
    }

    Ok(serde_json::json!({
      "status": status.as_u16(),
      "headers": headers,
      "body": body_value,
    }))
  }
}

fn parse_method(method: &str) -> Result<Method, &str> {
  match method.to_uppercase().as_str() {
    "GET" => Ok(Method::GET),
    "POST" => Ok(Method::POST),
    "PUT" => Ok(Method::PUT),
    "DELETE" => Ok(Method::DELETE),
    "PATCH" => Ok(Method::PATCH),
    "HEAD" => Ok(Method::HEAD),
    "OPTIONS" => Ok(Method::OPTIONS),
    _ => Err(method),
  }
}
