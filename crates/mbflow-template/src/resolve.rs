use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};

use crate::error::TemplateError;
use crate::scope::Scope;

fn environment<'source>(strict: bool) -> Environment<'source> {
  let mut env = Environment::new();
  env.set_undefined_behavior(if strict {
    UndefinedBehavior::Strict
  } else {
    UndefinedBehavior::Lenient
  });
  env
}

/// Whether a string is exactly one `{{ … }}` placeholder.
fn whole_placeholder(s: &str) -> Option<&str> {
  let trimmed = s.trim();
  let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
  if inner.contains("{{") || inner.contains("}}") {
    return None;
  }
  Some(inner.trim())
}

/// Resolve a template-bearing value against the scope.
///
/// Maps and lists are walked structurally. A string that is a single
/// placeholder resolves to the native value of its path; any other string
/// containing placeholders renders as text. In lenient mode a missing path
/// becomes `null` (whole placeholder) or the empty string (interpolation);
/// in strict mode it is an error.
pub fn resolve_value(value: &Value, scope: &Scope, strict: bool) -> Result<Value, TemplateError> {
  match value {
    Value::String(s) => resolve_string(s, scope, strict),
    Value::Array(items) => {
      let mut resolved = Vec::with_capacity(items.len());
      for item in items {
        resolved.push(resolve_value(item, scope, strict)?);
      }
      Ok(Value::Array(resolved))
    }
    Value::Object(map) => {
      let mut resolved = Map::with_capacity(map.len());
      for (key, item) in map {
        resolved.insert(key.clone(), resolve_value(item, scope, strict)?);
      }
      Ok(Value::Object(resolved))
    }
    other => Ok(other.clone()),
  }
}

/// Resolve every value of a node config map.
pub fn resolve_config(
  config: &Map<String, Value>,
  scope: &Scope,
  strict: bool,
) -> Result<Map<String, Value>, TemplateError> {
  let mut resolved = Map::with_capacity(config.len());
  for (key, value) in config {
    resolved.insert(key.clone(), resolve_value(value, scope, strict)?);
  }
  Ok(resolved)
}

fn resolve_string(s: &str, scope: &Scope, strict: bool) -> Result<Value, TemplateError> {
  if !s.contains("{{") {
    return Ok(Value::String(s.to_string()));
  }

  let env = environment(strict);
  let ctx = minijinja::Value::from_serialize(scope.as_object());

  if let Some(expr) = whole_placeholder(s) {
    let compiled = env
      .compile_expression(expr)
      .map_err(|e| TemplateError::Syntax {
        template: s.to_string(),
        message: e.to_string(),
      })?;
    let evaluated = compiled.eval(ctx).map_err(|e| TemplateError::Unresolved {
      template: s.to_string(),
      message: e.to_string(),
    })?;
    if evaluated.is_undefined() {
      return if strict {
        Err(TemplateError::Unresolved {
          template: s.to_string(),
          message: format!("'{}' is undefined", expr),
        })
      } else {
        Ok(Value::Null)
      };
    }
    return serde_json::to_value(&evaluated).map_err(|e| TemplateError::Unresolved {
      template: s.to_string(),
      message: e.to_string(),
    });
  }

  env
    .render_str(s, ctx)
    .map(Value::String)
    .map_err(|e| TemplateError::Unresolved {
      template: s.to_string(),
      message: e.to_string(),
    })
}

/// Evaluate an edge condition to a boolean.
///
/// The condition sees the full scope, with the source node's output keys
/// additionally promoted to the top level so that `status == 200` reads
/// naturally on an edge out of the node that produced `status`.
pub fn eval_condition(
  expression: &str,
  scope: &Scope,
  source_output: Option<&Value>,
) -> Result<bool, TemplateError> {
  let env = environment(false);

  let mut ctx = scope.as_object().clone();
  if let Some(Value::Object(output)) = source_output {
    for (key, value) in output {
      ctx.insert(key.clone(), value.clone());
    }
  }

  let compiled = env
    .compile_expression(expression)
    .map_err(|e| TemplateError::Condition {
      expression: expression.to_string(),
      message: e.to_string(),
    })?;
  let result = compiled
    .eval(minijinja::Value::from_serialize(&ctx))
    .map_err(|e| TemplateError::Condition {
      expression: expression.to_string(),
      message: e.to_string(),
    })?;

  Ok(result.is_true())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn scope_with(node_id: &str, output: Value) -> Scope {
    let mut scope = Scope::new(
      &Map::new(),
      &Map::new(),
      &json!({"in": 5}).as_object().unwrap().clone(),
    );
    scope.set_node_output(node_id, output);
    scope
  }

  #[test]
  fn whole_placeholder_keeps_native_type() {
    let scope = scope_with("fetch", json!({"status": 200, "tags": ["a", "b"]}));
    let resolved = resolve_value(&json!("{{ fetch.status }}"), &scope, true).unwrap();
    assert_eq!(resolved, json!(200));

    let resolved = resolve_value(&json!("{{ fetch.tags }}"), &scope, true).unwrap();
    assert_eq!(resolved, json!(["a", "b"]));
  }

  #[test]
  fn embedded_placeholder_interpolates_as_string() {
    let scope = scope_with("fetch", json!({"status": 200}));
    let resolved = resolve_value(&json!("code={{ fetch.status }}!"), &scope, true).unwrap();
    assert_eq!(resolved, json!("code=200!"));
  }

  #[test]
  fn arithmetic_in_placeholder() {
    let scope = scope_with("a", json!({"out": 10}));
    let resolved = resolve_value(&json!("{{ a.out + 1 }}"), &scope, true).unwrap();
    assert_eq!(resolved, json!(11));
  }

  #[test]
  fn input_scope_is_addressable() {
    let scope = scope_with("a", json!({}));
    let resolved = resolve_value(&json!("{{ input.in * 2 }}"), &scope, true).unwrap();
    assert_eq!(resolved, json!(10));
  }

  #[test]
  fn nested_structures_resolve_in_place() {
    let scope = scope_with("fetch", json!({"status": 200}));
    let value = json!({
      "url": "http://x/{{ fetch.status }}",
      "meta": {"code": "{{ fetch.status }}"},
      "list": [1, "{{ fetch.status }}"]
    });
    let resolved = resolve_value(&value, &scope, true).unwrap();
    assert_eq!(
      resolved,
      json!({
        "url": "http://x/200",
        "meta": {"code": 200},
        "list": [1, 200]
      })
    );
  }

  #[test]
  fn strict_mode_fails_on_missing_path() {
    let scope = scope_with("a", json!({}));
    let err = resolve_value(&json!("{{ missing.path }}"), &scope, true).unwrap_err();
    assert_eq!(err.code(), "template_unresolved");
  }

  #[test]
  fn lenient_mode_substitutes_null_and_empty() {
    let scope = scope_with("a", json!({}));
    let whole = resolve_value(&json!("{{ missing }}"), &scope, false).unwrap();
    assert_eq!(whole, Value::Null);

    let embedded = resolve_value(&json!("x={{ missing }}"), &scope, false).unwrap();
    assert_eq!(embedded, json!("x="));
  }

  #[test]
  fn plain_strings_pass_through() {
    let scope = scope_with("a", json!({}));
    let resolved = resolve_value(&json!("no templates here"), &scope, true).unwrap();
    assert_eq!(resolved, json!("no templates here"));
  }

  #[test]
  fn condition_sees_source_output_at_top_level() {
    let scope = scope_with("a", json!({"status": 200}));
    let output = json!({"status": 200});
    assert!(eval_condition("status == 200", &scope, Some(&output)).unwrap());
    assert!(!eval_condition("status != 200", &scope, Some(&output)).unwrap());
  }

  #[test]
  fn condition_sees_scope_paths() {
    let scope = scope_with("fetch", json!({"count": 3}));
    assert!(eval_condition("fetch.count * 2 == 6", &scope, None).unwrap());
  }

  #[test]
  fn condition_on_missing_key_is_false() {
    let scope = scope_with("a", json!({}));
    assert!(!eval_condition("nothing == 1", &scope, None).unwrap());
  }

  #[test]
  fn malformed_condition_is_an_error() {
    let scope = scope_with("a", json!({}));
    assert!(eval_condition("status ==", &scope, None).is_err());
  }
}
