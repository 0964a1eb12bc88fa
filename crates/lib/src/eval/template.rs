//! Text templates: `{{ expr }}` placeholders inside strings.
//!
//! The expression inside a placeholder is a path (`{{ .name }}`,
//! `{{ $var::key }}`, `{{ port }}`) optionally followed by filters:
//!
//! ```text
//! {{ .parent::name | upper }}
//! {{ $region | default('us-east-1') }}
//! ```
//!
//! A backslash before `{{` produces a literal `{{`.

use super::{EvalContext, EvalError};
use crate::value::Value;

/// A `| name` filter applied to a placeholder's value.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
  /// `default('text')`: used when the expression found nothing.
  Default(String),
  Upper,
  Lower,
  Trim,
}

/// A `{{ expr | filter ... }}` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
  /// Path expression, evaluated against the current instance.
  pub expr: String,
  pub filters: Vec<Filter>,
}

/// A piece of a parsed template.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
  /// Text copied as is, escapes already removed.
  Literal(String),
  Placeholder(Placeholder),
}

/// Resolves placeholder expressions to values.
pub trait Resolver {
  /// `Ok(None)` when the expression found nothing.
  fn resolve(&mut self, expr: &str) -> Result<Option<Value>, EvalError>;
}

impl Resolver for EvalContext<'_> {
  fn resolve(&mut self, expr: &str) -> Result<Option<Value>, EvalError> {
    super::eval_expression(&Value::from(expr), self)
  }
}

/// True if `text` contains an unescaped `{{`.
pub fn has_template(text: &str) -> bool {
  let mut rest = text;
  while let Some(idx) = rest.find("{{") {
    if !rest[..idx].ends_with('\\') {
      return true;
    }
    rest = &rest[idx + 2..];
  }
  false
}

/// Split `input` into literal text and placeholders.
///
/// # Errors
///
/// Returns [`EvalError::Malformed`] for an unterminated or empty placeholder,
/// or for an unknown filter.
pub fn parse(input: &str) -> Result<Vec<Segment>, EvalError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    match ch {
      '\\' if input[pos + 1..].starts_with("{{") => {
        literal.push_str("{{");
        chars.next();
        chars.next();
      }
      '{' if matches!(chars.peek(), Some((_, '{'))) => {
        chars.next();
        let start = pos + 2;
        let Some(len) = input[start..].find("}}") else {
          return Err(EvalError::Malformed(format!("unclosed '{{{{' at position {pos}")));
        };
        let content = &input[start..start + len];
        // Skip past the closing braces.
        while let Some((idx, _)) = chars.peek() {
          if *idx >= start + len + 2 {
            break;
          }
          chars.next();
        }
        if !literal.is_empty() {
          segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(Segment::Placeholder(parse_placeholder(content)?));
      }
      c => literal.push(c),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }
  Ok(segments)
}

fn parse_placeholder(content: &str) -> Result<Placeholder, EvalError> {
  let mut parts = content.split('|');
  let expr = parts.next().unwrap_or_default().trim();
  if expr.is_empty() {
    return Err(EvalError::Malformed("empty placeholder".to_string()));
  }
  let filters = parts.map(parse_filter).collect::<Result<_, _>>()?;
  Ok(Placeholder {
    expr: expr.to_string(),
    filters,
  })
}

fn parse_filter(text: &str) -> Result<Filter, EvalError> {
  let text = text.trim();
  match text {
    "upper" => return Ok(Filter::Upper),
    "lower" => return Ok(Filter::Lower),
    "trim" => return Ok(Filter::Trim),
    _ => {}
  }
  if let Some(arg) = text.strip_prefix("default(").and_then(|rest| rest.strip_suffix(')')) {
    let arg = arg.trim();
    let unquoted = arg
      .strip_prefix('\'')
      .and_then(|a| a.strip_suffix('\''))
      .or_else(|| arg.strip_prefix('"').and_then(|a| a.strip_suffix('"')))
      .unwrap_or(arg);
    return Ok(Filter::Default(unquoted.to_string()));
  }
  Err(EvalError::Malformed(format!("unknown template filter '{text}'")))
}

/// Render parsed segments, resolving each placeholder through `resolver`.
pub fn substitute(segments: &[Segment], resolver: &mut impl Resolver) -> Result<String, EvalError> {
  let mut out = String::new();
  for segment in segments {
    match segment {
      Segment::Literal(text) => out.push_str(text),
      Segment::Placeholder(placeholder) => out.push_str(&resolve_placeholder(placeholder, resolver)?),
    }
  }
  Ok(out)
}

fn resolve_placeholder(placeholder: &Placeholder, resolver: &mut impl Resolver) -> Result<String, EvalError> {
  let mut value = match resolver.resolve(&placeholder.expr) {
    Ok(found) => found.filter(|v| !v.is_null()),
    Err(EvalError::MissingVariable(_)) if has_default(placeholder) => None,
    Err(e) => return Err(e),
  }
  .map(|v| v.to_text());

  for filter in &placeholder.filters {
    value = match (filter, value) {
      (Filter::Default(fallback), None) => Some(fallback.clone()),
      (Filter::Default(_), found) => found,
      (Filter::Upper, found) => found.map(|s| s.to_uppercase()),
      (Filter::Lower, found) => found.map(|s| s.to_lowercase()),
      (Filter::Trim, found) => found.map(|s| s.trim().to_string()),
    };
  }

  value.ok_or_else(|| EvalError::UnresolvablePath(placeholder.expr.clone()))
}

fn has_default(placeholder: &Placeholder) -> bool {
  placeholder.filters.iter().any(|f| matches!(f, Filter::Default(_)))
}

/// Render `text` against `ctx`.
pub fn render(text: &str, ctx: &mut EvalContext<'_>) -> Result<String, EvalError> {
  let segments = parse(text)?;
  substitute(&segments, ctx)
}
