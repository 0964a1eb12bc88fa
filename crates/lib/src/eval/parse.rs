//! Path expression parser.
//!
//! ```text
//! path     := ["::"] segment ("::" segment)*
//! segment  := ["!"] key [test] filter* ["?"]
//! key      := "" | "*" | integer | "$" name | name
//! test     := ("=" | "!=") text
//! filter   := "[" path "]"
//! ```
//!
//! Keys that start with `.` name intrinsics (`.parent`, `.ancestors`, ...).

use super::EvalError;

/// What a segment selects from each current item.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
  /// Keeps the current item; used with filters or tests.
  Empty,
  /// `*`: every value of a map or list, or every explicit value of an instance.
  Wildcard,
  /// A list position. Negative indexes count from the end.
  Index(i64),
  /// `$name`: a variable from the enclosing `vars` frames.
  Var(String),
  /// A map key, an instance property or attribute, or an intrinsic when it
  /// starts with `.`.
  Name(String),
}

/// Comparison a segment applies to what its key selected.
#[derive(Debug, Clone, PartialEq)]
pub enum Test {
  /// `=text`: keep values equal to `text`.
  Eq(String),
  /// `!=text`: keep values not equal to `text`.
  Ne(String),
}

/// One `::`-separated step of a path.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
  pub key: Key,
  pub test: Option<Test>,
  /// `[path]` filters, applied in order to each selected item.
  pub filters: Vec<Path>,
  /// `?`: stop at the first match.
  pub first: bool,
  /// `!`: inside a filter, keep candidates for which the filter finds nothing.
  pub negate: bool,
}

impl Segment {
  /// A bare segment selecting `key`.
  pub fn key(key: Key) -> Self {
    Self {
      key,
      test: None,
      filters: Vec::new(),
      first: false,
      negate: false,
    }
  }
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
  /// Starts at the root: the collection of every instance.
  pub absolute: bool,
  pub segments: Vec<Segment>,
}

impl Path {
  /// True if the last segment narrows with a filter.
  pub fn ends_with_filter(&self) -> bool {
    self.segments.last().is_some_and(|s| !s.filters.is_empty())
  }
}

/// Parse a path expression.
pub fn parse_path(input: &str) -> Result<Path, EvalError> {
  let mut parser = Parser {
    input,
    chars: input.chars().collect(),
    pos: 0,
  };
  let path = parser.path(0)?;
  if parser.pos < parser.chars.len() {
    return Err(parser.error("unexpected ']'"));
  }
  Ok(path)
}

struct Parser<'a> {
  input: &'a str,
  chars: Vec<char>,
  pos: usize,
}

impl Parser<'_> {
  fn error(&self, message: &str) -> EvalError {
    EvalError::Malformed(format!("{message} at position {} in '{}'", self.pos, self.input))
  }

  fn peek(&self) -> Option<char> {
    self.chars.get(self.pos).copied()
  }

  fn at_separator(&self) -> bool {
    self.peek() == Some(':') && self.chars.get(self.pos + 1) == Some(&':')
  }

  fn path(&mut self, depth: usize) -> Result<Path, EvalError> {
    let absolute = self.at_separator();
    if absolute {
      self.pos += 2;
    }

    let mut segments = Vec::new();
    loop {
      segments.push(self.segment(depth)?);
      if self.at_separator() {
        self.pos += 2;
        continue;
      }
      match self.peek() {
        None => break,
        Some(']') if depth > 0 => break,
        Some(_) => return Err(self.error("expected '::'")),
      }
    }
    Ok(Path { absolute, segments })
  }

  fn segment(&mut self, depth: usize) -> Result<Segment, EvalError> {
    let start = self.pos;
    while let Some(c) = self.peek() {
      if c == '[' || c == ']' || self.at_separator() {
        break;
      }
      self.pos += 1;
    }
    let raw: String = self.chars[start..self.pos].iter().collect();

    let mut filters = Vec::new();
    while self.peek() == Some('[') {
      self.pos += 1;
      filters.push(self.path(depth + 1)?);
      if self.peek() != Some(']') {
        return Err(self.error("unclosed '['"));
      }
      self.pos += 1;
    }
    let mut first = false;
    if self.peek() == Some('?') {
      first = true;
      self.pos += 1;
    }

    let mut segment = parse_raw(raw.trim());
    segment.filters = filters;
    segment.first |= first;
    Ok(segment)
  }
}

fn parse_raw(raw: &str) -> Segment {
  let (negate, raw) = match raw.strip_prefix('!') {
    Some(rest) => (true, rest),
    None => (false, raw),
  };
  let (first, raw) = match raw.strip_suffix('?') {
    Some(rest) => (true, rest),
    None => (false, raw),
  };

  let (key_text, test) = if let Some(idx) = raw.find("!=") {
    (&raw[..idx], Some(Test::Ne(raw[idx + 2..].trim().to_string())))
  } else if let Some(idx) = raw.find('=') {
    (&raw[..idx], Some(Test::Eq(raw[idx + 1..].trim().to_string())))
  } else {
    (raw, None)
  };

  let key_text = key_text.trim();
  let key = if key_text.is_empty() {
    Key::Empty
  } else if key_text == "*" {
    Key::Wildcard
  } else if let Ok(index) = key_text.parse::<i64>() {
    Key::Index(index)
  } else if let Some(var) = key_text.strip_prefix('$') {
    Key::Var(var.to_string())
  } else {
    Key::Name(key_text.to_string())
  };

  Segment {
    key,
    test,
    filters: Vec::new(),
    first,
    negate,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn name(n: &str) -> Segment {
    Segment::key(Key::Name(n.into()))
  }

  #[test]
  fn simple_relative_path() {
    let path = parse_path("a::b::0").unwrap();
    assert!(!path.absolute);
    assert_eq!(path.segments, vec![name("a"), name("b"), Segment::key(Key::Index(0))]);
  }

  #[test]
  fn absolute_root() {
    let path = parse_path("::ns::.name").unwrap();
    assert!(path.absolute);
    assert_eq!(path.segments, vec![name("ns"), name(".name")]);
  }

  #[test]
  fn filter_with_test() {
    let path = parse_path(".parent[.type=acme.nodes.GoogleCloudFolder]").unwrap();
    let filter = &path.segments[0].filters[0];
    assert_eq!(
      filter.segments[0],
      Segment {
        test: Some(Test::Eq("acme.nodes.GoogleCloudFolder".into())),
        ..name(".type")
      }
    );
    assert!(path.ends_with_filter());
  }

  #[test]
  fn modifiers_and_vars() {
    let path = parse_path("$inst::items[!disabled]?::*").unwrap();
    assert_eq!(path.segments[0].key, Key::Var("inst".into()));
    assert!(path.segments[1].first);
    assert!(path.segments[1].filters[0].segments[0].negate);
    assert_eq!(path.segments[2].key, Key::Wildcard);
  }

  #[test]
  fn not_equal_test() {
    let path = parse_path(".readyState!=started").unwrap();
    assert_eq!(path.segments[0].test, Some(Test::Ne("started".into())));
  }

  #[test]
  fn nested_filters() {
    let path = parse_path("::[.type=A][.children[.name=x]]").unwrap();
    assert_eq!(path.segments[0].key, Key::Empty);
    assert_eq!(path.segments[0].filters.len(), 2);
    assert_eq!(path.segments[0].filters[1].segments[0].filters.len(), 1);
  }

  #[test]
  fn malformed_input() {
    assert!(matches!(parse_path("a[b"), Err(EvalError::Malformed(_))));
    assert!(matches!(parse_path("a]"), Err(EvalError::Malformed(_))));
    assert!(matches!(parse_path("a[b]c"), Err(EvalError::Malformed(_))));
  }
}
