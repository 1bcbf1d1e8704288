//! Placeholder parsing and substitution for build step arguments.
//!
//! Steps are declared before anything about the build location is known. The
//! directories a step needs are written as placeholders and filled in by the
//! executor right before the step runs.
//!
//! # Placeholder Formats
//!
//! - `$${prefix}` - staging directory the install steps write into
//! - `$${src}` - source directory, where fetched archives land
//! - `$${build}` - scratch working directory of the build
//! - `$${dep:<name>}` - install prefix of the already built dependency `<name>`
//!
//! # Shell Variables
//!
//! Single `$` characters pass through unchanged, so `$HOME` or `$(nproc)` in a
//! shell command need no escaping.
//!
//! # Escaping
//!
//! `$$$` before `{` produces a literal `$${`.
//!
//! # Example
//!
//! ```
//! use cellar_lib::placeholder::{parse, Placeholder, Segment};
//!
//! let segments = parse("--prefix=$${prefix}").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Literal("--prefix=".to_string()),
//!     Segment::Placeholder(Placeholder::Prefix),
//! ]);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  Prefix,
  Src,
  Build,
  /// `$${dep:NAME}`
  Dep(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Literal(String),
  Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder type: {0}")]
  UnknownType(String),

  #[error("malformed placeholder: {0}")]
  Malformed(String),

  #[error("'{0}' is not a dependency of this build")]
  UnresolvedDependency(String),
}

/// Supplies placeholder values during execution.
pub trait Resolver {
  fn resolve_prefix(&self) -> &str;

  fn resolve_src(&self) -> &str;

  fn resolve_build(&self) -> &str;

  fn resolve_dep(&self, name: &str) -> Result<&str, PlaceholderError>;
}

/// Parse a string containing placeholders into segments.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    if !matches!(chars.peek(), Some((_, '$'))) {
      literal.push('$');
      continue;
    }
    chars.next();

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();
        if matches!(chars.peek(), Some((_, '{'))) {
          chars.next();
          literal.push_str("$${");
        } else {
          literal.push_str("$$$");
        }
      }
      Some((_, '{')) => {
        chars.next();
        if !literal.is_empty() {
          segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }

        let mut content = String::new();
        let mut closed = false;
        for (_, c) in chars.by_ref() {
          if c == '}' {
            closed = true;
            break;
          }
          content.push(c);
        }
        if !closed {
          return Err(PlaceholderError::Unclosed(pos));
        }

        segments.push(Segment::Placeholder(parse_content(&content)?));
      }
      _ => literal.push_str("$$"),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

fn parse_content(content: &str) -> Result<Placeholder, PlaceholderError> {
  match content {
    "prefix" => return Ok(Placeholder::Prefix),
    "src" => return Ok(Placeholder::Src),
    "build" => return Ok(Placeholder::Build),
    _ => {}
  }

  let (kind, rest) = content
    .split_once(':')
    .ok_or_else(|| PlaceholderError::UnknownType(content.to_string()))?;

  match kind {
    "dep" if rest.is_empty() => Err(PlaceholderError::Malformed(format!(
      "dep placeholder missing name: '{content}'"
    ))),
    "dep" => Ok(Placeholder::Dep(rest.to_string())),
    _ => Err(PlaceholderError::UnknownType(kind.to_string())),
  }
}

/// Parse and substitute in one step.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let segments = parse(input)?;
  substitute_segments(&segments, resolver)
}

pub fn substitute_segments(segments: &[Segment], resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::new();

  for segment in segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Placeholder(p) => {
        let value = match p {
          Placeholder::Prefix => resolver.resolve_prefix(),
          Placeholder::Src => resolver.resolve_src(),
          Placeholder::Build => resolver.resolve_build(),
          Placeholder::Dep(name) => resolver.resolve_dep(name)?,
        };
        result.push_str(value);
      }
    }
  }

  Ok(result)
}
