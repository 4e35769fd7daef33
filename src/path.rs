//! Field paths addressing values inside a nested form value tree.
//!
//! Paths accept dot and bracket notation: `user.name`, `tags[0]`, `tags.0`,
//! and bracketed keys for names containing separators (`[first.name]` or
//! `["first.name"]`). Parsing normalizes every accepted spelling to one
//! canonical form, so `tags.0` and `tags[0]` compare equal.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::form::{FormError, FormResult};

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FieldPath {
    canonical: Arc<str>,
    segments: Arc<[PathSegment]>,
}

impl FieldPath {
    pub fn parse(input: &str) -> FormResult<Self> {
        let segments = parse_segments(input)?;
        Ok(Self::from_segments(segments))
    }

    /// Single-segment path for a plain key, taken verbatim.
    pub fn key(name: impl Into<String>) -> Self {
        Self::from_segments(vec![PathSegment::Key(name.into())])
    }

    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        let canonical = render(&segments);
        Self {
            canonical: canonical.into(),
            segments: segments.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(root, |node, segment| match segment {
                PathSegment::Key(key) => node.get(key.as_str()),
                PathSegment::Index(index) => node
                    .get(*index)
                    .or_else(|| node.get(index.to_string().as_str())),
            })
    }

    /// Writes `value` at this path, creating intermediate objects and arrays.
    /// Non-container nodes in the way are replaced.
    pub fn set(&self, root: &mut Value, value: Value) {
        let mut node = root;
        for segment in self.segments.iter() {
            node = child_mut(node, segment);
        }
        *node = value;
    }
}

fn child_mut<'a>(node: &'a mut Value, segment: &PathSegment) -> &'a mut Value {
    match segment {
        PathSegment::Key(key) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            match node {
                Value::Object(map) => map.entry(key.clone()).or_insert(Value::Null),
                other => other,
            }
        }
        PathSegment::Index(index) => {
            let dense = *index < MAX_DENSE_INDEX;
            if node.is_array() && !dense {
                sparsify(node);
            } else if !node.is_object() && !node.is_array() {
                *node = if dense {
                    Value::Array(Vec::new())
                } else {
                    Value::Object(Map::new())
                };
            }
            match node {
                Value::Array(items) => {
                    if items.len() <= *index {
                        items.resize(*index + 1, Value::Null);
                    }
                    &mut items[*index]
                }
                Value::Object(map) => map.entry(index.to_string()).or_insert(Value::Null),
                other => other,
            }
        }
    }
}

/// Largest array index written densely. Anything past it is stored under
/// its decimal text in an object, which `get` also reads.
const MAX_DENSE_INDEX: usize = 1 << 16;

fn sparsify(node: &mut Value) {
    if let Value::Array(items) = node {
        let map = std::mem::take(items)
            .into_iter()
            .enumerate()
            .map(|(index, item)| (index.to_string(), item))
            .collect::<Map<String, Value>>();
        *node = Value::Object(map);
    }
}

fn parse_segments(input: &str) -> FormResult<Vec<PathSegment>> {
    let invalid = |reason: &'static str| FormError::InvalidPath {
        path: input.to_string(),
        reason,
    };

    let mut segments = Vec::new();
    let mut key = String::new();
    let mut after_bracket = false;
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '.' => {
                if key.is_empty() && !after_bracket {
                    return Err(invalid("empty segment"));
                }
                flush_key(&mut segments, &mut key);
                after_bracket = false;
            }
            '[' => {
                flush_key(&mut segments, &mut key);
                let mut inner = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(next);
                }
                if !closed {
                    return Err(invalid("unclosed bracket"));
                }
                let segment =
                    bracket_segment(inner.trim()).ok_or_else(|| invalid("empty brackets"))?;
                segments.push(segment);
                after_bracket = true;
            }
            ']' => return Err(invalid("unexpected closing bracket")),
            other => {
                if after_bracket {
                    return Err(invalid("expected `.` or `[` after brackets"));
                }
                key.push(other);
            }
        }
    }

    if key.is_empty() && !after_bracket {
        return Err(invalid("empty segment"));
    }
    flush_key(&mut segments, &mut key);
    Ok(segments)
}

fn flush_key(segments: &mut Vec<PathSegment>, key: &mut String) {
    if key.is_empty() {
        return;
    }
    let text = std::mem::take(key);
    segments.push(match numeric_index(&text) {
        Some(index) => PathSegment::Index(index),
        None => PathSegment::Key(text),
    });
}

fn bracket_segment(inner: &str) -> Option<PathSegment> {
    if inner.is_empty() {
        return None;
    }
    for quote in ['"', '\''] {
        if let Some(quoted) = inner
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return Some(PathSegment::Key(quoted.to_string()));
        }
    }
    Some(match numeric_index(inner) {
        Some(index) => PathSegment::Index(index),
        None => PathSegment::Key(inner.to_string()),
    })
}

fn numeric_index(text: &str) -> Option<usize> {
    if text.is_empty() || !text.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

fn render(segments: &[PathSegment]) -> String {
    let mut out = String::new();
    for (position, segment) in segments.iter().enumerate() {
        match segment {
            PathSegment::Index(index) => {
                out.push('[');
                out.push_str(&index.to_string());
                out.push(']');
            }
            PathSegment::Key(key) if needs_brackets(key) => {
                let quote = if key.contains('"') { '\'' } else { '"' };
                out.push('[');
                out.push(quote);
                out.push_str(key);
                out.push(quote);
                out.push(']');
            }
            PathSegment::Key(key) => {
                if position > 0 {
                    out.push('.');
                }
                out.push_str(key);
            }
        }
    }
    out
}

fn needs_brackets(key: &str) -> bool {
    key.is_empty()
        || numeric_index(key).is_some()
        || key.contains(['.', '[', ']'])
        || key.trim() != key
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for FieldPath {
    type Err = FormError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

impl AsRef<str> for FieldPath {
    fn as_ref(&self) -> &str {
        &self.canonical
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Anything a form accepts where a field path is expected.
pub trait IntoFieldPath {
    fn into_field_path(self) -> FormResult<FieldPath>;
}

impl IntoFieldPath for FieldPath {
    fn into_field_path(self) -> FormResult<FieldPath> {
        Ok(self)
    }
}

impl IntoFieldPath for &FieldPath {
    fn into_field_path(self) -> FormResult<FieldPath> {
        Ok(self.clone())
    }
}

impl IntoFieldPath for &str {
    fn into_field_path(self) -> FormResult<FieldPath> {
        FieldPath::parse(self)
    }
}

impl IntoFieldPath for String {
    fn into_field_path(self) -> FormResult<FieldPath> {
        FieldPath::parse(&self)
    }
}

impl IntoFieldPath for &String {
    fn into_field_path(self) -> FormResult<FieldPath> {
        FieldPath::parse(self)
    }
}
