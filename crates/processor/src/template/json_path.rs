//! Minimal JSON path evaluation over `serde_json::Value`
//!
//! Supported syntax:
//! - `$` root
//! - `.name`, `['name']`, `["name"]` child access
//! - `[n]` array index, `[*]` / `.*` wildcard
//! - `..` recursive descent (`$..name`, `$..[?(...)]`)
//! - `[?(@.a.b)]` existence filter and `[?(@.a == 'x')]` equality filter
//!
//! Expressions are parsed once at template load; evaluation never fails,
//! it just selects zero or more nodes.

use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Child(String),
    Index(usize),
    Wildcard,
    RecursiveDescent,
    Filter(Filter),
}

#[derive(Debug, Clone, PartialEq)]
struct Filter {
    path: Vec<String>,
    equals: Option<Value>,
}

impl Filter {
    fn accepts(&self, node: &Value) -> bool {
        let mut current = node;
        for name in &self.path {
            match current.get(name) {
                Some(next) => current = next,
                None => return false,
            }
        }

        match &self.equals {
            None => !current.is_null(),
            Some(expected) => values_equal(current, expected),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// A parsed JSON path expression
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    expression: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parse an expression; the error is a human-readable reason
    pub fn parse(expression: &str) -> Result<Self, String> {
        let chars: Vec<char> = expression.trim().chars().collect();
        if chars.first() != Some(&'$') {
            return Err("expression must start with '$'".to_string());
        }

        let mut segments = Vec::new();
        let mut i = 1;

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    if chars.get(i + 1) == Some(&'.') {
                        segments.push(Segment::RecursiveDescent);
                        i += 2;
                        match chars.get(i) {
                            Some('[') => continue,
                            Some('*') => {
                                segments.push(Segment::Wildcard);
                                i += 1;
                            }
                            _ => {
                                let (name, next) = read_name(&chars, i);
                                if name.is_empty() {
                                    return Err(format!("empty name after '..' at position {}", i));
                                }
                                segments.push(Segment::Child(name));
                                i = next;
                            }
                        }
                    } else {
                        i += 1;
                        if chars.get(i) == Some(&'*') {
                            segments.push(Segment::Wildcard);
                            i += 1;
                        } else {
                            let (name, next) = read_name(&chars, i);
                            if name.is_empty() {
                                return Err(format!("empty name after '.' at position {}", i));
                            }
                            segments.push(Segment::Child(name));
                            i = next;
                        }
                    }
                }
                '[' => {
                    let close = find_closing_bracket(&chars, i)
                        .ok_or_else(|| format!("unclosed '[' at position {}", i))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    segments.push(parse_bracket(inner.trim())?);
                    i = close + 1;
                }
                c => return Err(format!("unexpected '{}' at position {}", c, i)),
            }
        }

        Ok(Self {
            expression: expression.trim().to_string(),
            segments,
        })
    }

    /// Original expression text
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Select every node the expression addresses, in document order
    pub fn select<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut nodes = vec![root];

        for segment in &self.segments {
            let mut next = Vec::new();
            for node in nodes {
                match segment {
                    Segment::Child(name) => {
                        if let Some(child) = node.get(name.as_str()) {
                            next.push(child);
                        }
                    }
                    Segment::Index(index) => {
                        if let Some(child) = node.get(*index) {
                            next.push(child);
                        }
                    }
                    Segment::Wildcard => next.extend(children(node)),
                    Segment::RecursiveDescent => collect_descendants(node, &mut next),
                    Segment::Filter(filter) => {
                        next.extend(children(node).into_iter().filter(|child| filter.accepts(child)))
                    }
                }
            }
            nodes = next;
            if nodes.is_empty() {
                break;
            }
        }

        nodes
    }

    /// First selected node that is not `null`
    pub fn first<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.select(root).into_iter().find(|v| !v.is_null())
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

fn children(node: &Value) -> Vec<&Value> {
    match node {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => map.values().collect(),
        _ => Vec::new(),
    }
}

fn collect_descendants<'a>(node: &'a Value, out: &mut Vec<&'a Value>) {
    out.push(node);
    for child in children(node) {
        collect_descendants(child, out);
    }
}

fn read_name(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

fn find_closing_bracket(chars: &[char], open: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (offset, &c) in chars[open + 1..].iter().enumerate() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(c),
            (None, ']') => return Some(open + 1 + offset),
            _ => {}
        }
    }
    None
}

fn unquote(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' || first == b'"') && first == last {
            return Some(&text[1..text.len() - 1]);
        }
    }
    None
}

fn parse_bracket(inner: &str) -> Result<Segment, String> {
    if inner == "*" {
        return Ok(Segment::Wildcard);
    }
    if let Some(name) = unquote(inner) {
        return Ok(Segment::Child(name.to_string()));
    }
    if let Some(body) = inner.strip_prefix("?(").and_then(|rest| rest.strip_suffix(')')) {
        return parse_filter(body.trim()).map(Segment::Filter);
    }
    inner
        .parse::<usize>()
        .map(Segment::Index)
        .map_err(|_| format!("unsupported bracket expression '[{}]'", inner))
}

fn parse_filter(body: &str) -> Result<Filter, String> {
    let (lhs, rhs) = match body.split_once("==") {
        Some((lhs, rhs)) => (lhs.trim(), Some(rhs.trim())),
        None => (body, None),
    };

    let relative = lhs
        .strip_prefix('@')
        .ok_or_else(|| format!("filter '{}' must start with '@'", body))?;
    let relative = relative.strip_prefix('.').unwrap_or(relative);

    let path: Vec<String> = if relative.is_empty() {
        Vec::new()
    } else {
        relative.split('.').map(str::to_string).collect()
    };
    if path.iter().any(String::is_empty) {
        return Err(format!("filter '{}' has an empty path segment", body));
    }
    if path.is_empty() && rhs.is_none() {
        return Err(format!("filter '{}' needs a path or a comparison", body));
    }

    let equals = match rhs {
        None => None,
        Some(literal) => Some(match unquote(literal) {
            Some(s) => Value::String(s.to_string()),
            None => serde_json::from_str(literal)
                .map_err(|_| format!("unsupported filter literal '{}'", literal))?,
        }),
    };

    Ok(Filter { path, equals })
}
