//! Path templates: literal, parameter, and trailing wildcard segments.
//!
//! `/users/:id`, `/users/{id}`, and `/static/*rest` are all accepted.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::routing::handler::PathParams;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param(String),
    /// Matches the remainder of the path (zero or more segments).
    Wildcard(Option<String>),
}

#[derive(Debug, Clone)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        let pieces: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
        let mut segments = Vec::with_capacity(pieces.len());

        for (i, piece) in pieces.iter().enumerate() {
            let segment = if let Some(name) = piece.strip_prefix(':') {
                Segment::Param(param_name(raw, name)?)
            } else if piece.starts_with('{') && piece.ends_with('}') && piece.len() >= 2 {
                Segment::Param(param_name(raw, &piece[1..piece.len() - 1])?)
            } else if let Some(name) = piece.strip_prefix('*') {
                if i + 1 != pieces.len() {
                    return Err(Error::InvalidRoute(format!(
                        "wildcard must be the last segment in {raw:?}"
                    )));
                }
                Segment::Wildcard((!name.is_empty()).then(|| name.to_string()))
            } else {
                Segment::Literal(piece.to_string())
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Two templates with the same canonical form can never be told apart
    /// at match time, regardless of parameter names.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            out.push('/');
            match seg {
                Segment::Literal(l) => out.push_str(l),
                Segment::Param(_) => out.push(':'),
                Segment::Wildcard(_) => out.push('*'),
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    /// Matches a request path (query string already removed).
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let mut parts = path.split('/').filter(|s| !s.is_empty());
        let mut params = PathParams::default();

        for seg in &self.segments {
            match seg {
                Segment::Literal(lit) => {
                    if parts.next()? != lit.as_str() {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.push(name, parts.next()?);
                }
                Segment::Wildcard(name) => {
                    let rest: Vec<&str> = parts.by_ref().collect();
                    if let Some(name) = name {
                        params.push(name, &rest.join("/"));
                    }
                    return Some(params);
                }
            }
        }

        match parts.next() {
            Some(_) => None,
            None => Some(params),
        }
    }

    /// Precedence key: per position a literal beats a parameter, which
    /// beats a wildcard; a template that ends without a wildcard beats one
    /// that continues with a wildcard at the same position.
    fn precedence_key(&self) -> Vec<u8> {
        let mut key: Vec<u8> = self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Literal(_) => 3,
                Segment::Param(_) => 2,
                Segment::Wildcard(_) => 1,
            })
            .collect();
        if !matches!(self.segments.last(), Some(Segment::Wildcard(_))) {
            key.push(4);
        }
        key
    }

    /// `Ordering::Greater` means `self` is more specific than `other`.
    pub fn precedence(&self, other: &PathTemplate) -> Ordering {
        self.precedence_key().cmp(&other.precedence_key())
    }
}

fn param_name(raw: &str, name: &str) -> Result<String> {
    if name.is_empty() || name.contains(['/', ':', '{', '}', '*']) {
        return Err(Error::InvalidRoute(format!("bad parameter in {raw:?}")));
    }
    Ok(name.to_string())
}
