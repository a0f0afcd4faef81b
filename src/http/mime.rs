//! Media types and media ranges used for content-type dispatch.

use std::fmt;

/// A registered content-type key: an exact `type/subtype`, a `type/*`
/// range, or `*/*`. Parameters (`; charset=...`) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaRange {
    Any,
    Type(String),
    Exact(String, String),
}

impl MediaRange {
    /// Parses a media type or range. Returns `None` for anything that is
    /// not `type/subtype` shaped.
    pub fn parse(s: &str) -> Option<Self> {
        let essence = s.split(';').next().unwrap_or(s).trim();
        let (ty, sub) = essence.split_once('/')?;
        let ty = ty.trim().to_ascii_lowercase();
        let sub = sub.trim().to_ascii_lowercase();
        if ty.is_empty() || sub.is_empty() {
            return None;
        }

        match (ty.as_str(), sub.as_str()) {
            ("*", "*") => Some(MediaRange::Any),
            ("*", _) => None,
            (_, "*") => Some(MediaRange::Type(ty)),
            _ => Some(MediaRange::Exact(ty, sub)),
        }
    }

    /// Whether a concrete media type falls inside this range.
    pub fn matches(&self, media_type: &str) -> bool {
        let Some(MediaRange::Exact(ty, sub)) = MediaRange::parse(media_type) else {
            return matches!(self, MediaRange::Any);
        };
        match self {
            MediaRange::Any => true,
            MediaRange::Type(t) => *t == ty,
            MediaRange::Exact(t, s) => *t == ty && *s == sub,
        }
    }

    /// Exact beats `type/*`, which beats `*/*`.
    pub fn specificity(&self) -> u8 {
        match self {
            MediaRange::Any => 0,
            MediaRange::Type(_) => 1,
            MediaRange::Exact(..) => 2,
        }
    }
}

impl fmt::Display for MediaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaRange::Any => f.write_str("*/*"),
            MediaRange::Type(t) => write!(f, "{t}/*"),
            MediaRange::Exact(t, s) => write!(f, "{t}/{s}"),
        }
    }
}
