use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an upstream root server, exposed to clients as `root_server_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub i64);

impl SourceId {
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The JSON dialect a source speaks. Selects which parser normalizes its listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    /// Classic BMLT `client_interface` JSON where every value is a string.
    #[default]
    Bmlt,
    /// Natively typed JSON (numbers, booleans, arrays).
    Typed,
}

impl ResponseShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseShape::Bmlt => "bmlt",
            ResponseShape::Typed => "typed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bmlt" => Some(ResponseShape::Bmlt),
            "typed" => Some(ResponseShape::Typed),
            _ => None,
        }
    }
}

/// A configured upstream server. Immutable for the duration of a sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub id: SourceId,
    pub name: Option<String>,
    /// Base URL without the `client_interface` suffix and without trailing slash.
    pub url: String,
    pub enabled: bool,
    pub shape: ResponseShape,
    /// When set, a record's last-changed marker decides whether it was updated.
    pub trust_last_changed: bool,
    /// When set, the source understands `changed_since` and is fetched incrementally.
    pub incremental: bool,
}

impl Source {
    pub fn new(id: i64, url: impl Into<String>) -> Self {
        let url: String = url.into();
        Self {
            id: SourceId(id),
            name: None,
            url: url.trim_end_matches('/').to_string(),
            enabled: true,
            shape: ResponseShape::Bmlt,
            trust_last_changed: false,
            incremental: false,
        }
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", name, self.id),
            None => format!("source {}", self.id),
        }
    }

    /// URL of the `client_interface/json` endpoint for the given switcher.
    pub fn endpoint(&self, switcher: &str) -> String {
        format!("{}/client_interface/json/?switcher={}", self.url, switcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_strips_trailing_slash() {
        let source = Source::new(3, "https://bmlt.example.org/main_server/");
        assert_eq!(
            source.endpoint("GetSearchResults"),
            "https://bmlt.example.org/main_server/client_interface/json/?switcher=GetSearchResults"
        );
    }

    #[test]
    fn response_shape_parse() {
        assert_eq!(ResponseShape::parse("BMLT"), Some(ResponseShape::Bmlt));
        assert_eq!(ResponseShape::parse(" typed "), Some(ResponseShape::Typed));
        assert_eq!(ResponseShape::parse("xml"), None);
    }
}
