use super::{RecordKey, SourceId};
use serde::{Serialize, Serializer};

/// BMLT service body type codes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceBodyType {
    Group,
    GroupSupportUnit,
    LocalServiceUnit,
    Area,
    Metro,
    Region,
    Zone,
    World,
    /// A code this aggregator does not know; kept verbatim.
    Other(String),
}

impl ServiceBodyType {
    pub fn code(&self) -> &str {
        match self {
            ServiceBodyType::Group => "GR",
            ServiceBodyType::GroupSupportUnit => "GS",
            ServiceBodyType::LocalServiceUnit => "LS",
            ServiceBodyType::Area => "AS",
            ServiceBodyType::Metro => "MA",
            ServiceBodyType::Region => "RS",
            ServiceBodyType::Zone => "ZF",
            ServiceBodyType::World => "WS",
            ServiceBodyType::Other(raw) => raw,
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "GR" => ServiceBodyType::Group,
            "GS" => ServiceBodyType::GroupSupportUnit,
            "LS" => ServiceBodyType::LocalServiceUnit,
            "AS" => ServiceBodyType::Area,
            "MA" => ServiceBodyType::Metro,
            "RS" => ServiceBodyType::Region,
            "ZF" => ServiceBodyType::Zone,
            "WS" => ServiceBodyType::World,
            other => ServiceBodyType::Other(other.to_string()),
        }
    }
}

impl Serialize for ServiceBodyType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

/// An organizational unit of a source. Parent references stay within the source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceBody {
    pub source_id: SourceId,
    pub local_id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub kind: Option<ServiceBodyType>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub helpline: Option<String>,
    pub world_id: Option<String>,
}

impl ServiceBody {
    pub fn new(source_id: SourceId, local_id: i64, name: impl Into<String>) -> Self {
        Self {
            source_id,
            local_id,
            parent_id: None,
            name: name.into(),
            kind: None,
            description: None,
            url: None,
            helpline: None,
            world_id: None,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.source_id, self.local_id)
    }
}
