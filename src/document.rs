//! Desired-state document.
//!
//! The document is YAML. `flags` is a mapping from flag name to its
//! definition and keeps the order it was written in:
//!
//! ```yaml
//! flags:
//!   checkout-redesign:
//!     description: New checkout
//!     enabled: true
//!     variants:
//!       - key: on
//!       - key: off
//!     segments:
//!       - description: beta users
//!         rollout: 50
//!         constraints:
//!           - property: plan
//!             operator: IN
//!             value: [beta, internal]
//!         distributions:
//!           - key: on
//!             percent: 100
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::entity::Attachment;
use crate::error::DocumentError;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "RawDocument")]
pub struct Document {
    /// Shared sections are accepted so existing documents parse, but the
    /// reconciler does not read them.
    pub common_variants: Option<serde_yaml::Value>,
    pub common_variant_groups: Option<serde_yaml::Value>,
    pub common_segments: Option<serde_yaml::Value>,
    pub flags: Vec<DesiredFlag>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DesiredFlag {
    #[serde(skip)]
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub variants: Vec<DesiredVariant>,
    pub segments: Vec<DesiredSegment>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DesiredVariant {
    pub key: String,
    pub attachment: Attachment,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DesiredSegment {
    pub description: String,
    pub rollout: u32,
    pub constraints: Vec<DesiredConstraint>,
    pub distributions: Vec<DesiredDistribution>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DesiredConstraint {
    pub property: String,
    pub operator: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DesiredDistribution {
    pub key: String,
    pub percent: u32,
}

#[derive(Deserialize)]
struct RawDocument {
    common_variants: Option<serde_yaml::Value>,
    common_variant_groups: Option<serde_yaml::Value>,
    common_segments: Option<serde_yaml::Value>,
    #[serde(default)]
    flags: serde_yaml::Mapping,
}

impl TryFrom<RawDocument> for Document {
    type Error = String;

    fn try_from(raw: RawDocument) -> Result<Self, Self::Error> {
        let mut flags = Vec::with_capacity(raw.flags.len());
        for (key, value) in raw.flags {
            let name = match key {
                serde_yaml::Value::String(name) => name,
                other => return Err(format!("flag name must be a string, got {:?}", other)),
            };
            let mut flag: DesiredFlag = if value.is_null() {
                DesiredFlag::default()
            } else {
                serde_yaml::from_value(value).map_err(|e| format!("flag {}: {}", name, e))?
            };
            flag.name = name;
            flags.push(flag);
        }
        Ok(Document {
            common_variants: raw.common_variants,
            common_variant_groups: raw.common_variant_groups,
            common_segments: raw.common_segments,
            flags,
        })
    }
}

impl Document {
    pub fn from_yaml_str(content: &str) -> Result<Self, DocumentError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| DocumentError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn flag(&self, name: &str) -> Option<&DesiredFlag> {
        self.flags.iter().find(|f| f.name == name)
    }

    pub fn flag_names(&self) -> Vec<String> {
        self.flags.iter().map(|f| f.name.clone()).collect()
    }
}

impl DesiredFlag {
    pub fn variant_keys(&self) -> Vec<String> {
        self.variants.iter().map(|v| v.key.clone()).collect()
    }
}

impl DesiredSegment {
    pub fn total_percent(&self) -> u64 {
        self.distributions.iter().map(|d| u64::from(d.percent)).sum()
    }
}
