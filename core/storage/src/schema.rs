//! Hand-written configuration schemas for the configuration UI.

use serde::Serialize;

/// Value type of a configuration property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PropType {
    Int,
    String,
    Boolean,
}

/// One configuration property of a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySchema {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub prop_type: PropType,
    pub required: bool,
    pub label: &'static str,
    /// Free-form hint shown next to the field.
    #[serde(skip_serializing_if = "str::is_empty")]
    pub usage: &'static str,
}

impl PropertySchema {
    pub const fn required(name: &'static str, prop_type: PropType, label: &'static str) -> Self {
        Self {
            name,
            prop_type,
            required: true,
            label,
            usage: "",
        }
    }

    pub const fn optional(name: &'static str, prop_type: PropType, label: &'static str) -> Self {
        Self {
            name,
            prop_type,
            required: false,
            label,
            usage: "",
        }
    }

    pub const fn with_usage(mut self, usage: &'static str) -> Self {
        self.usage = usage;
        self
    }
}

/// Configuration schema of one driver kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSchema {
    pub kind: &'static str,
    pub display_name: &'static str,
    pub properties: Vec<PropertySchema>,
}

impl DriverSchema {
    /// Names of the properties that must be present.
    pub fn required_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.properties
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
    }
}
