//! Format description exchanged with the external pipeline
//!
//! The bridge never interprets caps; it only stores and forwards them.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::Error;

/// Media type plus `key=value` fields, e.g. `video/x-raw, format=RGB, width=640`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caps {
    media_type: String,
    fields: BTreeMap<String, String>,
}

impl Caps {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add or replace a field
    pub fn with_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

impl std::fmt::Display for Caps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.media_type)?;
        for (key, value) in &self.fields {
            write!(f, ", {}={}", key, value)?;
        }
        Ok(())
    }
}

impl FromStr for Caps {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',').map(str::trim);
        let media_type = match parts.next() {
            Some(media_type) if !media_type.is_empty() => media_type,
            _ => return Err(Error::Config(format!("caps without media type: {:?}", s))),
        };

        let mut caps = Caps::new(media_type);
        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("malformed caps field: {:?}", part)))?;
            caps.fields
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(caps)
    }
}
