use std::collections::HashMap;

use serde::Deserialize;

use crate::tags::{TagError, TagSet};

/// Metadata describing one monitored application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApplicationInfo {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub version: String,
}

impl ApplicationInfo {
    /// Tags appended to the base tags for this application's artifacts.
    pub fn tags(&self, application_id: &str) -> Result<TagSet, TagError> {
        let mut tags = TagSet::new();
        tags.add("service", self.service.as_str())?;
        if !self.environment.is_empty() {
            tags.add("env", self.environment.as_str())?;
        }
        if !self.version.is_empty() {
            tags.add("version", self.version.as_str())?;
        }
        tags.add("runtime-id", application_id)?;
        Ok(tags)
    }
}

/// Resolves application metadata from an application identifier.
pub trait ApplicationStore: Send + Sync {
    fn get(&self, application_id: &str) -> ApplicationInfo;
}

/// Store backed by a fixed map, typically loaded from configuration.
///
/// Unknown identifiers get `default_service`, or the identifier itself when
/// no default is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticApplicationStore {
    default_service: String,
    applications: HashMap<String, ApplicationInfo>,
}

impl StaticApplicationStore {
    pub fn new(default_service: impl Into<String>, applications: HashMap<String, ApplicationInfo>) -> Self {
        Self {
            default_service: default_service.into(),
            applications,
        }
    }
}

impl ApplicationStore for StaticApplicationStore {
    fn get(&self, application_id: &str) -> ApplicationInfo {
        let mut info = self
            .applications
            .get(application_id)
            .cloned()
            .unwrap_or_default();
        if info.service.is_empty() {
            info.service = if self.default_service.is_empty() {
                application_id.to_string()
            } else {
                self.default_service.clone()
            };
        }
        info
    }
}
