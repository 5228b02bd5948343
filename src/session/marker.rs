//! `.tether/project_state.json`: local, advisory record of initialization.
//!
//! The marker only saves a round-trip when deciding whether a project has been
//! initialized. When it disagrees with the provider's META record the provider
//! wins and the marker is rewritten.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::{ProviderType, StateProviderSection};
use crate::provider::SessionId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRef {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

impl From<&StateProviderSection> for ProviderRef {
    fn from(section: &StateProviderSection) -> Self {
        Self {
            provider_type: section.provider_type,
            repository: section.repository.clone().filter(|r| !r.is_empty()),
            team_id: section.team_id.clone().filter(|t| !t.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastSession {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks_completed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerFile {
    pub project_id: String,
    pub initialized_at: DateTime<Utc>,
    pub state_provider: ProviderRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session: Option<LastSession>,
    /// Set while the local snapshot holds writes the provider has not seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_since: Option<DateTime<Utc>>,
}

impl MarkerFile {
    pub fn new(section: &StateProviderSection) -> Self {
        Self {
            project_id: uuid::Uuid::new_v4().to_string(),
            initialized_at: Utc::now(),
            state_provider: section.into(),
            last_session: None,
            degraded_since: None,
        }
    }

    /// `None` when the marker does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read marker file: {}", path.display()))?;
        let marker = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse marker file: {}", path.display()))?;
        Ok(Some(marker))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write marker file: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace marker file: {}", path.display()))?;
        Ok(())
    }

    /// Session recorded as started but never ended.
    pub fn dangling_session(&self) -> Option<&str> {
        self.last_session
            .as_ref()
            .filter(|s| s.ended_at.is_none())
            .map(|s| s.id.as_str())
    }

    /// Whether the marker was written for the configured backend.
    pub fn matches(&self, section: &StateProviderSection) -> bool {
        self.state_provider == ProviderRef::from(section)
    }
}
