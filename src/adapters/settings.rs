//! Settings provider backed by the loaded configuration.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::PipelineConfig;
use crate::domain::ports::{PipelineSettings, SettingsProvider};

/// Serves the `pipeline` config section, with optional per-project overrides.
#[derive(Debug, Clone, Default)]
pub struct ConfigSettingsProvider {
    defaults: PipelineConfig,
    projects: HashMap<String, PipelineConfig>,
}

impl ConfigSettingsProvider {
    pub fn new(defaults: PipelineConfig) -> Self {
        Self {
            defaults,
            projects: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_project(mut self, project_id: impl Into<String>, config: PipelineConfig) -> Self {
        self.projects.insert(project_id.into(), config);
        self
    }

    fn config_for(&self, project_id: &str) -> &PipelineConfig {
        self.projects.get(project_id).unwrap_or(&self.defaults)
    }

    /// Test command for a project, if one is configured.
    pub fn test_command(&self, project_id: &str) -> Option<&str> {
        self.config_for(project_id).test_command.as_deref()
    }
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            review_required: config.review_required,
            base_branch: config.base_branch.clone(),
            push_after_merge: config.push_after_merge,
        }
    }
}

#[async_trait]
impl SettingsProvider for ConfigSettingsProvider {
    async fn pipeline_settings(&self, project_id: &str) -> DomainResult<PipelineSettings> {
        Ok(self.config_for(project_id).into())
    }
}
