use async_trait::async_trait;

use crate::domain::errors::DomainResult;

/// Per-project pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub review_required: bool,
    pub base_branch: String,
    pub push_after_merge: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            review_required: true,
            base_branch: "main".to_string(),
            push_after_merge: false,
        }
    }
}

/// Source of per-project pipeline configuration.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn pipeline_settings(&self, project_id: &str) -> DomainResult<PipelineSettings>;
}
