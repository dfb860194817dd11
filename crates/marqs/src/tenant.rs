use serde::{Deserialize, Serialize};

/// The type of an environment, which determines where its messages are
/// dispatched from: development environments are polled by their own
/// dedicated consumers, while all deployed environments share a single
/// fair-share parent queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnvironmentType {
    Development,
    Preview,
    Staging,
    Production,
}

impl EnvironmentType {
    pub fn is_development(&self) -> bool {
        matches!(self, EnvironmentType::Development)
    }
}

/// An authenticated tenant environment, resolved by an external collaborator.
/// Carries the identifiers and configured concurrency ceilings MarQS needs;
/// everything else about the tenant is out of scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantEnvironment {
    pub id: String,
    pub organization_id: String,
    #[serde(rename = "type")]
    pub env_type: EnvironmentType,
    /// Maximum concurrent executions for this environment.
    pub concurrency_limit: u32,
    /// Maximum concurrent executions for the owning organization.
    pub organization_concurrency_limit: u32,
}

impl TenantEnvironment {
    pub fn new(
        id: impl Into<String>,
        organization_id: impl Into<String>,
        env_type: EnvironmentType,
        concurrency_limit: u32,
        organization_concurrency_limit: u32,
    ) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            env_type,
            concurrency_limit,
            organization_concurrency_limit,
        }
    }
}
