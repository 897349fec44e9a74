//! Activity (audit) records and their store.

use crate::{ExecutionStatus, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit record of one externally visible unit of work.
///
/// Created RUNNING before work is dispatched and moved to a terminal status
/// exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Store-assigned identifier (`None` until saved).
    pub id: Option<String>,
    /// Owning application.
    pub app_id: String,
    /// Environment the work targets.
    pub env_id: Option<String>,
    /// Workflow execution that produced the activity.
    pub workflow_execution_id: String,
    /// Name of the issuing state.
    pub state_name: String,
    /// Type of the issuing state (e.g. "COMMAND").
    pub state_type: String,
    /// Command or job name shown to operators.
    pub command_name: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl Activity {
    /// Creates an unsaved RUNNING activity.
    #[must_use]
    pub fn running(
        app_id: impl Into<String>,
        workflow_execution_id: impl Into<String>,
        state_name: impl Into<String>,
        state_type: impl Into<String>,
        command_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            app_id: app_id.into(),
            env_id: None,
            workflow_execution_id: workflow_execution_id.into(),
            state_name: state_name.into(),
            state_type: state_type.into(),
            command_name: command_name.into(),
            status: ExecutionStatus::Running,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the environment id.
    #[must_use]
    pub fn with_env_id(mut self, env_id: impl Into<String>) -> Self {
        self.env_id = Some(env_id.into());
        self
    }
}

/// Persistence boundary for activities.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Persists a new activity and returns it with its assigned id.
    ///
    /// # Errors
    /// Returns a `StoreError` if the activity cannot be saved.
    async fn save(&self, activity: Activity) -> Result<Activity, StoreError>;

    /// Loads an activity.
    ///
    /// # Errors
    /// Returns a `StoreError` if the store fails.
    async fn get(&self, activity_id: &str, app_id: &str) -> Result<Option<Activity>, StoreError>;

    /// Moves a non-terminal activity to `status`.
    ///
    /// # Returns
    /// `Ok(true)` if the activity was updated, `Ok(false)` if it was already
    /// terminal (the update is then a no-op).
    ///
    /// # Errors
    /// Returns `StoreError::NotFound` for an unknown activity.
    async fn update_status(
        &self,
        activity_id: &str,
        app_id: &str,
        status: ExecutionStatus,
    ) -> Result<bool, StoreError>;
}
