//! Activity recorder.
//!
//! Creates a RUNNING activity before a state dispatches remote work and moves
//! it to a terminal status once. Updates on an already-terminal activity are
//! no-ops, so abort and resume may both try to finalize the same record.

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::state::StateType;
use stagehand_abstraction::{Activity, ActivityStore, ExecutionStatus};
use std::sync::Arc;
use tracing::{debug, info};

/// Writes activity records through an [`ActivityStore`].
#[derive(Clone)]
pub struct ActivityRecorder {
    store: Arc<dyn ActivityStore>,
}

impl std::fmt::Debug for ActivityRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityRecorder").finish_non_exhaustive()
    }
}

impl ActivityRecorder {
    /// Creates a recorder writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ActivityStore>) -> Self {
        Self { store }
    }

    /// Creates and saves a RUNNING activity for the current state.
    ///
    /// # Returns
    /// The saved activity with its id.
    ///
    /// # Errors
    /// Returns `StateError::Store` if the activity cannot be saved.
    pub async fn create(
        &self,
        ctx: &ExecutionContext,
        state_type: StateType,
        command_name: &str,
    ) -> Result<Activity> {
        let ids = ctx.ids();
        let mut activity = Activity::running(
            ids.app_id.clone(),
            ids.workflow_execution_id.clone(),
            ctx.state_name(),
            state_type.to_string(),
            command_name,
        );
        activity.env_id.clone_from(&ids.env_id);

        let saved = self.store.save(activity).await?;
        info!(
            activity_id = saved.id.as_deref().unwrap_or_default(),
            state_name = %ctx.state_name(),
            command_name = %command_name,
            "Activity created"
        );
        Ok(saved)
    }

    /// Moves the activity to `status`.
    ///
    /// # Returns
    /// `false` if the activity was already terminal and nothing changed.
    ///
    /// # Errors
    /// Returns `StateError::Store` if the activity does not exist.
    pub async fn update_status(
        &self,
        app_id: &str,
        activity_id: &str,
        status: ExecutionStatus,
    ) -> Result<bool> {
        let updated = self.store.update_status(activity_id, app_id, status).await?;
        debug!(activity_id = %activity_id, status = %status, updated, "Activity status update");
        Ok(updated)
    }

    /// Loads an activity.
    ///
    /// # Errors
    /// Returns `StateError::Store` if the store fails.
    pub async fn get(&self, app_id: &str, activity_id: &str) -> Result<Option<Activity>> {
        Ok(self.store.get(activity_id, app_id).await?)
    }
}
