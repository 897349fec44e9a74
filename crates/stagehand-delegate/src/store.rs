//! In-memory activity store.

use async_trait::async_trait;
use chrono::Utc;
use stagehand_abstraction::{Activity, ActivityStore, ExecutionStatus, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Activity store backed by a map keyed by activity id.
///
/// Status updates are compare-and-set: an activity that already reached a
/// terminal status is never changed again.
#[derive(Debug, Default, Clone)]
pub struct InMemoryActivityStore {
    activities: Arc<RwLock<HashMap<String, Activity>>>,
}

impl InMemoryActivityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored activities.
    pub async fn len(&self) -> usize {
        self.activities.read().await.len()
    }

    /// Returns `true` if nothing has been stored.
    pub async fn is_empty(&self) -> bool {
        self.activities.read().await.is_empty()
    }

    /// Returns all stored activities ordered by creation time.
    pub async fn all(&self) -> Vec<Activity> {
        let mut all: Vec<Activity> = self.activities.read().await.values().cloned().collect();
        all.sort_by_key(|a| a.created_at);
        all
    }
}

#[async_trait]
impl ActivityStore for InMemoryActivityStore {
    async fn save(&self, mut activity: Activity) -> Result<Activity, StoreError> {
        if activity.app_id.is_empty() {
            return Err(StoreError::Invalid("activity has no app id".to_string()));
        }
        let id = activity.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        activity.id = Some(id.clone());

        debug!(activity_id = %id, state_name = %activity.state_name, status = %activity.status, "Saving activity");
        self.activities.write().await.insert(id, activity.clone());
        Ok(activity)
    }

    async fn get(&self, activity_id: &str, app_id: &str) -> Result<Option<Activity>, StoreError> {
        Ok(self
            .activities
            .read()
            .await
            .get(activity_id)
            .filter(|a| a.app_id == app_id)
            .cloned())
    }

    async fn update_status(
        &self,
        activity_id: &str,
        app_id: &str,
        status: ExecutionStatus,
    ) -> Result<bool, StoreError> {
        let mut activities = self.activities.write().await;
        let activity = activities
            .get_mut(activity_id)
            .filter(|a| a.app_id == app_id)
            .ok_or_else(|| StoreError::NotFound(activity_id.to_string()))?;

        if !activity.status.can_transition_to(status) {
            debug!(
                activity_id = %activity_id,
                current = %activity.status,
                requested = %status,
                "Ignoring activity status update"
            );
            return Ok(false);
        }

        activity.status = status;
        activity.updated_at = Utc::now();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn activity() -> Activity {
        Activity::running("app-1", "wf-1", "Deploy", "COMMAND", "install")
    }

    #[tokio::test]
    async fn test_save_assigns_id() {
        let store = InMemoryActivityStore::new();
        let saved = store.save(activity()).await.unwrap();
        let id = saved.id.clone().unwrap();

        let loaded = store.get(&id, "app-1").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert!(store.get(&id, "other-app").await.unwrap().is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_save_rejects_missing_app() {
        let store = InMemoryActivityStore::new();
        let bad = Activity::running("", "wf-1", "Deploy", "COMMAND", "install");
        assert!(matches!(store.save(bad).await, Err(StoreError::Invalid(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_terminal_status_is_sticky() {
        let store = InMemoryActivityStore::new();
        let id = store.save(activity()).await.unwrap().id.unwrap();

        assert!(store.update_status(&id, "app-1", ExecutionStatus::Success).await.unwrap());
        assert!(!store.update_status(&id, "app-1", ExecutionStatus::Aborted).await.unwrap());

        let loaded = store.get(&id, "app-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_update_unknown_activity() {
        let store = InMemoryActivityStore::new();
        let err = store.update_status("missing", "app-1", ExecutionStatus::Failed).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("missing".to_string()));
    }
}
