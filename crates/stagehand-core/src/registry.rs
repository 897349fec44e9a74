//! Correlation registry.
//!
//! Joins asynchronous replies back to the suspended state that is waiting for
//! them. Each correlation id has at most one pending consumer and receives at
//! most one reply. A batch registered with [`CorrelationRegistry::wait_for_all`]
//! fires its continuation exactly once, when the last of its ids reports.
//!
//! Replies that arrive after [`CorrelationRegistry::reserve`] but before the
//! waiter registers are parked and handed over at registration time. Replies
//! for unknown ids are dropped.

use crate::error::RegistryError;
use stagehand_abstraction::{CorrelationId, NotificationSink, ResponseData};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Replies of one batch, keyed by correlation id.
pub type ResponseMap = HashMap<CorrelationId, ResponseData>;

/// Callback invoked once a batch is complete.
pub type Continuation = Box<dyn FnOnce(ResponseMap) + Send>;

enum Slot {
    /// Dispatched, nobody waiting yet.
    Reserved,
    /// Reply arrived before the waiter registered.
    Parked(ResponseData),
    /// Part of a registered batch.
    Waiting(u64),
}

struct Batch {
    ids: Vec<CorrelationId>,
    expected: usize,
    responses: ResponseMap,
    continuation: Continuation,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<CorrelationId, Slot>,
    batches: HashMap<u64, Batch>,
    next_batch: u64,
}

/// Process-wide map from correlation id to pending waiter.
#[derive(Default)]
pub struct CorrelationRegistry {
    inner: Mutex<Inner>,
}

impl fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (slots, batches) =
            self.inner.try_lock().map_or((0, 0), |inner| (inner.slots.len(), inner.batches.len()));
        f.debug_struct("CorrelationRegistry")
            .field("slots", &slots)
            .field("batches", &batches)
            .finish_non_exhaustive()
    }
}

impl CorrelationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `id` as dispatched so an early reply is parked instead of dropped.
    ///
    /// # Errors
    /// Returns `DuplicateCorrelationId` if the id is already known.
    pub fn reserve(&self, id: &CorrelationId) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if inner.slots.contains_key(id) {
            return Err(RegistryError::DuplicateCorrelationId(id.clone()));
        }
        inner.slots.insert(id.clone(), Slot::Reserved);
        debug!(correlation_id = %id, "Correlation id reserved");
        Ok(())
    }

    /// Registers a single-id waiter.
    ///
    /// # Errors
    /// Returns `DuplicateCorrelationId` if the id already has a waiter.
    pub fn register(
        &self,
        id: CorrelationId,
        continuation: impl FnOnce(ResponseData) + Send + 'static,
    ) -> Result<(), RegistryError> {
        self.wait_for_all(vec![id.clone()], move |mut responses| {
            if let Some(data) = responses.remove(&id) {
                continuation(data);
            }
        })
    }

    /// Registers a batch that resumes once every id has reported.
    ///
    /// Replies already parked for any of the ids are consumed immediately; if
    /// that completes the batch the continuation runs before this returns.
    ///
    /// # Arguments
    /// * `ids` - Correlation ids of the batch
    /// * `continuation` - Invoked once with all replies
    ///
    /// # Errors
    /// Returns `EmptyCorrelationSet` for an empty batch and
    /// `DuplicateCorrelationId` if any id is repeated or already has a waiter.
    pub fn wait_for_all(
        &self,
        ids: Vec<CorrelationId>,
        continuation: impl FnOnce(ResponseMap) + Send + 'static,
    ) -> Result<(), RegistryError> {
        if ids.is_empty() {
            return Err(RegistryError::EmptyCorrelationSet);
        }
        let mut seen = HashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(id) {
                return Err(RegistryError::DuplicateCorrelationId(id.clone()));
            }
        }

        let responses = {
            let mut inner = self.lock();
            if let Some(id) =
                ids.iter().find(|id| matches!(inner.slots.get(*id), Some(Slot::Waiting(_))))
            {
                return Err(RegistryError::DuplicateCorrelationId(id.clone()));
            }

            let batch_id = inner.next_batch;
            inner.next_batch += 1;

            let mut responses = ResponseMap::with_capacity(ids.len());
            for id in &ids {
                match inner.slots.remove(id) {
                    Some(Slot::Parked(data)) => {
                        responses.insert(id.clone(), data);
                    }
                    _ => {
                        inner.slots.insert(id.clone(), Slot::Waiting(batch_id));
                    }
                }
            }

            debug!(
                batch_id,
                expected = ids.len(),
                already_reported = responses.len(),
                "Correlation batch registered"
            );

            if responses.len() < ids.len() {
                inner.batches.insert(
                    batch_id,
                    Batch {
                        expected: ids.len(),
                        ids,
                        responses,
                        continuation: Box::new(continuation),
                    },
                );
                return Ok(());
            }
            responses
        };

        continuation(responses);
        Ok(())
    }

    /// Delivers a reply.
    ///
    /// # Returns
    /// `true` if the reply was accepted (delivered or parked), `false` if it
    /// was dropped because nobody is waiting for `id`.
    pub fn notify(&self, id: &CorrelationId, data: ResponseData) -> bool {
        let completed = {
            let mut inner = self.lock();
            match inner.slots.remove(id) {
                None => {
                    debug!(correlation_id = %id, "Dropping notification for unknown correlation id");
                    return false;
                }
                Some(Slot::Reserved) => {
                    inner.slots.insert(id.clone(), Slot::Parked(data));
                    debug!(correlation_id = %id, "Notification parked until waiter registers");
                    return true;
                }
                Some(Slot::Parked(existing)) => {
                    inner.slots.insert(id.clone(), Slot::Parked(existing));
                    debug!(correlation_id = %id, "Dropping duplicate notification");
                    return false;
                }
                Some(Slot::Waiting(batch_id)) => {
                    let full = inner.batches.get_mut(&batch_id).is_some_and(|batch| {
                        batch.responses.insert(id.clone(), data);
                        batch.responses.len() == batch.expected
                    });
                    if full { inner.batches.remove(&batch_id) } else { None }
                }
            }
        };

        if let Some(batch) = completed {
            debug!(correlation_id = %id, size = batch.expected, "Correlation batch complete");
            (batch.continuation)(batch.responses);
        }
        true
    }

    /// Removes the registrations of `ids` so later replies are dropped.
    ///
    /// Cancelling any id of a batch discards the whole batch.
    ///
    /// # Returns
    /// The number of ids that were removed.
    pub fn cancel(&self, ids: &[CorrelationId]) -> usize {
        let mut inner = self.lock();
        let mut removed = 0;
        for id in ids {
            match inner.slots.remove(id) {
                Some(Slot::Waiting(batch_id)) => {
                    removed += 1;
                    let Some(batch) = inner.batches.remove(&batch_id) else {
                        continue;
                    };
                    for member in batch.ids.iter().filter(|member| *member != id) {
                        if matches!(inner.slots.get(member), Some(Slot::Waiting(b)) if *b == batch_id) {
                            inner.slots.remove(member);
                            removed += 1;
                        }
                    }
                }
                Some(_) => removed += 1,
                None => {}
            }
        }
        if removed > 0 {
            debug!(removed, "Correlation ids cancelled");
        }
        removed
    }

    /// Drops reservations and parked replies of `ids`.
    ///
    /// Ids that belong to a registered batch are left alone, so a caller can
    /// release what it reserved without disturbing another waiter.
    ///
    /// # Returns
    /// The number of ids that were removed.
    pub fn release(&self, ids: &[CorrelationId]) -> usize {
        let mut inner = self.lock();
        let mut removed = 0;
        for id in ids {
            if matches!(inner.slots.get(id), Some(Slot::Reserved | Slot::Parked(_))) {
                inner.slots.remove(id);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Correlation reservations released");
        }
        removed
    }

    /// Returns `true` if a waiter is registered for `id`.
    #[must_use]
    pub fn is_waiting(&self, id: &CorrelationId) -> bool {
        matches!(self.lock().slots.get(id), Some(Slot::Waiting(_)))
    }

    /// Returns the number of ids with a registered waiter.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.lock().slots.values().filter(|s| matches!(s, Slot::Waiting(_))).count()
    }

    /// Returns the number of ids the registry tracks in any form.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Returns `true` if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }
}

impl NotificationSink for CorrelationRegistry {
    fn notify(&self, correlation_id: &CorrelationId, data: ResponseData) -> bool {
        Self::notify(self, correlation_id, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Arc<Mutex<Vec<ResponseMap>>>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(Mutex::new(Vec::new())))
    }

    #[test]
    fn test_notify_unregistered_is_noop() {
        let registry = CorrelationRegistry::new();
        assert!(!registry.notify(&CorrelationId::generate(), ResponseData::success(json!(null))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_single_registration_fires_once() {
        let registry = CorrelationRegistry::new();
        let (calls, seen) = counter();
        let id = CorrelationId::generate();

        let (c, s) = (Arc::clone(&calls), Arc::clone(&seen));
        registry
            .wait_for_all(vec![id.clone()], move |responses| {
                c.fetch_add(1, Ordering::SeqCst);
                s.lock().unwrap().push(responses);
            })
            .unwrap();
        assert!(registry.is_waiting(&id));

        assert!(registry.notify(&id, ResponseData::success(json!({"n": 1}))));
        assert!(!registry.notify(&id, ResponseData::success(json!({"n": 2}))));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0][&id], ResponseData::success(json!({"n": 1})));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_batch_waits_for_all() {
        let registry = CorrelationRegistry::new();
        let (calls, seen) = counter();
        let ids: Vec<CorrelationId> = (0..3).map(|_| CorrelationId::generate()).collect();

        let (c, s) = (Arc::clone(&calls), Arc::clone(&seen));
        registry
            .wait_for_all(ids.clone(), move |responses| {
                c.fetch_add(1, Ordering::SeqCst);
                s.lock().unwrap().push(responses);
            })
            .unwrap();

        registry.notify(&ids[2], ResponseData::failure("bad"));
        registry.notify(&ids[0], ResponseData::success(json!(0)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.waiting_count(), 1);

        registry.notify(&ids[1], ResponseData::success(json!(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap()[0].len(), 3);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        registry.register(id.clone(), |_| {}).unwrap();

        let err = registry.register(id.clone(), |_| {}).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateCorrelationId(id.clone()));

        let err = registry.wait_for_all(vec![CorrelationId::from("x"), CorrelationId::from("x")], |_| {});
        assert!(matches!(err, Err(RegistryError::DuplicateCorrelationId(_))));
    }

    #[test]
    fn test_empty_batch_fails() {
        let registry = CorrelationRegistry::new();
        assert_eq!(registry.wait_for_all(vec![], |_| {}), Err(RegistryError::EmptyCorrelationSet));
    }

    #[test]
    fn test_early_reply_is_parked() {
        let registry = CorrelationRegistry::new();
        let (calls, _) = counter();
        let id = CorrelationId::generate();

        registry.reserve(&id).unwrap();
        assert!(registry.notify(&id, ResponseData::success(json!("early"))));
        assert!(!registry.notify(&id, ResponseData::success(json!("again"))));

        let c = Arc::clone(&calls);
        registry
            .register(id.clone(), move |data| {
                assert_eq!(data, ResponseData::success(json!("early")));
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reserve_twice_fails() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::generate();
        registry.reserve(&id).unwrap();
        assert!(registry.reserve(&id).is_err());
    }

    #[test]
    fn test_cancel_drops_late_replies() {
        let registry = CorrelationRegistry::new();
        let (calls, _) = counter();
        let ids: Vec<CorrelationId> = (0..2).map(|_| CorrelationId::generate()).collect();

        let c = Arc::clone(&calls);
        registry
            .wait_for_all(ids.clone(), move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(registry.cancel(&ids[..1]), 2);
        assert!(!registry.notify(&ids[0], ResponseData::success(json!(null))));
        assert!(!registry.notify(&ids[1], ResponseData::success(json!(null))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_partially_reported_batch() {
        let registry = CorrelationRegistry::new();
        let (calls, _) = counter();
        let ids: Vec<CorrelationId> = (0..3).map(|_| CorrelationId::generate()).collect();
        let other = CorrelationId::generate();

        let c = Arc::clone(&calls);
        registry
            .wait_for_all(ids.clone(), move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        registry.register(other.clone(), |_| {}).unwrap();
        registry.notify(&ids[1], ResponseData::success(json!(null)));

        assert_eq!(registry.cancel(&ids[2..]), 2);
        assert!(!registry.notify(&ids[0], ResponseData::success(json!(null))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(registry.is_waiting(&other));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_release_keeps_other_waiters() {
        let registry = CorrelationRegistry::new();
        let (reserved, parked, waited) =
            (CorrelationId::generate(), CorrelationId::generate(), CorrelationId::generate());
        registry.reserve(&reserved).unwrap();
        registry.reserve(&parked).unwrap();
        registry.notify(&parked, ResponseData::success(json!("early")));
        registry.register(waited.clone(), |_| {}).unwrap();

        let ids = [reserved.clone(), parked.clone(), waited.clone()];
        assert_eq!(registry.release(&ids), 2);
        assert!(registry.is_waiting(&waited));
        assert!(!registry.notify(&reserved, ResponseData::success(json!(null))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_notify_fires_once() {
        let registry = Arc::new(CorrelationRegistry::new());
        let (calls, _) = counter();
        let ids: Vec<CorrelationId> = (0..32).map(|_| CorrelationId::generate()).collect();

        let c = Arc::clone(&calls);
        registry
            .wait_for_all(ids.clone(), move |responses| {
                assert_eq!(responses.len(), 32);
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.notify(&id, ResponseData::success(json!(null)));
                    registry.notify(&id, ResponseData::success(json!(null)));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
