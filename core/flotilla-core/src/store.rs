//! In-memory instance registry with change notification.
//!
//! The store is the single source of truth for instance records. All reads
//! and writes hand out **defensive copies**: mutating a record returned by
//! `get`/`get_all` never affects stored state, and a record passed to
//! `upsert` is cloned on the way in.
//!
//! # Events
//!
//! Mutations fire listeners synchronously, in registration order, as part of
//! the mutating call:
//!
//! - new id via `upsert`: `add` then `change`
//! - existing id via `upsert`: `change` only
//! - `remove`: `remove`, then `set_active` (if another id was promoted),
//!   then `change`
//! - `set_active`: `set_active` then `change` (no events when already active)
//!
//! Listeners are invoked after the record lock is released, so a listener may
//! re-enter the store.
//!
//! # Active instance
//!
//! Exactly one record is active whenever the store is non-empty. The first
//! ever upsert sets its id active; removing the active id promotes the first
//! remaining id in insertion order. That promotion order is deterministic but
//! intentionally undocumented as a recency contract.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{EngineError, Result};
use crate::types::InstanceRecord;

/// Listener invoked with the affected record.
pub type RecordListener = Arc<dyn Fn(&InstanceRecord) + Send + Sync>;
/// Listener invoked with the newly active instance id.
pub type ActiveListener = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    on_add: Vec<(u64, RecordListener)>,
    on_remove: Vec<(u64, RecordListener)>,
    on_change: Vec<(u64, RecordListener)>,
    on_set_active: Vec<(u64, ActiveListener)>,
}

/// Which listener list a [`Subscription`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Add,
    Remove,
    Change,
    SetActive,
}

/// Unsubscribe handle returned by the `on_*` methods.
///
/// Dropping the handle does nothing; call [`Subscription::unsubscribe`] to
/// stop receiving events.
pub struct Subscription {
    id: u64,
    kind: ListenerKind,
    listeners: Arc<Mutex<Listeners>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let mut listeners = self.listeners.lock().expect("listener lock poisoned");
        match self.kind {
            ListenerKind::Add => listeners.on_add.retain(|(id, _)| *id != self.id),
            ListenerKind::Remove => listeners.on_remove.retain(|(id, _)| *id != self.id),
            ListenerKind::Change => listeners.on_change.retain(|(id, _)| *id != self.id),
            ListenerKind::SetActive => listeners.on_set_active.retain(|(id, _)| *id != self.id),
        }
    }
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<String, InstanceRecord>,
    /// Insertion order of ids; parallel to `records`.
    order: Vec<String>,
    active_id: Option<String>,
}

/// Thread-safe instance registry. Cheap to share via `Arc`.
#[derive(Default)]
pub struct InstanceStore {
    inner: Mutex<StoreInner>,
    listeners: Arc<Mutex<Listeners>>,
}

impl InstanceStore {
    pub fn new() -> Self {
        InstanceStore::default()
    }

    /// Insert or replace a record by id, returning a copy of what was stored.
    ///
    /// The first-ever upsert marks that id active.
    pub fn upsert(&self, record: InstanceRecord) -> InstanceRecord {
        let stored = record.clone();
        let id = stored.id().to_string();

        let is_new = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            let is_new = !inner.records.contains_key(&id);
            if is_new {
                inner.order.push(id.clone());
            }
            // First record ever becomes active implicitly; no set_active
            // event fires for the initial assignment.
            if inner.active_id.is_none() {
                inner.active_id = Some(id.clone());
            }
            inner.records.insert(id.clone(), record);
            is_new
        };

        debug!(instance_id = %id, is_new, "store upsert");
        if is_new {
            self.fire_record(ListenerKind::Add, &stored);
        }
        self.fire_record(ListenerKind::Change, &stored);
        stored
    }

    /// Return a copy of the record for `id`, if any.
    pub fn get(&self, id: &str) -> Option<InstanceRecord> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner.records.get(id).cloned()
    }

    /// Return copies of all records in insertion order.
    pub fn get_all(&self) -> Vec<InstanceRecord> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }

    /// Number of records in the store.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete a record. Returns `false` if the id was unknown.
    ///
    /// If the removed id was active, the first remaining id in insertion
    /// order is promoted; an empty store ends up with no active id.
    pub fn remove(&self, id: &str) -> bool {
        let (removed, promoted) = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            let Some(removed) = inner.records.remove(id) else {
                return false;
            };
            inner.order.retain(|existing| existing != id);

            let mut promoted = None;
            if inner.active_id.as_deref() == Some(id) {
                inner.active_id = inner.order.first().cloned();
                promoted = inner.active_id.clone();
            }
            (removed, promoted)
        };

        debug!(instance_id = %id, promoted = ?promoted, "store remove");
        self.fire_record(ListenerKind::Remove, &removed);
        if let Some(next_active) = &promoted {
            self.fire_active(next_active);
        }
        self.fire_record(ListenerKind::Change, &removed);
        true
    }

    /// Mark `id` as the active instance.
    ///
    /// No-op (and no events) when `id` is already active.
    pub fn set_active(&self, id: &str) -> Result<()> {
        let activated = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            if !inner.records.contains_key(id) {
                return Err(EngineError::InstanceNotFound(id.to_string()));
            }
            if inner.active_id.as_deref() == Some(id) {
                None
            } else {
                inner.active_id = Some(id.to_string());
                inner.records.get(id).cloned()
            }
        };

        if let Some(record) = activated {
            debug!(instance_id = %id, "store set_active");
            self.fire_active(id);
            self.fire_record(ListenerKind::Change, &record);
        }
        Ok(())
    }

    /// Return a copy of the active record.
    ///
    /// Fails when the store is empty or the tracked active id no longer
    /// exists (a stale pointer indicates a usage bug).
    pub fn get_active(&self) -> Result<InstanceRecord> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let active_id = inner
            .active_id
            .as_ref()
            .ok_or(EngineError::NoActiveInstance)?;
        inner
            .records
            .get(active_id)
            .cloned()
            .ok_or_else(|| EngineError::InstanceNotFound(active_id.clone()))
    }

    /// Id of the active instance, if any.
    pub fn active_id(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .active_id
            .clone()
    }

    pub fn on_add(&self, listener: impl Fn(&InstanceRecord) + Send + Sync + 'static) -> Subscription {
        self.subscribe_record(ListenerKind::Add, Arc::new(listener))
    }

    pub fn on_remove(
        &self,
        listener: impl Fn(&InstanceRecord) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_record(ListenerKind::Remove, Arc::new(listener))
    }

    pub fn on_change(
        &self,
        listener: impl Fn(&InstanceRecord) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_record(ListenerKind::Change, Arc::new(listener))
    }

    pub fn on_set_active(&self, listener: impl Fn(&str) + Send + Sync + 'static) -> Subscription {
        let mut listeners = self.listeners.lock().expect("listener lock poisoned");
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.on_set_active.push((id, Arc::new(listener)));
        Subscription {
            id,
            kind: ListenerKind::SetActive,
            listeners: Arc::clone(&self.listeners),
        }
    }

    fn subscribe_record(&self, kind: ListenerKind, listener: RecordListener) -> Subscription {
        let mut listeners = self.listeners.lock().expect("listener lock poisoned");
        listeners.next_id += 1;
        let id = listeners.next_id;
        let list = match kind {
            ListenerKind::Add => &mut listeners.on_add,
            ListenerKind::Remove => &mut listeners.on_remove,
            ListenerKind::Change => &mut listeners.on_change,
            ListenerKind::SetActive => unreachable!("record listener kind"),
        };
        list.push((id, listener));
        Subscription {
            id,
            kind,
            listeners: Arc::clone(&self.listeners),
        }
    }

    fn fire_record(&self, kind: ListenerKind, record: &InstanceRecord) {
        // Snapshot the callbacks so listeners can subscribe/unsubscribe
        // re-entrantly without deadlocking.
        let callbacks: Vec<RecordListener> = {
            let listeners = self.listeners.lock().expect("listener lock poisoned");
            let list = match kind {
                ListenerKind::Add => &listeners.on_add,
                ListenerKind::Remove => &listeners.on_remove,
                ListenerKind::Change => &listeners.on_change,
                ListenerKind::SetActive => unreachable!("record listener kind"),
            };
            list.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in callbacks {
            cb(record);
        }
    }

    fn fire_active(&self, id: &str) {
        let callbacks: Vec<ActiveListener> = {
            let listeners = self.listeners.lock().expect("listener lock poisoned");
            listeners
                .on_set_active
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };
        for cb in callbacks {
            cb(id);
        }
    }
}
