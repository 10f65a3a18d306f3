use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::model::{Item, Proforma, StableId};

/// Minimal contract over the durable store.
///
/// Upserts are keyed by stable id and apply the field-level merge of
/// [`Proforma::merge_from`] / [`Item::merge_from`] atomically per record.
/// Records read back only hold [`Field::Absent`](crate::Field::Absent) or
/// [`Field::Set`](crate::Field::Set).
/// `find_all_proformas` returns records in storage order.
pub trait RecordStore {
    /// # Errors
    /// Returns a [`StoreError`] when the write cannot be applied.
    fn upsert_proforma(&mut self, proforma: &Proforma) -> Result<(), StoreError>;

    /// # Errors
    /// Returns a [`StoreError`] when the write cannot be applied.
    fn upsert_item(&mut self, item: &Item) -> Result<(), StoreError>;

    /// # Errors
    /// Returns a [`StoreError`] when the read fails.
    fn find_all_proformas(&self) -> Result<Vec<Proforma>, StoreError>;

    /// Fetch every item whose `proforma_id` is in `proforma_ids`, in one round trip.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the read fails.
    fn find_items_by_proforma_ids(
        &self,
        proforma_ids: &BTreeSet<StableId>,
    ) -> Result<Vec<Item>, StoreError>;
}

/// Per-operation call counts recorded by [`MemoryStore`].
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct AccessCounts {
    pub upsert_proforma: usize,
    pub upsert_item: usize,
    pub find_all_proformas: usize,
    pub find_items_by_proforma_ids: usize,
}

impl AccessCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.upsert_proforma
            + self.upsert_item
            + self.find_all_proformas
            + self.find_items_by_proforma_ids
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    proformas: Vec<Proforma>,
    proforma_slots: BTreeMap<StableId, usize>,
    items: Vec<Item>,
    item_slots: BTreeMap<StableId, usize>,
    counts: AccessCounts,
    disconnected: bool,
    failing_items: BTreeSet<StableId>,
}

/// In-process [`RecordStore`].
///
/// Clones share the same records, so a connector can hand out fresh handles
/// across reconnects while tests keep one clone to inspect state, access
/// counts and injected failures.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn access_counts(&self) -> AccessCounts {
        self.state.lock().counts
    }

    #[must_use]
    pub fn proforma(&self, id: StableId) -> Option<Proforma> {
        let state = self.state.lock();
        state.proforma_slots.get(&id).map(|slot| state.proformas[*slot].clone())
    }

    #[must_use]
    pub fn item(&self, id: StableId) -> Option<Item> {
        let state = self.state.lock();
        state.item_slots.get(&id).map(|slot| state.items[*slot].clone())
    }

    #[must_use]
    pub fn proforma_count(&self) -> usize {
        self.state.lock().proformas.len()
    }

    #[must_use]
    pub fn item_count(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Make every operation fail with [`StoreError::Disconnected`] until cleared.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.state.lock().disconnected = disconnected;
    }

    /// Make upserts of the given item id fail with [`StoreError::Operation`].
    pub fn fail_item_upserts(&self, item_id: StableId) {
        self.state.lock().failing_items.insert(item_id);
    }
}

impl MemoryState {
    fn check_connected(&self) -> Result<(), StoreError> {
        if self.disconnected {
            return Err(StoreError::Disconnected("memory store detached".to_string()));
        }
        Ok(())
    }
}

impl RecordStore for MemoryStore {
    fn upsert_proforma(&mut self, proforma: &Proforma) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.counts.upsert_proforma += 1;
        state.check_connected()?;

        if let Some(slot) = state.proforma_slots.get(&proforma.id).copied() {
            state.proformas[slot].merge_from(proforma);
        } else {
            let mut record = Proforma::new(proforma.id);
            record.merge_from(proforma);
            let slot = state.proformas.len();
            state.proformas.push(record);
            state.proforma_slots.insert(proforma.id, slot);
        }
        Ok(())
    }

    fn upsert_item(&mut self, item: &Item) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.counts.upsert_item += 1;
        state.check_connected()?;
        if state.failing_items.contains(&item.id) {
            return Err(StoreError::Operation(format!("write rejected for item {}", item.id)));
        }

        if let Some(slot) = state.item_slots.get(&item.id).copied() {
            state.items[slot].merge_from(item);
        } else {
            let mut record = Item { id: item.id, ..Item::default() };
            record.merge_from(item);
            let slot = state.items.len();
            state.items.push(record);
            state.item_slots.insert(item.id, slot);
        }
        Ok(())
    }

    fn find_all_proformas(&self) -> Result<Vec<Proforma>, StoreError> {
        let mut state = self.state.lock();
        state.counts.find_all_proformas += 1;
        state.check_connected()?;
        Ok(state.proformas.clone())
    }

    fn find_items_by_proforma_ids(
        &self,
        proforma_ids: &BTreeSet<StableId>,
    ) -> Result<Vec<Item>, StoreError> {
        let mut state = self.state.lock();
        state.counts.find_items_by_proforma_ids += 1;
        state.check_connected()?;
        Ok(state
            .items
            .iter()
            .filter(|item| item.proforma_id.get().is_some_and(|id| proforma_ids.contains(id)))
            .cloned()
            .collect())
    }
}
