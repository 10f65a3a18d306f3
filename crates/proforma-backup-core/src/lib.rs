//! Reconciling upsert-and-reassembly engine for proforma backups.
//!
//! Clients push snapshots of proformas and their line items; [`merge_batch`]
//! folds them into a [`RecordStore`] keyed by client-assigned stable ids, and
//! [`list_all`] rebuilds the nested view with one bulk item fetch.

mod error;
mod field;
mod merge;
mod model;
mod reassembly;
mod store;

pub use error::{BackupError, StoreError};
pub use field::Field;
pub use merge::merge_batch;
pub use model::{Batch, Item, ItemView, MergeSummary, Proforma, ProformaView, StableId};
pub use reassembly::{assemble, list_all};
pub use store::{AccessCounts, MemoryStore, RecordStore};
