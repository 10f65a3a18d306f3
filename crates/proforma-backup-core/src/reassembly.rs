use std::collections::{BTreeSet, HashMap};

use crate::error::BackupError;
use crate::model::{Item, ItemView, Proforma, ProformaView, StableId};
use crate::store::RecordStore;

/// Rebuild the full dataset: every proforma, newest first, with its items nested.
///
/// Issues exactly two store reads regardless of how many proformas exist:
/// one for all proformas and one bulk item fetch keyed by their id set.
///
/// # Errors
/// Returns [`BackupError::Storage`] when either read fails.
pub fn list_all<S>(store: &S) -> Result<Vec<ProformaView>, BackupError>
where
    S: RecordStore + ?Sized,
{
    let proformas = store.find_all_proformas()?;
    let proforma_ids = proformas.iter().map(|proforma| proforma.id).collect::<BTreeSet<_>>();
    let items = store.find_items_by_proforma_ids(&proforma_ids)?;
    Ok(assemble(proformas, &items))
}

/// Attach `items` to their owning `proformas` and order the result newest first.
///
/// Ties keep the order in which `proformas` was given. Items that point at
/// no given proforma are dropped.
#[must_use]
pub fn assemble(mut proformas: Vec<Proforma>, items: &[Item]) -> Vec<ProformaView> {
    proformas.sort_by(Proforma::newest_first);

    let mut by_parent: HashMap<StableId, Vec<ItemView>> = HashMap::new();
    for item in items {
        if let Some(proforma_id) = item.proforma_id.get() {
            by_parent.entry(*proforma_id).or_default().push(item.view());
        }
    }

    proformas
        .into_iter()
        .map(|proforma| {
            let items = by_parent.remove(&proforma.id).unwrap_or_default();
            ProformaView { proforma, items }
        })
        .collect()
}
