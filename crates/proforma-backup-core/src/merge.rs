use tracing::debug;

use crate::error::BackupError;
use crate::model::{Batch, MergeSummary};
use crate::store::RecordStore;

/// Merge a client batch into `store`, one upsert per record.
///
/// Proformas are applied before items, each list in the order given. The
/// first store failure aborts the batch; records written before it stay
/// written, and since every upsert is idempotent the caller can resubmit the
/// whole batch to complete it.
///
/// # Errors
/// Returns [`BackupError::Validation`] for an empty batch (without touching
/// the store) and [`BackupError::Storage`] for the first failed upsert.
pub fn merge_batch<S>(store: &mut S, batch: &Batch) -> Result<MergeSummary, BackupError>
where
    S: RecordStore + ?Sized,
{
    if batch.is_empty() {
        return Err(BackupError::validation("batch required"));
    }

    let mut summary = MergeSummary::default();

    for proforma in &batch.proformas {
        store.upsert_proforma(proforma)?;
        debug!(proforma_id = proforma.id, "processed proforma");
        summary.proformas += 1;
    }

    for item in &batch.items {
        store.upsert_item(item)?;
        debug!(item_id = item.id, proforma_id = ?item.proforma_id, "processed item");
        summary.items += 1;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::error::StoreError;
    use crate::field::Field;
    use crate::model::{Item, Proforma};
    use crate::store::MemoryStore;

    fn named(id: i64, name: &str) -> Proforma {
        Proforma { customer_name: Field::Set(name.to_string()), ..Proforma::new(id) }
    }

    fn snapshot(store: &MemoryStore) -> (Vec<Proforma>, Vec<Option<Item>>) {
        let proformas = match store.find_all_proformas() {
            Ok(proformas) => proformas,
            Err(err) => panic!("find failed: {err}"),
        };
        let items = (0..32).map(|id| store.item(id)).collect();
        (proformas, items)
    }

    #[test]
    fn empty_batch_is_rejected_without_store_access() {
        let mut store = MemoryStore::new();

        let result = merge_batch(&mut store, &Batch::default());

        assert_eq!(result, Err(BackupError::Validation("batch required".to_string())));
        assert_eq!(store.access_counts().total(), 0);
    }

    #[test]
    fn resubmitting_an_id_updates_the_single_record() -> Result<(), BackupError> {
        let mut store = MemoryStore::new();

        merge_batch(&mut store, &Batch::new(vec![named(7, "A")], vec![]))?;
        merge_batch(&mut store, &Batch::new(vec![named(7, "B")], vec![]))?;

        assert_eq!(store.proforma_count(), 1);
        assert_eq!(store.proforma(7).map(|p| p.customer_name), Some(Field::Set("B".to_string())));
        Ok(())
    }

    #[test]
    fn explicit_null_in_a_later_batch_clears_the_field() -> Result<(), BackupError> {
        let mut store = MemoryStore::new();
        let first: Batch = match serde_json::from_str(
            r#"{"proformas": [{"id": 7, "referenceNumber": "REF-1", "customerName": "A"}]}"#,
        ) {
            Ok(batch) => batch,
            Err(err) => panic!("fixture should parse: {err}"),
        };
        let second: Batch =
            match serde_json::from_str(r#"{"proformas": [{"id": 7, "referenceNumber": null}]}"#) {
                Ok(batch) => batch,
                Err(err) => panic!("fixture should parse: {err}"),
            };

        merge_batch(&mut store, &first)?;
        merge_batch(&mut store, &second)?;

        let Some(stored) = store.proforma(7) else {
            panic!("proforma 7 should be stored");
        };
        assert_eq!(stored.reference_number.get(), None);
        assert_eq!(stored.customer_name, Field::Set("A".to_string()));
        Ok(())
    }

    #[test]
    fn orphan_items_are_accepted() -> Result<(), BackupError> {
        let mut store = MemoryStore::new();

        let summary = merge_batch(&mut store, &Batch::new(vec![], vec![Item::new(10, 404)]))?;

        assert_eq!(summary, MergeSummary { proformas: 0, items: 1 });
        assert_eq!(store.item(10).map(|item| item.proforma_id), Some(Field::Set(404)));
        Ok(())
    }

    #[test]
    fn failure_stops_the_batch_and_keeps_earlier_writes() {
        let mut store = MemoryStore::new();
        store.fail_item_upserts(11);
        let batch = Batch::new(
            vec![named(1, "A")],
            vec![Item::new(10, 1), Item::new(11, 1), Item::new(12, 1)],
        );

        let result = merge_batch(&mut store, &batch);

        assert!(matches!(result, Err(BackupError::Storage(StoreError::Operation(_)))));
        assert!(store.proforma(1).is_some());
        assert!(store.item(10).is_some());
        assert!(store.item(12).is_none());
        assert_eq!(store.access_counts().upsert_item, 2);
    }

    fn arb_field<T, S>(values: S) -> impl Strategy<Value = Field<T>>
    where
        T: Clone + std::fmt::Debug + 'static,
        S: Strategy<Value = T> + 'static,
    {
        prop_oneof![Just(Field::Absent), Just(Field::Null), values.prop_map(Field::Set)]
    }

    fn arb_proforma() -> impl Strategy<Value = Proforma> {
        (0_i64..8, arb_field("[a-z]{1,6}"), arb_field(0.0_f64..1000.0))
            .prop_map(|(id, name, total)| Proforma {
                customer_name: name,
                total_amount: total,
                ..Proforma::new(id)
            })
    }

    fn arb_item() -> impl Strategy<Value = Item> {
        (0_i64..32, arb_field(0_i64..8), arb_field("[a-z]{1,6}")).prop_map(
            |(id, proforma_id, item_name)| Item { id, proforma_id, item_name, ..Item::default() },
        )
    }

    proptest! {
        #[test]
        fn property_merging_a_batch_twice_equals_merging_it_once(
            proformas in proptest::collection::vec(arb_proforma(), 0..12),
            items in proptest::collection::vec(arb_item(), 1..24),
        ) {
            let batch = Batch::new(proformas, items);

            let mut once = MemoryStore::new();
            prop_assert!(merge_batch(&mut once, &batch).is_ok());

            let mut twice = MemoryStore::new();
            prop_assert!(merge_batch(&mut twice, &batch).is_ok());
            prop_assert!(merge_batch(&mut twice, &batch).is_ok());

            prop_assert_eq!(snapshot(&once), snapshot(&twice));
        }
    }
}
