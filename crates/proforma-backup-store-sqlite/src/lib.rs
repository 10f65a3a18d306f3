use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use proforma_backup_core::{Field, Item, Proforma, RecordStore, StableId, StoreError};
use rusqlite::types::FromSql;
use rusqlite::{named_params, params, Connection, ErrorCode, Row};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// `seq` preserves first-insertion order; `id` is the client's stable identifier.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS proformas (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id INTEGER NOT NULL UNIQUE,
  proforma_number TEXT,
  customer_name TEXT,
  plate_number TEXT,
  vin TEXT,
  model TEXT,
  reference_number TEXT,
  delivery_time TEXT,
  prepared_by TEXT,
  date_created TEXT,
  sub_total REAL,
  vat REAL,
  total_amount REAL,
  last_modified TEXT
);

CREATE TABLE IF NOT EXISTS items (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id INTEGER NOT NULL UNIQUE,
  proforma_id INTEGER,
  item_name TEXT,
  unit TEXT,
  quantity REAL,
  cost REAL,
  price REAL,
  last_modified TEXT
);

CREATE INDEX IF NOT EXISTS idx_items_proforma_id ON items(proforma_id);
";

// Each optional column carries a `*_sent` flag: a sent NULL clears the
// stored value, an unsent column keeps it.
const UPSERT_PROFORMA_SQL: &str = r"
INSERT INTO proformas(
  id, proforma_number, customer_name, plate_number, vin, model,
  reference_number, delivery_time, prepared_by, date_created,
  sub_total, vat, total_amount, last_modified
) VALUES (
  :id, :proforma_number, :customer_name, :plate_number, :vin, :model,
  :reference_number, :delivery_time, :prepared_by, :date_created,
  :sub_total, :vat, :total_amount, :last_modified
)
ON CONFLICT(id) DO UPDATE SET
  proforma_number = IIF(:proforma_number_sent, excluded.proforma_number, proformas.proforma_number),
  customer_name = IIF(:customer_name_sent, excluded.customer_name, proformas.customer_name),
  plate_number = IIF(:plate_number_sent, excluded.plate_number, proformas.plate_number),
  vin = IIF(:vin_sent, excluded.vin, proformas.vin),
  model = IIF(:model_sent, excluded.model, proformas.model),
  reference_number = IIF(:reference_number_sent, excluded.reference_number, proformas.reference_number),
  delivery_time = IIF(:delivery_time_sent, excluded.delivery_time, proformas.delivery_time),
  prepared_by = IIF(:prepared_by_sent, excluded.prepared_by, proformas.prepared_by),
  date_created = IIF(:date_created_sent, excluded.date_created, proformas.date_created),
  sub_total = IIF(:sub_total_sent, excluded.sub_total, proformas.sub_total),
  vat = IIF(:vat_sent, excluded.vat, proformas.vat),
  total_amount = IIF(:total_amount_sent, excluded.total_amount, proformas.total_amount),
  last_modified = IIF(:last_modified_sent, excluded.last_modified, proformas.last_modified)
";

const UPSERT_ITEM_SQL: &str = r"
INSERT INTO items(
  id, proforma_id, item_name, unit, quantity, cost, price, last_modified
) VALUES (
  :id, :proforma_id, :item_name, :unit, :quantity, :cost, :price, :last_modified
)
ON CONFLICT(id) DO UPDATE SET
  proforma_id = IIF(:proforma_id_sent, excluded.proforma_id, items.proforma_id),
  item_name = IIF(:item_name_sent, excluded.item_name, items.item_name),
  unit = IIF(:unit_sent, excluded.unit, items.unit),
  quantity = IIF(:quantity_sent, excluded.quantity, items.quantity),
  cost = IIF(:cost_sent, excluded.cost, items.cost),
  price = IIF(:price_sent, excluded.price, items.price),
  last_modified = IIF(:last_modified_sent, excluded.last_modified, items.last_modified)
";

const SELECT_PROFORMAS_SQL: &str = r"
SELECT
  id, proforma_number, customer_name, plate_number, vin, model,
  reference_number, delivery_time, prepared_by, date_created,
  sub_total, vat, total_amount, last_modified
FROM proformas
ORDER BY seq ASC
";

// The id set travels as one JSON array parameter, so the statement is the
// same for any number of parents and never hits the bound-parameter limit.
const SELECT_ITEMS_BY_PROFORMA_IDS_SQL: &str = r"
SELECT
  id, proforma_id, item_name, unit, quantity, cost, price, last_modified
FROM items
WHERE proforma_id IN (SELECT value FROM json_each(?1))
ORDER BY seq ASC
";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a SQLite-backed record store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version < 1 {
            self.apply_migration_1()?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Cheap round trip proving the handle still reaches the database.
    ///
    /// # Errors
    /// Returns an error when the database cannot answer a trivial query.
    pub fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get::<_, i64>(0))
            .context("sqlite ping failed")?;
        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to create record tables")?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![1_i64, now_rfc3339()?],
        )
        .context("failed to record migration version 1")?;
        tx.commit().context("failed to commit migration v1")?;
        Ok(())
    }

    fn write_proforma(&self, proforma: &Proforma) -> Result<()> {
        self.conn
            .execute(
                UPSERT_PROFORMA_SQL,
                named_params! {
                    ":id": proforma.id,
                    ":proforma_number": proforma.proforma_number.get(),
                    ":proforma_number_sent": sent(&proforma.proforma_number),
                    ":customer_name": proforma.customer_name.get(),
                    ":customer_name_sent": sent(&proforma.customer_name),
                    ":plate_number": proforma.plate_number.get(),
                    ":plate_number_sent": sent(&proforma.plate_number),
                    ":vin": proforma.vin.get(),
                    ":vin_sent": sent(&proforma.vin),
                    ":model": proforma.model.get(),
                    ":model_sent": sent(&proforma.model),
                    ":reference_number": proforma.reference_number.get(),
                    ":reference_number_sent": sent(&proforma.reference_number),
                    ":delivery_time": proforma.delivery_time.get(),
                    ":delivery_time_sent": sent(&proforma.delivery_time),
                    ":prepared_by": proforma.prepared_by.get(),
                    ":prepared_by_sent": sent(&proforma.prepared_by),
                    ":date_created": proforma.date_created.get(),
                    ":date_created_sent": sent(&proforma.date_created),
                    ":sub_total": proforma.sub_total.get(),
                    ":sub_total_sent": sent(&proforma.sub_total),
                    ":vat": proforma.vat.get(),
                    ":vat_sent": sent(&proforma.vat),
                    ":total_amount": proforma.total_amount.get(),
                    ":total_amount_sent": sent(&proforma.total_amount),
                    ":last_modified": proforma.last_modified.get(),
                    ":last_modified_sent": sent(&proforma.last_modified),
                },
            )
            .with_context(|| format!("failed to upsert proforma {}", proforma.id))?;
        Ok(())
    }

    fn write_item(&self, item: &Item) -> Result<()> {
        self.conn
            .execute(
                UPSERT_ITEM_SQL,
                named_params! {
                    ":id": item.id,
                    ":proforma_id": item.proforma_id.get(),
                    ":proforma_id_sent": sent(&item.proforma_id),
                    ":item_name": item.item_name.get(),
                    ":item_name_sent": sent(&item.item_name),
                    ":unit": item.unit.get(),
                    ":unit_sent": sent(&item.unit),
                    ":quantity": item.quantity.get(),
                    ":quantity_sent": sent(&item.quantity),
                    ":cost": item.cost.get(),
                    ":cost_sent": sent(&item.cost),
                    ":price": item.price.get(),
                    ":price_sent": sent(&item.price),
                    ":last_modified": item.last_modified.get(),
                    ":last_modified_sent": sent(&item.last_modified),
                },
            )
            .with_context(|| format!("failed to upsert item {}", item.id))?;
        Ok(())
    }

    fn list_proformas(&self) -> Result<Vec<Proforma>> {
        let mut stmt = self
            .conn
            .prepare_cached(SELECT_PROFORMAS_SQL)
            .context("failed to prepare proforma query")?;
        let rows = stmt.query_map([], proforma_from_row)?;

        let mut proformas = Vec::new();
        for row in rows {
            proformas.push(row.context("failed to decode proforma row")?);
        }
        Ok(proformas)
    }

    fn list_items_for(&self, proforma_ids: &BTreeSet<StableId>) -> Result<Vec<Item>> {
        if proforma_ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids_json = serde_json::to_string(proforma_ids).context("failed to encode id set")?;
        let mut stmt = self
            .conn
            .prepare_cached(SELECT_ITEMS_BY_PROFORMA_IDS_SQL)
            .context("failed to prepare item query")?;
        let rows = stmt.query_map(params![ids_json], item_from_row)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row.context("failed to decode item row")?);
        }
        Ok(items)
    }
}

impl RecordStore for SqliteStore {
    fn upsert_proforma(&mut self, proforma: &Proforma) -> Result<(), StoreError> {
        self.write_proforma(proforma).map_err(store_error)
    }

    fn upsert_item(&mut self, item: &Item) -> Result<(), StoreError> {
        self.write_item(item).map_err(store_error)
    }

    fn find_all_proformas(&self) -> Result<Vec<Proforma>, StoreError> {
        self.list_proformas().map_err(store_error)
    }

    fn find_items_by_proforma_ids(
        &self,
        proforma_ids: &BTreeSet<StableId>,
    ) -> Result<Vec<Item>, StoreError> {
        self.list_items_for(proforma_ids).map_err(store_error)
    }
}

/// Map a store failure onto the core taxonomy, flagging errors that mean the
/// database file itself is gone or unreadable.
#[must_use]
pub fn store_error(err: anyhow::Error) -> StoreError {
    let lost = err.chain().any(|cause| {
        cause.downcast_ref::<rusqlite::Error>().is_some_and(|sqlite_err| {
            matches!(
                sqlite_err.sqlite_error_code(),
                Some(
                    ErrorCode::CannotOpen
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::NotADatabase
                        | ErrorCode::DatabaseCorrupt
                )
            )
        })
    });

    let message = format!("{err:#}");
    if lost {
        StoreError::Disconnected(message)
    } else {
        StoreError::Operation(message)
    }
}

fn sent<T>(value: &Field<T>) -> bool {
    !value.is_absent()
}

fn column<T: FromSql>(row: &Row<'_>, index: usize) -> rusqlite::Result<Field<T>> {
    Ok(Field::from_stored(row.get(index)?))
}

fn proforma_from_row(row: &Row<'_>) -> rusqlite::Result<Proforma> {
    Ok(Proforma {
        id: row.get(0)?,
        proforma_number: column(row, 1)?,
        customer_name: column(row, 2)?,
        plate_number: column(row, 3)?,
        vin: column(row, 4)?,
        model: column(row, 5)?,
        reference_number: column(row, 6)?,
        delivery_time: column(row, 7)?,
        prepared_by: column(row, 8)?,
        date_created: column(row, 9)?,
        sub_total: column(row, 10)?,
        vat: column(row, 11)?,
        total_amount: column(row, 12)?,
        last_modified: column(row, 13)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get(0)?,
        proforma_id: column(row, 1)?,
        item_name: column(row, 2)?,
        unit: column(row, 3)?,
        quantity: column(row, 4)?,
        cost: column(row, 5)?,
        price: column(row, 6)?,
        last_modified: column(row, 7)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::thread;

    use super::*;
    use proforma_backup_core::{list_all, merge_batch, Batch};
    use ulid::Ulid;

    fn memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("proforma-backup-store-{}.sqlite3", Ulid::new()))
    }

    fn cleanup(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    fn full_proforma(id: StableId) -> Proforma {
        Proforma {
            id,
            proforma_number: Field::Set(format!("PF-{id:04}")),
            customer_name: Field::Set("Acme Garage".to_string()),
            plate_number: Field::Set("AA-1234".to_string()),
            vin: Field::Set("1HGCM82633A004352".to_string()),
            model: Field::Set("Corolla".to_string()),
            reference_number: Field::Set("REF-1".to_string()),
            delivery_time: Field::Set("3 days".to_string()),
            prepared_by: Field::Set("Sara".to_string()),
            date_created: Field::Set("2024-05-01T09:00:00Z".to_string()),
            sub_total: Field::Set(100.0),
            vat: Field::Set(15.0),
            total_amount: Field::Set(115.0),
            last_modified: Field::Set("2024-05-01T09:00:00Z".to_string()),
        }
    }

    #[test]
    fn migrate_is_idempotent_and_reaches_latest_version() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;

        store.migrate()?;
        store.migrate()?;

        assert_eq!(current_schema_version(&store.conn)?, LATEST_SCHEMA_VERSION);
        let recorded = store
            .conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get::<_, i64>(0))?;
        assert_eq!(recorded, 1);
        store.ping()?;
        Ok(())
    }

    #[test]
    fn write_and_read_proforma_round_trip() -> Result<()> {
        let mut store = memory_store()?;
        let proforma = full_proforma(1);

        store.upsert_proforma(&proforma)?;

        assert_eq!(store.find_all_proformas()?, vec![proforma]);
        Ok(())
    }

    #[test]
    fn upsert_merges_present_fields_only() -> Result<()> {
        let mut store = memory_store()?;
        store.upsert_proforma(&full_proforma(7))?;

        store.upsert_proforma(&Proforma {
            customer_name: Field::Set("B".to_string()),
            total_amount: Field::Set(230.0),
            ..Proforma::new(7)
        })?;

        let stored = store.find_all_proformas()?;
        assert_eq!(stored.len(), 1);
        let mut expected = full_proforma(7);
        expected.customer_name = Field::Set("B".to_string());
        expected.total_amount = Field::Set(230.0);
        assert_eq!(stored[0], expected);
        Ok(())
    }

    #[test]
    fn explicit_null_clears_the_stored_column() -> Result<()> {
        let mut store = memory_store()?;
        let first: Proforma =
            serde_json::from_str(r#"{"id": 7, "referenceNumber": "REF-1", "vin": "VIN7"}"#)?;
        let second: Proforma = serde_json::from_str(r#"{"id": 7, "referenceNumber": null}"#)?;

        store.upsert_proforma(&first)?;
        store.upsert_proforma(&second)?;

        let stored = store.find_all_proformas()?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].reference_number, Field::Absent);
        assert_eq!(stored[0].vin, Field::Set("VIN7".to_string()));
        Ok(())
    }

    #[test]
    fn null_parent_detaches_an_item() -> Result<()> {
        let mut store = memory_store()?;
        store.upsert_item(&Item::new(3, 1))?;

        store.upsert_item(&Item { id: 3, proforma_id: Field::Null, ..Item::default() })?;

        assert!(store.find_items_by_proforma_ids(&BTreeSet::from([1]))?.is_empty());
        Ok(())
    }

    #[test]
    fn sql_merge_matches_in_memory_merge() -> Result<()> {
        let mut store = memory_store()?;
        let first = Item {
            item_name: Field::Set("Oil".to_string()),
            quantity: Field::Set(4.0),
            cost: Field::Set(12.0),
            ..Item::new(3, 1)
        };
        let second = Item {
            id: 3,
            unit: Field::Set("L".to_string()),
            cost: Field::Null,
            ..Item::default()
        };

        store.upsert_item(&first)?;
        store.upsert_item(&second)?;

        let mut in_memory = proforma_backup_core::MemoryStore::new();
        in_memory.upsert_item(&first)?;
        in_memory.upsert_item(&second)?;
        assert_eq!(
            store.find_items_by_proforma_ids(&BTreeSet::from([1]))?,
            in_memory.find_items_by_proforma_ids(&BTreeSet::from([1]))?
        );
        Ok(())
    }

    #[test]
    fn items_are_fetched_for_the_whole_id_set_in_insertion_order() -> Result<()> {
        let mut store = memory_store()?;
        for item in [Item::new(30, 2), Item::new(10, 1), Item::new(20, 3), Item::new(40, 1)] {
            store.upsert_item(&item)?;
        }

        let found = store.find_items_by_proforma_ids(&BTreeSet::from([1, 2]))?;
        assert_eq!(found.iter().map(|item| item.id).collect::<Vec<_>>(), vec![30, 10, 40]);

        assert!(store.find_items_by_proforma_ids(&BTreeSet::new())?.is_empty());
        Ok(())
    }

    #[test]
    fn engines_run_against_sqlite() -> Result<()> {
        let mut store = memory_store()?;
        let mut older = full_proforma(2);
        older.date_created = Field::Set("2024-01-01T00:00:00Z".to_string());
        let batch = Batch::new(
            vec![older, full_proforma(1)],
            vec![Item::new(10, 1), Item::new(11, 1), Item::new(12, 2), Item::new(13, 99)],
        );

        merge_batch(&mut store, &batch)?;
        merge_batch(&mut store, &batch)?;
        let views = list_all(&store)?;

        assert_eq!(views.iter().map(|view| view.proforma.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(views[0].items.len(), 2);
        assert_eq!(views[1].items.len(), 1);
        Ok(())
    }

    #[test]
    fn missing_database_directory_maps_to_disconnect() {
        let path = std::env::temp_dir()
            .join(format!("proforma-backup-missing-{}", Ulid::new()))
            .join("db.sqlite3");

        let err = match SqliteStore::open(&path).and_then(|store| store.ping()) {
            Ok(()) => panic!("opening a database in a missing directory should fail"),
            Err(err) => err,
        };

        assert!(store_error(err).is_disconnect());
    }

    #[test]
    fn concurrent_upserts_keep_one_row_per_id() -> Result<()> {
        let db_path = unique_temp_db_path();
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
        }

        let writer_threads = 4;
        let mut handles = Vec::new();
        for writer in 0..writer_threads {
            let writer_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let mut store = SqliteStore::open(&writer_path)?;
                for id in 0..20 {
                    let mut proforma = full_proforma(id);
                    proforma.prepared_by = Field::Set(format!("writer-{writer}"));
                    store.upsert_proforma(&proforma)?;
                    store.upsert_item(&Item::new(1000 + id, id))?;
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("writer thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteStore::open(&db_path)?;
        let proformas = store.find_all_proformas()?;
        assert_eq!(proformas.len(), 20);
        let ids = proformas.iter().map(|proforma| proforma.id).collect::<BTreeSet<_>>();
        assert_eq!(store.find_items_by_proforma_ids(&ids)?.len(), 20);

        cleanup(&db_path)
    }
}
