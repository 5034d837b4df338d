//! Postgres-backed ledger store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Concurrency` (or a scope-specific duplicate) | Concurrent writer got there first |
//! | Database (check violation) | `23514` | `Backend` | Negative balance or sequence reached the table |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolClosed | N/A | `Backend` | Connection pool was closed |
//! | Decode / ColumnDecode | N/A | `Serialization` | Row does not match the expected shape |
//!
//! ## Concurrency
//!
//! `commit` runs in one transaction. Stream appends lock the stock card row
//! (`FOR UPDATE`) before reading the stream version, and a consumed draft is
//! locked before it is deleted, so two commits of the same draft serialize and
//! the second sees `DraftNotFound`.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use stockledger_core::{
    ExpectedVersion, FacilityId, LotId, MovementDraftId, OrderableId, PhysicalInventoryId,
    ProgramId, StockCardId, SubDraftId, UserId,
};
use stockledger_stock::{
    Location, LocationCode, LocationMovement, LocationRef, LocationSnapshot, MovementDraft,
    PhysicalInventory, PhysicalInventorySubDraft, StockCard, StockCardHistory, StockCardKey,
    StockEvent, StockOnHandSnapshot,
};

use super::r#trait::{
    DraftWrite, LedgerBatch, LedgerStore, LocationRows, SnapshotWrite, StoreError, StreamAppend,
};

/// Schema applied by `PostgresLedgerStore::apply_schema` (idempotent).
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS stock_cards (
    id UUID PRIMARY KEY,
    facility_id UUID NOT NULL,
    program_id UUID NOT NULL,
    orderable_id UUID NOT NULL,
    lot_id UUID NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS stock_cards_natural_key
    ON stock_cards (facility_id, program_id, orderable_id,
                    COALESCE(lot_id, '00000000-0000-0000-0000-000000000000'::uuid));

CREATE TABLE IF NOT EXISTS stock_events (
    id UUID PRIMARY KEY,
    stock_card_id UUID NOT NULL REFERENCES stock_cards (id),
    sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
    quantity BIGINT NOT NULL CHECK (quantity >= 0),
    reason JSONB NOT NULL,
    occurred_date DATE NOT NULL,
    processed_at TIMESTAMPTZ NOT NULL,
    actor_id UUID NULL,
    signature TEXT NULL,
    UNIQUE (stock_card_id, sequence_number)
);

CREATE TABLE IF NOT EXISTS location_movements (
    id UUID PRIMARY KEY,
    stock_card_id UUID NOT NULL REFERENCES stock_cards (id),
    sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
    quantity BIGINT NOT NULL CHECK (quantity > 0),
    occurred_date DATE NOT NULL,
    processed_at TIMESTAMPTZ NOT NULL,
    src_location_code TEXT NULL,
    src_area TEXT NULL,
    dest_location_code TEXT NULL,
    dest_area TEXT NULL,
    actor_id UUID NOT NULL,
    signature TEXT NULL,
    CHECK (src_location_code IS NOT NULL OR dest_location_code IS NOT NULL),
    UNIQUE (stock_card_id, sequence_number)
);

CREATE TABLE IF NOT EXISTS location_event_extensions (
    ledger_event_id UUID PRIMARY KEY REFERENCES stock_events (id),
    stock_card_id UUID NOT NULL REFERENCES stock_cards (id),
    location_code TEXT NOT NULL,
    area TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stock_on_hand_snapshots (
    stock_card_id UUID NOT NULL REFERENCES stock_cards (id),
    occurred_date DATE NOT NULL,
    stock_on_hand BIGINT NOT NULL CHECK (stock_on_hand >= 0),
    PRIMARY KEY (stock_card_id, occurred_date)
);

CREATE TABLE IF NOT EXISTS location_snapshots (
    stock_card_id UUID NOT NULL REFERENCES stock_cards (id),
    location_code TEXT NOT NULL,
    occurred_date DATE NOT NULL,
    stock_on_hand BIGINT NOT NULL CHECK (stock_on_hand >= 0),
    area TEXT NOT NULL,
    PRIMARY KEY (stock_card_id, location_code, occurred_date)
);

CREATE TABLE IF NOT EXISTS movement_drafts (
    id UUID PRIMARY KEY,
    program_id UUID NOT NULL,
    facility_id UUID NOT NULL,
    actor_id UUID NOT NULL,
    line_items JSONB NOT NULL,
    version BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    UNIQUE (program_id, facility_id)
);

CREATE TABLE IF NOT EXISTS physical_inventories (
    id UUID PRIMARY KEY,
    program_id UUID NOT NULL,
    facility_id UUID NOT NULL,
    status TEXT NOT NULL,
    occurred_date DATE NULL,
    version BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS physical_inventories_open_scope
    ON physical_inventories (program_id, facility_id) WHERE status = 'DRAFT';

CREATE TABLE IF NOT EXISTS physical_inventory_sub_drafts (
    id UUID PRIMARY KEY,
    physical_inventory_id UUID NOT NULL REFERENCES physical_inventories (id),
    number INT NOT NULL,
    status TEXT NOT NULL,
    operator_id UUID NULL,
    line_items JSONB NOT NULL,
    version BIGINT NOT NULL,
    UNIQUE (physical_inventory_id, number)
);

CREATE TABLE IF NOT EXISTS locations (
    facility_id UUID NOT NULL,
    code TEXT NOT NULL,
    area TEXT NOT NULL,
    zone TEXT NOT NULL,
    rack TEXT NOT NULL,
    barcode TEXT NOT NULL,
    bin TEXT NOT NULL,
    level TEXT NOT NULL,
    PRIMARY KEY (facility_id, code)
);
"#;

/// Postgres-backed ledger store.
///
/// Async inherent methods do the work; the [`LedgerStore`] impl bridges them
/// onto the current tokio runtime, which must be multi-threaded.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("apply_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(stock_card_id = %id), err)]
    pub async fn load_stock_card(&self, id: StockCardId) -> Result<Option<StockCard>, StoreError> {
        let row = sqlx::query(
            "SELECT id, facility_id, program_id, orderable_id, lot_id FROM stock_cards WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stock_card", e))?;

        row.as_ref().map(stock_card_from_row).transpose()
    }

    #[instrument(skip(self), fields(key = %key), err)]
    pub async fn load_stock_card_by_key(
        &self,
        key: StockCardKey,
    ) -> Result<Option<StockCard>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, facility_id, program_id, orderable_id, lot_id
            FROM stock_cards
            WHERE facility_id = $1 AND program_id = $2 AND orderable_id = $3
                AND lot_id IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(key.facility_id.as_uuid())
        .bind(key.program_id.as_uuid())
        .bind(key.orderable_id.as_uuid())
        .bind(key.lot_id.map(Uuid::from))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stock_card_by_key", e))?;

        row.as_ref().map(stock_card_from_row).transpose()
    }

    #[instrument(skip(self), fields(facility_id = %facility_id), err)]
    pub async fn load_stock_cards(
        &self,
        facility_id: FacilityId,
        program_id: Option<ProgramId>,
        orderable_id: Option<OrderableId>,
    ) -> Result<Vec<StockCard>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, facility_id, program_id, orderable_id, lot_id
            FROM stock_cards
            WHERE facility_id = $1
                AND ($2::uuid IS NULL OR program_id = $2)
                AND ($3::uuid IS NULL OR orderable_id = $3)
            ORDER BY id
            "#,
        )
        .bind(facility_id.as_uuid())
        .bind(program_id.map(Uuid::from))
        .bind(orderable_id.map(Uuid::from))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stock_cards", e))?;

        rows.iter().map(stock_card_from_row).collect()
    }

    #[instrument(skip(self), fields(stock_card_id = %stock_card_id), err)]
    pub async fn load_history(
        &self,
        stock_card_id: StockCardId,
    ) -> Result<Option<StockCardHistory>, StoreError> {
        let Some(card) = self.load_stock_card(stock_card_id).await? else {
            return Ok(None);
        };
        let span = Span::current();
        let mut history = StockCardHistory::new(card);
        let card_id = stock_card_id.as_uuid();

        let event_rows = sqlx::query(
            r#"
            SELECT id, stock_card_id, sequence_number, quantity, reason, occurred_date,
                   processed_at, actor_id, signature
            FROM stock_events
            WHERE stock_card_id = $1
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(card_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stock_events", e))?;

        let movement_rows = sqlx::query(
            r#"
            SELECT id, stock_card_id, sequence_number, quantity, occurred_date, processed_at,
                   src_location_code, src_area, dest_location_code, dest_area, actor_id, signature
            FROM location_movements
            WHERE stock_card_id = $1
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(card_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_location_movements", e))?;

        let mut version = 0u64;
        for row in &event_rows {
            let sequence: i64 = row.try_get("sequence_number").map_err(decode_error)?;
            version = version.max(sequence as u64);
            history.events.push(stock_event_from_row(row)?);
        }
        for row in &movement_rows {
            let sequence: i64 = row.try_get("sequence_number").map_err(decode_error)?;
            version = version.max(sequence as u64);
            history.movements.push(movement_from_row(row)?);
        }
        history.version = version;

        let extension_rows = sqlx::query(
            "SELECT ledger_event_id, location_code, area FROM location_event_extensions WHERE stock_card_id = $1",
        )
        .bind(card_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_extensions", e))?;
        for row in &extension_rows {
            let event_id: Uuid = row.try_get("ledger_event_id").map_err(decode_error)?;
            history
                .extensions
                .insert(event_id, location_ref(row, "location_code", "area")?);
        }

        let stock_rows = sqlx::query(
            r#"
            SELECT stock_card_id, occurred_date, stock_on_hand
            FROM stock_on_hand_snapshots
            WHERE stock_card_id = $1
            ORDER BY occurred_date ASC
            "#,
        )
        .bind(card_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stock_snapshots", e))?;
        for row in &stock_rows {
            history.stock_snapshots.push(StockOnHandSnapshot {
                stock_card_id,
                occurred_date: row.try_get("occurred_date").map_err(decode_error)?,
                stock_on_hand: row.try_get("stock_on_hand").map_err(decode_error)?,
            });
        }

        let location_rows = sqlx::query(
            r#"
            SELECT location_code, occurred_date, stock_on_hand, area
            FROM location_snapshots
            WHERE stock_card_id = $1
            ORDER BY occurred_date ASC, location_code ASC
            "#,
        )
        .bind(card_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_location_snapshots", e))?;
        for row in &location_rows {
            let code: String = row.try_get("location_code").map_err(decode_error)?;
            history.location_snapshots.push(LocationSnapshot {
                stock_card_id,
                location_code: LocationCode::new(code)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
                occurred_date: row.try_get("occurred_date").map_err(decode_error)?,
                stock_on_hand: row.try_get("stock_on_hand").map_err(decode_error)?,
                area: row.try_get("area").map_err(decode_error)?,
            });
        }

        span.record("entries", version);
        Ok(Some(history))
    }

    #[instrument(skip(self), err)]
    pub async fn load_draft(&self, id: MovementDraftId) -> Result<Option<MovementDraft>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, program_id, facility_id, actor_id, line_items, version, created_at
            FROM movement_drafts WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_draft", e))?;

        row.as_ref().map(draft_from_row).transpose()
    }

    #[instrument(skip(self), fields(program_id = %program_id, facility_id = %facility_id), err)]
    pub async fn load_draft_for_scope(
        &self,
        program_id: ProgramId,
        facility_id: FacilityId,
    ) -> Result<Option<MovementDraft>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, program_id, facility_id, actor_id, line_items, version, created_at
            FROM movement_drafts WHERE program_id = $1 AND facility_id = $2
            "#,
        )
        .bind(program_id.as_uuid())
        .bind(facility_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_draft_for_scope", e))?;

        row.as_ref().map(draft_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn load_physical_inventory(
        &self,
        id: PhysicalInventoryId,
    ) -> Result<Option<PhysicalInventory>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, program_id, facility_id, status, occurred_date, version, created_at
            FROM physical_inventories WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_physical_inventory", e))?;

        row.as_ref().map(physical_inventory_from_row).transpose()
    }

    #[instrument(skip(self), fields(program_id = %program_id, facility_id = %facility_id), err)]
    pub async fn load_open_physical_inventory(
        &self,
        program_id: ProgramId,
        facility_id: FacilityId,
    ) -> Result<Option<PhysicalInventory>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, program_id, facility_id, status, occurred_date, version, created_at
            FROM physical_inventories
            WHERE program_id = $1 AND facility_id = $2 AND status = 'DRAFT'
            "#,
        )
        .bind(program_id.as_uuid())
        .bind(facility_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_open_physical_inventory", e))?;

        row.as_ref().map(physical_inventory_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn load_sub_draft(
        &self,
        id: SubDraftId,
    ) -> Result<Option<PhysicalInventorySubDraft>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, physical_inventory_id, number, status, operator_id, line_items, version
            FROM physical_inventory_sub_drafts WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_sub_draft", e))?;

        row.as_ref().map(sub_draft_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn load_sub_drafts(
        &self,
        physical_inventory_id: PhysicalInventoryId,
    ) -> Result<Vec<PhysicalInventorySubDraft>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, physical_inventory_id, number, status, operator_id, line_items, version
            FROM physical_inventory_sub_drafts
            WHERE physical_inventory_id = $1
            ORDER BY number ASC
            "#,
        )
        .bind(physical_inventory_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_sub_drafts", e))?;

        rows.iter().map(sub_draft_from_row).collect()
    }

    #[instrument(skip(self), fields(facility_id = %facility_id), err)]
    pub async fn load_locations(
        &self,
        facility_id: FacilityId,
        code: Option<&LocationCode>,
    ) -> Result<Vec<Location>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT facility_id, code, area, zone, rack, barcode, bin, level
            FROM locations
            WHERE facility_id = $1 AND ($2::text IS NULL OR code = $2)
            ORDER BY code ASC
            "#,
        )
        .bind(facility_id.as_uuid())
        .bind(code.map(|c| c.as_str().to_string()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_locations", e))?;

        rows.iter().map(location_from_row).collect()
    }

    /// Applies every write of `batch` in one transaction.
    #[instrument(
        skip(self, batch),
        fields(
            streams = batch.streams.len(),
            snapshots = batch.snapshots.len(),
            drafts = batch.drafts.len()
        ),
        err
    )]
    pub async fn commit_batch(&self, batch: LedgerBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Dropping `tx` on an early return rolls the transaction back.
        for card in &batch.stock_cards {
            insert_stock_card(&mut tx, card).await?;
        }
        for append in &batch.streams {
            append_stream(&mut tx, append).await?;
        }
        for write in &batch.snapshots {
            write_snapshots(&mut tx, write).await?;
        }
        for write in &batch.drafts {
            write_draft(&mut tx, write).await?;
        }
        for (inventory, expected) in &batch.physical_inventories {
            write_physical_inventory(&mut tx, inventory, *expected).await?;
        }
        for (sub_draft, expected) in &batch.sub_drafts {
            write_sub_draft(&mut tx, sub_draft, *expected).await?;
        }
        for location in &batch.locations {
            insert_location(&mut tx, location).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }
}

async fn insert_stock_card(
    tx: &mut Transaction<'_, Postgres>,
    card: &StockCard,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO stock_cards (id, facility_id, program_id, orderable_id, lot_id)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(card.id.as_uuid())
    .bind(card.facility_id.as_uuid())
    .bind(card.program_id.as_uuid())
    .bind(card.orderable_id.as_uuid())
    .bind(card.lot_id.map(Uuid::from))
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Duplicate(format!("stock card already exists for {}", card.key()))
        } else {
            map_sqlx_error("insert_stock_card", e)
        }
    })?;
    Ok(())
}

async fn append_stream(
    tx: &mut Transaction<'_, Postgres>,
    append: &StreamAppend,
) -> Result<(), StoreError> {
    let card_id = append.stock_card_id.as_uuid();

    // Serializes appends to the same card across both entry tables.
    sqlx::query("SELECT id FROM stock_cards WHERE id = $1 FOR UPDATE")
        .bind(card_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_stock_card", e))?
        .ok_or_else(|| StoreError::Backend(format!("append to unknown stock card {card_id}")))?;

    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(sequence_number), 0) AS current_version FROM (
            SELECT sequence_number FROM stock_events WHERE stock_card_id = $1
            UNION ALL
            SELECT sequence_number FROM location_movements WHERE stock_card_id = $1
        ) entries
        "#,
    )
    .bind(card_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;
    let current: i64 = row.try_get("current_version").map_err(decode_error)?;
    let current = current as u64;

    if !append.expected_version.matches(current) {
        return Err(StoreError::Concurrency(format!(
            "stock card {card_id}: expected {:?}, found {current}",
            append.expected_version
        )));
    }

    let mut next = current + 1;
    for event in &append.events {
        let reason = serde_json::to_value(&event.reason)
            .map_err(|e| StoreError::Serialization(format!("stock reason: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO stock_events (
                id, stock_card_id, sequence_number, quantity, reason, occurred_date,
                processed_at, actor_id, signature
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(card_id)
        .bind(next as i64)
        .bind(event.quantity)
        .bind(reason)
        .bind(event.occurred_date)
        .bind(event.processed_at)
        .bind(event.actor_id.map(Uuid::from))
        .bind(&event.signature)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_stock_event", e))?;
        next += 1;
    }

    for movement in &append.movements {
        sqlx::query(
            r#"
            INSERT INTO location_movements (
                id, stock_card_id, sequence_number, quantity, occurred_date, processed_at,
                src_location_code, src_area, dest_location_code, dest_area, actor_id, signature
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(movement.id)
        .bind(card_id)
        .bind(next as i64)
        .bind(movement.quantity)
        .bind(movement.occurred_date)
        .bind(movement.processed_at)
        .bind(movement.src.as_ref().map(|l| l.code.as_str().to_string()))
        .bind(movement.src.as_ref().map(|l| l.area.clone()))
        .bind(movement.dest.as_ref().map(|l| l.code.as_str().to_string()))
        .bind(movement.dest.as_ref().map(|l| l.area.clone()))
        .bind(movement.actor_id.as_uuid())
        .bind(&movement.signature)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_location_movement", e))?;
        next += 1;
    }

    for extension in &append.extensions {
        sqlx::query(
            r#"
            INSERT INTO location_event_extensions (ledger_event_id, stock_card_id, location_code, area)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(extension.ledger_event_id)
        .bind(card_id)
        .bind(extension.location.code.as_str())
        .bind(&extension.location.area)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_extension", e))?;
    }
    Ok(())
}

async fn write_snapshots(
    tx: &mut Transaction<'_, Postgres>,
    write: &SnapshotWrite,
) -> Result<(), StoreError> {
    let card_id = write.stock_card_id.as_uuid();

    sqlx::query("DELETE FROM stock_on_hand_snapshots WHERE stock_card_id = $1")
        .bind(card_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("clear_stock_snapshots", e))?;
    for row in &write.stock_on_hand {
        sqlx::query(
            "INSERT INTO stock_on_hand_snapshots (stock_card_id, occurred_date, stock_on_hand) VALUES ($1, $2, $3)",
        )
        .bind(card_id)
        .bind(row.occurred_date)
        .bind(row.stock_on_hand)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_stock_snapshot", e))?;
    }

    let rows = match &write.locations {
        LocationRows::Upsert(rows) => rows,
        LocationRows::Replace(rows) => {
            sqlx::query("DELETE FROM location_snapshots WHERE stock_card_id = $1")
                .bind(card_id)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("clear_location_snapshots", e))?;
            rows
        }
    };
    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO location_snapshots (stock_card_id, location_code, occurred_date, stock_on_hand, area)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stock_card_id, location_code, occurred_date)
            DO UPDATE SET stock_on_hand = EXCLUDED.stock_on_hand, area = EXCLUDED.area
            "#,
        )
        .bind(card_id)
        .bind(row.location_code.as_str())
        .bind(row.occurred_date)
        .bind(row.stock_on_hand)
        .bind(&row.area)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_location_snapshot", e))?;
    }
    Ok(())
}

async fn write_draft(tx: &mut Transaction<'_, Postgres>, write: &DraftWrite) -> Result<(), StoreError> {
    match write {
        DraftWrite::Create(draft) => {
            let lines = to_json(&draft.line_items)?;
            sqlx::query(
                r#"
                INSERT INTO movement_drafts (id, program_id, facility_id, actor_id, line_items, version, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(draft.id.as_uuid())
            .bind(draft.program_id.as_uuid())
            .bind(draft.facility_id.as_uuid())
            .bind(draft.actor_id.as_uuid())
            .bind(lines)
            .bind(draft.version as i64)
            .bind(draft.created_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateDraft {
                        program_id: draft.program_id,
                        facility_id: draft.facility_id,
                    }
                } else {
                    map_sqlx_error("insert_draft", e)
                }
            })?;
        }
        DraftWrite::Update {
            draft,
            expected_version,
        } => {
            let stored = lock_draft(tx, draft).await?;
            if !expected_version.matches(stored) {
                return Err(StoreError::Concurrency(format!(
                    "draft {}: expected {expected_version:?}, found {stored}",
                    draft.id
                )));
            }
            sqlx::query("UPDATE movement_drafts SET line_items = $2, version = $3, actor_id = $4 WHERE id = $1")
                .bind(draft.id.as_uuid())
                .bind(to_json(&draft.line_items)?)
                .bind(draft.version as i64)
                .bind(draft.actor_id.as_uuid())
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("update_draft", e))?;
        }
        DraftWrite::Delete(draft) => {
            let stored = lock_draft(tx, draft).await?;
            if stored != draft.version {
                return Err(StoreError::Concurrency(format!(
                    "draft {} changed since it was read (version {stored} != {})",
                    draft.id, draft.version
                )));
            }
            sqlx::query("DELETE FROM movement_drafts WHERE id = $1")
                .bind(draft.id.as_uuid())
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("delete_draft", e))?;
        }
    }
    Ok(())
}

/// Locks the draft row and returns its stored version.
async fn lock_draft(
    tx: &mut Transaction<'_, Postgres>,
    draft: &MovementDraft,
) -> Result<u64, StoreError> {
    let row = sqlx::query("SELECT version FROM movement_drafts WHERE id = $1 FOR UPDATE")
        .bind(draft.id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_draft", e))?
        .ok_or(StoreError::DraftNotFound {
            program_id: draft.program_id,
            facility_id: draft.facility_id,
        })?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    Ok(version as u64)
}

async fn write_physical_inventory(
    tx: &mut Transaction<'_, Postgres>,
    inventory: &PhysicalInventory,
    expected: ExpectedVersion,
) -> Result<(), StoreError> {
    let stored = sqlx::query("SELECT version FROM physical_inventories WHERE id = $1 FOR UPDATE")
        .bind(inventory.id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_physical_inventory", e))?;
    let status = enum_to_text(&inventory.status)?;

    match stored {
        Some(row) => {
            let version: i64 = row.try_get("version").map_err(decode_error)?;
            if !expected.matches(version as u64) {
                return Err(StoreError::Concurrency(format!(
                    "physical inventory {}: expected {expected:?}, found {version}",
                    inventory.id
                )));
            }
            sqlx::query(
                "UPDATE physical_inventories SET status = $2, occurred_date = $3, version = $4 WHERE id = $1",
            )
            .bind(inventory.id.as_uuid())
            .bind(status)
            .bind(inventory.occurred_date)
            .bind(inventory.version as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("update_physical_inventory", e))?;
        }
        None => {
            if let ExpectedVersion::Exact(v) = expected {
                return Err(StoreError::Concurrency(format!(
                    "physical inventory {} expected at version {v} but does not exist",
                    inventory.id
                )));
            }
            sqlx::query(
                r#"
                INSERT INTO physical_inventories (id, program_id, facility_id, status, occurred_date, version, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(inventory.id.as_uuid())
            .bind(inventory.program_id.as_uuid())
            .bind(inventory.facility_id.as_uuid())
            .bind(status)
            .bind(inventory.occurred_date)
            .bind(inventory.version as i64)
            .bind(inventory.created_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicatePhysicalInventory {
                        program_id: inventory.program_id,
                        facility_id: inventory.facility_id,
                    }
                } else {
                    map_sqlx_error("insert_physical_inventory", e)
                }
            })?;
        }
    }
    Ok(())
}

async fn write_sub_draft(
    tx: &mut Transaction<'_, Postgres>,
    sub_draft: &PhysicalInventorySubDraft,
    expected: ExpectedVersion,
) -> Result<(), StoreError> {
    let stored = sqlx::query("SELECT version FROM physical_inventory_sub_drafts WHERE id = $1 FOR UPDATE")
        .bind(sub_draft.id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_sub_draft", e))?;
    let status = enum_to_text(&sub_draft.status)?;
    let lines = to_json(&sub_draft.line_items)?;

    if let Some(row) = stored {
        let version: i64 = row.try_get("version").map_err(decode_error)?;
        if !expected.matches(version as u64) {
            return Err(StoreError::Concurrency(format!(
                "sub-draft {}: expected {expected:?}, found {version}",
                sub_draft.id
            )));
        }
    }

    sqlx::query(
        r#"
        INSERT INTO physical_inventory_sub_drafts (id, physical_inventory_id, number, status, operator_id, line_items, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            operator_id = EXCLUDED.operator_id,
            line_items = EXCLUDED.line_items,
            version = EXCLUDED.version
        "#,
    )
    .bind(sub_draft.id.as_uuid())
    .bind(sub_draft.physical_inventory_id.as_uuid())
    .bind(sub_draft.number as i32)
    .bind(status)
    .bind(sub_draft.operator_id.map(Uuid::from))
    .bind(lines)
    .bind(sub_draft.version as i64)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Duplicate(format!(
                "sub-draft #{} already exists for physical inventory {}",
                sub_draft.number, sub_draft.physical_inventory_id
            ))
        } else {
            map_sqlx_error("upsert_sub_draft", e)
        }
    })?;
    Ok(())
}

async fn insert_location(
    tx: &mut Transaction<'_, Postgres>,
    location: &Location,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO locations (facility_id, code, area, zone, rack, barcode, bin, level)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(location.facility_id.as_uuid())
    .bind(location.code.as_str())
    .bind(&location.area)
    .bind(&location.zone)
    .bind(&location.rack)
    .bind(&location.barcode)
    .bind(&location.bin)
    .bind(&location.level)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Duplicate(format!(
                "location {} already exists at facility {}",
                location.code, location.facility_id
            ))
        } else {
            map_sqlx_error("insert_location", e)
        }
    })?;
    Ok(())
}

/// Runs `fut` to completion from synchronous code inside a tokio runtime.
fn block_on<F: Future>(fut: F) -> Result<F::Output, StoreError> {
    let handle = tokio::runtime::Handle::try_current().map_err(|_| {
        StoreError::Backend(
            "PostgresLedgerStore requires a multi-threaded tokio runtime".to_string(),
        )
    })?;
    Ok(tokio::task::block_in_place(|| handle.block_on(fut)))
}

impl LedgerStore for PostgresLedgerStore {
    fn stock_card(&self, id: StockCardId) -> Result<Option<StockCard>, StoreError> {
        block_on(self.load_stock_card(id))?
    }

    fn find_stock_card(&self, key: &StockCardKey) -> Result<Option<StockCard>, StoreError> {
        block_on(self.load_stock_card_by_key(*key))?
    }

    fn stock_cards(
        &self,
        facility_id: FacilityId,
        program_id: Option<ProgramId>,
        orderable_id: Option<OrderableId>,
    ) -> Result<Vec<StockCard>, StoreError> {
        block_on(self.load_stock_cards(facility_id, program_id, orderable_id))?
    }

    fn history(&self, stock_card_id: StockCardId) -> Result<Option<StockCardHistory>, StoreError> {
        block_on(self.load_history(stock_card_id))?
    }

    fn draft(&self, id: MovementDraftId) -> Result<Option<MovementDraft>, StoreError> {
        block_on(self.load_draft(id))?
    }

    fn draft_for_scope(
        &self,
        program_id: ProgramId,
        facility_id: FacilityId,
    ) -> Result<Option<MovementDraft>, StoreError> {
        block_on(self.load_draft_for_scope(program_id, facility_id))?
    }

    fn physical_inventory(
        &self,
        id: PhysicalInventoryId,
    ) -> Result<Option<PhysicalInventory>, StoreError> {
        block_on(self.load_physical_inventory(id))?
    }

    fn open_physical_inventory(
        &self,
        program_id: ProgramId,
        facility_id: FacilityId,
    ) -> Result<Option<PhysicalInventory>, StoreError> {
        block_on(self.load_open_physical_inventory(program_id, facility_id))?
    }

    fn sub_draft(&self, id: SubDraftId) -> Result<Option<PhysicalInventorySubDraft>, StoreError> {
        block_on(self.load_sub_draft(id))?
    }

    fn sub_drafts(
        &self,
        physical_inventory_id: PhysicalInventoryId,
    ) -> Result<Vec<PhysicalInventorySubDraft>, StoreError> {
        block_on(self.load_sub_drafts(physical_inventory_id))?
    }

    fn location(
        &self,
        facility_id: FacilityId,
        code: &LocationCode,
    ) -> Result<Option<Location>, StoreError> {
        let found = block_on(self.load_locations(facility_id, Some(code)))??;
        Ok(found.into_iter().next())
    }

    fn locations(&self, facility_id: FacilityId) -> Result<Vec<Location>, StoreError> {
        block_on(self.load_locations(facility_id, None))?
    }

    fn commit(&self, batch: LedgerBatch) -> Result<(), StoreError> {
        block_on(self.commit_batch(batch))?
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Concurrency(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode failure in {}: {}", operation, err))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Serialization(format!("failed to read column: {err}"))
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Unit enums are stored as their serde name (`DRAFT`, `SUBMITTED`, ...).
fn enum_to_text<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match to_json(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Serialization(format!(
            "expected a unit variant, got {other}"
        ))),
    }
}

fn enum_from_text<T: DeserializeOwned>(text: String) -> Result<T, StoreError> {
    from_json(serde_json::Value::String(text))
}

// Row decoding

fn stock_card_from_row(row: &PgRow) -> Result<StockCard, StoreError> {
    let lot: Option<Uuid> = row.try_get("lot_id").map_err(decode_error)?;
    let id: Uuid = row.try_get("id").map_err(decode_error)?;
    let facility: Uuid = row.try_get("facility_id").map_err(decode_error)?;
    let program: Uuid = row.try_get("program_id").map_err(decode_error)?;
    let orderable: Uuid = row.try_get("orderable_id").map_err(decode_error)?;
    Ok(StockCard::new(
        StockCardId::from_uuid(id),
        StockCardKey {
            facility_id: FacilityId::from_uuid(facility),
            program_id: ProgramId::from_uuid(program),
            orderable_id: OrderableId::from_uuid(orderable),
            lot_id: lot.map(LotId::from_uuid),
        },
    ))
}

fn stock_event_from_row(row: &PgRow) -> Result<StockEvent, StoreError> {
    let card: Uuid = row.try_get("stock_card_id").map_err(decode_error)?;
    let reason: serde_json::Value = row.try_get("reason").map_err(decode_error)?;
    let actor: Option<Uuid> = row.try_get("actor_id").map_err(decode_error)?;
    Ok(StockEvent {
        id: row.try_get("id").map_err(decode_error)?,
        stock_card_id: StockCardId::from_uuid(card),
        quantity: row.try_get("quantity").map_err(decode_error)?,
        reason: from_json(reason)?,
        occurred_date: row.try_get::<NaiveDate, _>("occurred_date").map_err(decode_error)?,
        processed_at: row.try_get::<DateTime<Utc>, _>("processed_at").map_err(decode_error)?,
        actor_id: actor.map(UserId::from_uuid),
        signature: row.try_get("signature").map_err(decode_error)?,
    })
}

fn location_ref(row: &PgRow, code_column: &str, area_column: &str) -> Result<LocationRef, StoreError> {
    let code: String = row.try_get(code_column).map_err(decode_error)?;
    let area: String = row.try_get(area_column).map_err(decode_error)?;
    LocationRef::new(code, area).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn optional_location_ref(
    row: &PgRow,
    code_column: &str,
    area_column: &str,
) -> Result<Option<LocationRef>, StoreError> {
    let code: Option<String> = row.try_get(code_column).map_err(decode_error)?;
    match code {
        Some(_) => location_ref(row, code_column, area_column).map(Some),
        None => Ok(None),
    }
}

fn movement_from_row(row: &PgRow) -> Result<LocationMovement, StoreError> {
    let card: Uuid = row.try_get("stock_card_id").map_err(decode_error)?;
    let actor: Uuid = row.try_get("actor_id").map_err(decode_error)?;
    Ok(LocationMovement {
        id: row.try_get("id").map_err(decode_error)?,
        stock_card_id: StockCardId::from_uuid(card),
        quantity: row.try_get("quantity").map_err(decode_error)?,
        occurred_date: row.try_get("occurred_date").map_err(decode_error)?,
        processed_at: row.try_get("processed_at").map_err(decode_error)?,
        src: optional_location_ref(row, "src_location_code", "src_area")?,
        dest: optional_location_ref(row, "dest_location_code", "dest_area")?,
        actor_id: UserId::from_uuid(actor),
        signature: row.try_get("signature").map_err(decode_error)?,
    })
}

fn draft_from_row(row: &PgRow) -> Result<MovementDraft, StoreError> {
    let id: Uuid = row.try_get("id").map_err(decode_error)?;
    let program: Uuid = row.try_get("program_id").map_err(decode_error)?;
    let facility: Uuid = row.try_get("facility_id").map_err(decode_error)?;
    let actor: Uuid = row.try_get("actor_id").map_err(decode_error)?;
    let lines: serde_json::Value = row.try_get("line_items").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    Ok(MovementDraft {
        id: MovementDraftId::from_uuid(id),
        program_id: ProgramId::from_uuid(program),
        facility_id: FacilityId::from_uuid(facility),
        actor_id: UserId::from_uuid(actor),
        line_items: from_json(lines)?,
        version: version as u64,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn physical_inventory_from_row(row: &PgRow) -> Result<PhysicalInventory, StoreError> {
    let id: Uuid = row.try_get("id").map_err(decode_error)?;
    let program: Uuid = row.try_get("program_id").map_err(decode_error)?;
    let facility: Uuid = row.try_get("facility_id").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    Ok(PhysicalInventory {
        id: PhysicalInventoryId::from_uuid(id),
        program_id: ProgramId::from_uuid(program),
        facility_id: FacilityId::from_uuid(facility),
        status: enum_from_text(status)?,
        occurred_date: row.try_get("occurred_date").map_err(decode_error)?,
        version: version as u64,
        created_at: row.try_get("created_at").map_err(decode_error)?,
    })
}

fn sub_draft_from_row(row: &PgRow) -> Result<PhysicalInventorySubDraft, StoreError> {
    let id: Uuid = row.try_get("id").map_err(decode_error)?;
    let inventory: Uuid = row.try_get("physical_inventory_id").map_err(decode_error)?;
    let number: i32 = row.try_get("number").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let operator: Option<Uuid> = row.try_get("operator_id").map_err(decode_error)?;
    let lines: serde_json::Value = row.try_get("line_items").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    Ok(PhysicalInventorySubDraft {
        id: SubDraftId::from_uuid(id),
        physical_inventory_id: PhysicalInventoryId::from_uuid(inventory),
        number: number as u32,
        status: enum_from_text(status)?,
        operator_id: operator.map(UserId::from_uuid),
        line_items: from_json(lines)?,
        version: version as u64,
    })
}

fn location_from_row(row: &PgRow) -> Result<Location, StoreError> {
    let facility: Uuid = row.try_get("facility_id").map_err(decode_error)?;
    let code: String = row.try_get("code").map_err(decode_error)?;
    Ok(Location {
        facility_id: FacilityId::from_uuid(facility),
        code: LocationCode::new(code).map_err(|e| StoreError::Serialization(e.to_string()))?,
        area: row.try_get("area").map_err(decode_error)?,
        zone: row.try_get("zone").map_err(decode_error)?,
        rack: row.try_get("rack").map_err(decode_error)?,
        barcode: row.try_get("barcode").map_err(decode_error)?,
        bin: row.try_get("bin").map_err(decode_error)?,
        level: row.try_get("level").map_err(decode_error)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_stock::{PhysicalInventoryStatus, SubDraftStatus};

    #[test]
    fn unit_enums_round_trip_through_their_column_text() {
        assert_eq!(enum_to_text(&SubDraftStatus::NotYetStarted).unwrap(), "NOT_YET_STARTED");
        assert_eq!(enum_to_text(&PhysicalInventoryStatus::Draft).unwrap(), "DRAFT");
        let parsed: SubDraftStatus = enum_from_text("SUBMITTED".to_string()).unwrap();
        assert_eq!(parsed, SubDraftStatus::Submitted);
        assert!(enum_from_text::<SubDraftStatus>("DONE".to_string()).is_err());
    }

    #[test]
    fn schema_enforces_draft_scope_uniqueness() {
        assert!(SCHEMA_SQL.contains("UNIQUE (program_id, facility_id)"));
        assert!(SCHEMA_SQL.contains("CHECK (stock_on_hand >= 0)"));
    }
}
