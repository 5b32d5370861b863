//! PostgreSQL storage for the reservation core.
//!
//! [`PgStore`] implements the repository ports from `mkt-reserve`. The two
//! paired writes (`reserve_atomic`, `settle_atomic`) run inside a single
//! database transaction, which is what makes the coordinator's conditional
//! check-and-transition indivisible across processes.
//!
//! A partial unique index (`uq_transactions_active_listing`) backstops the
//! at-most-one-active-transaction invariant at the schema level; a violation
//! is detected by constraint name and surfaced as
//! [`StoreError::DuplicateActive`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};

use mkt_reserve::{
    ListingRepository, NewTransaction, ReservationStore, StoreError, TransactionRepository,
    VersionToken, VersionedListing,
};
use mkt_schemas::{
    Listing, ListingId, ListingStatus, Transaction, TransactionId, TransactionStatus,
};

pub const ENV_DB_URL: &str = "MKT_DATABASE_URL";

/// Name of the partial unique index enforcing one active transaction per
/// listing. Kept in sync with `migrations/0002_transactions.sql`.
const ACTIVE_TX_CONSTRAINT: &str = "uq_transactions_active_listing";

/// Connect to Postgres using MKT_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='listings'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_listings_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_listings_table: bool,
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

/// Postgres-backed [`ReservationStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Seed a listing row. Listing creation/approval belongs to the catalog
    /// collaborator; this exists for tests and operational backfills.
    pub async fn insert_listing(&self, listing: &Listing) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            insert into listings (
              listing_id, seller_id, price_micros, status, active, created_at, updated_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7
            )
            "#,
        )
        .bind(listing.id)
        .bind(listing.seller_id)
        .bind(listing.price_micros)
        .bind(listing.status.as_str())
        .bind(listing.active)
        .bind(listing.created_at)
        .bind(listing.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    /// Disambiguate a zero-row conditional update: the listing either
    /// vanished (`NotFound`) or another writer bumped the token
    /// (`VersionConflict`).
    async fn classify_stale_listing(&self, id: ListingId) -> StoreError {
        let probe =
            sqlx::query_as::<_, (bool,)>("select exists(select 1 from listings where listing_id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await;
        match probe {
            Ok((true,)) => StoreError::VersionConflict,
            Ok((false,)) => StoreError::NotFound,
            Err(e) => backend(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn listing_from_row(row: &PgRow) -> Result<Listing, StoreError> {
    let status: String = row.try_get("status").map_err(backend)?;
    let status = ListingStatus::parse(&status)
        .ok_or_else(|| StoreError::Backend(format!("invalid listing status: {status}")))?;
    Ok(Listing {
        id: row.try_get("listing_id").map_err(backend)?,
        seller_id: row.try_get("seller_id").map_err(backend)?,
        price_micros: row.try_get("price_micros").map_err(backend)?,
        status,
        active: row.try_get("active").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    let status: String = row.try_get("status").map_err(backend)?;
    let status = TransactionStatus::parse(&status)
        .ok_or_else(|| StoreError::Backend(format!("invalid transaction status: {status}")))?;
    Ok(Transaction {
        id: row.try_get("transaction_id").map_err(backend)?,
        listing_id: row.try_get("listing_id").map_err(backend)?,
        buyer_id: row.try_get("buyer_id").map_err(backend)?,
        seller_id: row.try_get("seller_id").map_err(backend)?,
        status,
        created_at: row.try_get("created_at").map_err(backend)?,
        completed_at: row.try_get("completed_at").map_err(backend)?,
        cancelled_at: row.try_get("cancelled_at").map_err(backend)?,
    })
}

/// Detect a Postgres unique constraint violation by name.
fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.constraint() == Some(constraint)
                || db_err.code().as_deref() == Some("23505")
                    && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

fn map_insert_error(e: sqlx::Error) -> StoreError {
    if is_unique_constraint_violation(&e, ACTIVE_TX_CONSTRAINT) {
        StoreError::DuplicateActive
    } else {
        backend(e)
    }
}

// ---------------------------------------------------------------------------
// Connection-level statements (shared by pool paths and atomic units)
// ---------------------------------------------------------------------------

const SELECT_TX_COLUMNS: &str = "transaction_id, listing_id, buyer_id, seller_id, status, \
                                 created_at, completed_at, cancelled_at";

/// Conditional status write. `updated_at` always moves forward, even when
/// the wall clock has not ticked since the previous write.
async fn conditional_update_on(
    conn: &mut PgConnection,
    id: ListingId,
    token: VersionToken,
    status: ListingStatus,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        r#"
        update listings
        set status = $3,
            updated_at = greatest(now(), updated_at + interval '1 microsecond')
        where listing_id = $1
          and updated_at = $2
        "#,
    )
    .bind(id)
    .bind(token.0)
    .bind(status.as_str())
    .execute(conn)
    .await?;
    Ok(done.rows_affected())
}

async fn insert_transaction_on(
    conn: &mut PgConnection,
    tx: &NewTransaction,
) -> Result<PgRow, sqlx::Error> {
    sqlx::query(&format!(
        r#"
        insert into transactions (
          transaction_id, listing_id, buyer_id, seller_id, status, completed_at
        ) values (
          $1, $2, $3, $4, $5,
          case when $5 = 'completed' then now() end
        )
        returning {SELECT_TX_COLUMNS}
        "#
    ))
    .bind(tx.id)
    .bind(tx.listing_id)
    .bind(tx.buyer_id)
    .bind(tx.seller_id)
    .bind(tx.status.as_str())
    .fetch_one(conn)
    .await
}

async fn update_transaction_on(
    conn: &mut PgConnection,
    id: TransactionId,
    status: TransactionStatus,
) -> Result<Option<PgRow>, sqlx::Error> {
    sqlx::query(&format!(
        r#"
        update transactions
        set status = $2,
            completed_at = case when $2 = 'completed' then now() else completed_at end,
            cancelled_at = case when $2 = 'cancelled' then now() else cancelled_at end
        where transaction_id = $1
        returning {SELECT_TX_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(status.as_str())
    .fetch_optional(conn)
    .await
}

// ---------------------------------------------------------------------------
// Repository ports
// ---------------------------------------------------------------------------

#[async_trait]
impl ListingRepository for PgStore {
    async fn get(&self, id: ListingId) -> Result<Option<VersionedListing>, StoreError> {
        let row = sqlx::query(
            r#"
            select listing_id, seller_id, price_micros, status, active, created_at, updated_at
            from listings
            where listing_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => {
                let listing = listing_from_row(&row)?;
                let token = VersionToken(listing.updated_at);
                Ok(Some(VersionedListing { listing, token }))
            }
            None => Ok(None),
        }
    }

    async fn conditional_update(
        &self,
        id: ListingId,
        token: VersionToken,
        status: ListingStatus,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        let rows = conditional_update_on(&mut conn, id, token, status)
            .await
            .map_err(backend)?;
        if rows == 0 {
            return Err(self.classify_stale_listing(id).await);
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for PgStore {
    async fn create(&self, tx: NewTransaction) -> Result<Transaction, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        let row = insert_transaction_on(&mut conn, &tx)
            .await
            .map_err(map_insert_error)?;
        transaction_from_row(&row)
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "select {SELECT_TX_COLUMNS} from transactions where transaction_id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn find_active_by_listing(
        &self,
        listing_id: ListingId,
    ) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "select {SELECT_TX_COLUMNS} from transactions \
             where listing_id = $1 and status = 'reserved'"
        ))
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn update_status(
        &self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<Transaction, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        let row = update_transaction_on(&mut conn, id, status)
            .await
            .map_err(backend)?
            .ok_or(StoreError::NotFound)?;
        transaction_from_row(&row)
    }
}

#[async_trait]
impl ReservationStore for PgStore {
    async fn reserve_atomic(
        &self,
        listing_id: ListingId,
        token: VersionToken,
        status: ListingStatus,
        tx: NewTransaction,
    ) -> Result<Transaction, StoreError> {
        let mut txn = self.pool.begin().await.map_err(backend)?;

        let rows = conditional_update_on(&mut txn, listing_id, token, status)
            .await
            .map_err(backend)?;
        if rows == 0 {
            // Dropping `txn` rolls the unit back.
            drop(txn);
            return Err(self.classify_stale_listing(listing_id).await);
        }

        let row = insert_transaction_on(&mut txn, &tx)
            .await
            .map_err(map_insert_error)?;
        let stored = transaction_from_row(&row)?;

        txn.commit().await.map_err(backend)?;
        Ok(stored)
    }

    async fn settle_atomic(
        &self,
        listing_id: ListingId,
        token: VersionToken,
        status: ListingStatus,
        tx_id: TransactionId,
        tx_status: TransactionStatus,
    ) -> Result<Transaction, StoreError> {
        let mut txn = self.pool.begin().await.map_err(backend)?;

        let rows = conditional_update_on(&mut txn, listing_id, token, status)
            .await
            .map_err(backend)?;
        if rows == 0 {
            drop(txn);
            return Err(self.classify_stale_listing(listing_id).await);
        }

        let row = update_transaction_on(&mut txn, tx_id, tx_status)
            .await
            .map_err(backend)?
            .ok_or(StoreError::NotFound)?;
        let stored = transaction_from_row(&row)?;

        txn.commit().await.map_err(backend)?;
        Ok(stored)
    }
}
