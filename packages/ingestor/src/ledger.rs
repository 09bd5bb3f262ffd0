//! Ledger Tables
//!
//! SQL for the per-category point ledgers: schema bootstrap, the cumulative
//! upsert, the transaction-hash guard and the read-side address query.
//!
//! Table names always come from [`Category::table_name`], never from input.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{Sqlite, SqlitePool};
use sqlx::Executor;
use thiserror::Error;
use tracing::warn;

use crate::credit::PointCredit;
use crate::registry::Category;

/// Primary SQLite result codes worth retrying: SQLITE_BUSY and SQLITE_LOCKED.
/// The driver reports extended codes, whose low byte is the primary code.
const RETRYABLE_SQLITE_CODES: &[i64] = &[5, 6];

/// Errors from a single ledger statement
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Adding {0} points would overflow the ledger column")]
    PointsOverflow(u64),
}

impl LedgerError {
    /// Whether retrying the same statement later could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Database(sqlx::Error::PoolTimedOut)
            | LedgerError::Database(sqlx::Error::Io(_))
            | LedgerError::Database(sqlx::Error::WorkerCrashed) => true,
            LedgerError::Database(sqlx::Error::Database(db)) => db
                .code()
                .and_then(|code| code.parse::<i64>().ok())
                .is_some_and(is_retryable_code),
            _ => false,
        }
    }
}

fn is_retryable_code(code: i64) -> bool {
    RETRYABLE_SQLITE_CODES.contains(&(code & 0xff))
}

/// Result of applying one credit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Points were added to the ledger
    Applied,
    /// The transaction hash was credited before; nothing changed
    Duplicate,
}

/// One persisted ledger row as exposed to readers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerRow {
    pub id: i64,
    pub address: String,
    pub platform: String,
    pub point: i64,
}

/// Every ledger row for one address, grouped by category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPoints {
    pub address: String,
    pub categories: BTreeMap<Category, Vec<LedgerRow>>,
}

impl AddressPoints {
    /// Rows for one category (empty when the address never earned any)
    pub fn rows(&self, category: Category) -> &[LedgerRow] {
        self.categories
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn create_table_sql(category: Category) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL,
            platform TEXT NOT NULL,
            point INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (address, platform)
        )",
        table = category.table_name()
    )
}

fn upsert_sql(category: Category) -> String {
    format!(
        "INSERT INTO {table} (address, platform, point)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (address, platform) DO UPDATE SET
             point = point + excluded.point,
             updated_at = CURRENT_TIMESTAMP
         WHERE point <= 9223372036854775807 - excluded.point",
        table = category.table_name()
    )
}

/// Create every category table and the hash guard table if missing
pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for category in Category::ALL {
        let sql = create_table_sql(category);
        sqlx::query(&sql).execute(pool).await?;
    }
    // Transaction hashes already credited, used when deduplication is on
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS applied_credits (
            tx_hash TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            address TEXT NOT NULL,
            platform TEXT NOT NULL,
            point INTEGER NOT NULL,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Add a credit to its category ledger in one statement.
///
/// A sum that would pass `i64::MAX` leaves the row untouched.
async fn upsert_row<'e, E>(executor: E, credit: &PointCredit, points: i64) -> Result<(), LedgerError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = upsert_sql(credit.category);
    let affected = sqlx::query(&sql)
        .bind(credit.address.as_str())
        .bind(credit.platform.as_str())
        .bind(points)
        .execute(executor)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(LedgerError::PointsOverflow(credit.points));
    }
    Ok(())
}

/// Apply one credit.
///
/// The credit is expected to be normalized already. With `dedupe` set and a
/// transaction hash present, the hash is claimed in the guard table and the
/// upsert runs in the same database transaction; an already-claimed hash
/// leaves the ledger untouched.
pub async fn apply_credit(
    pool: &SqlitePool,
    credit: &PointCredit,
    dedupe: bool,
) -> Result<ApplyOutcome, LedgerError> {
    let points =
        i64::try_from(credit.points).map_err(|_| LedgerError::PointsOverflow(credit.points))?;

    let hash = match (&credit.tx_hash, dedupe) {
        (Some(hash), true) => hash,
        _ => {
            upsert_row(pool, credit, points).await?;
            return Ok(ApplyOutcome::Applied);
        }
    };

    let mut tx = pool.begin().await?;
    let claimed = sqlx::query(
        "INSERT INTO applied_credits (tx_hash, category, address, platform, point)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (tx_hash) DO NOTHING",
    )
    .bind(hash.as_str())
    .bind(credit.category.name())
    .bind(credit.address.as_str())
    .bind(credit.platform.as_str())
    .bind(points)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if claimed == 0 {
        tx.rollback().await?;
        return Ok(ApplyOutcome::Duplicate);
    }

    if let Err(e) = upsert_row(&mut *tx, credit, points).await {
        // Release the hash so a later delivery can still be credited
        tx.rollback().await?;
        return Err(e);
    }
    tx.commit().await?;
    Ok(ApplyOutcome::Applied)
}

/// Fetch a single ledger row
pub async fn fetch_row(
    pool: &SqlitePool,
    category: Category,
    address: &str,
    platform: &str,
) -> Result<Option<LedgerRow>, LedgerError> {
    let sql = format!(
        "SELECT id, address, platform, point FROM {} WHERE address = ?1 AND platform = ?2",
        category.table_name()
    );
    let row = sqlx::query_as::<_, LedgerRow>(&sql)
        .bind(address.to_lowercase())
        .bind(platform.to_lowercase())
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Read every ledger row for an address across all category tables.
///
/// A table that fails to read is logged and reported as empty.
pub async fn query_address(pool: &SqlitePool, address: &str) -> AddressPoints {
    let address = address.trim().to_lowercase();
    let mut categories = BTreeMap::new();

    for category in Category::ALL {
        let sql = format!(
            "SELECT id, address, platform, point FROM {} WHERE address = ?1 ORDER BY id",
            category.table_name()
        );
        let rows = match sqlx::query_as::<_, LedgerRow>(&sql)
            .bind(address.as_str())
            .fetch_all(pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to read {} ledger for {}: {}", category, address, e);
                Vec::new()
            }
        };
        categories.insert(category, rows);
    }

    AddressPoints {
        address,
        categories,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::MAX_POINTS;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    async fn test_pool(dir: &tempfile::TempDir) -> SqlitePool {
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("ledger.db"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap();
        ensure_schema(&pool).await.unwrap();
        pool
    }

    fn credit(address: &str, category: Category, platform: &str, points: u64) -> PointCredit {
        PointCredit::new(address, category, platform, points)
    }

    #[test]
    fn test_upsert_sql_targets_category_table() {
        let sql = upsert_sql(Category::Lsd);
        assert!(sql.contains("INSERT INTO lsd"));
        assert!(sql.contains("point = point + excluded.point"));
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        ensure_schema(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_first_credit_creates_row() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;

        let outcome = apply_credit(&pool, &credit("0xa", Category::Dex, "kuru", 2), false)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let row = fetch_row(&pool, Category::Dex, "0xa", "kuru").await.unwrap().unwrap();
        assert_eq!(row.point, 2);
        assert_eq!(row.address, "0xa");
    }

    #[tokio::test]
    async fn test_repeated_credit_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let c = credit("0xa", Category::Nft, "exogame", 5);

        apply_credit(&pool, &c, false).await.unwrap();
        apply_credit(&pool, &c, false).await.unwrap();

        let rows = query_address(&pool, "0xa").await;
        assert_eq!(rows.rows(Category::Nft).len(), 1);
        assert_eq!(rows.rows(Category::Nft)[0].point, 10);
    }

    #[tokio::test]
    async fn test_same_address_different_platforms_are_separate_rows() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;

        apply_credit(&pool, &credit("0xa", Category::Dex, "kuru", 1), false).await.unwrap();
        apply_credit(&pool, &credit("0xa", Category::Dex, "bean", 4), false).await.unwrap();

        let rows = query_address(&pool, "0xa").await;
        let dex = rows.rows(Category::Dex);
        assert_eq!(dex.len(), 2);
        assert_eq!((dex[0].platform.as_str(), dex[0].point), ("kuru", 1));
        assert_eq!((dex[1].platform.as_str(), dex[1].point), ("bean", 4));
    }

    #[tokio::test]
    async fn test_dedupe_skips_repeated_hash() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let c = credit("0xa", Category::Lsd, "magma", 3).with_tx_hash("0xfeed");

        assert_eq!(apply_credit(&pool, &c, true).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(apply_credit(&pool, &c, true).await.unwrap(), ApplyOutcome::Duplicate);

        let row = fetch_row(&pool, Category::Lsd, "0xa", "magma").await.unwrap().unwrap();
        assert_eq!(row.point, 3);
    }

    #[tokio::test]
    async fn test_dedupe_disabled_accumulates_repeated_hash() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let c = credit("0xa", Category::Lsd, "magma", 3).with_tx_hash("0xfeed");

        apply_credit(&pool, &c, false).await.unwrap();
        apply_credit(&pool, &c, false).await.unwrap();

        let row = fetch_row(&pool, Category::Lsd, "0xa", "magma").await.unwrap().unwrap();
        assert_eq!(row.point, 6);
    }

    #[tokio::test]
    async fn test_dedupe_without_hash_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let c = credit("0xa", Category::Gamefi, "2048", 1);

        apply_credit(&pool, &c, true).await.unwrap();
        apply_credit(&pool, &c, true).await.unwrap();

        let row = fetch_row(&pool, Category::Gamefi, "0xa", "2048").await.unwrap().unwrap();
        assert_eq!(row.point, 2);
    }

    #[tokio::test]
    async fn test_missing_table_is_database_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        sqlx::query("DROP TABLE socialfi").execute(&pool).await.unwrap();

        let result = apply_credit(&pool, &credit("0xa", Category::Socialfi, "dusted", 1), false).await;
        let err = result.unwrap_err();
        assert!(matches!(err, LedgerError::Database(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_points_overflow_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;

        let result = apply_credit(&pool, &credit("0xa", Category::Dex, "kuru", u64::MAX), false).await;
        assert!(matches!(result, Err(LedgerError::PointsOverflow(_))));
    }

    #[tokio::test]
    async fn test_overflowing_sum_leaves_row_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        let c = credit("0xa", Category::Dex, "kuru", MAX_POINTS);

        apply_credit(&pool, &c, false).await.unwrap();
        let err = apply_credit(&pool, &c, false).await.unwrap_err();
        assert!(matches!(err, LedgerError::PointsOverflow(p) if p == MAX_POINTS));
        assert!(!err.is_retryable());

        let rows = query_address(&pool, "0xa").await;
        assert_eq!(rows.rows(Category::Dex).len(), 1);
        assert_eq!(rows.rows(Category::Dex)[0].point, i64::MAX);
    }

    #[tokio::test]
    async fn test_sum_up_to_column_limit_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;

        apply_credit(&pool, &credit("0xa", Category::Lsd, "magma", MAX_POINTS - 1), false)
            .await
            .unwrap();
        apply_credit(&pool, &credit("0xa", Category::Lsd, "magma", 1), false)
            .await
            .unwrap();

        let row = fetch_row(&pool, Category::Lsd, "0xa", "magma").await.unwrap().unwrap();
        assert_eq!(row.point, i64::MAX);
    }

    #[tokio::test]
    async fn test_overflow_with_dedupe_releases_hash() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;

        apply_credit(&pool, &credit("0xa", Category::Dex, "kuru", MAX_POINTS), false)
            .await
            .unwrap();
        let overflowing = credit("0xa", Category::Dex, "kuru", 5).with_tx_hash("0xfeed");
        assert!(matches!(
            apply_credit(&pool, &overflowing, true).await,
            Err(LedgerError::PointsOverflow(5))
        ));

        let claimed: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM applied_credits")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(claimed.0, 0);
    }

    #[test]
    fn test_extended_busy_and_locked_codes_are_retryable() {
        for code in [5, 6, 262, 517, 773] {
            assert!(is_retryable_code(code), "code {}", code);
        }
        for code in [1, 19, 2067] {
            assert!(!is_retryable_code(code), "code {}", code);
        }
    }

    #[tokio::test]
    async fn test_query_address_is_case_insensitive_and_covers_all_categories() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        apply_credit(&pool, &credit("0xabc", Category::Launchpad, "nad", 1), false).await.unwrap();

        let result = query_address(&pool, "0xABC").await;
        assert_eq!(result.address, "0xabc");
        assert_eq!(result.categories.len(), Category::ALL.len());
        assert_eq!(result.rows(Category::Launchpad).len(), 1);
        assert!(result.rows(Category::Dex).is_empty());
    }

    #[tokio::test]
    async fn test_query_address_reports_failing_table_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir).await;
        apply_credit(&pool, &credit("0xabc", Category::Dex, "kuru", 1), false).await.unwrap();
        sqlx::query("DROP TABLE nft").execute(&pool).await.unwrap();

        let result = query_address(&pool, "0xabc").await;
        assert!(result.rows(Category::Nft).is_empty());
        assert_eq!(result.rows(Category::Dex).len(), 1);
    }

    #[test]
    fn test_address_points_serializes_category_names() {
        let mut categories = BTreeMap::new();
        categories.insert(
            Category::Dex,
            vec![LedgerRow {
                id: 1,
                address: "0xa".to_string(),
                platform: "kuru".to_string(),
                point: 2,
            }],
        );
        let points = AddressPoints {
            address: "0xa".to_string(),
            categories,
        };
        let json = serde_json::to_value(&points).unwrap();
        assert_eq!(json["categories"]["dex"][0]["point"], 2);
        assert_eq!(json["categories"]["dex"][0]["platform"], "kuru");
    }
}
