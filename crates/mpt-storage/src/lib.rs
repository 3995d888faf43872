//! Document store + diagnostics artifact storage for the price tracker.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mpt_core::{DisplayedPrices, InvalidRecord, PriceHistoryEntry, Product, ProductProjection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mpt-storage";

/// Hard ceiling on operations in one atomic commit. Callers stay below it.
pub const STORE_MAX_OPS_PER_COMMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed storage for screenshots and rendered page snapshots.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        captured_at: DateTime<Utc>,
        kind: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(kind)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        captured_at: DateTime<Utc>,
        kind: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(captured_at, kind, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("artifact path {} has no parent", absolute_path.display()))?;

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let stored = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("product {0} does not exist")]
    NotFound(String),
    #[error("commit of {ops} operations exceeds the store limit of {limit}")]
    CommitTooLarge { ops: usize, limit: usize },
    #[error("rejected stored record: {0}")]
    InvalidRecord(#[from] InvalidRecord),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Timeout(_) | Self::Unavailable(_) => RetryDisposition::Retryable,
            Self::Database(err) => match err {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                    RetryDisposition::Retryable
                }
                _ => RetryDisposition::NonRetryable,
            },
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Runs `op` under `timeout`, retrying timeouts and retryable errors.
    pub async fn run<T, F, Fut>(&self, timeout: Duration, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            let err = match tokio::time::timeout(timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => StoreError::Timeout(timeout),
            };
            if err.disposition() == RetryDisposition::NonRetryable || attempt >= self.max_retries {
                return Err(err);
            }
            debug!(attempt, error = %err, "retrying store read");
            tokio::time::sleep(self.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

/// Price movement applied together with a product update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceTransition {
    pub last_price: f64,
    pub current_price: f64,
    pub changed_at: DateTime<Utc>,
}

/// Merge-update of an existing product. A transition also bumps `change_count` by one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductUpdate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub last_seen_at: DateTime<Utc>,
    pub snapshot: DisplayedPrices,
    pub transition: Option<PriceTransition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Full overwrite of the product document.
    CreateProduct(Product),
    UpdateProduct(ProductUpdate),
    AppendHistory {
        product_id: String,
        entry: PriceHistoryEntry,
    },
}

impl WriteOp {
    pub fn product_id(&self) -> &str {
        match self {
            Self::CreateProduct(product) => &product.id,
            Self::UpdateProduct(update) => &update.id,
            Self::AppendHistory { product_id, .. } => product_id,
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get_product(&self, id: &str) -> Result<Option<Product>, StoreError>;

    /// One round-trip read of the reconciliation projection for `ids`; absent ids are omitted.
    async fn get_projections(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ProductProjection>, StoreError>;

    /// Applies every op or none of them.
    async fn commit(&self, ops: &[WriteOp]) -> Result<(), StoreError>;

    /// History ascending by time, optionally only entries at or after `since`.
    async fn price_history(
        &self,
        id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PriceHistoryEntry>, StoreError>;

    /// Products whose price changed at or after `since`, ascending by change time.
    async fn changed_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Product>, StoreError>;

    async fn list_products(
        &self,
        seen_since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Product>, StoreError>;

    /// Deletes a product and its history, returning the number of history entries removed.
    async fn delete_product_with_history(&self, id: &str) -> Result<usize, StoreError>;
}

fn check_commit_size(ops: &[WriteOp]) -> Result<(), StoreError> {
    if ops.len() > STORE_MAX_OPS_PER_COMMIT {
        return Err(StoreError::CommitTooLarge {
            ops: ops.len(),
            limit: STORE_MAX_OPS_PER_COMMIT,
        });
    }
    Ok(())
}

/// A create landing on an existing product keeps its lifetime fields and
/// records a transition when the price moved, like the Postgres upsert.
fn merge_upsert(existing: &mut Product, incoming: &Product) {
    existing.name = incoming.name.clone();
    existing.description = incoming.description.clone();
    existing.last_seen_at = incoming.last_seen_at;
    existing.snapshot = incoming.snapshot;
    if existing.current_price != incoming.current_price {
        let stored = existing.current_price;
        existing.last_price = if stored.is_finite() && stored >= 0.0 {
            stored
        } else {
            incoming.last_price
        };
        existing.current_price = incoming.current_price;
        existing.price_changed_at = Some(incoming.last_seen_at);
        existing.change_count += 1;
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    products: BTreeMap<String, Product>,
    history: BTreeMap<String, Vec<PriceHistoryEntry>>,
}

impl MemoryState {
    fn apply(&mut self, op: &WriteOp) -> Result<(), StoreError> {
        match op {
            WriteOp::CreateProduct(product) => match self.products.get_mut(&product.id) {
                Some(existing) => merge_upsert(existing, product),
                None => {
                    self.products.insert(product.id.clone(), product.clone());
                }
            },
            WriteOp::UpdateProduct(update) => {
                let product = self
                    .products
                    .get_mut(&update.id)
                    .ok_or_else(|| StoreError::NotFound(update.id.clone()))?;
                product.name = update.name.clone();
                product.description = update.description.clone();
                product.last_seen_at = update.last_seen_at;
                product.snapshot = update.snapshot;
                if let Some(transition) = update.transition {
                    product.last_price = transition.last_price;
                    product.current_price = transition.current_price;
                    product.price_changed_at = Some(transition.changed_at);
                    product.change_count += 1;
                }
            }
            WriteOp::AppendHistory { product_id, entry } => {
                self.history
                    .entry(product_id.clone())
                    .or_default()
                    .push(*entry);
            }
        }
        Ok(())
    }
}

/// In-process store used for tests and offline runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    commit_log: Mutex<Vec<usize>>,
    fail_projection_reads: AtomicBool,
    fail_commit_at: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, product: Product, history: Vec<PriceHistoryEntry>) {
        let mut state = self.state.lock().await;
        state.history.insert(product.id.clone(), history);
        state.products.insert(product.id.clone(), product);
    }

    /// Makes every projection read fail as if the backend were unreachable.
    pub fn fail_projection_reads(&self, fail: bool) {
        self.fail_projection_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes the commit with this zero-based sequence number fail.
    pub async fn fail_commit_at(&self, commit_index: Option<usize>) {
        *self.fail_commit_at.lock().await = commit_index;
    }

    /// Sizes of the commits applied so far, in order.
    pub async fn commit_sizes(&self) -> Vec<usize> {
        self.commit_log.lock().await.clone()
    }

    pub async fn product_count(&self) -> usize {
        self.state.lock().await.products.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_product(&self, id: &str) -> Result<Option<Product>, StoreError> {
        Ok(self.state.lock().await.products.get(id).cloned())
    }

    async fn get_projections(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ProductProjection>, StoreError> {
        if self.fail_projection_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("projection reads disabled".into()));
        }
        let state = self.state.lock().await;
        ids.iter()
            .filter_map(|id| {
                state.products.get(id).map(|p| {
                    let projection = ProductProjection {
                        name: p.name.clone(),
                        current_price: p.current_price,
                        last_price: p.last_price,
                    };
                    projection.validate(id)?;
                    Ok::<_, StoreError>((id.clone(), projection))
                })
            })
            .collect()
    }

    async fn commit(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        check_commit_size(ops)?;
        let mut log = self.commit_log.lock().await;
        if *self.fail_commit_at.lock().await == Some(log.len()) {
            return Err(StoreError::Unavailable(format!(
                "injected failure on commit {}",
                log.len()
            )));
        }
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        for op in ops {
            next.apply(op)?;
        }
        *state = next;
        log.push(ops.len());
        Ok(())
    }

    async fn price_history(
        &self,
        id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PriceHistoryEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut entries = state
            .history
            .get(id)
            .map(|h| {
                h.iter()
                    .filter(|e| since.map_or(true, |since| e.at >= since))
                    .copied()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        entries.sort_by_key(|e| e.at);
        Ok(entries)
    }

    async fn changed_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Product>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .products
            .values()
            .filter(|p| p.price_changed_at.is_some_and(|at| at >= since))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|p| p.price_changed_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list_products(
        &self,
        seen_since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Product>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .products
            .values()
            .filter(|p| seen_since.map_or(true, |since| p.last_seen_at >= since))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn delete_product_with_history(&self, id: &str) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let removed = state.history.remove(id).map(|h| h.len()).unwrap_or(0);
        state.products.remove(id);
        Ok(removed)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: String,
    name: String,
    description: String,
    current_price: f64,
    last_price: f64,
    created_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    price_changed_at: Option<DateTime<Utc>>,
    change_count: i64,
    display_prev_price: f64,
    display_base_price: f64,
    display_current_price: f64,
}

impl TryFrom<ProductRow> for Product {
    type Error = InvalidRecord;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        let product = Product {
            id: row.id,
            name: row.name,
            description: row.description,
            current_price: row.current_price,
            last_price: row.last_price,
            created_at: row.created_at,
            last_seen_at: row.last_seen_at,
            price_changed_at: row.price_changed_at,
            change_count: row.change_count,
            snapshot: DisplayedPrices {
                previous: row.display_prev_price,
                base: row.display_base_price,
                current: row.display_current_price,
            },
        };
        product.validate()?;
        Ok(product)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProjectionRow {
    id: String,
    name: String,
    current_price: f64,
    last_price: f64,
}

fn decode_projection(row: ProjectionRow) -> Result<(String, ProductProjection), InvalidRecord> {
    let projection = ProductProjection {
        name: row.name,
        current_price: row.current_price,
        last_price: row.last_price,
    };
    projection.validate(&row.id)?;
    Ok((row.id, projection))
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    price: f64,
    at: DateTime<Utc>,
}

fn decode_history(
    product_id: &str,
    rows: Vec<HistoryRow>,
) -> Result<Vec<PriceHistoryEntry>, StoreError> {
    rows.into_iter()
        .map(|row| {
            let entry = PriceHistoryEntry {
                price: row.price,
                at: row.at,
            };
            entry.validate(product_id)?;
            Ok(entry)
        })
        .collect()
}

const PRODUCT_COLUMNS: &str = "id, name, description, current_price, last_price, created_at, \
     last_seen_at, price_changed_at, change_count, display_prev_price, display_base_price, \
     display_current_price";

fn decode_products(rows: Vec<ProductRow>) -> Result<Vec<Product>, StoreError> {
    rows.into_iter()
        .map(|row| Product::try_from(row).map_err(StoreError::from))
        .collect()
}

/// Postgres-backed store: `products` rows with a `product_prices` child table.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_product(&self, id: &str) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Product::try_from).transpose().map_err(StoreError::from)
    }

    async fn get_projections(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ProductProjection>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, ProjectionRow>(
            "SELECT id, name, current_price, last_price FROM products WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| decode_projection(row).map_err(StoreError::from))
            .collect()
    }

    async fn commit(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        check_commit_size(ops)?;
        let mut tx = self.pool.begin().await?;
        for op in ops {
            match op {
                WriteOp::CreateProduct(p) => {
                    sqlx::query(
                        r#"
                        INSERT INTO products (id, name, description, current_price, last_price,
                                              created_at, last_seen_at, price_changed_at, change_count,
                                              display_prev_price, display_base_price, display_current_price)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                        ON CONFLICT (id) DO UPDATE SET
                            name = EXCLUDED.name,
                            description = EXCLUDED.description,
                            last_seen_at = EXCLUDED.last_seen_at,
                            last_price = CASE
                                WHEN products.current_price = EXCLUDED.current_price THEN products.last_price
                                WHEN products.current_price >= 0
                                     AND products.current_price < 'Infinity'::float8 THEN products.current_price
                                ELSE EXCLUDED.last_price
                            END,
                            current_price = EXCLUDED.current_price,
                            price_changed_at = CASE
                                WHEN products.current_price = EXCLUDED.current_price THEN products.price_changed_at
                                ELSE EXCLUDED.last_seen_at
                            END,
                            change_count = CASE
                                WHEN products.current_price = EXCLUDED.current_price THEN products.change_count
                                ELSE products.change_count + 1
                            END,
                            display_prev_price = EXCLUDED.display_prev_price,
                            display_base_price = EXCLUDED.display_base_price,
                            display_current_price = EXCLUDED.display_current_price
                        "#,
                    )
                    .bind(&p.id)
                    .bind(&p.name)
                    .bind(&p.description)
                    .bind(p.current_price)
                    .bind(p.last_price)
                    .bind(p.created_at)
                    .bind(p.last_seen_at)
                    .bind(p.price_changed_at)
                    .bind(p.change_count)
                    .bind(p.snapshot.previous)
                    .bind(p.snapshot.base)
                    .bind(p.snapshot.current)
                    .execute(&mut *tx)
                    .await?;
                }
                WriteOp::UpdateProduct(u) => {
                    let result = match u.transition {
                        Some(t) => {
                            sqlx::query(
                                r#"
                                UPDATE products
                                   SET name = $2, description = $3, last_seen_at = $4,
                                       display_prev_price = $5, display_base_price = $6,
                                       display_current_price = $7,
                                       last_price = $8, current_price = $9, price_changed_at = $10,
                                       change_count = change_count + 1
                                 WHERE id = $1
                                "#,
                            )
                            .bind(&u.id)
                            .bind(&u.name)
                            .bind(&u.description)
                            .bind(u.last_seen_at)
                            .bind(u.snapshot.previous)
                            .bind(u.snapshot.base)
                            .bind(u.snapshot.current)
                            .bind(t.last_price)
                            .bind(t.current_price)
                            .bind(t.changed_at)
                            .execute(&mut *tx)
                            .await?
                        }
                        None => {
                            sqlx::query(
                                r#"
                                UPDATE products
                                   SET name = $2, description = $3, last_seen_at = $4,
                                       display_prev_price = $5, display_base_price = $6,
                                       display_current_price = $7
                                 WHERE id = $1
                                "#,
                            )
                            .bind(&u.id)
                            .bind(&u.name)
                            .bind(&u.description)
                            .bind(u.last_seen_at)
                            .bind(u.snapshot.previous)
                            .bind(u.snapshot.base)
                            .bind(u.snapshot.current)
                            .execute(&mut *tx)
                            .await?
                        }
                    };
                    if result.rows_affected() == 0 {
                        return Err(StoreError::NotFound(u.id.clone()));
                    }
                }
                WriteOp::AppendHistory { product_id, entry } => {
                    sqlx::query("INSERT INTO product_prices (product_id, price, at) VALUES ($1, $2, $3)")
                        .bind(product_id)
                        .bind(entry.price)
                        .bind(entry.at)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn price_history(
        &self,
        id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PriceHistoryEntry>, StoreError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT price, at
              FROM product_prices
             WHERE product_id = $1
               AND ($2::timestamptz IS NULL OR at >= $2)
             ORDER BY at ASC, id ASC
            "#,
        )
        .bind(id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        decode_history(id, rows)
    }

    async fn changed_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products \
              WHERE price_changed_at >= $1 ORDER BY price_changed_at ASC LIMIT $2"
        ))
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        decode_products(rows)
    }

    async fn list_products(
        &self,
        seen_since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products \
              WHERE ($1::timestamptz IS NULL OR last_seen_at >= $1) ORDER BY name ASC LIMIT $2"
        ))
        .bind(seen_since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        decode_products(rows)
    }

    async fn delete_product_with_history(&self, id: &str) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM product_prices WHERE product_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn product(id: &str, price: f64, seen: DateTime<Utc>) -> Product {
        Product {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            current_price: price,
            last_price: price,
            created_at: seen,
            last_seen_at: seen,
            price_changed_at: None,
            change_count: 0,
            snapshot: DisplayedPrices::default(),
        }
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn screenshots_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store
            .store_bytes(at(12), "screenshots", "png", b"\x89PNG same")
            .await
            .expect("first store");
        let second = store
            .store_bytes(at(12), "screenshots", ".png", b"\x89PNG same")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20260301_120000/screenshots"));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn backoff_run_retries_transient_errors_only() {
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };

        let calls = AtomicUsize::new(0);
        let value = policy
            .run(Duration::from_secs(1), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StoreError::Unavailable("flaky".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .expect("second attempt succeeds");
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let calls = AtomicUsize::new(0);
        let err = policy
            .run(Duration::from_secs(1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::NotFound("x".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_run_turns_slow_reads_into_timeouts() {
        let policy = BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let err = policy
            .run(Duration::from_millis(5), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
    }

    #[tokio::test]
    async fn memory_commit_is_all_or_nothing() {
        let store = MemoryStore::new();
        let ops = vec![
            WriteOp::CreateProduct(product("acai", 10.0, at(1))),
            WriteOp::UpdateProduct(ProductUpdate {
                id: "missing".into(),
                name: "missing".into(),
                description: String::new(),
                last_seen_at: at(1),
                snapshot: DisplayedPrices::default(),
                transition: None,
            }),
        ];
        let err = store.commit(&ops).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == "missing"));
        assert_eq!(store.product_count().await, 0);
        assert!(store.commit_sizes().await.is_empty());
    }

    #[tokio::test]
    async fn memory_commit_rejects_oversized_groups() {
        let store = MemoryStore::new();
        let ops = (0..=STORE_MAX_OPS_PER_COMMIT)
            .map(|i| WriteOp::AppendHistory {
                product_id: "acai".into(),
                entry: PriceHistoryEntry { price: i as f64, at: at(1) },
            })
            .collect::<Vec<_>>();
        assert!(matches!(
            store.commit(&ops).await,
            Err(StoreError::CommitTooLarge { ops: 501, limit: 500 })
        ));
    }

    #[tokio::test]
    async fn memory_transition_increments_change_count() {
        let store = MemoryStore::new();
        store.seed(product("acai", 10.0, at(1)), vec![]).await;
        store
            .commit(&[WriteOp::UpdateProduct(ProductUpdate {
                id: "acai".into(),
                name: "Açaí".into(),
                description: "novo".into(),
                last_seen_at: at(2),
                snapshot: DisplayedPrices::default(),
                transition: Some(PriceTransition {
                    last_price: 10.0,
                    current_price: 12.0,
                    changed_at: at(2),
                }),
            })])
            .await
            .unwrap();
        let stored = store.get_product("acai").await.unwrap().unwrap();
        assert_eq!(stored.change_count, 1);
        assert_eq!(stored.last_price, 10.0);
        assert_eq!(stored.current_price, 12.0);
        assert_eq!(stored.price_changed_at, Some(at(2)));
        assert_eq!(stored.name, "Açaí");
    }

    #[tokio::test]
    async fn memory_range_queries_filter_and_order() {
        let store = MemoryStore::new();
        let mut late = product("b-late", 5.0, at(9));
        late.price_changed_at = Some(at(9));
        let mut early = product("a-early", 5.0, at(3));
        early.price_changed_at = Some(at(3));
        store.seed(late, vec![]).await;
        store.seed(early, vec![]).await;
        store
            .seed(
                product("c-never", 5.0, at(1)),
                vec![
                    PriceHistoryEntry { price: 6.0, at: at(5) },
                    PriceHistoryEntry { price: 5.0, at: at(1) },
                ],
            )
            .await;

        let changed = store.changed_since(at(2), 10).await.unwrap();
        assert_eq!(
            changed.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["a-early", "b-late"]
        );
        assert_eq!(store.changed_since(at(2), 1).await.unwrap().len(), 1);

        let history = store.price_history("c-never", None).await.unwrap();
        assert_eq!(history.iter().map(|e| e.price).collect::<Vec<_>>(), vec![5.0, 6.0]);
        assert_eq!(store.price_history("c-never", Some(at(4))).await.unwrap().len(), 1);

        let seen = store.list_products(Some(at(3)), 10).await.unwrap();
        assert_eq!(seen.len(), 2);

        assert_eq!(store.delete_product_with_history("c-never").await.unwrap(), 2);
        assert!(store.get_product("c-never").await.unwrap().is_none());
    }

    #[test]
    fn corrupt_rows_are_rejected_at_the_boundary() {
        let row = ProductRow {
            id: "acai".into(),
            name: "Açaí".into(),
            description: String::new(),
            current_price: f64::NAN,
            last_price: 1.0,
            created_at: at(1),
            last_seen_at: at(1),
            price_changed_at: None,
            change_count: 0,
            display_prev_price: 0.0,
            display_base_price: 0.0,
            display_current_price: 0.0,
        };
        assert!(Product::try_from(row).is_err());
    }

    #[test]
    fn corrupt_projection_and_history_rows_are_rejected() {
        let row = ProjectionRow {
            id: "acai".into(),
            name: "Açaí".into(),
            current_price: f64::NAN,
            last_price: 10.0,
        };
        assert!(matches!(
            decode_projection(row),
            Err(InvalidRecord::BadPrice { field: "current_price", .. })
        ));
        let (id, projection) = decode_projection(ProjectionRow {
            id: "acai".into(),
            name: "Açaí".into(),
            current_price: 12.0,
            last_price: 10.0,
        })
        .unwrap();
        assert_eq!(id, "acai");
        assert_eq!(projection.current_price, 12.0);

        let rows = vec![
            HistoryRow { price: 10.0, at: at(1) },
            HistoryRow { price: -3.0, at: at(2) },
        ];
        assert!(matches!(
            decode_history("acai", rows),
            Err(StoreError::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn memory_projection_read_rejects_corrupt_products() {
        let store = MemoryStore::new();
        store.seed(product("acai", f64::NAN, at(1)), vec![]).await;
        store.seed(product("suco", 8.0, at(1)), vec![]).await;
        let err = store
            .get_projections(&["suco".into(), "acai".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn create_over_existing_product_keeps_its_lifetime_counters() {
        let store = MemoryStore::new();
        let mut existing = product("acai", 11.0, at(1));
        existing.last_price = 10.0;
        existing.change_count = 3;
        existing.price_changed_at = Some(at(1));
        store.seed(existing, vec![]).await;

        let mut same_price = product("acai", 11.0, at(2));
        same_price.description = "mesmo preço".into();
        store
            .commit(&[WriteOp::CreateProduct(same_price)])
            .await
            .unwrap();
        let stored = store.get_product("acai").await.unwrap().unwrap();
        assert_eq!(stored.change_count, 3);
        assert_eq!(stored.last_price, 10.0);
        assert_eq!(stored.price_changed_at, Some(at(1)));
        assert_eq!(stored.last_seen_at, at(2));
        assert_eq!(stored.description, "mesmo preço");

        store
            .commit(&[WriteOp::CreateProduct(product("acai", 12.0, at(3)))])
            .await
            .unwrap();
        let stored = store.get_product("acai").await.unwrap().unwrap();
        assert_eq!(stored.change_count, 4);
        assert_eq!(stored.last_price, 11.0);
        assert_eq!(stored.current_price, 12.0);
        assert_eq!(stored.price_changed_at, Some(at(3)));
        assert_eq!(stored.created_at, at(1));
    }
}
