//! Reconciliation engine for the asset inventory mirror: batched idempotent
//! merge-upserts with tag-conflict repair, guarded by a circuit breaker and a
//! host-load check, driven by a daily scheduler.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use aim_client::{
    stream_hardware_pages, stream_users_pages, InventorySource, SourceError, SOURCE_PAGE_CAP,
};
use aim_core::{AssetRecord, EntitySyncSummary, SyncReport, SyncScope, UserRecord};
use aim_normalize::{normalize_hardware, normalize_user, DepartmentLookup};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Timelike, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aim-sync";

/// Default batch size for transactional upserts.
pub const DEFAULT_BATCH_SIZE: usize = 50;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub source_url: String,
    pub source_token: String,
    pub ca_bundle: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub page_limit: u32,
    pub batch_size: usize,
    pub sync_times: Vec<NaiveTime>,
    pub misfire_grace_secs: u64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub cpu_threshold: f32,
    pub memory_threshold: f32,
    pub load_defer_secs: u64,
    /// 0 or 1 selects the sequential client mode; >1 enables the windowed
    /// concurrent mode with that many in-flight page requests.
    pub fetch_window: usize,
    pub scheduler_enabled: bool,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            source_url: std::env::var("AIM_SOURCE_URL")
                .context("AIM_SOURCE_URL is required")?,
            source_token: std::env::var("AIM_SOURCE_TOKEN")
                .context("AIM_SOURCE_TOKEN is required")?,
            ca_bundle: std::env::var("AIM_CA_BUNDLE").map(PathBuf::from).ok(),
            http_timeout_secs: env_parsed("AIM_HTTP_TIMEOUT_SECS", 30),
            page_limit: env_parsed("AIM_PAGE_LIMIT", 100).clamp(1, SOURCE_PAGE_CAP),
            batch_size: env_parsed("AIM_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            sync_times: match std::env::var("AIM_SYNC_TIMES") {
                Ok(raw) => parse_sync_times(&raw)?,
                Err(_) => default_sync_times(),
            },
            misfire_grace_secs: env_parsed("AIM_MISFIRE_GRACE_SECS", 300),
            breaker_threshold: env_parsed("AIM_BREAKER_THRESHOLD", 2),
            breaker_cooldown_secs: env_parsed("AIM_BREAKER_COOLDOWN_SECS", 300),
            cpu_threshold: env_parsed("AIM_CPU_THRESHOLD", 80.0),
            memory_threshold: env_parsed("AIM_MEMORY_THRESHOLD", 85.0),
            load_defer_secs: env_parsed("AIM_LOAD_DEFER_SECS", 30),
            fetch_window: env_parsed("AIM_FETCH_WINDOW", 0),
            scheduler_enabled: std::env::var("AIM_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            web_port: env_parsed("AIM_WEB_PORT", 8000),
        })
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn default_sync_times() -> Vec<NaiveTime> {
    ["08:00", "12:00", "16:00", "20:00"]
        .iter()
        .filter_map(|raw| NaiveTime::parse_from_str(raw, "%H:%M").ok())
        .collect()
}

/// Parse a comma-separated `HH:MM` list into times of day.
pub fn parse_sync_times(raw: &str) -> anyhow::Result<Vec<NaiveTime>> {
    let mut times = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let time = NaiveTime::parse_from_str(part, "%H:%M")
            .with_context(|| format!("invalid sync time {part:?} (expected HH:MM)"))?;
        times.push(time);
    }
    anyhow::ensure!(!times.is_empty(), "AIM_SYNC_TIMES must list at least one HH:MM time");
    Ok(times)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    /// The incoming row's tag is already held by a different id. The
    /// transaction has been abandoned; callers repair by deleting the stale
    /// holder and re-applying.
    #[error("asset tag {tag:?} already held by another id (incoming id {incoming_id})")]
    TagConflict { tag: String, incoming_id: i64 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("circuit open; sync rejected without contacting the source")]
    CircuitOpen,
    #[error("host under load; sync skipped for this invocation")]
    SkippedUnderLoad,
    #[error("a sync run is already in progress")]
    AlreadyRunning,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Write access to the local mirror tables. The engine owns all writes during
/// a sync; concurrent readers tolerate partially-synced state.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Upsert every row in one transaction (insert-or-overwrite by id).
    /// A tag unique-violation abandons the transaction and surfaces as
    /// [`StoreError::TagConflict`].
    async fn apply_asset_batch(&self, rows: &[AssetRecord]) -> Result<(), StoreError>;

    /// Delete any row holding `tag` under an id other than `keep_id`.
    /// Committed immediately; returns the number of rows removed.
    async fn delete_asset_by_tag(&self, tag: &str, keep_id: i64) -> Result<u64, StoreError>;

    /// Upsert every user row in one transaction.
    async fn apply_user_batch(&self, rows: &[UserRecord]) -> Result<(), StoreError>;
}

/// Postgres-backed mirror store with embedded migrations.
#[derive(Debug, Clone)]
pub struct PgMirrorStore {
    pool: PgPool,
}

const ASSET_TAG_CONSTRAINT: &str = "assets_asset_tag_key";

fn as_tag_conflict(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = err {
        db.is_unique_violation() && db.constraint() == Some(ASSET_TAG_CONSTRAINT)
    } else {
        false
    }
}

impl PgMirrorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("running mirror schema migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MirrorStore for PgMirrorStore {
    async fn apply_asset_batch(&self, rows: &[AssetRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO assets (
                    id, asset_name, asset_tag, serial, model, model_no, status,
                    category, manufacturer, location, company, department,
                    assigned_user, warranty_months, warranty_expires, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ON CONFLICT (id) DO UPDATE SET
                    asset_name = EXCLUDED.asset_name,
                    asset_tag = EXCLUDED.asset_tag,
                    serial = EXCLUDED.serial,
                    model = EXCLUDED.model,
                    model_no = EXCLUDED.model_no,
                    status = EXCLUDED.status,
                    category = EXCLUDED.category,
                    manufacturer = EXCLUDED.manufacturer,
                    location = EXCLUDED.location,
                    company = EXCLUDED.company,
                    department = EXCLUDED.department,
                    assigned_user = EXCLUDED.assigned_user,
                    warranty_months = EXCLUDED.warranty_months,
                    warranty_expires = EXCLUDED.warranty_expires,
                    created_at = EXCLUDED.created_at
                "#,
            )
            .bind(row.id)
            .bind(&row.asset_name)
            .bind(&row.asset_tag)
            .bind(&row.serial)
            .bind(&row.model)
            .bind(&row.model_no)
            .bind(&row.status)
            .bind(&row.category)
            .bind(&row.manufacturer)
            .bind(&row.location)
            .bind(&row.company)
            .bind(&row.department)
            .bind(&row.assigned_user)
            .bind(row.warranty_months)
            .bind(row.warranty_expires)
            .bind(&row.created_at)
            .execute(&mut *tx)
            .await;

            if let Err(err) = result {
                // Dropping the transaction rolls the batch back.
                if as_tag_conflict(&err) {
                    return Err(StoreError::TagConflict {
                        tag: row.asset_tag.clone(),
                        incoming_id: row.id,
                    });
                }
                return Err(StoreError::Database(err));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_asset_by_tag(&self, tag: &str, keep_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM assets WHERE asset_tag = $1 AND id <> $2")
            .bind(tag)
            .bind(keep_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn apply_user_batch(&self, rows: &[UserRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO users (
                    id, first_name, last_name, username, email, region,
                    department_id, department_name, location_id, assets_count,
                    license_count
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (id) DO UPDATE SET
                    first_name = EXCLUDED.first_name,
                    last_name = EXCLUDED.last_name,
                    username = EXCLUDED.username,
                    email = EXCLUDED.email,
                    region = EXCLUDED.region,
                    department_id = EXCLUDED.department_id,
                    department_name = EXCLUDED.department_name,
                    location_id = EXCLUDED.location_id,
                    assets_count = EXCLUDED.assets_count,
                    license_count = EXCLUDED.license_count
                "#,
            )
            .bind(row.id)
            .bind(&row.first_name)
            .bind(&row.last_name)
            .bind(&row.username)
            .bind(&row.email)
            .bind(&row.region)
            .bind(row.department_id)
            .bind(&row.department_name)
            .bind(row.location_id)
            .bind(row.assets_count)
            .bind(row.license_count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reconciliation engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub page_limit: u32,
    pub batch_size: usize,
    pub fetch_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_limit: 100,
            batch_size: DEFAULT_BATCH_SIZE,
            fetch_window: 0,
        }
    }
}

impl EngineConfig {
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        Self {
            page_limit: config.page_limit,
            batch_size: config.batch_size.max(1),
            fetch_window: config.fetch_window,
        }
    }
}

#[derive(Debug, Default)]
struct PhaseCounters {
    pages: u32,
    rows_seen: u64,
    rows_upserted: u64,
    conflicts_repaired: u32,
    batches_committed: u32,
}

impl PhaseCounters {
    fn into_summary(
        self,
        run_id: Uuid,
        scope: SyncScope,
        started_at: DateTime<Utc>,
    ) -> EntitySyncSummary {
        EntitySyncSummary {
            run_id,
            scope,
            started_at,
            finished_at: Utc::now(),
            pages_fetched: self.pages,
            rows_seen: self.rows_seen,
            rows_upserted: self.rows_upserted,
            conflicts_repaired: self.conflicts_repaired,
            batches_committed: self.batches_committed,
        }
    }
}

/// Drives pagination, normalization, and batched merge-upserts. Generic over
/// the source and store seams so tests can run against scripted doubles.
pub struct SyncEngine<C: ?Sized, S: ?Sized> {
    source: Arc<C>,
    store: Arc<S>,
    config: EngineConfig,
}

/// Engine over trait objects, as wired at process startup.
pub type SharedSyncEngine = SyncEngine<dyn InventorySource, dyn MirrorStore>;

impl<C, S> SyncEngine<C, S>
where
    C: InventorySource + ?Sized + 'static,
    S: MirrorStore + ?Sized,
{
    /// The page limit is clamped to the source cap here so the offset always
    /// advances by the page size the source actually serves; an unclamped
    /// over-cap limit would stride past rows the source never returned.
    pub fn new(source: Arc<C>, store: Arc<S>, mut config: EngineConfig) -> Self {
        config.page_limit = config.page_limit.clamp(1, SOURCE_PAGE_CAP);
        Self {
            source,
            store,
            config,
        }
    }

    /// Run the phases selected by `scope` and report per-phase counters.
    ///
    /// For [`SyncScope::All`] the asset phase runs fully before the user
    /// phase and the two are not transactionally linked; a crash between them
    /// leaves one table stale until the next run repairs it.
    pub async fn run(&self, scope: SyncScope) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, %scope, "sync run starting");

        let assets = match scope {
            SyncScope::Assets | SyncScope::All => Some(self.sync_assets(run_id).await?),
            SyncScope::Users => None,
        };
        let users = match scope {
            SyncScope::Users | SyncScope::All => Some(self.sync_users(run_id).await?),
            SyncScope::Assets => None,
        };

        let report = SyncReport {
            run_id,
            scope,
            started_at,
            finished_at: Utc::now(),
            assets,
            users,
        };
        info!(%run_id, rows = report.rows_upserted(), "sync run finished");
        Ok(report)
    }

    pub async fn sync_all(&self) -> Result<SyncReport, SyncError> {
        self.run(SyncScope::All).await
    }

    /// Mirror the hardware listing. The department lookup is rebuilt here,
    /// scoped to this invocation, and dropped with it.
    pub async fn sync_assets(&self, run_id: Uuid) -> Result<EntitySyncSummary, SyncError> {
        let started_at = Utc::now();
        let lookup = DepartmentLookup::build(self.source.as_ref(), self.config.page_limit).await?;
        debug!(%run_id, users_mapped = lookup.len(), "department lookup built");

        let mut counters = PhaseCounters::default();
        let mut batch: Vec<AssetRecord> = Vec::with_capacity(self.config.batch_size);

        if self.config.fetch_window > 1 {
            let mut pages = stream_hardware_pages(
                Arc::clone(&self.source),
                self.config.page_limit,
                self.config.fetch_window,
            );
            while let Some(page) = pages.recv().await {
                let rows = page?;
                counters.pages += 1;
                for row in &rows {
                    counters.rows_seen += 1;
                    batch.push(normalize_hardware(row, &lookup));
                    if batch.len() >= self.config.batch_size {
                        self.flush_assets(&mut batch, &mut counters).await?;
                    }
                }
            }
        } else {
            let mut offset = 0;
            loop {
                let (rows, has_more) = self
                    .source
                    .fetch_hardware_page(offset, self.config.page_limit)
                    .await?;
                counters.pages += 1;
                for row in &rows {
                    counters.rows_seen += 1;
                    batch.push(normalize_hardware(row, &lookup));
                    if batch.len() >= self.config.batch_size {
                        self.flush_assets(&mut batch, &mut counters).await?;
                    }
                }
                if !has_more {
                    break;
                }
                offset += self.config.page_limit;
            }
        }

        self.flush_assets(&mut batch, &mut counters).await?;
        let summary = counters.into_summary(run_id, SyncScope::Assets, started_at);
        info!(
            %run_id,
            rows = summary.rows_upserted,
            pages = summary.pages_fetched,
            conflicts = summary.conflicts_repaired,
            "asset sync phase complete"
        );
        Ok(summary)
    }

    /// Mirror the directory users listing.
    pub async fn sync_users(&self, run_id: Uuid) -> Result<EntitySyncSummary, SyncError> {
        let started_at = Utc::now();
        let mut counters = PhaseCounters::default();
        let mut batch: Vec<UserRecord> = Vec::with_capacity(self.config.batch_size);

        if self.config.fetch_window > 1 {
            let mut pages = stream_users_pages(
                Arc::clone(&self.source),
                self.config.page_limit,
                self.config.fetch_window,
            );
            while let Some(page) = pages.recv().await {
                let rows = page?;
                counters.pages += 1;
                for row in &rows {
                    counters.rows_seen += 1;
                    batch.push(normalize_user(row));
                    if batch.len() >= self.config.batch_size {
                        self.flush_users(&mut batch, &mut counters).await?;
                    }
                }
            }
        } else {
            let mut offset = 0;
            loop {
                let (rows, has_more) = self
                    .source
                    .fetch_users_page(offset, self.config.page_limit)
                    .await?;
                counters.pages += 1;
                for row in &rows {
                    counters.rows_seen += 1;
                    batch.push(normalize_user(row));
                    if batch.len() >= self.config.batch_size {
                        self.flush_users(&mut batch, &mut counters).await?;
                    }
                }
                if !has_more {
                    break;
                }
                offset += self.config.page_limit;
            }
        }

        self.flush_users(&mut batch, &mut counters).await?;
        let summary = counters.into_summary(run_id, SyncScope::Users, started_at);
        info!(
            %run_id,
            rows = summary.rows_upserted,
            pages = summary.pages_fetched,
            "user sync phase complete"
        );
        Ok(summary)
    }

    /// Commit one asset batch, repairing tag conflicts as they surface.
    ///
    /// A conflict means the upstream reassigned a tag to a newly issued id:
    /// the stale holder is deleted and the batch replayed (idempotent
    /// upserts make the replay safe). Each tag is repaired at most once per
    /// batch; a second conflict on the same tag fails the batch.
    async fn flush_assets(
        &self,
        batch: &mut Vec<AssetRecord>,
        counters: &mut PhaseCounters,
    ) -> Result<(), SyncError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut repaired: HashSet<String> = HashSet::new();
        loop {
            match self.store.apply_asset_batch(batch).await {
                Ok(()) => {
                    counters.rows_upserted += batch.len() as u64;
                    counters.batches_committed += 1;
                    batch.clear();
                    return Ok(());
                }
                Err(StoreError::TagConflict { tag, incoming_id }) => {
                    if !repaired.insert(tag.clone()) {
                        return Err(StoreError::TagConflict { tag, incoming_id }.into());
                    }
                    warn!(%tag, incoming_id, "asset tag moved to a new id; deleting stale holder");
                    let deleted = self.store.delete_asset_by_tag(&tag, incoming_id).await?;
                    debug!(%tag, deleted, "stale tag holder removed; replaying batch");
                    counters.conflicts_repaired += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn flush_users(
        &self,
        batch: &mut Vec<UserRecord>,
        counters: &mut PhaseCounters,
    ) -> Result<(), SyncError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.store.apply_user_batch(batch).await?;
        counters.rows_upserted += batch.len() as u64;
        counters.batches_committed += 1;
        batch.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a trial call.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
            cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Fault isolation for the top-level sync entrypoint. Owned by the process's
/// startup wiring and injected into the service; never a global.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: StdMutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: StdMutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Admit or reject a guarded call. In the open state a call is admitted
    /// only once the cooldown has elapsed, and then as a single half-open
    /// trial; a concurrent second caller is rejected until the trial settles.
    pub fn try_acquire(&self) -> Result<(), SyncError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    debug!("circuit half-open; admitting one trial call");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(SyncError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(SyncError::CircuitOpen)
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!("circuit closing after successful call");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        inner.trial_in_flight = false;
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    warn!(failures = inner.failures, "circuit opening after repeated failures");
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!("circuit re-opening after failed trial call");
                inner.state = CircuitState::Open;
            }
            CircuitState::Open => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Load guard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct LoadSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Host resource sampling seam; production uses [`SysinfoSampler`], tests
/// inject scripted samples.
#[async_trait]
pub trait LoadSampler: Send + Sync {
    async fn sample(&self) -> LoadSample;
}

pub struct SysinfoSampler {
    system: tokio::sync::Mutex<sysinfo::System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: tokio::sync::Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadSampler for SysinfoSampler {
    async fn sample(&self) -> LoadSample {
        {
            let mut system = self.system.lock().await;
            system.refresh_cpu_usage();
        }
        // Two CPU refreshes with a minimum interval between them are needed
        // for a meaningful usage figure.
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        let mut system = self.system.lock().await;
        system.refresh_cpu_usage();
        system.refresh_memory();
        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (system.used_memory() as f32 / total as f32) * 100.0
        };
        LoadSample {
            cpu_percent: system.global_cpu_usage(),
            memory_percent,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    pub cpu_threshold: f32,
    pub memory_threshold: f32,
    pub defer: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            defer: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LoadDecision {
    Proceed,
    Skip(LoadSample),
}

/// Pre-run host pressure check: one deferral, then a skip. A skip is
/// informational and never counted as a circuit-breaker failure.
pub struct LoadGuard {
    config: GuardConfig,
    sampler: Box<dyn LoadSampler>,
}

impl LoadGuard {
    pub fn new(config: GuardConfig, sampler: Box<dyn LoadSampler>) -> Self {
        Self { config, sampler }
    }

    pub fn with_host_sampler(config: GuardConfig) -> Self {
        Self::new(config, Box::new(SysinfoSampler::new()))
    }

    fn over_threshold(&self, sample: &LoadSample) -> bool {
        sample.cpu_percent > self.config.cpu_threshold
            || sample.memory_percent > self.config.memory_threshold
    }

    pub async fn check(&self) -> LoadDecision {
        let first = self.sampler.sample().await;
        if !self.over_threshold(&first) {
            return LoadDecision::Proceed;
        }
        info!(
            cpu = first.cpu_percent,
            memory = first.memory_percent,
            defer_secs = self.config.defer.as_secs(),
            "host under load; deferring sync once"
        );
        tokio::time::sleep(self.config.defer).await;
        let second = self.sampler.sample().await;
        if self.over_threshold(&second) {
            LoadDecision::Skip(second)
        } else {
            LoadDecision::Proceed
        }
    }
}

// ---------------------------------------------------------------------------
// Sync service
// ---------------------------------------------------------------------------

/// Guarded entrypoint around the engine: run lock (at most one sync at a
/// time), load guard, then circuit breaker, in that order. Constructed at
/// startup and injected wherever a sync can be triggered.
pub struct SyncService {
    engine: SharedSyncEngine,
    breaker: CircuitBreaker,
    guard: LoadGuard,
    run_lock: tokio::sync::Mutex<()>,
    last_report: RwLock<Option<SyncReport>>,
}

impl SyncService {
    pub fn new(engine: SharedSyncEngine, breaker: CircuitBreaker, guard: LoadGuard) -> Self {
        Self {
            engine,
            breaker,
            guard,
            run_lock: tokio::sync::Mutex::new(()),
            last_report: RwLock::new(None),
        }
    }

    /// Run one guarded sync. A trigger that loses the run-lock race is
    /// reported as [`SyncError::AlreadyRunning`] rather than queued.
    pub async fn run(&self, scope: SyncScope) -> Result<SyncReport, SyncError> {
        let _running = self
            .run_lock
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;

        if let LoadDecision::Skip(sample) = self.guard.check().await {
            info!(
                cpu = sample.cpu_percent,
                memory = sample.memory_percent,
                "sync skipped; host still under load after deferral"
            );
            return Err(SyncError::SkippedUnderLoad);
        }

        self.breaker.try_acquire()?;
        match self.engine.run(scope).await {
            Ok(report) => {
                self.breaker.record_success();
                if let Ok(mut slot) = self.last_report.write() {
                    *slot = Some(report.clone());
                }
                Ok(report)
            }
            Err(err) => {
                self.breaker.record_failure();
                Err(err)
            }
        }
    }

    /// Fire-and-forget trigger; outcome is observable via logs and the
    /// status endpoint, never via the caller.
    pub fn trigger(self: &Arc<Self>, scope: SyncScope) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            log_run_outcome(scope, service.run(scope).await);
        });
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report.read().ok().and_then(|slot| slot.clone())
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }
}

fn log_run_outcome(scope: SyncScope, result: Result<SyncReport, SyncError>) {
    match result {
        Ok(report) => info!(
            %scope,
            run_id = %report.run_id,
            rows = report.rows_upserted(),
            "triggered sync completed"
        ),
        Err(SyncError::AlreadyRunning) => {
            info!(%scope, "sync already in progress; trigger coalesced");
        }
        Err(SyncError::SkippedUnderLoad) => {
            info!(%scope, "sync skipped under host load");
        }
        Err(SyncError::CircuitOpen) => {
            warn!(%scope, "sync rejected; circuit open");
        }
        Err(err) => {
            error!(%scope, error = %err, "triggered sync failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub times: Vec<NaiveTime>,
    pub misfire_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            times: default_sync_times(),
            misfire_grace: Duration::from_secs(300),
        }
    }
}

impl SchedulerConfig {
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        Self {
            times: config.sync_times.clone(),
            misfire_grace: Duration::from_secs(config.misfire_grace_secs),
        }
    }
}

/// A firing that was delayed past the grace window (busy process, host
/// asleep) is honored within the window and silently skipped after it.
///
/// The target is the nearest occurrence of `scheduled` at or before `now`
/// (with a few seconds of clock tolerance), so a firing delayed across
/// midnight still measures against the day it was scheduled for.
pub fn fired_within_grace(scheduled: NaiveTime, now: DateTime<Utc>, grace: Duration) -> bool {
    let today = now.date_naive().and_time(scheduled).and_utc();
    let target = if today <= now + chrono::Duration::seconds(5) {
        today
    } else {
        today - chrono::Duration::days(1)
    };
    let lateness = now.signed_duration_since(target);
    let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
    lateness <= grace
}

/// Next occurrences of the configured times of day, soonest first.
pub fn upcoming_times(times: &[NaiveTime], now: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
    let mut upcoming: Vec<DateTime<Utc>> = times
        .iter()
        .map(|time| {
            let today = now.date_naive().and_time(*time).and_utc();
            if today > now {
                today
            } else {
                today + chrono::Duration::days(1)
            }
        })
        .collect();
    upcoming.sort();
    upcoming.truncate(count);
    upcoming
}

/// Fixed daily cadence over the guarded sync service. Job failures are
/// caught at the wrapper and logged; they never reach the scheduler itself.
pub struct SyncScheduler {
    service: Arc<SyncService>,
    config: SchedulerConfig,
    inner: tokio::sync::Mutex<Option<JobScheduler>>,
    started: AtomicBool,
}

impl SyncScheduler {
    pub fn new(service: Arc<SyncService>, config: SchedulerConfig) -> Self {
        Self {
            service,
            config,
            inner: tokio::sync::Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let mut slot = self.inner.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for time in &self.config.times {
            let cron = format!("0 {} {} * * *", time.minute(), time.hour());
            let service = Arc::clone(&self.service);
            let grace = self.config.misfire_grace;
            let scheduled = *time;
            let job = Job::new_async(cron.as_str(), move |_id, _sched| {
                let service = Arc::clone(&service);
                Box::pin(async move {
                    let now = Utc::now();
                    if !fired_within_grace(scheduled, now, grace) {
                        info!(%scheduled, "scheduled firing outside grace window; skipping");
                        return;
                    }
                    log_run_outcome(SyncScope::All, service.run(SyncScope::All).await);
                })
            })
            .with_context(|| format!("creating scheduler job for {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }

        sched.start().await.context("starting scheduler")?;
        *slot = Some(sched);
        self.started.store(true, Ordering::SeqCst);
        info!(times = ?self.config.times, "sync scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        let mut slot = self.inner.lock().await;
        if let Some(mut sched) = slot.take() {
            sched.shutdown().await.context("stopping scheduler")?;
            self.started.store(false, Ordering::SeqCst);
            info!("sync scheduler stopped");
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Manual immediate sync; bypasses the schedule but still competes for
    /// the service's run lock.
    pub fn trigger_now(&self, scope: SyncScope) {
        self.service.trigger(scope);
    }

    pub fn next_run_times(&self, count: usize) -> Vec<DateTime<Utc>> {
        upcoming_times(&self.config.times, Utc::now(), count)
    }

    pub fn service(&self) -> &Arc<SyncService> {
        &self.service
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_client::{DirectoryUserRow, HardwareRow};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    fn hw(id: i64, tag: &str) -> HardwareRow {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": format!("asset-{id}"),
            "asset_tag": tag,
            "assigned_to": { "id": 7, "type": "user", "first_name": "Ada", "last_name": "Byron" }
        }))
        .expect("hardware row")
    }

    fn user(id: i64) -> DirectoryUserRow {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "first_name": "Ada",
            "last_name": "Byron",
            "department": { "id": 3, "name": "Finance" }
        }))
        .expect("user row")
    }

    #[derive(Default)]
    struct ScriptedSource {
        asset_pages: Vec<Vec<HardwareRow>>,
        user_pages: Vec<Vec<DirectoryUserRow>>,
        hardware_requests: AtomicUsize,
        user_requests: AtomicUsize,
        fail_hardware: bool,
        page_delay: Option<Duration>,
    }

    #[async_trait]
    impl InventorySource for ScriptedSource {
        async fn fetch_hardware_page(
            &self,
            offset: u32,
            limit: u32,
        ) -> Result<(Vec<HardwareRow>, bool), SourceError> {
            self.hardware_requests.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.page_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_hardware {
                return Err(SourceError::HttpStatus {
                    status: 500,
                    url: "http://upstream/hardware".into(),
                });
            }
            let index = (offset / limit) as usize;
            let rows = self.asset_pages.get(index).cloned().unwrap_or_default();
            let has_more = rows.len() as u32 == limit;
            Ok((rows, has_more))
        }

        async fn fetch_users_page(
            &self,
            offset: u32,
            limit: u32,
        ) -> Result<(Vec<DirectoryUserRow>, bool), SourceError> {
            self.user_requests.fetch_add(1, Ordering::SeqCst);
            let index = (offset / limit) as usize;
            let rows = self.user_pages.get(index).cloned().unwrap_or_default();
            let has_more = rows.len() as u32 == limit;
            Ok((rows, has_more))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        assets: StdMutex<BTreeMap<i64, AssetRecord>>,
        users: StdMutex<BTreeMap<i64, UserRecord>>,
        asset_commits: StdMutex<Vec<usize>>,
        freeze_tags: bool,
    }

    impl MemoryStore {
        fn seeded(rows: impl IntoIterator<Item = AssetRecord>) -> Self {
            let store = Self::default();
            {
                let mut assets = store.assets.lock().expect("lock");
                for row in rows {
                    assets.insert(row.id, row);
                }
            }
            store
        }

        fn asset_snapshot(&self) -> BTreeMap<i64, AssetRecord> {
            self.assets.lock().expect("lock").clone()
        }

        fn commits(&self) -> Vec<usize> {
            self.asset_commits.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl MirrorStore for MemoryStore {
        async fn apply_asset_batch(&self, rows: &[AssetRecord]) -> Result<(), StoreError> {
            let mut assets = self.assets.lock().expect("lock");
            let mut staged = assets.clone();
            for row in rows {
                let conflict = staged
                    .iter()
                    .any(|(id, existing)| *id != row.id && existing.asset_tag == row.asset_tag);
                if conflict {
                    return Err(StoreError::TagConflict {
                        tag: row.asset_tag.clone(),
                        incoming_id: row.id,
                    });
                }
                staged.insert(row.id, row.clone());
            }
            *assets = staged;
            self.asset_commits.lock().expect("lock").push(rows.len());
            Ok(())
        }

        async fn delete_asset_by_tag(&self, tag: &str, keep_id: i64) -> Result<u64, StoreError> {
            if self.freeze_tags {
                return Ok(0);
            }
            let mut assets = self.assets.lock().expect("lock");
            let stale: Vec<i64> = assets
                .iter()
                .filter(|(id, row)| **id != keep_id && row.asset_tag == tag)
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                assets.remove(id);
            }
            Ok(stale.len() as u64)
        }

        async fn apply_user_batch(&self, rows: &[UserRecord]) -> Result<(), StoreError> {
            let mut users = self.users.lock().expect("lock");
            for row in rows {
                users.insert(row.id, row.clone());
            }
            Ok(())
        }
    }

    fn engine(
        source: Arc<ScriptedSource>,
        store: Arc<MemoryStore>,
        config: EngineConfig,
    ) -> SyncEngine<ScriptedSource, MemoryStore> {
        SyncEngine::new(source, store, config)
    }

    fn quiet_guard() -> LoadGuard {
        LoadGuard::new(
            GuardConfig {
                defer: Duration::from_millis(1),
                ..GuardConfig::default()
            },
            Box::new(ScriptedSampler::new(vec![])),
        )
    }

    struct ScriptedSampler {
        samples: StdMutex<Vec<LoadSample>>,
        calls: AtomicUsize,
    }

    impl ScriptedSampler {
        fn new(samples: Vec<LoadSample>) -> Self {
            Self {
                samples: StdMutex::new(samples),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LoadSampler for ScriptedSampler {
        async fn sample(&self) -> LoadSample {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut samples = self.samples.lock().expect("lock");
            if samples.is_empty() {
                LoadSample {
                    cpu_percent: 5.0,
                    memory_percent: 20.0,
                }
            } else {
                samples.remove(0)
            }
        }
    }

    fn service_over(
        source: Arc<ScriptedSource>,
        store: Arc<MemoryStore>,
        breaker: BreakerConfig,
    ) -> Arc<SyncService> {
        let engine: SharedSyncEngine = SyncEngine::new(
            source as Arc<dyn InventorySource>,
            store as Arc<dyn MirrorStore>,
            EngineConfig::default(),
        );
        Arc::new(SyncService::new(
            engine,
            CircuitBreaker::new(breaker),
            quiet_guard(),
        ))
    }

    #[tokio::test]
    async fn resync_with_unchanged_source_is_idempotent() {
        let source = Arc::new(ScriptedSource {
            asset_pages: vec![vec![hw(1, "T-1"), hw(2, "T-2"), hw(3, "T-3")]],
            user_pages: vec![vec![user(7)]],
            ..ScriptedSource::default()
        });
        let store = Arc::new(MemoryStore::default());
        let engine = engine(Arc::clone(&source), Arc::clone(&store), EngineConfig::default());

        engine.sync_assets(Uuid::new_v4()).await.expect("first run");
        let first = store.asset_snapshot();
        engine.sync_assets(Uuid::new_v4()).await.expect("second run");
        let second = store.asset_snapshot();

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert_eq!(
            first.get(&1).map(|a| a.department.as_deref()),
            Some(Some("Finance"))
        );
    }

    #[tokio::test]
    async fn tag_moved_to_new_id_is_repaired() {
        let stale = {
            let lookup = aim_normalize::DepartmentLookup::default();
            aim_normalize::normalize_hardware(&hw(1, "T-SHARED"), &lookup)
        };
        let source = Arc::new(ScriptedSource {
            asset_pages: vec![vec![hw(2, "T-SHARED")]],
            user_pages: vec![vec![user(7)]],
            ..ScriptedSource::default()
        });
        let store = Arc::new(MemoryStore::seeded([stale]));
        let engine = engine(Arc::clone(&source), Arc::clone(&store), EngineConfig::default());

        let summary = engine.sync_assets(Uuid::new_v4()).await.expect("sync");
        let snapshot = store.asset_snapshot();

        assert_eq!(summary.conflicts_repaired, 1);
        assert_eq!(snapshot.len(), 1, "exactly one row carries the tag");
        assert!(snapshot.contains_key(&2));
        assert!(!snapshot.contains_key(&1));
        assert_eq!(snapshot.get(&2).map(|a| a.asset_tag.as_str()), Some("T-SHARED"));
    }

    #[tokio::test]
    async fn unresolvable_tag_conflict_fails_the_batch() {
        let stale = {
            let lookup = aim_normalize::DepartmentLookup::default();
            aim_normalize::normalize_hardware(&hw(1, "T-STUCK"), &lookup)
        };
        let source = Arc::new(ScriptedSource {
            asset_pages: vec![vec![hw(2, "T-STUCK")]],
            user_pages: vec![vec![user(7)]],
            ..ScriptedSource::default()
        });
        let store = Arc::new(MemoryStore {
            freeze_tags: true,
            ..MemoryStore::seeded([stale])
        });
        let engine = engine(Arc::clone(&source), Arc::clone(&store), EngineConfig::default());

        let err = engine
            .sync_assets(Uuid::new_v4())
            .await
            .expect_err("second conflict on the same tag propagates");
        assert!(matches!(
            err,
            SyncError::Store(StoreError::TagConflict { .. })
        ));
    }

    #[tokio::test]
    async fn batches_commit_at_fixed_boundaries() {
        let page_one: Vec<HardwareRow> = (0..100).map(|i| hw(i, &format!("T-{i}"))).collect();
        let page_two: Vec<HardwareRow> = (100..120).map(|i| hw(i, &format!("T-{i}"))).collect();
        let source = Arc::new(ScriptedSource {
            asset_pages: vec![page_one, page_two],
            user_pages: vec![vec![user(7)]],
            ..ScriptedSource::default()
        });
        let store = Arc::new(MemoryStore::default());
        let engine = engine(Arc::clone(&source), Arc::clone(&store), EngineConfig::default());

        let summary = engine.sync_assets(Uuid::new_v4()).await.expect("sync");

        assert_eq!(store.commits(), vec![50, 50, 20]);
        assert_eq!(summary.batches_committed, 3);
        assert_eq!(summary.rows_seen, 120);
        assert_eq!(summary.rows_upserted, 120);
    }

    /// Serves at most 100 rows per page regardless of the requested limit,
    /// the way the production client's clamped fetch does.
    struct ClampingSource {
        rows: Vec<HardwareRow>,
    }

    #[async_trait]
    impl InventorySource for ClampingSource {
        async fn fetch_hardware_page(
            &self,
            offset: u32,
            limit: u32,
        ) -> Result<(Vec<HardwareRow>, bool), SourceError> {
            let limit = limit.min(100);
            let start = (offset as usize).min(self.rows.len());
            let end = (start + limit as usize).min(self.rows.len());
            let rows = self.rows[start..end].to_vec();
            let has_more = rows.len() as u32 == limit;
            Ok((rows, has_more))
        }

        async fn fetch_users_page(
            &self,
            _offset: u32,
            _limit: u32,
        ) -> Result<(Vec<DirectoryUserRow>, bool), SourceError> {
            Ok((Vec::new(), false))
        }
    }

    #[tokio::test]
    async fn over_cap_page_limit_loses_no_rows() {
        let source = Arc::new(ClampingSource {
            rows: (0..150).map(|i| hw(i, &format!("T-{i}"))).collect(),
        });
        let store = Arc::new(MemoryStore::default());
        let engine = SyncEngine::new(
            source,
            Arc::clone(&store),
            EngineConfig {
                page_limit: 500,
                ..EngineConfig::default()
            },
        );

        let summary = engine.sync_assets(Uuid::new_v4()).await.expect("sync");
        assert_eq!(summary.rows_seen, 150);
        assert_eq!(summary.rows_upserted, 150);
        assert_eq!(store.asset_snapshot().len(), 150);
    }

    #[tokio::test]
    async fn windowed_mode_mirrors_the_same_rows() {
        let pages: Vec<Vec<HardwareRow>> = vec![
            (0..100).map(|i| hw(i, &format!("T-{i}"))).collect(),
            (100..200).map(|i| hw(i, &format!("T-{i}"))).collect(),
            (200..237).map(|i| hw(i, &format!("T-{i}"))).collect(),
        ];
        let source = Arc::new(ScriptedSource {
            asset_pages: pages,
            user_pages: vec![vec![user(7)]],
            ..ScriptedSource::default()
        });
        let store = Arc::new(MemoryStore::default());
        let engine = engine(
            Arc::clone(&source),
            Arc::clone(&store),
            EngineConfig {
                fetch_window: 3,
                ..EngineConfig::default()
            },
        );

        let summary = engine.sync_assets(Uuid::new_v4()).await.expect("sync");
        assert_eq!(summary.rows_seen, 237);
        assert_eq!(store.asset_snapshot().len(), 237);
    }

    #[tokio::test]
    async fn sync_all_runs_assets_then_users() {
        let source = Arc::new(ScriptedSource {
            asset_pages: vec![vec![hw(1, "T-1")]],
            user_pages: vec![vec![user(7), user(8)]],
            ..ScriptedSource::default()
        });
        let store = Arc::new(MemoryStore::default());
        let engine = engine(Arc::clone(&source), Arc::clone(&store), EngineConfig::default());

        let report = engine.sync_all().await.expect("sync all");
        assert!(report.assets.is_some());
        assert!(report.users.is_some());
        assert_eq!(store.asset_snapshot().len(), 1);
        assert_eq!(store.users.lock().expect("lock").len(), 2);
        assert_eq!(
            store
                .users
                .lock()
                .expect("lock")
                .get(&7)
                .and_then(|u| u.department_name.clone()),
            Some("Finance".to_string())
        );
    }

    #[tokio::test]
    async fn breaker_trips_after_threshold_and_admits_one_trial() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_millis(50),
        });

        breaker.try_acquire().expect("closed");
        breaker.record_failure();
        breaker.try_acquire().expect("still closed");
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.try_acquire(), Err(SyncError::CircuitOpen)));

        tokio::time::sleep(Duration::from_millis(60)).await;
        breaker.try_acquire().expect("half-open trial admitted");
        // Second caller while the trial is in flight is rejected.
        assert!(matches!(breaker.try_acquire(), Err(SyncError::CircuitOpen)));

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.try_acquire().expect("closed again");
    }

    #[tokio::test]
    async fn failed_trial_reopens_the_circuit() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(20),
        });
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        breaker.try_acquire().expect("trial admitted");
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.try_acquire(), Err(SyncError::CircuitOpen)));
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_contacting_the_source() {
        let source = Arc::new(ScriptedSource {
            fail_hardware: true,
            user_pages: vec![vec![user(7)]],
            ..ScriptedSource::default()
        });
        let store = Arc::new(MemoryStore::default());
        let service = service_over(
            Arc::clone(&source),
            store,
            BreakerConfig {
                failure_threshold: 2,
                cooldown: Duration::from_secs(300),
            },
        );

        for _ in 0..2 {
            let err = service.run(SyncScope::Assets).await.expect_err("upstream down");
            assert!(matches!(err, SyncError::Source(_)));
        }
        let requests_before = source.hardware_requests.load(Ordering::SeqCst);

        let err = service.run(SyncScope::Assets).await.expect_err("circuit open");
        assert!(matches!(err, SyncError::CircuitOpen));
        assert_eq!(
            source.hardware_requests.load(Ordering::SeqCst),
            requests_before,
            "rejected call must not reach the source"
        );
    }

    #[tokio::test]
    async fn load_guard_defers_once_then_skips() {
        let hot = LoadSample {
            cpu_percent: 95.0,
            memory_percent: 40.0,
        };
        let guard = LoadGuard::new(
            GuardConfig {
                defer: Duration::from_millis(5),
                ..GuardConfig::default()
            },
            Box::new(ScriptedSampler::new(vec![hot, hot])),
        );
        assert!(matches!(guard.check().await, LoadDecision::Skip(_)));
        // Recovery within the deferral window lets the run proceed.
        let cool = LoadSample {
            cpu_percent: 10.0,
            memory_percent: 30.0,
        };
        let guard = LoadGuard::new(
            GuardConfig {
                defer: Duration::from_millis(5),
                ..GuardConfig::default()
            },
            Box::new(ScriptedSampler::new(vec![hot, cool])),
        );
        assert!(matches!(guard.check().await, LoadDecision::Proceed));
    }

    #[tokio::test]
    async fn concurrent_triggers_run_exactly_one_sync() {
        let source = Arc::new(ScriptedSource {
            asset_pages: vec![vec![hw(1, "T-1")]],
            user_pages: vec![vec![user(7)]],
            page_delay: Some(Duration::from_millis(40)),
            ..ScriptedSource::default()
        });
        let store = Arc::new(MemoryStore::default());
        let service = service_over(Arc::clone(&source), Arc::clone(&store), BreakerConfig::default());

        let first = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.run(SyncScope::Assets).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = service.run(SyncScope::Assets).await;

        assert!(matches!(second, Err(SyncError::AlreadyRunning)));
        first.await.expect("join").expect("first run succeeds");
        // One lookup drain plus one hardware page: no second writer ran.
        assert_eq!(source.hardware_requests.load(Ordering::SeqCst), 1);
        assert_eq!(store.commits(), vec![1]);
    }

    #[test]
    fn grace_window_accepts_prompt_and_rejects_stale_firings() {
        let grace = Duration::from_secs(300);
        let scheduled = NaiveTime::from_hms_opt(8, 0, 0).expect("time");
        let on_time = "2026-08-24T08:00:01Z".parse::<DateTime<Utc>>().expect("ts");
        let late_ok = "2026-08-24T08:04:59Z".parse::<DateTime<Utc>>().expect("ts");
        let too_late = "2026-08-24T08:06:00Z".parse::<DateTime<Utc>>().expect("ts");

        assert!(fired_within_grace(scheduled, on_time, grace));
        assert!(fired_within_grace(scheduled, late_ok, grace));
        assert!(!fired_within_grace(scheduled, too_late, grace));
    }

    #[test]
    fn grace_window_spans_midnight() {
        let grace = Duration::from_secs(300);
        let scheduled = NaiveTime::from_hms_opt(23, 58, 0).expect("time");
        let just_after = "2026-08-25T00:01:00Z".parse::<DateTime<Utc>>().expect("ts");
        let way_after = "2026-08-25T00:10:00Z".parse::<DateTime<Utc>>().expect("ts");
        let slightly_early = "2026-08-24T23:57:58Z".parse::<DateTime<Utc>>().expect("ts");

        assert!(fired_within_grace(scheduled, just_after, grace));
        assert!(!fired_within_grace(scheduled, way_after, grace));
        assert!(fired_within_grace(scheduled, slightly_early, grace));
    }

    #[test]
    fn upcoming_times_wrap_past_midnight() {
        let times = parse_sync_times("08:00,20:00").expect("times");
        let evening = "2026-08-24T21:00:00Z".parse::<DateTime<Utc>>().expect("ts");
        let upcoming = upcoming_times(&times, evening, 2);

        assert_eq!(upcoming.len(), 2);
        assert_eq!(
            upcoming[0],
            "2026-08-25T08:00:00Z".parse::<DateTime<Utc>>().expect("ts")
        );
        assert_eq!(
            upcoming[1],
            "2026-08-25T20:00:00Z".parse::<DateTime<Utc>>().expect("ts")
        );
    }

    #[test]
    fn sync_times_parse_and_reject_garbage() {
        let times = parse_sync_times("08:00, 12:00,16:00").expect("times");
        assert_eq!(times.len(), 3);
        assert!(parse_sync_times("8am").is_err());
        assert!(parse_sync_times("").is_err());
    }

    #[tokio::test]
    async fn scheduler_start_is_idempotent_and_stop_clears_state() {
        let source = Arc::new(ScriptedSource::default());
        let store = Arc::new(MemoryStore::default());
        let service = service_over(source, store, BreakerConfig::default());
        let scheduler = SyncScheduler::new(service, SchedulerConfig::default());

        scheduler.start().await.expect("start");
        scheduler.start().await.expect("second start is a no-op");
        assert!(scheduler.is_started());
        assert_eq!(scheduler.next_run_times(4).len(), 4);

        scheduler.stop().await.expect("stop");
        assert!(!scheduler.is_started());
    }
}
