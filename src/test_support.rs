//! Fixtures shared by the unit tests.

use crate::services::{
    clock::Clock,
    metadata_store::MetadataStore,
    object_store::{LocalObjectStore, ObjectReader, ObjectStore, ObjectStoreError, ObjectStoreResult, StoredObject},
    share_service::ShareService,
    short_code::{CodeSource, RandomCodeSource, ShortCodeGenerator},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    collections::{HashSet, VecDeque},
    str::FromStr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

/// Single-connection in-memory SQLite pool. One connection keeps every
/// caller on the same database.
pub async fn memory_pool() -> Arc<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("sqlite options")
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .expect("sqlite pool");
    Arc::new(pool)
}

pub async fn metadata_store() -> MetadataStore {
    let store = MetadataStore::new(memory_pool().await);
    store.migrate().await.expect("migrate");
    store
}

pub async fn read_body(mut body: ObjectReader) -> Vec<u8> {
    let mut buf = Vec::new();
    body.read_to_end(&mut buf).await.expect("read body");
    buf
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc::now()),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

/// Hands out a fixed list of codes, then either repeats one code forever or
/// falls back to random draws.
pub struct ScriptedCodes {
    queue: Mutex<VecDeque<String>>,
    repeat: Option<String>,
}

impl ScriptedCodes {
    pub fn new<I, S>(codes: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            queue: Mutex::new(codes.into_iter().map(Into::into).collect()),
            repeat: None,
        })
    }

    pub fn repeating(code: &str) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            repeat: Some(code.to_string()),
        })
    }
}

impl CodeSource for ScriptedCodes {
    fn draw(&self, length: usize) -> String {
        let next = self.queue.lock().expect("codes lock").pop_front();
        next.or_else(|| self.repeat.clone())
            .unwrap_or_else(|| RandomCodeSource.draw(length))
    }
}

/// On-disk object store with injectable failures.
pub struct FlakyObjectStore {
    inner: LocalObjectStore,
    failing_puts: AtomicUsize,
    failing_deletes: AtomicUsize,
    broken_keys: Mutex<HashSet<String>>,
}

impl FlakyObjectStore {
    pub fn new(inner: LocalObjectStore) -> Self {
        Self {
            inner,
            failing_puts: AtomicUsize::new(0),
            failing_deletes: AtomicUsize::new(0),
            broken_keys: Mutex::new(HashSet::new()),
        }
    }

    /// The next `n` puts fail.
    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// The next `n` deletes fail.
    pub fn fail_next_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    /// Every delete of `key` fails.
    pub fn fail_deletes_for(&self, key: &str) {
        self.broken_keys
            .lock()
            .expect("keys lock")
            .insert(key.to_string());
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected(op: &str, key: &str) -> ObjectStoreError {
        ObjectStoreError::Unavailable(format!("injected {op} failure for `{key}`"))
    }
}

#[async_trait]
impl ObjectStore for FlakyObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> ObjectStoreResult<()> {
        self.inner.ensure_bucket(bucket).await
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Bytes) -> ObjectStoreResult<()> {
        if Self::take(&self.failing_puts) {
            return Err(Self::injected("put", key));
        }
        self.inner.put(bucket, key, bytes).await
    }

    async fn get(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectReader> {
        self.inner.get(bucket, key).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
        let broken = self.broken_keys.lock().expect("keys lock").contains(key);
        if broken || Self::take(&self.failing_deletes) {
            return Err(Self::injected("delete", key));
        }
        self.inner.delete(bucket, key).await
    }

    async fn list(&self, bucket: &str) -> ObjectStoreResult<Vec<StoredObject>> {
        self.inner.list(bucket).await
    }

    async fn probe(&self) -> ObjectStoreResult<()> {
        self.inner.probe().await
    }
}

/// SQLite trigger that aborts a statement, dropped again with `remove`.
pub struct FailTrigger {
    pool: Arc<SqlitePool>,
    name: String,
}

impl FailTrigger {
    /// Abort every `event` (INSERT/UPDATE/DELETE) on `table`.
    pub async fn install(pool: &Arc<SqlitePool>, table: &str, event: &str) -> Result<Self, sqlx::Error> {
        let name = format!("failpoint_{}_{}", table, event.to_ascii_lowercase());
        sqlx::query(&format!(
            "CREATE TRIGGER {name} BEFORE {event} ON {table}
             BEGIN SELECT RAISE(ABORT, 'failpoint'); END"
        ))
        .execute(&**pool)
        .await?;
        Ok(Self {
            pool: pool.clone(),
            name,
        })
    }

    /// Make inserting `code` look like it lost a race against another writer.
    pub async fn install_unique_conflict(pool: &Arc<SqlitePool>, code: &str) -> Result<Self, sqlx::Error> {
        let name = "failpoint_short_code_race".to_string();
        sqlx::query(&format!(
            "CREATE TRIGGER {name} BEFORE INSERT ON short_links
             WHEN NEW.short_code = '{code}'
             BEGIN SELECT RAISE(ABORT, 'UNIQUE constraint failed: short_links.short_code'); END"
        ))
        .execute(&**pool)
        .await?;
        Ok(Self {
            pool: pool.clone(),
            name,
        })
    }

    pub async fn remove(self) -> Result<(), sqlx::Error> {
        sqlx::query(&format!("DROP TRIGGER IF EXISTS {}", self.name))
            .execute(&*self.pool)
            .await
            .map(|_| ())
    }
}

pub struct Harness {
    pub service: ShareService,
    pub objects: Arc<FlakyObjectStore>,
    pub clock: Arc<ManualClock>,
    pub _dir: TempDir,
}

pub async fn harness() -> Harness {
    build_harness(ShortCodeGenerator::default()).await
}

pub async fn harness_with_codes(codes: Arc<ScriptedCodes>) -> Harness {
    build_harness(ShortCodeGenerator::new(codes)).await
}

async fn build_harness(codes: ShortCodeGenerator) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let objects = Arc::new(FlakyObjectStore::new(LocalObjectStore::new(dir.path())));
    objects.ensure_bucket("images").await.expect("bucket");
    let clock = ManualClock::new();
    let service = ShareService::new(metadata_store().await, objects.clone(), "images")
        .with_clock(clock.clone())
        .with_code_generator(codes);
    Harness {
        service,
        objects,
        clock,
        _dir: dir,
    }
}
