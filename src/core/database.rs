use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};
use parking_lot::Mutex;
use regex::Regex;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::stats::{DatabaseStats, HealthCheck, HealthCheckResult, HealthStatus};
use crate::core::types::{Collection, Row, SqlValue};
use crate::lock::edit_lock::EditLockManager;
use crate::query::cache::QueryCache;
use crate::query::compiler::{CompiledQuery, QueryCompiler};
use crate::storage::change_log::{ChangeLog, ChangeWatcher};
use crate::storage::layout::StorageLayout;
use crate::storage::serializer::{AccessSerializer, MarkerFileLock};

/// The relational store holding the records. Supplied by the caller; every
/// call reaching it already runs inside the serialized section.
pub trait RecordStore: Send {
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Returns the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Shared record database: serialized storage access, change notification,
/// row edit locks and the search language over one resource root.
pub struct Database<S: RecordStore> {
    config: Config,
    layout: StorageLayout,
    store: Mutex<S>,
    serializer: AccessSerializer,
    change_log: ChangeLog,
    edit_locks: EditLockManager,
    compiler: QueryCompiler,
    query_cache: QueryCache,
    write_target: Regex,

    start_time: Instant,
    started_at: SystemTime,
    query_count: AtomicU64,
    write_count: AtomicU64,
    search_count: AtomicU64,
    parse_failures: AtomicU64,
    lost_notifications: AtomicU64,
}

impl<S: RecordStore> Database<S> {
    pub fn open(store: S, config: Config) -> Result<Self> {
        let layout = StorageLayout::new(config.storage_path.clone())?;
        let serializer = AccessSerializer::marker_file(&layout, &config);
        Self::with_serializer(store, config, serializer)
    }

    /// Open with a different mutual exclusion resource, e.g. `FlockLock`.
    pub fn with_serializer(store: S, config: Config, serializer: AccessSerializer) -> Result<Self> {
        let layout = StorageLayout::new(config.storage_path.clone())?;
        let change_log = ChangeLog::from_config(&layout, &config);
        let edit_locks = EditLockManager::from_config(layout.clone(), &config);
        let query_cache = QueryCache::new(config.query_cache_size);
        let write_target = Regex::new(
            r#"(?i)^\s*(?:INSERT(?:\s+OR\s+\w+)?\s+INTO|REPLACE\s+INTO|UPDATE(?:\s+OR\s+\w+)?|DELETE\s+FROM)\s+["`\[]?(\w+)"#,
        )?;

        log::info!("opened record database at {}", layout.base_dir.display());

        Ok(Database {
            config,
            layout,
            store: Mutex::new(store),
            serializer,
            change_log,
            edit_locks,
            compiler: QueryCompiler::new()?,
            query_cache,
            write_target,
            start_time: Instant::now(),
            started_at: SystemTime::now(),
            query_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            search_count: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            lost_notifications: AtomicU64::new(0),
        })
    }

    /// Read rows. Holds the serializer until every row is materialized.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.serializer.run(|| self.store.lock().query(sql, params))
    }

    /// Run one write and commit it. The change log hears about it only after
    /// the commit succeeded, still inside the serialized section. Once the
    /// commit succeeded the call succeeds, even if the change log could not
    /// be appended to.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.write_count.fetch_add(1, Ordering::Relaxed);
        let affected = self.affected_collections(sql);

        self.serializer.run(|| {
            let mut store = self.store.lock();
            let rows = match Self::apply(&mut *store, sql, &[params.to_vec()]) {
                Ok(rows) => rows,
                Err(e) => {
                    Self::abort(&mut *store, &e);
                    return Err(e);
                }
            };
            drop(store);

            self.announce(&affected, 1);
            Ok(rows)
        })
    }

    /// Run one statement per parameter set as a single all-or-nothing unit.
    pub fn execute_many(&self, sql: &str, param_sets: &[Vec<SqlValue>]) -> Result<u64> {
        self.write_count.fetch_add(param_sets.len() as u64, Ordering::Relaxed);
        let affected = self.affected_collections(sql);

        self.serializer.run(|| {
            let mut store = self.store.lock();
            let total = match Self::apply(&mut *store, sql, param_sets) {
                Ok(total) => total,
                Err(e) => {
                    Self::abort(&mut *store, &e);
                    return Err(e);
                }
            };
            drop(store);

            self.announce(&affected, param_sets.len());
            Ok(total)
        })
    }

    /// Append change markers for `writes` committed writes. The writes are
    /// durable by now, so a lost notification is logged and not returned.
    fn announce(&self, affected: &[Collection], writes: usize) {
        for _ in 0..writes {
            if let Err(e) = self.change_log.notify(affected) {
                self.lost_notifications.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "write to {:?} committed but change log {} not updated: {}",
                    affected,
                    self.change_log.path().display(),
                    e
                );
                return;
            }
        }
    }

    fn apply(store: &mut S, sql: &str, param_sets: &[Vec<SqlValue>]) -> Result<u64> {
        let mut total = 0;
        for params in param_sets {
            total += store.execute(sql, params)?;
        }
        store.commit()?;
        Ok(total)
    }

    fn abort(store: &mut S, cause: &Error) {
        log::warn!("write aborted: {}", cause);
        if let Err(e) = store.rollback() {
            log::error!("rollback after failed write also failed: {}", e);
        }
    }

    /// Compile a search, reusing earlier compilations of the same input.
    pub fn compile(&self, input: &str) -> Result<Vec<CompiledQuery>> {
        if let Some(compiled) = self.query_cache.get(input) {
            return Ok(compiled);
        }
        let compiled = self.compiler.compile(input)?;
        self.query_cache.put(input, compiled.clone());
        Ok(compiled)
    }

    /// Search with the query language. Input the grammar cannot consume finds
    /// nothing; unknown aliases and fields are errors.
    pub fn search(&self, input: &str) -> Result<Vec<Row>> {
        self.search_count.fetch_add(1, Ordering::Relaxed);
        let compiled = match self.compile(input) {
            Ok(compiled) => compiled,
            Err(e) if e.is_parse() => {
                self.parse_failures.fetch_add(1, Ordering::Relaxed);
                log::debug!("{}", e);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.serializer.run(|| {
            let mut store = self.store.lock();
            let mut rows = Vec::new();
            for query in &compiled {
                let (sql, params) = query.to_sql();
                rows.extend(store.query(&sql, &params)?);
            }
            Ok(rows)
        })
    }

    /// All rows of the collection behind `alias`; `input` is not applied.
    pub fn restricted_search(&self, input: &str, alias: &str) -> Result<Vec<Row>> {
        self.search_count.fetch_add(1, Ordering::Relaxed);
        let (sql, params) = self.compiler.compile_restricted(input, alias)?.to_sql();
        self.query(&sql, &params)
    }

    /// Target collection of an `INSERT`, `UPDATE` or `DELETE` statement.
    pub fn affected_collections(&self, sql: &str) -> Vec<Collection> {
        self.write_target
            .captures(sql)
            .and_then(|caps| caps.get(1))
            .and_then(|table| Collection::from_name(table.as_str()))
            .into_iter()
            .collect()
    }

    pub fn edit_locks(&self) -> &EditLockManager {
        &self.edit_locks
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.change_log
    }

    pub fn serializer(&self) -> &AccessSerializer {
        &self.serializer
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Watch for writes made from now on, by this or any other client.
    pub fn watch_changes(&self) -> Result<ChangeWatcher> {
        let cursor = self.change_log.size()?;
        Ok(ChangeWatcher::spawn(self.change_log.clone(), cursor, self.config.change_poll_interval))
    }

    pub fn stats(&self) -> Result<DatabaseStats> {
        Ok(DatabaseStats {
            uptime_secs: self.start_time.elapsed().as_secs(),
            start_time: self.started_at,
            query_count: self.query_count.load(Ordering::Relaxed),
            write_count: self.write_count.load(Ordering::Relaxed),
            search_count: self.search_count.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            lost_notifications: self.lost_notifications.load(Ordering::Relaxed),
            cache_stats: self.query_cache.stats(),
            change_log_bytes: self.change_log.size()?,
        })
    }

    pub fn health_check(&self) -> HealthCheckResult {
        let mut checks = Vec::new();

        let probe = MarkerFileLock::new(self.layout.marker_path(), self.config.serializer_poll_interval, None);
        checks.push(match (probe.marker_age(), self.config.stale_marker_after) {
            (Ok(Some(age)), Some(limit)) if age > limit => HealthCheck {
                name: "access_marker".to_string(),
                status: HealthStatus::Degraded(format!("marker held for {:?}", age)),
                message: Some(format!("{} looks stale", self.layout.marker_path().display())),
            },
            (Ok(_), _) => HealthCheck {
                name: "access_marker".to_string(),
                status: HealthStatus::Healthy,
                message: None,
            },
            (Err(e), _) => HealthCheck {
                name: "access_marker".to_string(),
                status: HealthStatus::Unhealthy(e.to_string()),
                message: None,
            },
        });

        let lost = self.lost_notifications.load(Ordering::Relaxed);
        checks.push(match self.change_log.size() {
            Ok(size) if lost > 0 => HealthCheck {
                name: "change_log".to_string(),
                status: HealthStatus::Degraded(format!("{} committed write(s) not announced", lost)),
                message: Some(format!("{} bytes", size)),
            },
            Ok(size) => HealthCheck {
                name: "change_log".to_string(),
                status: HealthStatus::Healthy,
                message: Some(format!("{} bytes", size)),
            },
            Err(e) => HealthCheck {
                name: "change_log".to_string(),
                status: HealthStatus::Unhealthy(e.to_string()),
                message: None,
            },
        });

        checks.push(if self.layout.edit_locks_dir.is_dir() {
            HealthCheck {
                name: "edit_locks".to_string(),
                status: HealthStatus::Healthy,
                message: None,
            }
        } else {
            HealthCheck {
                name: "edit_locks".to_string(),
                status: HealthStatus::Unhealthy("edit lock directory missing".to_string()),
                message: Some(self.layout.edit_locks_dir.display().to_string()),
            }
        });

        HealthCheckResult::from_checks(checks)
    }
}
