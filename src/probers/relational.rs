//! PostgreSQL prober.
//!
//! Opens a lazy pool, makes sure the probe table exists, then on every
//! iteration pings the server, optionally inserts the current timestamp
//! and reads back the newest row. Per-iteration failures are logged and
//! the loop carries on.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::Connection;
use tracing::{debug, info, warn};

use super::{timestamp_value, Shutdown};
use crate::config::{PgConfig, TlsMode};

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS table1 (
    id SERIAL PRIMARY KEY,
    name VARCHAR(50) NOT NULL
)";

const INSERT_SQL: &str = "INSERT INTO table1 (name) VALUES ($1)";

const LATEST_SQL: &str = "SELECT id, name FROM table1 ORDER BY id DESC LIMIT 1";

/// Connections the prober ever holds at once
const POOL_SIZE: u32 = 1;

/// A row of the probe table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRecord {
    pub id: i32,
    pub name: String,
}

/// Operations the prober needs from a relational store
pub trait RelationalStore {
    type Error: Display;

    fn ensure_schema(&self) -> impl Future<Output = Result<(), Self::Error>>;

    fn ping(&self) -> impl Future<Output = Result<(), Self::Error>>;

    /// Append a row with the given `name`
    fn insert(&self, name: &str) -> impl Future<Output = Result<(), Self::Error>>;

    /// Row with the highest id, if any
    fn latest(&self) -> impl Future<Output = Result<Option<ProbeRecord>, Self::Error>>;
}

/// PostgreSQL store backed by a lazy sqlx pool
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create the pool. No connection is made until first use.
    pub fn connect_lazy(config: &PgConfig) -> Self {
        info!(url = %config.redacted_url(), "Opening PostgreSQL pool");
        if let Some(cert) = config.tls.root_cert() {
            info!(ca_cert = %cert.display(), "Using CA cert");
        }

        let pool = PgPoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_lazy_with(connect_options(config));

        PgStore { pool }
    }
}

/// Translate validated settings into sqlx connect options.
pub fn connect_options(config: &PgConfig) -> PgConnectOptions {
    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.dbname);

    match &config.tls {
        TlsMode::Require => options.ssl_mode(PgSslMode::Require),
        TlsMode::VerifyCa(cert) => options.ssl_mode(PgSslMode::VerifyCa).ssl_root_cert(cert),
    }
}

impl RelationalStore for PgStore {
    type Error = sqlx::Error;

    async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(CREATE_TABLE_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        conn.ping().await
    }

    async fn insert(&self, name: &str) -> Result<(), sqlx::Error> {
        sqlx::query(INSERT_SQL).bind(name).execute(&self.pool).await?;
        Ok(())
    }

    async fn latest(&self) -> Result<Option<ProbeRecord>, sqlx::Error> {
        let row = sqlx::query_as::<_, (i32, String)>(LATEST_SQL)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id, name)| ProbeRecord { id, name }))
    }
}

/// Outcome of one probe iteration, one entry per step
#[derive(Debug)]
pub struct Iteration<E> {
    pub ping: Result<(), E>,
    /// `None` when writes were disabled; otherwise the value attempted
    pub insert: Option<(String, Result<(), E>)>,
    pub latest: Result<Option<ProbeRecord>, E>,
}

impl<E: Display> Iteration<E> {
    /// Log every step's outcome.
    pub fn log(&self) {
        if let Err(e) = &self.ping {
            warn!(error = %e, "Failed to ping");
        }

        match &self.insert {
            Some((value, Ok(()))) => info!(value = %value, "Inserted row successfully"),
            Some((value, Err(e))) => warn!(value = %value, error = %e, "Error inserting row"),
            None => debug!("Writes disabled"),
        }

        match &self.latest {
            Ok(Some(record)) => {
                info!(id = record.id, name = %record.name, "Queried table successfully")
            }
            Ok(None) => info!("Queried table successfully, no rows"),
            Err(e) => warn!(error = %e, "Error querying table"),
        }
    }
}

/// Run one ping / insert / read cycle.
pub async fn probe_once<S: RelationalStore>(store: &S, write: bool) -> Iteration<S::Error> {
    let ping = store.ping().await;

    let insert = if write {
        let value = timestamp_value();
        let result = store.insert(&value).await;
        Some((value, result))
    } else {
        None
    };

    let latest = store.latest().await;

    Iteration {
        ping,
        insert,
        latest,
    }
}

/// Probe until shutdown. `write_enabled` is consulted before every
/// iteration. Returns the number of completed iterations.
pub async fn run<S, W>(
    store: &S,
    interval: Duration,
    write_enabled: W,
    mut shutdown: Shutdown,
) -> Result<u64, S::Error>
where
    S: RelationalStore,
    W: Fn() -> bool,
{
    match shutdown.guard(store.ensure_schema()).await {
        Some(result) => result?,
        None => return Ok(0),
    }
    info!("Table exists/created");

    let mut iterations = 0;
    while !shutdown.is_triggered() {
        let write = write_enabled();
        let Some(iteration) = shutdown.guard(probe_once(store, write)).await else {
            break;
        };
        iteration.log();
        iterations += 1;
        info!("-------------------------");

        if !shutdown.sleep(interval).await {
            break;
        }
    }

    info!(iterations, "PostgreSQL prober stopped");
    Ok(iterations)
}

/// Open the store and probe until shutdown.
pub async fn start(
    config: &PgConfig,
    interval: Duration,
    shutdown: Shutdown,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = PgStore::connect_lazy(config);
    run(&store, interval, crate::config::write_enabled, shutdown)
        .await
        .map_err(|e| format!("failed to create table: {}", e))?;
    store.pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probers::Shutdown;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory stand-in for the probe table
    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<ProbeRecord>>,
        fail_ping: AtomicBool,
        fail_insert: AtomicBool,
        fail_latest: AtomicBool,
        fail_schema: AtomicBool,
    }

    impl MemoryStore {
        fn with_rows(names: &[&str]) -> Self {
            let store = MemoryStore::default();
            for name in names {
                store.push(name);
            }
            store
        }

        fn push(&self, name: &str) {
            let mut rows = self.rows.lock().unwrap();
            let id = rows.len() as i32 + 1;
            rows.push(ProbeRecord {
                id,
                name: name.to_string(),
            });
        }

        fn row_count(&self) -> usize {
            self.rows.lock().unwrap().len()
        }
    }

    impl RelationalStore for MemoryStore {
        type Error = String;

        async fn ensure_schema(&self) -> Result<(), String> {
            if self.fail_schema.load(Ordering::SeqCst) {
                return Err("permission denied for schema public".to_string());
            }
            Ok(())
        }

        async fn ping(&self) -> Result<(), String> {
            if self.fail_ping.load(Ordering::SeqCst) {
                return Err("connection refused".to_string());
            }
            Ok(())
        }

        async fn insert(&self, name: &str) -> Result<(), String> {
            if self.fail_insert.load(Ordering::SeqCst) {
                return Err("connection reset".to_string());
            }
            self.push(name);
            Ok(())
        }

        async fn latest(&self) -> Result<Option<ProbeRecord>, String> {
            if self.fail_latest.load(Ordering::SeqCst) {
                return Err("connection reset".to_string());
            }
            Ok(self.rows.lock().unwrap().last().cloned())
        }
    }

    #[tokio::test]
    async fn test_read_only_iterations_do_not_add_rows() {
        let store = MemoryStore::with_rows(&["1700000000", "1700000010"]);

        for _ in 0..3 {
            let iteration = probe_once(&store, false).await;
            assert!(iteration.ping.is_ok());
            assert!(iteration.insert.is_none());
            assert_eq!(
                iteration.latest.unwrap(),
                Some(ProbeRecord {
                    id: 2,
                    name: "1700000010".to_string()
                })
            );
        }
        assert_eq!(store.row_count(), 2);
    }

    #[tokio::test]
    async fn test_write_iterations_add_timestamp_rows() {
        let store = MemoryStore::default();

        for n in 1..=3 {
            let iteration = probe_once(&store, true).await;
            let (value, result) = iteration.insert.unwrap();
            assert!(result.is_ok());

            let latest = iteration.latest.unwrap().unwrap();
            assert_eq!(latest.id, n);
            assert_eq!(latest.name, value);

            let secs: i64 = latest.name.parse().unwrap();
            assert!((secs - chrono::Utc::now().timestamp()).abs() <= 5);
        }
        assert_eq!(store.row_count(), 3);
    }

    #[tokio::test]
    async fn test_step_failures_are_reported_not_raised() {
        let store = MemoryStore::with_rows(&["1700000000"]);
        store.fail_ping.store(true, Ordering::SeqCst);
        store.fail_insert.store(true, Ordering::SeqCst);

        let iteration = probe_once(&store, true).await;
        assert_eq!(iteration.ping.unwrap_err(), "connection refused");
        assert!(iteration.insert.unwrap().1.is_err());
        // Read still happens after the failed write
        assert_eq!(iteration.latest.unwrap().unwrap().name, "1700000000");

        store.fail_latest.store(true, Ordering::SeqCst);
        let iteration = probe_once(&store, false).await;
        iteration.log();
        assert!(iteration.latest.is_err());
    }

    #[tokio::test]
    async fn test_schema_failure_is_fatal() {
        let store = MemoryStore::default();
        store.fail_schema.store(true, Ordering::SeqCst);
        let (_trigger, shutdown) = Shutdown::new();

        let result = run(&store, Duration::from_millis(1), || true, shutdown).await;
        assert!(result.is_err());
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn test_loop_survives_failures_until_shutdown() {
        let store = MemoryStore::default();
        store.fail_ping.store(true, Ordering::SeqCst);
        store.fail_latest.store(true, Ordering::SeqCst);
        let (trigger, shutdown) = Shutdown::new();

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.trigger();
        };
        let (iterations, ()) = tokio::join!(
            run(&store, Duration::from_millis(10), || true, shutdown),
            stopper
        );

        let iterations = iterations.unwrap();
        assert!(iterations >= 2, "only {iterations} iterations ran");
        assert_eq!(store.row_count() as u64, iterations);
    }

    #[tokio::test]
    async fn test_write_toggle_read_every_iteration() {
        let store = MemoryStore::default();
        let calls = Cell::new(0u32);
        let (trigger, shutdown) = Shutdown::new();

        // Writes only on the first call
        let toggle = || {
            calls.set(calls.get() + 1);
            calls.get() == 1
        };
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            trigger.trigger();
        };
        let (iterations, ()) = tokio::join!(
            run(&store, Duration::from_millis(5), toggle, shutdown),
            stopper
        );

        let iterations = iterations.unwrap();
        assert_eq!(calls.get() as u64, iterations);
        assert_eq!(store.row_count(), 1);
    }

    fn pg_config(tls: TlsMode) -> PgConfig {
        PgConfig {
            user: "probe".to_string(),
            password: "secret".to_string(),
            host: "db.internal".to_string(),
            port: 6543,
            dbname: "probes".to_string(),
            tls,
        }
    }

    #[test]
    fn test_connect_options_target() {
        let options = connect_options(&pg_config(TlsMode::Require));
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_username(), "probe");
        assert_eq!(options.get_database(), Some("probes"));
    }

    #[test]
    fn test_connect_options_tls_require() {
        let options = connect_options(&pg_config(TlsMode::Require));
        assert!(matches!(options.get_ssl_mode(), PgSslMode::Require));
    }

    #[test]
    fn test_connect_options_tls_verify_ca() {
        let options = connect_options(&pg_config(TlsMode::VerifyCa("/etc/ssl/ca.pem".into())));
        assert!(matches!(options.get_ssl_mode(), PgSslMode::VerifyCa));
    }

    /// Needs a reachable server configured through the PG_* variables.
    #[tokio::test]
    #[ignore]
    async fn test_live_schema_twice() {
        let cli = crate::config::CliArgs {
            interval_secs: 10,
            log_level: "info".to_string(),
        };
        let settings = crate::config::Settings::from_env(cli).unwrap();
        let crate::config::Mode::Postgres(config) = settings.mode else {
            panic!("DB_TYPE must be pg");
        };
        let store = PgStore::connect_lazy(&config);
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
        store.ping().await.unwrap();
        store.latest().await.unwrap();
    }
}
