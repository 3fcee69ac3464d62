//! Redis prober.
//!
//! Writes the current timestamp under a fixed key and reads it back on
//! every iteration. Connections always use TLS and are opened lazily by
//! [`RedisPool`], which also owns the bounded retry for transient errors.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, ConnectionInfo, IntoConnectionInfo, RedisError, RedisResult};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{timestamp_value, Shutdown};
use crate::config::RedisConfig;

/// Key overwritten on every iteration
pub const KEY: &str = "key";

const MIN_RETRY_BACKOFF: Duration = Duration::from_millis(8);
const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(512);

/// Operations the prober needs from a key-value store
pub trait KeyValueStore {
    type Error: Display;

    /// Store `value` under `key` with no expiration
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), Self::Error>>;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, Self::Error>>;
}

/// Build TLS connection info for the configured address.
///
/// Empty credentials mean no AUTH. rustls only negotiates TLS 1.2 and 1.3,
/// so 1.2 is the floor.
pub fn connection_info(config: &RedisConfig) -> RedisResult<ConnectionInfo> {
    let mut info = format!("rediss://{}/0", config.address()).into_connection_info()?;
    info.redis.username = config.username.clone();
    info.redis.password = config.password.clone();
    Ok(info)
}

/// Delay before retry number `attempt` (0-based)
pub fn retry_backoff(attempt: u32) -> Duration {
    MIN_RETRY_BACKOFF
        .saturating_mul(1u32 << attempt.min(16))
        .min(MAX_RETRY_BACKOFF)
}

fn is_transient(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

/// Small fixed-size pool of lazily opened TLS connections.
///
/// Each slot holds at most one multiplexed connection; slots are used
/// round-robin. Every new connection is named with `CLIENT SETNAME`.
pub struct RedisPool {
    client: redis::Client,
    slots: Vec<Mutex<Option<MultiplexedConnection>>>,
    next: AtomicUsize,
    max_retries: u32,
    client_name: String,
}

impl RedisPool {
    /// Create the pool. Nothing is dialed until the first command.
    pub fn new(config: &RedisConfig) -> RedisResult<Self> {
        let client = redis::Client::open(connection_info(config)?)?;
        let slots = (0..config.pool_size.max(1)).map(|_| Mutex::new(None)).collect();

        Ok(RedisPool {
            client,
            slots,
            next: AtomicUsize::new(0),
            max_retries: config.max_retries,
            client_name: config.client_name.clone(),
        })
    }

    /// Get the slot's connection, opening it if needed.
    async fn connection(&self, slot: usize) -> RedisResult<MultiplexedConnection> {
        let mut guard = self.slots[slot].lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        self.on_connect(&mut conn).await?;
        debug!(slot, client_name = %self.client_name, "Opened Redis connection");

        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn on_connect(&self, conn: &mut MultiplexedConnection) -> RedisResult<()> {
        redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(&self.client_name)
            .query_async::<()>(conn)
            .await
    }

    async fn discard(&self, slot: usize) {
        *self.slots[slot].lock().await = None;
    }

    /// Run `op` on a pooled connection, retrying transient failures.
    async fn execute<T, F, Fut>(&self, op: F) -> RedisResult<T>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let op = &op;
        retry_transient(self.max_retries, move || async move {
            let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
            let result = match self.connection(slot).await {
                Ok(conn) => op(conn).await,
                Err(e) => Err(e),
            };
            if matches!(&result, Err(e) if is_transient(e)) {
                self.discard(slot).await;
            }
            result
        })
        .await
    }
}

/// Call `attempt` until it succeeds, fails with a non-transient error, or
/// `max_retries` retries have been spent.
async fn retry_transient<T, F, Fut>(max_retries: u32, mut attempt: F) -> RedisResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RedisResult<T>>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Err(e) if is_transient(&e) && retries < max_retries => {
                let delay = retry_backoff(retries);
                debug!(retries, delay_ms = delay.as_millis() as u64, error = %e, "Retrying Redis command");
                tokio::time::sleep(delay).await;
                retries += 1;
            }
            other => return other,
        }
    }
}

impl KeyValueStore for RedisPool {
    type Error = RedisError;

    async fn set(&self, key: &str, value: &str) -> Result<(), RedisError> {
        self.execute(move |mut conn| async move { conn.set::<_, _, ()>(key, value).await })
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RedisError> {
        self.execute(move |mut conn| async move { conn.get::<_, Option<String>>(key).await })
            .await
    }
}

/// Outcome of one write/read cycle
#[derive(Debug)]
pub struct Iteration<E> {
    pub written: String,
    pub set: Result<(), E>,
    pub get: Result<Option<String>, E>,
}

impl<E: Display> Iteration<E> {
    pub fn log(&self) {
        match &self.set {
            Ok(()) => info!(key = KEY, value = %self.written, "Set key"),
            Err(e) => warn!(key = KEY, value = %self.written, error = %e, "Error setting key"),
        }

        match &self.get {
            Ok(Some(value)) => info!(key = KEY, value = %value, "Got key"),
            Ok(None) => warn!(key = KEY, "Key not found"),
            Err(e) => warn!(key = KEY, error = %e, "Error getting key"),
        }
    }
}

/// Run one SET / GET cycle.
pub async fn probe_once<S: KeyValueStore>(store: &S) -> Iteration<S::Error> {
    let written = timestamp_value();
    let set = store.set(KEY, &written).await;
    let get = store.get(KEY).await;

    Iteration { written, set, get }
}

/// Probe until shutdown. Returns the number of completed iterations.
pub async fn run<S: KeyValueStore>(store: &S, interval: Duration, mut shutdown: Shutdown) -> u64 {
    let mut iterations = 0;
    while !shutdown.is_triggered() {
        let Some(iteration) = shutdown.guard(probe_once(store)).await else {
            break;
        };
        iteration.log();
        iterations += 1;
        info!("-------------------------");

        if !shutdown.sleep(interval).await {
            break;
        }
    }

    info!(iterations, "Redis prober stopped");
    iterations
}

/// Build the client and probe until shutdown.
pub async fn start(
    config: &RedisConfig,
    interval: Duration,
    shutdown: Shutdown,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        address = %config.address(),
        pool_size = config.pool_size,
        max_retries = config.max_retries,
        "Connecting to Redis"
    );

    let pool = RedisPool::new(config)
        .map_err(|e| format!("invalid Redis address '{}': {}", config.address(), e))?;

    run(&pool, interval, shutdown).await;
    Ok(())
}
