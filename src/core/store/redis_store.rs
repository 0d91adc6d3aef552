//! Redis-backed store
//!
//! One `ConnectionManager` is created lazily and shared by every request.
//! Each command runs under a timeout, transient failures are retried a
//! bounded number of times with exponential backoff, and the whole call is
//! guarded by a circuit breaker so a dead server is not hammered.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::OnceCell;

use super::breaker::{BreakerConfig, BreakerError, CircuitBreaker};
use super::{SessionStore, StoreError, StoreResult};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 6379;
const DEFAULT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 50;

/// Hosts of managed Redis offerings that only accept TLS
const MANAGED_TLS_HOSTS: [&str; 2] = ["redislabs.com", "redis.cloud"];

/// Redis connection configuration
#[derive(Clone)]
pub struct StoreConfig {
    /// Full connection URL; when set, host/port/credentials are ignored
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// `None` means "decide from the host name"
    pub tls: Option<bool>,
    /// Logical database index
    pub db: i64,
    /// Per-command timeout in seconds
    pub timeout_secs: u64,
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    /// Initial retry backoff, doubled on each attempt
    pub retry_backoff_ms: u64,
    pub breaker: BreakerConfig,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .field("db", &self.db)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            tls: None,
            db: 0,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            breaker: BreakerConfig::default(),
        }
    }
}

/// Store configuration errors
#[derive(Debug, thiserror::Error)]
pub enum StoreConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid Redis address: {0}")]
    InvalidAddress(String),
}

fn env_parse<T: std::str::FromStr>(
    name: &'static str,
    default: T,
) -> Result<T, StoreConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| StoreConfigError::InvalidValue { name, value }),
        _ => Ok(default),
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl StoreConfig {
    /// Read `REDIS_*` environment variables
    pub fn from_env() -> Result<Self, StoreConfigError> {
        let defaults = Self::default();

        let tls = match env_non_empty("REDIS_SSL").map(|v| v.to_lowercase()) {
            Some(v) if v == "true" || v == "1" => Some(true),
            Some(v) if v == "false" || v == "0" => Some(false),
            Some(value) => {
                return Err(StoreConfigError::InvalidValue {
                    name: "REDIS_SSL",
                    value,
                });
            }
            None => None,
        };

        let breaker = BreakerConfig::default()
            .failure_threshold(env_parse(
                "REDIS_BREAKER_THRESHOLD",
                defaults.breaker.failure_threshold,
            )?)
            .reset_timeout(Duration::from_secs(env_parse(
                "REDIS_BREAKER_RESET_SECS",
                defaults.breaker.reset_timeout.as_secs(),
            )?));

        Ok(Self {
            url: env_non_empty("REDIS_URL"),
            host: env_non_empty("REDIS_HOST").unwrap_or(defaults.host),
            port: env_parse("REDIS_PORT", defaults.port)?,
            username: env_non_empty("REDIS_USERNAME"),
            password: env_non_empty("REDIS_PASSWORD"),
            tls,
            db: env_parse("REDIS_DB", defaults.db)?,
            timeout_secs: env_parse("REDIS_TIMEOUT_SECS", defaults.timeout_secs)?,
            max_retries: env_parse("REDIS_MAX_RETRIES", defaults.max_retries)?,
            retry_backoff_ms: env_parse("REDIS_RETRY_BACKOFF_MS", defaults.retry_backoff_ms)?,
            breaker,
        })
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Whether the connection uses TLS
    pub fn uses_tls(&self) -> bool {
        if let Some(url) = &self.url {
            return url.starts_with("rediss://");
        }
        self.tls.unwrap_or_else(|| {
            MANAGED_TLS_HOSTS
                .iter()
                .any(|managed| self.host.contains(managed))
        })
    }

    /// Connection URL built from the individual settings
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        let scheme = if self.uses_tls() { "rediss" } else { "redis" };
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}:{}@",
                urlencoding::encode(user),
                urlencoding::encode(pass)
            ),
            (None, Some(pass)) => format!(":{}@", urlencoding::encode(pass)),
            (Some(user), None) => format!("{}@", urlencoding::encode(user)),
            (None, None) => String::new(),
        };

        format!(
            "{}://{}{}:{}/{}",
            scheme, auth, self.host, self.port, self.db
        )
    }

    /// Address without credentials, safe to log
    pub fn display_address(&self) -> String {
        if self.url.is_some() {
            return "<REDIS_URL>".to_string();
        }
        format!("{}:{}/{}", self.host, self.port, self.db)
    }
}

/// Redis implementation of [`SessionStore`]
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    breaker: CircuitBreaker,
    address: String,
}

impl RedisStore {
    /// Validate the address. No connection is made until the first call.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreConfigError> {
        let client = Client::open(config.connection_url())
            .map_err(|e| StoreConfigError::InvalidAddress(e.to_string()))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            address: config.display_address(),
        })
    }

    /// Establish the shared connection eagerly; failures are logged and the
    /// next call tries again.
    pub async fn connect(&self) -> StoreResult<()> {
        self.manager().await.map(|_| ())
    }

    async fn manager(&self) -> StoreResult<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager =
                    tokio::time::timeout(self.timeout, ConnectionManager::new(self.client.clone()))
                        .await
                        .map_err(|_| StoreError::Timeout)?
                        .map_err(map_redis_error)?;
                tracing::info!(address = %self.address, "Connected to Redis");
                Ok::<_, StoreError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    /// Run one command: breaker, then timeout and bounded retry
    async fn run<T, F, Fut>(&self, op: &'static str, command: F) -> StoreResult<T>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let this = self;
        let command = &command;
        let attempts = retry_with_backoff(
            op,
            self.max_retries,
            self.retry_backoff,
            move || async move {
                let conn = match this.manager().await {
                    Ok(conn) => conn,
                    Err(err) => return Err(AttemptError::transient(err)),
                };
                match tokio::time::timeout(this.timeout, command(conn)).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(AttemptError {
                        transient: is_transient(&err),
                        error: map_redis_error(err),
                    }),
                    Err(_) => Err(AttemptError::transient(StoreError::Timeout)),
                }
            },
        );

        // Error replies prove the server is up; only outages trip the breaker
        match self.breaker.call_with(attempts, StoreError::is_unavailable).await {
            Ok(value) => Ok(value),
            Err(BreakerError::Open) => Err(StoreError::CircuitOpen),
            Err(BreakerError::Inner(err)) => {
                tracing::error!(op, address = %self.address, error = %err, "Store command failed");
                Err(err)
            }
        }
    }
}

/// A failed attempt; only transient failures are worth another try
#[derive(Debug)]
struct AttemptError {
    error: StoreError,
    transient: bool,
}

impl AttemptError {
    fn transient(error: StoreError) -> Self {
        Self {
            error,
            transient: true,
        }
    }
}

/// Retry `attempt` at most `max_retries` times, doubling the pause each time
async fn retry_with_backoff<T, F, Fut>(
    op: &'static str,
    max_retries: u32,
    initial_backoff: Duration,
    attempt: F,
) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut backoff = initial_backoff;
    let mut retries = 0;
    loop {
        let failure = match attempt().await {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };

        if !failure.transient || retries >= max_retries {
            return Err(failure.error);
        }
        retries += 1;
        tracing::debug!(op, attempt = retries, error = %failure.error, "Retrying store command");
        tokio::time::sleep(backoff).await;
        backoff = backoff.saturating_mul(2);
    }
}

fn is_transient(err: &RedisError) -> bool {
    err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
}

fn map_redis_error(err: RedisError) -> StoreError {
    use redis::ErrorKind;

    if err.is_timeout() {
        StoreError::Timeout
    } else if is_transient(&err) {
        StoreError::Unavailable(err.to_string())
    } else if matches!(
        err.kind(),
        ErrorKind::TypeError
            | ErrorKind::ResponseError
            | ErrorKind::ExtensionError
            | ErrorKind::ExecAbortError
            | ErrorKind::NoScriptError
    ) {
        // The server answered, just not with what we asked for
        StoreError::Protocol(err.to_string())
    } else {
        StoreError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool> {
        self.run("SETEX", |mut conn| async move {
            conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
            Ok(true)
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.run("GET", |mut conn| async move { conn.get(key).await })
            .await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.run("EXISTS", |mut conn| async move { conn.exists(key).await })
            .await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.run("DEL", |mut conn| async move {
            let removed: i64 = conn.del(key).await?;
            Ok(removed > 0)
        })
        .await
    }

    async fn add_to_set(&self, set_key: &str, members: &[String]) -> StoreResult<bool> {
        if members.is_empty() {
            return Ok(false);
        }
        self.run("SADD", |mut conn| async move {
            conn.sadd::<_, _, i64>(set_key, members).await?;
            Ok(true)
        })
        .await
    }

    async fn members_of(&self, set_key: &str) -> StoreResult<Vec<String>> {
        self.run("SMEMBERS", |mut conn| async move {
            conn.smembers(set_key).await
        })
        .await
    }

    async fn set_ttl(&self, key: &str, ttl_secs: u64) -> StoreResult<bool> {
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        self.run("EXPIRE", |mut conn| async move { conn.expire(key, ttl).await })
            .await
    }

    async fn ping(&self) -> bool {
        let result = self
            .run("PING", |mut conn| async move {
                let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok(reply)
            })
            .await;

        match result {
            Ok(reply) => reply.eq_ignore_ascii_case("PONG"),
            Err(err) => {
                tracing::warn!(error = %err, "Store ping failed");
                false
            }
        }
    }
}
