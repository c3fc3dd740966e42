//! Redis pub/sub publisher
//!
//! Publishes each trap as JSON on a Redis channel. A failed publish probes the
//! connection, reconnects when the probe fails and retries with a linearly
//! growing pause. Startup connection is a separate, patient loop.

use super::Publisher;
use crate::trap::TrapRecord;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Retry and reconnect timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// The pause after failed attempt `n` (counting from 0) is `n * backoff_step`,
    /// the last failure included
    pub backoff_step: Duration,
    /// Pause between startup connection attempts
    pub connect_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_step: Duration::from_secs(1),
            connect_interval: Duration::from_secs(5),
        }
    }
}

/// Connection to a pub/sub backend
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Health probe
    async fn ping(&self) -> Result<()>;

    /// Drop the current connection and open a new one
    async fn reconnect(&self) -> Result<()>;
}

/// [`ChannelSink`] backed by a multiplexed Redis connection
pub struct RedisSink {
    address: String,
    url: String,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisSink {
    pub fn new(address: &str, password: &str, database: i64) -> Self {
        let url = if password.is_empty() {
            format!("redis://{}/{}", address, database)
        } else {
            format!("redis://:{}@{}/{}", encode_userinfo(password), address, database)
        };

        Self {
            address: address.to_string(),
            url,
            connection: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<MultiplexedConnection> {
        let client = redis::Client::open(self.url.as_str())
            .with_context(|| format!("Invalid Redis address: {}", self.address))?;
        client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", self.address))
    }

    /// Current connection, opened lazily
    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }
        let connection = self.open().await?;
        *guard = Some(connection.clone());
        Ok(connection)
    }
}

#[async_trait]
impl ChannelSink for RedisSink {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut connection = self.connection().await?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut connection)
            .await
            .context("PUBLISH failed")?;
        debug!("Published to '{}', {} subscriber(s) received it", channel, receivers);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut connection = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .context("PING failed")?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        *guard = None;
        let connection = self.open().await?;
        *guard = Some(connection);
        Ok(())
    }
}

/// Publishes trap records on a single channel
pub struct ChannelPublisher<S = RedisSink> {
    sink: S,
    channel: String,
    policy: RetryPolicy,
}

impl<S: ChannelSink> ChannelPublisher<S> {
    pub fn new(sink: S, channel: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            sink,
            channel: channel.into(),
            policy,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Block until the sink answers a health probe.
    ///
    /// Retries every `connect_interval`. Without a deadline this never gives up.
    pub async fn try_connect(&self, deadline: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        loop {
            let attempt = match self.sink.reconnect().await {
                Ok(()) => self.sink.ping().await,
                Err(e) => Err(e),
            };

            match attempt {
                Ok(()) => {
                    info!("Connected to channel sink, publishing on '{}'", self.channel);
                    return Ok(());
                }
                Err(e) => {
                    info!("Connection to channel sink failed: {:#}", e);
                    if let Some(limit) = deadline {
                        if started.elapsed() + self.policy.connect_interval > limit {
                            return Err(e.context(format!(
                                "Channel sink unreachable after {}s",
                                limit.as_secs()
                            )));
                        }
                    }
                    sleep(self.policy.connect_interval).await;
                }
            }
        }
    }

    /// Publish an already serialised payload with bounded retries
    pub async fn publish_payload(&self, payload: &str) -> Result<()> {
        let mut retries: u32 = 0;
        loop {
            let failure = match self.sink.publish(&self.channel, payload).await {
                Ok(()) => {
                    if retries > 0 {
                        info!("Published to '{}' after {} retries", self.channel, retries);
                    }
                    return Ok(());
                }
                Err(e) => e,
            };

            warn!("Publish attempt {} to '{}' failed: {:#}", retries + 1, self.channel, failure);

            if let Err(probe) = self.sink.ping().await {
                debug!("Health probe failed ({:#}), reconnecting", probe);
                if let Err(e) = self.sink.reconnect().await {
                    warn!("Reconnect failed: {:#}", e);
                }
            }

            sleep(self.policy.backoff_step * retries).await;
            retries += 1;

            if retries > self.policy.max_retries {
                error!("Giving up on '{}' after {} attempts", self.channel, retries);
                return Err(failure.context(format!(
                    "Publish to channel '{}' failed after {} attempts",
                    self.channel, retries
                )));
            }
        }
    }
}

#[async_trait]
impl<S: ChannelSink + 'static> Publisher for ChannelPublisher<S> {
    fn name(&self) -> &str {
        "redis"
    }

    async fn publish(&self, record: Arc<TrapRecord>) -> Result<()> {
        let payload = record
            .to_json()
            .map_err(|e| anyhow!("Failed to serialise trap from {}: {}", record.host, e))?;
        self.publish_payload(&payload).await
    }
}

/// Percent-encode a URL userinfo component
fn encode_userinfo(raw: &str) -> String {
    raw.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => (b as char).to_string(),
            _ => format!("%{:02X}", b),
        })
        .collect()
}
