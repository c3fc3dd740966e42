//! Trap sinks
//!
//! A publisher takes one assembled [`TrapRecord`] and delivers it somewhere.
//! Each publisher owns its own failure policy; the dispatcher only logs what
//! they report.

pub mod redis;
pub mod script;

use crate::trap::TrapRecord;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub use self::redis::{ChannelPublisher, ChannelSink, RedisSink, RetryPolicy};
pub use self::script::{ScriptOutput, ScriptPublisher, ScriptRunner, ShellRunner};

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Short name used in log lines
    fn name(&self) -> &str;

    /// Deliver one record
    async fn publish(&self, record: Arc<TrapRecord>) -> Result<()>;

    /// Release background resources. Called once on service shutdown.
    async fn shutdown(&self) {}
}
