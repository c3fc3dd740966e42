//! External script publisher
//!
//! Records are queued on a bounded channel and consumed by a fixed pool of
//! workers. Each worker pipes the record's JSON into a fresh shell process
//! and logs whatever the process writes back. A full queue stalls the caller.

use super::Publisher;
use crate::trap::TrapRecord;
use anyhow::{anyhow, Context, Result};
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

const QUEUE_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Captured result of one script invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs the configured command once per record
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, input: &[u8]) -> Result<ScriptOutput>;
}

/// Runs `<shell> -c <command>` with the payload on stdin
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    command: String,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            command: command.into(),
        }
    }
}

#[async_trait]
impl ScriptRunner for ShellRunner {
    async fn run(&self, input: &[u8]) -> Result<ScriptOutput> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.command))?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(input).await?;
            }
            // stdin dropped here, the script sees EOF
            Ok::<(), std::io::Error>(())
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.context("Failed to wait for script")?;

        if let Err(e) = fed {
            // scripts are free to ignore their input
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e).context("Failed to write trap to script stdin");
            }
        }

        Ok(ScriptOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub struct ScriptPublisher {
    sender: Sender<Arc<TrapRecord>>,
    queue: Receiver<Arc<TrapRecord>>,
    capacity: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ScriptPublisher {
    /// Start `worker_count` shell workers. Must be called inside a tokio runtime.
    pub fn new(shell: &str, command: &str, worker_count: usize, capacity: usize) -> Self {
        Self::with_runner(Arc::new(ShellRunner::new(shell, command)), worker_count, capacity)
    }

    /// A `capacity` of zero is raised to one: the bounded channel has no
    /// rendezvous mode, so the smallest queue holds a single record.
    pub fn with_runner(runner: Arc<dyn ScriptRunner>, worker_count: usize, capacity: usize) -> Self {
        if capacity == 0 {
            warn!("Script queue size 0 is not supported, using 1");
        }
        let capacity = capacity.max(1);
        let (sender, queue) = async_channel::bounded(capacity);

        let workers: Vec<JoinHandle<()>> = (1..=worker_count)
            .map(|id| tokio::spawn(run_worker(id, Arc::clone(&runner), queue.clone())))
            .collect();

        let monitor = tokio::spawn(report_queue_depth(queue.clone(), capacity, QUEUE_REPORT_INTERVAL));

        info!("Script publisher started with {} worker(s), queue capacity {}", worker_count, capacity);

        Self {
            sender,
            queue,
            capacity,
            workers: Mutex::new(workers),
            monitor: Mutex::new(Some(monitor)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records waiting for a worker
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }
}

#[async_trait]
impl Publisher for ScriptPublisher {
    fn name(&self) -> &str {
        "script"
    }

    async fn publish(&self, record: Arc<TrapRecord>) -> Result<()> {
        if self.sender.is_full() {
            debug!("Script queue full ({}), waiting for a free slot", self.capacity);
        }
        self.sender
            .send(record)
            .await
            .map_err(|_| anyhow!("Script queue is closed"))
    }

    /// Stop accepting records, let the workers drain the queue, then join them
    async fn shutdown(&self) {
        self.sender.close();
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
        }

        let workers = std::mem::take(&mut *self.workers.lock().await);
        if !self.queue.is_empty() {
            info!("Draining {} queued trap(s) before shutdown", self.queue.len());
        }
        for handle in workers {
            if let Err(e) = handle.await {
                warn!("Script worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ScriptPublisher {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
    }
}

async fn run_worker(id: usize, runner: Arc<dyn ScriptRunner>, queue: Receiver<Arc<TrapRecord>>) {
    info!("Starting script worker {}", id);
    while let Ok(record) = queue.recv().await {
        if let Err(e) = execute(runner.as_ref(), &record).await {
            error!("Worker {}: script failed for trap from {}: {:#}", id, record.host, e);
        }
    }
    info!("Script worker {} stopped", id);
}

async fn execute(runner: &dyn ScriptRunner, record: &TrapRecord) -> Result<()> {
    let payload = record.to_json().context("Failed to serialise trap record")?;
    let output = runner.run(payload.as_bytes()).await?;

    if !output.stdout.trim().is_empty() {
        info!("script stdout: {}", output.stdout.trim_end());
    }
    if !output.stderr.trim().is_empty() {
        error!("script stderr: {}", output.stderr.trim_end());
    }

    if !output.success {
        match output.code {
            Some(code) => anyhow::bail!("script exited with status {}", code),
            None => anyhow::bail!("script terminated by signal"),
        }
    }
    Ok(())
}

async fn report_queue_depth(queue: Receiver<Arc<TrapRecord>>, capacity: usize, every: Duration) {
    let mut ticker = interval_at(Instant::now() + every, every);
    loop {
        ticker.tick().await;
        info!("queue size: {}, in queue {}", capacity, queue.len());
    }
}
