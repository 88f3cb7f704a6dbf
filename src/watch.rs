//! Watch sessions and the supervisor loop that restarts them.
//!
//! A [`WatchSession`] pairs one [`LogTailer`] with one [`PublishQueue`]. It
//! polls the tailer for change notifications, dispatches appended records
//! through the [`Converter`] and pushes the statements into its queue.
//!
//! ```text
//!            ┌──────────── identity lost ────────────┐
//!            ▼                                       │
//!   open session ──▶ RUNNING ──▶ teardown (flush) ───┘
//!                       │
//!                       ├── shutdown ──▶ teardown (flush) ──▶ Ok
//!                       └── fatal ─────▶ teardown ──────────▶ Err
//! ```
//!
//! The [`Supervisor`] runs sessions in a loop. Teardown always closes the
//! session's queue (flush, then cancel its timer) before a new session is
//! opened, and a new session shares nothing with the old one but the path.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{Config, PublishConfig};
use crate::converter::Converter;
use crate::errors::{BridgeError, Result};
use crate::lrs::StatementPublisher;
use crate::queue::PublishQueue;
use crate::tailer::{FileChange, IdentityLoss, LogTailer};

/// Why a session ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    IdentityLost(IdentityLoss),
    Shutdown,
}

pub struct WatchSession {
    tailer: LogTailer,
    queue: Arc<PublishQueue>,
    converter: Arc<Converter>,
    poll_interval: Duration,
}

impl WatchSession {
    pub fn open(
        path: &Path,
        converter: Arc<Converter>,
        publisher: Arc<dyn StatementPublisher>,
        publish: PublishConfig,
        poll_interval: Duration,
    ) -> Result<Self> {
        let tailer = LogTailer::open(path)?;
        Ok(Self {
            tailer,
            queue: PublishQueue::new(publisher, publish),
            converter,
            poll_interval,
        })
    }

    pub fn queue(&self) -> &Arc<PublishQueue> {
        &self.queue
    }

    /// Run until the file's identity is lost, shutdown is requested, or a
    /// fatal error occurs. The queue is closed on every path out.
    pub async fn run(mut self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd> {
        let outcome = self.watch(shutdown).await;

        match outcome {
            Ok(end) => {
                let flushed = self.queue.close().await?;
                debug!(flushed, "watch session closed");
                Ok(end)
            }
            Err(e) => {
                if let Err(close_err) = self.queue.close().await {
                    error!("failed to flush queue on fatal exit: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn watch(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd> {
        let mut fatal = self.queue.fatal_signal();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tailer.check()? {
                        FileChange::Unchanged => {}
                        FileChange::Modified => {
                            self.dispatch_appended().await?;
                        }
                        FileChange::Lost(loss) => {
                            // whatever reached the old file before the loss is still ours
                            self.dispatch_appended().await?;
                            info!(path = %self.tailer.path().display(), "{}", loss);
                            return Ok(SessionEnd::IdentityLost(loss));
                        }
                    }
                }
                changed = fatal.changed() => {
                    let reason = match changed {
                        Ok(()) => fatal.borrow().clone(),
                        Err(_) => None,
                    };
                    if let Some(reason) = reason {
                        return Err(BridgeError::QueueHalted(reason));
                    }
                }
                _ = shutdown_requested(shutdown) => {
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    /// Handle one modification notification: read, convert, push.
    /// Returns the number of statements pushed.
    pub async fn dispatch_appended(&mut self) -> Result<usize> {
        let records = self.tailer.read_records()?;
        let mut pushed = 0;
        for record in &records {
            for statement in self.converter.convert(record) {
                self.queue.push(statement).await?;
                pushed += 1;
            }
        }
        if !records.is_empty() {
            debug!(records = records.len(), statements = pushed, "dispatched");
        }
        Ok(pushed)
    }
}

/// Resolves once `true` is sent or every sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Restarts watch sessions on the same path until shutdown or a fatal error.
pub struct Supervisor {
    path: PathBuf,
    converter: Arc<Converter>,
    publisher: Arc<dyn StatementPublisher>,
    publish: PublishConfig,
    poll_interval: Duration,
}

impl Supervisor {
    pub fn new(path: PathBuf, config: &Config, publisher: Arc<dyn StatementPublisher>) -> Self {
        Self {
            path,
            converter: Arc::new(Converter::from_config(config)),
            publisher,
            publish: config.publish.clone(),
            poll_interval: config.tailer.poll_interval(),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            info!(path = %self.path.display(), "starting watch");
            let Some(session) = self.open_session(&mut shutdown).await? else {
                info!("exiting watch");
                return Ok(());
            };

            match session.run(&mut shutdown).await? {
                SessionEnd::IdentityLost(loss) => {
                    info!(reason = %loss, "stopping watch and restarting");
                }
                SessionEnd::Shutdown => {
                    info!("exiting watch");
                    return Ok(());
                }
            }
        }
    }

    /// Open a session, waiting for the path to reappear if rotation left it
    /// missing. Returns `None` when shutdown is requested while waiting.
    async fn open_session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<WatchSession>> {
        let mut waiting = false;
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }
            match WatchSession::open(
                &self.path,
                self.converter.clone(),
                self.publisher.clone(),
                self.publish.clone(),
                self.poll_interval,
            ) {
                Ok(session) => return Ok(Some(session)),
                Err(BridgeError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                    if !waiting {
                        warn!(path = %self.path.display(), "tracking log missing, waiting for it to appear");
                        waiting = true;
                    }
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown_requested(shutdown) => return Ok(None),
            }
        }
    }
}
