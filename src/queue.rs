//! Batching publish queue.
//!
//! [`PublishQueue`] accumulates statements from any number of producers and
//! ships them to a [`StatementPublisher`] as one batch, either when the batch
//! reaches `publish.max_payload` or when `publish.max_wait_ms` has elapsed
//! since the first statement entered an empty batch.
//!
//! # Locking
//!
//! All state sits behind one async mutex. `push` holds it only for the
//! append; `publish` holds it for the whole attempt, network calls included,
//! so at most one publish body runs per queue. A size-triggered publish and
//! a timer that fired just before may both reach `publish`; whichever comes
//! second finds an empty batch and returns without calling the store.
//!
//! # Failure handling
//!
//! Inside one `publish`:
//!
//! - connection-class errors retry the identical sequence immediately until
//!   `publish.max_retries` consecutive failures have been seen, then the
//!   queue halts and raises its fatal signal;
//! - a storage rejection removes exactly the named statement and retries the
//!   rest;
//! - anything else halts the queue.
//!
//! The batch is cleared and the deadline timer cancelled at the end of every
//! publish, whatever happened. Nothing is carried over to a later batch.

use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::config::PublishConfig;
use crate::errors::{BridgeError, PublishError, Result};
use crate::lrs::StatementPublisher;
use crate::models::Statement;

struct QueueState {
    pending: Vec<Statement>,
    timer: Option<AbortHandle>,
    retries: u32,
    total_published: u64,
    benchmark_logged: bool,
    halted: Option<String>,
}

pub struct PublishQueue {
    state: Mutex<QueueState>,
    publisher: Arc<dyn StatementPublisher>,
    settings: PublishConfig,
    fatal_tx: watch::Sender<Option<String>>,
    this: Weak<PublishQueue>,
}

impl PublishQueue {
    pub fn new(publisher: Arc<dyn StatementPublisher>, settings: PublishConfig) -> Arc<Self> {
        let (fatal_tx, _) = watch::channel(None);
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                timer: None,
                retries: 0,
                total_published: 0,
                benchmark_logged: false,
                halted: None,
            }),
            publisher,
            settings,
            fatal_tx,
            this: this.clone(),
        })
    }

    /// Receiver that turns `Some(reason)` once the queue hits a fatal error,
    /// including failures of timer-triggered publishes.
    pub fn fatal_signal(&self) -> watch::Receiver<Option<String>> {
        self.fatal_tx.subscribe()
    }

    /// Append a statement, arming the deadline timer on the first one and
    /// publishing immediately once the batch is full.
    pub async fn push(&self, statement: Statement) -> Result<()> {
        let batch_full = {
            let mut state = self.state.lock().await;
            if let Some(reason) = &state.halted {
                return Err(BridgeError::QueueHalted(reason.clone()));
            }
            state.pending.push(statement);

            let max_wait = self.settings.max_wait();
            if state.pending.len() == 1 && !max_wait.is_zero() {
                if let Some(stale) = state.timer.replace(self.arm_timer()) {
                    stale.abort();
                }
            }
            state.pending.len() >= self.settings.max_payload
        };

        if batch_full {
            self.publish().await?;
        }
        Ok(())
    }

    fn arm_timer(&self) -> AbortHandle {
        let queue = self.this.clone();
        let wait = self.settings.max_wait();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(queue) = queue.upgrade() else {
                return;
            };
            debug!(wait_ms = wait.as_millis() as u64, "max wait elapsed, publishing");
            if let Err(e) = queue.publish().await {
                error!("timed publish failed: {}", e);
            }
        })
        .abort_handle()
    }

    /// Publish everything pending as one batch. Returns how many statements
    /// the store accepted; an empty batch is a no-op returning 0.
    pub async fn publish(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.halted {
            return Err(BridgeError::QueueHalted(reason.clone()));
        }

        let batch = std::mem::take(&mut state.pending);
        let outcome = self.publish_batch(&mut state, batch).await;

        state.pending.clear();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        if let Err(e) = &outcome {
            let reason = e.to_string();
            error!("publish queue halted: {}", reason);
            state.halted = Some(reason.clone());
            self.fatal_tx.send_replace(Some(reason));
        }
        outcome
    }

    async fn publish_batch(
        &self,
        state: &mut QueueState,
        mut remaining: Vec<Statement>,
    ) -> Result<usize> {
        let mut attempts = 0u32;

        while !remaining.is_empty() {
            attempts += 1;
            match self.publisher.publish_statements(&remaining).await {
                Ok(()) => {
                    state.retries = 0;
                    state.total_published += remaining.len() as u64;
                    info!(
                        batch = remaining.len(),
                        total = state.total_published,
                        "{} statements published successfully",
                        state.total_published
                    );
                    self.log_benchmark(state);
                    return Ok(remaining.len());
                }
                Err(e) if e.is_connection_class() => {
                    if state.retries < self.settings.max_retries {
                        state.retries += 1;
                        warn!(
                            retry = state.retries,
                            max_retries = self.settings.max_retries,
                            "publish failed, retrying: {}",
                            e
                        );
                    } else {
                        state.retries = 0;
                        return Err(BridgeError::RetriesExhausted {
                            attempts,
                            source: e,
                        });
                    }
                }
                Err(PublishError::Storage {
                    statement_id,
                    message,
                }) => {
                    let Some(pos) = remaining.iter().position(|s| s.id == statement_id) else {
                        return Err(BridgeError::UnknownRejection { statement_id });
                    };
                    let rejected = remaining.remove(pos);
                    warn!(
                        "Removing rejected statement and retrying publishing batch. \
                         Rejected statement was {}. LRS message was {}",
                        rejected.to_json(),
                        message
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        debug!(attempts, "every statement in the batch was rejected");
        Ok(0)
    }

    fn log_benchmark(&self, state: &mut QueueState) {
        let benchmark = self.settings.benchmark_statements;
        if benchmark > 0 && !state.benchmark_logged && state.total_published >= benchmark {
            state.benchmark_logged = true;
            info!(
                benchmark,
                "published {} or more statements at {}",
                benchmark,
                Utc::now().to_rfc3339()
            );
        }
    }

    /// Flush what is pending, cancel the timer and refuse further pushes.
    pub async fn close(&self) -> Result<usize> {
        let flushed = match self.publish().await {
            Err(BridgeError::QueueHalted(_)) => Ok(0),
            other => other,
        };

        let mut state = self.state.lock().await;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if state.halted.is_none() {
            state.halted = Some("queue closed".to_string());
        }
        flushed
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn total_published(&self) -> u64 {
        self.state.lock().await.total_published
    }
}

impl Drop for PublishQueue {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lrs::LrsAbout;
    use crate::models::{Activity, Agent, Verb, XAPI_VERSION};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use uuid::Uuid;

    /// Publisher that answers from a script, then falls back to a default.
    #[derive(Default)]
    struct ScriptedPublisher {
        script: StdMutex<VecDeque<std::result::Result<(), PublishError>>>,
        always_unreachable: bool,
        calls: StdMutex<Vec<Vec<Uuid>>>,
    }

    impl ScriptedPublisher {
        fn with_script(script: Vec<std::result::Result<(), PublishError>>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.into()),
                ..Default::default()
            })
        }

        fn unreachable() -> Arc<Self> {
            Arc::new(Self {
                always_unreachable: true,
                ..Default::default()
            })
        }

        fn calls(&self) -> Vec<Vec<Uuid>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatementPublisher for ScriptedPublisher {
        async fn publish_statements(
            &self,
            statements: &[Statement],
        ) -> std::result::Result<(), PublishError> {
            self.calls
                .lock()
                .unwrap()
                .push(statements.iter().map(|s| s.id).collect());
            if self.always_unreachable {
                return Err(PublishError::Connection("connection refused".into()));
            }
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn about(&self) -> std::result::Result<LrsAbout, PublishError> {
            Ok(LrsAbout {
                versions: vec![XAPI_VERSION.to_string()],
                raw: serde_json::Value::Null,
            })
        }
    }

    fn statement(n: usize) -> Statement {
        Statement {
            id: Uuid::new_v4(),
            actor: Agent::new(&format!("learner{}", n), "https://lms.example.com"),
            verb: Verb::new("http://adlnet.gov/expapi/verbs/experienced", "experienced"),
            object: Activity::reference(format!("https://lms.example.com/xblock/{}", n)),
            result: None,
            context: None,
            timestamp: Utc::now(),
            version: XAPI_VERSION.to_string(),
        }
    }

    fn settings(max_payload: usize, max_wait_ms: u64, max_retries: u32) -> PublishConfig {
        PublishConfig {
            max_payload,
            max_wait_ms,
            max_retries,
            benchmark_statements: 0,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn full_batch_publishes_in_push_order() {
        let publisher = ScriptedPublisher::with_script(vec![]);
        let queue = PublishQueue::new(publisher.clone(), settings(3, 0, 3));

        let batch: Vec<Statement> = (0..3).map(statement).collect();
        let ids: Vec<Uuid> = batch.iter().map(|s| s.id).collect();
        for s in batch {
            queue.push(s).await.unwrap();
        }

        assert_eq!(publisher.calls(), vec![ids]);
        assert_eq!(queue.pending_len().await, 0);
        assert_eq!(queue.total_published().await, 3);
    }

    #[tokio::test]
    async fn below_threshold_without_timer_waits_for_flush() {
        let publisher = ScriptedPublisher::with_script(vec![]);
        let queue = PublishQueue::new(publisher.clone(), settings(5, 0, 3));

        queue.push(statement(0)).await.unwrap();
        queue.push(statement(1)).await.unwrap();
        assert!(publisher.calls().is_empty());
        assert_eq!(queue.pending_len().await, 2);

        assert_eq!(queue.publish().await.unwrap(), 2);
        assert_eq!(publisher.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_publishes_partial_batch() {
        let publisher = ScriptedPublisher::with_script(vec![]);
        let queue = PublishQueue::new(publisher.clone(), settings(10, 1_000, 3));

        queue.push(statement(0)).await.unwrap();
        queue.push(statement(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(999)).await;
        settle().await;
        assert!(publisher.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(publisher.calls().len(), 1);
        assert_eq!(publisher.calls()[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn size_trigger_suppresses_deadline() {
        let publisher = ScriptedPublisher::with_script(vec![]);
        let queue = PublishQueue::new(publisher.clone(), settings(2, 1_000, 3));

        queue.push(statement(0)).await.unwrap();
        queue.push(statement(1)).await.unwrap();
        assert_eq!(publisher.calls().len(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(publisher.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_rearms_for_next_batch() {
        let publisher = ScriptedPublisher::with_script(vec![]);
        let queue = PublishQueue::new(publisher.clone(), settings(10, 500, 3));

        queue.push(statement(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(publisher.calls().len(), 1);

        queue.push(statement(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(publisher.calls().len(), 2);
    }

    #[tokio::test]
    async fn rejected_statement_is_dropped_and_rest_retried() {
        let batch: Vec<Statement> = (0..4).map(statement).collect();
        let ids: Vec<Uuid> = batch.iter().map(|s| s.id).collect();
        let rejected = ids[2];

        let publisher = ScriptedPublisher::with_script(vec![Err(PublishError::Storage {
            statement_id: rejected,
            message: "invalid verb".into(),
        })]);
        let queue = PublishQueue::new(publisher.clone(), settings(4, 0, 3));
        for s in batch {
            queue.push(s).await.unwrap();
        }

        let calls = publisher.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], ids);
        assert_eq!(calls[1], vec![ids[0], ids[1], ids[3]]);
        assert_eq!(queue.total_published().await, 3);

        // the rejected statement never comes back
        let next: Vec<Statement> = (4..8).map(statement).collect();
        for s in next {
            queue.push(s).await.unwrap();
        }
        let calls = publisher.calls();
        assert_eq!(calls.len(), 3);
        assert!(!calls[2].contains(&rejected));
    }

    #[tokio::test]
    async fn batch_emptied_by_rejections_is_abandoned() {
        let only = statement(0);
        let publisher = ScriptedPublisher::with_script(vec![Err(PublishError::Storage {
            statement_id: only.id,
            message: "bad".into(),
        })]);
        let queue = PublishQueue::new(publisher.clone(), settings(1, 0, 3));

        queue.push(only).await.unwrap();
        assert_eq!(publisher.calls().len(), 1);
        assert_eq!(queue.total_published().await, 0);
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn connection_errors_exhaust_retries_then_halt() {
        let publisher = ScriptedPublisher::unreachable();
        let queue = PublishQueue::new(publisher.clone(), settings(1, 0, 2));
        let fatal = queue.fatal_signal();

        let err = queue.push(statement(0)).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(publisher.calls().len(), 3);
        assert!(fatal.borrow().is_some());

        assert!(matches!(
            queue.push(statement(1)).await,
            Err(BridgeError::QueueHalted(_))
        ));
        assert_eq!(publisher.calls().len(), 3);
    }

    #[tokio::test]
    async fn success_resets_retry_budget() {
        let unreachable = || Err(PublishError::Connection("timeout".into()));
        let publisher = ScriptedPublisher::with_script(vec![
            unreachable(),
            unreachable(),
            Ok(()),
            unreachable(),
            unreachable(),
            Ok(()),
        ]);
        let queue = PublishQueue::new(publisher.clone(), settings(1, 0, 2));

        queue.push(statement(0)).await.unwrap();
        queue.push(statement(1)).await.unwrap();
        assert_eq!(publisher.calls().len(), 6);
        assert_eq!(queue.total_published().await, 2);
    }

    #[tokio::test]
    async fn auth_failure_counts_as_connection_class() {
        let publisher = ScriptedPublisher::with_script(vec![
            Err(PublishError::Auth {
                status: 401,
                message: "bad key".into(),
            }),
            Ok(()),
        ]);
        let queue = PublishQueue::new(publisher.clone(), settings(1, 0, 1));
        queue.push(statement(0)).await.unwrap();
        assert_eq!(publisher.calls().len(), 2);
    }

    #[tokio::test]
    async fn unexpected_error_is_fatal() {
        let publisher = ScriptedPublisher::with_script(vec![Err(PublishError::Unexpected {
            status: 418,
            message: "teapot".into(),
        })]);
        let queue = PublishQueue::new(publisher.clone(), settings(1, 0, 5));
        let err = queue.push(statement(0)).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Publish(PublishError::Unexpected { status: 418, .. })
        ));
        assert_eq!(publisher.calls().len(), 1);
        assert!(queue.fatal_signal().borrow().is_some());
    }

    #[tokio::test]
    async fn rejection_of_unknown_statement_is_fatal() {
        let publisher = ScriptedPublisher::with_script(vec![Err(PublishError::Storage {
            statement_id: Uuid::new_v4(),
            message: "?".into(),
        })]);
        let queue = PublishQueue::new(publisher.clone(), settings(1, 0, 5));
        assert!(matches!(
            queue.push(statement(0)).await,
            Err(BridgeError::UnknownRejection { .. })
        ));
    }

    #[tokio::test]
    async fn empty_publish_is_a_no_op() {
        let publisher = ScriptedPublisher::with_script(vec![]);
        let queue = PublishQueue::new(publisher.clone(), settings(5, 0, 3));
        assert_eq!(queue.publish().await.unwrap(), 0);
        assert!(publisher.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_flushes_and_cancels_timer() {
        let publisher = ScriptedPublisher::with_script(vec![]);
        let queue = PublishQueue::new(publisher.clone(), settings(10, 1_000, 3));

        queue.push(statement(0)).await.unwrap();
        assert_eq!(queue.close().await.unwrap(), 1);
        assert_eq!(publisher.calls().len(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(publisher.calls().len(), 1);
        assert!(matches!(
            queue.push(statement(1)).await,
            Err(BridgeError::QueueHalted(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_publish_failure_raises_fatal_signal() {
        let publisher = ScriptedPublisher::unreachable();
        let queue = PublishQueue::new(publisher.clone(), settings(10, 100, 0));
        let mut fatal = queue.fatal_signal();

        queue.push(statement(0)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), fatal.changed())
            .await
            .expect("fatal signal")
            .unwrap();
        assert!(fatal.borrow().is_some());
        assert_eq!(publisher.calls().len(), 1);
    }
}
