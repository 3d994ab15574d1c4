use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::log::{LogConsumer, LogError, LogMessage, RetryPolicy};

/// Lifecycle of a long-running consume loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Idle,
    Reading,
    /// Waiting on the log for the next message.
    Suspended,
    TerminatedEof,
    TerminatedError,
    Cancelled,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::TerminatedEof | StageState::TerminatedError | StageState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The log signalled it has no more data.
    Eof,
    Cancelled,
    Failed(LogError),
}

impl StageOutcome {
    fn state(&self) -> StageState {
        match self {
            StageOutcome::Eof => StageState::TerminatedEof,
            StageOutcome::Cancelled => StageState::Cancelled,
            StageOutcome::Failed(_) => StageState::TerminatedError,
        }
    }
}

/// Per-message work of a stage. An error ends the stage.
#[async_trait]
pub trait StageHandler: Send {
    async fn handle(&mut self, msg: &LogMessage) -> Result<(), LogError>;
}

/// Drives a consumer through a handler until EOF, failure or cancellation.
pub struct StageRunner {
    name: &'static str,
    retry: RetryPolicy,
    cancel: CancellationToken,
    state: watch::Sender<StageState>,
}

impl StageRunner {
    pub fn new(name: &'static str, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(StageState::Idle);
        Self {
            name,
            retry,
            cancel,
            state,
        }
    }

    pub fn state(&self) -> StageState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<StageState> {
        self.state.subscribe()
    }

    fn set(&self, s: StageState) {
        let prev = self.state.send_replace(s);
        if prev != s {
            debug!(stage = self.name, from = ?prev, to = ?s, "stage state");
        }
    }

    /// Runs the consume loop. The only place the loop waits on the log is
    /// `recv`, and that is also where cancellation is observed.
    #[tracing::instrument(level = "info", skip_all, fields(stage = self.name))]
    pub async fn run<H: StageHandler>(
        &self,
        consumer: &mut dyn LogConsumer,
        handler: &mut H,
    ) -> StageOutcome {
        self.set(StageState::Reading);
        info!("stage started");
        let mut failures = 0u32;
        let outcome = loop {
            self.set(StageState::Suspended);
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break StageOutcome::Cancelled,
                r = consumer.recv() => r,
            };
            self.set(StageState::Reading);

            let msg = match received {
                Ok(m) => {
                    failures = 0;
                    m
                }
                Err(LogError::Closed) => break StageOutcome::Eof,
                Err(e) if e.is_transient() && failures < self.retry.max_retries => {
                    failures += 1;
                    let delay = self.retry.backoff(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "consume failed; retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break StageOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                Err(e) => break StageOutcome::Failed(e),
            };

            debug!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                "message read"
            );
            if let Err(e) = handler.handle(&msg).await {
                break StageOutcome::Failed(e);
            }
        };

        match &outcome {
            StageOutcome::Eof => info!("log closed; stage finished"),
            StageOutcome::Cancelled => info!("stage cancelled"),
            StageOutcome::Failed(e) => error!(error = %e, "stage terminated"),
        }
        self.set(outcome.state());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogClient, MemoryLog, TopicSpec};
    use std::time::Duration;

    struct Collect(Vec<String>);

    #[async_trait]
    impl StageHandler for Collect {
        async fn handle(&mut self, msg: &LogMessage) -> Result<(), LogError> {
            self.0.push(msg.text().into_owned());
            Ok(())
        }
    }

    struct FailOnSecond(usize);

    #[async_trait]
    impl StageHandler for FailOnSecond {
        async fn handle(&mut self, _msg: &LogMessage) -> Result<(), LogError> {
            self.0 += 1;
            if self.0 == 2 {
                Err(LogError::Fatal("produce failed".into()))
            } else {
                Ok(())
            }
        }
    }

    /// Yields scripted results, then reports closed.
    struct Scripted(Vec<Result<LogMessage, LogError>>);

    #[async_trait]
    impl LogConsumer for Scripted {
        async fn recv(&mut self) -> Result<LogMessage, LogError> {
            if self.0.is_empty() {
                Err(LogError::Closed)
            } else {
                self.0.remove(0)
            }
        }
    }

    fn msg(text: &str) -> LogMessage {
        LogMessage {
            topic: "t".into(),
            partition: 0,
            offset: 0,
            key: None,
            payload: text.as_bytes().to_vec(),
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
        }
    }

    async fn memory_topic() -> MemoryLog {
        let log = MemoryLog::new();
        log.create_topic_if_absent(&TopicSpec::new("t", 1, 1))
            .await
            .unwrap();
        log
    }

    #[tokio::test]
    async fn runs_until_log_closes() {
        let log = memory_topic().await;
        log.produce("t", b"1", b"one").await.unwrap();
        log.produce("t", b"2", b"two").await.unwrap();
        log.close_topic("t").unwrap();

        let runner = StageRunner::new("test", quick_retry(), CancellationToken::new());
        let mut consumer = log.subscribe("t", "g").await.unwrap();
        let mut handler = Collect(Vec::new());
        let outcome = runner.run(consumer.as_mut(), &mut handler).await;

        assert_eq!(outcome, StageOutcome::Eof);
        assert_eq!(handler.0, vec!["one", "two"]);
        assert_eq!(runner.state(), StageState::TerminatedEof);
    }

    #[tokio::test]
    async fn cancellation_ends_a_suspended_stage() {
        let log = memory_topic().await;
        let cancel = CancellationToken::new();
        let runner = StageRunner::new("test", quick_retry(), cancel.clone());
        let mut states = runner.watch_state();
        let mut consumer = log.subscribe("t", "g").await.unwrap();

        let task = tokio::spawn(async move {
            let mut handler = Collect(Vec::new());
            runner.run(consumer.as_mut(), &mut handler).await
        });

        states
            .wait_for(|s| *s == StageState::Suspended)
            .await
            .unwrap();
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("stage stops promptly")
            .unwrap();
        assert_eq!(outcome, StageOutcome::Cancelled);
    }

    #[tokio::test]
    async fn transient_consume_errors_are_retried() {
        let mut consumer = Scripted(vec![
            Err(LogError::Transient("rebalance".into())),
            Ok(msg("a")),
            Err(LogError::Transient("rebalance".into())),
            Err(LogError::Transient("rebalance".into())),
            Ok(msg("b")),
        ]);
        let runner = StageRunner::new("test", quick_retry(), CancellationToken::new());
        let mut handler = Collect(Vec::new());
        let outcome = runner.run(&mut consumer, &mut handler).await;
        assert_eq!(outcome, StageOutcome::Eof);
        assert_eq!(handler.0, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn persistent_consume_errors_terminate() {
        let mut consumer = Scripted(vec![
            Err(LogError::Transient("down".into())),
            Err(LogError::Transient("down".into())),
            Err(LogError::Transient("down".into())),
            Ok(msg("never")),
        ]);
        let runner = StageRunner::new("test", quick_retry(), CancellationToken::new());
        let mut handler = Collect(Vec::new());
        let outcome = runner.run(&mut consumer, &mut handler).await;
        assert_eq!(
            outcome,
            StageOutcome::Failed(LogError::Transient("down".into()))
        );
        assert!(handler.0.is_empty());
        assert_eq!(runner.state(), StageState::TerminatedError);
    }

    #[tokio::test]
    async fn fatal_consume_error_terminates_immediately() {
        let mut consumer = Scripted(vec![Err(LogError::Fatal("auth".into())), Ok(msg("x"))]);
        let runner = StageRunner::new("test", quick_retry(), CancellationToken::new());
        let outcome = runner.run(&mut consumer, &mut Collect(Vec::new())).await;
        assert_eq!(outcome, StageOutcome::Failed(LogError::Fatal("auth".into())));
    }

    #[tokio::test]
    async fn handler_failure_terminates() {
        let mut consumer = Scripted(vec![Ok(msg("a")), Ok(msg("b")), Ok(msg("c"))]);
        let runner = StageRunner::new("test", quick_retry(), CancellationToken::new());
        let mut handler = FailOnSecond(0);
        let outcome = runner.run(&mut consumer, &mut handler).await;
        assert!(matches!(outcome, StageOutcome::Failed(_)));
        assert_eq!(handler.0, 2);
    }

    #[test]
    fn terminal_states() {
        assert!(!StageState::Idle.is_terminal());
        assert!(!StageState::Suspended.is_terminal());
        assert!(StageState::TerminatedEof.is_terminal());
        assert!(StageState::Cancelled.is_terminal());
    }
}
