//! Sequential fetch → apply → commit loop for one (topic, group).
//!
//! # Responsibility
//! - Drive a [`RecordHandler`] over every record of a topic.
//! - Commit read positions only after a successful apply.
//! - Escalate unrecoverable failures through the injected fatal handler.
//!
//! # Invariants
//! - At most one record is in flight per consumer.
//! - A record whose handling never succeeded is never committed past.
//! - The fatal handler runs at most once per consumer, after which the task stops.
//! - Shutdown lets an in-flight handler call finish; a pending backoff sleep is
//!   abandoned without commit.

use crate::lifecycle::ShutdownSignal;
use crate::source::listener::{HandlerError, Listener, RecordHandler};
use crate::source::log::{CommandLog, LogError, LogRecord};
use crate::source::retry::{retry, RetryOutcome, RetryPolicy};
use log::{debug, error, info, warn};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Escalation hook for failures the consumer cannot recover from.
pub type FatalHandler = Arc<dyn Fn(&ConsumerFailure) + Send + Sync>;

/// Unrecoverable consumer failure handed to the fatal handler.
#[derive(Debug)]
pub enum ConsumerFailure {
    Subscribe {
        topic: String,
        error: LogError,
    },
    Fetch {
        topic: String,
        error: LogError,
    },
    Handler {
        topic: String,
        partition: i32,
        offset: i64,
        attempts: u32,
        error: HandlerError,
    },
}

impl Display for ConsumerFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribe { topic, error } => {
                write!(f, "unable to subscribe to `{topic}`: {error}")
            }
            Self::Fetch { topic, error } => write!(f, "unable to fetch from `{topic}`: {error}"),
            Self::Handler {
                topic,
                partition,
                offset,
                attempts,
                error,
            } => write!(
                f,
                "giving up on `{topic}` partition {partition} offset {offset} after {attempts} attempts: {error}"
            ),
        }
    }
}

/// Terminal state of a consumer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    /// Shutdown was requested.
    Closed,
    /// The log reported closure.
    LogClosed,
    /// The fatal handler was invoked.
    Fatal,
}

/// One consumer bound to a (topic, group) pair.
pub struct CommandConsumer {
    topic: String,
    group_id: String,
    handler: Arc<dyn RecordHandler>,
    policy: RetryPolicy,
    fatal: FatalHandler,
    debug: bool,
}

impl CommandConsumer {
    pub fn new(
        listener: Listener,
        group_id: impl Into<String>,
        policy: RetryPolicy,
        fatal: FatalHandler,
    ) -> Self {
        Self {
            topic: listener.topic,
            group_id: group_id.into(),
            handler: listener.handler,
            policy,
            fatal,
            debug: false,
        }
    }

    /// Logs every fetched record at debug level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn spawn(
        self,
        log: Arc<dyn CommandLog>,
        shutdown: ShutdownSignal,
    ) -> JoinHandle<ConsumerExit> {
        tokio::spawn(self.run(log, shutdown))
    }

    pub async fn run(self, log: Arc<dyn CommandLog>, mut shutdown: ShutdownSignal) -> ConsumerExit {
        let mut reader = match log.subscribe(&self.group_id, &self.topic).await {
            Ok(reader) => reader,
            Err(error) => {
                return self.escalate(ConsumerFailure::Subscribe {
                    topic: self.topic.clone(),
                    error,
                })
            }
        };
        info!(
            "event=consumer_start module=source status=ok topic={} group={}",
            self.topic, self.group_id
        );

        loop {
            let fetched = tokio::select! {
                biased;
                _ = shutdown.requested() => return self.stopped(ConsumerExit::Closed),
                fetched = reader.fetch() => fetched,
            };
            let record = match fetched {
                Ok(Some(record)) => record,
                Ok(None) => return self.stopped(ConsumerExit::LogClosed),
                Err(error) => {
                    return self.escalate(ConsumerFailure::Fetch {
                        topic: self.topic.clone(),
                        error,
                    })
                }
            };
            if self.debug {
                debug!(
                    "event=record_fetch module=source status=ok topic={} partition={} offset={} key={}",
                    record.topic,
                    record.partition,
                    record.offset,
                    record.key_str()
                );
            }

            let handler = &self.handler;
            let value = record.value.as_slice();
            match retry(&self.policy, &mut shutdown, || handler.handle(value)).await {
                RetryOutcome::Succeeded { .. } => {
                    if let Err(err) = reader.commit(&record).await {
                        // Redelivery of an applied record is harmless.
                        error!(
                            "event=record_commit module=source status=error topic={} partition={} offset={} error={}",
                            record.topic, record.partition, record.offset, err
                        );
                    }
                }
                RetryOutcome::Interrupted { last_error, .. } => {
                    warn!(
                        "event=record_abandon module=source status=error topic={} partition={} offset={} error={}",
                        record.topic, record.partition, record.offset, last_error
                    );
                    return self.stopped(ConsumerExit::Closed);
                }
                RetryOutcome::Exhausted {
                    attempts,
                    last_error,
                } => {
                    return self.escalate(handler_failure(&record, attempts, last_error));
                }
            }
        }
    }

    fn escalate(&self, failure: ConsumerFailure) -> ConsumerExit {
        error!(
            "event=consumer_fatal module=source status=error topic={} group={} error={}",
            self.topic, self.group_id, failure
        );
        (self.fatal)(&failure);
        ConsumerExit::Fatal
    }

    fn stopped(&self, exit: ConsumerExit) -> ConsumerExit {
        info!(
            "event=consumer_stop module=source status=ok topic={} group={} exit={:?}",
            self.topic, self.group_id, exit
        );
        exit
    }
}

fn handler_failure(record: &LogRecord, attempts: u32, error: HandlerError) -> ConsumerFailure {
    ConsumerFailure::Handler {
        topic: record.topic.clone(),
        partition: record.partition,
        offset: record.offset,
        attempts,
        error,
    }
}
