use async_trait::async_trait;
use procmodel_core::db::open_db_in_memory;
use procmodel_core::source::log::{CommandLog, LogReader, LogRecord};
use procmodel_core::source::{
    CommandConsumer, CommandProducer, ConsumerExit, ConsumerFailure, FatalHandler, HandlerError,
    Listener, MemoryCommandLog, RecordHandler, RetryPolicy,
};
use procmodel_core::{
    shutdown_channel, start, ApplyOutcome, Caller, Collaborators, Command, InMemoryAuthority,
    Materializer, ProcessDocument, ProcessRepository, ServiceConfig, ServiceHandle,
    SqliteProcessRepository,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const TOPIC: &str = "processmodel";
const GROUP: &str = "process-model-repository";

fn sqlite_repo() -> Arc<SqliteProcessRepository> {
    Arc::new(SqliteProcessRepository::try_new(open_db_in_memory().unwrap()).unwrap())
}

fn counting_fatal() -> (FatalHandler, Arc<AtomicU32>) {
    let count = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&count);
    let fatal: FatalHandler = Arc::new(move |_: &ConsumerFailure| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (fatal, count)
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn next_command(reader: &mut Box<dyn LogReader>) -> (Command, LogRecord) {
    let record = reader.fetch().await.unwrap().unwrap();
    let command = Command::decode(&record.value).unwrap().unwrap();
    (command, record)
}

#[test]
fn applying_the_same_command_twice_converges() {
    let repo = sqlite_repo();
    let materializer = Materializer::new(repo.clone());
    let put = Command::put(
        "alice",
        ProcessDocument {
            last_updated_unix: 42,
            ..ProcessDocument::new("p1", "A")
        },
    );

    assert_eq!(materializer.apply(&put).unwrap(), ApplyOutcome::Upserted);
    let first = repo.get_process("p1").unwrap().unwrap();
    assert_eq!(materializer.apply(&put).unwrap(), ApplyOutcome::Upserted);
    assert_eq!(repo.get_process("p1").unwrap().unwrap(), first);

    let delete = Command::delete("p1", "alice");
    assert_eq!(materializer.apply(&delete).unwrap(), ApplyOutcome::Deleted);
    assert_eq!(
        materializer.apply(&delete).unwrap(),
        ApplyOutcome::AlreadyAbsent
    );
}

#[tokio::test]
async fn redelivery_after_crash_keeps_per_id_order() {
    let log = MemoryCommandLog::new(4);
    let producer = CommandProducer::new(Arc::new(log.clone()), TOPIC, false);
    producer
        .publish_put("alice", ProcessDocument::new("p1", "A"))
        .await
        .unwrap();
    producer
        .publish_put("alice", ProcessDocument::new("p1", "B"))
        .await
        .unwrap();
    let repo = sqlite_repo();
    let materializer = Materializer::new(repo.clone());

    let mut crashed = log.subscribe(GROUP, TOPIC).await.unwrap();
    let (first, first_record) = next_command(&mut crashed).await;
    materializer.apply(&first).unwrap();
    crashed.commit(&first_record).await.unwrap();
    let (second, _) = next_command(&mut crashed).await;
    materializer.apply(&second).unwrap();
    drop(crashed);

    let mut restarted = log.subscribe(GROUP, TOPIC).await.unwrap();
    let (redelivered, record) = next_command(&mut restarted).await;
    assert_eq!(record.offset, 1);
    assert_eq!(redelivered, second);
    materializer.apply(&redelivered).unwrap();
    restarted.commit(&record).await.unwrap();

    assert_eq!(repo.get_process("p1").unwrap().unwrap().name, "B");
    assert_eq!(
        log.committed_offset(GROUP, TOPIC, log.partition_for(b"p1")),
        Some(2)
    );
}

struct Service {
    log: MemoryCommandLog,
    repo: Arc<SqliteProcessRepository>,
    authority: Arc<InMemoryAuthority>,
    handle: ServiceHandle,
    fatal_count: Arc<AtomicU32>,
}

async fn start_service() -> Service {
    let config = ServiceConfig {
        cleanup_interval_secs: 0,
        ..ServiceConfig::default()
    };
    let log = MemoryCommandLog::new(config.memory_log_partitions);
    let repo = sqlite_repo();
    let authority = Arc::new(InMemoryAuthority::new());
    let (fatal, fatal_count) = counting_fatal();
    let collaborators = Collaborators {
        repo: repo.clone(),
        authority: authority.clone(),
        log: Arc::new(log.clone()),
    };
    let handle = start(&config, collaborators, fatal).await.unwrap();
    assert!(authority.is_topic_registered(TOPIC));
    Service {
        log,
        repo,
        authority,
        handle,
        fatal_count,
    }
}

#[tokio::test]
async fn put_put_delete_ends_with_nothing_stored() {
    let service = start_service().await;
    let producer = CommandProducer::new(Arc::new(service.log.clone()), TOPIC, false);
    producer
        .publish_put("alice", ProcessDocument::new("p1", "A"))
        .await
        .unwrap();
    producer
        .publish_put("alice", ProcessDocument::new("p1", "B"))
        .await
        .unwrap();
    producer.publish_delete("p1", "alice").await.unwrap();

    let partition = service.log.partition_for(b"p1");
    let log = service.log.clone();
    wait_until(|| log.committed_offset(GROUP, TOPIC, partition) == Some(3)).await;

    assert!(service.repo.get_process("p1").unwrap().is_none());
    assert!(service.authority.resource_ids(TOPIC).is_empty());
    assert_eq!(service.handle.shutdown().await, vec![ConsumerExit::Closed]);
    assert_eq!(service.fatal_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn controller_writes_become_visible_after_consumption() {
    let service = start_service().await;
    let alice = Caller::new("alice", "token-alice");
    let controller = Arc::clone(service.handle.controller());

    let created = controller
        .publish_create(&alice, ProcessDocument::new("", "Order handling"))
        .await
        .unwrap();
    let repo = service.repo.clone();
    let id = created.id.clone();
    wait_until(|| repo.get_process(&id).unwrap().is_some()).await;
    assert!(service.authority.resource_ids(TOPIC).contains(&id));

    let mut change = created.clone();
    change.name = "Order fulfilment".to_string();
    controller.publish_update(&alice, &id, change).await.unwrap();
    wait_until(|| {
        repo.get_process(&id)
            .unwrap()
            .is_some_and(|stored| stored.name == "Order fulfilment")
    })
    .await;

    controller.publish_delete(&alice, &id).await.unwrap();
    wait_until(|| repo.get_process(&id).unwrap().is_none()).await;
    let authority = Arc::clone(&service.authority);
    wait_until(|| authority.resource_ids(TOPIC).is_empty()).await;

    assert_eq!(service.handle.shutdown().await, vec![ConsumerExit::Closed]);
}

/// Fails the first `failures` calls, then succeeds.
struct ScriptedHandler {
    failures: u32,
    calls: AtomicU32,
}

impl ScriptedHandler {
    fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordHandler for ScriptedHandler {
    async fn handle(&self, _value: &[u8]) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(HandlerError::apply(format!("scripted failure {call}")));
        }
        Ok(())
    }
}

async fn log_with_one_record() -> MemoryCommandLog {
    let log = MemoryCommandLog::new(1);
    CommandProducer::new(Arc::new(log.clone()), TOPIC, false)
        .publish_put("alice", ProcessDocument::new("p1", "A"))
        .await
        .unwrap();
    log
}

fn consumer(
    handler: Arc<dyn RecordHandler>,
    window: Duration,
    fatal: FatalHandler,
) -> CommandConsumer {
    let listener = Listener {
        topic: TOPIC.to_string(),
        handler,
    };
    let policy = RetryPolicy {
        base_unit: Duration::from_secs(1),
        window,
    };
    CommandConsumer::new(listener, GROUP, policy, fatal)
}

#[tokio::test(start_paused = true)]
async fn persistent_failure_escalates_once_without_commit() {
    let log = log_with_one_record().await;
    let handler = ScriptedHandler::failing(u32::MAX);
    let (fatal, fatal_count) = counting_fatal();
    let (_trigger, signal) = shutdown_channel();

    let exit = consumer(handler.clone(), Duration::from_secs(10), fatal)
        .spawn(Arc::new(log.clone()), signal)
        .await
        .unwrap();

    assert_eq!(exit, ConsumerExit::Fatal);
    assert_eq!(fatal_count.load(Ordering::SeqCst), 1);
    assert_eq!(handler.calls(), 4);
    assert_eq!(log.committed_offset(GROUP, TOPIC, 0), None);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_and_commits() {
    let log = log_with_one_record().await;
    let handler = ScriptedHandler::failing(2);
    let (fatal, fatal_count) = counting_fatal();
    let (trigger, signal) = shutdown_channel();

    let task = consumer(handler.clone(), Duration::from_secs(600), fatal)
        .spawn(Arc::new(log.clone()), signal);
    let committed = log.clone();
    wait_until(|| committed.committed_offset(GROUP, TOPIC, 0) == Some(1)).await;
    trigger.trigger();

    assert_eq!(task.await.unwrap(), ConsumerExit::Closed);
    assert_eq!(handler.calls(), 3);
    assert_eq!(fatal_count.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_backoff_abandons_the_record() {
    let log = log_with_one_record().await;
    let handler = ScriptedHandler::failing(u32::MAX);
    let (fatal, fatal_count) = counting_fatal();
    let (trigger, signal) = shutdown_channel();

    let task = consumer(handler.clone(), Duration::from_secs(600), fatal)
        .spawn(Arc::new(log.clone()), signal);
    let scripted = Arc::clone(&handler);
    wait_until(|| scripted.calls() >= 1).await;
    trigger.trigger();

    assert_eq!(task.await.unwrap(), ConsumerExit::Closed);
    assert_eq!(fatal_count.load(Ordering::SeqCst), 0);
    assert_eq!(log.committed_offset(GROUP, TOPIC, 0), None);
}

/// Parks inside `handle` until released.
struct SlowHandler {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl RecordHandler for SlowHandler {
    async fn handle(&self, _value: &[u8]) -> Result<(), HandlerError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_lets_the_in_flight_record_finish_and_commit() {
    let log = log_with_one_record().await;
    let handler = Arc::new(SlowHandler {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let (fatal, fatal_count) = counting_fatal();
    let (trigger, signal) = shutdown_channel();

    let task = consumer(handler.clone(), Duration::from_secs(10), fatal)
        .spawn(Arc::new(log.clone()), signal);
    handler.entered.notified().await;
    trigger.trigger();
    handler.release.notify_one();

    assert_eq!(task.await.unwrap(), ConsumerExit::Closed);
    assert_eq!(log.committed_offset(GROUP, TOPIC, 0), Some(1));
    assert_eq!(fatal_count.load(Ordering::SeqCst), 0);
}
