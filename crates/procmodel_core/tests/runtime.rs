use procmodel_core::db::open_db;
use procmodel_core::model::process::unix_now;
use procmodel_core::source::{ConsumerExit, ConsumerFailure, FatalHandler};
use procmodel_core::{
    start, Caller, CleanupReport, Collaborators, Permission, ProcessDocument, ProcessRepository,
    ServiceConfig, SqliteProcessRepository,
};
use std::sync::Arc;
use std::time::Duration;

fn no_fatal() -> FatalHandler {
    Arc::new(|failure: &ConsumerFailure| panic!("consumer failed: {failure}"))
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

fn local_config(database_path: String) -> ServiceConfig {
    ServiceConfig {
        database_path,
        permissions_url: "-".to_string(),
        cleanup_interval_secs: 0,
        ..ServiceConfig::default()
    }
}

#[tokio::test]
async fn local_authority_restart_keeps_stored_documents() {
    let dir = tempfile::tempdir().unwrap();
    let config = local_config(dir.path().join("store.sqlite3").display().to_string());
    let alice = Caller::new("alice", "token-alice");

    let first = start(
        &config,
        Collaborators::from_config(&config).await.unwrap(),
        no_fatal(),
    )
    .await
    .unwrap();
    let created = first
        .controller()
        .publish_create(&alice, ProcessDocument::new("", "Order handling"))
        .await
        .unwrap();
    let materializer = first.controller().materializer().clone();
    wait_until(|| materializer.exists(&created.id).unwrap()).await;
    assert_eq!(first.shutdown().await, vec![ConsumerExit::Closed]);
    drop(materializer);

    // Push the document past the cleanup grace window.
    let repo = SqliteProcessRepository::try_new(open_db(&config.database_path).unwrap()).unwrap();
    let mut stored = repo.get_process(&created.id).unwrap().unwrap();
    stored.last_updated_unix = unix_now() - 3600;
    repo.upsert_process(&stored).unwrap();
    drop(repo);

    let restarted = start(
        &config,
        Collaborators::from_config(&config).await.unwrap(),
        no_fatal(),
    )
    .await
    .unwrap();
    let report = restarted.reconciler().cleanup().await.unwrap();

    assert_eq!(report, CleanupReport::default());
    let read = restarted
        .controller()
        .read_process(&alice, &created.id, Permission::Read)
        .await
        .unwrap();
    assert_eq!(read.owner, "alice");
    restarted.shutdown().await;
}
