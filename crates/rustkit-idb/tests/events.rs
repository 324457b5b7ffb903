//! The observational event channel.

mod common;

use common::{init_tracing, open_db};
use rustkit_idb::{EngineConfig, IDBEvent, IDBFactory, KeyPath, TransactionMode};
use serde_json::json;

#[tokio::test]
async fn test_events_follow_lifecycle() {
    init_tracing();
    let (mut factory, mut rx) = IDBFactory::new(EngineConfig::default());

    let connection = open_db(&mut factory, "app", 1, |f, ctx| {
        f.create_object_store(ctx.transaction, "kv", KeyPath::None, false)?;
        Ok(())
    });
    let txn = factory
        .transaction(connection, &["kv"], TransactionMode::ReadWrite)
        .unwrap();
    let kv = factory.object_store(txn, "kv").unwrap();
    factory.put(&kv, json!("v"), Some("k".into())).unwrap();
    factory.abort(txn).unwrap();
    factory.run_until_idle();

    factory.close(connection);
    factory.delete_database("app").unwrap();
    factory.run_until_idle();
    drop(factory);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert!(matches!(
        &events[0],
        IDBEvent::UpgradeNeeded { db_name, old_version: 0, new_version: 1 } if db_name == "app"
    ));
    assert!(matches!(&events[1], IDBEvent::TransactionComplete { .. }));
    assert!(matches!(&events[2], IDBEvent::Success { .. }));
    assert!(matches!(
        &events[3],
        IDBEvent::TransactionAbort { transaction, error: None, .. } if *transaction == txn
    ));
    assert_eq!(
        events[4],
        IDBEvent::Deleted {
            db_name: "app".into()
        }
    );
    assert_eq!(events.len(), 5);
}

#[tokio::test]
async fn test_blocked_open_reports_version_change() {
    init_tracing();
    let (mut factory, mut rx) = IDBFactory::new(EngineConfig::default());
    let connection = open_db(&mut factory, "app", 1, |_, _| Ok(()));
    while rx.try_recv().is_ok() {}

    let request = factory.open("app", Some(2)).unwrap();
    factory.run_until_idle();
    assert!(factory.result(request).is_err());

    assert_eq!(
        rx.recv().await,
        Some(IDBEvent::VersionChange {
            db_name: "app".into(),
            connection,
            old_version: 1,
            new_version: Some(2),
        })
    );
    assert_eq!(
        rx.recv().await,
        Some(IDBEvent::Blocked {
            db_name: "app".into(),
            old_version: 1,
            new_version: Some(2),
        })
    );

    factory.close(connection);
    factory.run_until_idle();
    assert!(matches!(
        rx.recv().await,
        Some(IDBEvent::UpgradeNeeded { old_version: 1, new_version: 2, .. })
    ));
}
