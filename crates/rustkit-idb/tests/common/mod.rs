#![allow(dead_code)]

use rustkit_idb::{
    ConnectionId, CursorDirection, IDBFactory, RequestId, Result, Source, TransactionMode,
    UpgradeContext,
};
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::rc::Rc;

/// Log to the test writer when `RUST_LOG` is set.
pub fn init_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Open `name` at `version`, running `upgrade` if needed, and return the connection.
pub fn open_db<F>(factory: &mut IDBFactory, name: &str, version: u64, upgrade: F) -> ConnectionId
where
    F: FnOnce(&mut IDBFactory, UpgradeContext) -> Result<()> + 'static,
{
    let request = factory.open(name, Some(version)).unwrap();
    factory.on_upgrade_needed(request, upgrade);
    factory.run_until_idle();
    factory
        .result(request)
        .unwrap()
        .as_connection()
        .expect("open should yield a connection")
}

/// Every value of `store`, in key order.
pub fn read_all(factory: &mut IDBFactory, connection: ConnectionId, store: &str) -> Vec<JsonValue> {
    let txn = factory
        .transaction(connection, &[store], TransactionMode::ReadOnly)
        .unwrap();
    let handle = factory.object_store(txn, store).unwrap();
    let request = factory.get_all(&handle, None, None).unwrap();
    factory.run_until_idle();
    factory.result(request).unwrap().as_values().unwrap().to_vec()
}

/// Record `(key, primary key)` pairs for every step of a cursor request.
pub fn record_cursor(factory: &mut IDBFactory, request: RequestId) -> Rc<RefCell<Vec<(JsonValue, JsonValue)>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    factory.on_success(request, move |f, req| {
        if let Some(cursor) = f.result(req)?.as_cursor() {
            let c = f.cursor(cursor)?;
            let entry = (
                c.key().map(|k| k.to_json()).unwrap_or(JsonValue::Null),
                c.primary_key().map(|k| k.to_json()).unwrap_or(JsonValue::Null),
            );
            sink.borrow_mut().push(entry);
            f.continue_cursor(cursor, None)?;
        }
        Ok(())
    });
    seen
}

/// Walk `source` in `direction` and return the visited pairs.
pub fn walk(
    factory: &mut IDBFactory,
    source: impl Into<Source>,
    direction: CursorDirection,
) -> Vec<(JsonValue, JsonValue)> {
    let request = factory.open_cursor(source, None, direction).unwrap();
    let seen = record_cursor(factory, request);
    factory.run_until_idle();
    let result = seen.borrow().clone();
    result
}
