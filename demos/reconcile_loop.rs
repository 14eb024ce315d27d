//! Keeps a live symbol table in sync with its stores.
//!
//! A spec binds an environment slot from a named value. After the initial
//! load, the demo starts the reconcile loop, then updates the value and
//! inserts a second spec while the loop is running; both changes surface
//! in the symbol table without another explicit `load`.
//!
//! Running:
//! ```bash
//! cargo run --example reconcile_loop
//! ```

use std::sync::Arc;
use std::time::Duration;

use miette::{miette, Result};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use weftflow::node::{Node, OneToOneNode};
use weftflow::packet::Packet;
use weftflow::process::Process;
use weftflow::runtime::{Config, Runtime};
use weftflow::scheme::{Scheme, SchemeError};
use weftflow::spec::{Spec, ValueRef, DEFAULT_NAMESPACE};
use weftflow::store::Store;
use weftflow::value::Value;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("filter");
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn echo_scheme() -> Arc<Scheme> {
    let scheme = Scheme::new();
    scheme.add_codec("echo", |_: &Spec| -> Result<Box<dyn Node>, SchemeError> {
        Ok(Box::new(OneToOneNode::new(
            |_: &Process, pck: Packet| (Some(pck), None),
        )))
    });
    Arc::new(scheme)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let spec_store: Store<Spec> = Store::new();
    let value_store: Store<Value> = Store::new();

    let greeting = Value {
        id: Uuid::now_v7(),
        namespace: DEFAULT_NAMESPACE.into(),
        name: "greeting".into(),
        data: json!("hello"),
    };
    value_store
        .insert(vec![greeting.clone()])
        .map_err(|err| miette!("seed value: {err}"))?;

    let mut bound = Spec {
        id: Uuid::now_v7(),
        kind: "echo".into(),
        namespace: DEFAULT_NAMESPACE.into(),
        name: "bound".into(),
        ..Default::default()
    };
    bound.env.insert(
        "message".into(),
        vec![ValueRef {
            name: "greeting".into(),
            ..Default::default()
        }],
    );
    bound.fields.insert("text".into(), json!("{{ message }}"));
    spec_store
        .insert(vec![bound])
        .map_err(|err| miette!("seed spec: {err}"))?;

    let runtime = Arc::new(Runtime::new(Config {
        scheme: Some(echo_scheme()),
        spec_store: Some(spec_store.clone()),
        value_store: Some(value_store.clone()),
        ..Default::default()
    }));
    runtime
        .load(None)
        .map_err(|err| miette!("load: {err}"))?;

    let render = |runtime: &Runtime| {
        runtime
            .table()
            .lookup_by_name(DEFAULT_NAMESPACE, "bound")
            .map(|s| s.spec().fields["text"].clone())
    };
    info!(text = ?render(&runtime), "after initial load");

    runtime.watch();
    let worker = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.reconcile().await })
    };

    info!("updating the bound value while the loop runs");
    let mut updated = greeting;
    updated.data = json!("goodbye");
    value_store
        .update(vec![updated])
        .map_err(|err| miette!("update value: {err}"))?;
    settle().await;
    info!(text = ?render(&runtime), "after value change");

    info!("inserting a second spec while the loop runs");
    let late = Spec {
        id: Uuid::now_v7(),
        kind: "echo".into(),
        namespace: DEFAULT_NAMESPACE.into(),
        name: "late".into(),
        ..Default::default()
    };
    spec_store
        .insert(vec![late])
        .map_err(|err| miette!("insert spec: {err}"))?;
    settle().await;
    info!(symbols = runtime.table().keys().len(), "after spec insert");

    runtime
        .close()
        .map_err(|err| miette!("close: {err}"))?;
    worker
        .await
        .map_err(|err| miette!("join: {err}"))?
        .map_err(|err| miette!("reconcile: {err}"))?;
    info!("reconcile loop ended cleanly");
    Ok(())
}
