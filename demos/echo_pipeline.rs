//! Builds a two-node pipeline from declarative specs and drives one
//! request-scoped process through it.
//!
//! The spec store seeds two `snippet` specs linked by name; `Runtime::load`
//! compiles them into live symbols and wires `first.out → second.in`. A
//! producer port then opens a writer for a fresh process, writes a packet,
//! and blocks until the acknowledgement has travelled the whole causal
//! path back.
//!
//! Running:
//! ```bash
//! cargo run --example echo_pipeline
//! ```

use std::sync::Arc;

use miette::{miette, Result};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use weftflow::node::{Node, OneToOneNode, PORT_IN, PORT_OUT};
use weftflow::packet::{Packet, Payload};
use weftflow::port::{InPort, OutPort};
use weftflow::process::Process;
use weftflow::runtime::{Config, Runtime};
use weftflow::scheme::{Scheme, SchemeError};
use weftflow::spec::{PortAddr, Spec, DEFAULT_NAMESPACE};
use weftflow::store::Store;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("filter");
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn snippet_scheme() -> Arc<Scheme> {
    let scheme = Scheme::new();
    scheme.add_codec("snippet", |spec: &Spec| -> Result<Box<dyn Node>, SchemeError> {
        let prefix = spec
            .fields
            .get("prefix")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(Box::new(OneToOneNode::new(
            move |_: &Process, pck: Packet| {
                let rendered = format!("{prefix}{}", pck.payload());
                (Some(Packet::new(Payload::Str(rendered))), None)
            },
        )))
    });
    Arc::new(scheme)
}

fn snippet_spec(name: &str, prefix: &str) -> Spec {
    let mut spec = Spec {
        id: Uuid::now_v7(),
        kind: "snippet".into(),
        namespace: DEFAULT_NAMESPACE.into(),
        name: name.into(),
        ..Default::default()
    };
    spec.fields.insert("prefix".into(), json!(prefix));
    spec
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("seeding the spec store");
    let spec_store: Store<Spec> = Store::new();
    let mut first = snippet_spec("first", "first: ");
    first.ports.insert(
        PORT_OUT.into(),
        vec![PortAddr {
            name: "second".into(),
            port: PORT_IN.into(),
            ..Default::default()
        }],
    );
    let second = snippet_spec("second", "second: ");
    spec_store
        .insert(vec![first, second])
        .map_err(|err| miette!("seed failed: {err}"))?;

    info!("loading symbols");
    let runtime = Runtime::new(Config {
        scheme: Some(snippet_scheme()),
        spec_store: Some(spec_store),
        ..Default::default()
    });
    runtime
        .load(None)
        .map_err(|err| miette!("load failed: {err}"))?;
    info!(symbols = runtime.table().keys().len(), "table ready");

    // Wire an entry point into `first` and a sink behind `second`.
    let producer = OutPort::new();
    let entry = runtime
        .table()
        .lookup_by_name(DEFAULT_NAMESPACE, "first")
        .and_then(|s| s.in_port(PORT_IN))
        .ok_or_else(|| miette!("first.in missing"))?;
    producer.link(&entry);

    let sink = InPort::new();
    sink.add_init_hook({
        let sink = sink.clone();
        move |proc: &Process| {
            let reader = sink.open(proc);
            tokio::spawn(async move {
                while let Some(pck) = reader.read().await {
                    info!(payload = %pck.payload(), "sink observed");
                    reader.receive(pck);
                }
            });
        }
    });
    runtime
        .table()
        .lookup_by_name(DEFAULT_NAMESPACE, "second")
        .and_then(|s| s.out_port(PORT_OUT))
        .ok_or_else(|| miette!("second.out missing"))?
        .link(&sink);

    info!("driving one request through the pipeline");
    let proc = Process::new();
    let writer = producer.open(&proc);
    let back = writer.send(Packet::new(Payload::Str("hello".into()))).await;
    info!(ack = %back.payload(), "producer acknowledged");

    proc.exit(None);
    proc.join().await;
    runtime
        .close()
        .map_err(|err| miette!("close failed: {err}"))?;
    Ok(())
}
