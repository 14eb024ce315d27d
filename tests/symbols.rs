use std::sync::{Arc, Mutex};

use uuid::Uuid;
use weftflow::hook::{HookError, LoadHook, UnloadHook};
use weftflow::node::{Node, OneToOneNode, PORT_IN, PORT_OUT};
use weftflow::packet::{Packet, Payload};
use weftflow::port::{InPort, OutPort};
use weftflow::process::Process;
use weftflow::spec::{PortAddr, Spec, DEFAULT_NAMESPACE};
use weftflow::symbol::{Symbol, Table, TableError, TableOptions};

fn echo_node() -> Arc<dyn Node> {
    Arc::new(OneToOneNode::new(|_: &Process, pck: Packet| {
        (Some(pck), None)
    }))
}

fn echo_symbol(name: &str, links_to: &[&str]) -> Symbol {
    let mut spec = Spec {
        id: Uuid::now_v7(),
        kind: "echo".into(),
        namespace: DEFAULT_NAMESPACE.into(),
        name: name.into(),
        ..Default::default()
    };
    if !links_to.is_empty() {
        spec.ports.insert(
            PORT_OUT.into(),
            links_to
                .iter()
                .map(|target| PortAddr {
                    name: (*target).into(),
                    port: PORT_IN.into(),
                    ..Default::default()
                })
                .collect(),
        );
    }
    Symbol::new(spec, echo_node())
}

fn recording_hooks(table_options: &mut TableOptions) -> Arc<Mutex<Vec<String>>> {
    let record = Arc::new(Mutex::new(Vec::new()));
    {
        let record = record.clone();
        table_options.load_hooks.push(Arc::new(move |sym: &Symbol| -> Result<(), HookError> {
            record.lock().unwrap().push(format!("load {}", sym.name()));
            Ok(())
        }) as Arc<dyn LoadHook>);
    }
    {
        let record = record.clone();
        table_options
            .unload_hooks
            .push(Arc::new(move |sym: &Symbol| -> Result<(), HookError> {
                record.lock().unwrap().push(format!("unload {}", sym.name()));
                Ok(())
            }) as Arc<dyn UnloadHook>);
    }
    record
}

#[test]
fn test_lookup_by_id_and_name() {
    let table = Table::default();
    let symbol = echo_symbol("echo", &[]);
    let id = symbol.id();

    table.insert(symbol).expect("insert");
    assert_eq!(table.keys(), vec![id]);
    assert_eq!(table.lookup(id).map(|s| s.id()), Some(id));
    assert_eq!(
        table
            .lookup_by_name(DEFAULT_NAMESPACE, "echo")
            .map(|s| s.id()),
        Some(id)
    );

    table.free(id).expect("free");
    assert!(table.lookup(id).is_none());
    assert!(table.lookup_by_name(DEFAULT_NAMESPACE, "echo").is_none());
}

#[test]
fn test_insert_rejects_nil_id() {
    let table = Table::default();
    let symbol = Symbol::new(Spec::default(), echo_node());
    assert!(matches!(table.insert(symbol), Err(TableError::NilId)));
}

#[test]
fn test_insert_rejects_name_collision() {
    let table = Table::default();
    table.insert(echo_symbol("taken", &[])).expect("insert");

    let err = table.insert(echo_symbol("taken", &[])).expect_err("collision");
    assert!(matches!(err, TableError::DuplicatedKey { name, .. } if name == "taken"));
}

#[tokio::test]
async fn test_pending_link_resolves_on_later_insert() {
    let table = Table::default();
    let source = echo_symbol("source", &["sink"]);
    let source_id = source.id();
    table.insert(source).expect("insert source");

    // Target not present yet: the link is pending and nothing flows.
    let producer = OutPort::new();
    let source_in = table
        .lookup(source_id)
        .and_then(|s| s.in_port(PORT_IN))
        .expect("source in");
    producer.link(&source_in);

    table.insert(echo_symbol("sink", &[])).expect("insert sink");

    // Now source.out is live-linked to sink.in; drive a packet through.
    let tap = InPort::new();
    tap.add_init_hook({
        let tap = tap.clone();
        move |proc: &Process| {
            let reader = tap.open(proc);
            tokio::spawn(async move {
                while let Some(pck) = reader.read().await {
                    reader.receive(pck);
                }
            });
        }
    });
    table
        .lookup_by_name(DEFAULT_NAMESPACE, "sink")
        .and_then(|s| s.out_port(PORT_OUT))
        .expect("sink out")
        .link(&tap);

    let proc = Process::new();
    let writer = producer.open(&proc);
    let back = writer.send(Packet::new(Payload::Str("ping".into()))).await;
    assert_eq!(back.payload(), &Payload::Str("ping".into()));

    proc.exit(None);
    table.close().expect("close");
}

#[test]
fn test_load_hooks_run_dependencies_first() {
    let mut options = TableOptions::default();
    let record = recording_hooks(&mut options);
    let table = Table::new(options);

    // source depends on sink; insert source first so it waits.
    table.insert(echo_symbol("source", &["sink"])).expect("insert");
    assert!(record.lock().unwrap().is_empty());

    table.insert(echo_symbol("sink", &[])).expect("insert");
    assert_eq!(
        *record.lock().unwrap(),
        vec!["load sink".to_string(), "load source".to_string()]
    );
}

#[test]
fn test_free_unloads_dependents_first() {
    let mut options = TableOptions::default();
    let record = recording_hooks(&mut options);
    let table = Table::new(options);

    table.insert(echo_symbol("sink", &[])).expect("insert");
    table.insert(echo_symbol("source", &["sink"])).expect("insert");
    record.lock().unwrap().clear();

    let sink_id = table
        .lookup_by_name(DEFAULT_NAMESPACE, "sink")
        .map(|s| s.id())
        .expect("sink");
    table.free(sink_id).expect("free");

    assert_eq!(
        *record.lock().unwrap(),
        vec!["unload source".to_string(), "unload sink".to_string()]
    );

    // The dependent stays inserted and reactivates when the dependency
    // returns.
    assert!(table.lookup_by_name(DEFAULT_NAMESPACE, "source").is_some());
    table.insert(echo_symbol("sink", &[])).expect("reinsert");
    assert_eq!(
        *record.lock().unwrap(),
        vec![
            "unload source".to_string(),
            "unload sink".to_string(),
            "load sink".to_string(),
            "load source".to_string(),
        ]
    );
}

#[test]
fn test_upsert_replaces_spec_and_refires_hooks() {
    let mut options = TableOptions::default();
    let record = recording_hooks(&mut options);
    let table = Table::new(options);

    let first = echo_symbol("a", &[]);
    let id = first.id();
    table.insert(first).expect("insert");

    let mut replacement_spec = Spec {
        id,
        kind: "snippet".into(),
        namespace: DEFAULT_NAMESPACE.into(),
        name: "a".into(),
        ..Default::default()
    };
    replacement_spec
        .fields
        .insert("code".into(), serde_json::json!("return input"));
    let replacement = Symbol::new(replacement_spec.clone(), echo_node());
    table.insert(replacement).expect("upsert");

    let held = table.lookup(id).expect("lookup");
    assert_eq!(held.spec(), &replacement_spec);
    assert_eq!(
        *record.lock().unwrap(),
        vec![
            "load a".to_string(),
            "unload a".to_string(),
            "load a".to_string(),
        ]
    );
}

#[test]
fn test_cycles_are_tolerated() {
    let mut options = TableOptions::default();
    let record = recording_hooks(&mut options);
    let table = Table::new(options);

    table.insert(echo_symbol("ping", &["pong"])).expect("insert");
    table.insert(echo_symbol("pong", &["ping"])).expect("insert");

    let loads = record.lock().unwrap().clone();
    assert_eq!(loads.len(), 2);
    assert!(loads.contains(&"load ping".to_string()));
    assert!(loads.contains(&"load pong".to_string()));
}

#[test]
fn test_close_frees_everything() {
    let mut options = TableOptions::default();
    let record = recording_hooks(&mut options);
    let table = Table::new(options);

    table.insert(echo_symbol("sink", &[])).expect("insert");
    table.insert(echo_symbol("source", &["sink"])).expect("insert");
    record.lock().unwrap().clear();

    table.close().expect("close");
    assert!(table.keys().is_empty());

    let unloads = record.lock().unwrap().clone();
    assert_eq!(
        unloads,
        vec!["unload source".to_string(), "unload sink".to_string()]
    );
}
