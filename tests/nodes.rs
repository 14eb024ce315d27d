use weftflow::node::{
    indexed, ManyToOneNode, Node, OneToManyNode, OneToOneNode, PORT_ERR, PORT_IN, PORT_OUT,
};
use weftflow::packet::{Packet, Payload};
use weftflow::port::{InPort, OutPort};
use weftflow::process::Process;

/// An in-port that acknowledges every packet with the packet itself.
fn echo_sink() -> InPort {
    let port = InPort::new();
    port.add_init_hook({
        let port = port.clone();
        move |proc: &Process| {
            let reader = port.open(proc);
            tokio::spawn(async move {
                while let Some(pck) = reader.read().await {
                    reader.receive(pck);
                }
            });
        }
    });
    port
}

#[tokio::test]
async fn test_one_to_one_echo() {
    let node = OneToOneNode::new(|_: &Process, pck: Packet| (Some(pck), None));

    let producer = OutPort::new();
    producer.link(&node.in_port(PORT_IN).expect("in port"));

    let sink = echo_sink();
    node.out_port(PORT_OUT).expect("out port").link(&sink);

    let proc = Process::new();
    let writer = producer.open(&proc);

    let out = Packet::new(Payload::Str("x".into()));
    let back = writer.send(out.clone()).await;
    assert_eq!(back.payload(), out.payload());

    proc.exit(None);
    node.close().expect("close");
}

#[tokio::test]
async fn test_one_to_one_without_output_acks_immediately() {
    let node = OneToOneNode::new(|_: &Process, _: Packet| (None, None));

    let producer = OutPort::new();
    producer.link(&node.in_port(PORT_IN).expect("in port"));

    let proc = Process::new();
    let writer = producer.open(&proc);

    let back = writer.send(Packet::new(Payload::Int(1))).await;
    assert!(back.is_none());

    proc.exit(None);
    node.close().expect("close");
}

#[tokio::test]
async fn test_one_to_one_routes_errors() {
    let node = OneToOneNode::new(|_: &Process, _: Packet| (None, Some(Packet::error("rejected"))));

    let producer = OutPort::new();
    producer.link(&node.in_port(PORT_IN).expect("in port"));

    let sink = echo_sink();
    node.out_port(PORT_ERR).expect("error port").link(&sink);

    let proc = Process::new();
    let writer = producer.open(&proc);

    let back = writer.send(Packet::new(Payload::Int(1))).await;
    assert_eq!(back.payload().error_message(), Some("rejected"));

    proc.exit(None);
    node.close().expect("close");
}

#[tokio::test]
async fn test_one_to_one_error_bubbles_without_error_port() {
    let node = OneToOneNode::new(|_: &Process, _: Packet| (None, Some(Packet::error("rejected"))));

    let producer = OutPort::new();
    producer.link(&node.in_port(PORT_IN).expect("in port"));

    let proc = Process::new();
    let writer = producer.open(&proc);

    // No consumer on the error port: the error itself is the ack.
    let back = writer.send(Packet::new(Payload::Int(1))).await;
    assert_eq!(back.payload().error_message(), Some("rejected"));

    proc.exit(None);
    node.close().expect("close");
}

#[tokio::test]
async fn test_many_to_one_converges() {
    let node = ManyToOneNode::new(2, |_: &Process, inputs: Vec<Packet>| {
        let payloads = inputs.iter().map(|p| p.payload().clone()).collect();
        (Some(Packet::new(Payload::Seq(payloads))), None)
    });

    let left = OutPort::new();
    left.link(&node.in_port(&indexed(PORT_IN, 0)).expect("in[0]"));
    let right = OutPort::new();
    right.link(&node.in_port(&indexed(PORT_IN, 1)).expect("in[1]"));

    let sink = echo_sink();
    node.out_port(PORT_OUT).expect("out port").link(&sink);

    let proc = Process::new();
    let left_writer = left.open(&proc);
    let right_writer = right.open(&proc);

    assert_eq!(left_writer.write(Packet::new(Payload::Int(1))), 1);
    assert_eq!(right_writer.write(Packet::new(Payload::Int(2))), 1);

    let expected = Payload::Seq(vec![Payload::Int(1), Payload::Int(2)]);
    let back1 = left_writer.receive().await;
    let back2 = right_writer.receive().await;
    assert_eq!(back1.map(|p| p.payload().clone()), Some(expected.clone()));
    assert_eq!(back2.map(|p| p.payload().clone()), Some(expected));

    proc.exit(None);
    node.close().expect("close");
}

#[tokio::test]
async fn test_many_to_one_waits_for_all_inputs() {
    let node = ManyToOneNode::new(2, |_: &Process, _: Vec<Packet>| {
        (Some(Packet::new(Payload::Null)), None)
    });

    let left = OutPort::new();
    left.link(&node.in_port(&indexed(PORT_IN, 0)).expect("in[0]"));
    let right = OutPort::new();
    right.link(&node.in_port(&indexed(PORT_IN, 1)).expect("in[1]"));

    let proc = Process::new();
    let left_writer = left.open(&proc);

    assert_eq!(left_writer.write(Packet::new(Payload::Int(1))), 1);

    // Only one input arrived: the action must not have fired.
    let pending = tokio::time::timeout(
        std::time::Duration::from_millis(50),
        left_writer.receive(),
    )
    .await;
    assert!(pending.is_err());

    let right_writer = right.open(&proc);
    assert_eq!(right_writer.write(Packet::new(Payload::Int(2))), 1);

    assert!(left_writer.receive().await.is_some());
    assert!(right_writer.receive().await.is_some());

    proc.exit(None);
    node.close().expect("close");
}

#[tokio::test]
async fn test_one_to_many_routes_by_predicate() {
    // Route maps to out[0], everything else to out[1].
    let node = OneToManyNode::new(2, |_: &Process, pck: Packet| {
        let slot = match pck.payload() {
            Payload::Map(_) => 0,
            _ => 1,
        };
        let mut outs = vec![None, None];
        outs[slot] = Some(pck);
        (outs, None)
    });

    let producer = OutPort::new();
    producer.link(&node.in_port(PORT_IN).expect("in port"));

    let matched = echo_sink();
    node.out_port(&indexed(PORT_OUT, 0))
        .expect("out[0]")
        .link(&matched);

    let proc = Process::new();
    let writer = producer.open(&proc);

    let payload = Payload::Map(vec![("foo".into(), Payload::Str("bar".into()))]);
    let back = writer.send(Packet::new(payload.clone())).await;
    assert_eq!(back.payload(), &payload);

    proc.exit(None);
    node.close().expect("close");
}

#[tokio::test]
async fn test_one_to_many_merges_fanned_acks() {
    let node = OneToManyNode::new(2, |_: &Process, pck: Packet| {
        (vec![Some(pck.clone()), Some(pck)], None)
    });

    let producer = OutPort::new();
    producer.link(&node.in_port(PORT_IN).expect("in port"));

    for index in 0..2 {
        let sink = echo_sink();
        node.out_port(&indexed(PORT_OUT, index))
            .expect("out port")
            .link(&sink);
    }

    let proc = Process::new();
    let writer = producer.open(&proc);

    let back = writer.send(Packet::new(Payload::Int(5))).await;
    assert_eq!(
        back.payload(),
        &Payload::Seq(vec![Payload::Int(5), Payload::Int(5)])
    );

    proc.exit(None);
    node.close().expect("close");
}
