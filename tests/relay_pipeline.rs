mod common;

use common::{oid, tlv, v2c_trap, varbind, GatedPublisher, SpyPublisher};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use trap_relay::config::ListenConfig;
use trap_relay::{
    decode_packet, DispatchOutcome, Dispatcher, FieldType, FieldValue, Publisher, ScriptPublisher,
    SnmpListener,
};

const SYS_DESCR: &str = "1.3.6.1.2.1.1.1.0";
const SYS_UPTIME: &str = "1.3.6.1.2.1.1.3.0";
const SNMP_TRAP_OID: &str = "1.3.6.1.6.3.1.1.4.1.0";

fn sample_trap(community: &str) -> Vec<u8> {
    v2c_trap(
        community,
        &[
            varbind(SYS_UPTIME, 0x43, &[0x00, 0x98, 0x96, 0x80]),
            varbind(SNMP_TRAP_OID, 0x06, &oid("1.3.6.1.6.3.1.1.5.3")),
            varbind(SYS_DESCR, 0x04, &[0x68, 0x69]),
        ],
    )
}

fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[tokio::test]
async fn test_octet_string_and_oid_binding_end_to_end() {
    let datagram = v2c_trap(
        "public",
        &[
            varbind(SYS_DESCR, 0x04, &[0x68, 0x69]),
            varbind(SNMP_TRAP_OID, 0x06, &oid("1.3.6.1.6.3.1.1.4.1.0")),
        ],
    );

    let spy = Arc::new(SpyPublisher::default());
    let mut dispatcher = Dispatcher::new("public");
    dispatcher.add_publisher(spy.clone());

    let packet = decode_packet(&datagram).unwrap();
    let outcome = dispatcher.dispatch(&packet, localhost()).await;
    assert_eq!(outcome, DispatchOutcome::Delivered { attempted: 1, failed: 0 });

    let records = spy.records.lock().unwrap();
    let record = &records[0];
    let field = &record.fields[SYS_DESCR];
    assert_eq!(field.kind, FieldType::OctetString);
    assert_eq!(field.value, Some(FieldValue::Text("hi".to_string())));
    assert_eq!(field.hex.as_deref(), Some("68:69"));
    assert_eq!(record.object_identifier, "1.3.6.1.6.3.1.1.4.1.0");
    assert!(!record.fields.contains_key(SNMP_TRAP_OID));
    assert_eq!(record.version, "2c");
    assert_eq!(record.host, "127.0.0.1");
}

#[tokio::test]
async fn test_time_ticks_are_lifted() {
    let spy = Arc::new(SpyPublisher::default());
    let mut dispatcher = Dispatcher::new("");
    dispatcher.add_publisher(spy.clone());

    let packet = decode_packet(&sample_trap("public")).unwrap();
    dispatcher.dispatch(&packet, localhost()).await;

    let records = spy.records.lock().unwrap();
    assert_eq!(records[0].time_ticks, 10_000_000);
    assert_eq!(records[0].object_identifier, "1.3.6.1.6.3.1.1.5.3");
    assert_eq!(records[0].fields.len(), 1);
    assert!(!records[0].fields.contains_key(SYS_UPTIME));
}

#[tokio::test]
async fn test_listener_relays_datagrams_and_drops_wrong_community() {
    let spy = Arc::new(SpyPublisher::default());
    let mut dispatcher = Dispatcher::new("public");
    dispatcher.add_publisher(spy.clone());

    let listener = Arc::new(SnmpListener::new(
        ListenConfig {
            address: "127.0.0.1:0".to_string(),
            community: "public".to_string(),
            max_packet_size: 8192,
            max_in_flight: 16,
        },
        Arc::new(dispatcher),
    ));
    let socket = listener.bind().await.unwrap();
    let target = socket.local_addr().unwrap();
    let server = tokio::spawn(Arc::clone(&listener).serve(socket));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&sample_trap("private"), target).await.unwrap();
    client.send_to(b"\x30\x03garbage", target).await.unwrap();
    client.send_to(&sample_trap("public"), target).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), spy.notify.notified())
        .await
        .expect("trap was not relayed");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(spy.count(), 1);
    assert_eq!(spy.records.lock().unwrap()[0].community, "public");
    server.abort();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_stalled_publisher_caps_in_flight_dispatches() {
    let gated = Arc::new(GatedPublisher::closed());
    let mut dispatcher = Dispatcher::new("public");
    dispatcher.add_publisher(gated.clone());

    let listener = Arc::new(SnmpListener::new(
        ListenConfig {
            address: "127.0.0.1:0".to_string(),
            community: "public".to_string(),
            max_packet_size: 8192,
            max_in_flight: 2,
        },
        Arc::new(dispatcher),
    ));
    let socket = listener.bind().await.unwrap();
    let target = socket.local_addr().unwrap();
    let server = tokio::spawn(Arc::clone(&listener).serve(socket));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for _ in 0..10 {
        client.send_to(&sample_trap("public"), target).await.unwrap();
    }

    wait_until(|| gated.entered() == 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gated.entered(), 2);
    assert_eq!(listener.in_flight(), 2);

    // the backlog waited in the socket and drains once the sink recovers
    gated.gate.add_permits(10);
    wait_until(|| gated.entered() == 10).await;
    wait_until(|| listener.in_flight() == 0).await;
    server.abort();
}

#[tokio::test]
async fn test_script_publisher_keeps_going_after_failing_command() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("traps.jsonl");
    let command = format!("cat >> '{}'; echo >> '{}'; exit 1", out.display(), out.display());

    let publisher = Arc::new(ScriptPublisher::new("/bin/sh", &command, 1, 4));
    let mut dispatcher = Dispatcher::new("public");
    dispatcher.add_publisher(publisher.clone());

    let packet = decode_packet(&sample_trap("public")).unwrap();
    for _ in 0..3 {
        let outcome = dispatcher.dispatch(&packet, localhost()).await;
        assert_eq!(outcome, DispatchOutcome::Delivered { attempted: 1, failed: 0 });
    }
    dispatcher.shutdown().await;

    let written = std::fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = written.lines().filter(|l| !l.is_empty()).collect();
    assert_eq!(lines.len(), 3);
    for line in lines {
        let json: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(json["timeticks"], 10_000_000);
        assert_eq!(json["data"][SYS_DESCR]["hex"], "68:69");
    }

    assert!(publisher.publish(Arc::new(trap_relay::assemble_trap(localhost(), &packet))).await.is_err());
}

#[test]
fn test_long_form_lengths_decode() {
    let text = vec![b'a'; 300];
    let datagram = v2c_trap("public", &[varbind(SYS_DESCR, 0x04, &text)]);
    assert_eq!(datagram[1], 0x82);
    let packet = decode_packet(&datagram).unwrap();
    assert_eq!(packet.variables.len(), 1);
    assert_eq!(tlv(0x04, &[0u8; 200])[1], 0x81);
}
