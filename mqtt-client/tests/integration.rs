// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Black-box scenarios driven against a minimal fake broker speaking raw MQTT over a
//! real loopback TCP socket, mirroring the end-to-end scenarios enumerated in the
//! client's design notes (round-trip QoS 0/1, QoS 2 resume, duplicate inbound QoS 2,
//! wildcard routing).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use codec::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodePacket, EncodePacket,
    PacketId, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReleasePacket, QoS, SubscribeAck, SubscribeAckPacket, SubscribePacket,
    ByteArray, FixedHeader, PacketType,
};
use ruo::{Client, ClientOptions, FileStore, MemoryStore, Store};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Reads exactly one control packet off `stream`, blocking until enough bytes arrive.
async fn read_one_packet(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Vec<u8> {
    loop {
        if let Ok(Some(len)) = try_frame_len(buf) {
            let packet = buf[..len].to_vec();
            buf.drain(..len);
            return packet;
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.expect("broker read failed");
        assert!(n > 0, "client closed connection unexpectedly");
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn try_frame_len(buf: &[u8]) -> Result<Option<usize>, ()> {
    let mut ba = ByteArray::new(buf);
    match FixedHeader::decode(&mut ba) {
        Ok(header) => {
            let total = header.bytes() + header.remaining_length();
            if buf.len() < total {
                Ok(None)
            } else {
                Ok(Some(total))
            }
        }
        Err(_) => Ok(None),
    }
}

fn packet_type_of(bytes: &[u8]) -> PacketType {
    let mut ba = ByteArray::new(bytes);
    FixedHeader::decode(&mut ba).unwrap().packet_type()
}

async fn accept_handshake(listener: &TcpListener) -> TcpStream {
    let (mut stream, _addr) = listener.accept().await.expect("accept failed");
    let mut buf = Vec::new();
    let connect_bytes = read_one_packet(&mut stream, &mut buf).await;
    let mut ba = ByteArray::new(&connect_bytes);
    let _connect = ConnectPacket::decode(&mut ba).expect("malformed CONNECT");

    let mut ack = Vec::new();
    ConnectAckPacket::new(false, ConnectReturnCode::Accepted)
        .encode(&mut ack)
        .unwrap();
    stream.write_all(&ack).await.unwrap();
    stream
}

async fn local_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, format!("tcp://{addr}"))
}

/// Every test in this binary calls this first; `try_init` tolerates the repeat calls
/// that come from running more than one `#[tokio::test]` in the same process.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test]
async fn round_trip_qos0_has_no_store_entry() {
    init_logging();
    let (listener, url) = local_listener().await;
    let store = Arc::new(MemoryStore::new());

    let broker = tokio::spawn(async move {
        let mut stream = accept_handshake(&listener).await;
        let mut buf = Vec::new();
        let publish_bytes = read_one_packet(&mut stream, &mut buf).await;
        assert_eq!(packet_type_of(&publish_bytes), PacketType::Publish { dup: false, qos: QoS::AtMostOnce, retain: false });
        stream
    });

    let mut options = ClientOptions::new(&[url.as_str()]);
    options.set_store(store.clone());
    let (client, _resumed) = Client::start(options).await.expect("start failed");

    let receipt = client
        .publish("a/b", b"hi", QoS::AtMostOnce, false)
        .await
        .expect("publish submit failed");
    assert!(receipt.wait().await, "qos 0 receipt should complete immediately");
    assert!(store.all().unwrap().is_empty(), "qos 0 must never touch the store");

    broker.await.unwrap();
    client.force_disconnect().await.unwrap();
}

#[tokio::test]
async fn round_trip_qos1_with_ack() {
    init_logging();
    let (listener, url) = local_listener().await;
    let store = Arc::new(MemoryStore::new());

    let broker = tokio::spawn(async move {
        let mut stream = accept_handshake(&listener).await;
        let mut buf = Vec::new();
        let publish_bytes = read_one_packet(&mut stream, &mut buf).await;
        let mut ba = ByteArray::new(&publish_bytes);
        let publish = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(publish.qos(), QoS::AtLeastOnce);

        let mut ack = Vec::new();
        PublishAckPacket::new(publish.packet_id()).encode(&mut ack).unwrap();
        stream.write_all(&ack).await.unwrap();
        stream
    });

    let mut options = ClientOptions::new(&[url.as_str()]);
    options.set_store(store.clone());
    let (client, _resumed) = Client::start(options).await.expect("start failed");

    let receipt = client
        .publish("t", b"p", QoS::AtLeastOnce, false)
        .await
        .expect("publish submit failed");

    // The store entry must exist while the ack is outstanding.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.all().unwrap().len(), 1);

    assert!(receipt.wait().await, "qos 1 receipt should complete on PUBACK");
    assert!(store.all().unwrap().is_empty(), "store entry must be removed once acked");

    broker.await.unwrap();
    client.force_disconnect().await.unwrap();
}

#[tokio::test]
async fn resume_after_crash_mid_qos2_replays_pubrel() {
    init_logging();
    let dir = std::env::temp_dir().join(format!("ruo-s3-{}", std::process::id()));
    let store: Arc<FileStore> = Arc::new(FileStore::new(dir.to_str().unwrap(), "resumer"));
    store.open().unwrap();

    // Pre-seed a QoS 2 publish parked in AWAIT_PUBCOMP, mirroring a crash right after
    // PUBREC arrived but before the broker's PUBCOMP.
    let mut publish = PublishPacket::new("x/y", QoS::ExactOnce, b"m").unwrap();
    publish.set_packet_id(PacketId::new(7));
    let mut publish_bytes = Vec::new();
    publish.encode(&mut publish_bytes).unwrap();
    let mut record = vec![2u8]; // phase tag 2 == AwaitPubComp, mirrors logic_core's private encoding
    record.extend_from_slice(&publish_bytes);
    store.put("o:7", &record).unwrap();

    let (listener, url) = local_listener().await;
    let broker = tokio::spawn(async move {
        let mut stream = accept_handshake(&listener).await;
        let mut buf = Vec::new();
        let pubrel_bytes = read_one_packet(&mut stream, &mut buf).await;
        assert_eq!(packet_type_of(&pubrel_bytes), PacketType::PublishRelease);
        let mut ba = ByteArray::new(&pubrel_bytes);
        let pubrel = PublishReleasePacket::decode(&mut ba).unwrap();
        assert_eq!(pubrel.packet_id().value(), 7);

        let mut comp = Vec::new();
        PublishCompletePacket::new(pubrel.packet_id()).encode(&mut comp).unwrap();
        stream.write_all(&comp).await.unwrap();
        stream
    });

    let mut options = ClientOptions::new(&[url.as_str()]);
    options.set_client_id("resumer");
    options.set_clean_session(false);
    options.set_store(store.clone());
    let (client, mut resumed) = Client::start(options).await.expect("start failed");
    assert_eq!(resumed.len(), 1, "resume must yield exactly one receipt for o:7");
    let receipt = resumed.remove(0);

    assert!(receipt.wait().await, "resumed receipt should complete once PUBCOMP arrives");
    assert!(store.all().unwrap().is_empty(), "o:7 must be removed once PUBCOMP arrives");

    broker.await.unwrap();
    client.force_disconnect().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn inbound_duplicate_qos2_dispatches_handler_once() {
    init_logging();
    let (listener, url) = local_listener().await;

    let broker = tokio::spawn(async move {
        let mut stream = accept_handshake(&listener).await;
        let mut buf = Vec::new();

        // Wait for the SUBSCRIBE before publishing, so the route is guaranteed to be
        // registered (routes go live synchronously with the SUBSCRIBE submission).
        let sub_bytes = read_one_packet(&mut stream, &mut buf).await;
        assert_eq!(packet_type_of(&sub_bytes), PacketType::Subscribe);

        let mut publish = PublishPacket::new("x/y", QoS::ExactOnce, b"m").unwrap();
        publish.set_packet_id(PacketId::new(4));
        let mut bytes = Vec::new();
        publish.encode(&mut bytes).unwrap();

        stream.write_all(&bytes).await.unwrap();
        let pubrec1 = read_one_packet(&mut stream, &mut buf).await;
        assert_eq!(packet_type_of(&pubrec1), PacketType::PublishReceived);

        // Resend the duplicate before releasing.
        stream.write_all(&bytes).await.unwrap();
        let pubrec2 = read_one_packet(&mut stream, &mut buf).await;
        assert_eq!(packet_type_of(&pubrec2), PacketType::PublishReceived);

        let mut rel = Vec::new();
        PublishReleasePacket::new(PacketId::new(4)).encode(&mut rel).unwrap();
        stream.write_all(&rel).await.unwrap();

        let pubcomp = read_one_packet(&mut stream, &mut buf).await;
        assert_eq!(packet_type_of(&pubcomp), PacketType::PublishComplete);
        stream
    });

    let options = ClientOptions::new(&[url.as_str()]);
    let (client, _resumed) = Client::start(options).await.expect("start failed");

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    client
        .subscribe(
            "x/y",
            QoS::ExactOnce,
            Arc::new(move |_msg| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .expect("subscribe failed");

    // No SUBACK is sent by this fake broker; give the dispatcher a moment regardless
    // since routes are active synchronously with the SUBSCRIBE submission.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1, "handler must fire exactly once");

    broker.await.unwrap();
    client.force_disconnect().await.unwrap();
}

#[tokio::test]
async fn wildcard_routing_excludes_dollar_topics() {
    init_logging();
    let (listener, url) = local_listener().await;

    let broker = tokio::spawn(async move {
        let mut stream = accept_handshake(&listener).await;
        let mut buf = Vec::new();

        // Wait for both SUBSCRIBEs before publishing so neither route can be missed.
        for _ in 0..2 {
            let sub_bytes = read_one_packet(&mut stream, &mut buf).await;
            assert_eq!(packet_type_of(&sub_bytes), PacketType::Subscribe);
        }

        let mut publish = PublishPacket::new("sport/tennis/score", QoS::AtMostOnce, b"m").unwrap();
        publish.set_retain(false);
        let mut bytes = Vec::new();
        publish.encode(&mut bytes).unwrap();
        stream.write_all(&bytes).await.unwrap();

        let mut sys_publish = PublishPacket::new("$SYS/x", QoS::AtMostOnce, b"m").unwrap();
        let mut sys_bytes = Vec::new();
        sys_publish.encode(&mut sys_bytes).unwrap();
        stream.write_all(&sys_bytes).await.unwrap();
        stream
    });

    let options = ClientOptions::new(&[url.as_str()]);
    let (client, _resumed) = Client::start(options).await.expect("start failed");

    let h1_hits = Arc::new(AtomicUsize::new(0));
    let h1 = Arc::clone(&h1_hits);
    client
        .subscribe("sport/+/score", QoS::AtMostOnce, Arc::new(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

    let h2_hits = Arc::new(AtomicUsize::new(0));
    let h2 = Arc::clone(&h2_hits);
    client
        .subscribe("sport/#", QoS::AtMostOnce, Arc::new(move |_| {
            h2.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h1_hits.load(Ordering::SeqCst), 1);
    assert_eq!(h2_hits.load(Ordering::SeqCst), 1);

    broker.await.unwrap();
    client.force_disconnect().await.unwrap();
}

#[tokio::test]
async fn subscribe_completes_on_suback() {
    init_logging();
    let (listener, url) = local_listener().await;

    let broker = tokio::spawn(async move {
        let mut stream = accept_handshake(&listener).await;
        let mut buf = Vec::new();
        let sub_bytes = read_one_packet(&mut stream, &mut buf).await;
        let mut ba = ByteArray::new(&sub_bytes);
        let sub = SubscribePacket::decode(&mut ba).unwrap();

        let mut ack = Vec::new();
        SubscribeAckPacket::new(sub.packet_id(), SubscribeAck::QoS(QoS::AtLeastOnce))
            .encode(&mut ack)
            .unwrap();
        stream.write_all(&ack).await.unwrap();
        stream
    });

    let options = ClientOptions::new(&[url.as_str()]);
    let (client, _resumed) = Client::start(options).await.expect("start failed");

    let receipt = client
        .subscribe("t/#", QoS::AtLeastOnce, Arc::new(|_| {}))
        .await
        .expect("subscribe submit failed");
    assert!(receipt.wait().await, "subscribe receipt should complete on SUBACK");

    broker.await.unwrap();
    client.force_disconnect().await.unwrap();
}

#[tokio::test]
async fn connack_refusal_fails_start() {
    init_logging();
    let (listener, url) = local_listener().await;

    let broker = tokio::spawn(async move {
        let (mut stream, _addr) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let _connect = read_one_packet(&mut stream, &mut buf).await;
        let mut ack = Vec::new();
        ConnectAckPacket::new(false, ConnectReturnCode::Unauthorized)
            .encode(&mut ack)
            .unwrap();
        stream.write_all(&ack).await.unwrap();
        stream
    });

    let options = ClientOptions::new(&[url.as_str()]);
    let result = Client::start(options).await;
    assert!(result.is_err(), "non-zero CONNACK must fail Start");

    broker.await.unwrap();
}

#[tokio::test]
async fn not_connected_after_disconnect_rejects_publish() {
    init_logging();
    let (listener, url) = local_listener().await;
    let broker = tokio::spawn(async move {
        accept_handshake(&listener).await;
    });

    let options = ClientOptions::new(&[url.as_str()]);
    let (client, _resumed) = Client::start(options).await.expect("start failed");
    client.force_disconnect().await.unwrap();
    broker.await.unwrap();

    let result = client.publish("a", b"x", QoS::AtMostOnce, false).await;
    assert!(result.is_err(), "publish after disconnect must fail with NotConnected");
}

/// Guards against accidental serialization races: two publishes submitted back to
/// back must each get a distinct packet id.
#[tokio::test]
async fn concurrent_publishes_get_distinct_packet_ids() {
    init_logging();
    let (listener, url) = local_listener().await;
    let seen_ids = Arc::new(Mutex::new(Vec::new()));
    let seen_ids2 = Arc::clone(&seen_ids);

    let broker = tokio::spawn(async move {
        let mut stream = accept_handshake(&listener).await;
        let mut buf = Vec::new();
        for _ in 0..5 {
            let publish_bytes = read_one_packet(&mut stream, &mut buf).await;
            let mut ba = ByteArray::new(&publish_bytes);
            let publish = PublishPacket::decode(&mut ba).unwrap();
            seen_ids2.lock().unwrap().push(publish.packet_id().value());
            let mut ack = Vec::new();
            PublishAckPacket::new(publish.packet_id()).encode(&mut ack).unwrap();
            stream.write_all(&ack).await.unwrap();
        }
        stream
    });

    let options = ClientOptions::new(&[url.as_str()]);
    let (client, _resumed) = Client::start(options).await.expect("start failed");

    let mut receipts = Vec::new();
    for i in 0..5 {
        receipts.push(
            client
                .publish("t", format!("{i}").as_bytes(), QoS::AtLeastOnce, false)
                .await
                .unwrap(),
        );
    }
    for receipt in receipts {
        assert!(receipt.wait().await);
    }

    let ids = seen_ids.lock().unwrap().clone();
    let mut unique = ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(ids.len(), unique.len(), "packet ids must never repeat while in flight");

    broker.await.unwrap();
    client.force_disconnect().await.unwrap();
}
