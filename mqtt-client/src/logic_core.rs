// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use codec::{
    ByteArray, ConnectAckPacket, ConnectFlags, ConnectPacket, ConnectReturnCode, DecodePacket,
    EncodePacket, PacketId, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, QoS, SubscribePacket, SubscribeTopic,
    UnsubscribePacket,
};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, ErrorKind};
use crate::incoming_pump::{DecodedPacket, InboundEvent};
use crate::msg_id::MsgIdAllocator;
use crate::options::ClientOptions;
use crate::outgoing_pump::{OutgoingHandles, QueueItem};
use crate::receipt::{Receipt, ReceiptRegistry};
use crate::store::Store;
use crate::topic_router::{Message, TopicRouter};

/// A request submitted by `Client` to the serializer. `LogicCore` is the only activity
/// that touches the packet-id allocator, `Store`, and `ReceiptRegistry`, so every
/// state-mutating public operation funnels through here.
pub(crate) enum Submission {
    Publish {
        qos: QoS,
        topic: String,
        payload: Vec<u8>,
        retain: bool,
        reply: oneshot::Sender<Receipt>,
    },
    Subscribe {
        filters: Vec<(String, QoS)>,
        reply: oneshot::Sender<Result<Receipt, Error>>,
    },
    Unsubscribe {
        topics: Vec<String>,
        reply: oneshot::Sender<Result<Receipt, Error>>,
    },
}

/// Phase of a QoS>=1 outbound message not yet fully acknowledged. Mirrors the phases
/// persisted in `Store` under `o:<id>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutboundPhase {
    AwaitPubAck,
    AwaitPubRec,
    AwaitPubComp,
}

impl OutboundPhase {
    const fn tag(self) -> u8 {
        match self {
            Self::AwaitPubAck => 0,
            Self::AwaitPubRec => 1,
            Self::AwaitPubComp => 2,
        }
    }

    const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::AwaitPubAck),
            1 => Some(Self::AwaitPubRec),
            2 => Some(Self::AwaitPubComp),
            _ => None,
        }
    }
}

struct OutboundEntry {
    phase: OutboundPhase,
    /// Encoded `PublishPacket` bytes (packet id, dup flag and all), kept so a phase
    /// transition can be re-persisted without a round-trip through `Store::get`.
    publish_bytes: Vec<u8>,
}

/// Prefixes `publish_bytes` with a one-byte phase tag for persistence under `o:<id>`.
fn encode_stored_outbound(entry: &OutboundEntry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entry.publish_bytes.len() + 1);
    buf.push(entry.phase.tag());
    buf.extend_from_slice(&entry.publish_bytes);
    buf
}

fn decode_stored_outbound(bytes: &[u8]) -> Result<(OutboundPhase, PublishPacket), Error> {
    let (&tag, rest) = bytes
        .split_first()
        .ok_or_else(|| Error::new(ErrorKind::ProtocolAnomaly, "empty stored outbound record"))?;
    let phase = OutboundPhase::from_tag(tag)
        .ok_or_else(|| Error::new(ErrorKind::ProtocolAnomaly, "corrupt stored outbound phase"))?;
    let mut ba = ByteArray::new(rest);
    let packet = PublishPacket::decode(&mut ba)?;
    Ok((phase, packet))
}

/// Single serializer of protocol state. Owns the packet-id allocator, the receipt
/// registry, the persistence store, and the in-flight QoS tables; every mutation of
/// those goes through a `&mut self` method here, never concurrently from elsewhere.
pub(crate) struct LogicCore {
    allocator: Arc<MsgIdAllocator>,
    registry: Arc<ReceiptRegistry>,
    store: Arc<dyn Store>,
    outgoing: OutgoingHandles,
    inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
    submission_rx: mpsc::Receiver<Submission>,
    topic_router: Arc<TopicRouter>,
    ping_resp_tx: mpsc::UnboundedSender<()>,
    fatal_tx: mpsc::UnboundedSender<Error>,
    trace_tag: String,
    in_flight_outbound: HashMap<u16, OutboundEntry>,
    in_flight_inbound: HashSet<u16>,
}

impl LogicCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        allocator: Arc<MsgIdAllocator>,
        registry: Arc<ReceiptRegistry>,
        store: Arc<dyn Store>,
        outgoing: OutgoingHandles,
        inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
        submission_rx: mpsc::Receiver<Submission>,
        topic_router: Arc<TopicRouter>,
        ping_resp_tx: mpsc::UnboundedSender<()>,
        fatal_tx: mpsc::UnboundedSender<Error>,
        trace_tag: String,
    ) -> Self {
        LogicCore {
            allocator,
            registry,
            store,
            outgoing,
            inbound_rx,
            submission_rx,
            topic_router,
            ping_resp_tx,
            fatal_tx,
            trace_tag,
            in_flight_outbound: HashMap::new(),
            in_flight_inbound: HashSet::new(),
        }
    }

    fn tag(&self) -> &str {
        &self.trace_tag
    }

    /// Writes CONNECT and waits for CONNACK, bounded by `options.connect_timeout()`.
    /// A non-zero return code aborts with `ConnAckRefused`; this does not tear down the
    /// transport itself, that is the caller's (`Client::start`) job.
    pub(crate) async fn handshake(
        &mut self,
        options: &ClientOptions,
    ) -> Result<ConnectAckPacket, Error> {
        let mut connect = ConnectPacket::new(options.client_id())?;
        let mut flags = ConnectFlags::default();
        flags.set_clean_session(options.clean_session());
        if options.username().is_some() {
            flags.set_has_username(true);
        }
        if options.password().is_some() {
            flags.set_has_password(true);
        }
        if let Some(will) = options.will() {
            flags.set_will(true);
            flags.set_will_qos(will.qos());
            flags.set_will_retain(will.retain());
            connect.set_will_topic(will.topic())?;
            connect.set_will_message(will.message())?;
        }
        connect.set_connect_flags(flags);
        connect.set_keep_alive(options.keep_alive());
        if let Some(username) = options.username() {
            connect.set_username(username)?;
        }
        if let Some(password) = options.password() {
            connect.set_password(password.as_bytes())?;
        }

        let mut buf = Vec::new();
        connect.encode(&mut buf)?;
        self.outgoing.submit_priority(QueueItem {
            bytes: buf,
            immediate_receipt: None,
        });

        let ack = tokio::time::timeout(options.connect_timeout(), self.wait_for_connack())
            .await
            .map_err(|_elapsed| Error::new(ErrorKind::ConnectFailed, "CONNACK timeout"))??;

        if ack.return_code() != ConnectReturnCode::Accepted {
            return Err(Error::from_string(
                ErrorKind::ConnAckRefused(ack.return_code()),
                format!("broker refused connection: {:?}", ack.return_code()),
            ));
        }
        Ok(ack)
    }

    async fn wait_for_connack(&mut self) -> Result<ConnectAckPacket, Error> {
        loop {
            match self.inbound_rx.recv().await {
                Some(InboundEvent::Packet(DecodedPacket::ConnectAck(ack))) => return Ok(ack),
                Some(InboundEvent::Fatal(msg)) => {
                    return Err(Error::from_string(ErrorKind::TransportError, msg))
                }
                Some(InboundEvent::Packet(_other)) => {
                    log::warn!("{}: unexpected packet before CONNACK, ignoring", self.tag());
                }
                None => {
                    return Err(Error::new(
                        ErrorKind::TransportError,
                        "incoming pump closed before CONNACK",
                    ))
                }
            }
        }
    }

    /// Enumerates `Store` and replays in-flight messages. With `clean_session`, wipes
    /// `Store` first and returns no receipts. Must run before any inbound event queued
    /// after the handshake is handed to `handle_packet`, so resumed state is always in
    /// place before the logic core starts reacting to fresh broker traffic.
    pub(crate) async fn resume(&mut self, clean_session: bool) -> Result<Vec<Receipt>, Error> {
        if clean_session {
            self.store.reset()?;
            return Ok(Vec::new());
        }

        let mut receipts = Vec::new();
        let mut outbound_ids = Vec::new();

        for key in self.store.all()? {
            if let Some(id_str) = key.strip_prefix("o:") {
                let id: u16 = id_str
                    .parse()
                    .map_err(|_err| Error::new(ErrorKind::ProtocolAnomaly, "malformed store key"))?;
                let bytes = self.store.get(&key)?.ok_or_else(|| {
                    Error::new(ErrorKind::ProtocolAnomaly, "store key vanished during resume")
                })?;
                let (phase, mut packet) = decode_stored_outbound(&bytes)?;

                outbound_ids.push(id);
                receipts.push(self.registry.register(id));

                match phase {
                    OutboundPhase::AwaitPubAck | OutboundPhase::AwaitPubRec => {
                        packet.set_dup(true);
                        let mut buf = Vec::new();
                        packet.encode(&mut buf)?;
                        self.in_flight_outbound.insert(
                            id,
                            OutboundEntry {
                                phase,
                                publish_bytes: buf.clone(),
                            },
                        );
                        self.outgoing.submit_normal(QueueItem {
                            bytes: buf,
                            immediate_receipt: None,
                        });
                    }
                    OutboundPhase::AwaitPubComp => {
                        let mut original = Vec::new();
                        packet.encode(&mut original)?;
                        self.in_flight_outbound.insert(
                            id,
                            OutboundEntry {
                                phase,
                                publish_bytes: original,
                            },
                        );
                        let mut buf = Vec::new();
                        PublishReleasePacket::new(PacketId::new(id)).encode(&mut buf)?;
                        self.outgoing.submit_priority(QueueItem {
                            bytes: buf,
                            immediate_receipt: None,
                        });
                    }
                }
            } else if let Some(id_str) = key.strip_prefix("i:") {
                let id: u16 = id_str
                    .parse()
                    .map_err(|_err| Error::new(ErrorKind::ProtocolAnomaly, "malformed store key"))?;
                self.in_flight_inbound.insert(id);
            } else {
                log::warn!("{}: unrecognized store key {key}, ignoring", self.tag());
            }
        }

        self.allocator.rehydrate(&outbound_ids)?;
        Ok(receipts)
    }

    /// Runs until `inbound_rx` and `submission_rx` both close (fatal disconnect), or a
    /// fatal event is observed.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.inbound_rx.recv() => {
                    match event {
                        Some(event) => {
                            if !self.handle_inbound(event) {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                submission = self.submission_rx.recv() => {
                    match submission {
                        Some(submission) => self.handle_submission(submission).await,
                        None => return,
                    }
                }
            }
        }
    }

    fn handle_inbound(&mut self, event: InboundEvent) -> bool {
        match event {
            InboundEvent::Fatal(msg) => {
                let _ = self
                    .fatal_tx
                    .send(Error::from_string(ErrorKind::TransportError, msg));
                false
            }
            InboundEvent::Packet(packet) => {
                self.handle_packet(packet);
                true
            }
        }
    }

    fn handle_packet(&mut self, packet: DecodedPacket) {
        match packet {
            DecodedPacket::ConnectAck(_) => {
                log::warn!("{}: late CONNACK after handshake, dropping", self.tag());
            }
            DecodedPacket::Publish(publish) => self.handle_inbound_publish(publish),
            DecodedPacket::PublishAck(ack) => self.handle_puback(ack.packet_id()),
            DecodedPacket::PublishReceived(rec) => self.handle_pubrec(rec.packet_id()),
            DecodedPacket::PublishRelease(rel) => self.handle_pubrel(rel.packet_id()),
            DecodedPacket::PublishComplete(comp) => self.handle_pubcomp(comp.packet_id()),
            DecodedPacket::SubscribeAck(ack) => self.handle_suback(ack.packet_id()),
            DecodedPacket::UnsubscribeAck(ack) => self.handle_unsuback(ack.packet_id()),
            DecodedPacket::PingResponse(_) => {
                let _ = self.ping_resp_tx.send(());
            }
            DecodedPacket::Unexpected(packet_type) => {
                log::warn!(
                    "{}: broker sent client-only packet type {packet_type:?}",
                    self.tag()
                );
            }
        }
    }

    fn handle_inbound_publish(&mut self, packet: PublishPacket) {
        let message = Message {
            topic: packet.topic().to_string(),
            payload: packet.message().to_vec(),
            qos: packet.qos(),
            retain: packet.retain(),
        };

        match packet.qos() {
            QoS::AtMostOnce => self.topic_router.dispatch(message),
            QoS::AtLeastOnce => {
                self.topic_router.dispatch(message);
                self.send_ack(|buf| PublishAckPacket::new(packet.packet_id()).encode(buf));
            }
            QoS::ExactOnce => {
                let id = packet.packet_id().value();
                if !self.in_flight_inbound.contains(&id) {
                    if let Err(err) = self.store.put(&format!("i:{id}"), &[]) {
                        log::error!("{}: failed to persist i:{id}: {err}", self.tag());
                    }
                    self.in_flight_inbound.insert(id);
                    self.topic_router.dispatch(message);
                }
                self.send_ack(|buf| PublishReceivedPacket::new(packet.packet_id()).encode(buf));
            }
        }
    }

    fn handle_puback(&mut self, id: PacketId) {
        let idv = id.value();
        if self.in_flight_outbound.remove(&idv).is_some() {
            if let Err(err) = self.store.del(&format!("o:{idv}")) {
                log::error!("{}: failed to delete o:{idv}: {err}", self.tag());
            }
            self.registry.complete(idv);
            self.allocator.release(id);
        } else {
            log::warn!("{}: PUBACK for unknown id {idv}", self.tag());
        }
    }

    fn handle_pubrec(&mut self, id: PacketId) {
        let idv = id.value();
        let Some(entry) = self.in_flight_outbound.get_mut(&idv) else {
            log::warn!("{}: PUBREC for unknown id {idv}", self.tag());
            self.send_ack(|buf| PublishReleasePacket::new(id).encode(buf));
            return;
        };
        if entry.phase == OutboundPhase::AwaitPubRec {
            entry.phase = OutboundPhase::AwaitPubComp;
            let record = encode_stored_outbound(entry);
            if let Err(err) = self.store.put(&format!("o:{idv}"), &record) {
                log::error!("{}: failed to persist o:{idv}: {err}", self.tag());
            }
        }
        self.send_ack(|buf| PublishReleasePacket::new(id).encode(buf));
    }

    fn handle_pubcomp(&mut self, id: PacketId) {
        let idv = id.value();
        if self.in_flight_outbound.remove(&idv).is_some() {
            if let Err(err) = self.store.del(&format!("o:{idv}")) {
                log::error!("{}: failed to delete o:{idv}: {err}", self.tag());
            }
            self.registry.complete(idv);
            self.allocator.release(id);
        } else {
            log::warn!("{}: PUBCOMP for unknown id {idv}", self.tag());
        }
    }

    fn handle_pubrel(&mut self, id: PacketId) {
        let idv = id.value();
        if let Err(err) = self.store.del(&format!("i:{idv}")) {
            log::error!("{}: failed to delete i:{idv}: {err}", self.tag());
        }
        self.in_flight_inbound.remove(&idv);
        // A PUBREL for an id we never saw still gets a PUBCOMP: protocol tolerance.
        self.send_ack(|buf| PublishCompletePacket::new(id).encode(buf));
    }

    fn handle_suback(&mut self, id: PacketId) {
        let idv = id.value();
        self.registry.complete(idv);
        self.allocator.release(id);
    }

    fn handle_unsuback(&mut self, id: PacketId) {
        let idv = id.value();
        self.registry.complete(idv);
        self.allocator.release(id);
    }

    fn send_ack<F>(&self, encode: F)
    where
        F: FnOnce(&mut Vec<u8>) -> Result<usize, codec::EncodeError>,
    {
        let mut buf = Vec::new();
        if let Err(err) = encode(&mut buf) {
            log::error!("{}: failed to encode ack packet: {err:?}", self.tag());
            return;
        }
        self.outgoing.submit_priority(QueueItem {
            bytes: buf,
            immediate_receipt: None,
        });
    }

    async fn handle_submission(&mut self, submission: Submission) {
        match submission {
            Submission::Publish {
                qos,
                topic,
                payload,
                retain,
                reply,
            } => {
                let receipt = self.submit_publish(qos, &topic, &payload, retain).await;
                let _ = reply.send(receipt);
            }
            Submission::Subscribe { filters, reply } => {
                let result = self.submit_subscribe(&filters).await;
                let _ = reply.send(result);
            }
            Submission::Unsubscribe { topics, reply } => {
                let result = self.submit_unsubscribe(&topics).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn submit_publish(
        &mut self,
        qos: QoS,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Receipt {
        let mut packet = match PublishPacket::new(topic, qos, payload) {
            Ok(packet) => packet,
            Err(err) => {
                log::warn!("{}: cannot publish to {topic}: {err:?}", self.tag());
                return Receipt::closed();
            }
        };
        packet.set_retain(retain);

        if qos == QoS::AtMostOnce {
            let mut buf = Vec::new();
            if let Err(err) = packet.encode(&mut buf) {
                log::error!("{}: failed to encode QoS 0 publish: {err:?}", self.tag());
                return Receipt::closed();
            }
            let (tx, rx) = oneshot::channel();
            self.outgoing.submit_normal(QueueItem {
                bytes: buf,
                immediate_receipt: Some(tx),
            });
            return Receipt::from_raw(rx);
        }

        let id = match self.allocator.acquire().await {
            Ok(id) => id,
            Err(err) => {
                log::error!("{}: packet id allocator exhausted: {err}", self.tag());
                return Receipt::closed();
            }
        };
        packet.set_packet_id(id);

        let mut buf = Vec::new();
        if let Err(err) = packet.encode(&mut buf) {
            log::error!("{}: failed to encode publish: {err:?}", self.tag());
            self.allocator.release(id);
            return Receipt::closed();
        }

        let phase = if qos == QoS::AtLeastOnce {
            OutboundPhase::AwaitPubAck
        } else {
            OutboundPhase::AwaitPubRec
        };
        let entry = OutboundEntry {
            phase,
            publish_bytes: buf.clone(),
        };
        let record = encode_stored_outbound(&entry);
        if let Err(err) = self.store.put(&format!("o:{}", id.value()), &record) {
            log::error!("{}: failed to persist o:{}: {err}", self.tag(), id.value());
        }
        self.in_flight_outbound.insert(id.value(), entry);
        let receipt = self.registry.register(id.value());
        self.outgoing.submit_normal(QueueItem {
            bytes: buf,
            immediate_receipt: None,
        });
        receipt
    }

    async fn submit_subscribe(&mut self, filters: &[(String, QoS)]) -> Result<Receipt, Error> {
        if filters.is_empty() {
            return Err(Error::new(ErrorKind::ProtocolAnomaly, "subscribe with no filters"));
        }
        let id = self.allocator.acquire().await?;
        let mut topics = Vec::with_capacity(filters.len());
        for (filter, qos) in filters {
            topics.push(SubscribeTopic::new(filter, *qos)?);
        }
        let mut packet = SubscribePacket::default();
        packet.set_packet_id(id);
        packet.set_topics(&topics);

        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        let receipt = self.registry.register(id.value());
        self.outgoing.submit_normal(QueueItem {
            bytes: buf,
            immediate_receipt: None,
        });
        Ok(receipt)
    }

    async fn submit_unsubscribe(&mut self, topics: &[String]) -> Result<Receipt, Error> {
        if topics.is_empty() {
            return Err(Error::new(ErrorKind::ProtocolAnomaly, "unsubscribe with no topics"));
        }
        let id = self.allocator.acquire().await?;
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        let mut packet = UnsubscribePacket::default();
        packet.set_packet_id(id);
        packet.set_topics(&refs)?;

        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        let receipt = self.registry.register(id.value());
        self.outgoing.submit_normal(QueueItem {
            bytes: buf,
            immediate_receipt: None,
        });
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_outbound_roundtrips_phase_and_packet() {
        let packet = PublishPacket::new("a/b", QoS::ExactOnce, b"hi").unwrap();
        let mut publish_bytes = Vec::new();
        packet.encode(&mut publish_bytes).unwrap();
        let entry = OutboundEntry {
            phase: OutboundPhase::AwaitPubComp,
            publish_bytes,
        };
        let record = encode_stored_outbound(&entry);
        let (phase, decoded) = decode_stored_outbound(&record).unwrap();
        assert_eq!(phase, OutboundPhase::AwaitPubComp);
        assert_eq!(decoded.topic(), "a/b");
    }

    #[test]
    fn decode_stored_outbound_rejects_empty() {
        assert!(decode_stored_outbound(&[]).is_err());
    }
}
