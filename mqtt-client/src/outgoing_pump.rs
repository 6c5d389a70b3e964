// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::activity::ActivityClock;
use crate::transport::TransportWriter;

/// A packet queued for the wire, plus an optional completion for QoS 0 publishes
/// (which have no ack to wait for, so the pump completes them itself once written).
pub(crate) struct QueueItem {
    pub bytes: Vec<u8>,
    pub immediate_receipt: Option<oneshot::Sender<()>>,
}

pub(crate) enum StopSignal {
    /// Drain the priority queue (to flush a queued DISCONNECT) before exiting.
    Graceful,
    /// Exit without draining anything.
    Force,
}

/// Handles shared with `LogicCore`/`Client` to submit packets and observe queue depth.
#[derive(Clone)]
pub(crate) struct OutgoingHandles {
    pub normal_tx: mpsc::UnboundedSender<QueueItem>,
    pub priority_tx: mpsc::UnboundedSender<QueueItem>,
    pub outbound_depth: Arc<AtomicUsize>,
}

impl OutgoingHandles {
    pub(crate) fn submit_normal(&self, item: QueueItem) {
        self.outbound_depth.fetch_add(1, Ordering::SeqCst);
        let _ = self.normal_tx.send(item);
    }

    pub(crate) fn submit_priority(&self, item: QueueItem) {
        self.outbound_depth.fetch_add(1, Ordering::SeqCst);
        let _ = self.priority_tx.send(item);
    }
}

/// Sole writer of the transport. Drains the priority queue ahead of the normal queue
/// on every scheduling opportunity, and flushes after each packet.
pub(crate) struct OutgoingPump {
    writer: TransportWriter,
    normal_rx: mpsc::UnboundedReceiver<QueueItem>,
    priority_rx: mpsc::UnboundedReceiver<QueueItem>,
    stop_rx: oneshot::Receiver<StopSignal>,
    outbound_depth: Arc<AtomicUsize>,
    last_outbound_activity: ActivityClock,
}

pub(crate) fn channel(
    writer: TransportWriter,
    last_outbound_activity: ActivityClock,
) -> (OutgoingHandles, oneshot::Sender<StopSignal>, OutgoingPump) {
    let (normal_tx, normal_rx) = mpsc::unbounded_channel();
    let (priority_tx, priority_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel();
    let outbound_depth = Arc::new(AtomicUsize::new(0));
    let handles = OutgoingHandles {
        normal_tx,
        priority_tx,
        outbound_depth: Arc::clone(&outbound_depth),
    };
    let pump = OutgoingPump {
        writer,
        normal_rx,
        priority_rx,
        stop_rx,
        outbound_depth,
        last_outbound_activity,
    };
    (handles, stop_tx, pump)
}

impl OutgoingPump {
    async fn write_item(&mut self, item: QueueItem) {
        if let Err(err) = self.writer.write_all(&item.bytes).await {
            log::error!("outgoing_pump: write failed: {err}");
        } else if let Err(err) = self.writer.flush().await {
            log::error!("outgoing_pump: flush failed: {err}");
        }
        self.last_outbound_activity.touch();
        self.outbound_depth.fetch_sub(1, Ordering::SeqCst);
        if let Some(tx) = item.immediate_receipt {
            let _ = tx.send(());
        }
    }

    pub(crate) async fn run(mut self) {
        let mut stop: Option<StopSignal> = None;
        loop {
            if matches!(stop, Some(StopSignal::Force)) {
                break;
            }
            tokio::select! {
                biased;
                Some(item) = self.priority_rx.recv() => {
                    self.write_item(item).await;
                    if stop.is_some() && self.priority_rx.is_empty() && self.normal_rx.is_empty() {
                        break;
                    }
                }
                Some(item) = self.normal_rx.recv(), if stop.is_none() => {
                    self.write_item(item).await;
                }
                signal = &mut self.stop_rx, if stop.is_none() => {
                    let signal = signal.unwrap_or(StopSignal::Force);
                    let is_force = matches!(signal, StopSignal::Force);
                    stop = Some(signal);
                    if is_force || (self.priority_rx.is_empty() && self.normal_rx.is_empty()) {
                        break;
                    }
                }
            }
        }
    }
}
