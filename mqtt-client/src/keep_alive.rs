// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::time::{Duration, Instant};

use codec::{EncodePacket, PingRequestPacket};
use tokio::sync::mpsc;

use crate::activity::ActivityClock;
use crate::outgoing_pump::{OutgoingHandles, QueueItem};

/// Periodic PINGREQ/PINGRESP liveness check. Ticks at `interval / 2`; submits a
/// PINGREQ when nothing has gone out for a full `interval`, and declares the
/// connection dead if no PINGRESP arrives within a further `interval`.
pub(crate) struct KeepAlive {
    interval: Duration,
    outgoing: OutgoingHandles,
    last_outbound_activity: ActivityClock,
    ping_resp_rx: mpsc::UnboundedReceiver<()>,
    fatal_tx: mpsc::UnboundedSender<()>,
}

impl KeepAlive {
    pub(crate) fn new(
        keep_alive_secs: u16,
        outgoing: OutgoingHandles,
        last_outbound_activity: ActivityClock,
        ping_resp_rx: mpsc::UnboundedReceiver<()>,
        fatal_tx: mpsc::UnboundedSender<()>,
    ) -> Self {
        KeepAlive {
            interval: Duration::from_secs(u64::from(keep_alive_secs)),
            outgoing,
            last_outbound_activity,
            ping_resp_rx,
            fatal_tx,
        }
    }

    /// Runs forever. The caller is expected not to spawn this task at all when
    /// `keep_alive_secs == 0`.
    pub(crate) async fn run(mut self) {
        let tick = self.interval / 2;
        let mut ticker = tokio::time::interval(tick);
        let mut ping_outstanding = false;
        let mut ping_sent_at = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if ping_outstanding {
                        if ping_sent_at.elapsed() >= self.interval {
                            log::warn!("keep_alive: no PINGRESP within {:?}, connection is dead", self.interval);
                            let _ = self.fatal_tx.send(());
                            return;
                        }
                    } else if self.last_outbound_activity.elapsed() >= self.interval {
                        let mut buf = Vec::new();
                        if PingRequestPacket::new().encode(&mut buf).is_ok() {
                            self.outgoing.submit_priority(QueueItem {
                                bytes: buf,
                                immediate_receipt: None,
                            });
                            ping_outstanding = true;
                            ping_sent_at = Instant::now();
                        }
                    }
                }
                received = self.ping_resp_rx.recv() => {
                    match received {
                        Some(()) => ping_outstanding = false,
                        None => return,
                    }
                }
            }
        }
    }
}
