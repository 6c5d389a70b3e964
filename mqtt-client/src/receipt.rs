// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

/// Single-shot delivery-completion signal handed back to the caller of
/// `publish`/`subscribe`/`unsubscribe`. Resolves once the message's terminal QoS phase is
/// reached. Dropping the sending half without completing it (submit timeout, fatal
/// disconnect) resolves `wait()` to `None`.
#[derive(Debug)]
pub struct Receipt {
    rx: oneshot::Receiver<()>,
}

impl Receipt {
    /// Waits for completion. Returns `true` if the message reached its terminal phase,
    /// `false` if the receipt was cancelled (timed out or the connection died).
    pub async fn wait(self) -> bool {
        self.rx.await.is_ok()
    }

    /// Wraps a raw oneshot receiver, used when a component other than
    /// `ReceiptRegistry` owns the completion side (QoS 0 publishes, completed by
    /// `OutgoingPump` the instant the bytes are written).
    pub(crate) fn from_raw(rx: oneshot::Receiver<()>) -> Self {
        Receipt { rx }
    }

    /// A receipt that is already cancelled: used when a submission never reaches
    /// `LogicCore` (submit timeout, client not connected).
    #[must_use]
    pub(crate) fn closed() -> Self {
        let (_tx, rx) = oneshot::channel();
        Receipt { rx }
    }
}

/// Maps in-flight packet ids to the `Receipt` their eventual ack must complete.
#[derive(Debug, Default)]
pub struct ReceiptRegistry {
    pending: Mutex<HashMap<u16, oneshot::Sender<()>>>,
}

impl ReceiptRegistry {
    #[must_use]
    pub fn new() -> Self {
        ReceiptRegistry {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a fresh `Receipt`/sender pair and associates the sender with `id`.
    pub fn register(&self, id: u16) -> Receipt {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        Receipt { rx }
    }

    /// Completes and removes the receipt for `id`. A no-op if `id` is unknown, which
    /// happens when a duplicate ack completes a message that was already finished.
    pub fn complete(&self, id: u16) {
        if let Some(tx) = self.pending.lock().unwrap().remove(&id) {
            let _ = tx.send(());
        }
    }

    /// Completes every pending receipt with a cancellation signal (drops the sender
    /// without sending), used on shutdown.
    pub fn cancel_all(&self) {
        self.pending.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_resolves_receipt() {
        let registry = ReceiptRegistry::new();
        let receipt = registry.register(7);
        registry.complete(7);
        assert!(receipt.wait().await);
    }

    #[tokio::test]
    async fn complete_unknown_id_is_noop() {
        let registry = ReceiptRegistry::new();
        registry.complete(99);
    }

    #[tokio::test]
    async fn cancel_all_resolves_receipts_to_false() {
        let registry = ReceiptRegistry::new();
        let receipt = registry.register(3);
        registry.cancel_all();
        assert!(!receipt.wait().await);
    }
}
