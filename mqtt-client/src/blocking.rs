// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Synchronous facade over [`crate::Client`] for callers outside a Tokio runtime.
//! Every method blocks the calling thread on a dedicated single-threaded runtime that
//! lives for as long as the `BlockingClient` does; the background reader/writer/logic
//! activities still run as ordinary Tokio tasks on that runtime.

use tokio::runtime::{Builder, Runtime};

use codec::QoS;

use crate::client::Client;
use crate::error::{Error, ErrorKind};
use crate::options::ClientOptions;
use crate::receipt::Receipt;
use crate::status::ClientStatus;
use crate::topic_router::Handler;

pub struct BlockingClient {
    runtime: Runtime,
    inner: Client,
}

impl BlockingClient {
    /// Builds a dedicated current-thread runtime and runs `Client::start` on it.
    /// Returns one `Receipt` per in-flight message replayed from `Store`, same as
    /// the async `Client::start`.
    pub fn start(options: ClientOptions) -> Result<(Self, Vec<Receipt>), Error> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| Error::from_string(ErrorKind::ConnectFailed, format!("runtime: {err}")))?;
        let (inner, resumed) = runtime.block_on(Client::start(options))?;
        Ok((BlockingClient { runtime, inner }, resumed))
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    #[must_use]
    pub fn status(&self) -> ClientStatus {
        self.inner.status()
    }

    #[must_use]
    pub fn session_present(&self) -> bool {
        self.inner.session_present()
    }

    pub fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Receipt, Error> {
        self.runtime.block_on(self.inner.publish(topic, payload, qos, retain))
    }

    pub fn subscribe(&self, topic: &str, qos: QoS, handler: Handler) -> Result<Receipt, Error> {
        self.runtime.block_on(self.inner.subscribe(topic, qos, handler))
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<Receipt, Error> {
        self.runtime.block_on(self.inner.unsubscribe(topic))
    }

    /// Blocks until `receipt` resolves. Convenience over `self.runtime.block_on(receipt.wait())`.
    #[must_use]
    pub fn wait(&self, receipt: Receipt) -> bool {
        self.runtime.block_on(receipt.wait())
    }

    pub fn disconnect(&self) -> Result<(), Error> {
        self.runtime.block_on(self.inner.disconnect())
    }

    pub fn force_disconnect(&self) -> Result<(), Error> {
        self.runtime.block_on(self.inner.force_disconnect())
    }
}
