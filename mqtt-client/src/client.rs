// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use codec::{DisconnectPacket, EncodePacket, QoS};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::activity::ActivityClock;
use crate::error::{Error, ErrorKind};
use crate::incoming_pump::IncomingPump;
use crate::keep_alive::KeepAlive;
use crate::logic_core::{LogicCore, Submission};
use crate::msg_id::MsgIdAllocator;
use crate::options::ClientOptions;
use crate::outgoing_pump::{self, QueueItem, StopSignal};
use crate::receipt::{Receipt, ReceiptRegistry};
use crate::status::ClientStatus;
use crate::topic_router::{Handler, TopicRouter};
use crate::transport;

struct Inner {
    submission_tx: mpsc::Sender<Submission>,
    topic_router: Arc<TopicRouter>,
    registry: Arc<ReceiptRegistry>,
    outgoing: outgoing_pump::OutgoingHandles,
    connected: AtomicBool,
    status: Mutex<ClientStatus>,
    stop_tx: Mutex<Option<oneshot::Sender<StopSignal>>>,
    submit_timeout: Duration,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    outgoing_task: Mutex<Option<JoinHandle<()>>>,
    trace_tag: String,
    session_present: bool,
}

/// Facade over a single broker connection. Cheap to clone: every clone shares the same
/// background activities and can submit work concurrently.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Opens a transport to the first reachable server in `options.servers()`, performs
    /// the CONNECT/CONNACK handshake, resumes any persisted session, and starts the
    /// background reader/writer/serializer/keep-alive activities. The second element of
    /// the returned tuple carries one `Receipt` per in-flight message replayed from
    /// `Store`, each completing when its retransmitted ack cycle finishes.
    pub async fn start(options: ClientOptions) -> Result<(Self, Vec<Receipt>), Error> {
        let store = options.store();
        store.open()?;

        let mut last_err = None;
        let mut opened = None;
        for server in options.servers() {
            match transport::open(server, options.tls_config()).await {
                Ok(pair) => {
                    opened = Some(pair);
                    break;
                }
                Err(err) => {
                    log::warn!("client: failed to connect to {server}: {err}");
                    last_err = Some(err);
                }
            }
        }
        let (reader, writer) = opened.ok_or_else(|| {
            last_err.unwrap_or_else(|| Error::new(ErrorKind::ConnectFailed, "no servers configured"))
        })?;

        let last_inbound_activity = ActivityClock::new();
        let last_outbound_activity = ActivityClock::new();

        let (outgoing, stop_tx, outgoing_pump) =
            outgoing_pump::channel(writer, last_outbound_activity.clone());
        let outgoing_task = tokio::spawn(outgoing_pump.run());

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let incoming_pump = IncomingPump::new(reader, inbound_tx, last_inbound_activity);
        let incoming_task = tokio::spawn(incoming_pump.run());

        let allocator = Arc::new(MsgIdAllocator::new());
        let registry = Arc::new(ReceiptRegistry::new());
        let topic_router = Arc::new(TopicRouter::new(options.order()));
        let (ping_resp_tx, ping_resp_rx) = mpsc::unbounded_channel();
        let (submission_tx, submission_rx) = mpsc::channel(32);
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<Error>();

        let mut logic = LogicCore::new(
            Arc::clone(&allocator),
            Arc::clone(&registry),
            store,
            outgoing.clone(),
            inbound_rx,
            submission_rx,
            Arc::clone(&topic_router),
            ping_resp_tx,
            fatal_tx.clone(),
            options.trace_tag().to_string(),
        );

        let result: Result<(bool, Vec<Receipt>), Error> = async {
            let ack = logic.handshake(&options).await?;
            let resumed = logic.resume(options.clean_session()).await?;
            Ok((ack.session_present(), resumed))
        }
        .await;

        let (session_present, resumed_receipts) = match result {
            Ok(pair) => pair,
            Err(err) => {
                incoming_task.abort();
                outgoing_task.abort();
                return Err(err);
            }
        };

        let mut background_tasks = vec![incoming_task];

        if options.keep_alive() > 0 {
            let (ka_fatal_tx, mut ka_fatal_rx) = mpsc::unbounded_channel::<()>();
            let keep_alive = KeepAlive::new(
                options.keep_alive(),
                outgoing.clone(),
                last_outbound_activity,
                ping_resp_rx,
                ka_fatal_tx,
            );
            background_tasks.push(tokio::spawn(keep_alive.run()));

            let relay_fatal_tx = fatal_tx.clone();
            background_tasks.push(tokio::spawn(async move {
                if ka_fatal_rx.recv().await.is_some() {
                    let _ = relay_fatal_tx.send(Error::new(
                        ErrorKind::KeepAliveLost,
                        "no PINGRESP within keep-alive interval",
                    ));
                }
            }));
        } else {
            drop(ping_resp_rx);
        }

        background_tasks.push(tokio::spawn(logic.run()));
        drop(fatal_tx);

        let inner = Arc::new(Inner {
            submission_tx,
            topic_router,
            registry,
            outgoing,
            connected: AtomicBool::new(true),
            status: Mutex::new(ClientStatus::Connected),
            stop_tx: Mutex::new(Some(stop_tx)),
            submit_timeout: options.submit_timeout(),
            background_tasks: Mutex::new(background_tasks),
            outgoing_task: Mutex::new(Some(outgoing_task)),
            trace_tag: options.trace_tag().to_string(),
            session_present,
        });

        let supervisor_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            if let Some(err) = fatal_rx.recv().await {
                log::error!("client[{}]: fatal error, disconnecting: {err}", supervisor_inner.trace_tag);
                supervisor_inner.teardown(false).await;
            }
        });

        Ok((Client { inner }, resumed_receipts))
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn status(&self) -> ClientStatus {
        *self.inner.status.lock().unwrap()
    }

    /// Whether the broker reported existing session state at connect time. Always
    /// `false` when `clean_session` was set.
    #[must_use]
    pub fn session_present(&self) -> bool {
        self.inner.session_present
    }

    /// Publishes `payload` to `topic`. QoS 0 receipts complete the instant the bytes
    /// are written; QoS 1/2 receipts complete when the final ack in the handshake for
    /// that packet id is received.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Receipt, Error> {
        self.ensure_connected()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_submission(Submission::Publish {
            qos,
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_err| Error::new(ErrorKind::NotConnected, "connection closed mid-submit"))
    }

    /// Registers `handler` for `topic` and sends SUBSCRIBE. The route is active
    /// immediately, before SUBACK arrives, so no publication racing the ack is missed.
    pub async fn subscribe(&self, topic: &str, qos: QoS, handler: Handler) -> Result<Receipt, Error> {
        self.ensure_connected()?;
        self.inner.topic_router.add_route(topic, handler);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_submission(Submission::Subscribe {
            filters: vec![(topic.to_string(), qos)],
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_err| Error::new(ErrorKind::NotConnected, "connection closed mid-submit"))?
    }

    /// Sends UNSUBSCRIBE, then removes the local route for `topic`. The route is kept
    /// until the submission has been handed to `LogicCore` so a publication racing the
    /// UNSUBSCRIBE is still delivered rather than silently dropped mid-flight.
    pub async fn unsubscribe(&self, topic: &str) -> Result<Receipt, Error> {
        self.ensure_connected()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_submission(Submission::Unsubscribe {
            topics: vec![topic.to_string()],
            reply: reply_tx,
        })
        .await?;
        self.inner.topic_router.remove_route(topic);
        reply_rx
            .await
            .map_err(|_err| Error::new(ErrorKind::NotConnected, "connection closed mid-submit"))?
    }

    /// Sends DISCONNECT, waits briefly for the outbound queue to drain, then tears the
    /// connection down. Idempotent: a second call is a no-op.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.inner.teardown(true).await;
        Ok(())
    }

    /// Tears the connection down immediately, without sending DISCONNECT or draining
    /// queued writes.
    pub async fn force_disconnect(&self) -> Result<(), Error> {
        self.inner.teardown(false).await;
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::NotConnected, "client is not connected"))
        }
    }

    async fn send_submission(&self, submission: Submission) -> Result<(), Error> {
        tokio::time::timeout(
            self.inner.submit_timeout,
            self.inner.submission_tx.send(submission),
        )
        .await
        .map_err(|_elapsed| Error::new(ErrorKind::SubmitTimeout, "submission queue did not accept in time"))?
        .map_err(|_err| Error::new(ErrorKind::NotConnected, "logic core has shut down"))
    }
}

impl Inner {
    async fn teardown(&self, graceful: bool) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.status.lock().unwrap() = ClientStatus::Disconnecting;

        let Some(stop_tx) = self.stop_tx.lock().unwrap().take() else {
            return;
        };

        if graceful {
            let mut buf = Vec::new();
            if DisconnectPacket::new().encode(&mut buf).is_ok() {
                self.outgoing.submit_priority(QueueItem {
                    bytes: buf,
                    immediate_receipt: None,
                });
            }
            self.wait_for_outbound_drain().await;
            let _ = stop_tx.send(StopSignal::Graceful);
        } else {
            let _ = stop_tx.send(StopSignal::Force);
        }

        self.registry.cancel_all();

        for task in self.background_tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        if let Some(outgoing_task) = self.outgoing_task.lock().unwrap().take() {
            if tokio::time::timeout(Duration::from_secs(2), outgoing_task)
                .await
                .is_err()
            {
                log::warn!("client[{}]: outgoing pump did not drain in time", self.trace_tag);
            }
        }

        *self.status.lock().unwrap() = ClientStatus::Disconnected;
    }

    /// Polls the shared outbound-depth counter instead of sleeping a fixed quiesce
    /// window, so a graceful disconnect with an empty queue returns immediately.
    async fn wait_for_outbound_drain(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if self.outgoing.outbound_depth.load(Ordering::SeqCst) == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.background_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Some(task) = self.outgoing_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
