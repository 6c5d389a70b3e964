// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::sync::Arc;
use std::time::Duration;

use codec::{utils::random_string, QoS};

use crate::store::{MemoryStore, Store};

/// Root CA / client cert material for `ssl://` and `wss://` servers.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    /// PEM encoded root CA certificate. Empty means fall back to webpki roots.
    root_ca_pem: Vec<u8>,

    /// PEM encoded client certificate, for mutual TLS.
    client_cert_pem: Vec<u8>,

    /// PEM encoded client private key, for mutual TLS.
    client_key_pem: Vec<u8>,

    /// Domain name used for certificate verification; defaults to the server host.
    domain: Option<String>,
}

impl TlsConfig {
    pub fn set_root_ca_pem(&mut self, pem: Vec<u8>) -> &mut Self {
        self.root_ca_pem = pem;
        self
    }

    #[must_use]
    pub fn root_ca_pem(&self) -> &[u8] {
        &self.root_ca_pem
    }

    pub fn set_client_cert_pem(&mut self, pem: Vec<u8>) -> &mut Self {
        self.client_cert_pem = pem;
        self
    }

    #[must_use]
    pub fn client_cert_pem(&self) -> &[u8] {
        &self.client_cert_pem
    }

    pub fn set_client_key_pem(&mut self, pem: Vec<u8>) -> &mut Self {
        self.client_key_pem = pem;
        self
    }

    #[must_use]
    pub fn client_key_pem(&self) -> &[u8] {
        &self.client_key_pem
    }

    pub fn set_domain(&mut self, domain: &str) -> &mut Self {
        self.domain = Some(domain.to_string());
        self
    }

    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }
}

/// Last-Will-and-Testament message, published by the broker if the client disconnects
/// ungracefully.
#[derive(Clone, Debug)]
pub struct Will {
    topic: String,
    message: Vec<u8>,
    qos: QoS,
    retain: bool,
}

impl Will {
    #[must_use]
    pub fn new(topic: &str, message: &[u8], qos: QoS, retain: bool) -> Self {
        Will {
            topic: topic.to_string(),
            message: message.to_vec(),
            qos,
            retain,
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn message(&self) -> &[u8] {
        &self.message
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }
}

/// Inbound dispatch ordering, see `TopicRouter`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchOrder {
    /// Handlers invoked concurrently, no ordering guarantee.
    #[default]
    Unordered,

    /// One FIFO queue per QoS class.
    Ordered,
}

/// Configuration consumed by `Client::start()`.
#[derive(Clone)]
pub struct ClientOptions {
    servers: Vec<String>,
    client_id: String,
    clean_session: bool,
    username: Option<String>,
    password: Option<String>,
    will: Option<Will>,
    keep_alive: u16,
    tls_config: TlsConfig,
    store: Arc<dyn Store>,
    order: DispatchOrder,
    submit_timeout: Duration,
    connect_timeout: Duration,
    trace_tag: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            servers: Vec::new(),
            client_id: random_string(8),
            clean_session: true,
            username: None,
            password: None,
            will: None,
            keep_alive: 60,
            tls_config: TlsConfig::default(),
            store: Arc::new(MemoryStore::new()),
            order: DispatchOrder::default(),
            submit_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            trace_tag: String::new(),
        }
    }
}

impl ClientOptions {
    #[must_use]
    pub fn new(servers: &[&str]) -> Self {
        ClientOptions {
            servers: servers.iter().map(|s| (*s).to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn set_servers(&mut self, servers: &[&str]) -> &mut Self {
        self.servers = servers.iter().map(|s| (*s).to_string()).collect();
        self
    }

    #[must_use]
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    pub fn set_client_id(&mut self, client_id: &str) -> &mut Self {
        self.client_id = client_id.to_string();
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.clean_session = clean_session;
        self
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn set_credentials(&mut self, username: &str, password: &str) -> &mut Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn set_will(&mut self, will: Will) -> &mut Self {
        self.will = Some(will);
        self
    }

    #[must_use]
    pub const fn will(&self) -> Option<&Will> {
        self.will.as_ref()
    }

    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_tls_config(&mut self, tls_config: TlsConfig) -> &mut Self {
        self.tls_config = tls_config;
        self
    }

    #[must_use]
    pub const fn tls_config(&self) -> &TlsConfig {
        &self.tls_config
    }

    pub fn set_store(&mut self, store: Arc<dyn Store>) -> &mut Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub fn set_order(&mut self, order: DispatchOrder) -> &mut Self {
        self.order = order;
        self
    }

    #[must_use]
    pub const fn order(&self) -> DispatchOrder {
        self.order
    }

    pub fn set_submit_timeout(&mut self, submit_timeout: Duration) -> &mut Self {
        self.submit_timeout = submit_timeout;
        self
    }

    #[must_use]
    pub const fn submit_timeout(&self) -> Duration {
        self.submit_timeout
    }

    pub fn set_connect_timeout(&mut self, connect_timeout: Duration) -> &mut Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn set_trace_tag(&mut self, trace_tag: &str) -> &mut Self {
        self.trace_tag = trace_tag.to_string();
        self
    }

    #[must_use]
    pub fn trace_tag(&self) -> &str {
        &self.trace_tag
    }
}
