// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! An asynchronous MQTT v3.1/v3.1.1 client built on Tokio.
//!
//! [`Client`] is the entry point: it owns the network connection and drives three
//! cooperating background activities (a single reader, a single writer, and a single
//! state serializer) connected by channels. See [`ClientOptions`] for how to configure
//! a connection and [`Store`] for how in-flight QoS 1/2 state survives a restart.

mod activity;
#[cfg(feature = "blocking")]
pub mod blocking;
mod client;
mod error;
mod incoming_pump;
mod keep_alive;
mod logic_core;
mod msg_id;
mod options;
mod outgoing_pump;
mod receipt;
mod status;
mod store;
mod topic_router;
mod transport;

pub use client::Client;
pub use error::{Error, ErrorKind};
pub use options::{ClientOptions, DispatchOrder, TlsConfig, Will};
pub use receipt::Receipt;
pub use status::ClientStatus;
pub use store::{FileStore, MemoryStore, Store};
pub use topic_router::{topic_matches, Handler, Message};

pub use codec::QoS;
