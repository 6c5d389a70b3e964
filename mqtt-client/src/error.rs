// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;
use tokio_tungstenite::tungstenite;

/// Represent the types of errors a client can surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// No configured broker accepted the transport.
    ConnectFailed,

    /// CONNACK carried a non-zero return code.
    ConnAckRefused(codec::ConnectReturnCode),

    /// Public operation invoked while the client is not connected.
    NotConnected,

    /// Submission deadline for publish/subscribe/unsubscribe expired.
    SubmitTimeout,

    /// Read/write/decode failure on the transport; fatal.
    TransportError,

    /// No PINGRESP within the keep-alive interval.
    KeepAliveLost,

    /// Packet-id allocator has no free ids left.
    IdExhausted,

    /// Unknown ids in acks, malformed lengths, late CONNACK: logged, not fatal.
    ProtocolAnomaly,
}

#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Error {
            kind,
            message: message.to_owned(),
        }
    }

    #[must_use]
    pub fn from_string(kind: ErrorKind, message: String) -> Self {
        Error { kind, message }
    }

    #[must_use]
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_string(ErrorKind::TransportError, format!("io error: {err}"))
    }
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        Error::from_string(ErrorKind::TransportError, format!("websocket error: {err}"))
    }
}

impl From<tokio_rustls::rustls::Error> for Error {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Error::from_string(ErrorKind::TransportError, format!("tls error: {err}"))
    }
}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Error::from_string(ErrorKind::TransportError, format!("encode error: {err:?}"))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Error::from_string(ErrorKind::TransportError, format!("decode error: {err:?}"))
    }
}
