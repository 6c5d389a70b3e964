// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::io;
use std::io::Cursor;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Error, ErrorKind};
use crate::options::TlsConfig;

/// The read half of an opened broker connection. The sole reader is `IncomingPump`.
pub enum TransportReader {
    Tcp(OwnedReadHalf),
    Tls(ReadHalf<TlsStream<TcpStream>>),
    Ws(SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>),
}

/// The write half of an opened broker connection. The sole writer is `OutgoingPump`.
pub enum TransportWriter {
    Tcp(OwnedWriteHalf),
    Tls(WriteHalf<TlsStream<TcpStream>>),
    Ws(SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>),
}

impl TransportReader {
    pub async fn read_buf(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            Self::Tcp(r) => r.read_buf(buf).await,
            Self::Tls(r) => r.read_buf(buf).await,
            Self::Ws(r) => match r.next().await {
                Some(Ok(msg)) => {
                    let data = msg.into_data();
                    let n = data.len();
                    buf.extend_from_slice(&data);
                    Ok(n)
                }
                Some(Err(err)) => Err(io::Error::new(io::ErrorKind::Other, err)),
                None => Ok(0),
            },
        }
    }
}

impl TransportWriter {
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(w) => w.write_all(buf).await,
            Self::Tls(w) => w.write_all(buf).await,
            Self::Ws(w) => w
                .send(Message::binary(buf.to_vec()))
                .await
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err)),
        }
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(w) => w.flush().await,
            Self::Tls(w) => w.flush().await,
            Self::Ws(w) => w
                .flush()
                .await
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err)),
        }
    }
}

enum Scheme {
    Tcp,
    Ssl,
    Ws,
    Wss,
}

struct BrokerUrl {
    scheme: Scheme,
    host: String,
    port: u16,
}

fn parse_url(url: &str) -> Result<BrokerUrl, Error> {
    let (scheme, rest) = url.split_once("://").ok_or_else(|| {
        Error::new(ErrorKind::ConnectFailed, "broker url missing scheme")
    })?;
    let scheme = match scheme {
        "tcp" => Scheme::Tcp,
        "ssl" => Scheme::Ssl,
        "ws" => Scheme::Ws,
        "wss" => Scheme::Wss,
        other => {
            return Err(Error::from_string(
                ErrorKind::ConnectFailed,
                format!("unrecognized transport scheme: {other}"),
            ))
        }
    };
    // strip any trailing path, which only websocket schemes use.
    let host_port = rest.split('/').next().unwrap_or(rest);
    let (host, port) = host_port.split_once(':').ok_or_else(|| {
        Error::new(ErrorKind::ConnectFailed, "broker url missing port")
    })?;
    let port: u16 = port
        .parse()
        .map_err(|_err| Error::new(ErrorKind::ConnectFailed, "broker url has invalid port"))?;
    Ok(BrokerUrl {
        scheme,
        host: host.to_string(),
        port,
    })
}

fn build_tls_connector(tls_config: &TlsConfig) -> Result<tokio_rustls::TlsConnector, Error> {
    let mut root_store = rustls::RootCertStore::empty();
    if tls_config.root_ca_pem().is_empty() {
        root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
    } else {
        let mut reader = Cursor::new(tls_config.root_ca_pem());
        for cert in rustls_pemfile::certs(&mut reader)
            .map_err(|_err| Error::new(ErrorKind::ConnectFailed, "invalid root ca pem"))?
        {
            root_store
                .add(&rustls::Certificate(cert))
                .map_err(|_err| Error::new(ErrorKind::ConnectFailed, "invalid root ca cert"))?;
        }
    }

    let builder = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store);

    let config = if tls_config.client_cert_pem().is_empty() {
        builder.with_no_client_auth()
    } else {
        let mut cert_reader = Cursor::new(tls_config.client_cert_pem());
        let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut cert_reader)
            .map_err(|_err| Error::new(ErrorKind::ConnectFailed, "invalid client cert pem"))?
            .into_iter()
            .map(rustls::Certificate)
            .collect();
        let mut key_reader = Cursor::new(tls_config.client_key_pem());
        let key = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
            .map_err(|_err| Error::new(ErrorKind::ConnectFailed, "invalid client key pem"))?
            .into_iter()
            .next()
            .map(rustls::PrivateKey)
            .ok_or_else(|| Error::new(ErrorKind::ConnectFailed, "no client private key found"))?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|_err| Error::new(ErrorKind::ConnectFailed, "invalid client cert/key pair"))?
    };

    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

/// Opens a connection to `url`, recognizing `tcp://`, `ssl://`, `ws://`, `wss://`.
pub async fn open(
    url: &str,
    tls_config: &TlsConfig,
) -> Result<(TransportReader, TransportWriter), Error> {
    let broker_url = parse_url(url)?;

    match broker_url.scheme {
        Scheme::Tcp => {
            let stream = TcpStream::connect((broker_url.host.as_str(), broker_url.port)).await?;
            let (r, w) = stream.into_split();
            Ok((TransportReader::Tcp(r), TransportWriter::Tcp(w)))
        }
        Scheme::Ssl => {
            let connector = build_tls_connector(tls_config)?;
            let domain = tls_config.domain().unwrap_or(&broker_url.host);
            let server_name = rustls::ServerName::try_from(domain)
                .map_err(|_err| Error::new(ErrorKind::ConnectFailed, "invalid tls domain"))?;
            let stream = TcpStream::connect((broker_url.host.as_str(), broker_url.port)).await?;
            let stream = connector.connect(server_name, stream).await?;
            let (r, w) = tokio::io::split(stream);
            Ok((TransportReader::Tls(r), TransportWriter::Tls(w)))
        }
        Scheme::Ws | Scheme::Wss => {
            let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(Error::from)?;
            let (sink, stream) = ws_stream.split();
            Ok((TransportReader::Ws(stream), TransportWriter::Ws(sink)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_url_accepts_recognized_schemes() {
        assert!(matches!(parse_url("tcp://localhost:1883").unwrap().scheme, Scheme::Tcp));
        assert!(matches!(parse_url("ssl://localhost:8883").unwrap().scheme, Scheme::Ssl));
        assert!(matches!(parse_url("ws://localhost:8080/mqtt").unwrap().scheme, Scheme::Ws));
        assert!(matches!(parse_url("wss://localhost:8081/mqtt").unwrap().scheme, Scheme::Wss));
    }

    #[test]
    fn parse_url_rejects_unknown_scheme() {
        assert!(parse_url("quic://localhost:1883").is_err());
    }

    #[test]
    fn parse_url_rejects_missing_port() {
        assert!(parse_url("tcp://localhost").is_err());
    }
}
