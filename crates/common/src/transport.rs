//! Transport abstraction: a connected duplex channel of text frames.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::protocol::Message, Connector as TlsConnector,
};
use tracing::{debug, info};
use url::Url;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An established connection to the upstream feed.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Establishes transport connections. Each call is one connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Transport>;
}

/// WebSocket connector (TLS via rustls with the platform root store).
pub struct WsConnector {
    url: Url,
    tcp_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            url: Url::parse(url)?,
            tcp_timeout: Duration::from_secs(5),
        })
    }

    /// Connector for a feed that authenticates with a `token` query parameter.
    pub fn with_token(url: &str, token: &str) -> Result<Self> {
        let mut connector = Self::new(url)?;
        connector.url.query_pairs_mut().append_pair("token", token);
        Ok(connector)
    }

    /// URL with the token redacted, for logs.
    pub fn display_url(&self) -> String {
        let mut shown = self.url.clone();
        shown.set_query(None);
        shown.to_string()
    }

    async fn open_tcp(&self) -> Result<TcpStream> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| Error::TransportFailure("No host in URL".to_string()))?;
        let port = self.url.port_or_known_default().unwrap_or(443);
        let addr_str = format!("{}:{}", host, port);

        // Prefer IPv4 to avoid IPv6 timeout issues
        let addrs: Vec<SocketAddr> = lookup_host(&addr_str)
            .await
            .map_err(|e| Error::TransportFailure(format!("DNS resolution failed: {}", e)))?
            .collect();
        let sorted_addrs = prefer_ipv4(addrs);

        for addr in &sorted_addrs {
            debug!("Trying to connect to {}", addr);
            match tokio::time::timeout(self.tcp_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => debug!("TCP connect to {} failed: {}", addr, e),
                Err(_) => debug!("TCP connect to {} timed out", addr),
            }
        }

        Err(Error::TransportFailure(
            "All connection attempts failed".to_string(),
        ))
    }

    fn tls_connector(&self) -> Result<Option<TlsConnector>> {
        if self.url.scheme() != "wss" {
            return Ok(None);
        }

        let mut root_store = rustls::RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            let _ = root_store.add(cert);
        }

        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::TransportFailure(format!("TLS config error: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Some(TlsConnector::Rustls(Arc::new(config))))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Transport> {
        let tcp_stream = self.open_tcp().await?;
        let tls = self.tls_connector()?;

        let (ws_stream, response) =
            client_async_tls_with_config(self.url.as_str(), tcp_stream, None, tls).await?;
        debug!("WebSocket handshake complete, status: {:?}", response.status());

        let (write, read) = ws_stream.split();
        let sink = write
            .sink_map_err(Error::from)
            .with(|text: String| future::ready(Ok::<_, Error>(Message::Text(text))));

        // tungstenite answers pings itself; only text frames carry protocol data.
        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    info!("Received close frame: {:?}", frame);
                    Some(Err(Error::ConnectionClosed))
                }
                Ok(Message::Binary(data)) => {
                    debug!("Ignoring {} byte binary frame", data.len());
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(Error::WebSocket(e))),
            })
        });

        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// IPv4 addresses first, resolver order kept within each family.
fn prefer_ipv4(addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let (mut v4, v6): (Vec<_>, Vec<_>) = addrs.into_iter().partition(SocketAddr::is_ipv4);
    v4.extend(v6);
    v4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_appended_and_redacted() {
        let connector =
            WsConnector::with_token("wss://stream.example.io/socket/websocket", "secret").unwrap();
        assert_eq!(
            connector.url.as_str(),
            "wss://stream.example.io/socket/websocket?token=secret"
        );
        assert_eq!(
            connector.display_url(),
            "wss://stream.example.io/socket/websocket"
        );
    }

    #[test]
    fn test_plain_ws_needs_no_tls() {
        let connector = WsConnector::new("ws://127.0.0.1:4000/socket").unwrap();
        assert!(connector.tls_connector().unwrap().is_none());
        assert!(WsConnector::new("not a url").is_err());
    }

    #[test]
    fn test_ipv4_addresses_tried_first() {
        let addrs: Vec<SocketAddr> = ["[::1]:443", "10.0.0.2:443", "[fe80::1]:443", "10.0.0.1:443"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();
        let ordered: Vec<String> = prefer_ipv4(addrs).iter().map(|a| a.to_string()).collect();
        assert_eq!(
            ordered,
            vec!["10.0.0.2:443", "10.0.0.1:443", "[::1]:443", "[fe80::1]:443"]
        );
    }

    #[tokio::test]
    async fn test_resolves_host_without_blocking() {
        let connector = WsConnector::new("ws://localhost:1/socket").unwrap();
        // Resolution succeeds; nothing listens on port 1.
        let result = connector.open_tcp().await;
        assert!(matches!(result, Err(Error::TransportFailure(_))));
    }
}
