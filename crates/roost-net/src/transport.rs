//! WebSocket dialing, direct or through the anonymizing tunnel.
//!
//! Proxied dials hand the *hostname* to the SOCKS endpoint rather than
//! resolving it locally, so DNS lookups cannot leak outside the tunnel.

use std::pin::Pin;

use futures_util::stream::BoxStream;
use futures_util::{Sink, StreamExt};
use nostr::RelayUrl;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async_tls, connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::proxy::ProxyService;
use crate::{Error, Result};

/// Boxed halves of an established WebSocket session, erasing whether the
/// underlying stream runs through the tunnel.
pub(crate) type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub(crate) type WsStream = BoxStream<'static, std::result::Result<Message, WsError>>;

/// Establish a WebSocket session to `url`.
///
/// Routes through the SOCKS tunnel whenever the proxy service reports it
/// active; otherwise dials directly.
pub(crate) async fn dial(url: &RelayUrl, proxy: &ProxyService) -> Result<(WsSink, WsStream)> {
    match proxy.socks_endpoint() {
        Some(endpoint) => {
            let (host, port) = host_port(url)?;
            let tcp = Socks5Stream::connect(endpoint, (host.as_str(), port)).await?;
            let (ws, _response) = client_async_tls(url.as_str(), tcp).await?;
            Ok(split_boxed(ws))
        }
        None => {
            let (ws, _response) = connect_async(url.as_str()).await?;
            Ok(split_boxed(ws))
        }
    }
}

fn split_boxed<S>(ws: WebSocketStream<MaybeTlsStream<S>>) -> (WsSink, WsStream)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (Box::pin(sink), stream.boxed())
}

/// Extract the hostname and effective port for a SOCKS CONNECT.
fn host_port(url: &RelayUrl) -> Result<(String, u16)> {
    let parsed = Url::parse(url.as_str()).map_err(|e| {
        Error::Core(roost_core::Error::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })
    })?;
    let host = parsed
        .host_str()
        .ok_or_else(|| {
            Error::Core(roost_core::Error::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".to_string(),
            })
        })?
        .to_string();
    let port = parsed
        .port_or_known_default()
        .unwrap_or(if parsed.scheme() == "ws" { 80 } else { 443 });
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port_defaults() {
        let url = RelayUrl::parse("wss://relay.example.com").expect("valid url");
        let (host, port) = host_port(&url).expect("host/port");
        assert_eq!(host, "relay.example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_host_port_onion_with_port() {
        let url = RelayUrl::parse("ws://abcdefghijklmnop.onion:8080").expect("valid url");
        let (host, port) = host_port(&url).expect("host/port");
        assert_eq!(host, "abcdefghijklmnop.onion");
        assert_eq!(port, 8080);
    }
}
