//! Anonymizing SOCKS tunnel service.
//!
//! The tunnel daemon itself (Tor or equivalent) runs outside this process;
//! this service owns the client side of its lifecycle: checking that the
//! local SOCKS endpoint accepts connections, publishing a status value, and
//! handing the endpoint to the transport layer. It is passed by reference
//! to whatever needs it; there is no ambient global.
//!
//! While the tunnel is active, WebSocket dials and the capability-document
//! HTTP client route through the endpoint and hostnames are passed through
//! unresolved, so DNS resolution happens at the tunnel exit.

use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::RwLock;
use roost_core::UrlPolicy;
use tokio::net::TcpStream;

/// Tunnel lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyStatus {
    /// Anonymization is off; transports dial directly.
    Disabled,
    /// `start` is probing the endpoint.
    Starting,
    /// The tunnel is reachable on the given local port.
    Connected { port: u16 },
    /// The endpoint did not accept connections. Callers may proceed
    /// without anonymization.
    Error(String),
}

/// Handle to the optional anonymizing tunnel.
pub struct ProxyService {
    endpoint: SocketAddr,
    status: RwLock<ProxyStatus>,
}

impl ProxyService {
    /// Create a service for the given local SOCKS endpoint, initially
    /// disabled.
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            status: RwLock::new(ProxyStatus::Disabled),
        }
    }

    /// Current tunnel status.
    pub fn status(&self) -> ProxyStatus {
        self.status.read().clone()
    }

    /// The SOCKS endpoint, when the tunnel is up.
    pub fn socks_endpoint(&self) -> Option<SocketAddr> {
        match *self.status.read() {
            ProxyStatus::Connected { .. } => Some(self.endpoint),
            _ => None,
        }
    }

    /// Whether transports should currently route through the tunnel.
    pub fn is_active(&self) -> bool {
        matches!(*self.status.read(), ProxyStatus::Connected { .. })
    }

    /// URL policy matching the current tunnel state: hidden-service hosts
    /// are only acceptable while the tunnel is up.
    pub fn url_policy(&self) -> UrlPolicy {
        UrlPolicy {
            allow_onion: self.is_active(),
        }
    }

    /// Probe the endpoint and mark the tunnel usable.
    ///
    /// Failure is reported through the status value, not an error: the
    /// relay core keeps working without anonymization.
    pub async fn start(&self) -> ProxyStatus {
        *self.status.write() = ProxyStatus::Starting;

        let probe = tokio::time::timeout(
            Duration::from_secs(5),
            TcpStream::connect(self.endpoint),
        )
        .await;

        let status = match probe {
            Ok(Ok(_)) => {
                tracing::info!("SOCKS tunnel up at {}", self.endpoint);
                ProxyStatus::Connected {
                    port: self.endpoint.port(),
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("SOCKS tunnel unreachable at {}: {}", self.endpoint, e);
                ProxyStatus::Error(e.to_string())
            }
            Err(_) => {
                tracing::warn!("SOCKS tunnel probe timed out at {}", self.endpoint);
                ProxyStatus::Error("probe timed out".to_string())
            }
        };

        *self.status.write() = status.clone();
        status
    }

    /// Stop routing through the tunnel.
    pub fn stop(&self) {
        *self.status.write() = ProxyStatus::Disabled;
    }

    /// A permanently disabled service, for callers that never anonymize.
    pub fn disabled() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_error() {
        // Port 1 on loopback is essentially never listening.
        let service = ProxyService::new(SocketAddr::from(([127, 0, 0, 1], 1)));
        let status = service.start().await;
        assert!(matches!(status, ProxyStatus::Error(_)));
        assert!(!service.is_active());
        assert_eq!(service.socks_endpoint(), None);
    }

    #[tokio::test]
    async fn test_reachable_endpoint_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");

        let service = ProxyService::new(addr);
        let status = service.start().await;
        assert_eq!(status, ProxyStatus::Connected { port: addr.port() });
        assert!(service.is_active());
        assert!(service.url_policy().allow_onion);

        service.stop();
        assert_eq!(service.status(), ProxyStatus::Disabled);
        assert!(!service.url_policy().allow_onion);
    }
}
