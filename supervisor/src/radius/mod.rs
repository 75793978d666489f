//! Embedded RADIUS authentication server
//!
//! Listens for Access-Requests from the AP daemon, resolves the station
//! identity (the MAC) through the supervisor callback and answers with the
//! dynamic-VLAN tunnel attributes, carrying the per-device PSK as an RFC
//! 2868 Tunnel-Password when one is assigned. Rejected or unknown
//! identities get an Access-Reject. Errors on this path are logged and the
//! packet dropped; the protocol retransmits.

pub mod eap;
pub mod packet;

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::state::MacAddr;

use eap::EapConfig;
use packet::{attr, Attribute, Packet};

/// Identity decision handed back by the supervisor.
#[derive(Debug, Clone)]
pub struct RadiusIdentity {
    pub vlan_id: u16,
    /// Device PSK; `None` means VLAN-only (no Tunnel-Password attribute).
    pub psk: Option<Vec<u8>>,
    /// Memoized Tunnel-Password salt so retransmissions reuse identical
    /// attribute bytes.
    pub tunnel_salt: [u8; 2],
}

/// Supervisor-side lookup the server consults for every Access-Request.
/// Returning `None` rejects the station.
pub trait IdentitySource: Send + Sync + 'static {
    fn identify(&self, mac: MacAddr) -> impl Future<Output = Option<RadiusIdentity>> + Send;
}

/// Server settings (from the `[radius]` configuration section).
#[derive(Debug, Clone)]
pub struct RadiusServerConfig {
    pub port: u16,
    pub secret: Vec<u8>,
    pub client_ip: Ipv4Addr,
    pub client_mask: u8,
    pub eap: EapConfig,
}

pub struct RadiusServer<S> {
    config: RadiusServerConfig,
    source: Arc<S>,
    metrics: Arc<Metrics>,
}

/// Station identity from User-Name, falling back to Calling-Station-Id.
fn extract_identity(request: &Packet) -> Option<MacAddr> {
    for typ in [attr::USER_NAME, attr::CALLING_STATION_ID] {
        if let Some(value) = request.first(typ) {
            let text = String::from_utf8_lossy(value);
            if let Some(mac) = MacAddr::parse_flexible(&text) {
                return Some(mac);
            }
        }
    }
    None
}

/// The Access-Accept attribute chain for an allowed identity.
fn build_tunnel_attrs(
    identity: &RadiusIdentity,
    request_auth: &[u8; 16],
    secret: &[u8],
) -> Vec<Attribute> {
    let mut reply = Packet::new(packet::CODE_ACCESS_ACCEPT, 0);
    reply.push_tagged_u32(attr::TUNNEL_TYPE, packet::TUNNEL_TYPE_VLAN);
    reply.push_tagged_u32(attr::TUNNEL_MEDIUM_TYPE, packet::TUNNEL_MEDIUM_IEEE_802);
    reply.push(
        attr::TUNNEL_PRIVATE_GROUP_ID,
        identity.vlan_id.to_string().into_bytes(),
    );

    if let Some(psk) = identity.psk.as_deref().filter(|p| !p.is_empty()) {
        let mut value = vec![0x00];
        value.extend(packet::tunnel_password_encrypt(
            secret,
            request_auth,
            identity.tunnel_salt,
            psk,
        ));
        reply.push(attr::TUNNEL_PASSWORD, value);
    }

    reply.attributes
}

impl<S: IdentitySource> RadiusServer<S> {
    pub fn new(config: RadiusServerConfig, source: Arc<S>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            source,
            metrics,
        }
    }

    fn client_allowed(&self, addr: &SocketAddr) -> bool {
        let SocketAddr::V4(v4) = addr else {
            return false;
        };
        let mask = if self.config.client_mask == 0 {
            0
        } else {
            u32::MAX << (32 - self.config.client_mask as u32)
        };
        (u32::from(*v4.ip()) & mask) == (u32::from(self.config.client_ip) & mask)
    }

    /// Decode, decide and encode a reply for one request datagram.
    pub async fn handle_packet(&self, data: &[u8]) -> Option<Vec<u8>> {
        let request = match Packet::parse(data) {
            Ok(request) => request,
            Err(e) => {
                debug!("Dropping undecodable RADIUS packet: {}", e);
                return None;
            }
        };

        if request.code != packet::CODE_ACCESS_REQUEST {
            debug!("Ignoring RADIUS code {}", request.code);
            return None;
        }
        if !packet::verify_message_authenticator(&request, &self.config.secret) {
            warn!("Dropping request {} with bad Message-Authenticator", request.identifier);
            return None;
        }

        self.metrics.radius_requests_total.inc();

        let decision = match extract_identity(&request) {
            Some(mac) => self.source.identify(mac).await,
            None => {
                debug!("Access-Request {} carries no station identity", request.identifier);
                None
            }
        };

        let mut reply = match decision {
            Some(identity) => {
                let mut reply = Packet::new(packet::CODE_ACCESS_ACCEPT, request.identifier);
                reply.attributes =
                    build_tunnel_attrs(&identity, &request.authenticator, &self.config.secret);
                reply
            }
            None => {
                self.metrics.radius_rejects_total.inc();
                Packet::new(packet::CODE_ACCESS_REJECT, request.identifier)
            }
        };

        // Mirror the request's Message-Authenticator usage.
        if request.first(attr::MESSAGE_AUTHENTICATOR).is_some() {
            reply.push(attr::MESSAGE_AUTHENTICATOR, vec![0u8; 16]);
        }
        packet::seal_response(&mut reply, &request.authenticator, &self.config.secret);
        Some(reply.encode())
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.config.port))
            .await
            .with_context(|| format!("Failed to bind RADIUS port {}", self.config.port))?;
        info!(
            "RADIUS server on port {} ({} EAP methods registered)",
            self.config.port,
            self.config.eap.methods.len()
        );

        let mut buf = vec![0u8; packet::MAX_PACKET];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("RADIUS server shutting down");
                    break;
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, addr) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("RADIUS socket error: {}", e);
                            continue;
                        }
                    };
                    if !self.client_allowed(&addr) {
                        debug!("Dropping RADIUS packet from unauthorized client {}", addr);
                        continue;
                    }
                    if let Some(reply) = self.handle_packet(&buf[..len]).await {
                        if let Err(e) = socket.send_to(&reply, addr).await {
                            warn!("Failed to send RADIUS reply to {}: {}", addr, e);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        identity: Option<RadiusIdentity>,
    }

    impl IdentitySource for FixedSource {
        async fn identify(&self, _mac: MacAddr) -> Option<RadiusIdentity> {
            self.identity.clone()
        }
    }

    fn server(identity: Option<RadiusIdentity>) -> RadiusServer<FixedSource> {
        let config = RadiusServerConfig {
            port: 1812,
            secret: b"radius-secret".to_vec(),
            client_ip: "127.0.0.1".parse().unwrap(),
            client_mask: 32,
            eap: EapConfig::default(),
        };
        RadiusServer::new(
            config,
            Arc::new(FixedSource { identity }),
            Metrics::new().unwrap(),
        )
    }

    fn access_request(identifier: u8) -> Packet {
        let mut request = Packet::new(packet::CODE_ACCESS_REQUEST, identifier);
        request.authenticator = [7u8; 16];
        request.push(attr::USER_NAME, b"aabbccddeeff".to_vec());
        request
    }

    fn attr_of(reply: &Packet, typ: u8) -> Option<Vec<u8>> {
        reply.first(typ).map(<[u8]>::to_vec)
    }

    #[tokio::test]
    async fn test_accept_carries_vlan_attributes() {
        let server = server(Some(RadiusIdentity {
            vlan_id: 5,
            psk: None,
            tunnel_salt: [0x80, 0x01],
        }));

        let bytes = server
            .handle_packet(&access_request(9).encode())
            .await
            .unwrap();
        let reply = Packet::parse(&bytes).unwrap();

        assert_eq!(reply.code, packet::CODE_ACCESS_ACCEPT);
        assert_eq!(reply.identifier, 9);
        assert_eq!(
            attr_of(&reply, attr::TUNNEL_TYPE).unwrap(),
            vec![0x00, 0x00, 0x00, 13]
        );
        assert_eq!(
            attr_of(&reply, attr::TUNNEL_MEDIUM_TYPE).unwrap(),
            vec![0x00, 0x00, 0x00, 6]
        );
        assert_eq!(
            attr_of(&reply, attr::TUNNEL_PRIVATE_GROUP_ID).unwrap(),
            b"5".to_vec()
        );
        assert!(attr_of(&reply, attr::TUNNEL_PASSWORD).is_none());
    }

    #[tokio::test]
    async fn test_accept_with_psk_carries_tunnel_password() {
        let server = server(Some(RadiusIdentity {
            vlan_id: 7,
            psk: Some(b"device-psk".to_vec()),
            tunnel_salt: [0x8a, 0x21],
        }));

        let request = access_request(3);
        let bytes = server.handle_packet(&request.encode()).await.unwrap();
        let reply = Packet::parse(&bytes).unwrap();

        let value = attr_of(&reply, attr::TUNNEL_PASSWORD).unwrap();
        assert_eq!(value[0], 0x00);
        let plain = packet::tunnel_password_decrypt(
            b"radius-secret",
            &request.authenticator,
            &value[1..],
        )
        .unwrap();
        assert_eq!(plain, b"device-psk");
    }

    #[tokio::test]
    async fn test_retransmission_gets_identical_reply() {
        let server = server(Some(RadiusIdentity {
            vlan_id: 7,
            psk: Some(b"device-psk".to_vec()),
            tunnel_salt: [0x8a, 0x21],
        }));

        let encoded = access_request(3).encode();
        let first = server.handle_packet(&encoded).await.unwrap();
        let second = server.handle_packet(&encoded).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_reject_for_unknown_identity() {
        let server = server(None);
        let bytes = server
            .handle_packet(&access_request(1).encode())
            .await
            .unwrap();
        let reply = Packet::parse(&bytes).unwrap();

        assert_eq!(reply.code, packet::CODE_ACCESS_REJECT);
        assert!(reply.attributes.is_empty());
    }

    #[tokio::test]
    async fn test_reject_without_identity_attribute() {
        let server = server(Some(RadiusIdentity {
            vlan_id: 5,
            psk: None,
            tunnel_salt: [0x80, 0x01],
        }));

        let mut request = Packet::new(packet::CODE_ACCESS_REQUEST, 2);
        request.authenticator = [1u8; 16];
        let bytes = server.handle_packet(&request.encode()).await.unwrap();
        let reply = Packet::parse(&bytes).unwrap();
        assert_eq!(reply.code, packet::CODE_ACCESS_REJECT);
    }

    #[tokio::test]
    async fn test_non_request_is_dropped() {
        let server = server(None);
        let other = Packet::new(packet::CODE_ACCESS_ACCEPT, 1).encode();
        assert!(server.handle_packet(&other).await.is_none());
        assert!(server.handle_packet(&[0u8; 3]).await.is_none());
    }

    #[test]
    fn test_client_network_filter() {
        let server = server(None);
        assert!(server.client_allowed(&"127.0.0.1:5000".parse().unwrap()));
        assert!(!server.client_allowed(&"127.0.0.2:5000".parse().unwrap()));
        assert!(!server.client_allowed(&"[::1]:5000".parse().unwrap()));
    }

    #[test]
    fn test_extract_identity_prefers_user_name() {
        let mut request = Packet::new(packet::CODE_ACCESS_REQUEST, 0);
        request.push(attr::USER_NAME, b"aabbccddeeff".to_vec());
        request.push(attr::CALLING_STATION_ID, b"11-22-33-44-55-66".to_vec());
        assert_eq!(
            extract_identity(&request),
            Some("aa:bb:cc:dd:ee:ff".parse().unwrap())
        );

        let mut fallback = Packet::new(packet::CODE_ACCESS_REQUEST, 0);
        fallback.push(attr::USER_NAME, b"not-a-mac".to_vec());
        fallback.push(attr::CALLING_STATION_ID, b"11-22-33-44-55-66".to_vec());
        assert_eq!(
            extract_identity(&fallback),
            Some("11:22:33:44:55:66".parse().unwrap())
        );
    }
}
