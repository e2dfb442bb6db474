//! UDP transport for control messages

use crate::packet::{decode_reply, encode_request, ControlReply, ControlRequest};
use crate::CoaError;
use async_trait::async_trait;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// Transport seam so callers can run against a fake NAS in tests.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn send(
        &self,
        request: &ControlRequest,
        secret: &str,
        port: u16,
    ) -> Result<ControlReply, CoaError>;
}

/// Real transport: one datagram out, one reply back, bounded wait.
pub struct UdpControlChannel {
    timeout: Duration,
}

impl UdpControlChannel {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ControlChannel for UdpControlChannel {
    async fn send(
        &self,
        request: &ControlRequest,
        secret: &str,
        port: u16,
    ) -> Result<ControlReply, CoaError> {
        let identifier: u8 = rand::thread_rng().gen();
        let packet = encode_request(request, identifier, secret.as_bytes())?;

        let bind_addr = match request.nas_address {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        let target = SocketAddr::new(request.nas_address, port);
        socket.send_to(&packet, target).await?;

        debug!(
            nas = %request.nas_address,
            action = ?request.action,
            identifier,
            "control request sent"
        );

        let mut buf = [0u8; 4096];
        let received = tokio::time::timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| CoaError::Timeout)?;
        let (len, _from) = received?;

        decode_reply(&buf[..len], identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ControlAction, DISCONNECT_REQUEST};

    fn request(nas_address: IpAddr) -> ControlRequest {
        ControlRequest {
            action: ControlAction::Disconnect,
            username: "u1".to_string(),
            session_id: None,
            nas_address,
            rate_limit: None,
            session_timeout: None,
        }
    }

    /// Loopback NAS that acks one disconnect.
    async fn fake_nas() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            assert!(len >= 20);
            assert_eq!(buf[0], DISCONNECT_REQUEST);
            let mut reply = [0u8; 20];
            reply[0] = buf[0] + 1;
            reply[1] = buf[1];
            reply[3] = 20;
            socket.send_to(&reply, from).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_loopback_ack() {
        let port = fake_nas().await;
        let channel = UdpControlChannel::new(Duration::from_secs(2));

        let reply = channel
            .send(&request("127.0.0.1".parse().unwrap()), "secret", port)
            .await
            .unwrap();
        assert_eq!(reply, ControlReply::Ack);
    }

    #[tokio::test]
    async fn test_silent_nas_times_out() {
        // Nothing listening; the socket just never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let channel = UdpControlChannel::new(Duration::from_millis(50));

        let err = channel
            .send(&request("127.0.0.1".parse().unwrap()), "secret", port)
            .await
            .unwrap_err();
        assert!(matches!(err, CoaError::Timeout));
    }
}
