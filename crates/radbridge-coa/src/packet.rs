//! Control packet codec
//!
//! Wire layout: 1-byte code, 1-byte identifier, 2-byte big-endian length,
//! 16-byte request authenticator, then attribute TLVs. The authenticator is
//! MD5 over the packet with a zeroed authenticator field followed by the
//! shared secret.

use crate::CoaError;
use bytes::{BufMut, BytesMut};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

// Packet codes
pub const DISCONNECT_REQUEST: u8 = 40;
pub const DISCONNECT_ACK: u8 = 41;
pub const DISCONNECT_NAK: u8 = 42;
pub const COA_REQUEST: u8 = 43;
pub const COA_ACK: u8 = 44;
pub const COA_NAK: u8 = 45;

// Attribute types
const ATTR_USER_NAME: u8 = 1;
const ATTR_NAS_IP_ADDRESS: u8 = 4;
const ATTR_SESSION_TIMEOUT: u8 = 27;
const ATTR_ACCT_SESSION_ID: u8 = 44;
const ATTR_VENDOR_SPECIFIC: u8 = 26;

// MikroTik vendor space
const VENDOR_MIKROTIK: u32 = 14988;
const VENDOR_ATTR_RATE_LIMIT: u8 = 8;

const HEADER_LEN: usize = 20;
const MAX_PACKET: usize = 4096;

/// What the control message asks the NAS to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlAction {
    /// Terminate the session now
    Disconnect,
    /// Apply new attributes to the live session
    ChangeAuthorization,
}

/// A control message aimed at one session on one NAS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
    pub username: String,
    /// More precise targeting when the session id is known
    pub session_id: Option<String>,
    pub nas_address: IpAddr,
    /// New rate-limit string for attribute changes
    pub rate_limit: Option<String>,
    pub session_timeout: Option<u32>,
}

/// NAS answer to a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Ack,
    Nak,
}

/// Encode a request into wire bytes with a computed authenticator.
pub fn encode_request(
    request: &ControlRequest,
    identifier: u8,
    secret: &[u8],
) -> Result<Vec<u8>, CoaError> {
    let mut attrs = BytesMut::new();
    put_string_attr(&mut attrs, ATTR_USER_NAME, &request.username)?;

    if let IpAddr::V4(v4) = request.nas_address {
        attrs.put_u8(ATTR_NAS_IP_ADDRESS);
        attrs.put_u8(6);
        attrs.put_slice(&v4.octets());
    }

    if let Some(session_id) = &request.session_id {
        put_string_attr(&mut attrs, ATTR_ACCT_SESSION_ID, session_id)?;
    }

    if request.action == ControlAction::ChangeAuthorization {
        if let Some(rate_limit) = &request.rate_limit {
            put_rate_limit_attr(&mut attrs, rate_limit)?;
        }
        if let Some(timeout) = request.session_timeout {
            attrs.put_u8(ATTR_SESSION_TIMEOUT);
            attrs.put_u8(6);
            attrs.put_u32(timeout);
        }
    }

    let length = HEADER_LEN + attrs.len();
    if length > MAX_PACKET {
        return Err(CoaError::Encode("packet exceeds maximum size".to_string()));
    }

    let code = match request.action {
        ControlAction::Disconnect => DISCONNECT_REQUEST,
        ControlAction::ChangeAuthorization => COA_REQUEST,
    };

    let mut packet = BytesMut::with_capacity(length);
    packet.put_u8(code);
    packet.put_u8(identifier);
    packet.put_u16(length as u16);
    packet.put_slice(&[0u8; 16]);
    packet.put_slice(&attrs);

    // Authenticator: MD5(code + id + length + zero-auth + attributes + secret)
    let mut hasher = Md5::new();
    hasher.update(&packet);
    hasher.update(secret);
    let digest = hasher.finalize();
    packet[4..20].copy_from_slice(&digest);

    Ok(packet.to_vec())
}

/// Parse a reply, checking the identifier matches the request we sent.
pub fn decode_reply(buf: &[u8], expected_identifier: u8) -> Result<ControlReply, CoaError> {
    if buf.len() < HEADER_LEN {
        return Err(CoaError::MalformedReply);
    }
    if buf[1] != expected_identifier {
        return Err(CoaError::IdentifierMismatch);
    }
    match buf[0] {
        DISCONNECT_ACK | COA_ACK => Ok(ControlReply::Ack),
        DISCONNECT_NAK | COA_NAK => Ok(ControlReply::Nak),
        _ => Err(CoaError::MalformedReply),
    }
}

fn put_string_attr(buf: &mut BytesMut, attr_type: u8, value: &str) -> Result<(), CoaError> {
    let bytes = value.as_bytes();
    if bytes.len() > 253 {
        return Err(CoaError::Encode(format!(
            "attribute {attr_type} value too long"
        )));
    }
    buf.put_u8(attr_type);
    buf.put_u8((bytes.len() + 2) as u8);
    buf.put_slice(bytes);
    Ok(())
}

fn put_rate_limit_attr(buf: &mut BytesMut, rate_limit: &str) -> Result<(), CoaError> {
    let bytes = rate_limit.as_bytes();
    // Vendor-specific: outer TLV + vendor id + inner TLV
    let inner_len = bytes.len() + 2;
    let outer_len = inner_len + 6;
    if outer_len > 255 {
        return Err(CoaError::Encode("rate-limit value too long".to_string()));
    }
    buf.put_u8(ATTR_VENDOR_SPECIFIC);
    buf.put_u8(outer_len as u8);
    buf.put_u32(VENDOR_MIKROTIK);
    buf.put_u8(VENDOR_ATTR_RATE_LIMIT);
    buf.put_u8(inner_len as u8);
    buf.put_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(action: ControlAction) -> ControlRequest {
        ControlRequest {
            action,
            username: "u1".to_string(),
            session_id: Some("sess-1".to_string()),
            nas_address: "10.8.0.5".parse().unwrap(),
            rate_limit: Some("5000k/10000k".to_string()),
            session_timeout: None,
        }
    }

    #[test]
    fn test_disconnect_encoding() {
        let packet = encode_request(&request(ControlAction::Disconnect), 7, b"secret").unwrap();

        assert_eq!(packet[0], DISCONNECT_REQUEST);
        assert_eq!(packet[1], 7);
        let length = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        assert_eq!(length, packet.len());

        // Disconnect carries no reply attributes, so no vendor TLV.
        assert!(!packet[HEADER_LEN..].contains(&ATTR_VENDOR_SPECIFIC));
    }

    #[test]
    fn test_coa_carries_rate_limit() {
        let packet =
            encode_request(&request(ControlAction::ChangeAuthorization), 9, b"secret").unwrap();

        assert_eq!(packet[0], COA_REQUEST);
        let body = &packet[HEADER_LEN..];
        let vendor_pos = body.iter().position(|&b| b == ATTR_VENDOR_SPECIFIC).unwrap();
        let vendor_id = u32::from_be_bytes([
            body[vendor_pos + 2],
            body[vendor_pos + 3],
            body[vendor_pos + 4],
            body[vendor_pos + 5],
        ]);
        assert_eq!(vendor_id, VENDOR_MIKROTIK);
    }

    #[test]
    fn test_authenticator_depends_on_secret() {
        let req = request(ControlAction::Disconnect);
        let a = encode_request(&req, 1, b"secret-a").unwrap();
        let b = encode_request(&req, 1, b"secret-b").unwrap();

        assert_ne!(a[4..20], b[4..20]);
        assert_eq!(a[HEADER_LEN..], b[HEADER_LEN..]);
    }

    #[test]
    fn test_decode_reply_codes() {
        let mut ack = vec![0u8; HEADER_LEN];
        ack[0] = DISCONNECT_ACK;
        ack[1] = 3;
        assert_eq!(decode_reply(&ack, 3).unwrap(), ControlReply::Ack);

        ack[0] = COA_NAK;
        assert_eq!(decode_reply(&ack, 3).unwrap(), ControlReply::Nak);

        assert!(matches!(
            decode_reply(&ack, 4).unwrap_err(),
            CoaError::IdentifierMismatch
        ));
        assert!(matches!(
            decode_reply(&ack[..10], 3).unwrap_err(),
            CoaError::MalformedReply
        ));
    }
}
