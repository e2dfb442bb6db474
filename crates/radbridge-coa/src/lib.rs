//! NAS control channel
//!
//! Out-of-band disconnect and attribute-change messages to a NAS's
//! well-known control port, authenticated with the NAS's registered shared
//! secret. The message shapes are fixed by the external protocol; this
//! crate only encodes, sends and matches replies.

pub mod client;
pub mod packet;

pub use client::{ControlChannel, UdpControlChannel};
pub use packet::{
    decode_reply, encode_request, ControlAction, ControlReply, ControlRequest,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoaError {
    #[error("cannot encode control request: {0}")]
    Encode(String),

    #[error("malformed control reply")]
    MalformedReply,

    #[error("reply identifier mismatch")]
    IdentifierMismatch,

    #[error("control channel timeout")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
