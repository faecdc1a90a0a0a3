//! Length-prefixed `MsgPack` framing for the peer plane.
//!
//! Each frame is a 4-byte big-endian length followed by a named `MsgPack`
//! body (`rmp_serde::to_vec_named()`).

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use pulseha_core::messages::{decode, encode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{DaemonError, DaemonResult};

/// Largest accepted frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub type FramedPeer<S> = Framed<S, LengthDelimitedCodec>;

/// Wraps a byte stream in the peer-plane frame codec.
pub fn framed<S: AsyncRead + AsyncWrite>(io: S, max_frame_len: usize) -> FramedPeer<S> {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_len)
        .new_framed(io)
}

/// Encodes and writes one message.
///
/// # Errors
///
/// Returns [`DaemonError::Internal`] if encoding fails and
/// [`DaemonError::Unreachable`] if the write fails.
pub async fn send_frame<S, T>(stream: &mut FramedPeer<S>, message: &T) -> DaemonResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let body = encode(message)?;
    stream
        .send(Bytes::from(body))
        .await
        .map_err(DaemonError::unreachable)
}

/// Reads and decodes one message. `Ok(None)` means the peer closed cleanly.
///
/// # Errors
///
/// Returns [`DaemonError::Unreachable`] on I/O failure and
/// [`DaemonError::Internal`] on a malformed body.
pub async fn recv_frame<S, T>(stream: &mut FramedPeer<S>) -> DaemonResult<Option<T>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    match stream.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(DaemonError::unreachable(e)),
        Some(Ok(frame)) => Ok(Some(decode(&frame)?)),
    }
}
