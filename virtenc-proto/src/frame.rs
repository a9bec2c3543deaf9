//! Length/type-prefixed frames over a byte stream.
//!
//! Header layout, little-endian: `magic: u32`, `type: u16`, two
//! reserved bytes, `len: u32`, followed by `len` bytes of postcard
//! payload. Channels carry one exchange at a time; a frame of the
//! wrong type is a protocol error, not something to queue.

use std::convert::TryFrom;
use std::io::{Read, Write};

use crate::error::{ProtoError, Result};
use crate::{MsgType, WireMessage};

pub const FRAME_MAGIC: u32 = 0x5645_4D47;

const HEADER_LEN: usize = 12;

fn encode_header(msg_type: MsgType, len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&u16::from(msg_type).to_le_bytes());
    header[8..12].copy_from_slice(&len.to_le_bytes());
    header
}

pub fn send_msg<W, M>(channel: &mut W, msg: &M) -> Result<()>
where
    W: Write,
    M: WireMessage,
{
    let payload = postcard::to_allocvec(msg)?;
    if payload.len() > kconfig::VE_MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(payload.len()));
    }
    channel.write_all(&encode_header(msg.msg_type(), payload.len() as u32))?;
    channel.write_all(&payload)?;
    channel.flush()?;
    Ok(())
}

pub fn recv_msg<R, M>(channel: &mut R) -> Result<M>
where
    R: Read,
    M: WireMessage,
{
    let mut header = [0u8; HEADER_LEN];
    channel.read_exact(&mut header)?;

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != FRAME_MAGIC {
        return Err(ProtoError::BadMagic(magic));
    }
    let raw_type = u16::from_le_bytes([header[4], header[5]]);
    let header_type =
        MsgType::try_from(raw_type).map_err(|_| ProtoError::UnknownType(raw_type))?;
    let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if len > kconfig::VE_MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    channel.read_exact(&mut payload)?;
    let msg: M = postcard::from_bytes(&payload)?;
    if msg.msg_type() != header_type {
        return Err(ProtoError::TypeMismatch {
            header: header_type,
            payload: msg.msg_type(),
        });
    }
    Ok(msg)
}

/// Receive a frame that must carry the given type. Used wherever a
/// side is blocked on the response to its own request.
pub fn recv_msg_by_type<R, M>(channel: &mut R, expected: MsgType) -> Result<M>
where
    R: Read,
    M: WireMessage,
{
    let msg: M = recv_msg(channel)?;
    if msg.msg_type() != expected {
        return Err(ProtoError::WrongType {
            expected,
            got: msg.msg_type(),
        });
    }
    Ok(msg)
}
