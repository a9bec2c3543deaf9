use thiserror::Error;

use crate::MsgType;

pub type Result<T> = core::result::Result<T, ProtoError>;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("control channel i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("message codec: {0}")]
    Codec(#[from] postcard::Error),

    #[error("bad frame magic {0:#010x}")]
    BadMagic(u32),

    #[error("unknown message type {0}")]
    UnknownType(u16),

    #[error("expected a {expected:?} message, got {got:?}")]
    WrongType { expected: MsgType, got: MsgType },

    #[error("header says {header:?} but the payload decodes as {payload:?}")]
    TypeMismatch { header: MsgType, payload: MsgType },

    #[error("frame of {0} bytes exceeds the frame bound")]
    FrameTooLarge(usize),

    #[error("{op} failed: {errno}")]
    Sys { op: &'static str, errno: nix::Error },

    #[error("no descriptor attached to the control message")]
    NoDescriptor,

    #[error("heap range {offset:#x}+{len:#x} outside a heap of {heap:#x} bytes")]
    HeapBounds { offset: u64, len: u64, heap: u64 },
}

impl ProtoError {
    pub(crate) fn sys(op: &'static str, errno: nix::Error) -> ProtoError {
        ProtoError::Sys { op, errno }
    }
}
