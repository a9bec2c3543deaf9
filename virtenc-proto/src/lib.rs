//! Wire protocol between the virtual-enclave supervisor and the child
//! process standing in for the enclave.
//!
//! Control traffic is framed request/response messages over connected
//! sockets; bulk data never rides in a frame, it goes through the
//! shared heap and is referenced by offset.

pub mod error;
pub mod fdpass;
pub mod frame;
pub mod heap;

use enum_as_inner::EnumAsInner;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

pub use error::{ProtoError, Result};

/// Written by the host at the heap base before INIT is sent.
pub const HEAP_SENTINEL: u64 = 0xFFFF_FFFF_FFFF_FFFF;
/// Written over the sentinel by the child once it can reach the heap.
pub const HEAP_MAGIC: u64 = 0x7665_6865_6170_6F6B;

/// Fixed-width tag carried in every frame header. A request and its
/// response share the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum MsgType {
    Init = 1,
    AddThread = 2,
    PingThread = 3,
    Terminate = 4,
}

/// A byte range inside the shared heap. Addresses never cross the
/// boundary; the receiving side validates the range against the heap
/// extent before touching it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSlice {
    pub offset: u64,
    pub len: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum CtrlRequest {
    /// Sent on the boot channel. `sock` is the child-side descriptor
    /// number of the control socket the child must adopt.
    Init {
        sock: i32,
        heap_id: String,
        heap_base: u64,
        heap_size: u64,
    },
    /// The private channel's descriptor follows this message
    /// out-of-band on the control socket.
    AddThread { tcs: u32, stack_size: u64 },
    PingThread { value: u64, msg: HeapSlice },
    Terminate,
}

#[derive(Serialize, Deserialize, EnumAsInner, Debug, Clone, PartialEq, Eq)]
pub enum CtrlResponse {
    Init { ret: i32 },
    AddThread { ret: i32 },
    PingThread { ret: i32, value: u64 },
    Terminate { ret: i32 },
}

impl CtrlRequest {
    pub fn msg_type(&self) -> MsgType {
        match self {
            CtrlRequest::Init { .. } => MsgType::Init,
            CtrlRequest::AddThread { .. } => MsgType::AddThread,
            CtrlRequest::PingThread { .. } => MsgType::PingThread,
            CtrlRequest::Terminate => MsgType::Terminate,
        }
    }
}

impl CtrlResponse {
    pub fn msg_type(&self) -> MsgType {
        match self {
            CtrlResponse::Init { .. } => MsgType::Init,
            CtrlResponse::AddThread { .. } => MsgType::AddThread,
            CtrlResponse::PingThread { .. } => MsgType::PingThread,
            CtrlResponse::Terminate { .. } => MsgType::Terminate,
        }
    }
}

/// Anything that travels in a frame: serializable plus a fixed-width
/// tag for the header.
pub trait WireMessage: Serialize + serde::de::DeserializeOwned {
    fn msg_type(&self) -> MsgType;
}

impl WireMessage for CtrlRequest {
    fn msg_type(&self) -> MsgType {
        CtrlRequest::msg_type(self)
    }
}

impl WireMessage for CtrlResponse {
    fn msg_type(&self) -> MsgType {
        CtrlResponse::msg_type(self)
    }
}
