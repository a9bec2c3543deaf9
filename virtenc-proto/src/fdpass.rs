//! Descriptor passing over the control socket.
//!
//! Provisioning a thread hands the child one end of a fresh socket
//! pair. That transfer is a capability move, not payload bytes: the
//! kernel duplicates the descriptor into the receiving process, and
//! the sender's copy survives only so the supervisor can close it at
//! teardown.

use std::os::unix::io::RawFd;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoVec;

use crate::error::{ProtoError, Result};

pub fn send_fd(channel: RawFd, fd: RawFd) -> Result<()> {
    let marker = [0u8; 1];
    let iov = [IoVec::from_slice(&marker)];
    let cmsgs = [ControlMessage::ScmRights(&[fd])];
    sendmsg(channel, &iov, &cmsgs, MsgFlags::empty(), None)
        .map_err(|errno| ProtoError::sys("sendmsg", errno))?;
    Ok(())
}

pub fn recv_fd(channel: RawFd) -> Result<RawFd> {
    let mut marker = [0u8; 1];
    let iov = [IoVec::from_mut_slice(&mut marker)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg(channel, &iov, Some(&mut cmsg_buffer), MsgFlags::empty())
        .map_err(|errno| ProtoError::sys("recvmsg", errno))?;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                return Ok(fd);
            }
        }
    }
    Err(ProtoError::NoDescriptor)
}
