//! Child-side runtime of the virtual enclave.
//!
//! The process plays the trusted half of the boundary: it boots from
//! an INIT message on stdin, proves the shared heap works in both
//! directions before signing off, and then serves control traffic on
//! the adopted socket. Emulated hardware threads are real threads
//! here, each bound to a private channel passed in by the supervisor.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use virtenc_proto::frame::{recv_msg, send_msg};
use virtenc_proto::heap::{AttachedHeap, HeapRef};
use virtenc_proto::{fdpass, CtrlRequest, CtrlResponse};

/// Run the enclave side to completion. Returns the process exit code.
pub fn run() -> anyhow::Result<i32> {
    let (heap, control) = boot().context("boot from init message")?;
    serve(heap.href(), control)
}

/// Read INIT from the boot channel, attach the heap, answer the
/// crosscheck, and adopt the control socket named in the message.
fn boot() -> anyhow::Result<(AttachedHeap, UnixStream)> {
    let mut stdin = io::stdin().lock();
    let request: CtrlRequest = recv_msg(&mut stdin).context("read init request")?;
    let (sock, heap_id, heap_base, heap_size) = match request {
        CtrlRequest::Init {
            sock,
            heap_id,
            heap_base,
            heap_size,
        } => (sock, heap_id, heap_base, heap_size),
        other => anyhow::bail!("expected init, got {:?}", other.msg_type()),
    };
    log::debug!(
        "Init: heap {} ({:#x} bytes), control fd {}",
        heap_id,
        heap_size,
        sock
    );

    let control = unsafe { UnixStream::from_raw_fd(sock) };

    match AttachedHeap::attach(&heap_id, heap_size as usize, heap_base) {
        Ok(heap) => {
            if heap.href().answer_crosscheck() {
                send_msg(&mut &control, &CtrlResponse::Init { ret: 0 })
                    .context("send init response")?;
                Ok((heap, control))
            } else {
                let _ = send_msg(&mut &control, &CtrlResponse::Init { ret: -1 });
                anyhow::bail!("host sentinel missing from the shared heap");
            }
        }
        Err(err) => {
            let _ = send_msg(&mut &control, &CtrlResponse::Init { ret: -1 });
            Err(err).context("attach shared heap")
        }
    }
}

fn serve(href: HeapRef, control: UnixStream) -> anyhow::Result<i32> {
    let mut threads: Vec<(u32, JoinHandle<()>)> = Vec::new();
    loop {
        let request: CtrlRequest = recv_msg(&mut &control).context("read control request")?;
        match request {
            CtrlRequest::AddThread { tcs, stack_size } => {
                let ret = match add_thread(&mut threads, &control, href, tcs, stack_size) {
                    Ok(()) => 0,
                    Err(err) => {
                        log::error!("Failed to add thread {}: {:#}", tcs, err);
                        -1
                    }
                };
                send_msg(&mut &control, &CtrlResponse::AddThread { ret })
                    .context("send add-thread response")?;
            }
            CtrlRequest::Terminate => {
                // The supervisor tears the private channels down first,
                // so every emulated thread is already on its way out.
                for (tcs, handle) in threads.drain(..) {
                    if handle.join().is_err() {
                        log::error!("Emulated thread {} panicked", tcs);
                    }
                }
                send_msg(&mut &control, &CtrlResponse::Terminate { ret: 0 })
                    .context("send terminate response")?;
                log::debug!("Control channel terminated, exiting");
                return Ok(0);
            }
            other => {
                log::warn!("Unexpected control request {:?}, ignoring", other.msg_type());
            }
        }
    }
}

fn add_thread(
    threads: &mut Vec<(u32, JoinHandle<()>)>,
    control: &UnixStream,
    href: HeapRef,
    tcs: u32,
    stack_size: u64,
) -> anyhow::Result<()> {
    // The private channel's descriptor follows the request.
    let fd = fdpass::recv_fd(control.as_raw_fd()).context("receive thread socket")?;
    if threads.iter().any(|(id, _)| *id == tcs) {
        let _ = nix::unistd::close(fd);
        anyhow::bail!("thread {} already exists", tcs);
    }
    let sock = unsafe { UnixStream::from_raw_fd(fd) };

    let mut builder = thread::Builder::new().name(format!("ve-thread-{}", tcs));
    if stack_size > 0 {
        builder = builder.stack_size(stack_size as usize);
    }
    let handle = builder
        .spawn(move || thread_loop(tcs, sock, href))
        .context("spawn emulated thread")?;
    threads.push((tcs, handle));
    log::debug!("Thread {} up, stack {:#x}", tcs, stack_size);
    Ok(())
}

fn thread_loop(tcs: u32, sock: UnixStream, href: HeapRef) {
    let mut sock = &sock;
    loop {
        let request: CtrlRequest = match recv_msg(&mut sock) {
            Ok(request) => request,
            Err(err) => {
                log::error!("Thread {} channel failed: {}", tcs, err);
                return;
            }
        };
        match request {
            CtrlRequest::PingThread { value, msg } => {
                // Boundary-supplied range: validated against the heap
                // extent before anything reads it.
                let ret = match href.slice(msg) {
                    Ok(bytes) => {
                        match std::str::from_utf8(bytes) {
                            Ok(text) => log::debug!("Thread {} pinged: {}", tcs, text),
                            Err(_) => {
                                log::debug!("Thread {} pinged with {} raw bytes", tcs, bytes.len())
                            }
                        }
                        0
                    }
                    Err(err) => {
                        log::error!("Thread {} rejected ping payload: {}", tcs, err);
                        -1
                    }
                };
                if send_msg(&mut sock, &CtrlResponse::PingThread { ret, value }).is_err() {
                    return;
                }
            }
            CtrlRequest::Terminate => {
                let _ = send_msg(&mut sock, &CtrlResponse::Terminate { ret: 0 });
                log::debug!("Thread {} terminating", tcs);
                return;
            }
            other => {
                log::warn!("Thread {} ignoring {:?}", tcs, other.msg_type());
            }
        }
    }
}
