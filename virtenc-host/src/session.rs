//! Host-side supervisor for one virtual enclave.
//!
//! A [`Session`] walks the child through its whole life: shared heap
//! first, then the process, then the init crosscheck, then emulated
//! hardware threads, and finally a strictly ordered teardown. Every
//! exchange is a single outstanding request per channel; bulk payloads
//! travel through the heap and are referenced by offset.

use std::fs::File;
use std::mem::ManuallyDrop;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use edge_arena::Arena;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use virtenc_proto::frame::{recv_msg_by_type, send_msg};
use virtenc_proto::heap::SharedHeap;
use virtenc_proto::{fdpass, CtrlRequest, CtrlResponse, HeapSlice, MsgType};

const PING_MESSAGE: &[u8] = b"ping";

struct ThreadEntry {
    tcs: u32,
    sock: UnixStream,
    // Child's end of the pair; kept only to be closed at teardown.
    child_sock: RawFd,
}

pub struct Session {
    heap: SharedHeap,
    // Staging arena over the heap past the handshake page. Bulk-reset,
    // so a ping holds it for the whole round trip.
    stage: Mutex<Arena>,
    child: Option<Child>,
    sock: Option<UnixStream>,
    child_sock: Option<RawFd>,
    threads: Mutex<Vec<ThreadEntry>>,
}

impl Session {
    /// Create the shared heap. Nothing else happens until [`exec`];
    /// a heap failure means no session at all.
    ///
    /// [`exec`]: Session::exec
    pub fn create(heap_size: usize) -> anyhow::Result<Session> {
        anyhow::ensure!(
            heap_size > kconfig::VE_HEAP_STAGE_OFFSET,
            "a {:#x} byte heap leaves no room past the handshake page",
            heap_size
        );

        static HEAP_SEQ: AtomicU32 = AtomicU32::new(0);
        let name = format!(
            "/virtenc-{}-{}",
            std::process::id(),
            HEAP_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        let heap = SharedHeap::create(&name, heap_size).context("create shared heap")?;
        let href = heap.href();
        let stage = unsafe {
            Arena::from_raw(
                href.base().add(kconfig::VE_HEAP_STAGE_OFFSET),
                heap_size - kconfig::VE_HEAP_STAGE_OFFSET,
            )
        }
        .context("wrap heap staging arena")?;
        log::debug!("Shared heap {} created, base = {:p}", name, href.base());

        Ok(Session {
            heap,
            stage: Mutex::new(stage),
            child: None,
            sock: None,
            child_sock: None,
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the enclave program and run the init handshake. On spawn
    /// failure the session rolls back to the heap-ready state; on a
    /// failed crosscheck the child is reaped and the error surfaced.
    pub fn exec(&mut self, path: &Path) -> anyhow::Result<()> {
        anyhow::ensure!(self.child.is_none(), "enclave process already running");

        let (host_sock, child_sock) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .context("create control socket pair")?;
        let (boot_read, boot_write) = match nix::unistd::pipe() {
            Ok(fds) => fds,
            Err(errno) => {
                let _ = nix::unistd::close(host_sock);
                let _ = nix::unistd::close(child_sock);
                return Err(errno).context("create boot pipe");
            }
        };

        // The child reads its boot message from stdin; the control
        // socket rides across exec as an inherited descriptor whose
        // number travels in that message.
        let spawned = Command::new(path)
            .stdin(unsafe { Stdio::from_raw_fd(boot_read) })
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                let _ = nix::unistd::close(host_sock);
                let _ = nix::unistd::close(child_sock);
                let _ = nix::unistd::close(boot_write);
                return Err(err).with_context(|| format!("spawn {}", path.display()));
            }
        };
        log::debug!("Enclave process spawned, pid = {}", child.id());

        let mut sock = unsafe { UnixStream::from_raw_fd(host_sock) };
        match self.init_child(boot_write, &mut sock, child_sock) {
            Ok(()) => {
                let _ = nix::unistd::close(boot_write);
                self.sock = Some(sock);
                self.child_sock = Some(child_sock);
                self.child = Some(child);
                Ok(())
            }
            Err(err) => {
                let _ = nix::unistd::close(boot_write);
                let _ = nix::unistd::close(child_sock);
                drop(sock);
                let _ = child.kill();
                let _ = child.wait();
                Err(err)
            }
        }
    }

    /// The init exchange: request on the boot channel, response on the
    /// control socket, and the mandatory shared-memory crosscheck. The
    /// child's word is not enough; the magic value must actually be in
    /// the heap before the data path is trusted.
    fn init_child(
        &self,
        boot_fd: RawFd,
        sock: &mut UnixStream,
        child_sock: RawFd,
    ) -> anyhow::Result<()> {
        let href = self.heap.href();
        href.arm_crosscheck();

        let request = CtrlRequest::Init {
            sock: child_sock,
            heap_id: self.heap.name().to_owned(),
            heap_base: href.base() as u64,
            heap_size: href.size() as u64,
        };
        let mut boot = ManuallyDrop::new(unsafe { File::from_raw_fd(boot_fd) });
        send_msg(&mut *boot, &request).context("send init request")?;

        let response: CtrlResponse =
            recv_msg_by_type(sock, MsgType::Init).context("receive init response")?;
        let ret = *response.as_init().context("malformed init response")?;
        anyhow::ensure!(ret == 0, "enclave reported init failure ({})", ret);
        anyhow::ensure!(href.crosscheck_passed(), "shared memory crosscheck failed");

        log::debug!("Enclave initialized, heap crosscheck passed");
        Ok(())
    }

    /// Provision one emulated hardware thread: request on the control
    /// channel, then a fresh socket pair whose child end is passed
    /// out-of-band. A refusal leaves earlier threads untouched.
    pub fn add_thread(&self, tcs: u32, stack_size: usize) -> anyhow::Result<()> {
        {
            let threads = self.threads.lock().unwrap();
            anyhow::ensure!(
                threads.len() < kconfig::VE_MAX_THREADS,
                "thread table full ({} entries)",
                threads.len()
            );
            anyhow::ensure!(
                threads.iter().all(|entry| entry.tcs != tcs),
                "thread {} already provisioned",
                tcs
            );
        }
        let mut sock = self.control()?;

        send_msg(
            &mut sock,
            &CtrlRequest::AddThread {
                tcs,
                stack_size: stack_size as u64,
            },
        )
        .context("send add-thread request")?;

        let (host_end, child_end) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .context("create thread socket pair")?;

        let outcome = fdpass::send_fd(sock.as_raw_fd(), child_end)
            .map_err(anyhow::Error::from)
            .and_then(|()| {
                let response: CtrlResponse = recv_msg_by_type(&mut sock, MsgType::AddThread)
                    .context("receive add-thread response")?;
                let ret = *response
                    .as_add_thread()
                    .context("malformed add-thread response")?;
                anyhow::ensure!(ret == 0, "enclave refused thread {} ({})", tcs, ret);
                Ok(())
            });
        if let Err(err) = outcome {
            let _ = nix::unistd::close(host_end);
            let _ = nix::unistd::close(child_end);
            return Err(err);
        }

        // The control channel is single-flow, so the slot reserved by
        // the precheck is still ours when we record the entry.
        let mut threads = self.threads.lock().unwrap();
        threads.push(ThreadEntry {
            tcs,
            sock: unsafe { UnixStream::from_raw_fd(host_end) },
            child_sock: child_end,
        });
        log::debug!("Thread {} provisioned ({} in table)", tcs, threads.len());
        Ok(())
    }

    /// Exercise one emulated thread over its private channel. Failure
    /// here degrades that one exchange, never the session.
    pub fn ping_thread(&self, tcs: u32) -> anyhow::Result<()> {
        let sock = {
            let threads = self.threads.lock().unwrap();
            let entry = threads
                .iter()
                .find(|entry| entry.tcs == tcs)
                .with_context(|| format!("no thread {} in table", tcs))?;
            entry.sock.try_clone().context("clone thread socket")?
        };

        let value = ping_nonce(sock.as_raw_fd());

        // Stage the accompanying string in the heap; the buffer is
        // released once the round trip settles.
        let mut stage = self.stage.lock().unwrap();
        let staged = stage
            .alloc(PING_MESSAGE.len())
            .context("stage ping payload")?;
        unsafe {
            std::ptr::copy_nonoverlapping(PING_MESSAGE.as_ptr(), staged.as_ptr(), PING_MESSAGE.len())
        };
        let msg = HeapSlice {
            offset: (staged.as_ptr() as u64) - (self.heap.href().base() as u64),
            len: PING_MESSAGE.len() as u64,
        };

        let result = self.ping_exchange(&sock, value, msg);
        stage.reset();
        result.with_context(|| format!("ping thread {}", tcs))
    }

    fn ping_exchange(&self, sock: &UnixStream, value: u64, msg: HeapSlice) -> anyhow::Result<()> {
        let mut sock = sock;
        send_msg(&mut sock, &CtrlRequest::PingThread { value, msg })
            .context("send ping request")?;
        let response: CtrlResponse =
            recv_msg_by_type(&mut sock, MsgType::PingThread).context("receive ping response")?;
        let (ret, echoed) = response
            .as_ping_thread()
            .map(|(ret, echoed)| (*ret, *echoed))
            .context("malformed ping response")?;
        anyhow::ensure!(ret == 0, "thread reported ping failure ({})", ret);
        anyhow::ensure!(
            echoed == value,
            "ping value mismatch: sent {:#x}, got {:#x}",
            value,
            echoed
        );
        Ok(())
    }

    /// Tear the session down in strict order: every provisioned thread
    /// channel first, the main channel only after all of them, and the
    /// child's exit status last. A failing response halts the sequence
    /// right there; whatever is left stays open for diagnosis.
    pub fn terminate(&mut self) -> anyhow::Result<i32> {
        loop {
            let front = {
                let threads = self.threads.lock().unwrap();
                match threads.first() {
                    Some(entry) => Some((
                        entry.tcs,
                        entry.sock.try_clone().context("clone thread socket")?,
                    )),
                    None => None,
                }
            };
            let (tcs, sock) = match front {
                Some(front) => front,
                None => break,
            };
            self.terminate_channel(&sock)
                .with_context(|| format!("terminate thread {}", tcs))?;

            let entry = self.threads.lock().unwrap().remove(0);
            drop(entry.sock);
            let _ = nix::unistd::close(entry.child_sock);
            log::debug!("Thread {} terminated", tcs);
        }

        let sock = self.sock.take().context("enclave not initialized")?;
        if let Err(err) = self.terminate_channel(&sock) {
            // Keep the channel for diagnosis; the caller sees the error.
            self.sock = Some(sock);
            return Err(err.context("terminate main channel"));
        }
        drop(sock);
        if let Some(fd) = self.child_sock.take() {
            let _ = nix::unistd::close(fd);
        }

        let mut child = self.child.take().context("no child process")?;
        let status = child.wait().context("wait for enclave process")?;
        let code = match status.code() {
            Some(code) => code,
            None => {
                log::warn!("Enclave process exited with a signal");
                -1
            }
        };
        Ok(code)
    }

    fn terminate_channel(&self, sock: &UnixStream) -> anyhow::Result<()> {
        let mut sock = sock;
        send_msg(&mut sock, &CtrlRequest::Terminate).context("send terminate request")?;
        let response: CtrlResponse = recv_msg_by_type(&mut sock, MsgType::Terminate)
            .context("receive terminate response")?;
        let ret = *response
            .as_terminate()
            .context("malformed terminate response")?;
        anyhow::ensure!(ret == 0, "terminate refused ({})", ret);
        Ok(())
    }

    fn control(&self) -> anyhow::Result<&UnixStream> {
        self.sock.as_ref().context("enclave not initialized")
    }
}

fn ping_nonce(seed: RawFd) -> u64 {
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0);
    clock ^ (seed as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;
    use std::thread::JoinHandle;

    use virtenc_proto::frame::recv_msg;
    use virtenc_proto::heap::AttachedHeap;

    use super::*;

    fn fake_pair() -> (UnixStream, UnixStream) {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .expect("socketpair");
        unsafe { (UnixStream::from_raw_fd(a), UnixStream::from_raw_fd(b)) }
    }

    /// Stand-in child for the init handshake. Reads the boot message,
    /// optionally performs the heap crosscheck, and reports `ret`.
    fn spawn_fake_child(
        boot_read: RawFd,
        peer: UnixStream,
        write_magic: bool,
        ret: i32,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            let mut boot = unsafe { File::from_raw_fd(boot_read) };
            let request: CtrlRequest = recv_msg(&mut boot).expect("boot message");
            let (heap_id, heap_base, heap_size) = match request {
                CtrlRequest::Init {
                    heap_id,
                    heap_base,
                    heap_size,
                    ..
                } => (heap_id, heap_base, heap_size),
                other => panic!("unexpected boot message {:?}", other),
            };
            if write_magic {
                let heap = AttachedHeap::attach(&heap_id, heap_size as usize, heap_base)
                    .expect("attach heap");
                assert!(heap.href().answer_crosscheck());
            }
            let mut peer = &peer;
            send_msg(&mut peer, &CtrlResponse::Init { ret }).expect("init response");
        })
    }

    fn run_init(session: &Session, write_magic: bool, ret: i32) -> anyhow::Result<()> {
        let (mut sock, peer) = fake_pair();
        let (boot_read, boot_write) = nix::unistd::pipe().expect("pipe");
        let child = spawn_fake_child(boot_read, peer, write_magic, ret);
        let sock_fd = sock.as_raw_fd();
        let result = session.init_child(boot_write, &mut sock, sock_fd);
        child.join().expect("fake child");
        let _ = nix::unistd::close(boot_write);
        result
    }

    #[test]
    fn init_accepts_a_cooperating_child() {
        let session = Session::create(0x10_000).expect("session");
        run_init(&session, true, 0).expect("init");
    }

    #[test]
    fn init_rejects_success_without_the_magic() {
        let session = Session::create(0x10_000).expect("session");
        let err = run_init(&session, false, 0).unwrap_err();
        assert!(err.to_string().contains("crosscheck"));
    }

    #[test]
    fn init_rejects_a_failing_child_even_with_magic() {
        let session = Session::create(0x10_000).expect("session");
        let err = run_init(&session, true, -1).unwrap_err();
        assert!(err.to_string().contains("init failure"));
    }

    /// Serves one private thread channel: echoes pings (with an
    /// optional value skew) and answers terminate with `term_ret`.
    fn spawn_fake_thread(
        peer: UnixStream,
        heap_name: String,
        heap_size: usize,
        skew: u64,
        term_ret: i32,
        lifecycle: Arc<Mutex<Vec<u32>>>,
        tcs: u32,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            let heap = AttachedHeap::attach(&heap_name, heap_size, 0).expect("attach heap");
            let mut peer = &peer;
            loop {
                let request: CtrlRequest = match recv_msg(&mut peer) {
                    Ok(request) => request,
                    Err(_) => return,
                };
                match request {
                    CtrlRequest::PingThread { value, msg } => {
                        let href = heap.href();
                        let bytes = href.slice(msg).expect("ping payload");
                        assert_eq!(bytes, PING_MESSAGE);
                        send_msg(
                            &mut peer,
                            &CtrlResponse::PingThread {
                                ret: 0,
                                value: value.wrapping_add(skew),
                            },
                        )
                        .expect("ping response");
                    }
                    CtrlRequest::Terminate => {
                        lifecycle.lock().unwrap().push(tcs);
                        let _ = send_msg(&mut peer, &CtrlResponse::Terminate { ret: term_ret });
                        return;
                    }
                    other => panic!("unexpected request {:?}", other),
                }
            }
        })
    }

    fn install_fake_thread(
        session: &Session,
        tcs: u32,
        skew: u64,
        term_ret: i32,
        lifecycle: &Arc<Mutex<Vec<u32>>>,
    ) -> JoinHandle<()> {
        let (host_end, peer) = fake_pair();
        let handle = spawn_fake_thread(
            peer,
            session.heap.name().to_owned(),
            session.heap.href().size(),
            skew,
            term_ret,
            Arc::clone(lifecycle),
            tcs,
        );
        session.threads.lock().unwrap().push(ThreadEntry {
            tcs,
            sock: host_end,
            child_sock: -1,
        });
        handle
    }

    #[test]
    fn ping_round_trips_the_exact_value() {
        let session = Session::create(0x10_000).expect("session");
        let lifecycle = Arc::new(Mutex::new(Vec::new()));
        let handle = install_fake_thread(&session, 3, 0, 0, &lifecycle);

        session.ping_thread(3).expect("ping");
        // Unknown ids fail without touching the table.
        assert!(session.ping_thread(9).is_err());
        assert_eq!(session.threads.lock().unwrap().len(), 1);

        drop(session);
        handle.join().expect("fake thread");
    }

    #[test]
    fn ping_detects_a_skewed_echo() {
        let session = Session::create(0x10_000).expect("session");
        let lifecycle = Arc::new(Mutex::new(Vec::new()));
        let handle = install_fake_thread(&session, 1, 1, 0, &lifecycle);

        let err = session.ping_thread(1).unwrap_err();
        assert!(format!("{:#}", err).contains("mismatch"));

        drop(session);
        handle.join().expect("fake thread");
    }

    #[test]
    fn teardown_is_ordered_and_halts_on_failure() {
        let mut session = Session::create(0x10_000).expect("session");
        let lifecycle = Arc::new(Mutex::new(Vec::new()));
        let first = install_fake_thread(&session, 1, 0, 0, &lifecycle);
        let second = install_fake_thread(&session, 2, 0, -1, &lifecycle);
        let third = install_fake_thread(&session, 3, 0, 0, &lifecycle);

        let err = session.terminate().unwrap_err();
        assert!(format!("{:#}", err).contains("terminate thread 2"));

        // Thread 1 is gone, threads 2 and 3 are untouched in order.
        {
            let threads = session.threads.lock().unwrap();
            let left: Vec<u32> = threads.iter().map(|entry| entry.tcs).collect();
            assert_eq!(left, vec![2, 3]);
            // Thread 3's channel never saw a terminate.
            assert_eq!(*lifecycle.lock().unwrap(), vec![1, 2]);
        }

        first.join().expect("thread 1");
        second.join().expect("thread 2");
        drop(session);
        third.join().expect("thread 3");
    }

    #[test]
    fn clean_teardown_orders_threads_before_the_main_channel() {
        let mut session = Session::create(0x10_000).expect("session");
        let lifecycle = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (1..=3)
            .map(|tcs| install_fake_thread(&session, tcs, 0, 0, &lifecycle))
            .collect();

        // Fake main channel plus a trivial child to reap.
        let (main_sock, main_peer) = fake_pair();
        session.sock = Some(main_sock);
        let order = Arc::clone(&lifecycle);
        let main_thread = std::thread::spawn(move || {
            let mut peer = &main_peer;
            let request: CtrlRequest = recv_msg(&mut peer).expect("main request");
            assert_eq!(request, CtrlRequest::Terminate);
            order.lock().unwrap().push(u32::MAX);
            send_msg(&mut peer, &CtrlResponse::Terminate { ret: 0 }).expect("main response");
        });
        session.child = Some(
            Command::new("true")
                .stdin(Stdio::null())
                .spawn()
                .expect("spawn true"),
        );

        let status = session.terminate().expect("terminate");
        assert_eq!(status, 0);
        assert_eq!(*lifecycle.lock().unwrap(), vec![1, 2, 3, u32::MAX]);

        for handle in handles {
            handle.join().expect("fake thread");
        }
        main_thread.join().expect("main channel");
    }

    #[test]
    fn table_capacity_and_duplicates_are_refused() {
        let session = Session::create(0x10_000).expect("session");
        {
            let mut threads = session.threads.lock().unwrap();
            for tcs in 0..kconfig::VE_MAX_THREADS as u32 {
                let (host_end, _peer) = fake_pair();
                threads.push(ThreadEntry {
                    tcs,
                    sock: host_end,
                    child_sock: -1,
                });
            }
        }
        let err = session
            .add_thread(99, kconfig::VE_THREAD_STACK_SIZE)
            .unwrap_err();
        assert!(err.to_string().contains("full"));

        session.threads.lock().unwrap().truncate(1);
        let err = session
            .add_thread(0, kconfig::VE_THREAD_STACK_SIZE)
            .unwrap_err();
        assert!(err.to_string().contains("already provisioned"));
    }

    #[test]
    fn exec_failure_rolls_back_to_heap_ready() {
        let mut session = Session::create(0x10_000).expect("session");
        let missing = Path::new("/nonexistent/virtenc-program");
        assert!(session.exec(missing).is_err());
        assert!(session.child.is_none());
        assert!(session.sock.is_none());
        // The heap is still usable for a later attempt.
        session.heap.href().arm_crosscheck();
        assert!(!session.heap.href().crosscheck_passed());
    }

    // Reading from a fake pair's dropped peer must not hang the drop
    // of Session; nothing in Session blocks on drop.
    #[test]
    fn dropping_a_session_closes_its_channels() {
        let session = Session::create(0x10_000).expect("session");
        let (host_end, mut peer) = fake_pair();
        session.threads.lock().unwrap().push(ThreadEntry {
            tcs: 5,
            sock: host_end,
            child_sock: -1,
        });
        drop(session);
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).expect("eof"), 0);
    }
}
