//! Switchless call manager.
//!
//! A pool of untrusted worker threads services calls posted by the
//! trusted side without a mode transition: each worker owns one job
//! slot, the poster writes a call descriptor into an idle slot, and the
//! worker executes it out of line and signals completion through the
//! descriptor itself. Slot and descriptor live in memory visible to
//! both sides, so completion is published with release/acquire atomics
//! rather than plain stores.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

pub const CALL_PENDING: u32 = 0;
pub const CALL_DONE: u32 = 1;
pub const CALL_FAILED: u32 = 2;

/// How a worker waits for its slot to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Block on the slot's condition variable. Cheap on host CPU.
    Park,
    /// Busy-poll the slot. Lowest latency, burns a host core.
    Spin,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SwitchlessError {
    NoWorkers,
    SpawnFailed,
    AllBusy,
    Stopped,
}

impl fmt::Display for SwitchlessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchlessError::NoWorkers => write!(f, "worker count must be nonzero"),
            SwitchlessError::SpawnFailed => write!(f, "failed to spawn a worker thread"),
            SwitchlessError::AllBusy => write!(f, "every worker slot is occupied"),
            SwitchlessError::Stopped => write!(f, "manager already stopped"),
        }
    }
}

impl std::error::Error for SwitchlessError {}

/// Raised by a call table for a function id it does not serve.
#[derive(Debug, PartialEq, Eq)]
pub struct UnknownFunction(pub u64);

/// The seam to the calls layer: maps a function id plus marshaled input
/// to a return value and bytes written into the output buffer.
pub trait CallTable: Send + Sync {
    fn dispatch(
        &self,
        function_id: u64,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(i64, usize), UnknownFunction>;
}

/// A call staged in boundary-visible memory. The poster owns the
/// descriptor and both buffers; they must stay alive and unmoved until
/// the status leaves `CALL_PENDING`.
#[repr(C)]
pub struct CallDescriptor {
    function_id: u64,
    input: *const u8,
    input_len: usize,
    output: *mut u8,
    output_len: usize,
    output_written: AtomicUsize,
    retval: AtomicI64,
    status: AtomicU32,
}

unsafe impl Send for CallDescriptor {}
unsafe impl Sync for CallDescriptor {}

impl CallDescriptor {
    pub fn new(
        function_id: u64,
        input: *const u8,
        input_len: usize,
        output: *mut u8,
        output_len: usize,
    ) -> CallDescriptor {
        CallDescriptor {
            function_id,
            input,
            input_len,
            output,
            output_len,
            output_written: AtomicUsize::new(0),
            retval: AtomicI64::new(0),
            status: AtomicU32::new(CALL_PENDING),
        }
    }

    pub fn function_id(&self) -> u64 {
        self.function_id
    }

    pub fn status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    /// Return value written by the worker; meaningful once the status
    /// is `CALL_DONE`.
    pub fn retval(&self) -> i64 {
        self.retval.load(Ordering::Acquire)
    }

    pub fn output_written(&self) -> usize {
        self.output_written.load(Ordering::Acquire)
    }

    /// Poster-side wait for completion. The call is asynchronous until
    /// this observes a terminal status.
    pub fn wait(&self) -> u32 {
        loop {
            let status = self.status();
            if status != CALL_PENDING {
                return status;
            }
            thread::yield_now();
        }
    }
}

struct SlotState {
    call: *mut CallDescriptor,
    stopping: bool,
}

unsafe impl Send for SlotState {}

struct JobSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl JobSlot {
    fn new() -> JobSlot {
        JobSlot {
            state: Mutex::new(SlotState {
                call: ptr::null_mut(),
                stopping: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn wait_for_job(&self) -> Option<*mut CallDescriptor> {
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.call.is_null() {
                return Some(state.call);
            }
            if state.stopping {
                return None;
            }
            state = self.ready.wait(state).unwrap();
        }
    }

    fn spin_for_job(&self) -> Option<*mut CallDescriptor> {
        loop {
            {
                let state = self.state.lock().unwrap();
                if !state.call.is_null() {
                    return Some(state.call);
                }
                if state.stopping {
                    return None;
                }
            }
            std::hint::spin_loop();
        }
    }

    // The slot stays occupied for the whole execution; clearing it is
    // what makes the slot eligible for the next post.
    fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.call = ptr::null_mut();
    }
}

struct Shared {
    slots: Box<[JobSlot]>,
    table: Box<dyn CallTable>,
    mode: PollMode,
    cursor: AtomicUsize,
}

pub struct SwitchlessManager {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl SwitchlessManager {
    /// Spawn `num_workers` workers, one job slot each. If a spawn fails
    /// partway, the workers already running are stopped and joined
    /// before the error is returned.
    pub fn start(
        table: Box<dyn CallTable>,
        num_workers: usize,
        mode: PollMode,
    ) -> Result<SwitchlessManager, SwitchlessError> {
        if num_workers == 0 {
            return Err(SwitchlessError::NoWorkers);
        }
        let slots = (0..num_workers)
            .map(|_| JobSlot::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let shared = Arc::new(Shared {
            slots,
            table,
            mode,
            cursor: AtomicUsize::new(0),
        });
        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("switchless-{}", index))
                .spawn(move || worker_loop(&worker_shared, index));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    log::error!("Failed to spawn switchless worker {}: {}", index, err);
                    let mut partial = SwitchlessManager { shared, workers };
                    partial.stop();
                    return Err(SwitchlessError::SpawnFailed);
                }
            }
        }
        log::debug!("Switchless manager up with {} workers", num_workers);
        Ok(SwitchlessManager { shared, workers })
    }

    /// Hand a staged call to an idle worker. The descriptor and its
    /// buffers belong to the worker until the status leaves
    /// `CALL_PENDING`; the poster observes completion through the
    /// descriptor, or through the slot reading empty again.
    pub fn post(&self, call: &CallDescriptor) -> Result<usize, SwitchlessError> {
        if self.workers.is_empty() {
            return Err(SwitchlessError::Stopped);
        }
        let count = self.shared.slots.len();
        let start = self.shared.cursor.fetch_add(1, Ordering::Relaxed) % count;
        for step in 0..count {
            let index = (start + step) % count;
            let slot = &self.shared.slots[index];
            let mut state = slot.state.lock().unwrap();
            if state.stopping || !state.call.is_null() {
                continue;
            }
            state.call = call as *const CallDescriptor as *mut CallDescriptor;
            slot.ready.notify_one();
            return Ok(index);
        }
        Err(SwitchlessError::AllBusy)
    }

    /// Stop every worker and join it. An in-flight job finishes
    /// naturally before its worker exits; once this returns, no worker
    /// touches a slot or a descriptor again.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for slot in self.shared.slots.iter() {
            let mut state = slot.state.lock().unwrap();
            state.stopping = true;
            slot.ready.notify_one();
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("A switchless worker panicked");
            }
        }
        log::debug!("Switchless manager stopped");
    }

    pub fn num_workers(&self) -> usize {
        self.shared.slots.len()
    }
}

impl Drop for SwitchlessManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Shared, index: usize) {
    let slot = &shared.slots[index];
    loop {
        let call = match shared.mode {
            PollMode::Park => slot.wait_for_job(),
            PollMode::Spin => slot.spin_for_job(),
        };
        let call = match call {
            Some(call) => call,
            None => break,
        };
        execute(shared.table.as_ref(), unsafe { &*call });
        slot.clear();
    }
    log::trace!("Switchless worker {} exiting", index);
}

fn execute(table: &dyn CallTable, call: &CallDescriptor) {
    let input = if call.input.is_null() {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(call.input, call.input_len) }
    };
    let output = if call.output.is_null() {
        &mut [][..]
    } else {
        unsafe { std::slice::from_raw_parts_mut(call.output, call.output_len) }
    };
    match table.dispatch(call.function_id, input, output) {
        Ok((retval, written)) => {
            call.output_written
                .store(written.min(call.output_len), Ordering::Relaxed);
            call.retval.store(retval, Ordering::Relaxed);
            call.status.store(CALL_DONE, Ordering::Release);
        }
        Err(UnknownFunction(id)) => {
            log::warn!("Switchless call to unknown function {}", id);
            call.status.store(CALL_FAILED, Ordering::Release);
        }
    }
}
