//! Mutator thread registry and the stop-the-world protocol.
//!
//! Every mutator thread registers here and cooperates through safepoint
//! polls. The collecting thread drives all others into a suspended state
//! before any heap address is read, and resumes them only after root
//! write-back. A thread sitting in native code is suspended in place
//! (native code holds no collector-visible references in registers),
//! unless it is inside a GC-critical section, in which case suspension is
//! retried with an observable reason rather than forced.

use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{
        AtomicBool, AtomicU8, AtomicU64, AtomicUsize,
        Ordering::{Acquire, Relaxed, Release},
    },
};
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, warn};
use object::Header;
use parking_lot::{Condvar, Mutex, RwLock};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u8 {
        /// Thread is executing native/foreign code and flushed its machine
        /// state on the way out.
        const IN_NATIVE = 1 << 0;
        /// Thread temporarily holds a heap reference the root enumeration
        /// cannot see; forced suspension would be unsound.
        const GC_CRITICAL = 1 << 1;
    }
}

/// Why a suspension attempt had to be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// Thread is in native code but inside a GC-critical section.
    GcCritical,
    /// Thread runs compiled code at a pc the collector does not recognize.
    UnknownPc,
    /// Safepoint poll armed; waiting for the thread to report itself.
    AwaitingSafepoint,
}

/// One reference-holding location of a thread's reported machine state.
/// Non-writable cells model references baked into emitted code as
/// immediates: traced for reachability, never rewritten.
#[derive(Debug, Clone, Copy)]
pub struct RootCell {
    pub value: *mut Header,
    pub writable: bool,
}

/// The machine state a thread reports at its suspension point: program
/// counter, stack pointer, and every register and stack slot holding a
/// live heap reference.
#[derive(Debug, Default)]
pub struct ExecutionState {
    pub pc: usize,
    pub sp: usize,
    pub registers: Vec<RootCell>,
    pub stack: Vec<RootCell>,
}

/// Per-thread record shared between the thread itself and the collector.
#[derive(Debug)]
pub struct MutatorThread {
    pub id: u64,
    flags: AtomicU8,
    /// Set once the thread is parked at a safepoint or suspended in place.
    suspended: AtomicBool,
    /// Safepoint poll armed by the collector (replacement-point analog).
    armed: AtomicBool,
    pub state: Mutex<ExecutionState>,
}

// SAFETY: the raw pointers inside ExecutionState are only dereferenced by
// the collector while their owning thread is suspended.
unsafe impl Send for MutatorThread {}
// SAFETY: see above; all mutable access is lock- or protocol-guarded.
unsafe impl Sync for MutatorThread {}

impl MutatorThread {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            flags: AtomicU8::new(0),
            suspended: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            state: Mutex::new(ExecutionState::default()),
        })
    }

    #[inline]
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Acquire))
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Acquire)
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Acquire)
    }

    fn add_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_or(flags.bits(), Release);
    }

    fn remove_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_and(!flags.bits(), Release);
    }
}

/// Compiled-code metadata boundary: pc-range lookup deciding whether the
/// collector recognizes a suspension location.
#[derive(Debug, Clone)]
pub struct CompiledMethod {
    pub name: &'static str,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Default)]
pub struct CodeMap {
    methods: RwLock<Vec<CompiledMethod>>,
}

impl CodeMap {
    pub fn register(&self, method: CompiledMethod) {
        self.methods.write().push(method);
    }

    pub fn find_for_pc(&self, pc: usize) -> Option<CompiledMethod> {
        self.methods
            .read()
            .iter()
            .find(|m| pc >= m.start && pc < m.end)
            .cloned()
    }
}

/// Suspension-retry counters, observable for diagnostics and tests.
#[derive(Debug, Default)]
pub struct SuspendCounters {
    pub gc_critical: AtomicUsize,
    pub unknown_pc: AtomicUsize,
    pub armed_waits: AtomicUsize,
}

impl SuspendCounters {
    fn record(&self, reason: RetryReason) {
        let counter = match reason {
            RetryReason::GcCritical => &self.gc_critical,
            RetryReason::UnknownPc => &self.unknown_pc,
            RetryReason::AwaitingSafepoint => &self.armed_waits,
        };
        counter.fetch_add(1, Relaxed);
    }
}

/// How long one retry round waits before re-examining a stubborn thread.
const SUSPEND_RETRY_WAIT: Duration = Duration::from_millis(2);
/// Attempts per warn-logged round. There is no abort path; after a round
/// is exhausted the collector logs the blocking thread and keeps waiting.
const SUSPEND_RETRIES_PER_ROUND: usize = 500;

#[derive(Debug, Default)]
struct WorldSync {
    stop_requested: bool,
}

/// Registry of all live mutator threads plus the world-stop handshake.
pub struct MutatorRegistry {
    threads: RwLock<HashMap<u64, Arc<MutatorThread>, ahash::RandomState>>,
    next_id: AtomicU64,
    /// Mirror of `WorldSync::stop_requested` for the safepoint fast path.
    stop_pending: AtomicBool,
    sync: Mutex<WorldSync>,
    cv: Condvar,
    pub code_map: CodeMap,
    pub counters: SuspendCounters,
}

impl MutatorRegistry {
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(HashMap::default()),
            next_id: AtomicU64::new(1),
            stop_pending: AtomicBool::new(false),
            sync: Mutex::new(WorldSync::default()),
            cv: Condvar::new(),
            code_map: CodeMap::default(),
            counters: SuspendCounters::default(),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }

    /// Registers the calling thread. Blocks while a collection is stopping
    /// or running, so the thread set is stable for the whole pause.
    pub fn register(&self) -> Arc<MutatorThread> {
        let mut sync = self.sync.lock();
        while sync.stop_requested {
            self.cv.wait(&mut sync);
        }
        let id = self.next_id.fetch_add(1, Relaxed);
        let thread = MutatorThread::new(id);
        self.threads.write().insert(id, thread.clone());
        thread
    }

    /// Removes a thread. A thread exiting while a stop is in flight first
    /// joins the pause as a suspended ghost so the collector is not left
    /// waiting for it.
    pub fn deregister(&self, thread: &Arc<MutatorThread>) {
        let mut sync = self.sync.lock();
        while sync.stop_requested {
            thread.suspended.store(true, Release);
            self.cv.notify_all();
            self.cv.wait(&mut sync);
        }
        self.threads.write().remove(&thread.id);
    }

    /// Safepoint poll body: acknowledge the pending stop and park until the
    /// world is started again. Callers check
    /// [`MutatorRegistry::stop_is_pending`] first as the fast path.
    pub fn block_at_safepoint(&self, thread: &Arc<MutatorThread>) {
        let mut sync = self.sync.lock();
        while sync.stop_requested {
            thread.suspended.store(true, Release);
            self.cv.notify_all();
            self.cv.wait(&mut sync);
        }
        thread.suspended.store(false, Release);
    }

    #[inline(always)]
    pub fn stop_is_pending(&self) -> bool {
        self.stop_pending.load(Acquire)
    }

    /// Flags the calling thread as executing native code.
    pub fn enter_native(&self, thread: &Arc<MutatorThread>) {
        let _sync = self.sync.lock();
        thread.add_flags(ThreadFlags::IN_NATIVE);
    }

    /// Native exit: the thread must not re-enter managed code while a
    /// collection is in flight.
    pub fn leave_native(&self, thread: &Arc<MutatorThread>) {
        let mut sync = self.sync.lock();
        while sync.stop_requested {
            thread.suspended.store(true, Release);
            self.cv.notify_all();
            self.cv.wait(&mut sync);
        }
        thread.remove_flags(ThreadFlags::IN_NATIVE);
        thread.suspended.store(false, Release);
    }

    pub fn enter_gc_critical(&self, thread: &Arc<MutatorThread>) {
        let _sync = self.sync.lock();
        thread.add_flags(ThreadFlags::GC_CRITICAL);
    }

    pub fn leave_gc_critical(&self, thread: &Arc<MutatorThread>) {
        let _sync = self.sync.lock();
        thread.remove_flags(ThreadFlags::GC_CRITICAL);
        // A collector may be retrying against this thread.
        self.cv.notify_all();
    }

    /// Suspends every registered thread except `requester`. Returns only
    /// once all of them are confirmed suspended.
    pub fn stop_the_world(&self, requester: Option<u64>) {
        let mut sync = self.sync.lock();
        debug_assert!(!sync.stop_requested, "nested world stop");
        sync.stop_requested = true;
        self.stop_pending.store(true, Release);

        let others: Vec<Arc<MutatorThread>> = self
            .threads
            .read()
            .values()
            .filter(|t| Some(t.id) != requester)
            .cloned()
            .collect();

        debug!("stopping the world: {} thread(s) to suspend", others.len());

        for thread in &others {
            self.suspend_thread(&mut sync, thread);
        }
    }

    fn suspend_thread(
        &self,
        sync: &mut parking_lot::MutexGuard<'_, WorldSync>,
        thread: &Arc<MutatorThread>,
    ) {
        let mut attempts = 0usize;
        loop {
            if thread.is_suspended() {
                return;
            }

            let flags = thread.flags();
            let reason = if flags.contains(ThreadFlags::IN_NATIVE) {
                if flags.contains(ThreadFlags::GC_CRITICAL) {
                    RetryReason::GcCritical
                } else {
                    // Native and safe: suspend in place, the state flushed
                    // at native entry is authoritative.
                    thread.suspended.store(true, Release);
                    debug!("thread {}: native & safe, suspended", thread.id);
                    return;
                }
            } else {
                let pc = thread.state.lock().pc;
                match self.code_map.find_for_pc(pc) {
                    Some(method) => {
                        thread.armed.store(true, Release);
                        debug!(
                            "thread {}: pc in `{}`, safepoint armed",
                            thread.id, method.name
                        );
                        RetryReason::AwaitingSafepoint
                    }
                    None => RetryReason::UnknownPc,
                }
            };

            self.counters.record(reason);
            attempts += 1;
            if attempts % SUSPEND_RETRIES_PER_ROUND == 0 {
                warn!(
                    "thread {} still not suspended after {} attempts ({:?})",
                    thread.id, attempts, reason
                );
            }

            self.cv.wait_for(sync, SUSPEND_RETRY_WAIT);
        }
    }

    /// Resumes every suspended thread and clears the stop request.
    pub fn start_the_world(&self) {
        let mut sync = self.sync.lock();
        sync.stop_requested = false;
        self.stop_pending.store(false, Release);
        for thread in self.threads.read().values() {
            thread.suspended.store(false, Release);
            thread.armed.store(false, Release);
        }
        self.cv.notify_all();
    }

    /// Snapshot of all registered threads, for root-set readout. Only
    /// meaningful while the world is stopped.
    pub fn snapshot(&self) -> Vec<Arc<MutatorThread>> {
        let mut threads: Vec<_> =
            self.threads.read().values().cloned().collect();
        threads.sort_by_key(|t| t.id);
        threads
    }
}

impl Default for MutatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
