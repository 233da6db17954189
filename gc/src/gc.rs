//! Collection coordinator and allocation front door.
//!
//! One full cycle: reentrancy guard, stop the world, root readout, mark,
//! growth decision, compact, root write-back, finalizer notification,
//! resume. The collector runs on whichever thread requested the cycle;
//! there is no background phase and no abort path.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{
    AtomicU8, AtomicUsize,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};
use std::thread::JoinHandle;

use log::{debug, info, warn};
use object::{
    ClassDesc, Header, HeaderFlags, array_allocation_size, init_array,
    init_object,
};
use parking_lot::Mutex;

use crate::compact::compact;
use crate::finalizer::{FinalState, FinalizerRegistry, run_finalizer};
use crate::mark::mark;
use crate::region::Region;
use crate::rootset::{GlobalRoots, read_roots, write_roots};
use crate::threads::{
    CodeMap, MutatorRegistry, MutatorThread, RootCell, SuspendCounters,
};

/// Heap sizing, fixed at startup. The main region may be re-created (grown)
/// between collections up to `max_heap_size`; the system region holds
/// uncollectable metadata objects and never changes.
#[derive(Debug, Clone)]
pub struct GcSettings {
    pub initial_heap_size: usize,
    pub max_heap_size: usize,
    pub system_heap_size: usize,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            initial_heap_size: 16 * 1024 * 1024,
            max_heap_size: 64 * 1024 * 1024,
            system_heap_size: 4 * 1024 * 1024,
        }
    }
}

impl GcSettings {
    fn validate(&self) -> Result<(), &'static str> {
        if self.initial_heap_size == 0 || self.system_heap_size == 0 {
            return Err("heap sizes must be > 0");
        }
        if self.max_heap_size < self.initial_heap_size {
            return Err("max heap size below initial size");
        }
        Ok(())
    }
}

/// Collection phases. Entry into a cycle is a compare-and-swap on
/// `Idle -> Pending`; plain flag reads are never trusted for reentrancy.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectPhase {
    Idle = 0,
    Pending = 1,
    Running = 2,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Default)]
pub struct GcStats {
    pub collections: AtomicUsize,
    /// Requests dropped by the reentrancy guard.
    pub requests_skipped: AtomicUsize,
    pub heap_growths: AtomicUsize,
    pub last_marked_objects: AtomicUsize,
    pub last_marked_bytes: AtomicUsize,
    pub last_reclaimed_bytes: AtomicUsize,
}

#[derive(Debug)]
struct HeapState {
    main: Region,
    sys: Region,
}

pub struct CollectorInner {
    settings: GcSettings,
    heap: Mutex<HeapState>,
    phase: AtomicU8,
    threads: MutatorRegistry,
    globals: GlobalRoots,
    finals: FinalizerRegistry,
    stats: GcStats,
}

/// Shared handle to the collector. Cheap to clone; one instance per VM.
#[derive(Clone)]
pub struct Collector(Arc<CollectorInner>);

impl std::ops::Deref for Collector {
    type Target = CollectorInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Collector {
    /// Brings up both heap regions. Region creation failure at startup is
    /// fatal: there is no VM to run without a heap.
    pub fn new(settings: GcSettings) -> Self {
        settings.validate().expect("invalid heap settings");
        info!(
            "initialising heap: {} bytes (max {})",
            settings.initial_heap_size, settings.max_heap_size
        );

        let sys = Region::new(settings.system_heap_size)
            .expect("system region creation failed: out of memory");
        let main = Region::new(settings.initial_heap_size)
            .expect("heap region creation failed: out of memory");

        Self(Arc::new(CollectorInner {
            settings,
            heap: Mutex::new(HeapState { main, sys }),
            phase: AtomicU8::new(CollectPhase::Idle as u8),
            threads: MutatorRegistry::new(),
            globals: GlobalRoots::default(),
            finals: FinalizerRegistry::default(),
            stats: GcStats::default(),
        }))
    }

    /// Registers the calling thread as a mutator.
    pub fn register_mutator(&self) -> Mutator {
        Mutator {
            shared: self.clone(),
            thread: self.threads.register(),
        }
    }

    /// Starts the dedicated finalizer thread. It parks in native mode
    /// between collections and is woken whenever a cycle produced
    /// reclaimable entries.
    pub fn spawn_finalizer_thread(&self) -> FinalizerThread {
        let collector = self.clone();
        let handle = std::thread::Builder::new()
            .name("gc-finalizer".into())
            .spawn(move || {
                let mutator = collector.register_mutator();
                loop {
                    let keep_running =
                        mutator.native(|| collector.finals.wait_for_work());
                    if !keep_running {
                        break;
                    }
                    mutator.run_pending_finalizers();
                }
            })
            .expect("spawn finalizer thread");
        FinalizerThread {
            collector: self.clone(),
            handle: Some(handle),
        }
    }
}

impl CollectorInner {
    // ── introspection ──────────────────────────────────────────────

    pub fn heap_used_bytes(&self) -> usize {
        self.heap.lock().main.used()
    }

    pub fn heap_free_bytes(&self) -> usize {
        self.heap.lock().main.free()
    }

    pub fn heap_current_bytes(&self) -> usize {
        self.heap.lock().main.size()
    }

    pub fn heap_max_bytes(&self) -> usize {
        self.settings.max_heap_size
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn suspend_counters(&self) -> &SuspendCounters {
        &self.threads.counters
    }

    pub fn code_map(&self) -> &CodeMap {
        &self.threads.code_map
    }

    /// Registers a global/static reference cell as a permanent root.
    ///
    /// # Safety
    /// `cell` must outlive the collector and only be mutated by mutator
    /// threads between collections.
    pub unsafe fn register_global_root(
        &self,
        cell: *mut *mut Header,
        writable: bool,
    ) {
        // SAFETY: forwarded contract.
        unsafe { self.globals.register(cell, writable) };
    }

    /// Registers a finalizer for an already-allocated object. Allocation
    /// does this automatically for classes that declare one.
    pub fn register_finalizer(
        &self,
        object: *mut Header,
        finalizer: object::FinalizerFn,
    ) {
        self.finals.register(object, finalizer);
    }

    pub fn finalizer_state(&self, object: *mut Header) -> Option<FinalState> {
        self.finals.state_of(object)
    }

    pub(crate) fn finals(&self) -> &FinalizerRegistry {
        &self.finals
    }

    // ── collection ─────────────────────────────────────────────────

    /// Forces a full collection, the `System.gc` entry point. Must not be
    /// called from a registered mutator thread (use [`Mutator::collect`]
    /// there, which exempts the caller from suspension).
    pub fn collect(&self, level: i32) -> bool {
        self.collect_from(None, level, 0)
    }

    pub fn force_collect(&self) {
        info!("forced collection ...");
        self.collect(0);
        info!("forced collection finished");
    }

    fn try_begin(&self) -> bool {
        self.phase
            .compare_exchange(
                CollectPhase::Idle as u8,
                CollectPhase::Pending as u8,
                AcqRel,
                Acquire,
            )
            .is_ok()
    }

    /// One full collection cycle. Returns `false` when the request was
    /// dropped because a cycle is already pending or running.
    fn collect_from(
        &self,
        requester: Option<u64>,
        level: i32,
        want_free: usize,
    ) -> bool {
        if !self.try_begin() {
            self.stats.requests_skipped.fetch_add(1, Relaxed);
            debug!("collection request dropped: cycle already in flight");
            return false;
        }

        debug!("collection starting (level {level})");
        self.threads.stop_the_world(requester);

        // Everyone is halted now; we consider ourselves running.
        self.phase.store(CollectPhase::Running as u8, Release);

        let notify_finalizer;
        {
            let mut heap = self.heap.lock();
            let heap = &mut *heap;

            let mut roots = read_roots(&self.threads, &self.globals);
            let outcome = mark(&roots, &heap.main, &self.finals);
            notify_finalizer = outcome.notify_finalizer;
            self.stats
                .last_marked_objects
                .store(outcome.marked_objects, Relaxed);
            self.stats
                .last_marked_bytes
                .store(outcome.marked_bytes, Relaxed);

            let grown = self.grow_target(
                heap.main.size(),
                outcome.marked_bytes,
                want_free,
            );
            let compacted = match grown {
                Some(mut bigger) => {
                    let result = compact(
                        &mut roots,
                        &mut heap.main,
                        Some(&mut bigger),
                        &self.finals,
                    );
                    heap.main = bigger;
                    self.stats.heap_growths.fetch_add(1, Relaxed);
                    result
                }
                None => {
                    compact(&mut roots, &mut heap.main, None, &self.finals)
                }
            };
            self.stats
                .last_reclaimed_bytes
                .store(compacted.reclaimed_bytes, Relaxed);

            heap.main.invalidate();
            write_roots(&roots);

            debug!(
                "collection done: {} live, {} reclaimed, heap {}/{}",
                compacted.live_bytes,
                compacted.reclaimed_bytes,
                heap.main.used(),
                heap.main.size()
            );
        }

        self.stats.collections.fetch_add(1, AcqRel);

        if notify_finalizer {
            self.finals.notify();
        }

        // Keep this below the finalizer notification.
        self.phase.store(CollectPhase::Idle as u8, Release);
        self.threads.start_the_world();
        true
    }

    /// Growth decision, taken inside the pause so regions only ever change
    /// between the mutators' observations. Growth failure mid-run is not
    /// fatal: the VM limps on at the current size and the allocation that
    /// wanted the space reports out-of-memory.
    fn grow_target(
        &self,
        current: usize,
        live: usize,
        want_free: usize,
    ) -> Option<Region> {
        let crowded = live > current / 2;
        let short = current - live < want_free;
        if !crowded && !short {
            return None;
        }
        let target = (current * 2)
            .max(live + want_free)
            .min(self.settings.max_heap_size);
        if target <= current {
            return None;
        }
        match Region::new(target) {
            Some(region) => {
                info!("growing heap: {current} -> {} bytes", region.size());
                Some(region)
            }
            None => {
                warn!("heap growth to {target} bytes failed; staying put");
                None
            }
        }
    }
}

/// Per-thread handle carrying the allocation front door and the safepoint
/// protocol. Dropping it deregisters the thread.
pub struct Mutator {
    shared: Collector,
    thread: Arc<MutatorThread>,
}

impl Mutator {
    pub fn collector(&self) -> &Collector {
        &self.shared
    }

    pub fn thread_id(&self) -> u64 {
        self.thread.id
    }

    // ── safepoint protocol ─────────────────────────────────────────

    /// Safepoint poll. When a collection is pending, reports this thread's
    /// machine state and parks until the world is started again.
    #[inline]
    pub fn safepoint(&self) {
        if self.shared.threads.stop_is_pending() {
            self.shared.threads.block_at_safepoint(&self.thread);
        }
    }

    /// Runs `f` as native code: the collector may suspend this thread in
    /// place meanwhile, so `f` must not touch the heap.
    pub fn native<R>(&self, f: impl FnOnce() -> R) -> R {
        self.shared.threads.enter_native(&self.thread);
        let result = f();
        self.shared.threads.leave_native(&self.thread);
        result
    }

    /// Runs `f` inside a GC-critical section: suspension is retried, never
    /// forced, while it runs. Implies a native section.
    pub fn gc_critical<R>(&self, f: impl FnOnce() -> R) -> R {
        self.shared.threads.enter_native(&self.thread);
        self.shared.threads.enter_gc_critical(&self.thread);
        let result = f();
        self.shared.threads.leave_gc_critical(&self.thread);
        self.shared.threads.leave_native(&self.thread);
        result
    }

    pub fn set_pc(&self, pc: usize) {
        self.thread.state.lock().pc = pc;
    }

    // ── shadow stack ───────────────────────────────────────────────

    /// Pins `value` as a stack root of this thread; returns its slot index.
    pub fn push_root(&self, value: *mut Header) -> usize {
        let mut state = self.thread.state.lock();
        state.stack.push(RootCell { value, writable: true });
        state.stack.len() - 1
    }

    pub fn pop_root(&self) {
        self.thread.state.lock().stack.pop();
    }

    /// Current (possibly relocated) value of a stack root.
    pub fn root(&self, index: usize) -> *mut Header {
        self.thread.state.lock().stack[index].value
    }

    pub fn set_root(&self, index: usize, value: *mut Header) {
        self.thread.state.lock().stack[index].value = value;
    }

    /// Reports a register holding a heap reference. Non-writable cells
    /// model references also baked into emitted code as immediates.
    pub fn push_register(&self, value: *mut Header, writable: bool) -> usize {
        let mut state = self.thread.state.lock();
        state.registers.push(RootCell { value, writable });
        state.registers.len() - 1
    }

    pub fn register_value(&self, index: usize) -> *mut Header {
        self.thread.state.lock().registers[index].value
    }

    // ── allocation ─────────────────────────────────────────────────

    fn allocate_raw(&self, size: usize) -> Option<NonNull<u8>> {
        let mut collected = false;
        loop {
            {
                let mut heap = self.shared.heap.lock();
                if let Some(ptr) = heap.main.bump(size) {
                    return Some(ptr);
                }
            }
            if collected {
                // A full collection did not free enough room: the caller
                // gets to see the out-of-memory condition.
                warn!("out of memory allocating {size} bytes");
                return None;
            }
            debug!("allocation of {size} bytes exhausted the heap");
            if self.shared.collect_from(Some(self.thread.id), 0, size) {
                collected = true;
            } else {
                // Lost the race against another collecting thread; wait
                // for that cycle instead and retry.
                self.safepoint();
                std::thread::yield_now();
            }
        }
    }

    /// Allocates an instance of `class`, zeroed, header initialized, and
    /// its finalizer registered when the class declares one. `None` is the
    /// out-of-memory condition, surfaced after a forced collection.
    pub fn allocate(&self, class: &'static ClassDesc) -> Option<*mut Header> {
        debug_assert!(!class.is_array(), "use allocate_array");
        let size = class.instance_size;
        let raw = self.allocate_raw(size)?;
        // SAFETY: freshly bumped storage of `size` bytes.
        let obj = unsafe {
            raw.as_ptr().write_bytes(0, size);
            init_object(raw.as_ptr(), class)
        };
        if let Some(finalizer) = class.finalizer {
            self.shared.finals.register(obj, finalizer);
        }
        Some(obj)
    }

    pub fn allocate_array(
        &self,
        class: &'static ClassDesc,
        length: usize,
    ) -> Option<*mut Header> {
        let size = array_allocation_size(class, length);
        let raw = self.allocate_raw(size)?;
        // SAFETY: freshly bumped storage of `size` bytes.
        let obj = unsafe {
            raw.as_ptr().write_bytes(0, size);
            init_array(raw.as_ptr(), class, length)
        };
        Some(obj)
    }

    /// Allocates collector-invisible metadata in the system region. Such
    /// objects are never marked, moved, or reclaimed, and take no part in
    /// finalization.
    pub fn allocate_uncollectable(
        &self,
        class: &'static ClassDesc,
    ) -> Option<*mut Header> {
        let size = class.instance_size;
        let mut heap = self.shared.heap.lock();
        let raw = heap.sys.bump(size)?;
        // SAFETY: freshly bumped storage of `size` bytes.
        unsafe {
            raw.as_ptr().write_bytes(0, size);
            let obj = init_object(raw.as_ptr(), class);
            (*obj).add_flags(HeaderFlags::UNCOLLECTABLE);
            Some(obj)
        }
    }

    // ── collection and finalization ────────────────────────────────

    /// Requests a collection from this mutator thread; the thread acts as
    /// the collector and is exempted from its own suspension.
    pub fn collect(&self, level: i32) -> bool {
        self.shared.collect_from(Some(self.thread.id), level, 0)
    }

    /// Forced full collection from a mutator thread (the `System.gc`
    /// entry point).
    pub fn force_collect(&self) {
        info!("forced collection ...");
        self.collect(0);
        info!("forced collection finished");
    }

    /// Drains all reclaimable finalizer entries, invoking each finalizer
    /// with the object pinned as a root so a concurrent-looking relocation
    /// can never strand it. Run by the dedicated finalizer thread.
    pub fn run_pending_finalizers(&self) {
        debug!("invoking pending finalizers");
        loop {
            self.safepoint();
            let Some((object, finalizer)) =
                self.shared.finals.take_next_reclaimable()
            else {
                break;
            };
            let slot = self.push_root(object);
            run_finalizer(finalizer, self.root(slot));
            self.pop_root();
            self.shared.finals.finish_finalizing();
        }
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.shared.threads.deregister(&self.thread);
    }
}

/// Handle to the dedicated finalizer thread.
pub struct FinalizerThread {
    collector: Collector,
    handle: Option<JoinHandle<()>>,
}

impl FinalizerThread {
    pub fn shutdown(mut self) {
        self.collector.finals.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
