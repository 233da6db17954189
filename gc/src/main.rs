use std::sync::atomic::{AtomicUsize, Ordering};

use clap::Parser as ClapParser;

use gc::{Collector, GcSettings};
use object::{
    ClassDesc, FieldDesc, FieldKind, HEADER_SIZE, Header, read_ref, write_ref,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Initial heap size in bytes
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    heap_size: usize,

    /// Maximum heap size in bytes
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    max_heap_size: usize,

    /// Length of the retained linked list
    #[arg(long, default_value_t = 1024)]
    live: usize,

    /// Garbage allocations per churn round
    #[arg(long, default_value_t = 100_000)]
    churn: usize,

    /// Churn rounds to run
    #[arg(long, default_value_t = 4)]
    rounds: usize,
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn counting_finalizer(_obj: *mut Header) {
    FINALIZED.fetch_add(1, Ordering::Relaxed);
}

fn set_payload(obj: *mut Header, value: u64) {
    // SAFETY: `payload` is the declared long field of both demo classes.
    unsafe {
        *((obj as *mut u8).add(HEADER_SIZE + 8) as *mut u64) = value;
    }
}

fn payload(obj: *mut Header) -> u64 {
    // SAFETY: see set_payload.
    unsafe { *((obj as *const u8).add(HEADER_SIZE + 8) as *const u64) }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let node = ClassDesc::object(
        "DemoNode",
        None,
        vec![
            FieldDesc::reference("next", HEADER_SIZE),
            FieldDesc::primitive("payload", HEADER_SIZE + 8, FieldKind::Long),
        ],
    )
    .leak();
    let closeable = ClassDesc::object(
        "DemoCloseable",
        None,
        vec![FieldDesc::primitive(
            "payload",
            HEADER_SIZE + 8,
            FieldKind::Long,
        )],
    )
    .with_finalizer(counting_finalizer)
    .leak();
    let ref_array = ClassDesc::array_of("[DemoNode", FieldKind::Reference).leak();

    let collector = Collector::new(GcSettings {
        initial_heap_size: cli.heap_size,
        max_heap_size: cli.max_heap_size,
        ..Default::default()
    });
    let finalizer_thread = collector.spawn_finalizer_thread();
    let mutator = collector.register_mutator();

    // Retained data: a linked list the churn must never disturb.
    let head = mutator.allocate(node).expect("heap exhausted building list");
    set_payload(head, 0);
    let head_slot = mutator.push_root(head);
    let tail_slot = mutator.push_root(head);
    for i in 1..cli.live as u64 {
        let next = mutator.allocate(node).expect("heap exhausted building list");
        set_payload(next, i);
        // SAFETY: `next` field of the current tail, both pinned as roots.
        unsafe { write_ref(mutator.root(tail_slot), HEADER_SIZE, next) };
        mutator.set_root(tail_slot, next);
    }

    for round in 0..cli.rounds {
        for i in 0..cli.churn {
            mutator.safepoint();
            if i % 64 == 0 {
                mutator
                    .allocate_array(ref_array, 16)
                    .expect("garbage array allocation failed");
            } else if i % 997 == 0 {
                mutator
                    .allocate(closeable)
                    .expect("finalizable allocation failed");
            } else {
                mutator
                    .allocate(node)
                    .expect("garbage allocation failed");
            }
        }
        mutator.force_collect();
        println!(
            "round {}: heap {}/{} bytes, {} collection(s), {} finalized",
            round,
            collector.heap_used_bytes(),
            collector.heap_current_bytes(),
            collector.stats().collections.load(Ordering::Relaxed),
            FINALIZED.load(Ordering::Relaxed),
        );
    }

    // The retained list must have survived every cycle intact.
    let mut cursor = mutator.root(head_slot);
    for expected in 0..cli.live as u64 {
        assert_eq!(payload(cursor), expected, "retained list corrupted");
        // SAFETY: list nodes stay rooted through the head chain.
        cursor = unsafe { read_ref(cursor, HEADER_SIZE) };
    }

    mutator.run_pending_finalizers();
    println!(
        "done: {} objects retained, {} reclaimed last cycle, {} finalizers ran",
        cli.live,
        collector
            .stats()
            .last_reclaimed_bytes
            .load(Ordering::Relaxed),
        FINALIZED.load(Ordering::Relaxed),
    );
    finalizer_thread.shutdown();
}
