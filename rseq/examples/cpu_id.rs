//! Example: rseq per-CPU ID reading.
//!
//! Run with:
//!   cargo run -p rseq --features nightly --example cpu_id

use rseq::RseqLocal;

thread_local! {
    static RSEQ: RseqLocal = RseqLocal::new();
}

fn main() {
    println!("rseq example");
    println!("============\n");

    // ── 1. Read CPU IDs ──────────────────────────────────────────────

    let cpu = RSEQ.with(|r| r.cpu_id());
    match cpu {
        Some(cpu) => println!("[main] cpu_id = {cpu}"),
        None => {
            println!("[main] rseq unavailable (kernel too old or not Linux x86_64).");
            return;
        }
    }

    let handles: Vec<_> = (0..4)
        .map(|i| {
            std::thread::spawn(move || {
                RSEQ.with(|r| match r.cpu_id() {
                    Some(cpu) => println!("[thread {i}] cpu_id = {cpu}"),
                    None => println!("[thread {i}] rseq unavailable"),
                });
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    // Show cpu_id can change between reads (OS may migrate us).
    print!("\ncpu_id x10:");
    RSEQ.with(|r| {
        for _ in 0..10 {
            match r.cpu_id() {
                Some(cpu) => print!(" {cpu}"),
                None => print!(" ?"),
            }
        }
    });
    println!();

    println!("\nDone.");
}
