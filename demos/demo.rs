use lfsmr::lfht::Lfht;
use std::sync::Arc;
use std::time::Instant;

fn main() {
    println!("lfsmr demo");
    println!("==========\n");

    let table = Lfht::new(|value| value);
    for i in 0..10_000u64 {
        table.add(i, i);
    }
    println!("single-threaded: inserted 10000 values");
    assert_eq!(table.get_first(42, |v| v == 42), Some(42));
    assert_eq!(table.delete_by_key(42, |v| v == 42), Some(42));
    assert_eq!(table.get_first(42, |v| v == 42), None);
    println!("lookup/delete round-trip checks out\n");

    println!("concurrent insert (8 threads, 50k values each):");
    let table = Arc::new(Lfht::new(|value| value));
    let start = Instant::now();
    let handles: Vec<_> = (0..8)
        .map(|tid| {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                for i in 0u64..50_000 {
                    let v = tid * 50_000 + i;
                    table.add(v, v);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let elapsed = start.elapsed();

    let mut cursor = table.first_cursor();
    let mut count = 0usize;
    while table.iterate_all(&mut cursor).is_some() {
        count += 1;
    }
    println!("  completed in {elapsed:?} ({count} live entries)");

    println!("\nDone.");
}
