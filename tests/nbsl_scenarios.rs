use lfsmr::nbsl::{Nbsl, Node};
use std::collections::HashSet;
use std::sync::Arc;

#[test]
fn pop_multi_thread_drains_every_value_exactly_once() {
    let list: Arc<Nbsl<u64>> = Arc::new(Nbsl::new());
    const N: u64 = 20_000;
    for v in 0..N {
        list.push(list.top(), Node::new_boxed(v)).unwrap();
    }

    let threads = 16;
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let list = Arc::clone(&list);
            std::thread::spawn(move || {
                let mut popped = Vec::new();
                let mut last = u64::MAX;
                while let Some(n) = list.pop() {
                    // LIFO per-thread: every value this thread sees is
                    // strictly less than the one before it.
                    assert!(n.data < last);
                    last = n.data;
                    popped.push(n.data);
                }
                popped
            })
        })
        .collect();

    let mut all: HashSet<u64> = HashSet::new();
    for h in handles {
        for v in h.join().unwrap() {
            assert!(all.insert(v), "value {v} popped more than once");
        }
    }
    assert_eq!(all.len(), N as usize);
    assert_eq!(all, (0..N).collect());
}

#[test]
fn push_and_del_partitions_every_pushed_value() {
    let list: Arc<Nbsl<u64>> = Arc::new(Nbsl::new());
    let threads = 16;
    let iterations = 200u64;
    let per_iter = 20u64;

    let handles: Vec<_> = (0..threads)
        .map(|tid| {
            let list = Arc::clone(&list);
            std::thread::spawn(move || {
                let mut deleted = Vec::new();
                let mut remaining = Vec::new();
                for iter in 0..iterations {
                    let base = tid * iterations * per_iter + iter * per_iter;
                    let mut raws = Vec::new();
                    for v in base..base + per_iter {
                        let mut node = Node::new_boxed(v);
                        let raw: *mut Node<u64> = &mut *node;
                        loop {
                            let top = list.top();
                            match list.push(top, node) {
                                Ok(()) => break,
                                Err(returned) => node = returned,
                            }
                        }
                        raws.push((raw, v));
                    }
                    // Delete 15 of the 20 by pointer.
                    for &(raw, v) in &raws[..15] {
                        assert!(list.del(raw));
                        deleted.push(v);
                    }
                    for &(_, v) in &raws[15..] {
                        remaining.push(v);
                    }
                }
                (deleted, remaining)
            })
        })
        .collect();

    let mut deleted_all: HashSet<u64> = HashSet::new();
    let mut remaining_all: HashSet<u64> = HashSet::new();
    for h in handles {
        let (deleted, remaining) = h.join().unwrap();
        for v in deleted {
            assert!(deleted_all.insert(v));
        }
        for v in remaining {
            remaining_all.insert(v);
        }
    }

    // Drain whatever is still in the list via the iterator, deleting as we go.
    let mut found_remaining: HashSet<u64> = HashSet::new();
    let mut cur = list.first();
    while let Some(n) = cur {
        let v = unsafe { (*n).data };
        found_remaining.insert(v);
        cur = list.next_after(n);
    }
    assert_eq!(found_remaining, remaining_all);
    assert!(deleted_all.is_disjoint(&remaining_all));

    let total_expected = threads * iterations * per_iter;
    assert_eq!(deleted_all.len() + remaining_all.len(), total_expected as usize);
}
