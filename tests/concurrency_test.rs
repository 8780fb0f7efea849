use spatree::prelude::*;
use std::collections::HashSet;
use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const THREADS: usize = 8;
const PER_THREAD: usize = 250;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn disjoint_shape(thread: usize, i: usize) -> Envelope {
    let x = (thread * PER_THREAD + i) as f64 * 2.0;
    let y = (i % 7) as f64;
    Envelope::rect(x, y, x + 1.0, y + 1.0)
}

fn payload(thread: usize, i: usize) -> Bytes {
    Bytes::from(format!("t{}-{}", thread, i))
}

fn everything() -> Envelope {
    Envelope::rect(-1.0, -1.0, 1.0e9, 1.0e9)
}

#[test]
fn test_concurrent_inserts_no_loss_no_duplicates() {
    init_logging();
    let index = SpatialIndex::memory(IndexConfig::default().with_fanout(2, 6)).unwrap();
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for t in 0..THREADS {
            let index = &index;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    index.insert(disjoint_shape(t, i), payload(t, i)).unwrap();
                }
            });
        }
    });

    let hits = index.query_to_vec(&everything()).unwrap();
    assert_eq!(hits.len(), THREADS * PER_THREAD);
    let unique: HashSet<Bytes> = hits.into_iter().map(|(_, p)| p).collect();
    assert_eq!(unique.len(), THREADS * PER_THREAD);

    let stats = index.validate().unwrap();
    assert_eq!(stats.entry_count, (THREADS * PER_THREAD) as u64);
}

#[test]
fn test_queries_during_inserts() {
    let index = SpatialIndex::memory(IndexConfig::default().with_fanout(2, 4)).unwrap();
    let done = AtomicBool::new(false);
    let total = 4 * PER_THREAD;

    thread::scope(|s| {
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let index = &index;
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        index.insert(disjoint_shape(t, i), payload(t, i)).unwrap();
                    }
                })
            })
            .collect();

        for _ in 0..3 {
            let index = &index;
            let done = &done;
            s.spawn(move || {
                let mut last = 0;
                while !done.load(Ordering::Acquire) {
                    let seen = index.query(&everything()).unwrap().count();
                    assert!(seen <= total);
                    // entries are only added, so a later query sees at least as many
                    assert!(seen >= last);
                    last = seen;
                }
            });
        }

        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Release);
    });

    assert_eq!(index.query_to_vec(&everything()).unwrap().len(), total);
    index.validate().unwrap();
}

#[test]
fn test_mixed_inserts_and_deletes() {
    init_logging();
    let index = SpatialIndex::memory(IndexConfig::default().with_fanout(2, 4)).unwrap();

    thread::scope(|s| {
        for t in 0..4 {
            let index = &index;
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    index.insert(disjoint_shape(t, i), payload(t, i)).unwrap();
                    if i % 2 == 1 {
                        index
                            .delete(&disjoint_shape(t, i - 1), payload(t, i - 1))
                            .unwrap();
                    }
                }
            });
        }
    });

    assert_eq!(index.len(), (4 * PER_THREAD / 2) as u64);
    for t in 0..4 {
        for i in 0..PER_THREAD {
            let present = index.contains(&disjoint_shape(t, i), payload(t, i)).unwrap();
            assert_eq!(present, i % 2 == 1);
        }
    }
    index.validate().unwrap();
}

#[test]
fn test_passivation_during_queries() {
    let index = SpatialIndex::memory(IndexConfig::default().with_fanout(2, 4)).unwrap();
    for i in 0..300 {
        index.insert(disjoint_shape(0, i), payload(0, i)).unwrap();
    }
    assert!(index.passivate_all().unwrap() > 0);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let index = &index;
                s.spawn(move || {
                    for _ in 0..50 {
                        assert_eq!(index.query(&everything()).unwrap().count(), 300);
                    }
                })
            })
            .collect();

        let index = &index;
        let done_ref = &done;
        s.spawn(move || {
            while !done_ref.load(Ordering::Acquire) {
                index.passivate_all().unwrap();
            }
        });

        for reader in readers {
            reader.join().unwrap();
        }
        done.store(true, Ordering::Release);
    });

    assert!(index.stats().cache.misses > 0);
    index.validate().unwrap();
}

#[test]
fn test_lock_timeout_surfaces() {
    init_logging();
    let config = IndexConfig::default().with_lock_timeout(Duration::from_millis(50));
    let index = SpatialIndex::memory(config).unwrap();
    index.insert(Envelope::rect(0.0, 0.0, 1.0, 1.0), "a").unwrap();

    let root = index.root_identifier();
    let held = root.write_lock(None).unwrap();
    assert!(root.is_locked());

    thread::scope(|s| {
        let insert = s.spawn(|| index.insert(Envelope::rect(2.0, 2.0, 3.0, 3.0), "b"));
        let query = s.spawn(|| index.query_to_vec(&everything()).map(|hits| hits.len()));

        assert!(matches!(insert.join().unwrap(), Err(SpatreeError::Timeout(_))));
        assert!(matches!(query.join().unwrap(), Err(SpatreeError::Timeout(_))));
    });

    drop(held);
    assert!(!root.is_locked());
    index.insert(Envelope::rect(2.0, 2.0, 3.0, 3.0), "b").unwrap();
    assert_eq!(index.len(), 2);
}
