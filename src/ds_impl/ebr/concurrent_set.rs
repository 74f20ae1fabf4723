use crossbeam_ebr::Guard;

pub trait ConcurrentSet<K> {
    fn new() -> Self;
    fn contains(&self, key: &K, guard: &Guard) -> bool;
    fn insert(&self, key: K, guard: &Guard) -> bool;
    fn remove(&self, key: &K, guard: &Guard) -> bool;

    /// Number of keys in the set.
    ///
    /// Only meaningful while no `insert` or `remove` is in flight.
    fn size(&self, guard: &Guard) -> usize;

    /// Sum of all keys in the set. Same precondition as [`ConcurrentSet::size`].
    fn key_sum(&self, guard: &Guard) -> i64;
}

#[cfg(test)]
pub mod tests {
    extern crate rand;
    use super::ConcurrentSet;
    use crossbeam_ebr::pin;
    use crossbeam_utils::thread;
    use rand::prelude::*;
    use std::sync::atomic::{AtomicIsize, Ordering};

    const THREADS: i32 = 30;
    const ELEMENTS_PER_THREADS: i32 = 1000;

    fn keys_of(t: i32) -> Vec<i32> {
        let mut rng = rand::thread_rng();
        let mut keys: Vec<i32> = (0..ELEMENTS_PER_THREADS).map(|k| k * THREADS + t).collect();
        keys.shuffle(&mut rng);
        keys
    }

    fn sum_of(threads: std::ops::Range<i32>) -> i64 {
        threads
            .flat_map(|t| (0..ELEMENTS_PER_THREADS).map(move |k| (k * THREADS + t) as i64))
            .sum()
    }

    /// Disjoint inserts, then removals of half the keys racing with lookups of the other half.
    pub fn smoke<M: ConcurrentSet<i32> + Send + Sync>() {
        let set = &M::new();

        thread::scope(|s| {
            for t in 0..THREADS {
                s.spawn(move |_| {
                    for i in keys_of(t) {
                        assert!(set.insert(i, &pin()));
                    }
                });
            }
        })
        .unwrap();

        let guard = &pin();
        assert_eq!(set.size(guard), (THREADS * ELEMENTS_PER_THREADS) as usize);
        assert_eq!(set.key_sum(guard), sum_of(0..THREADS));
        for t in 0..THREADS {
            for i in keys_of(t) {
                assert!(set.contains(&i, guard));
                assert!(!set.insert(i, guard));
            }
        }

        thread::scope(|s| {
            for t in 0..(THREADS / 2) {
                s.spawn(move |_| {
                    for i in keys_of(t) {
                        assert!(set.remove(&i, &pin()));
                    }
                });
            }
            for t in (THREADS / 2)..THREADS {
                s.spawn(move |_| {
                    for i in keys_of(t) {
                        assert!(set.contains(&i, &pin()));
                    }
                });
            }
        })
        .unwrap();

        let guard = &pin();
        assert_eq!(
            set.size(guard),
            ((THREADS - THREADS / 2) * ELEMENTS_PER_THREADS) as usize
        );
        assert_eq!(set.key_sum(guard), sum_of((THREADS / 2)..THREADS));

        thread::scope(|s| {
            for t in 0..(THREADS / 2) {
                s.spawn(move |_| {
                    for i in keys_of(t) {
                        assert!(!set.contains(&i, &pin()));
                        assert!(!set.remove(&i, &pin()));
                    }
                });
            }
            for t in (THREADS / 2)..THREADS {
                s.spawn(move |_| {
                    for i in keys_of(t) {
                        assert!(set.contains(&i, &pin()));
                    }
                });
            }
        })
        .unwrap();
    }

    /// Many threads flip a single key in and out of a set. The neighbours make the
    /// first removal take the two-children path and move a successor up.
    pub fn same_key_race<M: ConcurrentSet<i32> + Send + Sync>() {
        const KEY: i32 = 100;
        const ROUNDS: usize = 20;
        const OPS: usize = 500;

        let set = &M::new();
        let neighbours = [50, 150, 25, 75, 125, 175, 101, 102, 99];
        let guard = &pin();
        assert!(set.insert(KEY, guard));
        for k in neighbours {
            assert!(set.insert(k, guard));
        }
        let base_size = neighbours.len();
        let base_sum: i64 = neighbours.iter().map(|&k| k as i64).sum();

        let net = &AtomicIsize::new(1);
        for _ in 0..ROUNDS {
            thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(move |_| {
                        let mut rng = rand::thread_rng();
                        for _ in 0..OPS {
                            let guard = &pin();
                            if rng.gen_bool(0.5) {
                                if set.insert(KEY, guard) {
                                    net.fetch_add(1, Ordering::Relaxed);
                                }
                            } else if set.remove(&KEY, guard) {
                                net.fetch_sub(1, Ordering::Relaxed);
                            }
                        }
                    });
                }
            })
            .unwrap();

            let guard = &pin();
            let count = net.load(Ordering::Relaxed);
            assert!(count == 0 || count == 1, "key counted {} times", count);
            assert_eq!(set.contains(&KEY, guard), count == 1);
            assert_eq!(set.size(guard), base_size + count as usize);
            assert_eq!(set.key_sum(guard), base_sum + count as i64 * KEY as i64);
            for k in neighbours {
                assert!(set.contains(&k, guard));
            }
        }
    }

    /// Random mixed workload over a small key range; per-key success counts must
    /// agree with the final contents.
    pub fn mixed<M: ConcurrentSet<i32> + Send + Sync>() {
        const RANGE: i32 = 256;
        const OPS: usize = 20_000;

        let set = &M::new();
        let nets: &Vec<AtomicIsize> = &(0..RANGE).map(|_| AtomicIsize::new(0)).collect();

        thread::scope(|s| {
            for _ in 0..(THREADS / 2) {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    for _ in 0..OPS {
                        let key = rng.gen_range(0..RANGE);
                        let guard = &pin();
                        match rng.gen_range(0..3) {
                            0 => {
                                set.contains(&key, guard);
                            }
                            1 => {
                                if set.insert(key, guard) {
                                    nets[key as usize].fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            _ => {
                                if set.remove(&key, guard) {
                                    nets[key as usize].fetch_sub(1, Ordering::Relaxed);
                                }
                            }
                        }
                    }
                });
            }
        })
        .unwrap();

        let guard = &pin();
        let mut size = 0;
        let mut sum = 0;
        for key in 0..RANGE {
            let net = nets[key as usize].load(Ordering::Relaxed);
            assert!(net == 0 || net == 1, "key {} counted {} times", key, net);
            assert_eq!(set.contains(&key, guard), net == 1, "key {}", key);
            if net == 1 {
                size += 1;
                sum += key as i64;
            }
        }
        assert_eq!(set.size(guard), size);
        assert_eq!(set.key_sum(guard), sum);
    }
}
