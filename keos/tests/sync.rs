mod common;

use common::{Trace, boot};
use keos::{
    sync::{ConditionVariable, Lock, Mutex, Semaphore, WouldBlock},
    thread::{PRI_DEFAULT, ThreadBuilder, ThreadStatus, get_state_by_tid},
    timer,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

#[test]
fn sema_ping_pong() {
    let trace = Trace::new();
    let t = trace.clone();
    boot(move || {
        let (ping, pong) = (Arc::new(Semaphore::new(0)), Arc::new(Semaphore::new(0)));
        let handle = {
            let (t, ping, pong) = (t.clone(), ping.clone(), pong.clone());
            ThreadBuilder::new("pong")
                .spawn(move || {
                    for i in 0..5 {
                        ping.down();
                        t.push(("pong", i));
                        pong.up();
                    }
                })
                .unwrap()
        };
        for i in 0..5 {
            t.push(("ping", i));
            ping.up();
            pong.down();
        }
        handle.join();
    });
    let expected = (0..5)
        .flat_map(|i| [("ping", i), ("pong", i)])
        .collect::<Vec<_>>();
    assert_eq!(trace.events(), expected);
}

#[test]
fn sema_n_permits() {
    const PERMITS: usize = 2;
    boot(|| {
        let sema = Arc::new(Semaphore::new(PERMITS));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles = (0..6)
            .map(|i| {
                let (sema, inside, peak) = (sema.clone(), inside.clone(), peak.clone());
                ThreadBuilder::new(format!("worker {i}"))
                    .spawn(move || {
                        let _permit = sema.wait();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        timer::spin(10);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join();
        }
        assert_eq!(peak.load(Ordering::SeqCst), PERMITS);
        assert_eq!(sema.value(), PERMITS);
    });
}

#[test]
fn sema_try_down() {
    boot(|| {
        let sema = Semaphore::new(1);
        assert!(sema.try_down());
        assert!(!sema.try_down());
        sema.up();
        assert_eq!(sema.value(), 1);
    });
}

#[test]
fn lock_blocks_waiter() {
    boot(|| {
        let lock = Arc::new(Lock::new());
        lock.acquire();
        assert!(lock.held_by_current());
        let handle = {
            let lock = lock.clone();
            ThreadBuilder::new("blockee")
                .priority(PRI_DEFAULT + 1)
                .spawn(move || {
                    lock.acquire();
                    lock.release();
                })
                .unwrap()
        };
        assert_eq!(
            get_state_by_tid(handle.tid),
            Ok(ThreadStatus::Blocked),
            "A thread waiting for a lock must be blocked."
        );
        assert_eq!(handle.status(), ThreadStatus::Blocked);
        lock.release();
        assert!(lock.holder().is_none());
        handle.join();
    });
}

#[test]
#[should_panic(expected = "already held by the current thread")]
fn lock_reacquire_panics() {
    boot(|| {
        let lock = Lock::new();
        lock.acquire();
        lock.acquire();
    });
}

#[test]
#[should_panic(expected = "Try to release a lock that is not held by the current thread")]
fn lock_release_by_other_panics() {
    boot(|| {
        let lock = Arc::new(Lock::new());
        lock.acquire();
        let l = lock.clone();
        ThreadBuilder::new("thief")
            .priority(PRI_DEFAULT + 1)
            .spawn(move || l.release())
            .unwrap();
    });
}

#[test]
#[should_panic(expected = "without holding its lock")]
fn condvar_signal_without_lock_panics() {
    boot(|| {
        let lock = Lock::new();
        ConditionVariable::new().signal(&lock);
    });
}

#[test]
fn mutex_try_lock() {
    boot(|| {
        let mutex = Arc::new(Mutex::new(3));
        let guard = mutex.lock();
        let handle = {
            let mutex = mutex.clone();
            ThreadBuilder::new("try")
                .priority(PRI_DEFAULT + 1)
                .spawn(move || assert!(matches!(mutex.try_lock(), Err(WouldBlock))))
                .unwrap()
        };
        guard.unlock();
        handle.join();

        let mut guard = mutex.try_lock().unwrap();
        *guard += 1;
        guard.unlock();
        assert_eq!(Arc::try_unwrap(mutex).ok().map(Mutex::into_inner), Some(4));
    });
}

#[test]
#[should_panic(expected = "`.unlock()` must be explicitly called")]
fn mutex_guard_must_be_unlocked() {
    boot(|| {
        let mutex = Mutex::new(());
        let _guard = mutex.lock();
    });
}

#[test]
fn mutex_stress() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 16;
    let mut rng = StdRng::seed_from_u64(0x6b65_6f73);
    let plans = (0..THREADS)
        .map(|_| {
            let priority = rng.gen_range(PRI_DEFAULT - 4..=PRI_DEFAULT + 4);
            let spins = (0..ROUNDS)
                .map(|_| rng.gen_range(0..3i64))
                .collect::<Vec<_>>();
            (priority, spins)
        })
        .collect::<Vec<_>>();

    let count = boot(move || {
        let counter = Arc::new(Mutex::new(0usize));
        let handles = plans
            .into_iter()
            .enumerate()
            .map(|(i, (priority, spins))| {
                let counter = counter.clone();
                ThreadBuilder::new(format!("stress {i}"))
                    .priority(priority)
                    .spawn(move || {
                        for spin in spins {
                            let mut guard = counter.lock();
                            let seen = *guard;
                            // Get preempted in the middle of the critical section.
                            timer::spin(spin);
                            *guard = seen + 1;
                            guard.unlock();
                            timer::spin(1);
                        }
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join();
        }
        let guard = counter.lock();
        let count = *guard;
        guard.unlock();
        count
    });
    assert_eq!(count, THREADS * ROUNDS);
}

struct BoundedBuffer {
    inner: Mutex<VecDeque<usize>>,
    not_full: ConditionVariable,
    not_empty: ConditionVariable,
}

impl BoundedBuffer {
    const CAPACITY: usize = 2;

    fn put(&self, val: usize) {
        let mut guard = self
            .not_full
            .wait_while(&self.inner, |b| b.len() == Self::CAPACITY);
        guard.push_back(val);
        self.not_empty.signal(&guard);
        guard.unlock();
    }

    fn get(&self) -> usize {
        let mut guard = self.not_empty.wait_while(&self.inner, |b| b.is_empty());
        let val = guard.pop_front().unwrap();
        self.not_full.signal(&guard);
        guard.unlock();
        val
    }
}

#[test]
fn condvar_bounded_buffer() {
    const ITEMS: usize = 32;
    let received = boot(|| {
        let buffer = Arc::new(BoundedBuffer {
            inner: Mutex::new(VecDeque::new()),
            not_full: ConditionVariable::new(),
            not_empty: ConditionVariable::new(),
        });
        let producer = {
            let buffer = buffer.clone();
            ThreadBuilder::new("producer")
                .spawn(move || {
                    for i in 0..ITEMS {
                        buffer.put(i);
                    }
                })
                .unwrap()
        };
        let received = (0..ITEMS).map(|_| buffer.get()).collect::<Vec<_>>();
        producer.join();
        received
    });
    assert_eq!(received, (0..ITEMS).collect::<Vec<_>>());
}

#[test]
fn condvar_broadcast() {
    let woken = boot(|| {
        let lock = Arc::new(Lock::new());
        let cv = Arc::new(ConditionVariable::new());
        let woken = Arc::new(AtomicUsize::new(0));
        let handles = (0..4)
            .map(|i| {
                let (lock, cv, woken) = (lock.clone(), cv.clone(), woken.clone());
                ThreadBuilder::new(format!("waiter {i}"))
                    .priority(PRI_DEFAULT + 1)
                    .spawn(move || {
                        lock.acquire();
                        cv.wait(&*lock);
                        woken.fetch_add(1, Ordering::SeqCst);
                        lock.release();
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();
        lock.acquire();
        cv.broadcast(&*lock);
        lock.release();
        for handle in handles {
            handle.join();
        }
        woken.load(Ordering::SeqCst)
    });
    assert_eq!(woken, 4);
}
