mod common;

use common::{Trace, boot};
use keos::{
    sync::{ConditionVariable, Lock, Semaphore},
    thread::{Current, PRI_DEFAULT, PRI_MIN, ThreadBuilder},
    timer,
};
use std::sync::Arc;

#[test]
fn priority_preempt() {
    let trace = Trace::new();
    let t = trace.clone();
    boot(move || {
        let t2 = t.clone();
        let handle = ThreadBuilder::new("high")
            .priority(PRI_DEFAULT + 1)
            .spawn(move || t2.push("high"))
            .unwrap();
        t.push("main");
        handle.join();
    });
    assert_eq!(
        trace.events(),
        vec!["high", "main"],
        "A higher-priority thread must run as soon as it is created."
    );
}

#[test]
fn priority_no_preempt_by_lower() {
    let trace = Trace::new();
    let t = trace.clone();
    boot(move || {
        let t2 = t.clone();
        let handle = ThreadBuilder::new("low")
            .priority(PRI_DEFAULT - 1)
            .spawn(move || t2.push("low"))
            .unwrap();
        t.push("main");
        handle.join();
    });
    assert_eq!(trace.events(), vec!["main", "low"]);
}

#[test]
fn priority_change() {
    let trace = Trace::new();
    let t = trace.clone();
    boot(move || {
        let t2 = t.clone();
        let handle = ThreadBuilder::new("thread 2")
            .priority(PRI_DEFAULT - 1)
            .spawn(move || t2.push("thread 2"))
            .unwrap();
        t.push("lowering");
        Current::set_priority(PRI_DEFAULT - 2);
        t.push("main");
        assert_eq!(Current::priority(), PRI_DEFAULT - 2);
        handle.join();
    });
    assert_eq!(
        trace.events(),
        vec!["lowering", "thread 2", "main"],
        "Lowering the priority below a ready thread must yield the CPU."
    );
}

#[test]
fn priority_fifo() {
    let trace = Trace::new();
    let t = trace.clone();
    boot(move || {
        Current::set_priority(PRI_DEFAULT + 2);
        let handles = (0..4)
            .map(|i| {
                let t = t.clone();
                ThreadBuilder::new(format!("fifo {i}"))
                    .priority(PRI_DEFAULT + 1)
                    .spawn(move || {
                        for _ in 0..3 {
                            t.push(i);
                            Current::yield_now();
                        }
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();
        Current::set_priority(PRI_DEFAULT);
        for handle in handles {
            handle.join();
        }
    });
    assert_eq!(
        trace.events(),
        vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3],
        "Threads of the same priority must run in round-robin order."
    );
}

#[test]
fn priority_time_slice() {
    let trace = Trace::new();
    let t = trace.clone();
    boot(move || {
        Current::set_priority(PRI_DEFAULT + 2);
        let handles = ["a", "b"]
            .into_iter()
            .map(|name| {
                let t = t.clone();
                ThreadBuilder::new(name)
                    .priority(PRI_DEFAULT + 1)
                    .spawn(move || {
                        for _ in 0..8 {
                            timer::spin(1);
                            t.push((name, timer::ticks()));
                        }
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();
        Current::set_priority(PRI_DEFAULT);
        for handle in handles {
            handle.join();
        }
    });
    let events = trace.events();
    assert_eq!(events.len(), 16);
    // Each thread runs for at most a time slice before the other one runs.
    let mut run = 0;
    for (i, (name, tick)) in events.iter().enumerate() {
        if i > 0 {
            assert!(events[i - 1].1 < *tick);
        }
        if i > 0 && events[i - 1].0 == *name {
            run += 1;
        } else {
            run = 1;
        }
        assert!(run <= 4, "`{name}` ran for more than a time slice.");
    }
    assert!(events.iter().take(8).any(|(name, _)| *name == "b"));
}

#[test]
fn priority_sema() {
    let trace = Trace::new();
    let t = trace.clone();
    boot(move || {
        let sema = Arc::new(Semaphore::new(0));
        Current::set_priority(PRI_MIN);
        let handles = (0..10)
            .map(|i| {
                let priority = PRI_DEFAULT - (i + 3) % 10 - 1;
                let (t, sema) = (t.clone(), sema.clone());
                ThreadBuilder::new(format!("priority {priority}"))
                    .priority(priority)
                    .spawn(move || {
                        sema.down();
                        t.push(priority);
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();
        for _ in 0..10 {
            sema.up();
        }
        for handle in handles {
            handle.join();
        }
    });
    assert_eq!(
        trace.events(),
        (21..=30u8).rev().collect::<Vec<_>>(),
        "Semaphore::up must wake the highest-priority waiter."
    );
}

#[test]
fn priority_condvar() {
    let trace = Trace::new();
    let t = trace.clone();
    boot(move || {
        let lock = Arc::new(Lock::new());
        let cv = Arc::new(ConditionVariable::new());
        Current::set_priority(PRI_MIN);
        let handles = (0..10)
            .map(|i| {
                let priority = PRI_DEFAULT - (i + 7) % 10 - 1;
                let (t, lock, cv) = (t.clone(), lock.clone(), cv.clone());
                ThreadBuilder::new(format!("priority {priority}"))
                    .priority(priority)
                    .spawn(move || {
                        lock.acquire();
                        cv.wait(&*lock);
                        t.push(priority);
                        lock.release();
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();
        for _ in 0..10 {
            lock.acquire();
            cv.signal(&*lock);
            lock.release();
        }
        for handle in handles {
            handle.join();
        }
    });
    assert_eq!(
        trace.events(),
        (21..=30u8).rev().collect::<Vec<_>>(),
        "ConditionVariable::signal must wake the highest-priority waiter."
    );
}

#[test]
fn priority_wake_after_donation() {
    let trace = Trace::new();
    let t = trace.clone();
    boot(move || {
        let sema = Arc::new(Semaphore::new(0));
        let lock = Arc::new(Lock::new());

        let w1 = {
            let (t, sema, lock) = (t.clone(), sema.clone(), lock.clone());
            ThreadBuilder::new("w1")
                .priority(PRI_DEFAULT + 2)
                .spawn(move || {
                    lock.acquire();
                    sema.down();
                    t.push("w1");
                    lock.release();
                })
                .unwrap()
        };
        let w2 = {
            let (t, sema) = (t.clone(), sema.clone());
            ThreadBuilder::new("w2")
                .priority(PRI_DEFAULT + 3)
                .spawn(move || {
                    sema.down();
                    t.push("w2");
                })
                .unwrap()
        };
        // w1 is already waiting on the semaphore when it receives a donation.
        let donor = {
            let (t, lock) = (t.clone(), lock.clone());
            ThreadBuilder::new("donor")
                .priority(PRI_DEFAULT + 9)
                .spawn(move || {
                    lock.acquire();
                    t.push("donor");
                    lock.release();
                })
                .unwrap()
        };
        sema.up();
        sema.up();
        w1.join();
        w2.join();
        donor.join();
    });
    assert_eq!(trace.events(), vec!["w1", "donor", "w2"]);
}

#[test]
fn priority_condvar_after_donation() {
    let trace = Trace::new();
    let t = trace.clone();
    boot(move || {
        let cv_lock = Arc::new(Lock::new());
        let cv = Arc::new(ConditionVariable::new());
        let lock = Arc::new(Lock::new());

        let w1 = {
            let (t, cv_lock, cv, lock) = (t.clone(), cv_lock.clone(), cv.clone(), lock.clone());
            ThreadBuilder::new("w1")
                .priority(PRI_DEFAULT + 2)
                .spawn(move || {
                    lock.acquire();
                    cv_lock.acquire();
                    cv.wait(&*cv_lock);
                    t.push("w1");
                    cv_lock.release();
                    lock.release();
                })
                .unwrap()
        };
        let w2 = {
            let (t, cv_lock, cv) = (t.clone(), cv_lock.clone(), cv.clone());
            ThreadBuilder::new("w2")
                .priority(PRI_DEFAULT + 3)
                .spawn(move || {
                    cv_lock.acquire();
                    cv.wait(&*cv_lock);
                    t.push("w2");
                    cv_lock.release();
                })
                .unwrap()
        };
        // w1 is already waiting on the condition variable when it receives a
        // donation that lifts it above w2.
        let donor = {
            let (t, lock) = (t.clone(), lock.clone());
            ThreadBuilder::new("donor")
                .priority(PRI_DEFAULT + 9)
                .spawn(move || {
                    lock.acquire();
                    t.push("donor");
                    lock.release();
                })
                .unwrap()
        };
        for _ in 0..2 {
            cv_lock.acquire();
            cv.signal(&*cv_lock);
            cv_lock.release();
        }
        w1.join();
        w2.join();
        donor.join();
    });
    assert_eq!(
        trace.events(),
        vec!["w1", "donor", "w2"],
        "ConditionVariable::signal must use the priorities at wake time."
    );
}
