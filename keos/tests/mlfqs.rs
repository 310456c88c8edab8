mod common;

use common::{Trace, boot_mlfqs};
use keos::{
    fixed_point::Fixed,
    thread::{
        self, Current, PRI_MAX, ThreadBuilder,
        mlfqs::{decay_recent_cpu, next_load_avg},
    },
    timer,
};

#[test]
fn mlfqs_priority_follows_recent_cpu() {
    boot_mlfqs(|| {
        assert_eq!(Current::priority(), PRI_MAX);
        timer::spin(4);
        assert_eq!(Current::recent_cpu(), 400);
        assert_eq!(Current::priority(), PRI_MAX - 1);
    });
}

#[test]
fn mlfqs_load_avg() {
    boot_mlfqs(|| {
        assert_eq!(thread::load_avg(), 0);
        timer::spin(100);
        let load_avg = next_load_avg(Fixed::ZERO, 1);
        assert_eq!(thread::load_avg_fixed(), load_avg);
        assert_eq!(thread::load_avg(), 2);

        let recent_cpu = decay_recent_cpu(Fixed::from_int(100), load_avg, 0);
        assert_eq!(Current::recent_cpu(), (recent_cpu * 100).to_int_round());
    });
}

#[test]
fn mlfqs_nice() {
    boot_mlfqs(|| {
        Current::set_nice(5);
        assert_eq!(Current::nice(), 5);
        assert_eq!(Current::priority(), 53);
        Current::set_nice(-20);
        assert_eq!(Current::priority(), PRI_MAX);
    });
}

#[test]
#[should_panic(expected = "out of range")]
fn mlfqs_nice_out_of_range() {
    boot_mlfqs(|| Current::set_nice(21));
}

#[test]
fn mlfqs_ignores_set_priority() {
    boot_mlfqs(|| {
        Current::set_priority(10);
        assert_eq!(Current::priority(), PRI_MAX);
    });
}

#[test]
fn mlfqs_inherits_nice() {
    let nice = boot_mlfqs(|| {
        Current::set_nice(3);
        let trace = Trace::new();
        let t = trace.clone();
        ThreadBuilder::new("child")
            .priority(0)
            .spawn(move || t.push((Current::nice(), Current::priority())))
            .unwrap()
            .join();
        trace.events()
    });
    assert_eq!(nice, vec![(3, 57)]);
}

#[test]
fn mlfqs_nice_gets_less_cpu() {
    let trace = Trace::new();
    let t = trace.clone();
    boot_mlfqs(move || {
        let handles = [("kind", 0), ("nice", 20)]
            .into_iter()
            .map(|(name, nice)| {
                let t = t.clone();
                ThreadBuilder::new(name)
                    .spawn(move || {
                        Current::set_nice(nice);
                        timer::spin(100);
                        t.push(name);
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join();
        }
    });
    assert_eq!(trace.events(), vec!["kind", "nice"]);
}
