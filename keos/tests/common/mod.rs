//! Boot helpers shared by the integration tests.
#![allow(dead_code)]

use keos::{Kernel, SchedulerMode, SystemConfiguration};
use std::sync::{Arc, Mutex};

/// Boots a kernel with the default configuration and runs `f` as its main
/// thread.
pub fn boot<R>(f: impl FnOnce() -> R) -> R {
    Kernel::start(SystemConfiguration::default(), f).unwrap()
}

/// Boots a kernel that runs the MLFQS scheduler.
pub fn boot_mlfqs<R>(f: impl FnOnce() -> R) -> R {
    let config = SystemConfiguration::builder()
        .set_scheduler(SchedulerMode::Mlfqs)
        .build()
        .unwrap();
    Kernel::start(config, f).unwrap()
}

/// An ordered log of events, shared between kernel threads.
pub struct Trace<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Trace<T> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
        }
    }
}

impl<T: Clone> Trace<T> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, event: T) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<T> {
        self.events.lock().unwrap().clone()
    }
}
