//! Progress notifications for pack and unpack operations.
//!
//! The pipelines report what they are doing through an [`Observer`]. Every
//! callback is fire-and-forget: nothing an observer does can change the
//! outcome of the operation.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::common::ContentHash;

/// Which pipeline finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Pack,
    Unpack,
}

/// A file was read and hashed during packing.
#[derive(Debug, Clone)]
pub struct HashEvent<'a> {
    pub name: &'a str,
    pub size: u64,
    pub hash: ContentHash,
    /// True when this content had not been seen before in the current pack.
    pub is_new: bool,
}

/// Receives progress events. All methods default to doing nothing.
pub trait Observer {
    fn hashed(&self, _event: &HashEvent<'_>) {}

    fn folder_created(&self, _name: &str, _is_container: bool) {}

    /// `len` bytes were appended to the payload; `total` is the running sum.
    fn compressed(&self, _len: u64, _total: u64) {}

    fn unpack_progress(&self, _processed: usize, _total: usize) {}

    fn finished(&self, _operation: Operation) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Prints completion messages and unpack percentage to stdout.
#[derive(Debug)]
pub struct ConsoleObserver {
    last_percent: AtomicUsize,
    distinct: AtomicU64,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self {
            last_percent: AtomicUsize::new(usize::MAX),
            distinct: AtomicU64::new(0),
        }
    }

    /// Number of distinct contents reported so far.
    pub fn distinct_hashes(&self) -> u64 {
        self.distinct.load(Ordering::Relaxed)
    }
}

impl Default for ConsoleObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for ConsoleObserver {
    fn hashed(&self, event: &HashEvent<'_>) {
        if event.is_new {
            self.distinct.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn unpack_progress(&self, processed: usize, total: usize) {
        if total == 0 {
            return;
        }
        let percent = processed * 100 / total;
        if self.last_percent.swap(percent, Ordering::Relaxed) != percent {
            println!("Unpacking: {}%", percent);
        }
    }

    fn finished(&self, operation: Operation) {
        match operation {
            Operation::Pack => println!("Packing complete. {} distinct blobs.", self.distinct_hashes()),
            Operation::Unpack => println!("Unpacking complete."),
        }
    }
}
