#![allow(dead_code)]

pub mod fixtures;

pub use fixtures::*;

use std::thread;
use std::time::{Duration, Instant};

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

pub const PATIENCE: Duration = Duration::from_secs(10);

/// Name of the calling thread, or "unnamed".
pub fn thread_name() -> String {
    thread::current().name().unwrap_or("unnamed").to_string()
}
