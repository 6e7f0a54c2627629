//! Monotonic endpoint clock. Times on the wire are f32 seconds since the
//! owning endpoint started, matching the session-time fields in the payloads.

use std::time::Instant;

#[derive(Debug, Clone)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            start: Instant::now(),
        }
    }

    pub fn now(&self) -> f32 {
        self.start.elapsed().as_secs_f32()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}
