use std::time::{Duration, Instant};

/// Frame clock driving the animation runner.
pub struct Time {
    start: Instant,
    last: Instant,
    elapsed: Duration,
    pub delta: Duration,
}

impl Time {
    pub fn new() -> Self {
        let now = Instant::now();
        Self { start: now, last: now, elapsed: Duration::ZERO, delta: Duration::ZERO }
    }

    /// Advances from the wall clock.
    pub fn tick(&mut self) {
        let now = Instant::now();
        self.delta = now - self.last;
        self.last = now;
        self.elapsed = now.duration_since(self.start);
    }

    /// Advances by an explicit amount, ignoring the wall clock.
    pub fn advance(&mut self, seconds: f32) {
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        self.delta = Duration::from_secs_f32(seconds);
        self.elapsed += self.delta;
        self.last = Instant::now();
    }

    pub fn delta_seconds(&self) -> f32 {
        self.delta.as_secs_f32()
    }

    pub fn elapsed_seconds(&self) -> f32 {
        self.elapsed.as_secs_f32()
    }
}

impl Default for Time {
    fn default() -> Self {
        Self::new()
    }
}
