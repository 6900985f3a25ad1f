// SPDX-License-Identifier: CEPL-1.0
use std::time::{Duration, Instant};

/// Per-frame timing: delta between ticks plus a once-per-second FPS sample.
#[derive(Debug)]
pub struct FrameClock {
    last_tick: Instant,
    last_sample: Instant,
    frames_since_sample: u32,
    fps: f32,
    delta: Duration,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            last_tick: now,
            last_sample: now,
            frames_since_sample: 0,
            fps: 0.0,
            delta: Duration::ZERO,
        }
    }

    /// Advance to `now`. Returns `Some(fps)` when a new one-second sample completed.
    pub fn tick_at(&mut self, now: Instant) -> Option<f32> {
        self.delta = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        self.frames_since_sample = self.frames_since_sample.saturating_add(1);

        let window = now.saturating_duration_since(self.last_sample);
        if window.as_secs_f32() >= 1.0 {
            self.fps = self.frames_since_sample as f32 / window.as_secs_f32();
            self.frames_since_sample = 0;
            self.last_sample = now;
            Some(self.fps)
        } else {
            None
        }
    }

    pub fn tick(&mut self) -> Option<f32> {
        self.tick_at(Instant::now())
    }

    pub fn delta(&self) -> Duration {
        self.delta
    }

    /// Frame time in milliseconds.
    pub fn delta_ms(&self) -> f32 {
        self.delta.as_secs_f32() * 1000.0
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_tracks_tick_spacing() {
        let t0 = Instant::now();
        let mut clock = FrameClock::starting_at(t0);
        assert_eq!(clock.tick_at(t0 + Duration::from_millis(16)), None);
        assert_eq!(clock.delta(), Duration::from_millis(16));
        assert!((clock.delta_ms() - 16.0).abs() < 1e-3);
    }

    #[test]
    fn fps_sampled_once_per_second() {
        let t0 = Instant::now();
        let mut clock = FrameClock::starting_at(t0);
        let mut sample = None;
        for i in 1..=60u64 {
            sample = clock.tick_at(t0 + Duration::from_micros(i * 16_667));
        }
        let fps = sample.expect("sixty 16.6ms frames complete a one second window");
        assert!((fps - 60.0).abs() < 0.5, "fps = {fps}");
        assert_eq!(clock.fps(), fps);
    }
}
