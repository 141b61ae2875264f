//! Timing and running-average meters.

use std::time::Instant;

/// Accumulates the duration of start/stop intervals.
#[derive(Debug, Clone, Default)]
pub struct StopwatchMeter {
    started: Option<Instant>,
    sum: f64,
    count: u64,
}

impl StopwatchMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Meter that is already running.
    pub fn started() -> Self {
        let mut meter = Self::new();
        meter.start();
        meter
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Close the running interval. No-op when not running.
    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.sum += started.elapsed().as_secs_f64();
            self.count += 1;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Total seconds over closed intervals.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Weighted running average.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, val: f64, weight: f64) {
        self.val = val;
        self.sum += val * weight;
        self.count += weight;
    }

    pub fn avg(&self) -> f64 {
        if self.count > 0.0 {
            self.sum / self.count
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopwatch_counts_closed_intervals() {
        let mut meter = StopwatchMeter::new();
        meter.stop();
        assert_eq!(meter.count(), 0);

        meter.start();
        std::thread::sleep(std::time::Duration::from_millis(2));
        meter.stop();
        meter.start();
        meter.stop();
        assert_eq!(meter.count(), 2);
        assert!(meter.sum() > 0.0);
        assert!(meter.avg() <= meter.sum());

        meter.reset();
        assert_eq!(meter.sum(), 0.0);
    }

    #[test]
    fn average_is_weighted() {
        let mut meter = AverageMeter::new();
        assert_eq!(meter.avg(), 0.0);
        meter.update(2.0, 1.0);
        meter.update(5.0, 3.0);
        assert_eq!(meter.val, 5.0);
        assert!((meter.avg() - 17.0 / 4.0).abs() < 1e-12);
    }
}
