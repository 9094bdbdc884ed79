//! Sustained-load evaluation over a bounded ring buffer of fleet-average
//! samples.
//!
//! The buffer is sized for the low-load window plus slack and trimmed to a
//! one-hour horizon. Evaluation counts samples rather than filtering by
//! wall-clock span: a time-window filter would age records out at the same
//! rate new ones arrive and the high-load window could never fill.

use chrono::{DateTime, Duration, Local};
use std::collections::VecDeque;

/// Fleet-average load at one tick, over the serving set
#[derive(Debug, Clone, Copy)]
pub struct LoadSample {
    pub at: DateTime<Local>,
    pub cpu_pct: f64,
    pub mem_pct: f64,
}

/// Which threshold drove a scale-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    Cpu,
    Memory,
}

impl ThresholdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdKind::Cpu => "cpu",
            ThresholdKind::Memory => "memory",
        }
    }
}

/// Outcome of a sustained-load evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleSignal {
    Up {
        avg_cpu: f64,
        avg_mem: f64,
        trigger: ThresholdKind,
    },
    Down {
        avg_cpu: f64,
        avg_mem: f64,
    },
    None,
}

/// Thresholds for the two evaluation windows
#[derive(Debug, Clone, Copy)]
pub struct LoadThresholds {
    pub cpu_high_pct: f64,
    pub mem_high_pct: f64,
    pub cpu_low_pct: f64,
    pub mem_low_pct: f64,
}

/// Ring buffer of load samples with the two-window evaluation
#[derive(Debug)]
pub struct LoadWindow {
    samples: VecDeque<LoadSample>,
    capacity: usize,
    trim_horizon: Duration,
}

impl LoadWindow {
    /// `capacity` should cover the low-load window with some slack.
    pub fn new(capacity: usize, trim_horizon_minutes: i64) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            trim_horizon: Duration::minutes(trim_horizon_minutes),
        }
    }

    pub fn push(&mut self, sample: LoadSample) {
        self.samples.push_back(sample);
        self.trim(sample.at);
    }

    fn trim(&mut self, now: DateTime<Local>) {
        let cutoff = now - self.trim_horizon;
        while let Some(front) = self.samples.front() {
            if front.at < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Power transitions invalidate the history.
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn mean_over_newest(&self, count: usize) -> (f64, f64) {
        let take = self.samples.len().saturating_sub(count);
        let mut cpu_sum = 0.0;
        let mut mem_sum = 0.0;
        let mut n = 0usize;
        for sample in self.samples.iter().skip(take) {
            cpu_sum += sample.cpu_pct;
            mem_sum += sample.mem_pct;
            n += 1;
        }
        if n == 0 {
            (0.0, 0.0)
        } else {
            (cpu_sum / n as f64, mem_sum / n as f64)
        }
    }

    /// Evaluate both windows. Scale-up needs `high_samples` samples and a
    /// mean above either high threshold; scale-down needs more than one
    /// serving server, `low_samples` samples, and means below both low
    /// thresholds.
    pub fn evaluate(
        &self,
        thresholds: &LoadThresholds,
        high_samples: usize,
        low_samples: usize,
        serving_count: usize,
    ) -> ScaleSignal {
        if self.samples.len() >= high_samples {
            let (avg_cpu, avg_mem) = self.mean_over_newest(high_samples);
            if avg_cpu > thresholds.cpu_high_pct || avg_mem > thresholds.mem_high_pct {
                let trigger = if avg_cpu > thresholds.cpu_high_pct {
                    ThresholdKind::Cpu
                } else {
                    ThresholdKind::Memory
                };
                return ScaleSignal::Up {
                    avg_cpu,
                    avg_mem,
                    trigger,
                };
            }
        }

        if serving_count > 1 && self.samples.len() >= low_samples {
            let (avg_cpu, avg_mem) = self.mean_over_newest(low_samples);
            if avg_cpu < thresholds.cpu_low_pct && avg_mem < thresholds.mem_low_pct {
                return ScaleSignal::Down { avg_cpu, avg_mem };
            }
        }

        ScaleSignal::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLDS: LoadThresholds = LoadThresholds {
        cpu_high_pct: 90.0,
        mem_high_pct: 90.0,
        cpu_low_pct: 3.0,
        mem_low_pct: 20.0,
    };

    fn fill(window: &mut LoadWindow, count: usize, cpu: f64, mem: f64) {
        let start = Local::now();
        for i in 0..count {
            window.push(LoadSample {
                at: start + Duration::seconds(5 * i as i64),
                cpu_pct: cpu,
                mem_pct: mem,
            });
        }
    }

    #[test]
    fn test_exactly_sixty_samples_triggers_high_eval() {
        let mut window = LoadWindow::new(372, 60);
        fill(&mut window, 59, 92.0, 40.0);
        assert_eq!(
            window.evaluate(&THRESHOLDS, 60, 360, 1),
            ScaleSignal::None
        );

        fill(&mut window, 1, 92.0, 40.0);
        match window.evaluate(&THRESHOLDS, 60, 360, 1) {
            ScaleSignal::Up { trigger, .. } => assert_eq!(trigger, ThresholdKind::Cpu),
            other => panic!("expected scale-up, got {other:?}"),
        }
    }

    #[test]
    fn test_memory_trigger_when_cpu_is_fine() {
        let mut window = LoadWindow::new(372, 60);
        fill(&mut window, 60, 40.0, 95.0);
        match window.evaluate(&THRESHOLDS, 60, 360, 1) {
            ScaleSignal::Up { trigger, .. } => assert_eq!(trigger, ThresholdKind::Memory),
            other => panic!("expected scale-up, got {other:?}"),
        }
    }

    #[test]
    fn test_scale_down_requires_multiple_servers() {
        let mut window = LoadWindow::new(372, 60);
        fill(&mut window, 360, 1.0, 10.0);
        assert_eq!(
            window.evaluate(&THRESHOLDS, 60, 360, 1),
            ScaleSignal::None
        );
        assert!(matches!(
            window.evaluate(&THRESHOLDS, 60, 360, 2),
            ScaleSignal::Down { .. }
        ));
    }

    #[test]
    fn test_scale_down_needs_both_thresholds_low() {
        let mut window = LoadWindow::new(372, 60);
        fill(&mut window, 360, 1.0, 35.0);
        assert_eq!(
            window.evaluate(&THRESHOLDS, 60, 360, 2),
            ScaleSignal::None
        );
    }

    #[test]
    fn test_up_uses_only_newest_samples() {
        let mut window = LoadWindow::new(372, 60);
        fill(&mut window, 300, 10.0, 10.0);
        fill(&mut window, 60, 95.0, 40.0);
        assert!(matches!(
            window.evaluate(&THRESHOLDS, 60, 360, 1),
            ScaleSignal::Up { .. }
        ));
    }

    #[test]
    fn test_capacity_cap() {
        let mut window = LoadWindow::new(10, 60);
        fill(&mut window, 25, 50.0, 50.0);
        assert_eq!(window.len(), 10);
    }

    #[test]
    fn test_trim_horizon_drops_stale_samples() {
        let mut window = LoadWindow::new(1000, 60);
        let old = Local::now() - Duration::minutes(90);
        window.push(LoadSample {
            at: old,
            cpu_pct: 50.0,
            mem_pct: 50.0,
        });
        window.push(LoadSample {
            at: Local::now(),
            cpu_pct: 50.0,
            mem_pct: 50.0,
        });
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut window = LoadWindow::new(372, 60);
        fill(&mut window, 100, 50.0, 50.0);
        window.reset();
        assert!(window.is_empty());
    }
}
