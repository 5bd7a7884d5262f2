// src/container/monitor.rs

//! Background resource sampling while a step runs

use crate::container::{ResourceStats, StatsSource};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Highest values seen across samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeakUsage {
    pub memory_bytes: u64,
    pub process_count: usize,
    pub cpu_time_us: u64,
    pub samples: usize,
}

impl PeakUsage {
    fn record(&mut self, stats: &ResourceStats) {
        self.memory_bytes = self.memory_bytes.max(stats.memory_bytes);
        self.process_count = self.process_count.max(stats.process_count);
        self.cpu_time_us = self.cpu_time_us.max(stats.cpu_time_us);
        self.samples += 1;
    }
}

pub struct Monitor {
    stop: Sender<()>,
    handle: JoinHandle<PeakUsage>,
}

impl Monitor {
    pub fn start(label: String, source: StatsSource) -> Self {
        Self::start_with_interval(label, source, SAMPLE_INTERVAL)
    }

    pub fn start_with_interval(label: String, source: StatsSource, interval: Duration) -> Self {
        let (stop, rx) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            let mut peak = PeakUsage::default();
            loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let stats = source.sample();
                        debug!(
                            "[{}] mem={} procs={} cpu={}us",
                            label, stats.memory_bytes, stats.process_count, stats.cpu_time_us
                        );
                        peak.record(&stats);
                    }
                    _ => break,
                }
            }
            peak
        });
        Self { stop, handle }
    }

    /// Stop sampling and return the peaks
    pub fn stop(self) -> PeakUsage {
        let _ = self.stop.send(());
        let peak = self.handle.join().unwrap_or_default();
        if peak.samples > 0 {
            info!(
                "Peak usage: {} MiB, {} processes",
                peak.memory_bytes / (1024 * 1024),
                peak.process_count
            );
        }
        peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_samples_until_stopped() {
        let monitor = Monitor::start_with_interval(
            "test".to_string(),
            StatsSource::None,
            Duration::from_millis(10),
        );
        std::thread::sleep(Duration::from_millis(60));
        let peak = monitor.stop();
        assert!(peak.samples >= 1);
        assert_eq!(peak.memory_bytes, 0);
    }

    #[test]
    fn test_peak_record() {
        let mut peak = PeakUsage::default();
        peak.record(&ResourceStats {
            memory_bytes: 10,
            cpu_time_us: 5,
            process_count: 3,
        });
        peak.record(&ResourceStats {
            memory_bytes: 4,
            cpu_time_us: 9,
            process_count: 1,
        });
        assert_eq!(peak.memory_bytes, 10);
        assert_eq!(peak.process_count, 3);
        assert_eq!(peak.cpu_time_us, 9);
        assert_eq!(peak.samples, 2);
    }
}
