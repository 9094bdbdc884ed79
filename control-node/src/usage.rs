//! Interval usage derived from two cumulative port-counter snapshots.
//!
//! Counters are monotone except across a device reboot. On a negative delta
//! the end value is taken as the interval delta; the error is bounded by one
//! interval, which beats dropping the sample.

use chrono::{DateTime, Local};
use std::collections::HashMap;

/// Cumulative byte counters of one port since device boot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl PortCounters {
    pub fn total(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }
}

/// Snapshot of every device's port counters at one instant
#[derive(Debug, Clone)]
pub struct PortCounterSnapshot {
    pub taken_at: DateTime<Local>,
    /// device id -> port -> counters
    pub devices: HashMap<String, HashMap<u32, PortCounters>>,
}

/// Bytes moved per (device, port) during exactly one collection interval
#[derive(Debug, Clone, Default)]
pub struct IntervalUsage {
    /// device id -> port -> total bytes in interval
    pub bytes: HashMap<String, HashMap<u32, u64>>,
}

fn delta_with_rollover(start: u64, end: u64) -> u64 {
    if end >= start {
        end - start
    } else {
        end
    }
}

impl IntervalUsage {
    /// Elementwise `end - start` with the rollover guard. A port missing from
    /// either snapshot yields no entry, marking paths over it invalid for the
    /// interval.
    pub fn between(start: &PortCounterSnapshot, end: &PortCounterSnapshot) -> Self {
        let mut bytes: HashMap<String, HashMap<u32, u64>> = HashMap::new();

        for (device, end_ports) in &end.devices {
            let Some(start_ports) = start.devices.get(device) else {
                continue;
            };
            for (port, end_counters) in end_ports {
                let Some(start_counters) = start_ports.get(port) else {
                    continue;
                };
                let sent = delta_with_rollover(start_counters.bytes_sent, end_counters.bytes_sent);
                let received = delta_with_rollover(
                    start_counters.bytes_received,
                    end_counters.bytes_received,
                );
                bytes
                    .entry(device.clone())
                    .or_default()
                    .insert(*port, sent.saturating_add(received));
            }
        }

        Self { bytes }
    }

    pub fn port_bytes(&self, device: &str, port: u32) -> Option<u64> {
        self.bytes.get(device).and_then(|ports| ports.get(&port)).copied()
    }

    /// Total bytes observed across every port this interval
    pub fn total_bytes(&self) -> u64 {
        self.bytes
            .values()
            .flat_map(|ports| ports.values())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(&str, u32, u64, u64)]) -> PortCounterSnapshot {
        let mut devices: HashMap<String, HashMap<u32, PortCounters>> = HashMap::new();
        for (device, port, sent, received) in entries {
            devices.entry(device.to_string()).or_default().insert(
                *port,
                PortCounters {
                    bytes_sent: *sent,
                    bytes_received: *received,
                },
            );
        }
        PortCounterSnapshot {
            taken_at: Local::now(),
            devices,
        }
    }

    #[test]
    fn test_plain_delta() {
        let a = snapshot(&[("of:1", 1, 1_000, 500)]);
        let b = snapshot(&[("of:1", 1, 1_600, 900)]);
        let usage = IntervalUsage::between(&a, &b);
        assert_eq!(usage.port_bytes("of:1", 1), Some(1_000));
    }

    #[test]
    fn test_rollover_uses_end_value() {
        // Device rebooted between snapshots: counters restarted from zero.
        let a = snapshot(&[("of:1", 1, 5_000_000, 0)]);
        let b = snapshot(&[("of:1", 1, 1_234, 0)]);
        let usage = IntervalUsage::between(&a, &b);
        assert_eq!(usage.port_bytes("of:1", 1), Some(1_234));
    }

    #[test]
    fn test_missing_port_yields_no_entry() {
        let a = snapshot(&[("of:1", 1, 100, 0)]);
        let b = snapshot(&[("of:1", 2, 300, 0)]);
        let usage = IntervalUsage::between(&a, &b);
        assert_eq!(usage.port_bytes("of:1", 1), None);
        assert_eq!(usage.port_bytes("of:1", 2), None);
    }

    #[test]
    fn test_total_bytes_sums_all_ports() {
        let a = snapshot(&[("of:1", 1, 0, 0), ("of:2", 4, 10, 10)]);
        let b = snapshot(&[("of:1", 1, 300, 200), ("of:2", 4, 60, 30)]);
        let usage = IntervalUsage::between(&a, &b);
        assert_eq!(usage.total_bytes(), 500 + 70);
    }
}
