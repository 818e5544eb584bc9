use std::time::Instant;

use crate::registry::ProgressEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressValue {
    Percent(u8),
    /// No known total; rendered as an animated indicator.
    Indeterminate,
}

/// Receives progress for exactly one task.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub value: ProgressValue,
    pub loaded: u64,
    pub total: Option<u64>,
    pub elapsed_secs: u64,
    pub bytes_per_sec: u64,
    pub message: String,
}

impl ProgressSnapshot {
    pub fn into_event(self) -> ProgressEvent {
        ProgressEvent::Progress {
            value: self.value,
            message: self.message,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressMeter {
    started: Instant,
}

impl ProgressMeter {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn update(&self, loaded: u64, total: Option<u64>) -> ProgressSnapshot {
        self.snapshot_at(loaded, total, Instant::now())
    }

    fn snapshot_at(&self, loaded: u64, total: Option<u64>, now: Instant) -> ProgressSnapshot {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        let bytes_per_sec = if elapsed > 0.0 {
            (loaded as f64 / elapsed).floor() as u64
        } else {
            loaded
        };
        let elapsed_secs = elapsed.floor() as u64;
        match total.filter(|t| *t > 0) {
            Some(total) => {
                let percent = (u128::from(loaded) * 100 / u128::from(total)).min(100) as u8;
                ProgressSnapshot {
                    value: ProgressValue::Percent(percent),
                    loaded,
                    total: Some(total),
                    elapsed_secs,
                    bytes_per_sec,
                    message: format!("{percent}% | {elapsed_secs} sec | {bytes_per_sec} bytes/sec"),
                }
            }
            None => ProgressSnapshot {
                value: ProgressValue::Indeterminate,
                loaded,
                total: None,
                elapsed_secs,
                bytes_per_sec,
                message: format!("{loaded} bytes | {elapsed_secs} sec | {bytes_per_sec} bytes/sec"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn percent_is_floored_and_throughput_uses_elapsed() {
        let meter = ProgressMeter::start();
        let now = meter.started + Duration::from_secs(3);
        let snap = meter.snapshot_at(3_600_000 * 42 / 100, Some(3_600_000), now);
        assert_eq!(snap.value, ProgressValue::Percent(42));
        assert_eq!(snap.elapsed_secs, 3);
        assert_eq!(snap.bytes_per_sec, 504_000);
        assert_eq!(snap.message, "42% | 3 sec | 504000 bytes/sec");

        let snap = meter.snapshot_at(999, Some(1000), now);
        assert_eq!(snap.value, ProgressValue::Percent(99));
    }

    #[test]
    fn unknown_total_is_indeterminate() {
        let meter = ProgressMeter::start();
        let now = meter.started + Duration::from_secs(2);
        let snap = meter.snapshot_at(10, None, now);
        assert_eq!(snap.value, ProgressValue::Indeterminate);
        assert_eq!(snap.message, "10 bytes | 2 sec | 5 bytes/sec");
        assert_eq!(meter.snapshot_at(10, Some(0), now).value, ProgressValue::Indeterminate);
    }

    #[test]
    fn overshoot_is_capped() {
        let meter = ProgressMeter::start();
        let snap = meter.snapshot_at(20, Some(10), meter.started);
        assert_eq!(snap.value, ProgressValue::Percent(100));
        assert_eq!(snap.bytes_per_sec, 20);
    }
}
