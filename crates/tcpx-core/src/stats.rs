//! Backend and transport statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared between the poller and readers on other threads.
/// Incremented by whoever observes the event; read as a snapshot.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub sends: AtomicU64,
    pub receives: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub failed_sends: AtomicU64,
    pub failed_receives: AtomicU64,
    pub batch_submissions: AtomicU64,
    pub total_syscalls: AtomicU64,
    pub queue_overflows: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let sends = self.sends.load(Ordering::Relaxed);
        let receives = self.receives.load(Ordering::Relaxed);
        let batch_submissions = self.batch_submissions.load(Ordering::Relaxed);
        let total_syscalls = self.total_syscalls.load(Ordering::Relaxed);
        let total_ops = sends + receives;
        StatsSnapshot {
            sends,
            receives,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            failed_sends: self.failed_sends.load(Ordering::Relaxed),
            failed_receives: self.failed_receives.load(Ordering::Relaxed),
            batch_submissions,
            total_syscalls,
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            avg_batch_size: ratio(total_ops, batch_submissions),
            syscall_reduction: ratio(total_ops, total_syscalls),
        }
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Point-in-time view of the counters plus the derived ratios.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub sends: u64,
    pub receives: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub failed_sends: u64,
    pub failed_receives: u64,
    pub batch_submissions: u64,
    pub total_syscalls: u64,
    pub queue_overflows: u64,
    /// total ops / batch submissions.
    pub avg_batch_size: f64,
    /// total ops / total syscalls.
    pub syscall_reduction: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ratios() {
        let s = EngineStats::new();
        EngineStats::add(&s.sends, 6);
        EngineStats::add(&s.receives, 2);
        EngineStats::add(&s.batch_submissions, 2);
        EngineStats::add(&s.total_syscalls, 4);
        let snap = s.snapshot();
        assert_eq!(snap.avg_batch_size, 4.0);
        assert_eq!(snap.syscall_reduction, 2.0);
    }

    #[test]
    fn zero_denominators_do_not_divide() {
        let snap = EngineStats::new().snapshot();
        assert_eq!(snap.avg_batch_size, 0.0);
        assert_eq!(snap.syscall_reduction, 0.0);
    }
}
