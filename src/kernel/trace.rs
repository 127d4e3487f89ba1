//! Syscall statistics
//!
//! Per-syscall call and error counters, cheap enough to leave on. Counters
//! are atomics so recording never contends with another syscall.

use super::dispatch::SyscallNr;
use super::error::SyscallError;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one syscall
#[derive(Debug, Default)]
struct Counter {
    calls: AtomicU64,
    errors: AtomicU64,
}

/// Snapshot of one syscall's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallCounter {
    /// Total call count
    pub calls: u64,
    /// Calls that failed
    pub errors: u64,
}

impl SyscallCounter {
    /// Success rate
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            1.0
        } else {
            (self.calls - self.errors) as f64 / self.calls as f64
        }
    }
}

/// Call/error counts for every syscall number
#[derive(Debug)]
pub struct SyscallStats {
    counters: Vec<(SyscallNr, Counter)>,
    unknown: AtomicU64,
}

impl SyscallStats {
    pub fn new() -> Self {
        Self {
            counters: SyscallNr::ALL
                .iter()
                .map(|&nr| (nr, Counter::default()))
                .collect(),
            unknown: AtomicU64::new(0),
        }
    }

    fn counter(&self, nr: SyscallNr) -> Option<&Counter> {
        self.counters.iter().find(|(n, _)| *n == nr).map(|(_, c)| c)
    }

    /// Record one completed call
    pub fn record<T>(&self, nr: SyscallNr, result: &Result<T, SyscallError>) {
        if let Some(counter) = self.counter(nr) {
            counter.calls.fetch_add(1, Ordering::Relaxed);
            if result.is_err() {
                counter.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record a call with an unknown number
    pub fn record_unknown(&self) {
        self.unknown.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, nr: SyscallNr) -> SyscallCounter {
        self.counter(nr)
            .map(|c| SyscallCounter {
                calls: c.calls.load(Ordering::Relaxed),
                errors: c.errors.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    /// Every syscall that has been called at least once
    pub fn snapshot(&self) -> Vec<(SyscallNr, SyscallCounter)> {
        self.counters
            .iter()
            .map(|(nr, _)| (*nr, self.get(*nr)))
            .filter(|(_, c)| c.calls > 0)
            .collect()
    }

    /// Get total syscall count
    pub fn total_calls(&self) -> u64 {
        self.snapshot().iter().map(|(_, c)| c.calls).sum::<u64>()
            + self.unknown.load(Ordering::Relaxed)
    }

    /// Get total errors
    pub fn total_errors(&self) -> u64 {
        self.snapshot().iter().map(|(_, c)| c.errors).sum::<u64>()
            + self.unknown.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for (_, c) in &self.counters {
            c.calls.store(0, Ordering::Relaxed);
            c.errors.store(0, Ordering::Relaxed);
        }
        self.unknown.store(0, Ordering::Relaxed);
    }
}

impl Default for SyscallStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SyscallStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Syscall Stats ===")?;
        for (nr, c) in self.snapshot() {
            writeln!(
                f,
                "  {:<8} calls={:<6} errors={:<6} ok={:.1}%",
                nr,
                c.calls,
                c.errors,
                c.success_rate() * 100.0
            )?;
        }
        write!(
            f,
            "  total: {} calls, {} errors",
            self.total_calls(),
            self.total_errors()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record() {
        let stats = SyscallStats::new();
        stats.record(SyscallNr::Open, &Ok::<_, SyscallError>(3));
        stats.record(SyscallNr::Open, &Err::<i32, _>(SyscallError::NotFound));
        stats.record(SyscallNr::Close, &Ok::<_, SyscallError>(()));

        assert_eq!(
            stats.get(SyscallNr::Open),
            SyscallCounter { calls: 2, errors: 1 }
        );
        assert_eq!(stats.total_calls(), 3);
        assert_eq!(stats.total_errors(), 1);
        assert_eq!(stats.snapshot().len(), 2);
    }

    #[test]
    fn test_unknown_and_reset() {
        let stats = SyscallStats::new();
        stats.record_unknown();
        assert_eq!(stats.total_errors(), 1);

        stats.reset();
        assert_eq!(stats.total_calls(), 0);
    }

    #[test]
    fn test_success_rate() {
        let c = SyscallCounter { calls: 4, errors: 1 };
        assert!((c.success_rate() - 0.75).abs() < 1e-9);
        assert_eq!(SyscallCounter::default().success_rate(), 1.0);
    }

    #[test]
    fn test_display() {
        let stats = SyscallStats::new();
        stats.record(SyscallNr::Fork, &Ok::<_, SyscallError>(()));
        let text = stats.to_string();
        assert!(text.contains("fork"));
        assert!(text.contains("total: 1 calls"));
    }
}
