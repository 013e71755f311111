//! Wall-clock/CPU-time accounting for phase-level progress logging.
//!
//! Grounded on the teacher's `TimingContext` (minimap2-style timing), with
//! its commented-out logging turned into real `log::info!` calls instead of
//! being discarded.

use std::time::Instant;

pub struct TimingReport {
    start_time: Instant,
    start_cpu: f64,
}

impl Default for TimingReport {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingReport {
    pub fn new() -> Self {
        TimingReport {
            start_time: Instant::now(),
            start_cpu: Self::cpu_time(),
        }
    }

    fn cpu_time() -> f64 {
        unsafe {
            let mut usage: libc::rusage = std::mem::zeroed();
            libc::getrusage(libc::RUSAGE_SELF, &mut usage);
            let user = usage.ru_utime.tv_sec as f64 + usage.ru_utime.tv_usec as f64 / 1_000_000.0;
            let system = usage.ru_stime.tv_sec as f64 + usage.ru_stime.tv_usec as f64 / 1_000_000.0;
            user + system
        }
    }

    /// (elapsed wall-clock seconds, CPU-time / wall-clock ratio)
    pub fn stats(&self) -> (f64, f64) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let cpu_used = Self::cpu_time() - self.start_cpu;
        let cpu_ratio = if elapsed > 0.0 { cpu_used / elapsed } else { 0.0 };
        (elapsed, cpu_ratio)
    }

    /// Log a phase transition with timing so far, at `info` level.
    pub fn log_phase(&self, phase: &str, message: &str) {
        let (elapsed, cpu_ratio) = self.stats();
        log::info!("[{phase}] {message} (elapsed {elapsed:.2}s, {cpu_ratio:.2}x CPU)");
    }
}
