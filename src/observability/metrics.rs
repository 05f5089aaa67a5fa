//! Thread-safe metrics collection system
//!
//! Atomic counters and mutex-protected collections tracking task runs,
//! per-stage execution, LLM traffic and progress fan-out.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_TIMING_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Task lifecycle (atomic for high frequency)
    tasks_submitted: AtomicU64,
    tasks_running: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_cancelled: AtomicU64,
    max_concurrent_tasks: AtomicU64,
    last_task_finished: AtomicU64,

    // LLM traffic
    llm_calls: AtomicU64,
    llm_failures: AtomicU64,
    llm_retries: AtomicU64,

    // Progress fan-out
    progress_published: AtomicU64,
    progress_dropped: AtomicU64,

    // Run durations in milliseconds
    run_times: Mutex<Vec<u64>>,

    stage_stats: Mutex<HashMap<String, StageExecutionStats>>,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_running: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            max_concurrent_tasks: AtomicU64::new(0),
            last_task_finished: AtomicU64::new(0),
            llm_calls: AtomicU64::new(0),
            llm_failures: AtomicU64::new(0),
            llm_retries: AtomicU64::new(0),
            progress_published: AtomicU64::new(0),
            progress_dropped: AtomicU64::new(0),
            run_times: Mutex::new(Vec::new()),
            stage_stats: Mutex::new(HashMap::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Task lifecycle
    pub fn task_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_started(&self) {
        let running = self.tasks_running.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_concurrent_tasks
            .fetch_max(running, Ordering::Relaxed);
    }

    pub fn task_completed(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        self.task_finished(duration);
    }

    pub fn task_failed(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.task_finished(duration);
    }

    /// Cancelled runs also count as failed; this counter tells them apart
    pub fn task_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    fn task_finished(&self, duration: Duration) {
        // Saturate so a stray finish never wraps the gauge
        let _ = self
            .tasks_running
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        self.last_task_finished
            .store(current_timestamp(), Ordering::Relaxed);
        Self::push_sample(&self.run_times, duration);
    }

    fn push_sample(samples: &Mutex<Vec<u64>>, duration: Duration) {
        if let Ok(mut times) = samples.lock() {
            times.push(duration.as_millis() as u64);
            if times.len() > MAX_TIMING_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Stage execution
    pub fn stage_executed(&self, stage: &str, duration: Duration, success: bool) {
        if let Ok(mut stats) = self.stage_stats.lock() {
            let entry = stats
                .entry(stage.to_string())
                .or_insert_with(|| StageExecutionStats::new(stage));
            entry.executions += 1;
            entry.last_execution = current_timestamp();
            entry.execution_times.push(duration.as_millis() as u64);
            if entry.execution_times.len() > MAX_TIMING_SAMPLES {
                entry.execution_times.remove(0);
            }
            if !success {
                entry.failures += 1;
            }
        }
    }

    // LLM traffic
    pub fn llm_call(&self, success: bool) {
        self.llm_calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.llm_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn llm_retry(&self) {
        self.llm_retries.fetch_add(1, Ordering::Relaxed);
    }

    // Progress fan-out
    pub fn progress_published(&self) {
        self.progress_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn progress_dropped(&self) {
        self.progress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.tasks_submitted,
            &self.tasks_running,
            &self.tasks_completed,
            &self.tasks_failed,
            &self.tasks_cancelled,
            &self.max_concurrent_tasks,
            &self.last_task_finished,
            &self.llm_calls,
            &self.llm_failures,
            &self.llm_retries,
            &self.progress_published,
            &self.progress_dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.run_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.stage_stats.lock() {
            stats.clear();
        }
    }

    fn run_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.run_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    fn stage_snapshots(&self) -> HashMap<String, StageStatsSnapshot> {
        self.stage_stats
            .lock()
            .map(|stats| {
                stats
                    .iter()
                    .map(|(name, s)| (name.clone(), s.snapshot()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.run_time_statistics();

        MetricsSnapshot {
            tasks: TaskMetrics {
                submitted: self.tasks_submitted.load(Ordering::Relaxed),
                running: self.tasks_running.load(Ordering::Relaxed),
                completed: self.tasks_completed.load(Ordering::Relaxed),
                failed: self.tasks_failed.load(Ordering::Relaxed),
                cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
                max_concurrent: self.max_concurrent_tasks.load(Ordering::Relaxed),
                last_finished: self.last_task_finished.load(Ordering::Relaxed),
                avg_run_time_ms: avg,
                run_time_p50_ms: p50,
                run_time_p95_ms: p95,
                run_time_p99_ms: p99,
            },
            stages: self.stage_snapshots(),
            llm: LlmMetrics {
                calls: self.llm_calls.load(Ordering::Relaxed),
                failures: self.llm_failures.load(Ordering::Relaxed),
                retries: self.llm_retries.load(Ordering::Relaxed),
            },
            progress: ProgressMetrics {
                published: self.progress_published.load(Ordering::Relaxed),
                dropped: self.progress_dropped.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct StageExecutionStats {
    name: String,
    executions: u64,
    failures: u64,
    execution_times: Vec<u64>,
    last_execution: u64,
}

impl StageExecutionStats {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            executions: 0,
            failures: 0,
            execution_times: Vec::new(),
            last_execution: 0,
        }
    }

    fn snapshot(&self) -> StageStatsSnapshot {
        let avg_execution_time_ms = if self.execution_times.is_empty() {
            0.0
        } else {
            self.execution_times.iter().sum::<u64>() as f64 / self.execution_times.len() as f64
        };
        let success_rate = if self.executions == 0 {
            0.0
        } else {
            (self.executions - self.failures) as f64 / self.executions as f64
        };

        StageStatsSnapshot {
            name: self.name.clone(),
            executions: self.executions,
            failures: self.failures,
            avg_execution_time_ms,
            last_execution: self.last_execution,
            success_rate,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub tasks: TaskMetrics,
    pub stages: HashMap<String, StageStatsSnapshot>,
    pub llm: LlmMetrics,
    pub progress: ProgressMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct TaskMetrics {
    pub submitted: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub max_concurrent: u64,
    /// Unix seconds of the most recent terminal run, 0 if none yet
    pub last_finished: u64,
    pub avg_run_time_ms: f64,
    pub run_time_p50_ms: f64,
    pub run_time_p95_ms: f64,
    pub run_time_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct StageStatsSnapshot {
    pub name: String,
    pub executions: u64,
    pub failures: u64,
    pub avg_execution_time_ms: f64,
    pub last_execution: u64,
    pub success_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct LlmMetrics {
    pub calls: u64,
    pub failures: u64,
    pub retries: u64,
}

#[derive(Debug, Serialize)]
pub struct ProgressMetrics {
    pub published: u64,
    pub dropped: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}
