//! Health reporting for the HTTP surface
//!
//! [`HealthMonitor`] derives service health from the global metrics plus any
//! named checks registered at runtime. The `/health` route in
//! [`crate::server`] serializes its [`HealthStatus`].

use crate::observability::metrics::{metrics, MetricsSnapshot};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Seconds without a finished run, while runs are in flight, before task
/// processing counts as stale
const TASK_STALENESS_THRESHOLD_SECONDS: u64 = 300;

/// Minimum LLM calls before the failure ratio is judged
const LLM_MIN_SAMPLE: u64 = 10;

pub struct HealthMonitor {
    service_id: String,
    additional_checks: RwLock<HashMap<String, HealthCheck>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    fn healthy(message: impl Into<String>, now: u64) -> Self {
        Self {
            status: "healthy".to_string(),
            message: Some(message.into()),
            last_check: now,
        }
    }

    fn with_status(status: &str, message: impl Into<String>, now: u64) -> Self {
        Self {
            status: status.to_string(),
            message: Some(message.into()),
            last_check: now,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub service_id: String,
    pub uptime_seconds: u64,
    pub checks: HashMap<String, HealthCheck>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

impl HealthMonitor {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            additional_checks: RwLock::new(HashMap::new()),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Add custom health check
    pub async fn add_health_check(&self, name: String, check: HealthCheck) {
        self.additional_checks.write().await.insert(name, check);
    }

    pub async fn remove_health_check(&self, name: &str) {
        self.additional_checks.write().await.remove(name);
    }

    pub async fn status(&self) -> HealthStatus {
        let now = current_timestamp();
        let snapshot = metrics().get_metrics();

        let mut checks = HashMap::new();
        checks.insert(
            "task_processing".to_string(),
            check_task_processing(&snapshot, now),
        );
        checks.insert("llm".to_string(), check_llm(&snapshot, now));

        for (name, check) in self.additional_checks.read().await.iter() {
            checks.insert(name.clone(), check.clone());
        }

        let overall = if checks.values().all(|c| c.status == "healthy") {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall.to_string(),
            timestamp: now,
            service_id: self.service_id.clone(),
            uptime_seconds: snapshot.uptime_seconds,
            checks,
        }
    }
}

fn check_task_processing(snapshot: &MetricsSnapshot, now: u64) -> HealthCheck {
    let tasks = &snapshot.tasks;

    if tasks.running == 0 {
        return HealthCheck::healthy("No runs in flight", now);
    }

    // Measure from the last finish, or from startup if nothing finished yet
    let reference = if tasks.last_finished == 0 {
        now.saturating_sub(snapshot.uptime_seconds)
    } else {
        tasks.last_finished
    };
    let idle = now.saturating_sub(reference);

    if idle > TASK_STALENESS_THRESHOLD_SECONDS {
        HealthCheck::with_status(
            "stale",
            format!(
                "{} runs in flight, none finished for {idle} seconds",
                tasks.running
            ),
            now,
        )
    } else {
        HealthCheck::healthy("Recent task activity", now)
    }
}

fn check_llm(snapshot: &MetricsSnapshot, now: u64) -> HealthCheck {
    let llm = &snapshot.llm;
    if llm.calls < LLM_MIN_SAMPLE {
        return HealthCheck::healthy("Not enough LLM traffic to judge", now);
    }

    let failure_rate = llm.failures as f64 / llm.calls as f64;
    if failure_rate > 0.5 {
        HealthCheck::with_status(
            "degraded",
            format!("{:.0}% of LLM calls failing", failure_rate * 100.0),
            now,
        )
    } else {
        HealthCheck::healthy("LLM calls succeeding", now)
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
