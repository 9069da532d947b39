//! Quota utilization alerts.
//!
//! Each threshold fires at most once per UTC day. Utilization is measured
//! against the most consumed quota (daily tokens or monthly budget).

use crate::persist;
use crate::rate_limiter::QuotaUsage;
use callgate_config::{AlertConfig, AlertSeverity};
use callgate_core::{GateError, GateResult, KeyValueStore, QuotaKind, SharedClock};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

const LAST_TRIGGERED_KEY: &str = "alerts:last_triggered";
const DEFAULT_HISTORY: usize = 100;

/// A fired alert
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    /// Threshold that fired
    pub percent: f64,
    /// Quota the utilization was measured against
    pub kind: QuotaKind,
    /// Consumption in the current period
    pub used: f64,
    /// Quota cap
    pub limit: f64,
    /// Consumption as a percentage of the cap
    pub utilization: f64,
    /// Severity
    pub severity: AlertSeverity,
    /// Message
    pub message: String,
    /// When it fired
    pub fired_at: DateTime<Utc>,
}

/// Receives fired alerts
pub type AlertCallback = Arc<dyn Fn(&AlertEvent) + Send + Sync>;

struct Threshold {
    config: AlertConfig,
    callback: Option<AlertCallback>,
    last_triggered_on: Option<NaiveDate>,
}

/// Evaluates thresholds and keeps a bounded alert history
pub struct AlertManager {
    clock: SharedClock,
    thresholds: Mutex<Vec<Threshold>>,
    history: Mutex<VecDeque<AlertEvent>>,
    history_limit: usize,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("thresholds", &self.thresholds.lock().len())
            .field("history", &self.history.lock().len())
            .finish_non_exhaustive()
    }
}

impl AlertManager {
    /// Create a manager with the given thresholds and no callbacks
    #[must_use]
    pub fn new(configs: &[AlertConfig], clock: SharedClock) -> Self {
        let mut thresholds: Vec<Threshold> = configs
            .iter()
            .map(|config| Threshold {
                config: config.clone(),
                callback: None,
                last_triggered_on: None,
            })
            .collect();
        thresholds.sort_by(|a, b| a.config.percent.total_cmp(&b.config.percent));

        Self {
            clock,
            thresholds: Mutex::new(thresholds),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY,
            store: None,
        }
    }

    /// Persist trigger dates in `store`
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a threshold
    ///
    /// # Errors
    /// `InvalidRequest` for a non-positive or non-finite percentage
    pub fn add_alert(&self, config: AlertConfig, callback: Option<AlertCallback>) -> GateResult<()> {
        if !config.percent.is_finite() || config.percent <= 0.0 {
            return Err(GateError::invalid_request(format!(
                "alert percent must be positive, got {}",
                config.percent
            )));
        }

        let mut thresholds = self.thresholds.lock();
        info!(percent = config.percent, severity = config.severity.as_str(), "Alert threshold registered");
        thresholds.push(Threshold {
            config,
            callback,
            last_triggered_on: None,
        });
        thresholds.sort_by(|a, b| a.config.percent.total_cmp(&b.config.percent));
        Ok(())
    }

    /// Registered thresholds, lowest first
    #[must_use]
    pub fn thresholds(&self) -> Vec<AlertConfig> {
        self.thresholds.lock().iter().map(|t| t.config.clone()).collect()
    }

    /// Fire every threshold the current utilization has crossed and that has
    /// not fired today. Returns the fired events.
    pub fn evaluate(&self, usage: &QuotaUsage) -> Vec<AlertEvent> {
        let Some((kind, utilization)) = usage.max_percent() else {
            return Vec::new();
        };
        let (used, limit) = usage.used_and_limit(kind);
        let limit = limit.unwrap_or_default();

        let now = self.clock.wall();
        let today = now.date_naive();

        let fired: Vec<(AlertEvent, Option<AlertCallback>)> = {
            let mut thresholds = self.thresholds.lock();
            thresholds
                .iter_mut()
                .filter(|t| utilization >= t.config.percent && t.last_triggered_on != Some(today))
                .map(|t| {
                    t.last_triggered_on = Some(today);
                    let event = AlertEvent {
                        percent: t.config.percent,
                        kind,
                        used,
                        limit,
                        utilization,
                        severity: t.config.severity,
                        message: t.config.message_text(),
                        fired_at: now,
                    };
                    (event, t.callback.clone())
                })
                .collect()
        };

        if fired.is_empty() {
            return Vec::new();
        }

        {
            let mut history = self.history.lock();
            for (event, _) in &fired {
                history.push_back(event.clone());
            }
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }

        fired
            .into_iter()
            .map(|(event, callback)| {
                match event.severity {
                    AlertSeverity::Info => info!(
                        percent = event.percent,
                        quota = %event.kind,
                        utilization = event.utilization,
                        "{}", event.message
                    ),
                    AlertSeverity::Warning | AlertSeverity::Critical => warn!(
                        percent = event.percent,
                        quota = %event.kind,
                        utilization = event.utilization,
                        severity = event.severity.as_str(),
                        "{}", event.message
                    ),
                }
                if let Some(callback) = callback {
                    callback(&event);
                }
                event
            })
            .collect()
    }

    /// Most recent alerts, newest first
    #[must_use]
    pub fn recent_alerts(&self, limit: usize) -> Vec<AlertEvent> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Save trigger dates
    ///
    /// # Errors
    /// Returns `Storage` when the write fails
    pub async fn persist(&self) -> GateResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let dates: Vec<(f64, NaiveDate)> = self
            .thresholds
            .lock()
            .iter()
            .filter_map(|t| t.last_triggered_on.map(|d| (t.config.percent, d)))
            .collect();
        let json = serde_json::to_string(&dates)
            .map_err(|e| GateError::internal(format!("alert state encoding failed: {e}")))?;
        persist::kv_set(store, LAST_TRIGGERED_KEY, json).await?;
        debug!(thresholds = dates.len(), "Alert trigger dates persisted");
        Ok(())
    }

    /// Load trigger dates so a restart does not re-fire today's alerts
    ///
    /// # Errors
    /// Returns `Storage` when the store cannot be read
    pub async fn restore(&self) -> GateResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(raw) = persist::kv_get(store, LAST_TRIGGERED_KEY).await? else {
            return Ok(());
        };
        let dates: Vec<(f64, NaiveDate)> = match serde_json::from_str(&raw) {
            Ok(dates) => dates,
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable alert state");
                return Ok(());
            }
        };

        let mut thresholds = self.thresholds.lock();
        for (percent, date) in dates {
            for threshold in thresholds.iter_mut().filter(|t| t.config.percent == percent) {
                threshold.last_triggered_on = Some(date);
            }
        }
        Ok(())
    }
}
