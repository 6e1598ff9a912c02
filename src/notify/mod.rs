//! Operator-facing alerts.
//!
//! Chat delivery is an external collaborator; in-process the alerts are
//! emitted as structured log events so a log-shipping workflow can pick
//! them up.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

/// Everything the control loop tells the operator about.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum Alert {
    /// End-of-tick rebalance summary.
    RebalanceSummary {
        success_count: u32,
        fail_count: u32,
        total_moved: Decimal,
    },
    /// A per-position top-up preempted the normal schedule.
    EmergencyTopUp {
        symbol: String,
        delta: Decimal,
        margin_rate: Decimal,
    },
    /// Partial closes planned but not executed (dry-run).
    LiquidationPending {
        symbols: Vec<String>,
        gap: Decimal,
    },
    /// Partial closes submitted to the exchange.
    LiquidationExecuted {
        symbol: String,
        close_quantity: Decimal,
        estimated_released: Decimal,
    },
    /// Account equity/margin ratio crossed the warning threshold.
    AccountWarning { rate: Decimal },
    /// A retry budget was exhausted on the REST or streaming side.
    RetryExhausted { scope: String, detail: String },
    /// Streaming reconnects exhausted; continuing on polling only.
    StreamOffline,
}

impl Alert {
    fn severity(&self) -> Severity {
        match self {
            Alert::RebalanceSummary { .. } => Severity::Info,
            Alert::EmergencyTopUp { .. } => Severity::Warning,
            Alert::LiquidationPending { .. } => Severity::Warning,
            Alert::LiquidationExecuted { .. } => Severity::Error,
            Alert::AccountWarning { .. } => Severity::Warning,
            Alert::RetryExhausted { .. } => Severity::Error,
            Alert::StreamOffline => Severity::Error,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Severity {
    Info,
    Warning,
    Error,
}

/// Alert delivery interface.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: &Alert);
}

/// Emits alerts as structured log lines.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, alert: &Alert) {
        let json = serde_json::to_string(alert).unwrap_or_default();
        match alert.severity() {
            Severity::Info => info!(target: "alert", "ALERT: {}", json),
            Severity::Warning => warn!(target: "alert", "ALERT: {}", json),
            Severity::Error => error!(target: "alert", "ALERT: {}", json),
        }
    }
}

/// Collects alerts for assertions in tests.
#[derive(Default)]
pub struct MemoryNotifier {
    pub alerts: std::sync::Mutex<Vec<Alert>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, alert: &Alert) {
        self.alerts.lock().expect("lock poisoned").push(alert.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_memory_notifier_collects() {
        let notifier = MemoryNotifier::new();
        notifier.notify(&Alert::AccountWarning { rate: dec!(120) });
        notifier.notify(&Alert::StreamOffline);

        let alerts = notifier.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0], Alert::AccountWarning { rate: dec!(120) });
    }

    #[test]
    fn test_alert_serializes_with_tag() {
        let alert = Alert::EmergencyTopUp {
            symbol: "BTC".to_string(),
            delta: dec!(1500),
            margin_rate: dec!(1),
        };
        let json = serde_json::to_string(&alert).unwrap();
        assert!(json.contains("\"type\":\"EmergencyTopUp\""));
    }
}
