// Periodic health probe of storage, gateway and the ticket backlog
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::notify::{Notification, NotificationKind};
use crate::state::Services;

const HISTORY_LEN: usize = 100;
const URGENT_WARN: usize = 10;
const OPEN_WARN: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub ok: bool,
    pub detail: String,
}

impl ComponentStatus {
    fn from_result<E: std::fmt::Display>(result: Result<String, E>) -> Self {
        match result {
            Ok(detail) => Self { ok: true, detail },
            Err(e) => Self {
                ok: false,
                detail: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub healthy: bool,
    pub storage: ComponentStatus,
    pub gateway: ComponentStatus,
    pub open_tickets: usize,
    pub urgent_tickets: usize,
    pub warnings: Vec<String>,
}

pub struct HealthChecker {
    services: Arc<Services>,
    history: Mutex<VecDeque<HealthReport>>,
}

impl HealthChecker {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
        }
    }

    /// Run every probe, keep the report and alert admins when unhealthy
    pub async fn check(&self) -> HealthReport {
        let storage = ComponentStatus::from_result(self.probe_storage());
        let gateway = ComponentStatus::from_result(self.services.gateway.probe().await);

        let mut warnings = Vec::new();
        let open_tickets = match self.services.tickets.repository().open_tickets().await {
            Ok(tickets) => tickets.len(),
            Err(e) => {
                warnings.push(format!("Не удалось посчитать открытые обращения: {e}"));
                0
            }
        };
        let urgent_tickets = match self.services.tickets.requires_attention().await {
            Ok(tickets) => tickets.len(),
            Err(e) => {
                warnings.push(format!("Не удалось посчитать срочные обращения: {e}"));
                0
            }
        };
        if urgent_tickets > URGENT_WARN {
            warnings.push(format!("Много срочных обращений: {urgent_tickets}"));
        }
        if open_tickets > OPEN_WARN {
            warnings.push(format!("Много открытых обращений: {open_tickets}"));
        }

        let report = HealthReport {
            checked_at: self.services.clock.now(),
            healthy: storage.ok && gateway.ok,
            storage,
            gateway,
            open_tickets,
            urgent_tickets,
            warnings,
        };

        for warning in &report.warnings {
            tracing::warn!(warning = %warning, "Health warning");
        }
        if !report.healthy {
            tracing::error!(
                storage = %report.storage.detail,
                gateway = %report.gateway.detail,
                "Health check failed"
            );
            self.alert(&report).await;
        }

        self.remember(report.clone());
        report
    }

    fn probe_storage(&self) -> Result<String, String> {
        let conn = self.services.db.get().map_err(|e| e.to_string())?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| "ok".to_string())
            .map_err(|e| e.to_string())
    }

    async fn alert(&self, report: &HealthReport) {
        let mut text = String::from("⚠️ Проблемы с ботом поддержки\n");
        if !report.storage.ok {
            text.push_str(&format!("\n🗄 База данных: {}", report.storage.detail));
        }
        if !report.gateway.ok {
            text.push_str(&format!("\n📡 Telegram: {}", report.gateway.detail));
        }
        let notifier = &self.services.notifier;
        let outcome = notifier
            .notify(
                &Notification::new(NotificationKind::SystemAlert, text),
                &notifier.admin_recipients(),
            )
            .await;
        tracing::debug!(?outcome, "System alert fan-out");
    }

    fn remember(&self, report: HealthReport) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(report);
    }

    pub fn latest(&self) -> Option<HealthReport> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .cloned()
    }

    /// Oldest first
    pub fn history(&self) -> Vec<HealthReport> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
