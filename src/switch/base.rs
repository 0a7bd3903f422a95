//! Per-attempt switch state, audit rows and name-service release

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::AuditPolicy;
use crate::coordinator::{AuditSink, CoordinatorError, SwitchLogRow};

use super::name_service::{
    delete_name_service, restore_name_service, single_address_domains, BindEntry,
    NameServiceError, NameServiceProvider, Released,
};
use super::SwitchError;

/// What the coordination layer hands over when it decides an instance must be switched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchRequest {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub idc: String,
    /// Detection status that triggered the switch
    pub status: String,
    #[serde(default)]
    pub app: String,
    pub cluster_type: String,
    /// Machine type of the failed instance (proxy, spider, tdbctl, ...)
    pub meta_type: String,
    pub check_id: u64,
    pub cluster: String,
    #[serde(default)]
    pub binds: BindEntry,
}

/// Typed per-attempt side-table
#[derive(Debug, Clone, Default)]
pub struct SwitchExtra {
    /// Name-service registrations pointing at the failed instance
    pub binds: BindEntry,
    /// Registrations released by this attempt, restored on rollback
    pub released: Vec<Released>,
    /// Route-table name of the failed node
    pub server_name: Option<String>,
    /// Control node promoted by this attempt
    pub new_primary: Option<String>,
    /// Non-fatal problems hit along the way, surfaced in the outcome
    pub warnings: Vec<String>,
}

/// State and behavior shared by every concrete switch
pub struct BaseSwitch {
    pub ip: String,
    pub port: u16,
    pub idc: String,
    pub status: String,
    pub app: String,
    pub cluster_type: String,
    pub meta_type: String,
    pub check_id: u64,
    pub switch_uid: String,
    pub cluster: String,
    pub extra: SwitchExtra,
    pub audit_policy: AuditPolicy,
    audit: Arc<dyn AuditSink>,
}

impl BaseSwitch {
    pub fn new(request: SwitchRequest, audit: Arc<dyn AuditSink>, audit_policy: AuditPolicy) -> Self {
        Self {
            ip: request.ip,
            port: request.port,
            idc: request.idc,
            status: request.status,
            app: request.app,
            cluster_type: request.cluster_type,
            meta_type: request.meta_type,
            check_id: request.check_id,
            switch_uid: uuid::Uuid::new_v4().to_string(),
            cluster: request.cluster,
            extra: SwitchExtra {
                binds: request.binds,
                ..SwitchExtra::default()
            },
            audit_policy,
            audit,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn show_info(&self) -> String {
        format!(
            "{} {} cluster={} app={} idc={} status={}",
            self.meta_type,
            self.addr(),
            self.cluster,
            self.app,
            self.idc,
            self.status
        )
    }

    fn log_row(&self, result: &str, comment: &str) -> SwitchLogRow {
        SwitchLogRow {
            switch_uid: self.switch_uid.clone(),
            check_id: self.check_id,
            ip: self.ip.clone(),
            port: self.port,
            cluster: self.cluster.clone(),
            app: self.app.clone(),
            result: result.to_string(),
            comment: comment.to_string(),
            at: Utc::now(),
        }
    }

    /// Write a switch-log row, surfacing sink failures
    pub async fn try_report_logs(&self, result: &str, comment: &str) -> Result<(), CoordinatorError> {
        self.audit.record_switch_log(&self.log_row(result, comment)).await
    }

    /// Best-effort switch-log write. Returns whether the row was stored.
    pub async fn report_logs(&self, result: &str, comment: &str) -> bool {
        match self.try_report_logs(result, comment).await {
            Ok(()) => true,
            Err(e) => {
                warn!(switch_uid = %self.switch_uid, addr = %self.addr(), error = %e, "Failed to write switch log");
                false
            }
        }
    }

    /// Refuse if any domain would lose its last address, then release every binding.
    ///
    /// A partial release is not an error: what was released stays released,
    /// the failures are logged and kept as warnings, and the switch goes on.
    pub async fn release_name_service(
        &mut self,
        providers: &[Arc<dyn NameServiceProvider>],
        call_timeout: Duration,
    ) -> Result<(), SwitchError> {
        if self.extra.binds.is_empty() {
            return Ok(());
        }

        let domains = single_address_domains(&self.extra.binds, providers, call_timeout).await?;
        if !domains.is_empty() {
            let err = SwitchError::SingleAddressUnderDomain {
                addr: self.addr(),
                domains,
            };
            self.report_logs("failed", &err.to_string()).await;
            return Err(err);
        }

        match delete_name_service(&self.extra.binds, providers, call_timeout).await {
            Ok(released) => {
                self.report_logs("info", &format!("released {} name-service bindings", released.len()))
                    .await;
                self.extra.released = released;
                Ok(())
            }
            Err(NameServiceError::Partial { released, failures }) => {
                let comment = format!(
                    "released {} name-service bindings, {} failed: {}",
                    released.len(),
                    failures.len(),
                    failures.join("; ")
                );
                warn!(switch_uid = %self.switch_uid, addr = %self.addr(), failures = ?failures, "Name-service release incomplete");
                self.report_logs("warning", &comment).await;
                self.extra.released = released;
                self.extra.warnings.extend(failures);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-register everything this attempt released
    pub async fn restore_released(
        &mut self,
        providers: &[Arc<dyn NameServiceProvider>],
        call_timeout: Duration,
    ) -> Result<(), SwitchError> {
        let released = std::mem::take(&mut self.extra.released);
        let failures = restore_name_service(&released, providers, call_timeout).await;
        self.report_logs(
            "info",
            &format!("restored {} of {} name-service bindings", released.len() - failures.len(), released.len()),
        )
        .await;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SwitchError::Rollback(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::{Binding, Provider};
    use crate::testing::{switch_request, FakeAuditSink, TestContext};

    #[tokio::test]
    async fn test_report_logs_swallows_sink_failure() {
        let audit = Arc::new(FakeAuditSink::new());
        let base = BaseSwitch::new(switch_request("tendbha", "proxy"), audit.clone(), AuditPolicy::BestEffort);

        assert!(base.report_logs("info", "first").await);
        audit.set_failing(true);
        assert!(!base.report_logs("info", "second").await);
        assert!(base.try_report_logs("info", "third").await.is_err());

        let rows = audit.switch_logs();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].switch_uid, base.switch_uid);
        assert_eq!(rows[0].comment, "first");
    }

    #[tokio::test]
    async fn test_partial_release_keeps_what_was_released() {
        let ctx = TestContext::new();
        ctx.clb.fail_calls();
        let mut request = switch_request("tendbha", "proxy");
        request.binds.dns = vec![Binding::new("db.example.com", "10.0.0.1", 3306)];
        request.binds.clb = vec![Binding::new("lb-1", "10.0.0.1", 3306)];
        let mut base = BaseSwitch::new(request, ctx.audit.clone(), AuditPolicy::BestEffort);

        let providers = ctx.context().name_services.clone();
        base.release_name_service(&providers, Duration::from_millis(200))
            .await
            .unwrap();

        let released: Vec<_> = base.extra.released.iter().map(|r| r.provider).collect();
        assert_eq!(released, vec![Provider::Dns]);
        assert_eq!(base.extra.warnings.len(), 1);
        assert!(ctx.dns.registered().is_empty());
        assert!(ctx.audit.switch_logs().iter().any(|r| r.result == "warning"));
    }

    #[test]
    fn test_each_attempt_gets_its_own_uid() {
        let audit = Arc::new(FakeAuditSink::new());
        let a = BaseSwitch::new(switch_request("tendbha", "proxy"), audit.clone(), AuditPolicy::BestEffort);
        let b = BaseSwitch::new(switch_request("tendbha", "proxy"), audit, AuditPolicy::BestEffort);
        assert_ne!(a.switch_uid, b.switch_uid);
        assert!(a.show_info().contains("10.0.0.1:3306"));
    }
}
