//! Stage driver for one switch attempt

use tracing::{error, info, warn};

use crate::config::AuditPolicy;
use crate::metrics::metrics;

use super::{DataBaseSwitch, SwitchError};

/// How a switch attempt ended when it did not fail outright
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// Preflight decided there was nothing to do
    Skipped,
    Switched,
    /// Switched, but some stage reported non-fatal problems
    SwitchedWithWarnings(String),
}

/// Drive one attempt: preflight, execute, finalize.
///
/// An execute failure triggers a rollback. A finalize failure does not:
/// the switch already took effect and is reported as such. Warnings left in
/// the side-table, such as a partial name-service release, turn the outcome
/// into [`SwitchOutcome::SwitchedWithWarnings`].
pub async fn run_switch(switch: &mut dyn DataBaseSwitch) -> Result<SwitchOutcome, SwitchError> {
    let info = switch.show_switch_instance_info();
    let base = switch.base();
    info!(switch_uid = %base.switch_uid, instance = %info, "Switch started");

    match base.audit_policy {
        AuditPolicy::Strict => {
            if let Err(e) = base.try_report_logs("begin", &info).await {
                error!(switch_uid = %base.switch_uid, error = %e, "Opening audit row failed, aborting switch");
                return Err(SwitchError::Audit(e.to_string()));
            }
        }
        AuditPolicy::BestEffort => {
            base.report_logs("begin", &info).await;
        }
    }

    match switch.check_switch().await {
        Ok(true) => {
            metrics().record_switch_stage("check", true);
            switch.base().report_logs("info", "precheck passed").await;
        }
        Ok(false) => {
            metrics().record_switch_stage("check", true);
            switch.base().report_logs("skipped", "precheck found nothing to switch").await;
            return Ok(SwitchOutcome::Skipped);
        }
        Err(e) => {
            metrics().record_switch_stage("check", false);
            warn!(switch_uid = %switch.base().switch_uid, error = %e, "Switch precheck failed");
            switch.base().report_logs("failed", &format!("precheck: {}", e)).await;
            return Err(e);
        }
    }

    if let Err(e) = switch.do_switch().await {
        metrics().record_switch_stage("do", false);
        error!(switch_uid = %switch.base().switch_uid, error = %e, "Switch failed, rolling back");
        switch.base().report_logs("failed", &format!("switch: {}", e)).await;

        match switch.rollback().await {
            Ok(()) => {
                metrics().record_switch_stage("rollback", true);
                switch.base().report_logs("info", "rollback succeeded").await;
            }
            Err(rollback_err) => {
                metrics().record_switch_stage("rollback", false);
                error!(switch_uid = %switch.base().switch_uid, error = %rollback_err, "Rollback failed");
                switch
                    .base()
                    .report_logs("failed", &format!("rollback: {}", rollback_err))
                    .await;
            }
        }
        return Err(e);
    }
    metrics().record_switch_stage("do", true);

    let final_result = switch.do_final().await;
    let mut warnings = switch.base().extra.warnings.clone();
    match final_result {
        Ok(()) => metrics().record_switch_stage("final", true),
        Err(e) => {
            metrics().record_switch_stage("final", false);
            warn!(switch_uid = %switch.base().switch_uid, error = %e, "Final stage incomplete");
            warnings.push(format!("final stage incomplete: {}", e));
        }
    }

    if warnings.is_empty() {
        switch.base().report_logs("success", "switch done").await;
        info!(switch_uid = %switch.base().switch_uid, "Switch done");
        return Ok(SwitchOutcome::Switched);
    }

    let summary = warnings.join("; ");
    warn!(switch_uid = %switch.base().switch_uid, warnings = %summary, "Switch done with warnings");
    switch
        .base()
        .report_logs("success", &format!("switch done with warnings: {}", summary))
        .await;
    Ok(SwitchOutcome::SwitchedWithWarnings(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::switch::BaseSwitch;
    use crate::testing::{switch_request, FakeAuditSink};

    /// Scripted switch recording which stages ran
    struct Scripted {
        base: BaseSwitch,
        check: Option<bool>,
        do_ok: bool,
        final_ok: bool,
        stages: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Scripted {
        fn new(audit: Arc<FakeAuditSink>, policy: AuditPolicy) -> Self {
            Self {
                base: BaseSwitch::new(switch_request("tendbha", "proxy"), audit, policy),
                check: Some(true),
                do_ok: true,
                final_ok: true,
                stages: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl DataBaseSwitch for Scripted {
        async fn check_switch(&mut self) -> Result<bool, SwitchError> {
            self.stages.lock().push("check");
            self.check.ok_or(SwitchError::NoControlPrimary {
                cluster: "c".into(),
            })
        }

        async fn do_switch(&mut self) -> Result<(), SwitchError> {
            self.stages.lock().push("do");
            if self.do_ok {
                Ok(())
            } else {
                Err(SwitchError::PartialRepair(vec!["boom".into()]))
            }
        }

        async fn do_final(&mut self) -> Result<(), SwitchError> {
            self.stages.lock().push("final");
            if self.final_ok {
                Ok(())
            } else {
                Err(SwitchError::PartialRepair(vec!["repoint failed".into()]))
            }
        }

        async fn rollback(&mut self) -> Result<(), SwitchError> {
            self.stages.lock().push("rollback");
            Ok(())
        }

        fn base(&self) -> &BaseSwitch {
            &self.base
        }
    }

    #[tokio::test]
    async fn test_happy_path() {
        let audit = Arc::new(FakeAuditSink::new());
        let mut switch = Scripted::new(audit.clone(), AuditPolicy::BestEffort);
        assert_eq!(run_switch(&mut switch).await.unwrap(), SwitchOutcome::Switched);
        assert_eq!(*switch.stages.lock(), vec!["check", "do", "final"]);

        let results: Vec<_> = audit.switch_logs().into_iter().map(|r| r.result).collect();
        assert_eq!(results.first().map(String::as_str), Some("begin"));
        assert_eq!(results.last().map(String::as_str), Some("success"));
    }

    #[tokio::test]
    async fn test_skip_when_nothing_to_do() {
        let audit = Arc::new(FakeAuditSink::new());
        let mut switch = Scripted::new(audit, AuditPolicy::BestEffort);
        switch.check = Some(false);
        assert_eq!(run_switch(&mut switch).await.unwrap(), SwitchOutcome::Skipped);
        assert_eq!(*switch.stages.lock(), vec!["check"]);
    }

    #[tokio::test]
    async fn test_do_failure_rolls_back() {
        let audit = Arc::new(FakeAuditSink::new());
        let mut switch = Scripted::new(audit, AuditPolicy::BestEffort);
        switch.do_ok = false;
        assert!(run_switch(&mut switch).await.is_err());
        assert_eq!(*switch.stages.lock(), vec!["check", "do", "rollback"]);
    }

    #[tokio::test]
    async fn test_final_failure_does_not_roll_back() {
        let audit = Arc::new(FakeAuditSink::new());
        let mut switch = Scripted::new(audit, AuditPolicy::BestEffort);
        switch.final_ok = false;
        let outcome = run_switch(&mut switch).await.unwrap();
        assert!(matches!(outcome, SwitchOutcome::SwitchedWithWarnings(_)));
        assert_eq!(*switch.stages.lock(), vec!["check", "do", "final"]);
    }

    #[tokio::test]
    async fn test_side_table_warnings_surface_without_rollback() {
        let audit = Arc::new(FakeAuditSink::new());
        let mut switch = Scripted::new(audit.clone(), AuditPolicy::BestEffort);
        switch.base.extra.warnings.push("clb call for lb-1 failed".into());

        let outcome = run_switch(&mut switch).await.unwrap();
        assert_eq!(
            outcome,
            SwitchOutcome::SwitchedWithWarnings("clb call for lb-1 failed".into())
        );
        assert_eq!(*switch.stages.lock(), vec!["check", "do", "final"]);
        let last = audit.switch_logs().pop().unwrap();
        assert_eq!(last.result, "success");
        assert!(last.comment.contains("lb-1"));
    }

    #[tokio::test]
    async fn test_audit_outage_tolerated_by_default() {
        let audit = Arc::new(FakeAuditSink::new());
        audit.set_failing(true);
        let mut switch = Scripted::new(audit, AuditPolicy::BestEffort);
        assert_eq!(run_switch(&mut switch).await.unwrap(), SwitchOutcome::Switched);
    }

    #[tokio::test]
    async fn test_strict_policy_aborts_before_any_action() {
        let audit = Arc::new(FakeAuditSink::new());
        audit.set_failing(true);
        let mut switch = Scripted::new(audit, AuditPolicy::Strict);
        assert!(matches!(
            run_switch(&mut switch).await,
            Err(SwitchError::Audit(_))
        ));
        assert!(switch.stages.lock().is_empty());
    }
}
