//! Spider failover: release the name services, then drop the spider from
//! the control-table routes

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::context::HaContext;
use crate::coordinator::ClusterMember;

use super::tdbctl::{find_primary, ControlError, ControlNode};
use super::{BaseSwitch, DataBaseSwitch, SwitchError};

pub struct SpiderSwitch {
    base: BaseSwitch,
    ctx: Arc<HaContext>,
    members: Vec<ClusterMember>,
}

impl SpiderSwitch {
    pub fn new(base: BaseSwitch, ctx: Arc<HaContext>) -> Self {
        Self {
            base,
            ctx,
            members: Vec::new(),
        }
    }
}

/// Drop the spider's route on the control primary and push the change out.
/// Returns the dropped server name, `None` if it was already gone.
async fn drop_from_routing(
    primary: &mut dyn ControlNode,
    ip: &str,
    port: u16,
) -> Result<Option<String>, ControlError> {
    let routes = primary.route_table().await?;
    let server_name = routes
        .into_iter()
        .find(|r| r.host == ip && r.port == port)
        .map(|r| r.server_name);
    match &server_name {
        Some(name) => primary.drop_route(name).await?,
        None => info!(ip = %ip, port = port, "Spider already absent from routing table"),
    }
    primary.flush_routing().await?;
    Ok(server_name)
}

#[async_trait]
impl DataBaseSwitch for SpiderSwitch {
    async fn check_switch(&mut self) -> Result<bool, SwitchError> {
        self.members = self
            .ctx
            .coordinator
            .fetch_cluster_members(&self.base.cluster)
            .await?;
        let addr = self.base.addr();
        if !self.members.iter().any(|m| m.addr() == addr) {
            self.base
                .report_logs("info", &format!("{} is not a member of {}", addr, self.base.cluster))
                .await;
            return Ok(false);
        }
        Ok(true)
    }

    async fn do_switch(&mut self) -> Result<(), SwitchError> {
        let switch_config = &self.ctx.config.switch;
        self.base
            .release_name_service(&self.ctx.name_services, switch_config.name_service_timeout())
            .await?;

        let controls: Vec<(String, u16)> = self
            .members
            .iter()
            .filter(|m| m.machine_type == "tdbctl" && m.is_available())
            .map(|m| (m.ip.clone(), m.port))
            .collect();
        let Some(mut primary) = find_primary(
            self.ctx.control.as_ref(),
            &controls,
            switch_config.control_connect_timeout(),
        )
        .await
        else {
            return Err(SwitchError::NoControlPrimary {
                cluster: self.base.cluster.clone(),
            });
        };

        let result = drop_from_routing(primary.as_mut(), &self.base.ip, self.base.port).await;
        primary.close().await;
        self.base.extra.server_name = result?;

        let comment = format!(
            "removed {} from routing{}",
            self.base.addr(),
            self.base
                .extra
                .server_name
                .as_deref()
                .map(|name| format!(" as {}", name))
                .unwrap_or_default()
        );
        self.base.report_logs("info", &comment).await;
        Ok(())
    }

    /// Only the name-service release is undone; a dropped route stays dropped
    async fn rollback(&mut self) -> Result<(), SwitchError> {
        let call_timeout = self.ctx.config.switch.name_service_timeout();
        self.base
            .restore_released(&self.ctx.name_services, call_timeout)
            .await
    }

    fn base(&self) -> &BaseSwitch {
        &self.base
    }
}
