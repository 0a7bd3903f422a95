//! Control-table (tdbctl) node failover
//!
//! ```text
//! check:  members -> routing table -> was the failed node primary?
//! do:     [elect -> force-enable primary] -> drop failed route -> flush routing
//! final:  [reset new primary -> repoint other secondaries] -> verify spider routes
//! ```
//!
//! A promotion is never rolled back. Partial repair in the final stage is
//! reported and left for an operator.

mod control;
mod election;
mod route;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::context::HaContext;
use crate::coordinator::ClusterMember;
use crate::mysql::ConnectionError;

pub use control::{
    log_file_index, ControlError, ControlNode, ControlNodeConnector, MysqlControlConnector,
    MysqlControlNode, RouteEntry,
};
pub use election::{
    collect_candidates, elect, elect_primary, load_membership, tdbctl_members, Candidate,
    ClusterRole, ElectionError, ReplicationStatus, TdbctlInfo,
};
pub use route::{diff_routes, verify_routes, RouteDivergence};

use super::{BaseSwitch, DataBaseSwitch, SwitchError};

/// Connect with a deadline
pub async fn connect_node(
    connector: &dyn ControlNodeConnector,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<Box<dyn ControlNode>, ControlError> {
    match timeout(connect_timeout, connector.connect(host, port)).await {
        Ok(result) => result,
        Err(_) => Err(ControlError::Connect {
            addr: format!("{}:{}", host, port),
            source: ConnectionError::Timeout(format!("{}:{}", host, port)),
        }),
    }
}

/// Open a session on whichever of `nodes` currently holds the primary role
pub async fn find_primary(
    connector: &dyn ControlNodeConnector,
    nodes: &[(String, u16)],
    connect_timeout: Duration,
) -> Option<Box<dyn ControlNode>> {
    for (host, port) in nodes {
        let mut node = match connect_node(connector, host, *port, connect_timeout).await {
            Ok(node) => node,
            Err(e) => {
                warn!(error = %e, "Control node unreachable");
                continue;
            }
        };
        match node.is_primary().await {
            Ok(true) => return Some(node),
            Ok(false) => {}
            Err(e) => warn!(node = %node.addr(), error = %e, "Failed to read cluster role"),
        }
        node.close().await;
    }
    None
}

pub struct TdbctlSwitch {
    base: BaseSwitch,
    ctx: Arc<HaContext>,
    members: Vec<ClusterMember>,
    /// Surviving control nodes from the routing table
    survivors: Vec<TdbctlInfo>,
    was_primary: bool,
    /// Primary after the switch
    primary: Option<TdbctlInfo>,
    divergences: Vec<RouteDivergence>,
}

impl TdbctlSwitch {
    pub fn new(base: BaseSwitch, ctx: Arc<HaContext>) -> Self {
        Self {
            base,
            ctx,
            members: Vec::new(),
            survivors: Vec::new(),
            was_primary: false,
            primary: None,
            divergences: Vec::new(),
        }
    }

    /// Whether the failed node held the primary role
    pub fn was_primary(&self) -> bool {
        self.was_primary
    }

    pub fn primary(&self) -> Option<&TdbctlInfo> {
        self.primary.as_ref()
    }

    /// Route divergences found after the final stage
    pub fn divergences(&self) -> &[RouteDivergence] {
        &self.divergences
    }

    fn connect_timeout(&self) -> Duration {
        self.ctx.config.switch.control_connect_timeout()
    }

    async fn connect(&self, info: &TdbctlInfo) -> Result<Box<dyn ControlNode>, ControlError> {
        connect_node(self.ctx.control.as_ref(), &info.host, info.port, self.connect_timeout()).await
    }

    /// Promote the best secondary
    async fn promote(&mut self) -> Result<TdbctlInfo, SwitchError> {
        let winner = elect_primary(self.ctx.control.as_ref(), &self.survivors, self.connect_timeout()).await?;
        let mut node = self.connect(&winner).await?;
        let result = node.enable_primary_force().await;
        node.close().await;
        result?;

        self.base.extra.new_primary = Some(winner.server_name.clone());
        self.base
            .report_logs("info", &format!("promoted {} ({}) to primary", winner.server_name, winner.addr()))
            .await;
        Ok(TdbctlInfo {
            cluster_role: ClusterRole::Primary,
            ..winner
        })
    }

    /// The surviving node that already is primary
    async fn current_primary(&self) -> Result<TdbctlInfo, SwitchError> {
        for info in &self.survivors {
            let mut node = match self.connect(info).await {
                Ok(node) => node,
                Err(e) => {
                    warn!(node = %info.addr(), error = %e, "Control node unreachable");
                    continue;
                }
            };
            let is_primary = node.is_primary().await;
            node.close().await;
            if let Ok(true) = is_primary {
                return Ok(TdbctlInfo {
                    cluster_role: ClusterRole::Primary,
                    ..info.clone()
                });
            }
        }
        Err(SwitchError::NoControlPrimary {
            cluster: self.base.cluster.clone(),
        })
    }

    /// New primary drops its replica state; every other survivor follows it
    async fn repair_replication(&self, primary: &TdbctlInfo) -> Vec<String> {
        let mut failures = Vec::new();

        let reset = async {
            let mut node = self.connect(primary).await?;
            let result = node.reset_replica().await;
            node.close().await;
            result
        }
        .await;
        if let Err(e) = reset {
            failures.push(format!("reset {}: {}", primary.addr(), e));
            // repointing onto a primary that still replicates would chain the survivors
            return failures;
        }

        let switch_config = &self.ctx.config.switch;
        for info in self.survivors.iter().filter(|s| s.server_name != primary.server_name) {
            let repointed = async {
                let mut node = self.connect(info).await?;
                let result = node
                    .change_source(
                        &primary.host,
                        primary.port,
                        &switch_config.replication_user,
                        &switch_config.replication_password,
                    )
                    .await;
                node.close().await;
                result
            }
            .await;
            match repointed {
                Ok(()) => info!(node = %info.addr(), primary = %primary.addr(), "Repointed secondary"),
                Err(e) => {
                    warn!(node = %info.addr(), error = %e, "Failed to repoint secondary");
                    failures.push(format!("repoint {}: {}", info.addr(), e));
                }
            }
        }
        failures
    }

    /// Compare every spider's routes with the primary's
    async fn verify(&mut self, primary: &TdbctlInfo) -> Result<(), String> {
        let authoritative = async {
            let mut node = self.connect(primary).await?;
            let routes = node.route_table().await;
            node.close().await;
            routes
        }
        .await
        .map_err(|e| format!("read routes from {}: {}", primary.addr(), e))?;

        let spiders: Vec<ClusterMember> = self
            .members
            .iter()
            .filter(|m| m.machine_type == "spider" && m.is_available())
            .cloned()
            .collect();
        self.divergences = verify_routes(
            self.ctx.control.clone(),
            authoritative,
            &spiders,
            self.ctx.config.switch.route_check_concurrency,
            self.connect_timeout(),
        )
        .await;

        if self.divergences.is_empty() {
            self.base
                .report_logs("info", &format!("routes consistent on {} spider nodes", spiders.len()))
                .await;
        } else {
            let detail: Vec<String> = self.divergences.iter().map(|d| d.to_string()).collect();
            self.base.report_logs("route_check", &detail.join("; ")).await;
        }
        Ok(())
    }
}

#[async_trait]
impl DataBaseSwitch for TdbctlSwitch {
    async fn check_switch(&mut self) -> Result<bool, SwitchError> {
        let addr = self.base.addr();
        self.members = self
            .ctx
            .coordinator
            .fetch_cluster_members(&self.base.cluster)
            .await?;
        let Some(failed) = self.members.iter().find(|m| m.addr() == addr) else {
            self.base
                .report_logs("info", &format!("{} is not a member of {}", addr, self.base.cluster))
                .await;
            return Ok(false);
        };
        self.was_primary = failed.role.eq_ignore_ascii_case("primary");

        let routes = load_membership(
            self.ctx.control.as_ref(),
            &self.base.cluster,
            &self.members,
            &addr,
            self.connect_timeout(),
        )
        .await?;
        let (failed_nodes, survivors): (Vec<TdbctlInfo>, Vec<TdbctlInfo>) = tdbctl_members(&routes)
            .into_iter()
            .partition(|t| t.host == self.base.ip && t.port == self.base.port);
        self.base.extra.server_name = failed_nodes.into_iter().next().map(|t| t.server_name);
        self.survivors = survivors;

        if self.survivors.is_empty() {
            return Err(ElectionError::NoCandidate.into());
        }
        if self.base.extra.server_name.is_none() && !self.was_primary {
            self.base
                .report_logs("info", "failed node already absent from routing table")
                .await;
            return Ok(false);
        }
        info!(
            addr = %addr,
            was_primary = self.was_primary,
            survivors = self.survivors.len(),
            "Control node switch prechecked"
        );
        Ok(true)
    }

    async fn do_switch(&mut self) -> Result<(), SwitchError> {
        let primary = if self.was_primary {
            self.promote().await?
        } else {
            self.current_primary().await?
        };

        let mut node = self.connect(&primary).await?;
        let result = async {
            if let Some(server_name) = &self.base.extra.server_name {
                node.drop_route(server_name).await?;
            }
            node.flush_routing().await
        }
        .await;
        node.close().await;
        self.primary = Some(primary);
        result?;

        self.base
            .report_logs("info", "removed failed node from routing and flushed")
            .await;
        Ok(())
    }

    async fn do_final(&mut self) -> Result<(), SwitchError> {
        let Some(primary) = self.primary.clone() else {
            return Ok(());
        };

        let mut failures = Vec::new();
        if self.was_primary {
            failures = self.repair_replication(&primary).await;
        }
        if let Err(e) = self.verify(&primary).await {
            failures.push(e);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SwitchError::PartialRepair(failures))
        }
    }

    async fn rollback(&mut self) -> Result<(), SwitchError> {
        self.base
            .report_logs("info", "control-table switch is not rolled back")
            .await;
        Ok(())
    }

    fn base(&self) -> &BaseSwitch {
        &self.base
    }
}
