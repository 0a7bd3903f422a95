//! Primary election for the control-table cluster
//!
//! Runs only when the failed node was primary. Candidates are the surviving
//! control nodes; the most advanced healthy secondary wins.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::coordinator::ClusterMember;

use super::control::{ControlError, ControlNodeConnector, RouteEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    Primary,
    Secondary,
    /// Role could not be read
    Unknown,
}

/// A control node from the membership table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdbctlInfo {
    pub server_name: String,
    pub host: String,
    pub port: u16,
    pub cluster_role: ClusterRole,
}

impl TdbctlInfo {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Replica progress as reported by `SHOW SLAVE STATUS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStatus {
    pub source_host: String,
    pub source_port: u16,
    /// Index of the source log file being applied
    pub relay_index: u64,
    pub exec_pos: u64,
    pub sql_thread_running: bool,
}

impl ReplicationStatus {
    fn progress(&self) -> (u64, u64) {
        (self.relay_index, self.exec_pos)
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub info: TdbctlInfo,
    pub replication: Option<ReplicationStatus>,
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("Control node {addr} claims to be primary while the primary is presumed down")]
    PrimaryStillAlive { addr: String },
    #[error("Secondaries replicate from different sources: {first} vs {second}")]
    SourceMismatch { first: String, second: String },
    #[error("No eligible secondary to promote")]
    NoCandidate,
    #[error("No reachable control node to read membership from in cluster {cluster}")]
    NoMembershipSource { cluster: String },
    #[error(transparent)]
    Control(#[from] ControlError),
}

impl ElectionError {
    /// Whether the cluster state contradicts the election's premise
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            ElectionError::PrimaryStillAlive { .. } | ElectionError::SourceMismatch { .. }
        )
    }
}

/// Pick the secondary to promote.
///
/// Fails on a candidate claiming primary or on secondaries that disagree on
/// their source. Otherwise drops secondaries without a source or with a
/// stopped apply thread and returns the one furthest ahead by
/// (log index, exec position).
pub fn elect(candidates: &[Candidate]) -> Result<TdbctlInfo, ElectionError> {
    if let Some(primary) = candidates
        .iter()
        .find(|c| c.info.cluster_role == ClusterRole::Primary)
    {
        return Err(ElectionError::PrimaryStillAlive {
            addr: primary.info.addr(),
        });
    }

    let mut with_source = Vec::new();
    for candidate in candidates {
        if candidate.info.cluster_role != ClusterRole::Secondary {
            debug!(node = %candidate.info.addr(), "Skipping candidate with unknown role");
            continue;
        }
        match &candidate.replication {
            Some(status) if !status.source_host.is_empty() => with_source.push((candidate, status)),
            _ => debug!(node = %candidate.info.addr(), "Skipping candidate without replication source"),
        }
    }

    if let Some((_, first)) = with_source.first() {
        for (_, status) in &with_source[1..] {
            if status.source_host != first.source_host || status.source_port != first.source_port {
                return Err(ElectionError::SourceMismatch {
                    first: format!("{}:{}", first.source_host, first.source_port),
                    second: format!("{}:{}", status.source_host, status.source_port),
                });
            }
        }
    }

    with_source
        .into_iter()
        .filter(|(candidate, status)| {
            if !status.sql_thread_running {
                debug!(node = %candidate.info.addr(), "Skipping candidate with stopped apply thread");
            }
            status.sql_thread_running
        })
        .max_by(|(a, sa), (b, sb)| {
            sa.progress()
                .cmp(&sb.progress())
                // equal progress: prefer the lower server name
                .then_with(|| b.info.server_name.cmp(&a.info.server_name))
        })
        .map(|(candidate, _)| candidate.info.clone())
        .ok_or(ElectionError::NoCandidate)
}

/// Control nodes listed in a routing table
pub fn tdbctl_members(routes: &[RouteEntry]) -> Vec<TdbctlInfo> {
    routes
        .iter()
        .filter(|r| r.is_tdbctl())
        .map(|r| TdbctlInfo {
            server_name: r.server_name.clone(),
            host: r.host.clone(),
            port: r.port,
            cluster_role: ClusterRole::Unknown,
        })
        .collect()
}

/// Read the routing table from the first reachable eligible member.
///
/// Unavailable members, the failed node and read-only spider slaves are
/// skipped.
pub async fn load_membership(
    connector: &dyn ControlNodeConnector,
    cluster: &str,
    members: &[ClusterMember],
    failed_addr: &str,
    connect_timeout: Duration,
) -> Result<Vec<RouteEntry>, ElectionError> {
    for member in members {
        let eligible = member.is_available()
            && member.addr() != failed_addr
            && matches!(member.machine_type.as_str(), "tdbctl" | "spider")
            && !member.role.eq_ignore_ascii_case("spider_slave");
        if !eligible {
            continue;
        }

        let mut node = match timeout(connect_timeout, connector.connect(&member.ip, member.port)).await {
            Ok(Ok(node)) => node,
            Ok(Err(e)) => {
                warn!(node = %member.addr(), error = %e, "Membership source unreachable");
                continue;
            }
            Err(_) => {
                warn!(node = %member.addr(), "Membership source timed out");
                continue;
            }
        };
        let routes = node.route_table().await;
        node.close().await;
        match routes {
            Ok(routes) => {
                debug!(node = %member.addr(), routes = routes.len(), "Loaded routing table");
                return Ok(routes);
            }
            Err(e) => warn!(node = %member.addr(), error = %e, "Failed to read routing table"),
        }
    }
    Err(ElectionError::NoMembershipSource {
        cluster: cluster.to_string(),
    })
}

/// Read role and replica progress from every surviving control node.
/// Unreachable nodes are left out.
pub async fn collect_candidates(
    connector: &dyn ControlNodeConnector,
    survivors: &[TdbctlInfo],
    connect_timeout: Duration,
) -> Vec<Candidate> {
    let mut candidates = Vec::with_capacity(survivors.len());
    for info in survivors {
        let mut node = match timeout(connect_timeout, connector.connect(&info.host, info.port)).await {
            Ok(Ok(node)) => node,
            Ok(Err(e)) => {
                warn!(node = %info.addr(), error = %e, "Candidate unreachable");
                continue;
            }
            Err(_) => {
                warn!(node = %info.addr(), "Candidate connect timed out");
                continue;
            }
        };

        let cluster_role = match node.is_primary().await {
            Ok(true) => ClusterRole::Primary,
            Ok(false) => ClusterRole::Secondary,
            Err(e) => {
                warn!(node = %info.addr(), error = %e, "Failed to read cluster role");
                ClusterRole::Unknown
            }
        };
        let replication = match node.replication_status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(node = %info.addr(), error = %e, "Failed to read replication status");
                None
            }
        };
        node.close().await;

        candidates.push(Candidate {
            info: TdbctlInfo {
                cluster_role,
                ..info.clone()
            },
            replication,
        });
    }
    candidates
}

/// Gather candidates from `survivors` and elect one
pub async fn elect_primary(
    connector: &dyn ControlNodeConnector,
    survivors: &[TdbctlInfo],
    connect_timeout: Duration,
) -> Result<TdbctlInfo, ElectionError> {
    let candidates = collect_candidates(connector, survivors, connect_timeout).await;
    let winner = elect(&candidates)?;
    info!(node = %winner.addr(), server = %winner.server_name, candidates = candidates.len(), "Elected new control primary");
    Ok(winner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secondary(name: &str, relay_index: u64, exec_pos: u64) -> Candidate {
        Candidate {
            info: TdbctlInfo {
                server_name: name.to_string(),
                host: format!("10.0.1.{}", name.len()),
                port: 26000,
                cluster_role: ClusterRole::Secondary,
            },
            replication: Some(ReplicationStatus {
                source_host: "10.0.1.1".to_string(),
                source_port: 26000,
                relay_index,
                exec_pos,
                sql_thread_running: true,
            }),
        }
    }

    #[test]
    fn test_most_advanced_secondary_wins() {
        let candidates = vec![
            secondary("TDBCTL1", 12, 900),
            secondary("TDBCTL2", 13, 100),
            secondary("TDBCTL3", 13, 50),
        ];
        assert_eq!(elect(&candidates).unwrap().server_name, "TDBCTL2");
    }

    #[test]
    fn test_exec_pos_breaks_index_tie() {
        let candidates = vec![secondary("TDBCTL1", 13, 100), secondary("TDBCTL2", 13, 400)];
        assert_eq!(elect(&candidates).unwrap().server_name, "TDBCTL2");
    }

    #[test]
    fn test_result_independent_of_order() {
        let mut candidates = vec![
            secondary("TDBCTL1", 5, 10),
            secondary("TDBCTL2", 7, 1),
            secondary("TDBCTL3", 6, 999),
        ];
        let first = elect(&candidates).unwrap();
        candidates.reverse();
        assert_eq!(elect(&candidates).unwrap(), first);
        assert_eq!(first.server_name, "TDBCTL2");
    }

    #[test]
    fn test_primary_claim_is_invariant_violation() {
        let mut claimant = secondary("TDBCTL1", 99, 99);
        claimant.info.cluster_role = ClusterRole::Primary;
        let err = elect(&[claimant, secondary("TDBCTL2", 1, 1)]).unwrap_err();
        assert!(matches!(err, ElectionError::PrimaryStillAlive { .. }));
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_disagreeing_sources_rejected() {
        let mut stray = secondary("TDBCTL2", 20, 20);
        if let Some(status) = stray.replication.as_mut() {
            status.source_host = "10.0.1.99".to_string();
        }
        let err = elect(&[secondary("TDBCTL1", 1, 1), stray]).unwrap_err();
        assert!(matches!(err, ElectionError::SourceMismatch { .. }));
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_ineligible_candidates_dropped() {
        let mut stopped = secondary("TDBCTL1", 50, 50);
        if let Some(status) = stopped.replication.as_mut() {
            status.sql_thread_running = false;
        }
        let mut no_source = secondary("TDBCTL2", 60, 60);
        no_source.replication = None;
        let mut unknown = secondary("TDBCTL3", 70, 70);
        unknown.info.cluster_role = ClusterRole::Unknown;

        let winner = elect(&[stopped, no_source, unknown, secondary("TDBCTL4", 1, 1)]).unwrap();
        assert_eq!(winner.server_name, "TDBCTL4");
    }

    #[test]
    fn test_no_candidate() {
        assert!(matches!(elect(&[]), Err(ElectionError::NoCandidate)));

        let mut stopped = secondary("TDBCTL1", 1, 1);
        if let Some(status) = stopped.replication.as_mut() {
            status.sql_thread_running = false;
        }
        assert!(matches!(elect(&[stopped]), Err(ElectionError::NoCandidate)));
    }

    #[test]
    fn test_tdbctl_members_filters_wrapper() {
        let routes = vec![
            RouteEntry {
                server_name: "SPT0".into(),
                host: "10.0.2.1".into(),
                port: 20000,
                wrapper: "mysql".into(),
            },
            RouteEntry {
                server_name: "TDBCTL0".into(),
                host: "10.0.1.1".into(),
                port: 26000,
                wrapper: "TDBCTL".into(),
            },
        ];
        let members = tdbctl_members(&routes);
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].server_name, "TDBCTL0");
    }
}
