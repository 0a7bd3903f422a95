//! Compare every spider node's routing table with the control-table view

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, warn};

use crate::coordinator::ClusterMember;

use super::control::{ControlNodeConnector, RouteEntry};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RouteDivergence {
    Unreachable { node: String, message: String },
    Missing { node: String, server_name: String },
    Unexpected { node: String, server_name: String },
    Mismatch {
        node: String,
        server_name: String,
        expected: String,
        actual: String,
    },
}

impl fmt::Display for RouteDivergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDivergence::Unreachable { node, message } => {
                write!(f, "{}: unreachable ({})", node, message)
            }
            RouteDivergence::Missing { node, server_name } => {
                write!(f, "{}: missing route {}", node, server_name)
            }
            RouteDivergence::Unexpected { node, server_name } => {
                write!(f, "{}: unexpected route {}", node, server_name)
            }
            RouteDivergence::Mismatch {
                node,
                server_name,
                expected,
                actual,
            } => write!(
                f,
                "{}: route {} is {} but control table says {}",
                node, server_name, actual, expected
            ),
        }
    }
}

fn route_target(entry: &RouteEntry) -> String {
    format!("{}:{}/{}", entry.host, entry.port, entry.wrapper)
}

/// Differences between one node's routes and the authoritative routes
pub fn diff_routes(node: &str, expected: &[RouteEntry], actual: &[RouteEntry]) -> Vec<RouteDivergence> {
    let expected: BTreeMap<&str, &RouteEntry> =
        expected.iter().map(|r| (r.server_name.as_str(), r)).collect();
    let actual: BTreeMap<&str, &RouteEntry> =
        actual.iter().map(|r| (r.server_name.as_str(), r)).collect();

    let mut divergences = Vec::new();
    for (name, want) in &expected {
        match actual.get(name) {
            None => divergences.push(RouteDivergence::Missing {
                node: node.to_string(),
                server_name: name.to_string(),
            }),
            Some(got) if route_target(got) != route_target(want) => {
                divergences.push(RouteDivergence::Mismatch {
                    node: node.to_string(),
                    server_name: name.to_string(),
                    expected: route_target(want),
                    actual: route_target(got),
                })
            }
            Some(_) => {}
        }
    }
    for name in actual.keys() {
        if !expected.contains_key(name) {
            divergences.push(RouteDivergence::Unexpected {
                node: node.to_string(),
                server_name: name.to_string(),
            });
        }
    }
    divergences
}

/// Check every spider node in parallel, at most `concurrency` at a time.
/// Collects every divergence from every node.
pub async fn verify_routes(
    connector: Arc<dyn ControlNodeConnector>,
    authoritative: Vec<RouteEntry>,
    spiders: &[ClusterMember],
    concurrency: usize,
    connect_timeout: Duration,
) -> Vec<RouteDivergence> {
    let authoritative = Arc::new(authoritative);
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for spider in spiders {
        let connector = connector.clone();
        let authoritative = authoritative.clone();
        let semaphore = semaphore.clone();
        let (host, port, node) = (spider.ip.clone(), spider.port, spider.addr());

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let mut conn = match timeout(connect_timeout, connector.connect(&host, port)).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    return vec![RouteDivergence::Unreachable {
                        node,
                        message: e.to_string(),
                    }]
                }
                Err(_) => {
                    return vec![RouteDivergence::Unreachable {
                        node,
                        message: "connect timed out".to_string(),
                    }]
                }
            };
            let routes = conn.route_table().await;
            conn.close().await;
            match routes {
                Ok(routes) => diff_routes(&node, &authoritative, &routes),
                Err(e) => vec![RouteDivergence::Unreachable {
                    node,
                    message: e.to_string(),
                }],
            }
        });
    }

    let mut divergences = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(found) => divergences.extend(found),
            Err(e) => error!(error = %e, "Route verification task aborted"),
        }
    }
    divergences.sort();
    for divergence in &divergences {
        warn!(divergence = %divergence, "Route divergence");
    }
    divergences
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, host: &str, port: u16) -> RouteEntry {
        RouteEntry {
            server_name: name.to_string(),
            host: host.to_string(),
            port,
            wrapper: "mysql".to_string(),
        }
    }

    #[test]
    fn test_identical_tables_have_no_divergence() {
        let routes = vec![route("SPT0", "10.0.2.1", 20000), route("SPT1", "10.0.2.2", 20000)];
        assert!(diff_routes("n1", &routes, &routes).is_empty());
    }

    #[test]
    fn test_every_difference_reported() {
        let expected = vec![
            route("SPT0", "10.0.2.1", 20000),
            route("SPT1", "10.0.2.2", 20000),
        ];
        let actual = vec![route("SPT0", "10.0.2.9", 20000), route("SPT7", "10.0.2.7", 20000)];

        let divergences = diff_routes("n1", &expected, &actual);
        assert_eq!(divergences.len(), 3);
        assert!(divergences.contains(&RouteDivergence::Missing {
            node: "n1".into(),
            server_name: "SPT1".into()
        }));
        assert!(divergences.contains(&RouteDivergence::Unexpected {
            node: "n1".into(),
            server_name: "SPT7".into()
        }));
        assert!(divergences
            .iter()
            .any(|d| matches!(d, RouteDivergence::Mismatch { server_name, .. } if server_name == "SPT0")));
    }
}
