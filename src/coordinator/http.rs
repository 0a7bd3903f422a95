use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::CoordinatorConfig;

use super::{
    AgentRegistration, AuditSink, ClusterMember, Coordinator, CoordinatorError, DetectLogRow,
    DetectStatusRow, GmDeliveryRow, GmNode, HeartbeatRow, InstanceQuery, InstanceRecord, Partition,
    SwitchLogRow,
};

/// JSON-over-HTTP client for the coordinator API. Also serves as the audit sink.
#[derive(Clone)]
pub struct HttpCoordinator {
    client: HttpClient,
    base_url: String,
}

impl HttpCoordinator {
    pub fn new(config: &CoordinatorConfig) -> Result<Self, CoordinatorError> {
        let client = HttpClient::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| CoordinatorError::Request {
                path: config.url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, CoordinatorError> {
        debug!(path = %path, "Coordinator GET");
        let response = self
            .client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(|e| request_error(path, e))?;
        Self::decode(path, response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CoordinatorError> {
        debug!(path = %path, "Coordinator POST");
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(path, e))?;
        Self::decode(path, response).await
    }

    /// POST whose response body is ignored
    async fn post_row<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), CoordinatorError> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(path, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(path = %path, status = %status, "Coordinator rejected audit row");
            return Err(CoordinatorError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn decode<T: DeserializeOwned>(
        path: &str,
        response: reqwest::Response,
    ) -> Result<T, CoordinatorError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoordinatorError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        response.json::<T>().await.map_err(|e| CoordinatorError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })
    }
}

fn request_error(path: &str, e: reqwest::Error) -> CoordinatorError {
    CoordinatorError::Request {
        path: path.to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl Coordinator for HttpCoordinator {
    async fn register_agent(&self, agent: &AgentRegistration) -> Result<(), CoordinatorError> {
        self.post_row("/agents/register", agent).await
    }

    async fn fetch_partition(&self, zone: &str, db_type: &str) -> Result<Partition, CoordinatorError> {
        self.get("/partition", &[("zone", zone), ("db_type", db_type)])
            .await
    }

    async fn fetch_instances(&self, query: &InstanceQuery) -> Result<Vec<InstanceRecord>, CoordinatorError> {
        self.post("/instances/query", query).await
    }

    async fn fetch_gm_nodes(&self) -> Result<Vec<GmNode>, CoordinatorError> {
        self.get("/gm/nodes", &[]).await
    }

    async fn fetch_muted_ips(&self) -> Result<Vec<String>, CoordinatorError> {
        self.get("/mute", &[]).await
    }

    async fn fetch_cluster_members(&self, cluster: &str) -> Result<Vec<ClusterMember>, CoordinatorError> {
        self.get(&format!("/clusters/{}/members", cluster), &[]).await
    }
}

#[async_trait]
impl AuditSink for HttpCoordinator {
    async fn record_heartbeat(&self, row: &HeartbeatRow) -> Result<(), CoordinatorError> {
        self.post_row("/audit/heartbeat", row).await
    }

    async fn record_detect_log(&self, row: &DetectLogRow) -> Result<(), CoordinatorError> {
        self.post_row("/audit/detect", row).await
    }

    async fn update_detect_status(&self, row: &DetectStatusRow) -> Result<(), CoordinatorError> {
        self.post_row("/audit/status", row).await
    }

    async fn record_gm_delivery(&self, row: &GmDeliveryRow) -> Result<(), CoordinatorError> {
        self.post_row("/audit/gm", row).await
    }

    async fn record_switch_log(&self, row: &SwitchLogRow) -> Result<(), CoordinatorError> {
        self.post_row("/audit/switch", row).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn coordinator(server: &MockServer) -> HttpCoordinator {
        HttpCoordinator::new(&CoordinatorConfig {
            url: format!("{}/", server.uri()),
            timeout_ms: 2000,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_partition() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/partition"))
            .and(query_param("zone", "shenzhen"))
            .and(query_param("db_type", "tendbha:backend"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"modulus": 3, "value": 1})),
            )
            .mount(&server)
            .await;

        let partition = coordinator(&server)
            .await
            .fetch_partition("shenzhen", "tendbha:backend")
            .await
            .unwrap();
        assert_eq!(partition, Partition { modulus: 3, value: 1 });
    }

    #[tokio::test]
    async fn test_fetch_gm_nodes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gm/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"ip": "10.1.0.1", "port": 50000, "zone": "shanghai", "cloud": "tencent"}
            ])))
            .mount(&server)
            .await;

        let nodes = coordinator(&server).await.fetch_gm_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].ip, "10.1.0.1");
        assert_eq!(nodes[0].port, 50000);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mute"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = coordinator(&server).await.fetch_muted_ips().await.unwrap_err();
        match err {
            CoordinatorError::Status { status, body, .. } => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_register_agent_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agents/register"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let agent = AgentRegistration {
            ip: "10.0.0.9".into(),
            port: 0,
            zone: "shenzhen".into(),
            cloud: "tencent".into(),
            db_types: vec!["tendbha:backend".into()],
        };
        coordinator(&server).await.register_agent(&agent).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instances/query"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let query = InstanceQuery {
            zone: "shenzhen".into(),
            db_type: "tendbha:backend".into(),
            cluster_type: "tendbha".into(),
            modulus: 1,
            value: 0,
        };
        let err = coordinator(&server)
            .await
            .fetch_instances(&query)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Decode { .. }));
    }
}
