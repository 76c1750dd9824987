use crate::utils::constants::{
    FORCE_ASGS_PATH, FORCE_ORPHANED_ASGS_CLEANUP_PATH, FORCE_POLICY_POLL_PATH,
};
use async_trait::async_trait;
use std::time::Duration;

/// Status code and body of one control-endpoint call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PokeResponse {
    pub status: u16,
    pub body: String,
}

/// Client for the reconciliation agent's loopback control endpoint.
#[async_trait]
pub trait PolicyAgentClient: Send + Sync {
    async fn get(&self, path: &str, container: Option<&str>) -> Result<PokeResponse, String>;

    async fn force_policy_poll(&self) -> Result<PokeResponse, String> {
        self.get(FORCE_POLICY_POLL_PATH, None).await
    }

    async fn force_asgs_for_container(&self, container: &str) -> Result<PokeResponse, String> {
        self.get(FORCE_ASGS_PATH, Some(container)).await
    }

    async fn force_orphaned_asgs_cleanup(&self, container: &str) -> Result<PokeResponse, String> {
        self.get(FORCE_ORPHANED_ASGS_CLEANUP_PATH, Some(container))
            .await
    }
}

pub struct HttpPolicyAgentClient {
    address: String,
    http: reqwest::Client,
}

impl HttpPolicyAgentClient {
    /// `address` is the agent's `host:port`
    pub fn new(address: &str) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| e.to_string())?;

        Ok(Self {
            address: address.to_string(),
            http,
        })
    }
}

#[async_trait]
impl PolicyAgentClient for HttpPolicyAgentClient {
    async fn get(&self, path: &str, container: Option<&str>) -> Result<PokeResponse, String> {
        let url = format!("http://{}{}", self.address, path);
        let mut request = self.http.get(&url);
        if let Some(container) = container {
            request = request.query(&[("container", container)]);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok(PokeResponse { status, body })
    }
}
