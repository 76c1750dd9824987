//! Client for the central policy service's internal API.
//!
//! The service speaks JSON over mutually-authenticated HTTPS. Only the subset
//! of its model the planners read is decoded; unknown fields are ignored.

use crate::iptables::converter::{IpRange, PortRange};
use crate::utils::constants::{HEALTHCHECK_PATH, POLICIES_PATH, SECURITY_GROUPS_PATH, TAGS_PATH};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PolicyClientError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("tls material: {0}")]
    Tls(String),
}

pub type PolicyClientResult<T> = Result<T, PolicyClientError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySource {
    pub id: String,
    #[serde(default)]
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDestination {
    pub id: String,
    #[serde(default)]
    pub tag: String,
    pub protocol: String,
    pub ports: PortRange,
}

/// Container-to-container allow rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub source: PolicySource,
    pub destination: PolicyDestination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressSource {
    #[serde(default)]
    pub id: String,
    /// `app`, `space` or `default`; empty means `app`
    #[serde(rename = "type", default)]
    pub source_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressDestination {
    pub protocol: String,
    #[serde(default)]
    pub ips: Vec<IpRange>,
    #[serde(default)]
    pub ports: Vec<PortRange>,
    #[serde(default)]
    pub icmp_type: Option<i32>,
    #[serde(default)]
    pub icmp_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressPolicy {
    pub source: EgressSource,
    pub destination: EgressDestination,
    /// `running`, `staging`, `all` or empty
    #[serde(default)]
    pub app_lifecycle: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub total_policies: usize,
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub total_egress_policies: usize,
    #[serde(default)]
    pub egress_policies: Vec<EgressPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    #[serde(rename = "type")]
    pub tag_type: String,
    pub tag: String,
}

/// Application security group; `rules` is itself a JSON-encoded array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub guid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub rules: String,
    #[serde(default)]
    pub staging_default: bool,
    #[serde(default)]
    pub running_default: bool,
    #[serde(default)]
    pub staging_space_guids: Vec<String>,
    #[serde(default)]
    pub running_space_guids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SecurityGroupPage {
    #[serde(default)]
    next: u64,
    #[serde(default)]
    security_groups: Vec<SecurityGroup>,
}

#[derive(Debug, Deserialize)]
struct Health {
    healthcheck: bool,
}

#[async_trait]
pub trait PolicyServiceClient: Send + Sync {
    /// Policies whose source or destination is any of `ids`
    async fn policies_by_id(&self, ids: &[String]) -> PolicyClientResult<PolicySet>;

    /// Tag of `(id, tag_type)`, allocating one on first use
    async fn create_or_get_tag(&self, id: &str, tag_type: &str) -> PolicyClientResult<String>;

    /// Every security group, all pages
    async fn security_groups(&self) -> PolicyClientResult<Vec<SecurityGroup>>;

    async fn healthcheck(&self) -> PolicyClientResult<bool>;
}

pub struct HttpPolicyServiceClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpPolicyServiceClient {
    /// Client with optional client-certificate identity and pinned CA. Empty
    /// paths leave the corresponding TLS material out.
    pub fn new(
        base_url: &str,
        client_cert_file: &str,
        client_key_file: &str,
        ca_cert_file: &str,
        timeout: Duration,
    ) -> PolicyClientResult<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .connect_timeout(timeout);

        if !client_cert_file.is_empty() {
            let mut pem = read_pem(client_cert_file)?;
            pem.extend(read_pem(client_key_file)?);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| PolicyClientError::Tls(format!("client identity: {}", e)))?;
            builder = builder.identity(identity);
        }
        if !ca_cert_file.is_empty() {
            let ca = reqwest::Certificate::from_pem(&read_pem(ca_cert_file)?)
                .map_err(|e| PolicyClientError::Tls(format!("ca certificate: {}", e)))?;
            builder = builder.tls_built_in_root_certs(false).add_root_certificate(ca);
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: builder.build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> PolicyClientResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PolicyClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

fn read_pem(path: &str) -> PolicyClientResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| PolicyClientError::Tls(format!("reading {}: {}", path, e)))
}

#[async_trait]
impl PolicyServiceClient for HttpPolicyServiceClient {
    async fn policies_by_id(&self, ids: &[String]) -> PolicyClientResult<PolicySet> {
        let response = self
            .http
            .get(self.url(POLICIES_PATH))
            .query(&[("id", ids.join(","))])
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn create_or_get_tag(&self, id: &str, tag_type: &str) -> PolicyClientResult<String> {
        let response = self
            .http
            .put(self.url(TAGS_PATH))
            .json(&serde_json::json!({ "id": id, "type": tag_type }))
            .send()
            .await?;
        let tag: Tag = Self::decode(response).await?;
        Ok(tag.tag)
    }

    async fn security_groups(&self) -> PolicyClientResult<Vec<SecurityGroup>> {
        let mut groups = Vec::new();
        let mut from = 0u64;
        loop {
            let mut request = self.http.get(self.url(SECURITY_GROUPS_PATH));
            if from > 0 {
                request = request.query(&[("from", from)]);
            }
            let page: SecurityGroupPage = Self::decode(request.send().await?).await?;
            groups.extend(page.security_groups);
            if page.next == 0 || page.next == from {
                break;
            }
            from = page.next;
        }
        Ok(groups)
    }

    async fn healthcheck(&self) -> PolicyClientResult<bool> {
        let response = self.http.get(self.url(HEALTHCHECK_PATH)).send().await?;
        let health: Health = Self::decode(response).await?;
        Ok(health.healthcheck)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Canned policy service; counts calls so tests can assert on skips.
    #[derive(Default)]
    pub(crate) struct FakePolicyService {
        pub policies: Mutex<PolicySet>,
        pub groups: Mutex<Vec<SecurityGroup>>,
        pub tags: Mutex<HashMap<String, String>>,
        pub policy_calls: Mutex<Vec<Vec<String>>>,
        pub fail: Mutex<bool>,
    }

    #[async_trait]
    impl PolicyServiceClient for Arc<FakePolicyService> {
        async fn policies_by_id(&self, ids: &[String]) -> PolicyClientResult<PolicySet> {
            self.policy_calls.lock().push(ids.to_vec());
            if *self.fail.lock() {
                return Err(PolicyClientError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(self.policies.lock().clone())
        }

        async fn create_or_get_tag(&self, id: &str, _tag_type: &str) -> PolicyClientResult<String> {
            Ok(self
                .tags
                .lock()
                .get(id)
                .cloned()
                .unwrap_or_else(|| "FF".to_string()))
        }

        async fn security_groups(&self) -> PolicyClientResult<Vec<SecurityGroup>> {
            Ok(self.groups.lock().clone())
        }

        async fn healthcheck(&self) -> PolicyClientResult<bool> {
            Ok(!*self.fail.lock())
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(base: &str) -> HttpPolicyServiceClient {
        HttpPolicyServiceClient::new(base, "", "", "", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_policies_pass_ids_as_csv() {
        let app = Router::new().route(
            POLICIES_PATH,
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let ids = q.get("id").cloned().unwrap_or_default();
                Json(json!({
                    "total_policies": 1,
                    "policies": [{
                        "source": {"id": ids, "tag": "AA"},
                        "destination": {"id": "b", "tag": "BB", "protocol": "tcp", "ports": {"start": 8080, "end": 8080}}
                    }],
                    "total_egress_policies": 0,
                    "egress_policies": []
                }))
            }),
        );
        let base = serve(app).await;

        let set = client(&base)
            .policies_by_id(&["a".to_string(), "space-1".to_string()])
            .await
            .unwrap();
        assert_eq!(set.policies[0].source.id, "a,space-1");
        assert_eq!(set.policies[0].destination.ports, PortRange { start: 8080, end: 8080 });
    }

    #[tokio::test]
    async fn test_security_groups_follow_pages() {
        let app = Router::new().route(
            SECURITY_GROUPS_PATH,
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let page: Value = match q.get("from").map(String::as_str) {
                    None => json!({"next": 2, "security_groups": [{"guid": "sg-1"}]}),
                    Some("2") => json!({"next": 0, "security_groups": [{"guid": "sg-2"}]}),
                    Some(_) => json!({"next": 0, "security_groups": []}),
                };
                Json(page)
            }),
        );
        let base = serve(app).await;

        let groups = client(&base).security_groups().await.unwrap();
        let guids: Vec<&str> = groups.iter().map(|g| g.guid.as_str()).collect();
        assert_eq!(guids, vec!["sg-1", "sg-2"]);
    }

    #[tokio::test]
    async fn test_tags_and_health() {
        let app = Router::new()
            .route(
                TAGS_PATH,
                axum::routing::put(|Json(body): Json<Value>| async move {
                    Json(json!({"id": body["id"], "type": body["type"], "tag": "0004"}))
                }),
            )
            .route(HEALTHCHECK_PATH, get(|| async { Json(json!({"healthcheck": true})) }));
        let base = serve(app).await;

        let client = client(&base);
        assert_eq!(
            client.create_or_get_tag("INGRESS_ROUTER", "router").await.unwrap(),
            "0004"
        );
        assert!(client.healthcheck().await.unwrap());
    }

    #[tokio::test]
    async fn test_error_status_carries_body() {
        let app = Router::new().route(
            HEALTHCHECK_PATH,
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "db down") }),
        );
        let base = serve(app).await;

        let err = client(&base).healthcheck().await.unwrap_err();
        assert_eq!(err.to_string(), "unexpected status 503: db down");
    }

    #[test]
    fn test_missing_tls_material() {
        let err = HttpPolicyServiceClient::new(
            "https://policy",
            "/nonexistent/client.crt",
            "/nonexistent/client.key",
            "",
            Duration::from_secs(1),
        )
        .err()
        .unwrap();
        assert!(err.to_string().starts_with("tls material: reading /nonexistent/client.crt"));
    }
}
