//! CNI result documents.
//!
//! The delegate may answer in any supported version; results are normalised
//! into `CniResult` and re-encoded to whatever version the runtime asked for.
//! `0.1.0`/`0.2.0` use the legacy `ip4` object, `0.3.x`/`0.4.0` tag each IP
//! with a `version`, and `1.0.0` drops it again.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0", "1.0.0"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpConfig {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CniResult {
    pub interfaces: Vec<Interface>,
    pub ips: Vec<IpConfig>,
    pub routes: Vec<Route>,
    pub dns: Dns,
}

#[derive(Deserialize)]
struct Legacy {
    ip: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Deserialize)]
struct RawResult {
    #[serde(default)]
    interfaces: Vec<Interface>,
    #[serde(default)]
    ips: Vec<IpConfig>,
    #[serde(default)]
    routes: Vec<Route>,
    #[serde(default)]
    dns: Dns,
    #[serde(default)]
    ip4: Option<Legacy>,
}

impl CniResult {
    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        let raw: RawResult = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        let mut result = CniResult {
            interfaces: raw.interfaces,
            ips: raw.ips,
            routes: raw.routes,
            dns: raw.dns,
        };

        if result.ips.is_empty() {
            if let Some(ip4) = raw.ip4 {
                result.ips.push(IpConfig {
                    address: ip4.ip,
                    gateway: ip4.gateway,
                    interface: None,
                });
                result.routes.extend(ip4.routes);
            }
        }
        Ok(result)
    }

    /// Address of the first IP entry with any prefix length removed
    pub fn first_ip(&self) -> Option<String> {
        self.ips
            .first()
            .map(|ip| ip.address.split('/').next().unwrap_or_default().to_string())
            .filter(|ip| !ip.is_empty())
    }

    pub fn encode(&self, version: &str) -> Result<Value, String> {
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(format!("unsupported CNI version {}", version));
        }

        let dns = serde_json::to_value(&self.dns).map_err(|e| e.to_string())?;

        if version == "0.1.0" || version == "0.2.0" {
            let ip4 = self.ips.first().map(|ip| {
                json!({
                    "ip": ip.address,
                    "gateway": ip.gateway,
                    "routes": self.routes,
                })
            });
            return Ok(json!({
                "cniVersion": version,
                "ip4": ip4,
                "dns": dns,
            }));
        }

        let tag_version = version.starts_with("0.3") || version.starts_with("0.4");
        let mut ips = Vec::with_capacity(self.ips.len());
        for ip in &self.ips {
            let mut value = serde_json::to_value(ip).map_err(|e| e.to_string())?;
            if tag_version {
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("version".to_string(), json!("4"));
                }
            }
            ips.push(value);
        }

        Ok(json!({
            "cniVersion": version,
            "interfaces": self.interfaces,
            "ips": ips,
            "routes": self.routes,
            "dns": dns,
        }))
    }
}
