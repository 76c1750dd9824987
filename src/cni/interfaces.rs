use async_trait::async_trait;
use futures::TryStreamExt;
use netlink_packet_route::address::nlas::Nla as AddressNla;
use netlink_packet_route::link::nlas::Nla as LinkNla;
use std::net::Ipv4Addr;

/// Resolves underlay IPs to the names of the host interfaces carrying them.
#[async_trait]
pub trait InterfaceNameLookup: Send + Sync {
    async fn names_for_ips(&self, ips: &[String]) -> Result<Vec<String>, String>;
}

/// Lookup via an rtnetlink address dump.
pub struct NetlinkInterfaceLookup;

impl NetlinkInterfaceLookup {
    async fn index_for_ip(handle: &rtnetlink::Handle, ip: Ipv4Addr) -> Result<u32, String> {
        let mut addresses = handle.address().get().execute();
        while let Some(msg) = addresses.try_next().await.map_err(|e| e.to_string())? {
            let matches = msg.nlas.iter().any(|nla| match nla {
                AddressNla::Address(bytes) | AddressNla::Local(bytes) => {
                    bytes.len() == 4 && Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]) == ip
                }
                _ => false,
            });
            if matches {
                return Ok(msg.header.index);
            }
        }
        Err(format!("no interface has address {}", ip))
    }

    async fn resolve_all(handle: &rtnetlink::Handle, ips: &[String]) -> Result<Vec<String>, String> {
        let mut names = Vec::with_capacity(ips.len());
        for ip in ips {
            let parsed: Ipv4Addr = ip
                .parse()
                .map_err(|_| format!("invalid underlay ip: {}", ip))?;
            let index = Self::index_for_ip(handle, parsed).await?;
            names.push(Self::name_for_index(handle, index).await?);
        }
        Ok(names)
    }

    async fn name_for_index(handle: &rtnetlink::Handle, index: u32) -> Result<String, String> {
        let mut links = handle.link().get().match_index(index).execute();
        match links.try_next().await.map_err(|e| e.to_string())? {
            Some(msg) => msg
                .nlas
                .into_iter()
                .find_map(|nla| match nla {
                    LinkNla::IfName(name) => Some(name),
                    _ => None,
                })
                .ok_or_else(|| format!("link {} has no name", index)),
            None => Err(format!("link {} not found", index)),
        }
    }
}

#[async_trait]
impl InterfaceNameLookup for NetlinkInterfaceLookup {
    async fn names_for_ips(&self, ips: &[String]) -> Result<Vec<String>, String> {
        if ips.is_empty() {
            return Ok(Vec::new());
        }

        let (conn, handle, _) = rtnetlink::new_connection().map_err(|e| e.to_string())?;
        let conn_task = tokio::spawn(conn);

        let result = Self::resolve_all(&handle, ips).await;
        conn_task.abort();
        result
    }
}

/// `temporary_underlay_interface_names` wins when set; otherwise resolve `underlay_ips`.
pub async fn resolve_underlays(
    lookup: &dyn InterfaceNameLookup,
    overrides: &[String],
    underlay_ips: &[String],
) -> Result<Vec<String>, String> {
    if !overrides.is_empty() {
        return Ok(overrides.to_vec());
    }
    lookup.names_for_ips(underlay_ips).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    pub(crate) struct FakeLookup(pub HashMap<String, String>);

    #[async_trait]
    impl InterfaceNameLookup for FakeLookup {
        async fn names_for_ips(&self, ips: &[String]) -> Result<Vec<String>, String> {
            ips.iter()
                .map(|ip| {
                    self.0
                        .get(ip)
                        .cloned()
                        .ok_or_else(|| format!("no interface has address {}", ip))
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_overrides_win() {
        let lookup = FakeLookup(HashMap::new());
        let names = resolve_underlays(&lookup, &["underlay1".to_string()], &["10.0.0.1".to_string()])
            .await
            .unwrap();
        assert_eq!(names, vec!["underlay1"]);
    }

    #[tokio::test]
    async fn test_lookup_used_without_overrides() {
        let lookup = FakeLookup(HashMap::from([("10.0.0.1".to_string(), "eth0".to_string())]));
        let names = resolve_underlays(&lookup, &[], &["10.0.0.1".to_string()])
            .await
            .unwrap();
        assert_eq!(names, vec!["eth0"]);
        assert!(resolve_underlays(&lookup, &[], &["10.0.0.9".to_string()])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_netlink_lookup_of_no_ips_is_empty() {
        let names = NetlinkInterfaceLookup.names_for_ips(&[]).await.unwrap();
        assert!(names.is_empty());
    }
}
