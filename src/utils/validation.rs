use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

pub struct InputValidator;

impl InputValidator {
    /// Parse `host:port` pairs such as `169.254.0.2:9001`
    pub fn parse_host_port(s: &str) -> Result<(Ipv4Addr, u16), String> {
        let pos = s
            .rfind(':')
            .ok_or_else(|| format!("Invalid HOST:PORT format: '{}'", s))?;

        let host = s[..pos].trim();
        let port = s[pos + 1..].trim();

        let host: Ipv4Addr = host
            .parse()
            .map_err(|_| format!("Invalid host in '{}'", s))?;
        let port: u16 = port
            .parse()
            .map_err(|_| format!("Invalid port in '{}'", s))?;

        Ok((host, port))
    }

    pub fn parse_cidr(s: &str) -> Result<Ipv4Net, String> {
        s.trim()
            .parse::<Ipv4Net>()
            .map_err(|e| format!("Invalid CIDR '{}': {}", s, e))
    }

    /// Parse an IPv4 address, tolerating a `/prefix` suffix
    pub fn parse_ip(s: &str) -> Result<Ipv4Addr, String> {
        let bare = s.split('/').next().unwrap_or(s).trim();
        bare.parse::<Ipv4Addr>()
            .map_err(|_| format!("invalid ip: {}", s))
    }

    pub fn is_link_local(s: &str) -> bool {
        Self::parse_ip(s).map(|ip| ip.is_link_local()).unwrap_or(false)
    }

    /// Parse a comma-separated list of decimal ports, skipping blanks
    pub fn parse_port_list(s: &str) -> Result<Vec<u16>, String> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<u16>().map_err(|_| format!("Invalid port '{}'", p)))
            .collect()
    }

    /// Parse a comma-separated destination list into inclusive address ranges.
    /// Entries are a CIDR, an `a-b` range, or a single address.
    pub fn parse_ip_ranges(s: &str) -> Result<Vec<(Ipv4Addr, Ipv4Addr)>, String> {
        s.split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(|d| {
                if d.contains('/') {
                    let net = Self::parse_cidr(d)?;
                    Ok((net.network(), net.broadcast()))
                } else if let Some((start, end)) = d.split_once('-') {
                    let start = Self::parse_ip(start)?;
                    let end = Self::parse_ip(end)?;
                    if start > end {
                        return Err(format!("Invalid range '{}'", d));
                    }
                    Ok((start, end))
                } else {
                    let ip = Self::parse_ip(d)?;
                    Ok((ip, ip))
                }
            })
            .collect()
    }

    /// Parse `p`, `a-b` or comma lists of either into inclusive port ranges
    pub fn parse_port_ranges(s: &str) -> Result<Vec<(u16, u16)>, String> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| {
                let port = |v: &str| {
                    v.trim()
                        .parse::<u16>()
                        .map_err(|_| format!("Invalid port '{}'", p))
                };
                match p.split_once('-') {
                    Some((start, end)) => {
                        let (start, end) = (port(start)?, port(end)?);
                        if start > end {
                            return Err(format!("Invalid port range '{}'", p));
                        }
                        Ok((start, end))
                    }
                    None => port(p).map(|v| (v, v)),
                }
            })
            .collect()
    }
}
