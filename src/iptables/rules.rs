//! Rule vocabulary: one constructor per semantic intent.
//!
//! Every constructor emits a fixed argument order so that rules built twice
//! from the same inputs compare equal, and so that `delete`/`exists` match
//! what was appended. Host addresses are rendered as `<ip>/32`, the form
//! `iptables -S` prints them back in.

use crate::iptables::IpTablesRule;

/// iptables caps --log-prefix at 29 bytes including the terminator
pub const MAX_LOG_PREFIX_LENGTH: usize = 28;

/// `<ip>/32` for bare addresses, CIDRs pass through
pub fn host(ip: &str) -> String {
    if ip.contains('/') {
        ip.to_string()
    } else {
        format!("{}/32", ip)
    }
}

/// `0x<hex>`, tolerating tags that already carry the prefix
pub fn hex_tag(tag: &str) -> String {
    let bare = tag
        .strip_prefix("0x")
        .or_else(|| tag.strip_prefix("0X"))
        .unwrap_or(tag);
    format!("0x{}", bare)
}

/// Trim to the prefix budget (one byte kept for the trailing space), pad, and quote.
pub fn log_prefix(name: &str) -> String {
    let mut end = name.len().min(MAX_LOG_PREFIX_LENGTH - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    format!("\"{} \"", &name[..end])
}

fn port_range(start: u16, end: u16) -> String {
    if start == end || end == 0 {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}

fn icmp_type_arg(icmp_type: i32, icmp_code: i32) -> String {
    if icmp_type < 0 {
        "any".to_string()
    } else if icmp_code < 0 {
        icmp_type.to_string()
    } else {
        format!("{}/{}", icmp_type, icmp_code)
    }
}

fn limit_args(rate_per_sec: u32) -> Vec<String> {
    vec![
        "-m".to_string(),
        "limit".to_string(),
        "--limit".to_string(),
        format!("{}/s", rate_per_sec),
        "--limit-burst".to_string(),
        rate_per_sec.to_string(),
    ]
}

fn log_target(name: &str) -> Vec<String> {
    vec![
        "-j".to_string(),
        "LOG".to_string(),
        "--log-prefix".to_string(),
        log_prefix(name),
    ]
}

// ── NAT / mangle ─────────────────────────────────────────────────────

pub fn new_default_egress_rule(
    source_ip: &str,
    vtep_device: &str,
    no_masquerade_cidr: Option<&str>,
) -> IpTablesRule {
    let src = host(source_ip);
    let mut args = vec!["-s", src.as_str()];
    if let Some(cidr) = no_masquerade_cidr {
        args.extend(["!", "-d", cidr]);
    }
    args.extend(["!", "-o", vtep_device, "-j", "MASQUERADE"]);
    IpTablesRule::new(&args)
}

pub fn new_port_forwarding_rule(
    host_port: u16,
    container_port: u16,
    host_ip: &str,
    container_ip: &str,
) -> IpTablesRule {
    IpTablesRule::new(&[
        "-d",
        &host(host_ip),
        "-p",
        "tcp",
        "-m",
        "tcp",
        "--dport",
        &host_port.to_string(),
        "-j",
        "DNAT",
        "--to-destination",
        &format!("{}:{}", container_ip, container_port),
    ])
}

pub fn new_ingress_mark_rule(
    interface: &str,
    host_port: u16,
    host_ip: &str,
    tag: &str,
) -> IpTablesRule {
    IpTablesRule::new(&[
        "-i",
        interface,
        "-d",
        &host(host_ip),
        "-p",
        "tcp",
        "-m",
        "tcp",
        "--dport",
        &host_port.to_string(),
        "-j",
        "MARK",
        "--set-xmark",
        &format!("{}/0xffffffff", hex_tag(tag)),
    ])
}

// ── Jumps ────────────────────────────────────────────────────────────

pub fn new_jump_rule(chain: &str) -> IpTablesRule {
    IpTablesRule::new(&["-j", chain])
}

pub fn new_source_jump_rule(source_ip: &str, chain: &str) -> IpTablesRule {
    IpTablesRule::new(&["-s", &host(source_ip), "-j", chain])
}

pub fn new_net_out_jump_condition_rule(
    interface: &str,
    container_ip: &str,
    chain: &str,
) -> IpTablesRule {
    IpTablesRule::new(&["-s", &host(container_ip), "-o", interface, "-j", chain])
}

// ── Marks (C2C) ──────────────────────────────────────────────────────

pub fn new_mark_set_rule(source_ip: &str, tag: &str, app_id: &str) -> IpTablesRule {
    IpTablesRule::new(&[
        "-s",
        &host(source_ip),
        "-m",
        "comment",
        "--comment",
        &format!("src:{}", app_id),
        "-j",
        "MARK",
        "--set-xmark",
        &format!("{}/0xffffffff", hex_tag(tag)),
    ])
}

fn mark_match_args(
    dest_ip: &str,
    protocol: &str,
    start_port: u16,
    end_port: u16,
    tag: &str,
) -> Vec<String> {
    vec![
        "-d".to_string(),
        host(dest_ip),
        "-p".to_string(),
        protocol.to_string(),
        "-m".to_string(),
        protocol.to_string(),
        "--dport".to_string(),
        port_range(start_port, end_port),
        "-m".to_string(),
        "mark".to_string(),
        "--mark".to_string(),
        hex_tag(tag),
    ]
}

pub fn new_mark_allow_rule(
    dest_ip: &str,
    protocol: &str,
    start_port: u16,
    end_port: u16,
    tag: &str,
    source_app_id: &str,
    dest_app_id: &str,
) -> IpTablesRule {
    let mut args = mark_match_args(dest_ip, protocol, start_port, end_port, tag);
    args.extend([
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        format!("src:{}_dst:{}", source_app_id, dest_app_id),
        "-j".to_string(),
        "ACCEPT".to_string(),
    ]);
    IpTablesRule::from_args(args)
}

/// Same match as `new_mark_allow_rule`, logging instead of accepting; it is
/// placed directly before the allow rule it shadows.
pub fn new_mark_allow_log_rule(
    dest_ip: &str,
    protocol: &str,
    start_port: u16,
    end_port: u16,
    tag: &str,
    dest_app_id: &str,
    rate_per_sec: u32,
) -> IpTablesRule {
    let mut args = mark_match_args(dest_ip, protocol, start_port, end_port, tag);
    args.extend(limit_args(rate_per_sec));
    let bare_tag = hex_tag(tag);
    args.extend(log_target(&format!("OK_{}_{}", &bare_tag[2..], dest_app_id)));
    IpTablesRule::from_args(args)
}

pub fn new_mark_allow_no_comment_rule(
    dest_ip: &str,
    protocol: &str,
    port: u16,
    tag: &str,
) -> IpTablesRule {
    let mut args = mark_match_args(dest_ip, protocol, port, port, tag);
    args.extend(["-j".to_string(), "ACCEPT".to_string()]);
    IpTablesRule::from_args(args)
}

// ── Net-out (egress) ─────────────────────────────────────────────────

/// Target of an egress allow: accept directly, or hand to the log chain which accepts.
#[derive(Debug, Clone, Copy)]
pub enum Verdict<'a> {
    Accept,
    Log(&'a str),
}

impl Verdict<'_> {
    fn args(&self) -> Vec<String> {
        match self {
            Verdict::Accept => vec!["-j".to_string(), "ACCEPT".to_string()],
            Verdict::Log(chain) => vec!["-j".to_string(), chain.to_string()],
        }
    }
}

fn range_args(start_ip: &str, end_ip: &str) -> Vec<String> {
    vec![
        "-m".to_string(),
        "iprange".to_string(),
        "--dst-range".to_string(),
        format!("{}-{}", start_ip, end_ip),
    ]
}

pub fn new_net_out_rule(start_ip: &str, end_ip: &str, verdict: Verdict) -> IpTablesRule {
    let mut args = range_args(start_ip, end_ip);
    args.extend(verdict.args());
    IpTablesRule::from_args(args)
}

pub fn new_net_out_with_port_rule(
    start_ip: &str,
    end_ip: &str,
    start_port: u16,
    end_port: u16,
    protocol: &str,
    verdict: Verdict,
) -> IpTablesRule {
    let mut args = vec!["-p".to_string(), protocol.to_string()];
    args.extend(range_args(start_ip, end_ip));
    args.extend([
        "-m".to_string(),
        protocol.to_string(),
        "--destination-port".to_string(),
        port_range(start_port, end_port),
    ]);
    args.extend(verdict.args());
    IpTablesRule::from_args(args)
}

pub fn new_net_out_icmp_rule(
    start_ip: &str,
    end_ip: &str,
    icmp_type: i32,
    icmp_code: i32,
    verdict: Verdict,
) -> IpTablesRule {
    let mut args = vec!["-p".to_string(), "icmp".to_string()];
    args.extend(range_args(start_ip, end_ip));
    args.extend([
        "-m".to_string(),
        "icmp".to_string(),
        "--icmp-type".to_string(),
        icmp_type_arg(icmp_type, icmp_code),
    ]);
    args.extend(verdict.args());
    IpTablesRule::from_args(args)
}

/// Scope an egress rule to one container leaving through one underlay interface.
pub fn scoped_to_interface(container_ip: &str, interface: &str, rule: IpTablesRule) -> IpTablesRule {
    let mut args = vec![
        "-s".to_string(),
        host(container_ip),
        "-o".to_string(),
        interface.to_string(),
    ];
    args.extend(rule.args().iter().cloned());
    IpTablesRule::from_args(args)
}

pub fn new_net_out_related_established_rule() -> IpTablesRule {
    IpTablesRule::new(&["-m", "state", "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT"])
}

pub fn new_net_out_invalid_rule() -> IpTablesRule {
    IpTablesRule::new(&["-p", "tcp", "-m", "state", "--state", "INVALID", "-j", "DROP"])
}

pub fn new_net_out_default_reject_rule() -> IpTablesRule {
    IpTablesRule::new(&["-j", "REJECT", "--reject-with", "icmp-port-unreachable"])
}

pub fn new_reject_network_rule(cidr: &str) -> IpTablesRule {
    IpTablesRule::new(&[
        "-d",
        cidr,
        "-j",
        "REJECT",
        "--reject-with",
        "icmp-port-unreachable",
    ])
}

pub fn new_accept_rule() -> IpTablesRule {
    IpTablesRule::new(&["-j", "ACCEPT"])
}

pub fn new_net_out_default_non_udp_log_rule(name: &str) -> IpTablesRule {
    let mut args = vec![
        "!".to_string(),
        "-p".to_string(),
        "udp".to_string(),
        "-m".to_string(),
        "conntrack".to_string(),
        "--ctstate".to_string(),
        "INVALID,NEW,UNTRACKED".to_string(),
    ];
    args.extend(log_target(&format!("OK_{}", name)));
    IpTablesRule::from_args(args)
}

pub fn new_net_out_default_udp_log_rule(name: &str, rate_per_sec: u32) -> IpTablesRule {
    let mut args = vec!["-p".to_string(), "udp".to_string()];
    args.extend(limit_args(rate_per_sec));
    args.extend(log_target(&format!("OK_{}", name)));
    IpTablesRule::from_args(args)
}

/// Rate-limited LOG with a `<category>_<name>` prefix and optional leading matches.
pub fn new_log_rule(matches: &[&str], category: &str, name: &str, rate_per_sec: u32) -> IpTablesRule {
    let mut args: Vec<String> = matches.iter().map(|s| s.to_string()).collect();
    args.extend(limit_args(rate_per_sec));
    args.extend(log_target(&format!("{}_{}", category, name)));
    IpTablesRule::from_args(args)
}

/// hashlimit table names are capped at 15 bytes by the kernel
const MAX_HASHLIMIT_NAME_LENGTH: usize = 15;

/// Outbound connection rate limit: NEW TCP connections above `rate/sec` per
/// destination ip:port jump to `target` (the rate-limit log chain or REJECT).
pub fn new_net_out_conn_rate_limit_rule(
    rate_per_sec: u32,
    burst: u32,
    container_handle: &str,
    target: &str,
) -> IpTablesRule {
    let expiry_ms = ((burst as u64).div_ceil(rate_per_sec.max(1) as u64)) * 1000;
    let name: String = container_handle
        .chars()
        .take(MAX_HASHLIMIT_NAME_LENGTH)
        .collect();

    let mut args = vec![
        "-p".to_string(),
        "tcp".to_string(),
        "-m".to_string(),
        "conntrack".to_string(),
        "--ctstate".to_string(),
        "NEW".to_string(),
        "-m".to_string(),
        "hashlimit".to_string(),
        "--hashlimit-above".to_string(),
        format!("{}/sec", rate_per_sec),
        "--hashlimit-burst".to_string(),
        burst.to_string(),
        "--hashlimit-mode".to_string(),
        "dstip,dstport".to_string(),
        "--hashlimit-name".to_string(),
        name,
        "--hashlimit-htable-expire".to_string(),
        expiry_ms.to_string(),
        "-j".to_string(),
        target.to_string(),
    ];
    if target == "REJECT" {
        args.extend([
            "--reject-with".to_string(),
            "icmp-port-unreachable".to_string(),
        ]);
    }
    IpTablesRule::from_args(args)
}

// ── Overlay ──────────────────────────────────────────────────────────

pub fn new_overlay_allow_egress_rule(container_ip: &str, vtep_device: &str) -> IpTablesRule {
    IpTablesRule::new(&[
        "-s",
        &host(container_ip),
        "-o",
        vtep_device,
        "-m",
        "mark",
        "!",
        "--mark",
        "0x0",
        "-j",
        "ACCEPT",
    ])
}

pub fn new_overlay_related_established_rule(container_ip: &str) -> IpTablesRule {
    IpTablesRule::new(&[
        "-d",
        &host(container_ip),
        "-m",
        "state",
        "--state",
        "RELATED,ESTABLISHED",
        "-j",
        "ACCEPT",
    ])
}

pub fn new_overlay_tag_accept_rule(container_ip: &str, tag: &str) -> IpTablesRule {
    IpTablesRule::new(&[
        "-d",
        &host(container_ip),
        "-m",
        "mark",
        "--mark",
        &hex_tag(tag),
        "-j",
        "ACCEPT",
    ])
}

pub fn new_overlay_default_reject_rule(container_ip: &str) -> IpTablesRule {
    IpTablesRule::new(&[
        "-d",
        &host(container_ip),
        "-j",
        "REJECT",
        "--reject-with",
        "icmp-port-unreachable",
    ])
}

pub fn new_overlay_default_reject_log_rule(
    container_ip: &str,
    name: &str,
    rate_per_sec: u32,
) -> IpTablesRule {
    let dest = host(container_ip);
    new_log_rule(&["-d", &dest], "DENY_C2C", name, rate_per_sec)
}

pub fn new_overlay_allow_all_rule(overlay_cidr: &str) -> IpTablesRule {
    IpTablesRule::new(&["-s", overlay_cidr, "-d", overlay_cidr, "-j", "ACCEPT"])
}

// ── Input ────────────────────────────────────────────────────────────

pub fn new_input_related_established_rule() -> IpTablesRule {
    IpTablesRule::new(&["-m", "state", "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT"])
}

pub fn new_input_allow_rule(protocol: &str, dest_ip: &str, port: u16) -> IpTablesRule {
    IpTablesRule::new(&[
        "-p",
        protocol,
        "-d",
        &host(dest_ip),
        "-m",
        protocol,
        "--dport",
        &port.to_string(),
        "-j",
        "ACCEPT",
    ])
}

pub fn new_input_default_reject_rule() -> IpTablesRule {
    IpTablesRule::new(&["-j", "REJECT", "--reject-with", "icmp-port-unreachable"])
}
