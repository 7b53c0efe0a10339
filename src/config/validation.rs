//! Configuration validation

use std::collections::{BTreeMap, BTreeSet};

use super::{DomainConfig, RouterConfig};
use crate::dataplane::PortRange;

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &RouterConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.report.interval_sec == 0 {
        result.error("report.interval_sec must be greater than 0");
    }

    let domains = validate_names(config, &mut result);
    for domain in &config.domains {
        validate_references(domain, &domains, &mut result);
        validate_ip_config(domain, &domains, &mut result);
        validate_dhcp_server(domain, &mut result);
        validate_rules(domain, &mut result);
    }
    validate_ip_config_cycles(&domains, &mut result);

    for attach in &config.attachments {
        if !domains.contains_key(attach.domain.as_str()) {
            result.warn(format!(
                "attach.{}: domain '{}' does not exist, frames will be dropped",
                attach.device, attach.domain
            ));
        }
    }

    result
}

fn validate_names<'a>(
    config: &'a RouterConfig,
    result: &mut ValidationResult,
) -> BTreeMap<&'a str, &'a DomainConfig> {
    let mut domains = BTreeMap::new();
    for domain in &config.domains {
        if domain.name.is_empty() {
            result.error("domain with empty name");
            continue;
        }
        if domains.insert(domain.name.as_str(), domain).is_some() {
            result.error(format!("domain '{}' defined twice", domain.name));
        }
    }
    domains
}

fn validate_references(
    domain: &DomainConfig,
    domains: &BTreeMap<&str, &DomainConfig>,
    result: &mut ValidationResult,
) {
    let mut reported = BTreeSet::new();
    for name in domain.referenced_domains() {
        if !domains.contains_key(name) && reported.insert(name) {
            result.error(format!(
                "domain '{}': references unknown domain '{}'",
                domain.name, name
            ));
        }
    }
}

fn validate_ip_config(
    domain: &DomainConfig,
    domains: &BTreeMap<&str, &DomainConfig>,
    result: &mut ValidationResult,
) {
    let name = &domain.name;
    if let Some(cidr) = domain.interface {
        if cidr.addr() == cidr.network() || cidr.addr() == cidr.broadcast() {
            if cidr.prefix_len() < 31 {
                result.error(format!("domain '{name}': interface {cidr} is not a host address"));
            }
        }
        if let Some(gateway) = domain.gateway {
            if !cidr.contains(gateway) {
                result.error(format!(
                    "domain '{name}': gateway {gateway} outside of {cidr}"
                ));
            }
        }
        if domain.ip_config_from.is_some() {
            result.error(format!(
                "domain '{name}': static interface conflicts with ip_config_from"
            ));
        }
    } else {
        if domain.gateway.is_some() || domain.dns_server.is_some() {
            result.warn(format!(
                "domain '{name}': gateway/dns_server ignored without interface"
            ));
        }
        if domain.ip_config_from.as_deref() == Some(name.as_str()) {
            result.error(format!("domain '{name}': ip_config_from names itself"));
        }
    }
    if let Some(supplier) = domain.ip_config_from.as_deref() {
        if let Some(supplier) = domains.get(supplier) {
            if supplier.dhcp_server.is_some() {
                result.warn(format!(
                    "domain '{name}': supplier '{}' also serves DHCP",
                    supplier.name
                ));
            }
        }
    }
}

fn validate_dhcp_server(domain: &DomainConfig, result: &mut ValidationResult) {
    let Some(dhcp) = &domain.dhcp_server else {
        return;
    };
    let name = &domain.name;
    let Some(cidr) = domain.interface else {
        result.error(format!(
            "domain '{name}': DHCP server requires a static interface"
        ));
        return;
    };
    if dhcp.ip_first > dhcp.ip_last {
        result.error(format!(
            "domain '{name}': DHCP range start {} > end {}",
            dhcp.ip_first, dhcp.ip_last
        ));
    }
    if !cidr.contains(dhcp.ip_first) || !cidr.contains(dhcp.ip_last) {
        result.error(format!("domain '{name}': DHCP range outside of {cidr}"));
    }
    let router_ip = cidr.addr();
    if dhcp.ip_first <= router_ip && router_ip <= dhcp.ip_last {
        result.warn(format!(
            "domain '{name}': DHCP range contains router address {router_ip}, it is skipped"
        ));
    }
    if dhcp.dns_server.is_some() && dhcp.dns_server_from.is_some() {
        result.warn(format!(
            "domain '{name}': dns_server_from overrides dns_server"
        ));
    }
    if dhcp.ip_lease_time_sec == 0 {
        result.error(format!("domain '{name}': DHCP lease time must be > 0"));
    }
}

fn validate_rules(domain: &DomainConfig, result: &mut ValidationResult) {
    let name = &domain.name;
    for (proto, rules) in [("tcp", &domain.tcp), ("udp", &domain.udp)] {
        for rule in rules {
            if rule.permit_any.is_none() && rule.permit.is_empty() {
                result.error(format!(
                    "domain '{name}': {proto} rule for {} permits nothing",
                    rule.dst
                ));
            }
            for permit in &rule.permit {
                if let Err(e) = permit.ports.parse::<PortRange>() {
                    result.error(format!("domain '{name}': {proto} rule for {}: {e}", rule.dst));
                }
            }
        }
    }
    for (proto, rules) in [("tcp", &domain.tcp_forward), ("udp", &domain.udp_forward)] {
        let mut ports = BTreeSet::new();
        for rule in rules {
            if rule.port == 0 || rule.to_port == Some(0) {
                result.error(format!("domain '{name}': {proto} forward uses port 0"));
            }
            if !ports.insert(rule.port) {
                result.error(format!(
                    "domain '{name}': {proto} port {} forwarded twice",
                    rule.port
                ));
            }
        }
    }
    if !domain.tcp_forward.is_empty() || !domain.udp_forward.is_empty() {
        if domain.dhcp_server.is_some() && domain.udp_forward.iter().any(|f| f.port == 67) {
            result.warn(format!(
                "domain '{name}': udp forward of port 67 is shadowed by the DHCP server"
            ));
        }
    }
    let mut nat = BTreeSet::new();
    for rule in &domain.nat {
        if !nat.insert(rule.domain.as_str()) {
            result.error(format!(
                "domain '{name}': NAT for '{}' defined twice",
                rule.domain
            ));
        }
        if rule.domain == *name {
            result.error(format!("domain '{name}': NAT rule names itself"));
        }
    }
}

fn validate_ip_config_cycles(
    domains: &BTreeMap<&str, &DomainConfig>,
    result: &mut ValidationResult,
) {
    for (&start, _) in domains.iter() {
        let mut seen = BTreeSet::from([start]);
        let mut current = start;
        while let Some(next) = domains
            .get(current)
            .and_then(|d| d.ip_config_from.as_deref())
        {
            if next == start {
                result.error(format!("domain '{start}': ip_config_from forms a cycle"));
                break;
            }
            if !seen.insert(next) {
                break;
            }
            current = next;
        }
    }
}
