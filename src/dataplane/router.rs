//! Process-wide router context
//!
//! Owns the current domain tree and all interfaces and dispatches events
//! to them. Every event runs to completion before the next one; the caller
//! supplies the time so the router itself never reads a clock.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::configuration;
use super::dhcp_client::DhcpClient;
use super::domain::{DomainTree, IpConfigSource};
use super::interface::{InterfaceId, InterfaceTable, Pipeline, Transmit};
use super::link::LinkTimeouts;
use crate::config::{ReportConfig, RouterConfig, Timeouts, validate};
use crate::protocol::MacAddr;
use crate::telemetry::RouterReport;
use crate::{Error, Result};

/// Values taken from the configuration on every (re)load
#[derive(Debug, Clone)]
pub struct Settings {
    pub mac: MacAddr,
    pub icmp_unreachable: bool,
    pub verbose_domain_state: bool,
    pub timeouts: Timeouts,
    pub links: LinkTimeouts,
    pub report: ReportConfig,
}

impl From<&RouterConfig> for Settings {
    fn from(config: &RouterConfig) -> Self {
        Self {
            mac: config.mac,
            icmp_unreachable: config.icmp_unreachable,
            verbose_domain_state: config.verbose_domain_state,
            timeouts: config.timeouts,
            links: LinkTimeouts::from(&config.timeouts),
            report: config.report.clone(),
        }
    }
}

impl Settings {
    pub fn arp_request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.arp_request_sec)
    }

    pub fn arp_entry_lifetime(&self) -> Duration {
        Duration::from_secs(self.timeouts.arp_entry_sec)
    }
}

/// Periodic activities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    LinkAging,
    ArpExpiry,
    DhcpMaintenance,
    Report,
}

#[derive(Debug, Clone)]
pub enum Event {
    FrameArrived {
        interface: InterfaceId,
        frame: Vec<u8>,
    },
    Timeout(TimerKind),
    ConfigReloaded(RouterConfig),
}

/// What the caller has to do after an event
#[derive(Debug, Default)]
pub struct Dispatch {
    pub transmits: Vec<Transmit>,
    pub report: Option<RouterReport>,
}

pub struct Router {
    settings: Settings,
    config: RouterConfig,
    domains: DomainTree,
    interfaces: InterfaceTable,
    next_link: u64,
    config_error: Option<String>,
}

impl Router {
    /// Create a router from a configuration that must validate.
    pub fn new(config: RouterConfig) -> Result<Self> {
        let mut router = Self {
            settings: Settings::from(&config),
            config: RouterConfig::default(),
            domains: DomainTree::default(),
            interfaces: InterfaceTable::default(),
            next_link: 1,
            config_error: None,
        };
        router.apply_config(config)?;
        Ok(router)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn domains(&self) -> &DomainTree {
        &self.domains
    }

    pub fn interfaces(&self) -> &InterfaceTable {
        &self.interfaces
    }

    pub fn generation(&self) -> u64 {
        self.domains.generation()
    }

    /// Reason the last configuration was rejected, if it was.
    pub fn config_error(&self) -> Option<&str> {
        self.config_error.as_deref()
    }

    pub fn handle_event(&mut self, event: Event, now: Instant) -> Dispatch {
        let mut dispatch = Dispatch::default();
        match event {
            Event::FrameArrived { interface, frame } => {
                let mut pipeline = self.pipeline(now);
                pipeline.handle_frame(interface, &frame);
                dispatch.transmits = pipeline.finish();
            }
            Event::Timeout(TimerKind::LinkAging) => {
                let expired = self.domains.age_links(now, &self.settings.links);
                if expired > 0 {
                    debug!("{} links expired", expired);
                }
            }
            Event::Timeout(TimerKind::ArpExpiry) => self.expire_arp(now),
            Event::Timeout(TimerKind::DhcpMaintenance) => {
                dispatch.transmits = self.maintain_dhcp(now);
            }
            Event::Timeout(TimerKind::Report) => {
                dispatch.report = Some(self.report(now));
            }
            Event::ConfigReloaded(config) => {
                if let Err(e) = self.apply_config(config) {
                    error!("configuration rejected: {}", e);
                }
                if self.settings.report.config_triggers {
                    dispatch.report = Some(self.report(now));
                }
            }
        }
        dispatch
    }

    fn pipeline(&mut self, now: Instant) -> Pipeline<'_> {
        Pipeline::new(
            &mut self.domains,
            &mut self.interfaces,
            &self.settings,
            &mut self.next_link,
            now,
        )
    }

    /// Replace the domain tree. On error the current generation stays
    /// authoritative and the error shows up in the next report.
    pub fn apply_config(&mut self, config: RouterConfig) -> Result<()> {
        let result = validate(&config);
        for warning in &result.warnings {
            warn!("config: {}", warning);
        }
        if result.has_errors() {
            let message = result.errors.join("; ");
            self.config_error = Some(message.clone());
            return Err(Error::Config(message));
        }

        let generation = self.domains.generation() + 1;
        let previous = std::mem::take(&mut self.domains);
        self.domains = configuration::next_generation(previous, &config, generation);
        self.settings = Settings::from(&config);
        self.config = config;
        self.config_error = None;

        let ids: Vec<InterfaceId> = self.interfaces.iter().map(|i| i.id()).collect();
        for id in ids {
            self.bind(id);
        }
        info!(
            "configuration generation {} active, {} domains",
            generation,
            self.domains.len()
        );
        Ok(())
    }

    /// Attach a new interface to the domain named by its session policy.
    pub fn attach_interface(&mut self, domain_name: &str) -> InterfaceId {
        let id = self.interfaces.insert(domain_name);
        self.bind(id);
        id
    }

    pub fn detach_interface(&mut self, id: InterfaceId) -> Result<()> {
        if self.interfaces.get(id).is_none() {
            return Err(Error::InterfaceNotFound {
                name: id.to_string(),
            });
        }
        self.unbind(id);
        self.interfaces.remove(id);
        info!("{} detached", id);
        Ok(())
    }

    /// Connect an interface to the current generation's domain.
    fn bind(&mut self, id: InterfaceId) {
        let Some(iface) = self.interfaces.get_mut(id) else {
            return;
        };
        let Some(did) = self.domains.id(iface.domain_name()) else {
            iface.domain = None;
            iface.dhcp_client = None;
            warn!("{}: domain {} does not exist", id, iface.domain_name());
            self.release_interface(id);
            return;
        };
        let Some(domain) = self.domains.get_mut(did) else {
            return;
        };
        domain.add_interface(id);
        iface.domain = Some(did);
        match domain.ip_config_source() {
            IpConfigSource::Dhcp => {
                if iface.dhcp_client.is_none() {
                    iface.dhcp_client = Some(DhcpClient::new(self.settings.mac));
                }
            }
            _ => iface.dhcp_client = None,
        }
        debug!("{} attached to {}", id, domain.name());
    }

    fn unbind(&mut self, id: InterfaceId) {
        let Some(iface) = self.interfaces.get_mut(id) else {
            return;
        };
        iface.dhcp_client = None;
        let Some(did) = iface.domain.take() else {
            return;
        };
        self.release_interface(id);

        let Some(domain) = self.domains.get_mut(did) else {
            return;
        };
        domain.remove_interface(id);
        let orphaned = domain.interface_count() == 0
            && *domain.ip_config_source() == IpConfigSource::Dhcp
            && domain.is_configured();
        if orphaned {
            info!("{}: last interface gone, discarding IP config", domain.name());
            if let Err(e) = self.domains.discard_ip_config(did) {
                warn!("{}", e);
            }
        }
    }

    /// Drop links and queued frames that belong to an interface.
    fn release_interface(&mut self, id: InterfaceId) {
        let links = self.domains.dismiss_links_of_interface(id);
        let mut frames = 0;
        for domain in self.domains.iter_mut() {
            frames += domain.arp_cache.cancel_interface(id);
        }
        if links + frames > 0 {
            debug!("{}: dismissed {} links, {} queued frames", id, links, frames);
        }
    }

    fn expire_arp(&mut self, now: Instant) {
        let request_timeout = self.settings.arp_request_timeout();
        let lifetime = self.settings.arp_entry_lifetime();
        for domain in self.domains.iter_mut() {
            for (ip, waiters) in domain.arp_cache.expire(now, request_timeout, lifetime) {
                warn!(
                    "{}: no ARP reply from {}, dropped {} frames",
                    domain.name(),
                    ip,
                    waiters.len()
                );
            }
        }
    }

    fn maintain_dhcp(&mut self, now: Instant) -> Vec<Transmit> {
        for domain in self.domains.iter_mut() {
            if let Some(server) = domain.dhcp_server.as_mut() {
                let expired = server.maintain(now);
                if expired > 0 {
                    debug!("{}: {} DHCP leases expired", domain.name(), expired);
                }
            }
        }
        let mut pipeline = self.pipeline(now);
        pipeline.tick_dhcp_clients();
        pipeline.finish()
    }

    pub fn report(&self, now: Instant) -> RouterReport {
        RouterReport::new(
            self.domains.generation(),
            self.config_error.clone(),
            self.domains
                .iter()
                .filter(|_| self.settings.report.bytes || self.settings.report.config)
                .map(|d| d.report(&self.settings.report, now))
                .collect(),
        )
    }
}
