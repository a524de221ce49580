//! Aggregate and sub-resource types
//!
//! A load balancer is stored remotely as one aggregate holding several ordered
//! collections of named sub-resources. Each sub-resource kind has its own typed
//! property struct, validated when a [`SubResource`] is built.

use crate::error::{CloudError, Result};
use crate::id::ResourceIdentifier;
use crate::locator;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MAX_NAME_LEN: usize = 80;

/// Nested collection inside a load balancer aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    FrontendIpConfiguration,
    BackendAddressPool,
    Probe,
    LoadBalancingRule,
    InboundNatRule,
    InboundNatPool,
    OutboundRule,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 7] = [
        CollectionKind::FrontendIpConfiguration,
        CollectionKind::BackendAddressPool,
        CollectionKind::Probe,
        CollectionKind::LoadBalancingRule,
        CollectionKind::InboundNatRule,
        CollectionKind::InboundNatPool,
        CollectionKind::OutboundRule,
    ];

    /// Property name of the collection in the ARM load balancer document
    pub fn arm_name(&self) -> &'static str {
        match self {
            CollectionKind::FrontendIpConfiguration => "frontendIPConfigurations",
            CollectionKind::BackendAddressPool => "backendAddressPools",
            CollectionKind::Probe => "probes",
            CollectionKind::LoadBalancingRule => "loadBalancingRules",
            CollectionKind::InboundNatRule => "inboundNatRules",
            CollectionKind::InboundNatPool => "inboundNatPools",
            CollectionKind::OutboundRule => "outboundRules",
        }
    }

    pub fn from_arm_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.arm_name().eq_ignore_ascii_case(name))
    }
}

impl std::fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectionKind::FrontendIpConfiguration => write!(f, "frontend-ip-configuration"),
            CollectionKind::BackendAddressPool => write!(f, "backend-address-pool"),
            CollectionKind::Probe => write!(f, "probe"),
            CollectionKind::LoadBalancingRule => write!(f, "load-balancing-rule"),
            CollectionKind::InboundNatRule => write!(f, "inbound-nat-rule"),
            CollectionKind::InboundNatPool => write!(f, "inbound-nat-pool"),
            CollectionKind::OutboundRule => write!(f, "outbound-rule"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeProtocol {
    Tcp,
    Http,
    Https,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpAllocation {
    #[default]
    Dynamic,
    Static,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadDistribution {
    #[default]
    Default,
    #[serde(rename = "SourceIP")]
    SourceIp,
    #[serde(rename = "SourceIPProtocol")]
    SourceIpProtocol,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontendIpConfiguration {
    pub private_ip_address: Option<String>,
    pub private_ip_allocation: IpAllocation,
    pub public_ip_address_id: Option<String>,
    pub subnet_id: Option<String>,
    pub zones: Vec<String>,
}

impl FrontendIpConfiguration {
    pub fn public(public_ip_address_id: impl Into<String>) -> Self {
        Self {
            public_ip_address_id: Some(public_ip_address_id.into()),
            ..Default::default()
        }
    }

    pub fn private(subnet_id: impl Into<String>) -> Self {
        Self {
            subnet_id: Some(subnet_id.into()),
            ..Default::default()
        }
    }

    pub fn with_static_ip(mut self, address: impl Into<String>) -> Self {
        self.private_ip_address = Some(address.into());
        self.private_ip_allocation = IpAllocation::Static;
        self
    }

    fn validate(&self) -> Result<()> {
        match (&self.public_ip_address_id, &self.subnet_id) {
            (Some(_), Some(_)) => {
                return Err(invalid("frontend cannot use both a public IP and a subnet"));
            }
            (None, None) => {
                return Err(invalid("frontend needs either a public IP or a subnet"));
            }
            _ => {}
        }
        if self.private_ip_allocation == IpAllocation::Static
            && (self.private_ip_address.is_none() || self.subnet_id.is_none())
        {
            return Err(invalid(
                "static private IP allocation needs a subnet and an address",
            ));
        }
        Ok(())
    }
}

/// Backend pools carry no configurable properties of their own; membership is
/// managed from the network interface side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAddressPool {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub protocol: ProbeProtocol,
    pub port: u16,
    pub request_path: Option<String>,
    pub interval_in_seconds: u32,
    pub number_of_probes: u32,
}

impl Probe {
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: ProbeProtocol::Tcp,
            port,
            request_path: None,
            interval_in_seconds: 15,
            number_of_probes: 2,
        }
    }

    pub fn http(port: u16, request_path: impl Into<String>) -> Self {
        Self {
            protocol: ProbeProtocol::Http,
            request_path: Some(request_path.into()),
            ..Self::tcp(port)
        }
    }

    fn validate(&self) -> Result<()> {
        check_port("probe port", self.port)?;
        if self.interval_in_seconds < 5 {
            return Err(invalid("probe interval must be at least 5 seconds"));
        }
        if self.number_of_probes < 1 {
            return Err(invalid("probe needs at least one attempt"));
        }
        match (self.protocol, &self.request_path) {
            (ProbeProtocol::Tcp, Some(_)) => {
                Err(invalid("request_path is not allowed for TCP probes"))
            }
            (ProbeProtocol::Http | ProbeProtocol::Https, None) => {
                Err(invalid("request_path is required for HTTP(S) probes"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancingRule {
    pub frontend_ip_configuration: String,
    pub backend_address_pool: Option<String>,
    pub probe: Option<String>,
    pub protocol: TransportProtocol,
    pub frontend_port: u16,
    pub backend_port: u16,
    pub idle_timeout_in_minutes: u32,
    pub enable_floating_ip: bool,
    pub disable_outbound_snat: bool,
    pub load_distribution: LoadDistribution,
}

impl LoadBalancingRule {
    pub fn new(
        frontend_ip_configuration: impl Into<String>,
        protocol: TransportProtocol,
        frontend_port: u16,
        backend_port: u16,
    ) -> Self {
        Self {
            frontend_ip_configuration: frontend_ip_configuration.into(),
            backend_address_pool: None,
            probe: None,
            protocol,
            frontend_port,
            backend_port,
            idle_timeout_in_minutes: 4,
            enable_floating_ip: false,
            disable_outbound_snat: false,
            load_distribution: LoadDistribution::Default,
        }
    }

    pub fn with_backend_pool(mut self, pool: impl Into<String>) -> Self {
        self.backend_address_pool = Some(pool.into());
        self
    }

    pub fn with_probe(mut self, probe: impl Into<String>) -> Self {
        self.probe = Some(probe.into());
        self
    }

    fn validate(&self) -> Result<()> {
        check_reference("frontend_ip_configuration", &self.frontend_ip_configuration)?;
        // HA ports rules use port 0 with protocol All
        if self.protocol == TransportProtocol::All {
            if self.frontend_port != 0 || self.backend_port != 0 {
                return Err(invalid("HA ports rules must use port 0"));
            }
        } else {
            check_port("frontend_port", self.frontend_port)?;
            check_port("backend_port", self.backend_port)?;
        }
        check_idle_timeout(self.idle_timeout_in_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundNatRule {
    pub frontend_ip_configuration: String,
    pub protocol: TransportProtocol,
    pub frontend_port: u16,
    pub backend_port: u16,
    pub idle_timeout_in_minutes: u32,
    pub enable_floating_ip: bool,
}

impl InboundNatRule {
    pub fn new(
        frontend_ip_configuration: impl Into<String>,
        protocol: TransportProtocol,
        frontend_port: u16,
        backend_port: u16,
    ) -> Self {
        Self {
            frontend_ip_configuration: frontend_ip_configuration.into(),
            protocol,
            frontend_port,
            backend_port,
            idle_timeout_in_minutes: 4,
            enable_floating_ip: false,
        }
    }

    fn validate(&self) -> Result<()> {
        check_reference("frontend_ip_configuration", &self.frontend_ip_configuration)?;
        check_port("frontend_port", self.frontend_port)?;
        check_port("backend_port", self.backend_port)?;
        check_idle_timeout(self.idle_timeout_in_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundNatPool {
    pub frontend_ip_configuration: String,
    pub protocol: TransportProtocol,
    pub frontend_port_start: u16,
    pub frontend_port_end: u16,
    pub backend_port: u16,
    pub idle_timeout_in_minutes: u32,
    pub enable_floating_ip: bool,
}

impl InboundNatPool {
    pub fn new(
        frontend_ip_configuration: impl Into<String>,
        protocol: TransportProtocol,
        frontend_ports: std::ops::RangeInclusive<u16>,
        backend_port: u16,
    ) -> Self {
        Self {
            frontend_ip_configuration: frontend_ip_configuration.into(),
            protocol,
            frontend_port_start: *frontend_ports.start(),
            frontend_port_end: *frontend_ports.end(),
            backend_port,
            idle_timeout_in_minutes: 4,
            enable_floating_ip: false,
        }
    }

    fn validate(&self) -> Result<()> {
        check_reference("frontend_ip_configuration", &self.frontend_ip_configuration)?;
        check_port("frontend_port_start", self.frontend_port_start)?;
        check_port("frontend_port_end", self.frontend_port_end)?;
        check_port("backend_port", self.backend_port)?;
        if self.frontend_port_start > self.frontend_port_end {
            return Err(invalid("frontend_port_start must not exceed frontend_port_end"));
        }
        check_idle_timeout(self.idle_timeout_in_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRule {
    pub frontend_ip_configurations: Vec<String>,
    pub backend_address_pool: String,
    pub protocol: TransportProtocol,
    pub allocated_outbound_ports: u32,
    pub idle_timeout_in_minutes: u32,
    pub enable_tcp_reset: bool,
}

impl OutboundRule {
    pub fn new(
        frontend_ip_configurations: Vec<String>,
        backend_address_pool: impl Into<String>,
        protocol: TransportProtocol,
    ) -> Self {
        Self {
            frontend_ip_configurations,
            backend_address_pool: backend_address_pool.into(),
            protocol,
            allocated_outbound_ports: 1024,
            idle_timeout_in_minutes: 4,
            enable_tcp_reset: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.frontend_ip_configurations.is_empty() {
            return Err(invalid("outbound rule needs at least one frontend"));
        }
        for frontend in &self.frontend_ip_configurations {
            check_reference("frontend_ip_configurations", frontend)?;
        }
        check_reference("backend_address_pool", &self.backend_address_pool)?;
        check_idle_timeout(self.idle_timeout_in_minutes)
    }
}

/// Typed payload of a sub-resource, one variant per [`CollectionKind`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "properties", rename_all = "snake_case")]
pub enum SubResourceProperties {
    FrontendIpConfiguration(FrontendIpConfiguration),
    BackendAddressPool(BackendAddressPool),
    Probe(Probe),
    LoadBalancingRule(LoadBalancingRule),
    InboundNatRule(InboundNatRule),
    InboundNatPool(InboundNatPool),
    OutboundRule(OutboundRule),
}

impl SubResourceProperties {
    pub fn kind(&self) -> CollectionKind {
        match self {
            Self::FrontendIpConfiguration(_) => CollectionKind::FrontendIpConfiguration,
            Self::BackendAddressPool(_) => CollectionKind::BackendAddressPool,
            Self::Probe(_) => CollectionKind::Probe,
            Self::LoadBalancingRule(_) => CollectionKind::LoadBalancingRule,
            Self::InboundNatRule(_) => CollectionKind::InboundNatRule,
            Self::InboundNatPool(_) => CollectionKind::InboundNatPool,
            Self::OutboundRule(_) => CollectionKind::OutboundRule,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::FrontendIpConfiguration(p) => p.validate(),
            Self::BackendAddressPool(_) => Ok(()),
            Self::Probe(p) => p.validate(),
            Self::LoadBalancingRule(p) => p.validate(),
            Self::InboundNatRule(p) => p.validate(),
            Self::InboundNatPool(p) => p.validate(),
            Self::OutboundRule(p) => p.validate(),
        }
    }
}

/// One named element of an aggregate's collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubResource {
    name: String,
    properties: SubResourceProperties,
}

impl SubResource {
    /// Build a validated sub-resource.
    pub fn new(name: impl Into<String>, properties: SubResourceProperties) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(invalid("sub-resource name must not be empty"));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(CloudError::InvalidConfig(format!(
                "sub-resource name '{}' exceeds {} characters",
                name, MAX_NAME_LEN
            )));
        }
        properties
            .validate()
            .map_err(|e| CloudError::InvalidConfig(format!("{}: {}", name, e)))?;
        Ok(Self { name, properties })
    }

    /// Wrap a sub-resource as reported by an aggregate store, without
    /// validation. Remote state may have been written by other tools.
    pub fn observed(name: impl Into<String>, properties: SubResourceProperties) -> Self {
        Self {
            name: name.into(),
            properties,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &SubResourceProperties {
        &self.properties
    }

    pub fn kind(&self) -> CollectionKind {
        self.properties.kind()
    }

    /// Same name (ignoring case) and identical properties
    pub fn matches(&self, other: &SubResource) -> bool {
        locator::names_equal(&self.name, &other.name) && self.properties == other.properties
    }
}

/// Where an upsert placed its sub-resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Replaced(usize),
    Appended(usize),
}

/// Remote object holding ordered sub-resource collections
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResource {
    /// Identifier of the aggregate
    pub id: ResourceIdentifier,

    /// Opaque version token, if the store reports one
    pub etag: Option<String>,

    /// Sub-resource collections by kind
    pub collections: BTreeMap<CollectionKind, Vec<SubResource>>,

    /// Store-specific fields the engine carries through unchanged
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl AggregateResource {
    pub fn new(id: ResourceIdentifier) -> Self {
        Self {
            id,
            etag: None,
            collections: BTreeMap::new(),
            attributes: serde_json::Map::new(),
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_collection(mut self, kind: CollectionKind, items: Vec<SubResource>) -> Self {
        self.collections.insert(kind, items);
        self
    }

    pub fn collection(&self, kind: CollectionKind) -> &[SubResource] {
        self.collections
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn collection_mut(&mut self, kind: CollectionKind) -> &mut Vec<SubResource> {
        self.collections.entry(kind).or_default()
    }

    pub fn find(&self, kind: CollectionKind, name: &str) -> Option<(usize, &SubResource)> {
        locator::find(self.collection(kind), name)
    }

    /// Replace the first sub-resource with the same name in place, or append.
    pub fn upsert(&mut self, resource: SubResource) -> Placement {
        let kind = resource.kind();
        let index = locator::find(self.collection(kind), resource.name()).map(|(i, _)| i);
        let items = self.collection_mut(kind);
        match index {
            Some(i) => {
                items[i] = resource;
                Placement::Replaced(i)
            }
            None => {
                items.push(resource);
                Placement::Appended(items.len() - 1)
            }
        }
    }

    /// Splice out the first sub-resource called `name`, keeping the order of
    /// the rest.
    pub fn remove(&mut self, kind: CollectionKind, name: &str) -> Option<(usize, SubResource)> {
        let (index, _) = locator::find(self.collection(kind), name)?;
        Some((index, self.collection_mut(kind).remove(index)))
    }

    /// Names of a collection in order, mostly useful for logging and tests
    pub fn names(&self, kind: CollectionKind) -> Vec<&str> {
        self.collection(kind).iter().map(SubResource::name).collect()
    }
}

fn invalid(message: &str) -> CloudError {
    CloudError::InvalidConfig(message.to_string())
}

fn check_port(field: &str, port: u16) -> Result<()> {
    if port == 0 {
        return Err(CloudError::InvalidConfig(format!(
            "{} must be between 1 and 65535",
            field
        )));
    }
    Ok(())
}

fn check_idle_timeout(minutes: u32) -> Result<()> {
    if !(4..=30).contains(&minutes) {
        return Err(CloudError::InvalidConfig(format!(
            "idle_timeout_in_minutes must be between 4 and 30, got {}",
            minutes
        )));
    }
    Ok(())
}

fn check_reference(field: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CloudError::InvalidConfig(format!("{} must not be empty", field)));
    }
    Ok(())
}
