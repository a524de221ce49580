//! ARM load balancer document mapping
//!
//! Converts between the JSON document ARM returns for a load balancer and
//! [`AggregateResource`]. References between sub-resources are full child
//! resource ids on the wire and plain names in the typed model.
//!
//! Fields the typed model does not cover are carried through untouched: the
//! fetched document is kept in [`AggregateResource::attributes`] and each
//! rendered sub-resource is overlaid onto its previously fetched element.
//! Elements the typed model cannot represent (for example NAT rules that map a
//! frontend port range onto a backend pool) are left out of the typed
//! collections and written back verbatim at their original position.

use crate::error::{AzureError, Result};
use fleetflow_cloud::locator::names_equal;
use fleetflow_cloud::{
    AggregateResource, BackendAddressPool, CollectionKind, FrontendIpConfiguration,
    InboundNatPool, InboundNatRule, IpAllocation, LoadBalancingRule, LoadDistribution,
    OutboundRule, Probe, ProbeProtocol, ResourceIdentifier, SubResource, SubResourceProperties,
    TransportProtocol,
};
use serde::Deserialize;
use serde_json::{Map, Value, json};

#[derive(Debug, Deserialize)]
struct IdRef {
    id: String,
}

fn default_idle_timeout() -> u32 {
    4
}

#[derive(Debug, Deserialize)]
struct WireFrontend {
    #[serde(rename = "privateIPAddress")]
    private_ip_address: Option<String>,
    #[serde(rename = "privateIPAllocationMethod", default)]
    private_ip_allocation: IpAllocation,
    #[serde(rename = "publicIPAddress")]
    public_ip_address: Option<IdRef>,
    subnet: Option<IdRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireProbe {
    protocol: ProbeProtocol,
    port: u16,
    request_path: Option<String>,
    #[serde(default = "default_interval")]
    interval_in_seconds: u32,
    #[serde(default = "default_probes")]
    number_of_probes: u32,
}

fn default_interval() -> u32 {
    15
}
fn default_probes() -> u32 {
    2
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRule {
    #[serde(rename = "frontendIPConfiguration")]
    frontend_ip_configuration: IdRef,
    backend_address_pool: Option<IdRef>,
    probe: Option<IdRef>,
    protocol: TransportProtocol,
    frontend_port: u16,
    backend_port: u16,
    #[serde(default = "default_idle_timeout")]
    idle_timeout_in_minutes: u32,
    #[serde(rename = "enableFloatingIP", default)]
    enable_floating_ip: bool,
    #[serde(default)]
    disable_outbound_snat: bool,
    #[serde(default)]
    load_distribution: LoadDistribution,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNatRule {
    #[serde(rename = "frontendIPConfiguration")]
    frontend_ip_configuration: IdRef,
    protocol: TransportProtocol,
    frontend_port: u16,
    backend_port: u16,
    #[serde(default = "default_idle_timeout")]
    idle_timeout_in_minutes: u32,
    #[serde(rename = "enableFloatingIP", default)]
    enable_floating_ip: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNatPool {
    #[serde(rename = "frontendIPConfiguration")]
    frontend_ip_configuration: IdRef,
    protocol: TransportProtocol,
    frontend_port_range_start: u16,
    frontend_port_range_end: u16,
    backend_port: u16,
    #[serde(default = "default_idle_timeout")]
    idle_timeout_in_minutes: u32,
    #[serde(rename = "enableFloatingIP", default)]
    enable_floating_ip: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOutboundRule {
    #[serde(rename = "frontendIPConfigurations", default)]
    frontend_ip_configurations: Vec<IdRef>,
    backend_address_pool: IdRef,
    protocol: TransportProtocol,
    #[serde(default)]
    allocated_outbound_ports: u32,
    #[serde(default = "default_idle_timeout")]
    idle_timeout_in_minutes: u32,
    #[serde(default)]
    enable_tcp_reset: bool,
}

/// Name of the sub-resource a reference points at
fn reference_name(reference: &IdRef) -> String {
    match ResourceIdentifier::parse(&reference.id) {
        Ok(id) => id.name().to_string(),
        Err(_) => reference
            .id
            .rsplit('/')
            .next()
            .unwrap_or(&reference.id)
            .to_string(),
    }
}

fn reference(lb: &ResourceIdentifier, kind: CollectionKind, name: &str) -> Value {
    json!({ "id": lb.child(kind.arm_name(), name).to_string() })
}

/// Parse an ARM load balancer document.
pub fn from_document(id: &ResourceIdentifier, document: Value) -> Result<AggregateResource> {
    let Value::Object(map) = document else {
        return Err(AzureError::InvalidResponse(format!(
            "expected a JSON object for {}",
            id
        )));
    };

    let mut aggregate = AggregateResource::new(id.clone());
    aggregate.etag = map.get("etag").and_then(Value::as_str).map(String::from);

    let properties = map.get("properties").and_then(Value::as_object);
    for kind in CollectionKind::ALL {
        let Some(items) = properties
            .and_then(|p| p.get(kind.arm_name()))
            .and_then(Value::as_array)
        else {
            continue;
        };
        let mut parsed = Vec::with_capacity(items.len());
        for element in items {
            match parse_element(kind, element) {
                Ok(sub) => parsed.push(sub),
                Err(e) => tracing::warn!(
                    aggregate = %id,
                    kind = %kind,
                    name = element.get("name").and_then(serde_json::Value::as_str).unwrap_or("?"),
                    "Passing through unsupported element: {}",
                    e
                ),
            }
        }
        aggregate.collections.insert(kind, parsed);
    }

    aggregate.attributes = map;
    Ok(aggregate)
}

fn parse_element(kind: CollectionKind, element: &Value) -> Result<SubResource> {
    let name = element
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| AzureError::InvalidResponse(format!("{} entry without a name", kind)))?;
    let props = element
        .get("properties")
        .cloned()
        .unwrap_or_else(|| json!({}));

    let properties = match kind {
        CollectionKind::FrontendIpConfiguration => {
            let wire: WireFrontend = serde_json::from_value(props)?;
            let zones = element
                .get("zones")
                .and_then(Value::as_array)
                .map(|zones| {
                    zones
                        .iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            SubResourceProperties::FrontendIpConfiguration(FrontendIpConfiguration {
                private_ip_address: wire.private_ip_address,
                private_ip_allocation: wire.private_ip_allocation,
                public_ip_address_id: wire.public_ip_address.map(|r| r.id),
                subnet_id: wire.subnet.map(|r| r.id),
                zones,
            })
        }
        CollectionKind::BackendAddressPool => {
            SubResourceProperties::BackendAddressPool(BackendAddressPool::default())
        }
        CollectionKind::Probe => {
            let wire: WireProbe = serde_json::from_value(props)?;
            SubResourceProperties::Probe(Probe {
                protocol: wire.protocol,
                port: wire.port,
                request_path: wire.request_path,
                interval_in_seconds: wire.interval_in_seconds,
                number_of_probes: wire.number_of_probes,
            })
        }
        CollectionKind::LoadBalancingRule => {
            let wire: WireRule = serde_json::from_value(props)?;
            SubResourceProperties::LoadBalancingRule(LoadBalancingRule {
                frontend_ip_configuration: reference_name(&wire.frontend_ip_configuration),
                backend_address_pool: wire.backend_address_pool.as_ref().map(reference_name),
                probe: wire.probe.as_ref().map(reference_name),
                protocol: wire.protocol,
                frontend_port: wire.frontend_port,
                backend_port: wire.backend_port,
                idle_timeout_in_minutes: wire.idle_timeout_in_minutes,
                enable_floating_ip: wire.enable_floating_ip,
                disable_outbound_snat: wire.disable_outbound_snat,
                load_distribution: wire.load_distribution,
            })
        }
        CollectionKind::InboundNatRule => {
            let wire: WireNatRule = serde_json::from_value(props)?;
            SubResourceProperties::InboundNatRule(InboundNatRule {
                frontend_ip_configuration: reference_name(&wire.frontend_ip_configuration),
                protocol: wire.protocol,
                frontend_port: wire.frontend_port,
                backend_port: wire.backend_port,
                idle_timeout_in_minutes: wire.idle_timeout_in_minutes,
                enable_floating_ip: wire.enable_floating_ip,
            })
        }
        CollectionKind::InboundNatPool => {
            let wire: WireNatPool = serde_json::from_value(props)?;
            SubResourceProperties::InboundNatPool(InboundNatPool {
                frontend_ip_configuration: reference_name(&wire.frontend_ip_configuration),
                protocol: wire.protocol,
                frontend_port_start: wire.frontend_port_range_start,
                frontend_port_end: wire.frontend_port_range_end,
                backend_port: wire.backend_port,
                idle_timeout_in_minutes: wire.idle_timeout_in_minutes,
                enable_floating_ip: wire.enable_floating_ip,
            })
        }
        CollectionKind::OutboundRule => {
            let wire: WireOutboundRule = serde_json::from_value(props)?;
            SubResourceProperties::OutboundRule(OutboundRule {
                frontend_ip_configurations: wire
                    .frontend_ip_configurations
                    .iter()
                    .map(reference_name)
                    .collect(),
                backend_address_pool: reference_name(&wire.backend_address_pool),
                protocol: wire.protocol,
                allocated_outbound_ports: wire.allocated_outbound_ports,
                idle_timeout_in_minutes: wire.idle_timeout_in_minutes,
                enable_tcp_reset: wire.enable_tcp_reset,
            })
        }
    };

    Ok(SubResource::observed(name, properties))
}

/// Render the full PUT body for an aggregate.
pub fn to_document(aggregate: &AggregateResource) -> Value {
    let mut document = aggregate.attributes.clone();
    document.remove("etag");

    let properties = document
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
    if !properties.is_object() {
        *properties = Value::Object(Map::new());
    }
    if let Value::Object(properties) = properties {
        for (kind, items) in &aggregate.collections {
            let previous: Vec<Value> = properties
                .get(kind.arm_name())
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let mut elements: Vec<Value> = items
                .iter()
                .map(|sub| {
                    let original = original_of(&previous, sub.name())
                        .filter(|element| parse_element(*kind, element).is_ok());
                    render_element(&aggregate.id, sub, original)
                })
                .collect();

            // Unsupported elements keep their slot unless a typed entry took the name
            for (index, element) in previous.iter().enumerate() {
                if parse_element(*kind, element).is_ok() {
                    continue;
                }
                let claimed = element
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| items.iter().any(|sub| names_equal(name, sub.name())));
                if !claimed {
                    elements.insert(index.min(elements.len()), element.clone());
                }
            }
            properties.insert(kind.arm_name().to_string(), Value::Array(elements));
        }
    }

    Value::Object(document)
}

fn original_of<'a>(previous: &'a [Value], name: &str) -> Option<&'a Value> {
    previous.iter().find(|element| {
        element
            .get("name")
            .and_then(Value::as_str)
            .is_some_and(|candidate| names_equal(candidate, name))
    })
}

fn render_element(lb: &ResourceIdentifier, sub: &SubResource, original: Option<&Value>) -> Value {
    let mut element = original
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    element.insert("name".to_string(), json!(sub.name()));
    element.insert(
        "id".to_string(),
        json!(lb.child(sub.kind().arm_name(), sub.name()).to_string()),
    );

    let mut props = element
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    overlay(&mut props, render_properties(lb, sub.properties()));
    element.insert("properties".to_string(), Value::Object(props));

    if let SubResourceProperties::FrontendIpConfiguration(frontend) = sub.properties() {
        if frontend.zones.is_empty() {
            element.remove("zones");
        } else {
            element.insert("zones".to_string(), json!(frontend.zones));
        }
    }

    Value::Object(element)
}

fn render_properties(lb: &ResourceIdentifier, properties: &SubResourceProperties) -> Value {
    let frontend = |name: &str| reference(lb, CollectionKind::FrontendIpConfiguration, name);
    let pool = |name: &str| reference(lb, CollectionKind::BackendAddressPool, name);

    match properties {
        SubResourceProperties::FrontendIpConfiguration(p) => json!({
            "privateIPAddress": p.private_ip_address,
            "privateIPAllocationMethod": p.private_ip_allocation,
            "publicIPAddress": p.public_ip_address_id.as_ref().map(|id| json!({ "id": id })),
            "subnet": p.subnet_id.as_ref().map(|id| json!({ "id": id })),
        }),
        SubResourceProperties::BackendAddressPool(_) => json!({}),
        SubResourceProperties::Probe(p) => json!({
            "protocol": p.protocol,
            "port": p.port,
            "requestPath": p.request_path,
            "intervalInSeconds": p.interval_in_seconds,
            "numberOfProbes": p.number_of_probes,
        }),
        SubResourceProperties::LoadBalancingRule(p) => json!({
            "frontendIPConfiguration": frontend(&p.frontend_ip_configuration),
            "backendAddressPool": p.backend_address_pool.as_deref().map(pool),
            "probe": p.probe.as_deref().map(|name| reference(lb, CollectionKind::Probe, name)),
            "protocol": p.protocol,
            "frontendPort": p.frontend_port,
            "backendPort": p.backend_port,
            "idleTimeoutInMinutes": p.idle_timeout_in_minutes,
            "enableFloatingIP": p.enable_floating_ip,
            "disableOutboundSnat": p.disable_outbound_snat,
            "loadDistribution": p.load_distribution,
        }),
        SubResourceProperties::InboundNatRule(p) => json!({
            "frontendIPConfiguration": frontend(&p.frontend_ip_configuration),
            "protocol": p.protocol,
            "frontendPort": p.frontend_port,
            "backendPort": p.backend_port,
            "idleTimeoutInMinutes": p.idle_timeout_in_minutes,
            "enableFloatingIP": p.enable_floating_ip,
        }),
        SubResourceProperties::InboundNatPool(p) => json!({
            "frontendIPConfiguration": frontend(&p.frontend_ip_configuration),
            "protocol": p.protocol,
            "frontendPortRangeStart": p.frontend_port_start,
            "frontendPortRangeEnd": p.frontend_port_end,
            "backendPort": p.backend_port,
            "idleTimeoutInMinutes": p.idle_timeout_in_minutes,
            "enableFloatingIP": p.enable_floating_ip,
        }),
        SubResourceProperties::OutboundRule(p) => json!({
            "frontendIPConfigurations": p
                .frontend_ip_configurations
                .iter()
                .map(|name| frontend(name))
                .collect::<Vec<_>>(),
            "backendAddressPool": pool(&p.backend_address_pool),
            "protocol": p.protocol,
            "allocatedOutboundPorts": p.allocated_outbound_ports,
            "idleTimeoutInMinutes": p.idle_timeout_in_minutes,
            "enableTcpReset": p.enable_tcp_reset,
        }),
    }
}

/// Set every key of `patch` on `base`; `null` removes the key.
fn overlay(base: &mut Map<String, Value>, patch: Value) {
    let Value::Object(patch) = patch else {
        return;
    };
    for (key, value) in patch {
        if value.is_null() {
            base.remove(&key);
        } else {
            base.insert(key, value);
        }
    }
}
