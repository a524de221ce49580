use fleetflow_cloud::ResourceIdentifier;
use fleetflow_cloud_azure::{AzureConfig, AzureLoadBalancerStore};
use serde_json::{Value, json};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wiremock::MockServer;

pub const LB_PATH: &str = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/loadBalancers/lb1";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn lb_id() -> ResourceIdentifier {
    ResourceIdentifier::parse(LB_PATH).unwrap()
}

pub fn config(server: &MockServer) -> AzureConfig {
    AzureConfig::new("test-token")
        .with_endpoint(server.uri())
        .with_poll_interval(Duration::from_millis(10))
}

pub fn store(server: &MockServer) -> AzureLoadBalancerStore {
    init_tracing();
    AzureLoadBalancerStore::new(config(server))
}

pub fn frontend_ref() -> Value {
    json!({ "id": format!("{}/frontendIPConfigurations/public", LB_PATH) })
}

/// NAT rule element as ARM returns it
pub fn nat_element(name: &str, port: u16) -> Value {
    json!({
        "name": name,
        "id": format!("{}/inboundNatRules/{}", LB_PATH, name),
        "etag": "W/\"nat\"",
        "properties": {
            "provisioningState": "Succeeded",
            "frontendIPConfiguration": frontend_ref(),
            "protocol": "Tcp",
            "frontendPort": port,
            "backendPort": port,
            "idleTimeoutInMinutes": 4,
            "enableFloatingIP": false
        }
    })
}

/// Load balancer document with the given NAT rules
pub fn lb_document(etag: &str, rules: &[(&str, u16)]) -> Value {
    json!({
        "id": LB_PATH,
        "name": "lb1",
        "type": "Microsoft.Network/loadBalancers",
        "location": "westeurope",
        "etag": etag,
        "sku": { "name": "Standard", "tier": "Regional" },
        "tags": { "owner": "platform" },
        "properties": {
            "provisioningState": "Succeeded",
            "frontendIPConfigurations": [{
                "name": "public",
                "id": format!("{}/frontendIPConfigurations/public", LB_PATH),
                "properties": {
                    "privateIPAllocationMethod": "Dynamic",
                    "publicIPAddress": { "id": "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/publicIPAddresses/pip" }
                }
            }],
            "inboundNatRules": rules
                .iter()
                .map(|(name, port)| nat_element(name, *port))
                .collect::<Vec<_>>()
        }
    })
}
