mod common;

use common::*;
use fleetflow_cloud::{
    AggregateStore, CloudError, CollectionKind, InboundNatRule, LockRegistry, OperationHandle,
    Reconciler, SubResource, SubResourceProperties, TransportProtocol,
};
use fleetflow_cloud_azure::AzureLoadBalancerStore;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn deadline(ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(ms)
}

fn nat(name: &str, port: u16) -> SubResource {
    SubResource::new(
        name,
        SubResourceProperties::InboundNatRule(InboundNatRule::new(
            "public",
            TransportProtocol::Tcp,
            port,
            port,
        )),
    )
    .unwrap()
}

#[tokio::test]
async fn test_fetch_parses_document() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LB_PATH))
        .and(query_param("api-version", "2023-09-01"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(lb_document("W/\"1\"", &[("ssh", 22)])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let aggregate = store(&server).fetch(&lb_id()).await.unwrap();
    assert_eq!(aggregate.etag.as_deref(), Some("W/\"1\""));
    assert_eq!(aggregate.names(CollectionKind::InboundNatRule), vec!["ssh"]);
    assert_eq!(
        aggregate.names(CollectionKind::FrontendIpConfiguration),
        vec!["public"]
    );
    let (_, ssh) = aggregate.find(CollectionKind::InboundNatRule, "SSH").unwrap();
    assert_eq!(ssh, &nat("ssh", 22));
}

#[tokio::test]
async fn test_fetch_missing_load_balancer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LB_PATH))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "code": "ResourceNotFound", "message": "not found" }
        })))
        .mount(&server)
        .await;

    let err = store(&server).fetch(&lb_id()).await.unwrap_err();
    assert!(matches!(err, CloudError::ResourceNotFound(_)));
}

#[tokio::test]
async fn test_fetch_surfaces_arm_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LB_PATH))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": { "code": "AuthorizationFailed", "message": "no access" }
        })))
        .mount(&server)
        .await;

    match store(&server).fetch(&lb_id()).await.unwrap_err() {
        CloudError::ApiError(message) => {
            assert!(message.contains("403"));
            assert!(message.contains("AuthorizationFailed"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_submit_conflict_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LB_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(lb_document("W/\"1\"", &[])))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(LB_PATH))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": { "code": "AnotherOperationInProgress", "message": "busy" }
        })))
        .mount(&server)
        .await;

    let store = store(&server);
    let aggregate = store.fetch(&lb_id()).await.unwrap();
    let err = store.submit(&aggregate).await.unwrap_err();
    assert!(matches!(err, CloudError::Conflict(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_submit_sends_if_match_when_enabled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LB_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(lb_document("W/\"7\"", &[])))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(LB_PATH))
        .and(header("if-match", "W/\"7\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(lb_document("W/\"8\"", &[])))
        .expect(1)
        .mount(&server)
        .await;

    init_tracing();
    let store = AzureLoadBalancerStore::new(config(&server).with_etag(true));
    let aggregate = store.fetch(&lb_id()).await.unwrap();
    let handle = store.submit(&aggregate).await.unwrap();
    assert!(handle.is_completed());
    store.poll_until_done(handle, deadline(1_000)).await.unwrap();
}

#[tokio::test]
async fn test_poll_follows_async_operation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/operations/op1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("retry-after", "0")
                .set_body_json(json!({ "status": "InProgress" })),
        )
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/op1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "Succeeded" })))
        .mount(&server)
        .await;

    let handle = OperationHandle::pending(lb_id(), format!("{}/operations/op1", server.uri()));
    store(&server)
        .poll_until_done(handle, deadline(2_000))
        .await
        .unwrap();

    let polls = server.received_requests().await.unwrap();
    assert_eq!(polls.len(), 3);
}

#[tokio::test]
async fn test_poll_location_header_until_done() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/operations/loc1"))
        .respond_with(ResponseTemplate::new(202))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/loc1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let handle = OperationHandle::pending(lb_id(), format!("{}/operations/loc1", server.uri()));
    store(&server)
        .poll_until_done(handle, deadline(2_000))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_poll_reports_failed_operation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/operations/op2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "Failed",
            "error": { "code": "InvalidResourceReference", "message": "probe missing" }
        })))
        .mount(&server)
        .await;

    let handle = OperationHandle::pending(lb_id(), format!("{}/operations/op2", server.uri()));
    match store(&server)
        .poll_until_done(handle, deadline(2_000))
        .await
        .unwrap_err()
    {
        CloudError::ApiError(message) => {
            assert!(message.contains("Failed"));
            assert!(message.contains("InvalidResourceReference"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_poll_stops_at_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/operations/slow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "InProgress" })))
        .mount(&server)
        .await;

    let handle = OperationHandle::pending(lb_id(), format!("{}/operations/slow", server.uri()));
    let started = Instant::now();
    let err = store(&server)
        .poll_until_done(handle, deadline(150))
        .await
        .unwrap_err();
    match err {
        CloudError::Timeout(message) => {
            assert!(message.contains("/operations/slow"));
            assert!(message.contains("still running after"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_reconciler_upsert_against_arm() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LB_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(lb_document("W/\"1\"", &[("ssh", 22)])),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(LB_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(lb_document(
            "W/\"2\"",
            &[("ssh", 22), ("web", 80)],
        )))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(LB_PATH))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header(
                    "Azure-AsyncOperation",
                    format!("{}/operations/put1", server.uri()).as_str(),
                )
                .set_body_json(lb_document("W/\"2\"", &[("ssh", 22), ("web", 80)])),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/put1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "Succeeded" })))
        .mount(&server)
        .await;

    let reconciler = Reconciler::new(Arc::new(store(&server)), Arc::new(LockRegistry::new()));
    reconciler.upsert(&lb_id(), nat("web", 80)).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let put = requests
        .iter()
        .find(|r| r.method.as_str() == "PUT")
        .unwrap();
    let body: Value = serde_json::from_slice(&put.body).unwrap();

    assert!(body.get("etag").is_none());
    assert_eq!(body["location"], "westeurope");
    assert_eq!(body["tags"]["owner"], "platform");

    let rules = body["properties"]["inboundNatRules"].as_array().unwrap();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0]["name"], "ssh");
    assert_eq!(rules[0]["properties"]["provisioningState"], "Succeeded");
    assert_eq!(rules[1]["name"], "web");
    assert_eq!(
        rules[1]["properties"]["frontendIPConfiguration"]["id"],
        format!("{}/frontendIPConfigurations/public", LB_PATH)
    );
    assert_eq!(rules[1]["id"], format!("{}/inboundNatRules/web", LB_PATH));
}
