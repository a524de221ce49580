use async_trait::async_trait;
use fleetflow_cloud::{
    AggregateResource, AggregateStore, BackoffConfig, CloudError, CollectionKind, InMemoryStore,
    InboundNatRule, LockRegistry, OperationHandle, Reconciler, ReconcilerConfig,
    ResourceIdentifier, SubResource, SubResourceProperties, TransportProtocol,
};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn lb_id(name: &str) -> ResourceIdentifier {
    ResourceIdentifier::parse(&format!(
        "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/rg-test/providers/Microsoft.Network/loadBalancers/{}",
        name
    ))
    .unwrap()
}

pub fn nat(name: &str, port: u16) -> SubResource {
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

/// Convergence retries in milliseconds instead of seconds
pub fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig {
        convergence: BackoffConfig {
            max_attempts: 10,
            initial_delay_ms: 5,
            max_delay_ms: 20,
            multiplier: 2.0,
            timeout_ms: 2_000,
        },
        ..ReconcilerConfig::default()
    }
}

/// Store seeded with `lb1` holding the given NAT rules
pub fn seeded_store(store: InMemoryStore, rules: &[(&str, u16)]) -> Arc<InMemoryStore> {
    let items = rules.iter().map(|(name, port)| nat(name, *port)).collect();
    store.insert(
        AggregateResource::new(lb_id("lb1")).with_collection(CollectionKind::InboundNatRule, items),
    );
    Arc::new(store)
}

pub fn reconciler(store: Arc<InMemoryStore>, config: ReconcilerConfig) -> Reconciler {
    init_tracing();
    Reconciler::new(store, Arc::new(LockRegistry::new())).with_config(config)
}

pub fn nat_names(store: &InMemoryStore, lb: &str) -> Vec<String> {
    store
        .get(&lb_id(lb))
        .unwrap()
        .names(CollectionKind::InboundNatRule)
        .into_iter()
        .map(String::from)
        .collect()
}

/// Store whose fetches numbered within `failing` (1-based) answer 429
pub struct FlakyFetchStore {
    inner: Arc<InMemoryStore>,
    failing: Range<usize>,
    fetches: AtomicUsize,
}

impl FlakyFetchStore {
    pub fn new(inner: Arc<InMemoryStore>, failing: Range<usize>) -> Self {
        Self {
            inner,
            failing,
            fetches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AggregateStore for FlakyFetchStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn fetch(&self, id: &ResourceIdentifier) -> fleetflow_cloud::Result<AggregateResource> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.contains(&n) {
            return Err(CloudError::ApiError("HTTP 429 TooManyRequests".to_string()));
        }
        self.inner.fetch(id).await
    }

    async fn submit(
        &self,
        aggregate: &AggregateResource,
    ) -> fleetflow_cloud::Result<OperationHandle> {
        self.inner.submit(aggregate).await
    }

    async fn poll_until_done(
        &self,
        handle: OperationHandle,
        deadline: Instant,
    ) -> fleetflow_cloud::Result<()> {
        self.inner.poll_until_done(handle, deadline).await
    }
}
