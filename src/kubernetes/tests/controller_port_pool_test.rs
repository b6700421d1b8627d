use std::sync::{Arc, Mutex};

use common::{cleanup_kind, setup_kind};

use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, Client, ResourceExt,
};
use portd_allocator::manager::PortPoolCache;
use portd_kubernetes::{
    context::State,
    controller::{self, component::Component, metrics::Metrics},
    crd::{
        port_binding::PortBinding,
        port_pool::{PoolItemPhase, PortPool},
    },
    fixture::{
        reconciler::{test_component, test_port_binding, test_port_pool, TEST_LB_ADDRESS},
        test_trace,
    },
};
use prometheus::Registry;

mod common;

#[tokio::test]
#[ignore = "use kind cluster"]
async fn integration_test_port_pool_and_recovery() {
    dbg!("Creating a kind cluster");
    setup_kind();

    test_trace().await;

    dbg!("Getting kube client");
    let client = Client::try_default().await.unwrap();
    let (component, _cloud) = test_component();
    let metrics = Arc::new(Mutex::new(
        Metrics::default().register(&Registry::default()).unwrap(),
    ));
    let ctx = State::default().to_context_with(client.clone(), 30, component.clone(), metrics);

    let pool = test_port_pool();
    let pool_api = Api::<PortPool>::namespaced(client.clone(), "default");
    let ssapply = PatchParams::apply("ctrltest");

    dbg!("Creating a PortPool");
    pool_api
        .patch(&pool.name_any(), &ssapply, &Patch::Apply(pool.clone()))
        .await
        .unwrap();
    let applied = pool_api.get(&pool.name_any()).await.unwrap();

    dbg!("Reconciling the PortPool");
    controller::reconciler::port_pool::reconciler(Arc::new(applied), ctx.clone())
        .await
        .unwrap();

    dbg!("Checking the pool item is active");
    let applied = pool_api.get(&pool.name_any()).await.unwrap();
    let status = applied.status.as_ref().unwrap();
    assert_eq!(1, status.items.len());
    assert_eq!(PoolItemPhase::Active, status.items[0].phase);
    assert_eq!(TEST_LB_ADDRESS, status.items[0].load_balancers[0].address);
    assert!(component
        .cache
        .lock()
        .unwrap()
        .get_item(&applied.pool_key(), "it1")
        .is_some());

    dbg!("Creating a PortBinding");
    let binding = test_port_binding();
    let binding_api = Api::<PortBinding>::namespaced(client.clone(), "default");
    let mut new_binding = binding.clone();
    new_binding.metadata.finalizers = None;
    binding_api
        .create(&PostParams::default(), &new_binding)
        .await
        .unwrap();

    dbg!("Recovering a fresh cache");
    let fresh = Component::new(
        PortPoolCache::new(),
        component.cloud.clone(),
        component.settings.clone(),
    );
    assert!(!fresh.cache.is_ready());
    let report = controller::recovery::recover(client.clone(), &fresh)
        .await
        .unwrap();
    assert!(fresh.cache.is_ready());
    assert_eq!(1, report.items);
    assert_eq!(binding.spec.items.len(), report.slots);
    assert_eq!(0, report.missing_slots);

    dbg!("Cleaning up a kind cluster");
    cleanup_kind();
}
