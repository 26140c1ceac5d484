use std::{sync::Arc, time::Duration};

use kube::{
    api::{DeleteParams, PostParams},
    Api, Client, ResourceExt,
};
use prefixd_kubernetes::{
    context::State,
    controller::{
        self, allocator::Allocator, backoff::Backoff, metrics::Metrics, store::KubeStore,
    },
    crd::{
        common::{IpFamily, Phase},
        prefix::Prefix,
    },
    fixture::{
        reconciler::{test_child_prefix, test_root_prefix, TEST_NAMESPACE},
        test_trace,
    },
};

use crate::common::{cleanup_kind, setup_kind};

mod common;

#[tokio::test]
#[ignore = "use kind cluster"]
async fn integration_test_prefix() {
    tracing::info!("Creating a kind cluster");
    setup_kind();

    test_trace().await;

    tracing::info!("Getting kube client");
    let client = Client::try_default().await.unwrap();
    let store = KubeStore::new(client.clone(), "prefixd-test".into());
    let allocator = Arc::new(Allocator::new(
        Arc::new(Backoff::new(Duration::from_secs(1), Duration::from_secs(8))),
        None,
    ));
    let ctx = State::default().to_context_with(store, 30, allocator, Metrics::default());

    let prefix_api = Api::<Prefix>::namespaced(client.clone(), TEST_NAMESPACE);
    let params = PostParams::default();

    tracing::info!("Creating a root Prefix");
    let root = test_root_prefix("root", "10.0.0.0/24");
    prefix_api.create(&params, &root).await.unwrap();

    tracing::info!("Reconciling the root Prefix");
    let applied = prefix_api.get(&root.name_any()).await.unwrap();
    controller::reconciler::prefix::reconciler(Arc::new(applied), ctx.clone())
        .await
        .unwrap();
    let applied = prefix_api.get(&root.name_any()).await.unwrap();
    assert_eq!(applied.status.unwrap().phase, Some(Phase::Allocated));

    tracing::info!("Creating a child Prefix");
    let child = test_child_prefix("child", "root", IpFamily::IPv4, 28);
    prefix_api.create(&params, &child).await.unwrap();

    tracing::info!("Reconciling the child Prefix to request a block");
    let applied = prefix_api.get(&child.name_any()).await.unwrap();
    controller::reconciler::prefix::reconciler(Arc::new(applied), ctx.clone())
        .await
        .unwrap();

    tracing::info!("Reconciling the root Prefix to grant the block");
    let applied = prefix_api.get(&root.name_any()).await.unwrap();
    controller::reconciler::prefix::reconciler(Arc::new(applied), ctx.clone())
        .await
        .unwrap();

    tracing::info!("Reconciling the child Prefix to take the block");
    let applied = prefix_api.get(&child.name_any()).await.unwrap();
    controller::reconciler::prefix::reconciler(Arc::new(applied), ctx.clone())
        .await
        .unwrap();

    let applied = prefix_api.get(&child.name_any()).await.unwrap();
    assert_eq!(applied.spec.prefix, Some("10.0.0.0/28".to_string()));
    assert_eq!(applied.status.unwrap().phase, Some(Phase::Allocated));

    tracing::info!("Deleting the child Prefix");
    prefix_api
        .delete(&child.name_any(), &DeleteParams::default())
        .await
        .unwrap();
    let deleting = prefix_api.get(&child.name_any()).await.unwrap();
    controller::reconciler::prefix::reconciler(Arc::new(deleting), ctx.clone())
        .await
        .unwrap();
    assert!(prefix_api.get_opt(&child.name_any()).await.unwrap().is_none());

    tracing::info!("Deleting the root Prefix");
    prefix_api
        .delete(&root.name_any(), &DeleteParams::default())
        .await
        .unwrap();
    // the garbage collector removes the child allocation asynchronously
    let mut released = false;
    for _ in 0..30 {
        let deleting = prefix_api.get(&root.name_any()).await.unwrap();
        if controller::reconciler::prefix::reconciler(Arc::new(deleting), ctx.clone())
            .await
            .is_ok()
        {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert!(released);
    assert!(prefix_api.get_opt(&root.name_any()).await.unwrap().is_none());

    tracing::info!("Cleaning up a kind cluster");
    cleanup_kind();
}
