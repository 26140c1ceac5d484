use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{DeleteParams, ListParams, PostParams},
    runtime::events::{Event, Recorder, Reporter},
    Api, Client, ResourceExt,
};

use crate::{
    crd::common::IpFamily,
    util::{get_label_selector, is_deleting},
};

use super::{
    error::Error,
    object::{AllocationObject, Object, PrefixObject},
};

/// Read and write access to the resources the controllers work on.
/// Writes carry the resource version of the given object and fail with `Error::Conflict` when it is stale.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, Error>;

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<K>, Error>;

    async fn create<K: Object>(&self, obj: &K) -> Result<K, Error>;

    /// Replaces metadata and spec. The status is left untouched.
    async fn replace<K: Object>(&self, obj: &K) -> Result<K, Error>;

    /// Replaces the status subresource only.
    async fn replace_status<K: Object>(&self, obj: &K) -> Result<K, Error>;

    /// Deleting a missing object is not an error.
    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<(), Error>;

    async fn record_event<K: Object>(&self, obj: &K, event: Event) -> Result<(), Error>;

    /// Api handle the kube finalizer helper patches through.
    fn api<K: Object>(&self, namespace: Option<&str>) -> Api<K>;
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    reporter: Reporter,
}

impl KubeStore {
    pub fn new(client: Client, reporter: Reporter) -> KubeStore {
        KubeStore { client, reporter }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn map_write_error(name: String) -> impl FnOnce(kube::Error) -> Error {
    move |e| match e {
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(name),
        e => Error::Kube(e),
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, Error> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(Error::Kube)
    }

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<K>, Error> {
        let params = match selector {
            Some(selector) => {
                let labels = get_label_selector(selector).map_err(Error::KubeLibrary)?;
                ListParams::default().labels(&labels)
            }
            None => ListParams::default(),
        };
        let list = self.api::<K>(namespace)
            .list(&params)
            .await
            .map_err(Error::Kube)?;
        Ok(list.items)
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K, Error> {
        let name = obj
            .meta()
            .name
            .clone()
            .or(obj.meta().generate_name.clone())
            .unwrap_or_default();
        self.api::<K>(obj.namespace().as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(map_write_error(name))
    }

    async fn replace<K: Object>(&self, obj: &K) -> Result<K, Error> {
        self.api::<K>(obj.namespace().as_deref())
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(map_write_error(obj.name_any()))
    }

    async fn replace_status<K: Object>(&self, obj: &K) -> Result<K, Error> {
        self.api::<K>(obj.namespace().as_deref())
            .replace_status(
                &obj.name_any(),
                &PostParams::default(),
                serde_json::to_vec(obj).map_err(Error::Serialization)?,
            )
            .await
            .map_err(map_write_error(obj.name_any()))
    }

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<(), Error> {
        match self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    async fn record_event<K: Object>(&self, obj: &K, event: Event) -> Result<(), Error> {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            obj.object_ref(&()),
        );
        recorder.publish(event).await.map_err(Error::Kube)
    }

    fn api<K: Object>(&self, namespace: Option<&str>) -> Api<K> {
        K::api(self.client.clone(), namespace)
    }
}

/// Live allocations bound to the parent named `parent`.
pub fn allocations_referencing<'a, A: AllocationObject>(
    allocations: &'a [A],
    parent: &str,
) -> Vec<&'a A> {
    allocations
        .iter()
        .filter(|a| !is_deleting(*a))
        .filter(|a| a.prefix_ref().map(|r| r.name == parent).unwrap_or(false))
        .collect()
}

/// Allocated and live prefixes of the given family.
pub fn allocated_with_family<P: PrefixObject>(prefixes: Vec<P>, family: IpFamily) -> Vec<P> {
    prefixes
        .into_iter()
        .filter(|p| p.prefix_spec().ip_family == family)
        .filter(|p| p.is_allocated() && !is_deleting(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_include;
    use http::Response;
    use hyper::{body::to_bytes, Body};
    use kube::ResourceExt;

    use crate::{
        context::{Context, Ctx},
        controller::error::Error,
        crd::{common::Phase, prefix::Prefix},
        fixture::reconciler::{
            api_server_response_conflict, api_server_response_not_found,
            api_server_response_resource, assert_resource_request, test_labeled_root_prefix,
            test_root_prefix, test_selector, timeout_after_1s, TEST_NAMESPACE,
        },
    };

    use super::Store;

    fn stored_prefix() -> Prefix {
        let mut prefix = test_root_prefix("root", "10.0.0.0/24");
        prefix.metadata.resource_version = Some("10".to_string());
        prefix.metadata.uid = Some("root-uid".to_string());
        prefix
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let (ctx, fakeserver, _) = Context::test();
        let prefix = stored_prefix();
        let expected = prefix.clone();
        let mut handle = fakeserver.0;
        let mocksvr = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_resource_request(&request, &expected, None, false, None, http::Method::GET);
            send.send_response(
                Response::builder()
                    .status(404)
                    .body(Body::from(api_server_response_not_found(&expected)))
                    .unwrap(),
            );
        });
        let got = ctx
            .store()
            .get::<Prefix>(Some(TEST_NAMESPACE), &prefix.name_any())
            .await
            .unwrap();
        assert!(got.is_none());
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn replace_maps_conflict() {
        let (ctx, fakeserver, _) = Context::test();
        let prefix = stored_prefix();
        let expected = prefix.clone();
        let mut handle = fakeserver.0;
        let mocksvr = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_resource_request(&request, &expected, None, false, None, http::Method::PUT);
            let body = to_bytes(request.into_body()).await.unwrap();
            let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_json_include!(
                actual: body,
                expected: serde_json::json!({ "metadata": { "resourceVersion": "10" } })
            );
            send.send_response(
                Response::builder()
                    .status(409)
                    .body(Body::from(api_server_response_conflict(&expected)))
                    .unwrap(),
            );
        });
        let res = ctx.store().replace(&prefix).await;
        assert!(matches!(res, Err(Error::Conflict(name)) if name == "root"));
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn replace_status_puts_status_subresource() {
        let (ctx, fakeserver, _) = Context::test();
        let mut prefix = stored_prefix();
        prefix.status = Some(Default::default());
        prefix.status.as_mut().unwrap().set_phase(Phase::Allocated);
        prefix.status.as_mut().unwrap().available = vec!["10.0.0.0/24".to_string()];
        let expected = prefix.clone();
        let mut handle = fakeserver.0;
        let mocksvr = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_resource_request(
                &request,
                &expected,
                Some("status"),
                false,
                None,
                http::Method::PUT,
            );
            let body = to_bytes(request.into_body()).await.unwrap();
            let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_json_include!(
                actual: body,
                expected: serde_json::json!({
                    "status": { "phase": "Allocated", "available": ["10.0.0.0/24"] }
                })
            );
            send.send_response(
                Response::builder()
                    .body(Body::from(api_server_response_resource(&expected)))
                    .unwrap(),
            );
        });
        let replaced = ctx.store().replace_status(&prefix).await.unwrap();
        let status = replaced.status.unwrap();
        assert!(status.is_allocated());
        assert_eq!(status.available, vec!["10.0.0.0/24".to_string()]);
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn list_passes_label_selector() {
        let (ctx, fakeserver, _) = Context::test();
        let prefix = test_labeled_root_prefix("root", "10.0.0.0/24", &[("pool", "a")]);
        let expected = prefix.clone();
        let mut handle = fakeserver.0;
        let mocksvr = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(
                request.uri().path(),
                "/apis/ipam.prefixd.io/v1alpha1/namespaces/default/prefixes"
            );
            assert!(request
                .uri()
                .query()
                .unwrap_or_default()
                .contains("labelSelector=pool%3Da"));
            let list = serde_json::json!({
                "apiVersion": "ipam.prefixd.io/v1alpha1",
                "kind": "PrefixList",
                "metadata": {},
                "items": [expected],
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&list).unwrap()))
                    .unwrap(),
            );
        });
        let listed = ctx
            .store()
            .list::<Prefix>(Some(TEST_NAMESPACE), Some(&test_selector(&[("pool", "a")])))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name_any(), "root");
        timeout_after_1s(mocksvr).await;
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let (ctx, fakeserver, _) = Context::test();
        let prefix = stored_prefix();
        let expected = prefix.clone();
        let mut handle = fakeserver.0;
        let mocksvr = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_resource_request(&request, &expected, None, false, None, http::Method::DELETE);
            send.send_response(
                Response::builder()
                    .status(404)
                    .body(Body::from(api_server_response_not_found(&expected)))
                    .unwrap(),
            );
        });
        ctx.store()
            .delete::<Prefix>(Some(TEST_NAMESPACE), "root")
            .await
            .unwrap();
        timeout_after_1s(mocksvr).await;
    }
}
