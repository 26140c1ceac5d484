// #[cfg(test)]
pub mod reconciler {
    use std::{collections::BTreeMap, sync::Arc};

    use http::{Request, Response};
    use hyper::Body;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::{core::ObjectMeta, discovery::ApiResource, Client, Resource, ResourceExt};
    use prometheus::Registry;
    use serde::Serialize;

    use crate::{
        context::{Context, ContextWith},
        controller::{metrics::Metrics, store::KubeStore},
        crd::{
            common::{IpFamily, LocalObjectRef},
            ip::{IPSpec, IP, IP_FINALIZER},
            prefix::{ClusterPrefix, ClusterPrefixSpec, Prefix, PrefixSpec, PREFIX_FINALIZER},
            prefix_allocation::{AllocationRequestSpec, PrefixAllocation, PrefixAllocationSpec},
        },
    };

    pub const TEST_NAMESPACE: &str = "default";

    pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
    pub struct ApiServerVerifier(pub ApiServerHandle);

    pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    impl Context {
        pub fn test() -> (Arc<Self>, ApiServerVerifier, Registry) {
            let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let mock_client = Client::new(mock_service, TEST_NAMESPACE);
            let registry = Registry::default();
            let ctx = Self {
                store: KubeStore::new(mock_client, "prefixd-test".into()),
                metrics: Metrics::default().register(&registry).unwrap(),
                diagnostics: Arc::default(),
                interval: 30,
            };
            (Arc::new(ctx), ApiServerVerifier(handle), registry)
        }
    }

    impl<T> ContextWith<T> {
        pub fn test(component: T) -> (Arc<Self>, ApiServerVerifier, Registry) {
            let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let mock_client = Client::new(mock_service, TEST_NAMESPACE);
            let registry = Registry::default();
            let ctx = Context {
                store: KubeStore::new(mock_client, "prefixd-test".into()),
                metrics: Metrics::default().register(&registry).unwrap(),
                diagnostics: Arc::default(),
                interval: 30,
            };
            let ctx_with = Self {
                inner: ctx,
                component,
            };
            (Arc::new(ctx_with), ApiServerVerifier(handle), registry)
        }
    }

    fn base_uri<T: Resource<DynamicType = ()>>() -> String {
        let api_resource = ApiResource::erase::<T>(&());
        if api_resource.group.is_empty() {
            format!("/api/{}", api_resource.api_version)
        } else {
            format!("/apis/{}", api_resource.api_version)
        }
    }

    fn collection_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        let api_resource = ApiResource::erase::<T>(&());
        match res.namespace() {
            Some(ns) => format!(
                "{}/namespaces/{}/{}",
                base_uri::<T>(),
                ns,
                api_resource.plural
            ),
            None => format!("{}/{}", base_uri::<T>(), api_resource.plural),
        }
    }

    pub fn get_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        format!("{}/{}", collection_uri(res), res.name_any())
    }

    pub fn post_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        format!("{}?", collection_uri(res))
    }

    pub fn put_uri<T: Resource<DynamicType = ()>>(res: &T, subresource: Option<&str>) -> String {
        let sub = match subresource {
            Some(s) => format!("/{s}"),
            None => String::new(),
        };
        format!("{}{}?", get_uri(res), sub)
    }

    pub fn list_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        format!("{}?", collection_uri(res))
    }

    pub fn delete_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        format!("{}?", get_uri(res))
    }

    fn patch_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        format!("{}?", get_uri(res))
    }

    pub fn assert_resource_request<T: Resource<DynamicType = ()>>(
        request: &Request<Body>,
        res: &T,
        subresource: Option<&str>,
        list: bool,
        label_selector: Option<String>,
        method: http::Method,
    ) {
        assert_eq!(request.method(), method);
        let uri = match method {
            http::Method::GET => {
                if list {
                    list_uri(res)
                } else {
                    get_uri(res)
                }
            }
            http::Method::POST => post_uri(res),
            http::Method::PUT => put_uri(res, subresource),
            http::Method::DELETE => delete_uri(res),
            http::Method::PATCH => patch_uri(res),
            _ => panic!("unimplemented method"),
        };
        let uri = if let Some(selector) = label_selector {
            format!("{uri}{}", selector)
        } else {
            uri
        };
        assert_eq!(request.uri().to_string(), uri);
    }

    pub fn api_server_response_not_found<T: Resource<DynamicType = ()>>(res: &T) -> String {
        let api_resource = ApiResource::erase::<T>(&());
        format!(
            r#"{{
  "kind": "Status",
  "apiVersion": "v1",
  "metadata": {{}},
  "status": "Failure",
  "message": "{}.{} \"{}\" not found",
  "reason": "NotFound",
  "details": {{
    "name": "{}",
    "group": "{}",
    "kind": "{}"
  }},
  "code": 404
}}"#,
            api_resource.plural,
            api_resource.group,
            res.name_any(),
            res.name_any(),
            api_resource.group,
            api_resource.plural,
        )
    }

    pub fn api_server_response_conflict<T: Resource<DynamicType = ()>>(res: &T) -> String {
        let api_resource = ApiResource::erase::<T>(&());
        format!(
            r#"{{
  "kind": "Status",
  "apiVersion": "v1",
  "metadata": {{}},
  "status": "Failure",
  "message": "Operation cannot be fulfilled on {}.{} \"{}\": the object has been modified; please apply your changes to the latest version and try again",
  "reason": "Conflict",
  "details": {{
    "name": "{}",
    "group": "{}",
    "kind": "{}"
  }},
  "code": 409
}}"#,
            api_resource.plural,
            api_resource.group,
            res.name_any(),
            res.name_any(),
            api_resource.group,
            api_resource.plural,
        )
    }

    pub fn api_server_response_resource<T: Resource<DynamicType = ()> + Serialize>(
        res: &T,
    ) -> Vec<u8> {
        serde_json::to_vec(res).unwrap()
    }

    pub fn test_labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn test_selector(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(test_labels(pairs)),
            match_expressions: None,
        }
    }

    fn test_meta(name: &str, finalizer: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            finalizers: Some(vec![finalizer.to_string()]),
            ..Default::default()
        }
    }

    fn family_of(cidr: &str) -> IpFamily {
        if cidr.contains(':') {
            IpFamily::IPv6
        } else {
            IpFamily::IPv4
        }
    }

    pub fn test_root_prefix(name: &str, cidr: &str) -> Prefix {
        Prefix {
            metadata: test_meta(name, PREFIX_FINALIZER),
            spec: PrefixSpec {
                ip_family: family_of(cidr),
                prefix: Some(cidr.to_string()),
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn test_labeled_root_prefix(name: &str, cidr: &str, labels: &[(&str, &str)]) -> Prefix {
        let mut prefix = test_root_prefix(name, cidr);
        prefix.metadata.labels = Some(test_labels(labels));
        prefix
    }

    pub fn test_child_prefix(name: &str, parent: &str, family: IpFamily, length: u8) -> Prefix {
        Prefix {
            metadata: test_meta(name, PREFIX_FINALIZER),
            spec: PrefixSpec {
                ip_family: family,
                prefix_length: Some(length),
                parent_ref: Some(LocalObjectRef::new(parent)),
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn test_exact_child_prefix(name: &str, parent: &str, cidr: &str) -> Prefix {
        Prefix {
            metadata: test_meta(name, PREFIX_FINALIZER),
            spec: PrefixSpec {
                ip_family: family_of(cidr),
                prefix: Some(cidr.to_string()),
                parent_ref: Some(LocalObjectRef::new(parent)),
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn test_selector_prefix(
        name: &str,
        selector: &[(&str, &str)],
        family: IpFamily,
        length: u8,
    ) -> Prefix {
        Prefix {
            metadata: test_meta(name, PREFIX_FINALIZER),
            spec: PrefixSpec {
                ip_family: family,
                prefix_length: Some(length),
                parent_selector: Some(test_selector(selector)),
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn test_root_cluster_prefix(name: &str, cidr: &str) -> ClusterPrefix {
        ClusterPrefix {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                finalizers: Some(vec![PREFIX_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: ClusterPrefixSpec {
                ip_family: family_of(cidr),
                prefix: Some(cidr.to_string()),
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn test_child_cluster_prefix(name: &str, parent: &str, length: u8) -> ClusterPrefix {
        ClusterPrefix {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                finalizers: Some(vec![PREFIX_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: ClusterPrefixSpec {
                prefix_length: Some(length),
                parent_ref: Some(LocalObjectRef::new(parent)),
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn test_ip(name: &str, parent: &str, family: IpFamily) -> IP {
        IP {
            metadata: test_meta(name, IP_FINALIZER),
            spec: IPSpec {
                ip_family: family,
                ip: None,
                prefix_ref: Some(LocalObjectRef::new(parent)),
                prefix_selector: None,
            },
            status: None,
        }
    }

    pub fn test_allocation(
        name: &str,
        parent: Option<&str>,
        request: AllocationRequestSpec,
    ) -> PrefixAllocation {
        PrefixAllocation {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(TEST_NAMESPACE.to_string()),
                ..Default::default()
            },
            spec: PrefixAllocationSpec {
                prefix_ref: parent.map(LocalObjectRef::new),
                prefix_selector: None,
                request,
            },
            status: None,
        }
    }

    pub fn test_length_request(family: IpFamily, length: u8) -> AllocationRequestSpec {
        AllocationRequestSpec {
            ip_family: family,
            prefix_length: Some(length),
            ..Default::default()
        }
    }
}

pub mod store {
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex, MutexGuard},
    };

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, SubsecRound, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
    use http::{Request, Response, StatusCode};
    use hyper::Body;
    use kube::{
        core::ObjectMeta,
        runtime::events::{Event, EventType},
        Api, Client, Resource, ResourceExt,
    };
    use prometheus::Registry;
    use serde_json::Value;

    use crate::{
        context::{Context, ContextWith},
        controller::{error::Error, metrics::Metrics, object::Object, store::Store},
        util::match_selector,
    };

    use super::reconciler::{ApiServerHandle, TEST_NAMESPACE};

    type Key = (String, String, String);

    #[derive(Debug, Clone, PartialEq)]
    pub struct RecordedEvent {
        pub kind: String,
        pub name: String,
        pub type_: EventType,
        pub reason: String,
        pub note: Option<String>,
    }

    /// In-memory object store with the semantics of the API server the controllers rely on.
    #[derive(Clone, Default)]
    pub struct MemoryStore {
        inner: Arc<Mutex<Inner>>,
    }

    #[derive(Default)]
    struct Inner {
        objects: BTreeMap<Key, Value>,
        events: Vec<RecordedEvent>,
        counter: u64,
        clock: Option<DateTime<Utc>>,
    }

    impl Inner {
        fn next(&mut self) -> u64 {
            self.counter += 1;
            self.counter
        }

        // Each object is stamped one second after the previous one,
        // so the creation order survives the second precision of timestamps.
        fn tick(&mut self) -> Time {
            let next = match self.clock {
                Some(last) => last + Duration::seconds(1),
                None => Utc::now().trunc_subsecs(0),
            };
            self.clock = Some(next);
            Time(next)
        }

        // Removes the object or marks it deleting when finalizers remain. Dependents follow.
        fn delete(&mut self, key: &Key) {
            let Some(value) = self.objects.get(key) else {
                return;
            };
            let meta = meta_of(value);
            if !meta.finalizers.clone().unwrap_or_default().is_empty() {
                if meta.deletion_timestamp.is_none() {
                    let now = Time(Utc::now());
                    let rv = self.next();
                    if let Some(value) = self.objects.get_mut(key) {
                        value["metadata"]["deletionTimestamp"] = serde_json::json!(now);
                        value["metadata"]["resourceVersion"] = Value::String(rv.to_string());
                    }
                }
                return;
            }
            self.objects.remove(key);
            if let Some(uid) = meta.uid {
                let dependents: Vec<Key> = self
                    .objects
                    .iter()
                    .filter(|(_, v)| {
                        meta_of(v)
                            .owner_references
                            .unwrap_or_default()
                            .iter()
                            .any(|r| r.uid == uid)
                    })
                    .map(|(k, _)| k.clone())
                    .collect();
                for dependent in dependents.iter() {
                    self.delete(dependent);
                }
            }
        }
    }

    fn meta_of(value: &Value) -> ObjectMeta {
        serde_json::from_value(value["metadata"].clone()).unwrap_or_default()
    }

    fn key_of<K: Object>(namespace: Option<&str>, name: &str) -> Key {
        (
            K::kind(&()).to_string(),
            namespace.unwrap_or_default().to_string(),
            name.to_string(),
        )
    }

    fn check_version(stored: &Value, obj: &ObjectMeta, name: &str) -> Result<(), Error> {
        match obj.resource_version.as_ref() {
            Some(rv) if Some(rv) != meta_of(stored).resource_version.as_ref() => {
                Err(Error::Conflict(name.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn status_response(code: StatusCode, reason: &str, message: String) -> Response<Body> {
        let status = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": code.as_u16(),
        });
        let mut response = Response::new(Body::from(status.to_string()));
        *response.status_mut() = code;
        response
    }

    // Answers the json patches the kube finalizer helper sends for one kind.
    async fn serve_patches<K: Object>(
        store: MemoryStore,
        namespace: Option<String>,
        mut handle: ApiServerHandle,
    ) {
        while let Some((request, send)) = handle.next_request().await {
            let response = answer::<K>(&store, namespace.as_deref(), request).await;
            send.send_response(response);
        }
    }

    async fn answer<K: Object>(
        store: &MemoryStore,
        namespace: Option<&str>,
        request: Request<Body>,
    ) -> Response<Body> {
        if request.method() != http::Method::PATCH {
            return status_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "MethodNotAllowed",
                format!("{} is not served", request.method()),
            );
        }
        let name = request
            .uri()
            .path()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let patch = match hyper::body::to_bytes(request.into_body())
            .await
            .map_err(|e| e.to_string())
            .and_then(|body| {
                serde_json::from_slice::<json_patch::Patch>(&body).map_err(|e| e.to_string())
            }) {
            Ok(patch) => patch,
            Err(e) => return status_response(StatusCode::BAD_REQUEST, "BadRequest", e),
        };
        store.apply_patch::<K>(namespace, &name, &patch)
    }

    impl MemoryStore {
        pub fn new() -> MemoryStore {
            MemoryStore::default()
        }

        fn lock(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Stores `obj` as is, status included, assigning the server side metadata it lacks.
        pub fn seed<K: Object>(&self, obj: &K) -> K {
            let mut inner = self.lock();
            let mut obj = obj.clone();
            let n = inner.next();
            let created = inner.tick();
            let meta = obj.meta_mut();
            meta.uid.get_or_insert_with(|| format!("uid-{n:05}"));
            meta.creation_timestamp.get_or_insert(created);
            meta.resource_version = Some(n.to_string());
            let key = key_of::<K>(obj.namespace().as_deref(), &obj.name_any());
            let value = serde_json::to_value(&obj).unwrap();
            inner.objects.insert(key, value);
            obj
        }

        pub fn lookup<K: Object>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
            self.lock()
                .objects
                .get(&key_of::<K>(namespace, name))
                .and_then(|v| serde_json::from_value(v.clone()).ok())
        }

        pub fn all<K: Object>(&self) -> Vec<K> {
            let kind = K::kind(&()).to_string();
            self.lock()
                .objects
                .iter()
                .filter(|((k, _, _), _)| *k == kind)
                .filter_map(|(_, v)| serde_json::from_value(v.clone()).ok())
                .collect()
        }

        // Applies `patch` like the API server: a missing finalizer list tests as null,
        // and a deleting object goes away once its last finalizer is removed.
        fn apply_patch<K: Object>(
            &self,
            namespace: Option<&str>,
            name: &str,
            patch: &json_patch::Patch,
        ) -> Response<Body> {
            let mut inner = self.lock();
            let key = key_of::<K>(namespace, name);
            let Some(mut value) = inner.objects.get(&key).cloned() else {
                return status_response(
                    StatusCode::NOT_FOUND,
                    "NotFound",
                    format!("{name} not found"),
                );
            };
            if value["metadata"].get("finalizers").is_none() {
                value["metadata"]["finalizers"] = Value::Null;
            }
            if let Err(e) = json_patch::patch(&mut value, &patch.0) {
                return status_response(StatusCode::UNPROCESSABLE_ENTITY, "Invalid", e.to_string());
            }
            if let Some(meta) = value["metadata"].as_object_mut() {
                if meta.get("finalizers").map(Value::is_null).unwrap_or(false) {
                    meta.remove("finalizers");
                }
            }
            let n = inner.next();
            value["metadata"]["resourceVersion"] = Value::String(n.to_string());
            let meta = meta_of(&value);
            inner.objects.insert(key.clone(), value.clone());
            if meta.deletion_timestamp.is_some() && meta.finalizers.unwrap_or_default().is_empty() {
                inner.delete(&key);
            }
            Response::new(Body::from(value.to_string()))
        }

        pub fn events(&self) -> Vec<RecordedEvent> {
            self.lock().events.clone()
        }

        pub fn context(&self) -> (Arc<Context<MemoryStore>>, Registry) {
            let registry = Registry::default();
            let ctx = Context {
                store: self.clone(),
                metrics: Metrics::default().register(&registry).unwrap(),
                diagnostics: Arc::default(),
                interval: 30,
            };
            (Arc::new(ctx), registry)
        }

        pub fn context_with<T>(&self, component: T) -> (Arc<ContextWith<T, MemoryStore>>, Registry) {
            let registry = Registry::default();
            let ctx = Context {
                store: self.clone(),
                metrics: Metrics::default().register(&registry).unwrap(),
                diagnostics: Arc::default(),
                interval: 30,
            };
            (
                Arc::new(ContextWith {
                    inner: ctx,
                    component,
                }),
                registry,
            )
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn get<K: Object>(
            &self,
            namespace: Option<&str>,
            name: &str,
        ) -> Result<Option<K>, Error> {
            self.lock()
                .objects
                .get(&key_of::<K>(namespace, name))
                .map(|v| serde_json::from_value(v.clone()).map_err(Error::Serialization))
                .transpose()
        }

        async fn list<K: Object>(
            &self,
            namespace: Option<&str>,
            selector: Option<&LabelSelector>,
        ) -> Result<Vec<K>, Error> {
            let kind = K::kind(&()).to_string();
            let inner = self.lock();
            let mut res = Vec::new();
            for ((k, ns, _), value) in inner.objects.iter() {
                if *k != kind || namespace.map(|n| n != ns.as_str()).unwrap_or(false) {
                    continue;
                }
                if let Some(selector) = selector {
                    let labels = meta_of(value).labels.unwrap_or_default();
                    if !match_selector(&labels, selector).map_err(Error::KubeLibrary)? {
                        continue;
                    }
                }
                res.push(serde_json::from_value(value.clone()).map_err(Error::Serialization)?);
            }
            Ok(res)
        }

        async fn create<K: Object>(&self, obj: &K) -> Result<K, Error> {
            let mut inner = self.lock();
            let mut obj = obj.clone();
            let n = inner.next();
            let created = inner.tick();
            let meta = obj.meta_mut();
            if meta.name.is_none() {
                meta.name = Some(format!(
                    "{}{:05}",
                    meta.generate_name.clone().unwrap_or_default(),
                    n
                ));
            }
            meta.uid = Some(format!("uid-{n:05}"));
            meta.resource_version = Some(n.to_string());
            meta.creation_timestamp = Some(created);
            meta.deletion_timestamp = None;
            let key = key_of::<K>(obj.namespace().as_deref(), &obj.name_any());
            if inner.objects.contains_key(&key) {
                return Err(Error::Conflict(obj.name_any()));
            }
            let mut value = serde_json::to_value(&obj).map_err(Error::Serialization)?;
            if let Some(map) = value.as_object_mut() {
                map.remove("status");
            }
            let created = serde_json::from_value(value.clone()).map_err(Error::Serialization)?;
            inner.objects.insert(key, value);
            Ok(created)
        }

        async fn replace<K: Object>(&self, obj: &K) -> Result<K, Error> {
            let mut inner = self.lock();
            let key = key_of::<K>(obj.namespace().as_deref(), &obj.name_any());
            let stored = inner
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::NotFound(obj.name_any()))?;
            check_version(&stored, obj.meta(), &obj.name_any())?;

            let stored_meta = meta_of(&stored);
            let mut obj = obj.clone();
            let n = inner.next();
            let meta = obj.meta_mut();
            meta.uid = stored_meta.uid;
            meta.creation_timestamp = stored_meta.creation_timestamp;
            meta.deletion_timestamp = stored_meta.deletion_timestamp.clone();
            meta.resource_version = Some(n.to_string());
            let released = stored_meta.deletion_timestamp.is_some() && obj.finalizers().is_empty();

            let mut value = serde_json::to_value(&obj).map_err(Error::Serialization)?;
            if let Some(map) = value.as_object_mut() {
                match stored.get("status") {
                    Some(status) => map.insert("status".to_string(), status.clone()),
                    None => map.remove("status"),
                };
            }
            let replaced = serde_json::from_value(value.clone()).map_err(Error::Serialization)?;
            inner.objects.insert(key.clone(), value);
            if released {
                inner.delete(&key);
            }
            Ok(replaced)
        }

        async fn replace_status<K: Object>(&self, obj: &K) -> Result<K, Error> {
            let mut inner = self.lock();
            let key = key_of::<K>(obj.namespace().as_deref(), &obj.name_any());
            let mut stored = inner
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::NotFound(obj.name_any()))?;
            check_version(&stored, obj.meta(), &obj.name_any())?;

            let value = serde_json::to_value(obj).map_err(Error::Serialization)?;
            let n = inner.next();
            if let Some(map) = stored.as_object_mut() {
                match value.get("status") {
                    Some(status) => map.insert("status".to_string(), status.clone()),
                    None => map.remove("status"),
                };
            }
            stored["metadata"]["resourceVersion"] = Value::String(n.to_string());
            let replaced = serde_json::from_value(stored.clone()).map_err(Error::Serialization)?;
            inner.objects.insert(key, stored);
            Ok(replaced)
        }

        async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<(), Error> {
            self.lock().delete(&key_of::<K>(namespace, name));
            Ok(())
        }

        async fn record_event<K: Object>(&self, obj: &K, event: Event) -> Result<(), Error> {
            self.lock().events.push(RecordedEvent {
                kind: K::kind(&()).to_string(),
                name: obj.name_any(),
                type_: event.type_,
                reason: event.reason,
                note: event.note,
            });
            Ok(())
        }

        fn api<K: Object>(&self, namespace: Option<&str>) -> Api<K> {
            let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
            tokio::spawn(serve_patches::<K>(
                self.clone(),
                namespace.map(String::from),
                handle,
            ));
            K::api(Client::new(service, TEST_NAMESPACE), namespace)
        }
    }
}

pub async fn test_trace() {
    // a subscriber may already be installed by another test
    let _ = prefixd_trace::init::prepare_tracing(prefixd_trace::init::TraceConfig {
        level: "info".to_string(),
        format: String::new(),
        file: None,
    });
}
