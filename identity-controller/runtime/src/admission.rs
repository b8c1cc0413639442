use crate::inject::{self, InjectionConfig};
use crate::k8s;
use crate::namespaces::SharedNamespaceIndex;
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::DynamicObject;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// The mutating interceptor for workload-shaped objects.
///
/// Injection requires a double opt-in: the workload must carry the inject
/// label and its namespace the injection label. Everything the hot path
/// needs is derived from the request and the watch-fed namespace index;
/// it performs no API calls. Internal failures deny admission: a workload
/// that opted into identity must not run without it.
#[derive(Clone)]
pub struct Admission {
    namespaces: SharedNamespaceIndex,
    config: Arc<InjectionConfig>,
    dry_run: bool,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req)
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(namespaces: SharedNamespaceIndex, config: InjectionConfig, dry_run: bool) -> Self {
        Self {
            namespaces,
            config: Arc::new(config),
            dry_run,
        }
    }

    fn admit(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let kind = req.kind.kind.clone();

        let Some(obj) = req.object else {
            // An admission call without an object (e.g. a delete) has
            // nothing to inject into.
            return rsp;
        };

        let ns = match req.namespace.as_deref().or(obj.metadata.namespace.as_deref()) {
            Some(ns) => ns.to_string(),
            None => return deny_fail_closed(rsp, &kind, "request carries no namespace"),
        };
        let name = obj.metadata.name.clone().unwrap_or_default();

        if !workload_opted_in(&obj) {
            trace!(%ns, %name, %kind, "Workload has not opted in");
            return rsp;
        }
        if !self.namespaces.read().injection_enabled(&ns) {
            debug!(%ns, %name, %kind, "Namespace has not opted in");
            return rsp;
        }

        match inject::patch_for(&obj, &ns, &self.config) {
            Ok(None) => {
                debug!(%ns, %name, %kind, "Chain already present");
                rsp
            }
            Ok(Some(patch)) => {
                if self.dry_run {
                    info!(%ns, %name, %kind, ?patch, "Dry run; would inject sidecar chain");
                    return rsp;
                }
                info!(%ns, %name, %kind, "Injecting sidecar chain");
                let fallback = rsp.clone();
                match rsp.with_patch(patch) {
                    Ok(rsp) => rsp,
                    Err(error) => deny_fail_closed(fallback, &kind, &error.to_string()),
                }
            }
            Err(error) => deny_fail_closed(rsp, &kind, &error.to_string()),
        }
    }
}

/// The fail-closed path: an opted-in workload that cannot be injected is
/// rejected rather than silently admitted without identity.
fn deny_fail_closed(rsp: AdmissionResponse, kind: &str, reason: &str) -> AdmissionResponse {
    warn!(%kind, %reason, "Denying admission");
    rsp.deny(format!(
        "refusing to admit {kind} without identity injection: {reason}"
    ))
}

fn workload_opted_in(obj: &DynamicObject) -> bool {
    obj.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(k8s::INJECT_LABEL))
        .map(|v| v == k8s::INJECT_ENABLED)
        .unwrap_or(false)
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inject::tests::{deployment_object, injection_config};
    use crate::namespaces::NamespaceIndex;
    use kube::api::ObjectMeta;

    fn admission(ns_opted_in: bool, dry_run: bool) -> Admission {
        let namespaces = NamespaceIndex::shared();
        namespaces.write().apply(k8s::Namespace {
            metadata: ObjectMeta {
                name: Some("agents".to_string()),
                labels: ns_opted_in.then(|| {
                    [(
                        k8s::NAMESPACE_INJECT_LABEL.to_string(),
                        k8s::INJECT_ENABLED.to_string(),
                    )]
                    .into_iter()
                    .collect()
                }),
                ..Default::default()
            },
            ..Default::default()
        });
        Admission::new(namespaces, injection_config(), dry_run)
    }

    fn request_for(obj: &DynamicObject) -> AdmissionRequest {
        let kind = obj
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default();
        let review: Review = serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "review-1",
                "kind": {"group": "apps", "version": "v1", "kind": kind},
                "resource": {"group": "apps", "version": "v1", "resource": "deployments"},
                "operation": "CREATE",
                "userInfo": {},
                "namespace": "agents",
                "name": obj.metadata.name.clone().unwrap_or_default(),
                "object": serde_json::to_value(obj).unwrap(),
            },
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    #[test]
    fn requires_both_opt_ins() {
        // Workload label missing: allowed untouched.
        let mut obj = deployment_object();
        obj.metadata.labels = None;
        let rsp = admission(true, false).admit(request_for(&obj));
        assert!(rsp.allowed);
        assert!(rsp.patch.is_none());

        // Namespace label missing: allowed untouched.
        let rsp = admission(false, false).admit(request_for(&deployment_object()));
        assert!(rsp.allowed);
        assert!(rsp.patch.is_none());

        // Both present: patched.
        let rsp = admission(true, false).admit(request_for(&deployment_object()));
        assert!(rsp.allowed);
        assert!(rsp.patch.is_some());
    }

    #[test]
    fn a_retried_admission_does_not_double_inject() {
        let admission = admission(true, false);
        let mut obj = deployment_object();

        let rsp = admission.admit(request_for(&obj));
        let patch: json_patch::Patch =
            serde_json::from_slice(rsp.patch.as_deref().unwrap()).unwrap();
        json_patch::patch(&mut obj.data, &patch).unwrap();

        // Admitting the patched object again must leave it unchanged.
        let rsp = admission.admit(request_for(&obj));
        assert!(rsp.allowed);
        assert!(rsp.patch.is_none());
    }

    #[test]
    fn uninjectable_opted_in_workloads_are_denied() {
        let mut obj = deployment_object();
        // Strip the pod template: injection cannot proceed, so the request
        // must be denied rather than silently admitted without identity.
        obj.data["spec"].as_object_mut().unwrap().remove("template");

        let rsp = admission(true, false).admit(request_for(&obj));
        assert!(!rsp.allowed, "fail-closed: the request must be denied");
        let message = rsp.result.message.clone();
        assert!(
            message.contains("without identity injection"),
            "unexpected deny message: {message}"
        );
    }

    #[test]
    fn dry_run_allows_without_patching() {
        let rsp = admission(true, true).admit(request_for(&deployment_object()));
        assert!(rsp.allowed);
        assert!(rsp.patch.is_none());
    }
}
