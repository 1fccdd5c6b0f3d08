//! A tower layer that counts and times every request the Kubernetes client
//! sends, recorded into a shared [`Registry`] under the `kube_client_`
//! prefix.

use std::task::{Context as TaskContext, Poll};

use http::{Request, Response};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio::time::Instant;
use tower::{Layer, Service};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct MethodLabel {
    method: String,
}

#[derive(Clone)]
pub struct MetricsLayer {
    requests: Family<MethodLabel, Counter>,
    duration: Family<MethodLabel, Histogram>,
}

fn new_duration_histogram() -> Histogram {
    Histogram::new(prometheus_client::metrics::histogram::exponential_buckets(0.005, 2.0, 12))
}

impl MetricsLayer {
    pub fn new(registry: &mut Registry) -> Self {
        let requests = Family::default();
        let duration = Family::new_with_constructor(
            new_duration_histogram as fn() -> Histogram,
        );
        registry.register(
            "kube_client_requests",
            "Total number of Kubernetes API requests issued",
            requests.clone(),
        );
        registry.register(
            "kube_client_request_duration_seconds",
            "Histogram of Kubernetes API request durations",
            duration.clone(),
        );
        Self { requests, duration }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            requests: self.requests.clone(),
            duration: self.duration.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    requests: Family<MethodLabel, Counter>,
    duration: Family<MethodLabel, Histogram>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let label = MethodLabel {
            method: req.method().to_string(),
        };
        let requests = self.requests.clone();
        let duration = self.duration.clone();
        let start = Instant::now();
        let mut inner = self.inner.clone();
        std::mem::swap(&mut self.inner, &mut inner);
        Box::pin(async move {
            requests.get_or_create(&label).inc();
            let result = inner.call(req).await;
            duration
                .get_or_create(&label)
                .observe(start.elapsed().as_secs_f64());
            result
        })
    }
}
