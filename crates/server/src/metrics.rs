#![cfg(feature = "metrics")]

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use anyhow::Result;
use axum::{extract::MatchedPath, http::Request, response::Response};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tower::{Layer, Service};

#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    logins_total: IntCounterVec,
    device_cap_evictions_total: IntCounter,
    db_ready: IntGauge,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let counter = IntCounterVec::new(
            Opts::new(
                "sessionward_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(counter.clone()))?;

        let latency = HistogramVec::new(
            HistogramOpts::new(
                "sessionward_http_request_duration_seconds",
                "HTTP request latency, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(latency.clone()))?;

        let logins = IntCounterVec::new(
            Opts::new(
                "sessionward_logins_total",
                "Login attempts, labeled by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(logins.clone()))?;

        let evictions = IntCounter::new(
            "sessionward_device_cap_evictions_total",
            "Sessions revoked to keep a user under the device cap",
        )?;
        registry.register(Box::new(evictions.clone()))?;

        let db_ready = IntGauge::new(
            "sessionward_db_ready",
            "Whether the database was reachable at the last readiness probe",
        )?;
        registry.register(Box::new(db_ready.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total: counter,
            http_request_duration_seconds: latency,
            logins_total: logins,
            device_cap_evictions_total: evictions,
            db_ready,
        }))
    }

    pub fn observe_http_latency(&self, route: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.http_request_duration_seconds
            .with_label_values(&[route, status.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    /// `outcome` is one of `success`, `suspicious` or `invalid_credentials`.
    pub fn increment_login(&self, outcome: &str) {
        self.logins_total.with_label_values(&[outcome]).inc();
    }

    pub fn increment_device_cap_eviction(&self) {
        self.device_cap_evictions_total.inc();
    }

    pub fn set_db_ready(&self, ready: bool) {
        self.db_ready.set(i64::from(ready));
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Observes every response into `sessionward_http_request_duration_seconds`.
#[derive(Clone)]
pub struct HttpLatencyLayer {
    metrics: Option<Arc<MetricsContext>>,
}

impl HttpLatencyLayer {
    pub fn new(metrics: Option<Arc<MetricsContext>>) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for HttpLatencyLayer {
    type Service = HttpLatency<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpLatency {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Clone)]
pub struct HttpLatency<S> {
    inner: S,
    metrics: Option<Arc<MetricsContext>>,
}

type ResponseFuture<E> = Pin<Box<dyn Future<Output = Result<Response, E>> + Send>>;

impl<S, B> Service<Request<B>> for HttpLatency<S>
where
    S: Service<Request<B>, Response = Response>,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let Some(metrics) = self.metrics.clone() else {
            return Box::pin(self.inner.call(request));
        };
        // Requests that matched no route share the `unmatched` label.
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map_or("unmatched", MatchedPath::as_str)
            .to_owned();
        let started = Instant::now();
        let pending = self.inner.call(request);

        Box::pin(async move {
            let response = pending.await?;
            metrics.observe_http_latency(&route, response.status().as_u16(), started.elapsed());
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_counters() {
        let metrics = MetricsContext::init().expect("metrics");
        metrics.increment_login("suspicious");
        metrics.increment_device_cap_eviction();
        metrics
            .http_requests_total
            .with_label_values(&["/auth/login", "200"])
            .inc();

        let body = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(body.contains("sessionward_logins_total{outcome=\"suspicious\"} 1"));
        assert!(body.contains("sessionward_device_cap_evictions_total 1"));
        assert!(body.contains("sessionward_http_requests_total"));
    }
}
