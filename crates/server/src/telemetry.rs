//! Tracing subscriber setup and the HTTP span hooks used by `TraceLayer`.
//!
//! Every event emitted inside an `http.request` span is prefixed with the
//! span's `request_id`, in both the compact and JSON formats.

use std::time::Duration;

use axum::{body::HttpBody, extract::MatchedPath, http};
use tower_http::request_id::RequestId;
use tracing::{
    field::{Field, Visit},
    Event, Subscriber,
};
use tracing_subscriber::{
    fmt::{
        format::{Format, Writer},
        writer::MakeWriter,
        FmtContext, FormatEvent, FormatFields,
    },
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    EnvFilter, Layer,
};

use crate::config::{LogFormat, ServerConfig};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const DEFAULT_FILTER: &str = "info,sessionward_server=info,sessionward=info";

pub fn init_tracing(config: &ServerConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json = matches!(config.log_format(), LogFormat::Json);
    let subscriber = build_subscriber(json, env_filter, std::io::stderr);

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

pub fn build_subscriber<W>(
    json: bool,
    env_filter: EnvFilter,
    make_writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + Clone + 'static,
{
    let format = Format::default().with_target(true).with_level(true);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(RequestIdStorageLayer);

    if json {
        Box::new(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .event_format(RequestIdEventFormat::new(format.json()))
                    .with_writer(make_writer),
            ),
        )
    } else {
        Box::new(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .event_format(RequestIdEventFormat::new(format))
                    .with_writer(make_writer),
            ),
        )
    }
}

/// Remembers the `request_id` field of each new span in its extensions.
#[derive(Default)]
struct RequestIdStorageLayer;

#[derive(Clone)]
struct SpanRequestId(String);

#[derive(Default)]
struct RequestIdVisitor {
    request_id: Option<String>,
}

impl Visit for RequestIdVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "request_id" {
            self.request_id = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "request_id" && self.request_id.is_none() {
            let rendered = format!("{value:?}");
            self.request_id = Some(rendered.trim_matches('"').to_string());
        }
    }
}

impl<S> Layer<S> for RequestIdStorageLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::Id,
        ctx: Context<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = RequestIdVisitor::default();
        attrs.record(&mut visitor);
        if let Some(request_id) = visitor.request_id {
            span.extensions_mut().insert(SpanRequestId(request_id));
        }
    }
}

struct RequestIdEventFormat<E> {
    inner: E,
}

impl<E> RequestIdEventFormat<E> {
    fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<S, N, E> FormatEvent<S, N> for RequestIdEventFormat<E>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        if let Some(span) = ctx.lookup_current() {
            if let Some(SpanRequestId(request_id)) = span.extensions().get::<SpanRequestId>() {
                write!(writer, "[request_id={request_id}] ")?;
            }
        }

        self.inner.format_event(ctx, writer, event)
    }
}

#[derive(Clone, Default)]
pub struct HttpSpanMaker;

impl<B> tower_http::trace::MakeSpan<B> for HttpSpanMaker
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn make_span(&mut self, request: &http::Request<B>) -> tracing::Span {
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .and_then(|rid| rid.header_value().to_str().ok())
            .unwrap_or("unknown")
            .to_owned();

        tracing::info_span!(
            "http.request",
            method = %request.method(),
            route = %route,
            request_id = %request_id,
            status_code = tracing::field::Empty,
            latency_ms = tracing::field::Empty
        )
    }
}

#[derive(Clone, Default)]
pub struct HttpOnResponse;

impl<B> tower_http::trace::OnResponse<B> for HttpOnResponse
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn on_response(self, response: &http::Response<B>, latency: Duration, span: &tracing::Span) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let status = response.status().as_u16();

        span.record("status_code", tracing::field::display(status));
        span.record("latency_ms", tracing::field::display(latency_ms));

        tracing::debug!(parent: span, status, latency_ms, "request completed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub(crate) struct CaptureWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl CaptureWriter {
        pub(crate) fn contents(&self) -> String {
            let data = self.buffer.lock().expect("lock");
            String::from_utf8_lossy(&data).to_string()
        }
    }

    pub(crate) struct CaptureHandle {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl<'a> MakeWriter<'a> for CaptureWriter {
        type Writer = CaptureHandle;

        fn make_writer(&'a self) -> Self::Writer {
            CaptureHandle {
                buffer: self.buffer.clone(),
            }
        }
    }

    impl Write for CaptureHandle {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buffer.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn compact_events_are_prefixed_with_the_request_id() {
        let writer = CaptureWriter::default();
        let subscriber = build_subscriber(false, EnvFilter::new("info"), writer.clone());
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("http.request", request_id = %"req-123");
            let _entered = span.enter();
            tracing::info!("login succeeded");
        });

        let output = writer.contents();
        assert!(output.contains("[request_id=req-123]"), "{output}");
        assert!(output.contains("login succeeded"));
    }

    #[test]
    fn json_events_carry_the_request_id_prefix() {
        let writer = CaptureWriter::default();
        let subscriber = build_subscriber(true, EnvFilter::new("info"), writer.clone());
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("http.request", request_id = %"req-json");
            let _entered = span.enter();
            tracing::warn!(reason = "new browser", "suspicious login");
        });

        let output = writer.contents();
        assert!(output.contains("[request_id=req-json]"), "{output}");
        assert!(output.contains("\"suspicious login\""));
    }

    #[test]
    fn events_outside_requests_have_no_prefix() {
        let writer = CaptureWriter::default();
        let subscriber = build_subscriber(false, EnvFilter::new("info"), writer.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("purged expired sessions");
        });
        assert!(!writer.contents().contains("request_id="));
    }
}
