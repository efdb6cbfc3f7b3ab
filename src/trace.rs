//! Per-invocation trace context and scoped spans.
//!
//! Each inbound request runs inside a task-scoped context holding the trace
//! id, the caller's span, and any propagation headers captured at the HTTP
//! boundary. The scope is dropped when the request task finishes, so context
//! never leaks across requests even when the runtime reuses workers.
//!
//! Ids may arrive as `X-Trace-ID`/`X-Parent-Span` headers or, when the
//! invoker cannot inject headers, as `_trace_id`/`_parent_span` arguments.
//! Argument-supplied ids win over inherited ones; captured HTTP headers win
//! over an argument-supplied `_mesh_headers` map.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::tracing_publish;

/// Inbound header carrying the 32-hex trace id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";
/// Inbound header carrying the caller's 16-hex span id.
pub const PARENT_SPAN_HEADER: &str = "x-parent-span";

/// Argument keys used when headers cannot be injected by the caller.
pub const TRACE_ID_ARG: &str = "_trace_id";
pub const PARENT_SPAN_ARG: &str = "_parent_span";
pub const MESH_HEADERS_ARG: &str = "_mesh_headers";

/// Per-invocation trace context.
#[derive(Debug, Clone, Default)]
pub struct TraceContext {
    /// 128-bit trace id, 32 hex chars
    pub trace_id: Option<String>,

    /// Caller's span id, 16 hex chars
    pub parent_span: Option<String>,

    /// Propagation headers captured at the request boundary
    pub headers: HashMap<String, String>,
}

tokio::task_local! {
    static TRACE: RefCell<TraceContext>;
}

/// Generate a new 32-hex trace id.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a new 16-hex span id.
pub fn new_span_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Run `fut` inside a fresh trace scope seeded from the request boundary.
///
/// Any inherited context is discarded; the scope is dropped on every exit
/// path when the future completes.
pub async fn scope<F, T>(seed: TraceContext, fut: F) -> T
where
    F: Future<Output = T>,
{
    TRACE.scope(RefCell::new(seed), fut).await
}

/// Snapshot of the current context, if any scope is active.
pub fn current() -> Option<TraceContext> {
    TRACE.try_with(|cell| cell.borrow().clone()).ok()
}

/// Overwrite trace ids from argument-supplied values.
///
/// Arg-supplied ids win over inherited ones: worker reuse means a stale
/// inherited id must never shadow what the caller sent.
pub fn adopt_ids(trace_id: Option<String>, parent_span: Option<String>) {
    let _ = TRACE.try_with(|cell| {
        let mut ctx = cell.borrow_mut();
        if trace_id.is_some() {
            ctx.trace_id = trace_id.clone();
        }
        if parent_span.is_some() {
            ctx.parent_span = parent_span.clone();
        }
    });
}

/// Merge an argument-supplied `_mesh_headers` map into the context.
///
/// Headers captured from HTTP take precedence over argument-supplied ones.
pub fn merge_argument_headers(headers: HashMap<String, String>) {
    let _ = TRACE.try_with(|cell| {
        let mut ctx = cell.borrow_mut();
        for (key, value) in headers {
            ctx.headers.entry(key).or_insert(value);
        }
    });
}

/// Ensure the context has a trace id, creating a root id if absent.
///
/// Returns the effective (trace_id, parent_span).
pub fn ensure_trace_id() -> (String, Option<String>) {
    TRACE
        .try_with(|cell| {
            let mut ctx = cell.borrow_mut();
            if ctx.trace_id.is_none() {
                ctx.trace_id = Some(new_trace_id());
            }
            (ctx.trace_id.clone().unwrap_or_default(), ctx.parent_span.clone())
        })
        .unwrap_or_else(|_| (new_trace_id(), None))
}

/// Inject the current trace ids and propagation headers into an outbound
/// argument map.
///
/// The current span (when one is open, its id is stored as the context's
/// parent for downstream) rides as `_parent_span`; captured headers ride as
/// `_mesh_headers`. Arguments that already carry these keys are preserved.
pub fn with_propagated_headers(arguments: Value) -> Value {
    let Some(ctx) = current() else {
        return arguments;
    };

    let mut map = match arguments {
        Value::Object(map) => map,
        other => return other,
    };

    if let Some(trace_id) = &ctx.trace_id {
        map.entry(TRACE_ID_ARG.to_string())
            .or_insert_with(|| Value::String(trace_id.clone()));
    }
    if let Some(parent) = &ctx.parent_span {
        map.entry(PARENT_SPAN_ARG.to_string())
            .or_insert_with(|| Value::String(parent.clone()));
    }
    if !ctx.headers.is_empty() {
        let headers: Map<String, Value> = ctx
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        map.entry(MESH_HEADERS_ARG.to_string())
            .or_insert_with(|| Value::Object(headers));
    }

    Value::Object(map)
}

/// An open span for one tool invocation.
///
/// Finishing the span publishes it (fire-and-forget) and records the span id
/// as the context's parent so nested outbound calls chain correctly.
pub struct Span {
    name: String,
    trace_id: String,
    span_id: String,
    parent_span: Option<String>,
    started: Instant,
    started_at: f64,
    metadata: HashMap<String, String>,
}

impl Span {
    /// Open a span named after the invoked method.
    ///
    /// Creates a root trace id when none was inherited or supplied.
    pub fn open(name: &str) -> Self {
        let (trace_id, parent_span) = ensure_trace_id();
        let span_id = new_span_id();

        // Downstream calls made during this invocation are children of this
        // span.
        let _ = TRACE.try_with(|cell| {
            cell.borrow_mut().parent_span = Some(span_id.clone());
        });

        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        debug!(
            "Span '{}' opened (trace={}, span={}, parent={:?})",
            name, trace_id, span_id, parent_span
        );

        Self {
            name: name.to_string(),
            trace_id,
            span_id,
            parent_span,
            started: Instant::now(),
            started_at,
            metadata: HashMap::new(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn parent_span(&self) -> Option<&str> {
        self.parent_span.as_deref()
    }

    /// Attach a metadata field.
    pub fn set_metadata(&mut self, key: &str, value: impl ToString) {
        self.metadata.insert(key.to_string(), value.to_string());
    }

    /// Close the span, recording success or the error message.
    ///
    /// Publication is spawned fire-and-forget; it can never delay or fail
    /// the dispatch. Called on every exit path.
    pub fn finish(mut self, error: Option<&str>) {
        let duration_ms = self.started.elapsed().as_millis();

        let mut span_data: HashMap<String, String> = HashMap::new();
        span_data.insert("name".to_string(), self.name.clone());
        span_data.insert("trace_id".to_string(), self.trace_id.clone());
        span_data.insert("span_id".to_string(), self.span_id.clone());
        if let Some(parent) = &self.parent_span {
            span_data.insert("parent_span".to_string(), parent.clone());
        }
        span_data.insert("started_at".to_string(), self.started_at.to_string());
        span_data.insert("duration_ms".to_string(), duration_ms.to_string());
        span_data.insert(
            "success".to_string(),
            error.is_none().to_string(),
        );
        if let Some(error) = error {
            span_data.insert("error".to_string(), error.to_string());
        }
        span_data.extend(self.metadata.drain());

        debug!(
            "Span '{}' closed in {}ms (success={})",
            self.name,
            duration_ms,
            error.is_none()
        );

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tracing_publish::publish_span(span_data).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scope_isolated_and_cleared() {
        scope(TraceContext::default(), async {
            adopt_ids(Some("a".repeat(32)), Some("b".repeat(16)));
            let ctx = current().unwrap();
            assert_eq!(ctx.trace_id.as_deref(), Some("a".repeat(32).as_str()));
        })
        .await;

        // Outside any scope there is no context
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn test_adopt_ids_wins_over_inherited() {
        let seed = TraceContext {
            trace_id: Some("0".repeat(32)),
            parent_span: Some("0".repeat(16)),
            headers: HashMap::new(),
        };
        scope(seed, async {
            adopt_ids(Some("f".repeat(32)), None);
            let ctx = current().unwrap();
            assert_eq!(ctx.trace_id.as_deref(), Some("f".repeat(32).as_str()));
            // Parent untouched when not supplied
            assert_eq!(ctx.parent_span.as_deref(), Some("0".repeat(16).as_str()));
        })
        .await;
    }

    #[tokio::test]
    async fn test_http_headers_win_over_argument_headers() {
        let mut headers = HashMap::new();
        headers.insert("x-request-id".to_string(), "from-http".to_string());
        let seed = TraceContext {
            headers,
            ..Default::default()
        };

        scope(seed, async {
            let mut arg_headers = HashMap::new();
            arg_headers.insert("x-request-id".to_string(), "from-args".to_string());
            arg_headers.insert("x-tenant".to_string(), "acme".to_string());
            merge_argument_headers(arg_headers);

            let ctx = current().unwrap();
            assert_eq!(ctx.headers["x-request-id"], "from-http");
            assert_eq!(ctx.headers["x-tenant"], "acme");
        })
        .await;
    }

    #[tokio::test]
    async fn test_span_chains_parent() {
        scope(TraceContext::default(), async {
            let span = Span::open("calc.add");
            let span_id = span.span_id().to_string();
            assert_eq!(span.trace_id().len(), 32);
            assert_eq!(span_id.len(), 16);

            // Downstream arguments carry this span as the parent
            let args = with_propagated_headers(json!({"x": 1}));
            assert_eq!(args[PARENT_SPAN_ARG], json!(span_id));
            assert_eq!(args[TRACE_ID_ARG].as_str().unwrap().len(), 32);

            span.finish(None);
        })
        .await;
    }

    #[tokio::test]
    async fn test_with_propagated_headers_outside_scope() {
        let args = json!({"x": 1});
        assert_eq!(with_propagated_headers(args.clone()), args);
    }

    #[tokio::test]
    async fn test_span_open_creates_root_trace() {
        scope(TraceContext::default(), async {
            let span = Span::open("root.op");
            assert!(!span.trace_id().is_empty());
            assert!(span.parent_span().is_none());
            span.finish(Some("boom"));
        })
        .await;
    }
}
