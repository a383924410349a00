//! Builds a per-request tree of span events under a single trace id, bounded
//! in both total span count and per-span stack-trace depth, and serializes
//! it into a request's response at the end of the request.
//!
//! A `TraceWriter` is only constructed when the inbound trace-context header
//! requests tracing (see [`context::TraceContext`]); requests that don't ask
//! for tracing never pay for one.

mod context;

use std::{
    collections::{
        hash_map::DefaultHasher,
        BTreeMap,
        HashMap,
    },
    hash::{
        Hash,
        Hasher,
    },
    sync::Arc,
};

pub use context::{
    TraceContext,
    TraceId,
};
use parking_lot::Mutex;
use response_sink::MutableUpResponse;
use serde::Serialize;

/// Stack traces longer than this are truncated to their innermost frames.
pub const MAX_STACK_DEPTH: usize = 128;
/// At most this many distinct (by hash) stack traces are retained per trace;
/// beyond that, a span's `stack_trace_hash` is recorded but its frames are
/// not, since the dictionary has no room to keep them.
pub const MAX_STACK_DICT_ENTRIES: usize = 1024;
/// Default cap on total span events for a single trace, applied to every
/// request but primarily exercised by long-lived background workers.
pub const DEFAULT_MAX_TRACE_SIZE: usize = 1000;

/// Opaque handle to a span, returned by every `start_*` method and consumed
/// by `set_label`/`add_stack_trace`/`end_span`. A handle for a span that was
/// dropped because the trace was already at its size cap carries `id: None`
/// and silently no-ops on every subsequent call -- callers never need to
/// branch on whether their span was actually recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanCtx {
    id: Option<u64>,
}

impl SpanCtx {
    pub fn is_detached(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Request,
    Child,
    Api { package: String, method: String },
}

#[derive(Clone, Debug, Serialize)]
struct StoredSpan {
    id: u64,
    parent_id: Option<u64>,
    name: String,
    kind: SpanKind,
    start_us: i64,
    end_us: Option<i64>,
    labels: BTreeMap<String, String>,
    stack_trace_hash: Option<u64>,
}

struct Inner {
    trace_id: TraceId,
    max_trace_size: usize,
    spans: Vec<StoredSpan>,
    next_span_id: u64,
    stack_dict: HashMap<u64, Vec<String>>,
    flushed: bool,
}

/// Per-request span-tree builder. Cheaply cloneable (an `Arc` handle), since
/// both the request driver and any worker tasks it spawns may want to
/// annotate the same trace.
#[derive(Clone)]
pub struct TraceWriter {
    inner: Arc<Mutex<Inner>>,
}

impl TraceWriter {
    pub fn new(trace_id: TraceId) -> Self {
        Self::with_max_trace_size(trace_id, DEFAULT_MAX_TRACE_SIZE)
    }

    pub fn with_max_trace_size(trace_id: TraceId, max_trace_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                trace_id,
                max_trace_size,
                spans: Vec::new(),
                next_span_id: 0,
                stack_dict: HashMap::new(),
                flushed: false,
            })),
        }
    }

    pub fn trace_id(&self) -> TraceId {
        self.inner.lock().trace_id
    }

    pub fn span_count(&self) -> usize {
        self.inner.lock().spans.len()
    }

    pub fn start_request_span(&self, name: impl Into<String>, timestamp_us: i64) -> SpanCtx {
        self.start_span(None, name.into(), SpanKind::Request, timestamp_us)
    }

    pub fn start_child_span(
        &self,
        parent: SpanCtx,
        name: impl Into<String>,
        timestamp_us: i64,
    ) -> SpanCtx {
        let Some(parent_id) = parent.id else {
            return SpanCtx { id: None };
        };
        self.start_span(Some(parent_id), name.into(), SpanKind::Child, timestamp_us)
    }

    pub fn start_api_span(
        &self,
        parent: SpanCtx,
        package: impl Into<String>,
        method: impl Into<String>,
        timestamp_us: i64,
    ) -> SpanCtx {
        let Some(parent_id) = parent.id else {
            return SpanCtx { id: None };
        };
        let package = package.into();
        let method = method.into();
        self.start_span(
            Some(parent_id),
            format!("{package}.{method}"),
            SpanKind::Api { package, method },
            timestamp_us,
        )
    }

    fn start_span(
        &self,
        parent_id: Option<u64>,
        name: String,
        kind: SpanKind,
        timestamp_us: i64,
    ) -> SpanCtx {
        let mut inner = self.inner.lock();
        if inner.spans.len() >= inner.max_trace_size {
            return SpanCtx { id: None };
        }
        let id = inner.next_span_id;
        inner.next_span_id += 1;
        inner.spans.push(StoredSpan {
            id,
            parent_id,
            name,
            kind,
            start_us: timestamp_us,
            end_us: None,
            labels: BTreeMap::new(),
            stack_trace_hash: None,
        });
        SpanCtx { id: Some(id) }
    }

    pub fn set_label(&self, ctx: SpanCtx, key: impl Into<String>, value: impl Into<String>) {
        let Some(id) = ctx.id else { return };
        let mut inner = self.inner.lock();
        if let Some(span) = inner.spans.iter_mut().find(|s| s.id == id) {
            span.labels.insert(key.into(), value.into());
        }
    }

    /// Record a stack trace on `ctx`, deduplicated by hash into a dictionary
    /// capped at [`MAX_STACK_DICT_ENTRIES`] and truncated to
    /// [`MAX_STACK_DEPTH`] frames.
    pub fn add_stack_trace(&self, ctx: SpanCtx, frames: Vec<String>) {
        let Some(id) = ctx.id else { return };
        let frames: Vec<String> = frames.into_iter().take(MAX_STACK_DEPTH).collect();
        let mut hasher = DefaultHasher::new();
        for frame in &frames {
            frame.hash(&mut hasher);
        }
        let hash = hasher.finish();

        let mut inner = self.inner.lock();
        if !inner.stack_dict.contains_key(&hash) && inner.stack_dict.len() < MAX_STACK_DICT_ENTRIES
        {
            inner.stack_dict.insert(hash, frames);
        }
        if let Some(span) = inner.spans.iter_mut().find(|s| s.id == id) {
            span.stack_trace_hash = Some(hash);
        }
    }

    pub fn end_span(&self, ctx: SpanCtx, timestamp_us: i64) {
        let Some(id) = ctx.id else { return };
        let mut inner = self.inner.lock();
        if let Some(span) = inner.spans.iter_mut().find(|s| s.id == id) {
            span.end_us = Some(timestamp_us);
        }
    }

    /// Serialize the accumulated span tree into `sink`'s trace-bytes field.
    /// Idempotent: a trace is only ever serialized once (`finish_request`
    /// calls this exactly once per request, but guard anyway since the
    /// shutdown-notification path may also try).
    pub fn flush_trace(&self, sink: &MutableUpResponse) {
        let mut inner = self.inner.lock();
        if inner.flushed {
            return;
        }
        let payload = SerializedTrace {
            trace_id: inner.trace_id.to_string(),
            spans: inner.spans.clone(),
            stack_traces: inner
                .stack_dict
                .iter()
                .map(|(hash, frames)| (hash.to_string(), frames.clone()))
                .collect(),
        };
        if let Ok(bytes) = serde_json::to_vec(&payload) {
            sink.set_trace_bytes(bytes);
        }
        inner.flushed = true;
    }
}

#[derive(Serialize)]
struct SerializedTrace {
    trace_id: String,
    spans: Vec<StoredSpan>,
    stack_traces: BTreeMap<String, Vec<String>>,
}

#[cfg(test)]
mod tests {
    use request_context::RequestId;
    use response_sink::MutableUpResponse;

    use super::*;

    fn trace_id() -> TraceId {
        TraceId { hi: 1, lo: 2 }
    }

    #[test]
    fn child_spans_attach_to_their_parent_and_flush_serializes_the_tree() {
        let writer = TraceWriter::new(trace_id());
        let root = writer.start_request_span("handleRequest", 0);
        let child = writer.start_child_span(root, "datastore.Get", 5);
        writer.set_label(child, "table", "users");
        writer.end_span(child, 10);
        writer.end_span(root, 15);
        assert_eq!(writer.span_count(), 2);

        let sink = MutableUpResponse::new(RequestId::new_for_test());
        writer.flush_trace(&sink);
        let response = sink.build();
        let bytes = response.trace_bytes.expect("trace bytes set");
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["spans"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn span_count_is_capped_and_excess_spans_are_detached() {
        let writer = TraceWriter::with_max_trace_size(trace_id(), 3);
        let a = writer.start_request_span("root", 0);
        assert!(!a.is_detached());
        let b = writer.start_child_span(a, "child1", 1);
        assert!(!b.is_detached());
        let c = writer.start_child_span(a, "child2", 2);
        assert!(!c.is_detached());
        // Cap reached: further spans come back detached and are safe no-ops.
        let d = writer.start_child_span(a, "child3", 3);
        assert!(d.is_detached());
        writer.set_label(d, "key", "value");
        writer.add_stack_trace(d, vec!["frame1".to_string()]);
        writer.end_span(d, 4);
        assert_eq!(writer.span_count(), 3);
    }

    #[test]
    fn children_of_a_detached_parent_are_also_detached() {
        let writer = TraceWriter::with_max_trace_size(trace_id(), 1);
        let root = writer.start_request_span("root", 0);
        let overflow = writer.start_child_span(root, "overflow", 1);
        assert!(overflow.is_detached());
        let grandchild = writer.start_child_span(overflow, "grandchild", 2);
        assert!(grandchild.is_detached());
        assert_eq!(writer.span_count(), 1);
    }

    #[test]
    fn identical_stack_traces_share_one_dictionary_entry() {
        let writer = TraceWriter::new(trace_id());
        let root = writer.start_request_span("root", 0);
        let a = writer.start_child_span(root, "a", 1);
        let b = writer.start_child_span(root, "b", 2);
        let frames = vec!["frame1".to_string(), "frame2".to_string()];
        writer.add_stack_trace(a, frames.clone());
        writer.add_stack_trace(b, frames);
        assert_eq!(writer.inner.lock().stack_dict.len(), 1);
    }

    #[test]
    fn stack_traces_are_truncated_to_max_depth() {
        let writer = TraceWriter::new(trace_id());
        let root = writer.start_request_span("root", 0);
        let frames: Vec<String> = (0..500).map(|i| format!("frame{i}")).collect();
        writer.add_stack_trace(root, frames);
        let hash = writer.inner.lock().spans[0].stack_trace_hash.unwrap();
        assert_eq!(writer.inner.lock().stack_dict[&hash].len(), MAX_STACK_DEPTH);
    }

    #[test]
    fn stack_dictionary_is_capped_at_1024_distinct_entries() {
        let writer = TraceWriter::with_max_trace_size(trace_id(), 10_000);
        let root = writer.start_request_span("root", 0);
        for i in 0..(MAX_STACK_DICT_ENTRIES + 10) {
            let span = writer.start_child_span(root, format!("child{i}"), i as i64);
            writer.add_stack_trace(span, vec![format!("unique-frame-{i}")]);
        }
        assert!(writer.inner.lock().stack_dict.len() <= MAX_STACK_DICT_ENTRIES);
    }
}
