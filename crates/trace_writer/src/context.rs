//! Parsing and rendering of the inbound trace-context header:
//! `TRACE_ID[/SPAN_ID][;o=TRACE_OPTIONS]`.

use std::fmt;

use errors::ErrorMetadata;

/// A 128-bit trace id, rendered as 32 lower-case hex digits (two 64-bit
/// halves, high then low).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TraceId {
    pub hi: u64,
    pub lo: u64,
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.hi, self.lo)
    }
}

/// Parsed form of the inbound trace-context header. Any field beyond
/// `trace_id` may be absent (or present-but-empty), in which case it
/// defaults to zero/disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub parent_span_id: u64,
    pub trace_enabled: bool,
    pub stack_trace_enabled: bool,
}

impl TraceContext {
    /// Whether tracing is requested at all for this request. A `TraceWriter`
    /// is only constructed when this is true.
    pub fn tracing_requested(&self) -> bool {
        self.trace_enabled
    }

    fn options_mask(&self) -> u64 {
        (self.trace_enabled as u64) | ((self.stack_trace_enabled as u64) << 1)
    }

    /// Render back into the wire grammar. Always emits every segment (even
    /// ones that were absent on the original header), so
    /// `parse(render(ctx)) == ctx` holds for any parsed context.
    pub fn render(&self) -> String {
        format!(
            "{}/{};o={}",
            self.trace_id,
            self.parent_span_id,
            self.options_mask()
        )
    }

    pub fn parse(header: &str) -> anyhow::Result<Self> {
        let (main, options) = match header.split_once(";o=") {
            Some((m, o)) => (m, Some(o)),
            None => (header, None),
        };
        let (trace_id_str, span_id_str) = match main.split_once('/') {
            Some((t, s)) => (t, Some(s)),
            None => (main, None),
        };
        if trace_id_str.len() != 32
            || !trace_id_str
                .bytes()
                .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidTraceContext",
                format!("trace id must be 32 lower-case hex digits, got {trace_id_str:?}"),
            ));
        }
        let hi = u64::from_str_radix(&trace_id_str[0..16], 16)?;
        let lo = u64::from_str_radix(&trace_id_str[16..32], 16)?;
        let parent_span_id = match span_id_str {
            Some(s) if !s.is_empty() => s.parse::<u64>()?,
            _ => 0,
        };
        let mask = match options {
            Some(s) if !s.is_empty() => s.parse::<u64>()?,
            _ => 0,
        };
        Ok(Self {
            trace_id: TraceId { hi, lo },
            parent_span_id,
            trace_enabled: mask & 0b01 != 0,
            stack_trace_enabled: mask & 0b10 != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parses_full_header() {
        let header = "0123456789abcdef00000000cafe0000/42;o=3";
        let ctx = TraceContext::parse(header).unwrap();
        assert_eq!(ctx.trace_id.hi, 0x0123456789abcdef);
        assert_eq!(ctx.trace_id.lo, 0x00000000cafe0000);
        assert_eq!(ctx.parent_span_id, 42);
        assert!(ctx.trace_enabled);
        assert!(ctx.stack_trace_enabled);
    }

    #[test]
    fn absent_span_and_options_default_to_zero() {
        let header = "0".repeat(32);
        let ctx = TraceContext::parse(&header).unwrap();
        assert_eq!(ctx.parent_span_id, 0);
        assert!(!ctx.trace_enabled);
        assert!(!ctx.stack_trace_enabled);
    }

    #[test]
    fn present_but_empty_span_and_options_default_to_zero() {
        let header = format!("{}/;o=", "a".repeat(32));
        let ctx = TraceContext::parse(&header).unwrap();
        assert_eq!(ctx.parent_span_id, 0);
        assert!(!ctx.trace_enabled);
    }

    #[test]
    fn rejects_malformed_trace_id() {
        assert!(TraceContext::parse("too-short").is_err());
        assert!(TraceContext::parse(&"G".repeat(32)).is_err());
        assert!(TraceContext::parse(&"A".repeat(32)).is_err());
    }

    #[test]
    fn only_bit_0_enables_tracing_bit_1_enables_stack_traces() {
        let header = format!("{}/1;o=1", "a".repeat(32));
        let ctx = TraceContext::parse(&header).unwrap();
        assert!(ctx.trace_enabled);
        assert!(!ctx.stack_trace_enabled);

        let header = format!("{}/1;o=2", "a".repeat(32));
        let ctx = TraceContext::parse(&header).unwrap();
        assert!(!ctx.trace_enabled);
        assert!(ctx.stack_trace_enabled);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn parse_of_render_is_the_identity(
            hi in any::<u64>(),
            lo in any::<u64>(),
            parent_span_id in any::<u64>(),
            trace_enabled in any::<bool>(),
            stack_trace_enabled in any::<bool>(),
        ) {
            let ctx = TraceContext {
                trace_id: TraceId { hi, lo },
                parent_span_id,
                trace_enabled,
                stack_trace_enabled,
            };
            let rendered = ctx.render();
            let parsed = TraceContext::parse(&rendered).unwrap();
            prop_assert_eq!(parsed, ctx);
        }
    }
}
