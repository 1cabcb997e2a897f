use uuid::Uuid;

/// Generate an OpenTelemetry-compatible trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    let id = Uuid::new_v4();
    // OTel trace IDs are 32 hex chars (128 bits) -- a UUID without hyphens is
    // exactly 32 hex chars.
    id.as_simple().to_string()
}

/// Generate a span ID (16 hex characters).
pub fn generate_span_id() -> String {
    let id = Uuid::new_v4();
    // Take the first 16 hex chars (64 bits) for span IDs.
    id.as_simple().to_string()[..16].to_string()
}

/// Create a named span for a top-level operation (a poll cycle, an index
/// pass, a background task run), returning the span and its trace ID.
///
/// The trace ID is the correlation key threaded through every downstream log
/// line for that operation, including the background task it may enqueue.
pub fn create_operation_span(operation: &str) -> (tracing::Span, String) {
    let trace_id = generate_trace_id();
    let span_id = generate_span_id();
    let span = tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        span_id = %span_id,
        operation = %operation,
    );
    (span, trace_id)
}

/// Create a child span under an existing trace ID, e.g. the task spawned by
/// a poll cycle, so its logs correlate back to the cycle that triggered it.
pub fn create_child_span(trace_id: &str, operation: &str) -> tracing::Span {
    let span_id = generate_span_id();
    tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        span_id = %span_id,
        operation = %operation,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_format() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_span_id_format() {
        let id = generate_span_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_operation_span_creation() {
        let (span, trace_id) = create_operation_span("test_op");
        assert_eq!(trace_id.len(), 32);
        // Span should be valid
        let _guard = span.enter();
    }

    #[test]
    fn test_child_span_creation() {
        let trace_id = generate_trace_id();
        let span = create_child_span(&trace_id, "child_op");
        let _guard = span.enter();
    }
}
