//! Trace-id propagation across async boundaries.
//!
//! A trace id travels with a message or task from the producer to every
//! handler that runs on its behalf. It is the only ambient state in the
//! fabric: producers capture it at enqueue time and workers restore it
//! around handler invocation with [`with_trace_id`].

use std::future::Future;

tokio::task_local! {
    static TRACE_ID: String;
}

/// Generate a fresh trace id (time-ordered UUID, compact form).
pub fn new_trace_id() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

/// The trace id of the current task scope, if one was installed.
pub fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(|id| id.clone()).ok()
}

/// The current trace id, or a freshly generated one.
///
/// Does not install anything; callers that want the id to stick must run
/// downstream work inside [`with_trace_id`].
pub fn ensure_trace_id() -> String {
    current_trace_id().unwrap_or_else(new_trace_id)
}

/// Run `fut` with `trace_id` installed as the ambient trace id.
pub async fn with_trace_id<F>(trace_id: String, fut: F) -> F::Output
where
    F: Future,
{
    TRACE_ID.scope(trace_id, fut).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trace_id_scoping() {
        assert!(current_trace_id().is_none());

        let id = new_trace_id();
        let seen = with_trace_id(id.clone(), async { current_trace_id() }).await;
        assert_eq!(seen, Some(id));

        // Outside the scope again
        assert!(current_trace_id().is_none());
    }

    #[tokio::test]
    async fn test_ensure_generates_when_absent() {
        let id = ensure_trace_id();
        assert!(!id.is_empty());

        let inside = with_trace_id("abc".to_string(), async { ensure_trace_id() }).await;
        assert_eq!(inside, "abc");
    }

    #[tokio::test]
    async fn test_nested_scope_shadows() {
        let outer = "outer".to_string();
        let inner = "inner".to_string();

        let observed = with_trace_id(outer.clone(), async {
            let before = current_trace_id();
            let nested = with_trace_id(inner.clone(), async { current_trace_id() }).await;
            let after = current_trace_id();
            (before, nested, after)
        })
        .await;

        assert_eq!(observed.0, Some(outer.clone()));
        assert_eq!(observed.1, Some(inner));
        assert_eq!(observed.2, Some(outer));
    }
}
