//! Correlation identifiers carried into output callbacks
//!
//! Output is delivered from whichever task drives a session, long after the
//! code that registered the callback has moved on. A callback wrapped with
//! [`Correlated`] remembers the identifier (and tracing span) that was active
//! at registration and restores both around every invocation, so log lines
//! emitted from the callback are attributed to the right caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::Span;
use uuid::Uuid;

tokio::task_local! {
    static ACTIVE: Option<CorrelationId>;
}

/// Caller-supplied tag used to attribute output and log lines
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Wrap a caller-supplied identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into()))
    }

    /// Generate a random identifier
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Identifier active in the current task, if any
pub fn current() -> Option<CorrelationId> {
    ACTIVE.try_with(|id| id.clone()).ok().flatten()
}

/// Run `future` with `id` as the active identifier
pub async fn scope<F>(id: impl Into<Option<CorrelationId>>, future: F) -> F::Output
where
    F: Future,
{
    ACTIVE.scope(id.into(), future).await
}

/// Run `f` with `id` as the active identifier
pub fn sync_scope<R>(id: impl Into<Option<CorrelationId>>, f: impl FnOnce() -> R) -> R {
    ACTIVE.sync_scope(id.into(), f)
}

/// A handler bound to the correlation context of its registration
pub struct Correlated<H> {
    id: Option<CorrelationId>,
    span: Span,
    handler: H,
}

impl<H> Correlated<H> {
    /// Capture the active identifier and span for `handler`
    pub fn capture(handler: H) -> Self {
        Self::with_id(current(), handler)
    }

    /// Bind `handler` to an explicit identifier and the current span
    pub fn with_id(id: Option<CorrelationId>, handler: H) -> Self {
        Self {
            id,
            span: Span::current(),
            handler,
        }
    }

    /// Identifier captured at registration
    pub fn id(&self) -> Option<&CorrelationId> {
        self.id.as_ref()
    }

    /// Run `f` on the handler with the captured identifier and span active
    pub fn call<R>(&mut self, f: impl FnOnce(&mut H, Option<&CorrelationId>) -> R) -> R {
        let Self { id, span, handler } = self;
        let _entered = span.enter();
        sync_scope(id.clone(), || f(handler, id.as_ref()))
    }
}

impl<H> fmt::Debug for Correlated<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlated")
            .field("id", &self.id)
            .field("span", &self.span)
            .finish_non_exhaustive()
    }
}
