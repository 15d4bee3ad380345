use crate::DecodeEvent;

/// What an idempotent handler did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Local state changed.
    Applied,
    /// The event was already reflected (duplicate, late, or irrelevant).
    Skipped,
}

/// Applies decoded events to service-local state (projection handler seam).
///
/// ## Idempotency
///
/// Delivery is at-least-once, and across topics unordered. Implementations
/// must reach the same end state whether an event arrives once or many times,
/// and a late `post.created` after a `post.deleted` for the same post must not
/// bring the row back.
///
/// ## Errors
///
/// Returning `Err` reports a failed application. What happens to the message
/// afterwards is the consumer runtime's acknowledgment policy, not the
/// handler's concern. Events that do not apply to this handler should return
/// `Ok(HandleOutcome::Skipped)`.
pub trait EventHandler: Send + Sync + 'static {
    type Event: DecodeEvent;
    type Error: core::fmt::Display + core::fmt::Debug + Send + 'static;

    /// Stable handler name used in logs and queue names (e.g. "search.index").
    fn name(&self) -> &'static str;

    fn handle(&self, event: Self::Event) -> Result<HandleOutcome, Self::Error>;
}

impl<H> EventHandler for std::sync::Arc<H>
where
    H: EventHandler,
{
    type Event = H::Event;
    type Error = H::Error;

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn handle(&self, event: Self::Event) -> Result<HandleOutcome, Self::Error> {
        (**self).handle(event)
    }
}
