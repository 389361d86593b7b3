/// Errors raised by the completion protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CompleteError {
    /// A second completion was attempted on a future that already left its
    /// unresolved state. The stored outcome is unchanged; the duplicate
    /// payload is dropped.
    #[error("result or error already set, future already fulfilled")]
    AlreadyFulfilled,
}
