use thiserror::Error;

/// Errors surfaced by the dispatcher's own lifecycle.
///
/// Failures inside a submitted callback are never observed by the
/// dispatcher; reporting those is the caller's concern.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
  #[error("dispatch group is shutting down or already shut down, cannot accept new tasks")]
  ShuttingDown,
}
