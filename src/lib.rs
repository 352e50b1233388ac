//! A Tokio-based keyed task dispatcher: tasks submitted under the same key
//! execute strictly one at a time in submission order, while tasks under
//! distinct keys run concurrently with each other.

mod error;
mod group;
mod task;

pub use error::DispatchError;
pub use group::{DispatchGroup, DispatchGroupBuilder};
