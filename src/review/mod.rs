//! Review & sync: the gate between staging and production.

pub mod queue;
pub mod sync;
pub mod verifier;

pub use queue::{ReviewQueue, ReviewStats};
pub use sync::{SyncPlanner, SyncPreview, SyncRequest};
pub use verifier::{AutoVerifier, Decision};
