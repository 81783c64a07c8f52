//! Account scheduling.
//!
//! Request parsing and fingerprinting, sticky-session storage, per-bucket
//! snapshots of the schedulable pool, and the selector that turns all of it
//! into one account per request.

pub mod fingerprint;
pub mod selector;
pub mod session;
pub mod snapshot;

pub use fingerprint::{ParsedRequest, SessionContext, WireFormat};
pub use selector::{AccountSelector, SelectRequest, Selection};
pub use session::SessionStore;
pub use snapshot::{BucketKey, SnapshotCache};
