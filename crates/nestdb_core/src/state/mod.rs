//! Object state tracking: state records and the identity map.

mod identity;
mod record;

pub use identity::IdentityMap;
pub use record::{ObjectStatus, Snapshot, StateRecord};
