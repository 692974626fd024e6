//! Client reconciler: merges optimistic submissions, delivered events and
//! periodic full listings into one consistent per-session view.

pub mod session;
pub mod view;

pub use session::{LinkStatus, Session, SessionConfig};
pub use view::{Change, EntryStatus, Provenance, View, ViewEntry, ViewUpdate};
