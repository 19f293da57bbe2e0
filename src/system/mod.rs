pub mod buffer;
pub mod collector;
pub mod delta;
pub mod identity;
pub mod layout;
pub mod metrics;
pub mod parser;
pub mod platform;
pub mod process;
pub mod services;
pub mod snapshot;

pub use collector::{EngineParts, SnapshotEngine};
pub use identity::ProcessIdentity;
pub use snapshot::SystemSnapshot;
