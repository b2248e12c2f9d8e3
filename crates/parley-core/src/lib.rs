//! parley-core: shared types, wire format, and configuration.
//! All other Parley crates depend on this one.

pub mod config;
pub mod protocol;
pub mod snapshot;
pub mod wire;

pub use protocol::{Command, Reply};
pub use snapshot::{DirectorySnapshot, EntryView, Presence};
pub use wire::{Envelope, Unit, WireError};
