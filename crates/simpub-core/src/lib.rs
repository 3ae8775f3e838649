//! simpub-core: shared wire format and configuration.
//! All other simpub crates depend on this one.

pub mod config;
pub mod wire;

pub use config::SimpubConfig;
pub use wire::{Announcement, PortRole, WireError};
