//! Schedule-driven behavior: settings overlays and replica patches

mod replica_patch;
mod settings;

pub use replica_patch::{active_replica_patch, purge_expired_patches};
pub use settings::{build_scheduler, scheduled_settings};
