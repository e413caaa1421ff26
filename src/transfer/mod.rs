//! Data transfer between memory tiers.
//!
//! - [`device`]: accelerator memory pool, host ↔ device copies

pub mod device;

pub use device::{
    DeviceBuffers, DeviceError, DevicePool, DeviceReservation, HostBuffers, ReleaseNotice,
};
