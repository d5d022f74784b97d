//! ASHA (Audio Streaming for Hearing Aids) audio sink for Linux over BlueZ.
//!
//! `main.rs` is a thin wire-up over this library: the public surface here
//! is `Coordinator`, `Device`, `Side`, the `Buffer` family, and the GATT/
//! L2CAP plumbing that drives a pair of hearing-aid peripherals.

pub mod buffer;
pub mod characteristic;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod enumerator;
pub mod error;
pub mod gatt_profile;
pub mod monitor;
pub mod properties;
pub mod raw_hci;
pub mod side;

pub use coordinator::{Coordinator, CoordinatorHandle};
pub use device::{Device, Frame};
pub use error::{Error, Result};
pub use side::Side;
