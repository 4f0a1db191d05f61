// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the SMBus host controllers found on PC chipsets
//!
//! Three incompatible register layouts live behind one transaction engine:
//!
//! - PIIX-compatible hosts in I/O space: Intel ICH/PCH and AMD FCH.
//! - Nvidia MCP hosts in I/O space.
//! - The CPU-integrated SMBus on Skylake-X and Cascade Lake-X, driven
//!   through PCI configuration space.
//!
//! A [`SmbusSession`] owns the hardware access provider and the lock that
//! serializes every transaction in the process; it hands out
//! [`SmbusController`]s, each of which tracks one logical bus and the SPD
//! module currently being addressed on it.

mod config;
mod controller;
mod platform;

pub use config::SmbusConfig;
pub use controller::{
    BusLock, BusLockGuard, PageSelect, SmbusController, SmbusSession,
};
pub use platform::{classify, PlatformFamily, Timing};

pub use drv_smbus_types::{
    AccessMode, BusAddress, CommandKind, ResponseCode, Status, Transaction,
};

/// PCI vendor ids of the chipset vendors we know how to drive.
pub mod vendor {
    pub const INTEL: u16 = 0x8086;
    pub const AMD: u16 = 0x1022;
    /// SB7x0/SB8x0 southbridges predate the merger and report ATI.
    pub const ATI: u16 = 0x1002;
    pub const NVIDIA: u16 = 0x10de;
}
