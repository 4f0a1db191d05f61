// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chipset classification and per-platform register sequences

use std::sync::Arc;
use std::time::{Duration, Instant};

use drv_pc_hw_access::{
    IoPort, MachineMutex, PciConfigAccessor, RawAccess,
};
use drv_smbus_types::{ResponseCode, Status, Transaction};

use crate::vendor;

mod nvidia;
mod piix;
mod skylakex;

pub(crate) use nvidia::Nvidia;
pub(crate) use piix::Piix;
pub(crate) use skylakex::SkylakeX;

/// Device id of the CPU-integrated SMBus on Skylake-X and Cascade Lake-X.
pub const SKYLAKE_X_SMBUS: u16 = 0x2085;

const SKYLAKE_X_IDS: &[u16] = &[SKYLAKE_X_SMBUS];

const INTEL_SMBUS_IDS: &[u16] = &[
    0x24c3, // ICH4
    0x24d3, // ICH5
    0x266a, // ICH6
    0x27da, // ICH7
    0x283e, // ICH8
    0x2930, // ICH9
    0x3a30, // ICH10
    0x3a60, // ICH10 (corporate)
    0x3b30, // 5 series / 3400
    0x1c22, // 6 series (Cougar Point)
    0x1d22, // C600 / X79 (Patsburg)
    0x1e22, // 7 series (Panther Point)
    0x8c22, // 8 series (Lynx Point)
    0x9c22, // Lynx Point-LP
    0x8ca2, // 9 series (Wildcat Point)
    0x9ca2, // Wildcat Point-LP
    0x8d22, // C610 / X99 (Wellsburg)
    0xa123, // 100 series (Sunrise Point-H)
    0x9d23, // Sunrise Point-LP
    0xa1a3, // C620 (Lewisburg)
    0xa2a3, // 200 series / X299 (Union Point)
    0xa323, // 300 series (Cannon Lake-H)
    0x9da3, // Cannon Lake-LP
    0x02a3, // Comet Lake-LP
    0x06a3, // 400 series (Comet Lake-H)
    0xa3a3, // Comet Lake-V
    0x43a3, // 500 series (Tiger Lake-H)
    0xa0a3, // Tiger Lake-LP
    0x7aa3, // 600 series (Alder Lake-S)
    0x51a3, // Alder Lake-P
    0x7a23, // 700 series (Raptor Lake-S)
    0x7e22, // Meteor Lake-P
];

const AMD_SMBUS_IDS: &[u16] = &[
    0x4385, // SB600 / SB7x0 / SB8x0
    0x780b, // Hudson-2 / FCH
    0x790b, // FCH (Bolton and later)
];

const NVIDIA_SMBUS_IDS: &[u16] = &[
    0x0064, // nForce2
    0x0084, // nForce2 Ultra 400
    0x00d4, // nForce3 Pro150
    0x00e4, // nForce3 250
    0x0052, // nForce4
    0x0034, // MCP04
    0x0264, // MCP51
    0x0368, // MCP55
    0x03eb, // MCP61
    0x0446, // MCP65
    0x0542, // MCP67
    0x07d8, // MCP73
    0x0752, // MCP78S
    0x0aa2, // MCP79
    0x0d79, // MCP89
];

///
/// The broad family of a host controller: whether we know how to drive it,
/// and if so, whether it is a chipset SMBus in I/O space or the
/// CPU-integrated one in PCI configuration space.
///
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PlatformFamily {
    Unknown,
    Default,
    SkylakeX,
}

/// Classifies a host controller by its PCI vendor and device ids.
pub fn classify(vendor_id: u16, device_id: u16) -> PlatformFamily {
    match vendor_id {
        vendor::INTEL if SKYLAKE_X_IDS.contains(&device_id) => {
            PlatformFamily::SkylakeX
        }
        vendor::INTEL if INTEL_SMBUS_IDS.contains(&device_id) => {
            PlatformFamily::Default
        }
        vendor::AMD | vendor::ATI if AMD_SMBUS_IDS.contains(&device_id) => {
            PlatformFamily::Default
        }
        vendor::NVIDIA if NVIDIA_SMBUS_IDS.contains(&device_id) => {
            PlatformFamily::Default
        }
        _ => PlatformFamily::Unknown,
    }
}

///
/// Timing parameters for a transaction.
///
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Timing {
    /// Budget for the controller to reach a terminal state
    pub timeout: Duration,
    /// Sleep between starting a write to an SPD EEPROM and polling for its
    /// completion; the EEPROM NACKs everything during its write cycle.
    pub write_settle: Duration,
}

///
/// How many samples of the status register we take back to back before we
/// start yielding the CPU between samples.  A byte-data transaction at
/// 100 kHz completes in well under a millisecond, which this comfortably
/// covers on real hardware.
///
const SPIN_THRESHOLD: u32 = 300;

///
/// A common routine to sample a status register until `check` reports a
/// terminal value or `timeout` elapses.  Returns `Ok(None)` on timeout;
/// hardware access failures are propagated immediately.
///
pub(crate) fn poll_until<T>(
    timeout: Duration,
    mut check: impl FnMut() -> Result<Option<T>, ResponseCode>,
) -> Result<Option<T>, ResponseCode> {
    let deadline = Instant::now() + timeout;
    let mut lap = 0u32;

    loop {
        if let Some(val) = check()? {
            return Ok(Some(val));
        }

        if Instant::now() >= deadline {
            return Ok(None);
        }

        if lap < SPIN_THRESHOLD {
            lap += 1;
            core::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}

///
/// The register-level personality of a host controller, chosen once when
/// the controller is constructed.
///
pub(crate) enum Platform {
    Piix(Piix),
    Nvidia(Nvidia),
    SkylakeX(SkylakeX),
}

impl Platform {
    ///
    /// Builds the platform for a classified controller.  `pci` is the SMBus
    /// function itself; I/O windows are created against `raw` and serialize
    /// through `mutex` if one is given.
    ///
    pub(crate) fn new(
        vendor_id: u16,
        device_id: u16,
        pci: PciConfigAccessor,
        raw: &Arc<dyn RawAccess>,
        mutex: Option<Arc<MachineMutex>>,
        lock_timeout: Duration,
    ) -> Result<Self, ResponseCode> {
        let io = |base| {
            IoPort::new(raw.clone(), base).with_mutex(mutex.clone(), lock_timeout)
        };

        match (classify(vendor_id, device_id), vendor_id) {
            (PlatformFamily::SkylakeX, _) => {
                Ok(Self::SkylakeX(SkylakeX::new(pci)))
            }
            (PlatformFamily::Default, vendor::INTEL) => {
                Ok(Self::Piix(Piix::intel(pci, io)?))
            }
            (PlatformFamily::Default, vendor::AMD | vendor::ATI) => {
                Ok(Self::Piix(Piix::amd(io)?))
            }
            (PlatformFamily::Default, vendor::NVIDIA) => {
                Ok(Self::Nvidia(Nvidia::new(pci, io)?))
            }
            _ => Err(ResponseCode::NoController),
        }
    }

    pub(crate) fn family(&self) -> PlatformFamily {
        match self {
            Self::Piix(_) | Self::Nvidia(_) => PlatformFamily::Default,
            Self::SkylakeX(_) => PlatformFamily::SkylakeX,
        }
    }

    pub(crate) fn supports_bus(&self, bus: u8) -> bool {
        match self {
            Self::Piix(piix) => piix.supports_bus(bus),
            Self::Nvidia(_) => bus == 0,
            Self::SkylakeX(_) => SkylakeX::supports_bus(bus),
        }
    }

    /// Whether firmware has locked out writes to SPD addresses.
    pub(crate) fn spd_write_disabled(&self) -> Result<bool, ResponseCode> {
        match self {
            Self::Piix(piix) => piix.spd_write_disabled(),
            Self::Nvidia(_) => Ok(false),
            Self::SkylakeX(skx) => skx.spd_write_disabled(),
        }
    }

    ///
    /// Runs one transaction to completion.  On return, `txn.status` is
    /// terminal: if a failure prevented the controller from ever reporting a
    /// status, the transaction is marked aborted.
    ///
    pub(crate) fn execute(
        &self,
        txn: &mut Transaction,
        timing: &Timing,
    ) -> Result<(), ResponseCode> {
        let rval = match self {
            Self::Piix(piix) => piix.execute(txn, timing),
            Self::Nvidia(nv) => nv.execute(txn, timing),
            Self::SkylakeX(skx) => skx.execute(txn, timing),
        };

        if rval.is_err() && !txn.status.is_terminal() {
            txn.status = Status::Aborted;
        }

        rval
    }
}

/// Maps a terminal status to the result of a transaction.
pub(crate) fn conclude(
    txn: &mut Transaction,
    status: Status,
) -> Result<(), ResponseCode> {
    txn.status = status;

    match status {
        Status::Success => Ok(()),
        Status::Timeout => Err(ResponseCode::Timeout),
        Status::Aborted => Err(ResponseCode::AccessFailed),
        _ => Err(ResponseCode::DeviceError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(classify(0x8086, 0x2085), PlatformFamily::SkylakeX);
        assert_eq!(classify(0x8086, 0x7aa3), PlatformFamily::Default);
        assert_eq!(classify(0x1022, 0x790b), PlatformFamily::Default);
        assert_eq!(classify(0x1002, 0x4385), PlatformFamily::Default);
        assert_eq!(classify(0x10de, 0x0aa2), PlatformFamily::Default);

        // Right device, wrong vendor
        assert_eq!(classify(0x1022, 0x2085), PlatformFamily::Unknown);
        assert_eq!(classify(0x10de, 0x7aa3), PlatformFamily::Unknown);
        assert_eq!(classify(0x8086, 0x1234), PlatformFamily::Unknown);
    }

    #[test]
    fn poll_returns_first_terminal_value() {
        let mut samples = [None, None, Some(3u8)].into_iter();
        let rval = poll_until(Duration::from_secs(1), || {
            Ok(samples.next().flatten())
        });
        assert_eq!(rval, Ok(Some(3)));
    }

    #[test]
    fn poll_gives_up_at_deadline() {
        let start = Instant::now();
        let rval: Result<Option<()>, _> =
            poll_until(Duration::from_millis(20), || Ok(None));

        assert_eq!(rval, Ok(None));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn poll_propagates_access_failure() {
        let rval: Result<Option<()>, _> =
            poll_until(Duration::from_secs(1), || Err(ResponseCode::AccessFailed));
        assert_eq!(rval, Err(ResponseCode::AccessFailed));
    }
}
