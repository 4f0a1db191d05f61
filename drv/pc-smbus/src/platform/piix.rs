// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PIIX4-compatible SMBus host, as found in Intel ICH/PCH and AMD FCH parts

use bitflags::bitflags;
use drv_pc_hw_access::{IoPort, PciConfigAccessor};
use drv_smbus_types::{
    is_eeprom_address, CommandKind, ResponseCode, Status, Transaction,
};
use ringbuf::*;

use super::{conclude, poll_until, Timing};

// Offsets from the SMBus I/O base
const HST_STS: u16 = 0x00;
const HST_CNT: u16 = 0x02;
const HST_CMD: u16 = 0x03;
const XMIT_SLVA: u16 = 0x04;
const HST_D0: u16 = 0x05;
const HST_D1: u16 = 0x06;

/// SMBus base address register in the Intel SMBus function's config space
const SMBBAR: u16 = 0x20;
const SMBBAR_MASK: u32 = 0xffe0;

/// Host configuration register; carries the SPD write disable bit
const HOSTC: u16 = 0x40;
const HOSTC_SPD_WD: u8 = 1 << 4;

/// FCH power management index/data pair in legacy I/O space
const AMD_PM_INDEX: u16 = 0xcd6;
const AMD_PM_SMBUS_EN: u8 = 0x00;
const AMD_PM_SMBUS_BASE_HI: u8 = 0x01;
const AMD_SMBUS_DEFAULT_BASE: u16 = 0x0b00;

/// Distance between the register blocks of successive AMD SMBus ports
const AMD_BUS_STRIDE: u16 = 0x20;
const AMD_BUSES: u8 = 2;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct HostStatus: u8 {
        const HOST_BUSY = 1 << 0;
        const INTR = 1 << 1;
        const DEV_ERR = 1 << 2;
        const BUS_ERR = 1 << 3;
        const FAILED = 1 << 4;
        const _ = !0;
    }
}

impl HostStatus {
    /// Every write-one-to-clear completion flag
    const CLEAR: Self = Self::INTR
        .union(Self::DEV_ERR)
        .union(Self::BUS_ERR)
        .union(Self::FAILED);

    fn decode(self) -> Status {
        if self.contains(Self::HOST_BUSY) {
            Status::Busy
        } else if self
            .intersects(Self::DEV_ERR | Self::BUS_ERR | Self::FAILED)
        {
            Status::Error
        } else if self.contains(Self::INTR) {
            Status::Success
        } else {
            Status::Ready
        }
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct HostControl: u8 {
        const INTREN = 1 << 0;
        const KILL = 1 << 1;
        const BYTE = 0b001 << 2;
        const BYTE_DATA = 0b010 << 2;
        const WORD_DATA = 0b011 << 2;
        const START = 1 << 6;
    }
}

impl HostControl {
    fn command(kind: CommandKind) -> Self {
        match kind {
            CommandKind::Quick => Self::empty(),
            CommandKind::Byte => Self::BYTE,
            CommandKind::ByteData => Self::BYTE_DATA,
            CommandKind::WordData => Self::WORD_DATA,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Base(u16),
    Status(u8),
    NotReady(u8),
    Kill(u8),
}

ringbuf!(Trace, 32, Trace::None);

enum Flavor {
    Intel { pci: PciConfigAccessor },
    Amd,
}

pub(crate) struct Piix {
    flavor: Flavor,
    io: IoPort,
}

impl Piix {
    pub(crate) fn intel(
        pci: PciConfigAccessor,
        io: impl Fn(u16) -> IoPort,
    ) -> Result<Self, ResponseCode> {
        let base = (pci.read_u32(SMBBAR)? & SMBBAR_MASK) as u16;
        ringbuf_entry!(Trace::Base(base));

        if base == 0 {
            return Err(ResponseCode::NoController);
        }

        Ok(Self {
            flavor: Flavor::Intel { pci },
            io: io(base),
        })
    }

    ///
    /// The FCH exposes its SMBus base through power management registers
    /// rather than a BAR; if the enable bit is clear, firmware has left the
    /// port at its reset default.
    ///
    pub(crate) fn amd(io: impl Fn(u16) -> IoPort) -> Result<Self, ResponseCode> {
        let legacy = io(0);
        let en = legacy.read_indexed(AMD_PM_INDEX, AMD_PM_SMBUS_EN)?;

        let base = if en & (1 << 4) != 0 {
            let hi = legacy.read_indexed(AMD_PM_INDEX, AMD_PM_SMBUS_BASE_HI)?;
            u16::from(hi) << 8
        } else {
            AMD_SMBUS_DEFAULT_BASE
        };

        ringbuf_entry!(Trace::Base(base));

        if base == 0 {
            return Err(ResponseCode::NoController);
        }

        Ok(Self {
            flavor: Flavor::Amd,
            io: io(base),
        })
    }

    pub(crate) fn supports_bus(&self, bus: u8) -> bool {
        match self.flavor {
            Flavor::Intel { .. } => bus == 0,
            Flavor::Amd => bus < AMD_BUSES,
        }
    }

    pub(crate) fn spd_write_disabled(&self) -> Result<bool, ResponseCode> {
        match &self.flavor {
            Flavor::Intel { pci } => Ok(pci.read_u8(HOSTC)? & HOSTC_SPD_WD != 0),
            Flavor::Amd => Ok(false),
        }
    }

    fn port(&self, bus: u8) -> Result<IoPort, ResponseCode> {
        if !self.supports_bus(bus) {
            return Err(ResponseCode::Unsupported);
        }

        Ok(self.io.offset_by(u16::from(bus) * AMD_BUS_STRIDE))
    }

    fn status(io: &IoPort) -> Result<HostStatus, ResponseCode> {
        Ok(HostStatus::from_bits_retain(io.read_u8(HST_STS)?))
    }

    ///
    /// Stops whatever the host is doing and leaves it idle with every flag
    /// cleared.
    ///
    fn kill(io: &IoPort) -> Result<(), ResponseCode> {
        ringbuf_entry!(Trace::Kill(Self::status(io)?.bits()));
        io.write_u8(HST_CNT, HostControl::KILL.bits())?;
        io.write_u8(HST_CNT, 0)?;
        io.write_u8(HST_STS, HostStatus::CLEAR.bits())
    }

    pub(crate) fn execute(
        &self,
        txn: &mut Transaction,
        timing: &Timing,
    ) -> Result<(), ResponseCode> {
        let io = self.port(txn.bus)?;

        io.write_u8(HST_STS, HostStatus::CLEAR.bits())?;

        //
        // Someone may have left the host mid-transaction; give it the same
        // budget as a transaction of our own to become idle.
        //
        let idle = poll_until(timing.timeout, || {
            let sts = Self::status(&io)?;
            Ok((!sts.contains(HostStatus::HOST_BUSY)).then_some(()))
        })?;

        if idle.is_none() {
            ringbuf_entry!(Trace::NotReady(Self::status(&io)?.bits()));
            Self::kill(&io)?;
            return conclude(txn, Status::Timeout);
        }

        io.write_u8(XMIT_SLVA, txn.address_byte())?;

        if txn.is_write() {
            let [lo, hi] = txn.input.to_le_bytes();
            io.write_u8(HST_D0, lo)?;

            if txn.command == CommandKind::WordData {
                io.write_u8(HST_D1, hi)?;
            }
        }

        io.write_u8(HST_CMD, txn.offset)?;

        let control =
            HostControl::INTREN | HostControl::command(txn.command) | HostControl::START;
        io.write_u8(HST_CNT, control.bits())?;

        if txn.is_write() && is_eeprom_address(txn.address) {
            std::thread::sleep(timing.write_settle);
        }

        let status = poll_until(timing.timeout, || {
            let sts = Self::status(&io)?;
            ringbuf_entry!(Trace::Status(sts.bits()));

            match sts.decode() {
                s @ (Status::Success | Status::Error) => Ok(Some(s)),
                _ => Ok(None),
            }
        })?;

        let Some(status) = status else {
            Self::kill(&io)?;
            return conclude(txn, Status::Timeout);
        };

        io.write_u8(HST_STS, HostStatus::CLEAR.bits())?;

        if status == Status::Success && !txn.is_write() {
            let lo = io.read_u8(HST_D0)?;
            let hi = match txn.command {
                CommandKind::WordData => io.read_u8(HST_D1)?,
                _ => 0,
            };

            txn.output = u16::from_le_bytes([lo, hi]);
        }

        conclude(txn, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_decode_precedence() {
        let decode = |bits| HostStatus::from_bits_retain(bits).decode();

        assert_eq!(decode(0x00), Status::Ready);
        assert_eq!(decode(0x01), Status::Busy);
        assert_eq!(decode(0x03), Status::Busy);
        assert_eq!(decode(0x02), Status::Success);
        assert_eq!(decode(0x06), Status::Error);
        assert_eq!(decode(0x08), Status::Error);
        assert_eq!(decode(0x10), Status::Error);

        // INUSE_STS and friends in the upper bits are not ours to interpret
        assert_eq!(decode(0x42), Status::Success);
    }

    #[test]
    fn control_encodes_command_type() {
        let control = HostControl::INTREN
            | HostControl::command(CommandKind::WordData)
            | HostControl::START;
        assert_eq!(control.bits(), 0x4d);
        assert!(HostControl::command(CommandKind::Quick).is_empty());
        assert_eq!(HostStatus::CLEAR.bits(), 0x1e);
    }
}
