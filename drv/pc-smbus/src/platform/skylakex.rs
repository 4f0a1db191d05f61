// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CPU-integrated SMBus on Skylake-X and Cascade Lake-X
//!
//! These parts move the memory SMBus into the uncore, where it is driven
//! entirely through PCI configuration space: one command register encodes
//! the whole transaction, and each of the two buses has its own command,
//! status and data registers.

use bitflags::bitflags;
use drv_pc_hw_access::PciConfigAccessor;
use drv_smbus_types::{
    is_eeprom_address, CommandKind, ResponseCode, Status, Transaction,
};
use ringbuf::*;

use super::{conclude, poll_until, Timing};

const SMB_CMD: u16 = 0x9c;
const SMB_STAT: u16 = 0xa8;
const SMB_DATA: u16 = 0xb4;

/// Distance between the registers of bus 0 and bus 1
const BUS_STRIDE: u16 = 4;
const BUSES: u8 = 2;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct SmbCmd: u32 {
        const TRIGGER = 1 << 19;
        const READ_ENABLE = 1 << 20;
        /// Read-only; set by firmware to lock out SPD writes
        const SPD_WRITE_DISABLE = 1 << 30;
        const _ = !0;
    }
}

const SMB_CMD_OFFSET_SHIFT: u32 = 0;
const SMB_CMD_ADDRESS_SHIFT: u32 = 8;
const SMB_CMD_TYPE_SHIFT: u32 = 16;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct SmbStat: u32 {
        const BUSY = 1 << 0;
        const BUS_ERROR = 1 << 1;
        const READ_VALID = 1 << 2;
        const WRITE_DONE = 1 << 3;
        const _ = !0;
    }
}

impl SmbStat {
    fn decode(self) -> Status {
        if self.contains(Self::BUSY) {
            Status::Busy
        } else if self.contains(Self::BUS_ERROR) {
            Status::Error
        } else if self.intersects(Self::READ_VALID | Self::WRITE_DONE) {
            Status::Success
        } else {
            Status::Ready
        }
    }
}

const SMB_DATA_WRITE_SHIFT: u32 = 16;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Command(u32),
    Status(u32),
    NoReadData(u32),
}

ringbuf!(Trace, 32, Trace::None);

fn command(txn: &Transaction) -> SmbCmd {
    let kind: u32 = match txn.command {
        CommandKind::Quick => 0,
        CommandKind::Byte => 1,
        CommandKind::ByteData => 2,
        CommandKind::WordData => 3,
    };

    let mut cmd = SmbCmd::from_bits_retain(
        u32::from(txn.offset) << SMB_CMD_OFFSET_SHIFT
            | u32::from(txn.address_byte()) << SMB_CMD_ADDRESS_SHIFT
            | kind << SMB_CMD_TYPE_SHIFT,
    ) | SmbCmd::TRIGGER;

    if !txn.is_write() {
        cmd |= SmbCmd::READ_ENABLE;
    }

    cmd
}

pub(crate) struct SkylakeX {
    pci: PciConfigAccessor,
}

impl SkylakeX {
    pub(crate) fn new(pci: PciConfigAccessor) -> Self {
        Self { pci }
    }

    pub(crate) fn supports_bus(bus: u8) -> bool {
        bus < BUSES
    }

    pub(crate) fn spd_write_disabled(&self) -> Result<bool, ResponseCode> {
        let cmd = SmbCmd::from_bits_retain(self.pci.read_u32(SMB_CMD)?);
        Ok(cmd.contains(SmbCmd::SPD_WRITE_DISABLE))
    }

    pub(crate) fn execute(
        &self,
        txn: &mut Transaction,
        timing: &Timing,
    ) -> Result<(), ResponseCode> {
        if !Self::supports_bus(txn.bus) {
            return Err(ResponseCode::Unsupported);
        }

        let stride = u16::from(txn.bus) * BUS_STRIDE;
        let pci = &self.pci;

        if txn.is_write() {
            pci.write_u32(
                SMB_DATA + stride,
                u32::from(txn.input) << SMB_DATA_WRITE_SHIFT,
            )?;
        }

        let cmd = command(txn);
        ringbuf_entry!(Trace::Command(cmd.bits()));
        pci.write_u32(SMB_CMD + stride, cmd.bits())?;

        if txn.is_write() && is_eeprom_address(txn.address) {
            std::thread::sleep(timing.write_settle);
        }

        let stat = poll_until(timing.timeout, || {
            let stat = SmbStat::from_bits_retain(pci.read_u32(SMB_STAT + stride)?);
            ringbuf_entry!(Trace::Status(stat.bits()));

            Ok(match stat.decode() {
                Status::Busy => None,
                _ => Some(stat),
            })
        })?;

        let Some(stat) = stat else {
            return conclude(txn, Status::Timeout);
        };

        //
        // Writes and quick commands have no data to wait for, and the host
        // may come back idle without flagging completion.  A data read, on
        // the other hand, is only good if the host says it is.
        //
        let status = match stat.decode() {
            Status::Ready | Status::Success
                if txn.is_write() || txn.command == CommandKind::Quick =>
            {
                Status::Success
            }
            Status::Success if stat.contains(SmbStat::READ_VALID) => {
                Status::Success
            }
            Status::Error => Status::Error,
            _ => {
                ringbuf_entry!(Trace::NoReadData(stat.bits()));
                Status::Error
            }
        };

        if status == Status::Success
            && !txn.is_write()
            && txn.command != CommandKind::Quick
        {
            let data = pci.read_u32(SMB_DATA + stride)?;

            txn.output = match txn.command {
                CommandKind::WordData => data as u16,
                _ => u16::from(data as u8),
            };
        }

        conclude(txn, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_encoding() {
        let txn = Transaction::read_byte_data(0, 0x51, 0x80);
        assert_eq!(command(&txn).bits(), 0x001a_a380);

        let txn = Transaction::write_byte_data(1, 0x50, 0x0b, 1);
        assert_eq!(command(&txn).bits(), 0x000a_a00b);

        let txn = Transaction::quick(0, 0x36, drv_smbus_types::AccessMode::Write);
        assert_eq!(command(&txn).bits(), 0x0008_6c00);
    }

    #[test]
    fn status_decode() {
        let decode = |bits| SmbStat::from_bits_retain(bits).decode();

        assert_eq!(decode(0x0), Status::Ready);
        assert_eq!(decode(0x1), Status::Busy);
        assert_eq!(decode(0x3), Status::Busy);
        assert_eq!(decode(0x2), Status::Error);
        assert_eq!(decode(0x4), Status::Success);
        assert_eq!(decode(0x8), Status::Success);
    }
}
