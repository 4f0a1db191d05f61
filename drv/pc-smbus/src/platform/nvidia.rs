// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nvidia nForce/MCP SMBus host

use drv_pc_hw_access::{IoPort, PciConfigAccessor};
use drv_smbus_types::{
    is_eeprom_address, CommandKind, ResponseCode, Status, Transaction,
};
use ringbuf::*;

use super::{conclude, poll_until, Timing};

const SMB_PRTCL: u16 = 0x00;
const SMB_STS: u16 = 0x01;
const SMB_ADDR: u16 = 0x02;
const SMB_CMD: u16 = 0x03;
const SMB_DATA0: u16 = 0x04;
const SMB_DATA1: u16 = 0x05;

const PRTCL_READ: u8 = 0x01;
const PRTCL_QUICK: u8 = 0x02;
const PRTCL_BYTE: u8 = 0x04;
const PRTCL_BYTE_DATA: u8 = 0x06;
const PRTCL_WORD_DATA: u8 = 0x08;

const STS_DONE: u8 = 0x80;
const STS_ALARM: u8 = 0x40;
const STS_STATUS: u8 = 0x1f;
/// Error field value for a protocol the host refused outright
const STS_INVALID: u8 = 0x1f;

const SMBBAR: u16 = 0x20;
const SMBBAR_MASK: u32 = 0xfffc;

/// The write cycle of EEPROMs behind these hosts has been observed to need
/// twice the settle time used elsewhere.
const WRITE_SETTLE_FACTOR: u32 = 2;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Base(u16),
    Status(u8),
    Invalid(u8),
}

ringbuf!(Trace, 32, Trace::None);

fn decode(sts: u8) -> Status {
    if sts & STS_STATUS != 0 {
        Status::Error
    } else if sts & STS_DONE != 0 {
        Status::Success
    } else {
        Status::Busy
    }
}

fn protocol(txn: &Transaction) -> u8 {
    let prtcl = match txn.command {
        CommandKind::Quick => PRTCL_QUICK,
        CommandKind::Byte => PRTCL_BYTE,
        CommandKind::ByteData => PRTCL_BYTE_DATA,
        CommandKind::WordData => PRTCL_WORD_DATA,
    };

    if txn.is_write() {
        prtcl
    } else {
        prtcl | PRTCL_READ
    }
}

pub(crate) struct Nvidia {
    io: IoPort,
}

impl Nvidia {
    pub(crate) fn new(
        pci: PciConfigAccessor,
        io: impl Fn(u16) -> IoPort,
    ) -> Result<Self, ResponseCode> {
        let base = (pci.read_u32(SMBBAR)? & SMBBAR_MASK) as u16;
        ringbuf_entry!(Trace::Base(base));

        if base == 0 {
            return Err(ResponseCode::NoController);
        }

        Ok(Self { io: io(base) })
    }

    pub(crate) fn execute(
        &self,
        txn: &mut Transaction,
        timing: &Timing,
    ) -> Result<(), ResponseCode> {
        if txn.bus != 0 {
            return Err(ResponseCode::Unsupported);
        }

        let io = &self.io;

        io.write_u8(SMB_STS, STS_DONE | STS_ALARM | STS_STATUS)?;
        io.write_u8(SMB_ADDR, txn.address << 1)?;
        io.write_u8(SMB_CMD, txn.offset)?;

        if txn.is_write() {
            let [lo, hi] = txn.input.to_le_bytes();
            io.write_u8(SMB_DATA0, lo)?;

            if txn.command == CommandKind::WordData {
                io.write_u8(SMB_DATA1, hi)?;
            }
        }

        io.write_u8(SMB_PRTCL, protocol(txn))?;

        if txn.is_write() && is_eeprom_address(txn.address) {
            std::thread::sleep(timing.write_settle * WRITE_SETTLE_FACTOR);
        }

        let sts = poll_until(timing.timeout, || {
            let sts = io.read_u8(SMB_STS)?;
            ringbuf_entry!(Trace::Status(sts));

            Ok(match decode(sts) {
                Status::Busy => None,
                _ => Some(sts),
            })
        })?;

        let Some(sts) = sts else {
            return conclude(txn, Status::Timeout);
        };

        if sts & STS_STATUS == STS_INVALID {
            ringbuf_entry!(Trace::Invalid(sts));
        }

        let status = decode(sts);

        if status == Status::Success && !txn.is_write() {
            let lo = io.read_u8(SMB_DATA0)?;
            let hi = match txn.command {
                CommandKind::WordData => io.read_u8(SMB_DATA1)?,
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
    fn status_decode() {
        assert_eq!(decode(0x00), Status::Busy);
        assert_eq!(decode(STS_ALARM), Status::Busy);
        assert_eq!(decode(STS_DONE), Status::Success);
        assert_eq!(decode(STS_DONE | 0x10), Status::Error);
        assert_eq!(decode(STS_INVALID), Status::Error);
    }

    #[test]
    fn protocol_encoding() {
        let txn = Transaction::read_byte_data(0, 0x50, 0);
        assert_eq!(protocol(&txn), 0x07);

        let txn = Transaction::write_byte_data(0, 0x50, 0, 1);
        assert_eq!(protocol(&txn), 0x06);

        let txn = Transaction::read_word_data(0, 0x50, 0);
        assert_eq!(protocol(&txn), 0x09);

        let txn = Transaction::receive_byte(0, 0x50);
        assert_eq!(protocol(&txn), 0x05);
    }
}
