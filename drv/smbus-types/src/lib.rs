// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common types for SMBus host controllers and the SPD EEPROMs behind them
//!
//! This crate carries no hardware access of its own, so it can be shared
//! between the chipset drivers, the SPD protocol layer, simulated chipsets
//! used in tests, and any other transport that speaks the same logical EEPROM
//! protocol.

#![no_std]

use core::ops::RangeInclusive;

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

/// Addresses at which SPD EEPROMs answer, one per DIMM slot on a segment.
pub const SPD_ADDRESSES: RangeInclusive<u8> = 0x50..=0x57;

/// Returns `true` if `address` is one at which an SPD EEPROM may live.
pub fn is_eeprom_address(address: u8) -> bool {
    SPD_ADDRESSES.contains(&address)
}

/// The response code returned for SMBus and SPD operations.  As with any
/// bus error taxonomy, the caller is not necessarily expected to handle each
/// of these differently; they exist to give upstack software some modicum of
/// context surrounding the failure.
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum ResponseCode {
    /// The controller stayed busy past the transaction timeout.
    Timeout = 1,
    /// The device NACKed, the controller flagged a bus or device error, or a
    /// device-side precondition (e.g. DDR5 offline mode) is not met.
    DeviceError,
    /// The EEPROM offset lies outside the module's SPD space.
    InvalidOffset,
    /// The operation is not valid for this bus, platform, or memory
    /// generation.
    Unsupported,
    /// Either the process-wide bus lock or the machine-wide I/O mutex could
    /// not be acquired in time.
    LockUnavailable,
    /// The raw hardware access provider reported failure.
    AccessFailed,
    /// No usable SMBus host controller was found; the controller is
    /// permanently disconnected.
    NoController,
    /// An argument (address, bus, block index) is malformed.
    BadArg,
}

impl core::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Self::Timeout => "transaction timed out",
            Self::DeviceError => "device or bus error",
            Self::InvalidOffset => "offset outside SPD space",
            Self::Unsupported => "operation not supported",
            Self::LockUnavailable => "bus lock unavailable",
            Self::AccessFailed => "hardware access failed",
            Self::NoController => "no SMBus controller",
            Self::BadArg => "bad argument",
        };
        f.write_str(msg)
    }
}

///
/// The state of a transaction, as decoded from a platform's status register.
/// Every platform decodes its own bit positions into this shared
/// representation.
///
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Status {
    /// The host is idle and no completion is flagged.
    Ready,
    /// The host is executing a transaction.
    Busy,
    Success,
    Error,
    /// The host stayed busy past the poll budget.
    Timeout,
    /// The transaction never started (bus refused, lock unavailable) or was
    /// killed.
    Aborted,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::Timeout | Self::Aborted
        )
    }
}

/// Direction of a transaction; the discriminant is the R/W bit that follows
/// the slave address on the wire.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum AccessMode {
    Write = 0,
    Read = 1,
}

///
/// SMBus command protocols used by SPD access.  `Quick` carries no data at
/// all -- the address and R/W bit alone convey meaning, which is exactly how
/// the SPD write-protection and page-select commands work.
///
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub enum CommandKind {
    Quick,
    /// Send/receive byte: a single data byte with no command code.
    Byte,
    ByteData,
    WordData,
}

///
/// One SMBus target: the bus (port) number on the host controller, and the
/// 7-bit slave address on that bus.
///
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub struct BusAddress {
    pub bus: u8,
    pub address: u8,
}

impl BusAddress {
    pub fn new(bus: u8, address: u8) -> Result<Self, ResponseCode> {
        if address > 0x7f {
            return Err(ResponseCode::BadArg);
        }

        Ok(Self { bus, address })
    }
}

impl core::fmt::Display for BusAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "bus{}:{:#04x}", self.bus, self.address)
    }
}

///
/// A single SMBus transaction.  These are created, executed, and discarded
/// within a single operation; the controller fills in `output` and `status`.
///
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub bus: u8,
    pub address: u8,
    /// Command code; for SPD EEPROMs this is the byte offset in the page.
    pub offset: u8,
    pub access: AccessMode,
    pub command: CommandKind,
    /// Data to write (low byte only unless `command` is `WordData`).
    pub input: u16,
    /// Data read back (low byte only unless `command` is `WordData`).
    pub output: u16,
    pub status: Status,
}

impl Transaction {
    pub fn new(
        bus: u8,
        address: u8,
        offset: u8,
        access: AccessMode,
        command: CommandKind,
        input: u16,
    ) -> Self {
        Self {
            bus,
            address,
            offset,
            access,
            command,
            input,
            output: 0,
            status: Status::Ready,
        }
    }

    /// A quick command: no command code and no data phase.
    pub fn quick(bus: u8, address: u8, access: AccessMode) -> Self {
        Self::new(bus, address, 0, access, CommandKind::Quick, 0)
    }

    pub fn receive_byte(bus: u8, address: u8) -> Self {
        Self::new(bus, address, 0, AccessMode::Read, CommandKind::Byte, 0)
    }

    pub fn read_byte_data(bus: u8, address: u8, offset: u8) -> Self {
        Self::new(
            bus,
            address,
            offset,
            AccessMode::Read,
            CommandKind::ByteData,
            0,
        )
    }

    pub fn write_byte_data(bus: u8, address: u8, offset: u8, val: u8) -> Self {
        Self::new(
            bus,
            address,
            offset,
            AccessMode::Write,
            CommandKind::ByteData,
            val.into(),
        )
    }

    pub fn read_word_data(bus: u8, address: u8, offset: u8) -> Self {
        Self::new(
            bus,
            address,
            offset,
            AccessMode::Read,
            CommandKind::WordData,
            0,
        )
    }

    pub fn is_write(&self) -> bool {
        self.access == AccessMode::Write
    }

    pub fn output_byte(&self) -> u8 {
        self.output as u8
    }

    /// The slave address shifted into place with the R/W bit, as it appears
    /// in every host's address register.
    pub fn address_byte(&self) -> u8 {
        (self.address << 1) | self.access as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_byte_carries_rw_bit() {
        let txn = Transaction::read_byte_data(0, 0x50, 2);
        assert_eq!(txn.address_byte(), 0xa1);

        let txn = Transaction::quick(0, 0x36, AccessMode::Write);
        assert_eq!(txn.address_byte(), 0x6c);
    }

    #[test]
    fn bus_address_rejects_ten_bit() {
        assert_eq!(BusAddress::new(0, 0x80), Err(ResponseCode::BadArg));
        assert!(BusAddress::new(1, 0x57).is_ok());
    }

    #[test]
    fn terminal_states() {
        assert!(!Status::Ready.is_terminal());
        assert!(!Status::Busy.is_terminal());
        assert!(Status::Success.is_terminal());
        assert!(Status::Timeout.is_terminal());
    }

    #[test]
    fn response_codes_round_trip_through_u32() {
        use num_traits::FromPrimitive;

        assert_eq!(ResponseCode::from_u32(1), Some(ResponseCode::Timeout));
        assert_eq!(
            ResponseCode::from_u32(ResponseCode::BadArg as u32),
            Some(ResponseCode::BadArg)
        );
        assert_eq!(ResponseCode::from_u32(0), None);
    }
}
