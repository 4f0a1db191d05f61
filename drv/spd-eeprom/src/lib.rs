// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to the SPD EEPROM on memory modules
//!
//! Three generations of SPD device sit at the same SMBus addresses and look
//! nothing alike past the first byte:
//!
//! - Pre-DDR4 parts (EE1002 style) are a flat 256-byte EEPROM whose lower
//!   half can be write protected, reversibly or permanently, with quick
//!   commands at the 0x30..0x37 command addresses.
//! - DDR4 parts (EE1004) hold 512 bytes in two 256-byte pages selected by
//!   quick commands, with four reversibly protectable quarters.
//! - DDR5 parts (SPD5118 hubs) hold 1 KiB in eight 128-byte pages selected
//!   through a mode register, with sixteen protectable 64-byte blocks whose
//!   protection lives in a pair of bitmap registers.
//!
//! [`SpdAccess`] is the logical surface shared by everything that can reach
//! an SPD EEPROM; [`SpdEeprom`] implements it on top of a
//! [`SmbusController`](drv_pc_smbus::SmbusController).

use drv_smbus_types::{BusAddress, ResponseCode};

mod eeprom;

pub use eeprom::SpdEeprom;

/// The family of SPD device on a module, which decides its layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Generation {
    /// Everything before DDR4: one 256-byte page
    Legacy,
    Ddr4,
    Ddr5,
}

impl Generation {
    ///
    /// Works out the generation from what probing the module found: DDR5 is
    /// recognized by its PMIC or its size, DDR4 and older parts by their
    /// size.  `None` if the size could not be determined.
    ///
    pub fn detect(ddr5: bool, size: u16) -> Option<Self> {
        match size {
            _ if ddr5 => Some(Self::Ddr5),
            1024 => Some(Self::Ddr5),
            512 => Some(Self::Ddr4),
            256 => Some(Self::Legacy),
            _ => None,
        }
    }

    /// Total bytes of EEPROM.
    pub fn size(self) -> u16 {
        match self {
            Self::Legacy => 256,
            Self::Ddr4 => 512,
            Self::Ddr5 => 1024,
        }
    }

    /// Bytes mapped into the offset space at once.
    pub fn page_size(self) -> u16 {
        match self {
            Self::Legacy | Self::Ddr4 => 256,
            Self::Ddr5 => 128,
        }
    }

    pub fn is_paged(self) -> bool {
        self != Self::Legacy
    }

    /// Number of reversibly protectable blocks.
    pub fn rswp_blocks(self) -> u8 {
        match self {
            Self::Legacy => 1,
            Self::Ddr4 => 4,
            Self::Ddr5 => 16,
        }
    }

    pub fn block_size(self) -> u16 {
        match self {
            Self::Legacy | Self::Ddr4 => 128,
            Self::Ddr5 => 64,
        }
    }
}

///
/// Reversible write protection of every block of a device, one bit per
/// block with block 0 in the least significant bit.
///
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WriteProtection {
    pub bits: u16,
    pub blocks: u8,
}

impl WriteProtection {
    pub fn new(blocks: u8) -> Self {
        Self { bits: 0, blocks }
    }

    pub fn is_protected(&self, block: u8) -> bool {
        block < self.blocks && self.bits & (1 << block) != 0
    }

    pub fn set(&mut self, block: u8, protected: bool) {
        if block >= self.blocks {
            return;
        }

        if protected {
            self.bits |= 1 << block;
        } else {
            self.bits &= !(1 << block);
        }
    }

    /// Iterates over the indices of protected blocks.
    pub fn protected(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.blocks).filter(|&b| self.is_protected(b))
    }
}

///
/// Everything that can go wrong talking to an SPD EEPROM, with enough context
/// to say which device and location it went wrong at.
///
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    BadRead {
        device: BusAddress,
        offset: u16,
        code: ResponseCode,
    },
    BadWrite {
        device: BusAddress,
        offset: u16,
        code: ResponseCode,
    },
    BadPageSelect {
        device: BusAddress,
        page: u8,
        code: ResponseCode,
    },
    /// A write protection command, or an access to a DDR5 mode register,
    /// failed.
    BadCommand {
        device: BusAddress,
        command: u8,
        code: ResponseCode,
    },
    InvalidOffset {
        device: BusAddress,
        offset: u16,
    },
    InvalidBlock {
        device: BusAddress,
        block: u8,
    },
    /// The operation does not exist for this device's generation.
    Unsupported {
        device: BusAddress,
    },
    /// Withdrawing DDR5 protection needs the hub in offline mode.
    OfflineModeRequired {
        device: BusAddress,
    },
    /// Firmware has locked out writes to SPD addresses.
    WriteDisabled {
        device: BusAddress,
    },
    /// Nothing acknowledges the device's address.
    NoDevice {
        device: BusAddress,
    },
}

impl Error {
    /// Returns `true` if the device refused (NACKed) a write.
    pub fn is_refused_write(&self) -> bool {
        matches!(
            self,
            Error::BadWrite {
                code: ResponseCode::DeviceError,
                ..
            }
        )
    }
}

impl From<Error> for ResponseCode {
    fn from(err: Error) -> Self {
        match err {
            Error::BadRead { code, .. }
            | Error::BadWrite { code, .. }
            | Error::BadPageSelect { code, .. }
            | Error::BadCommand { code, .. } => code,
            Error::InvalidOffset { .. } => ResponseCode::InvalidOffset,
            Error::InvalidBlock { .. } => ResponseCode::BadArg,
            Error::Unsupported { .. } | Error::WriteDisabled { .. } => {
                ResponseCode::Unsupported
            }
            Error::OfflineModeRequired { .. } | Error::NoDevice { .. } => {
                ResponseCode::DeviceError
            }
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::BadRead {
                device,
                offset,
                code,
            } => write!(f, "{device}: read of {offset:#x} failed: {code}"),
            Error::BadWrite {
                device,
                offset,
                code,
            } => write!(f, "{device}: write of {offset:#x} failed: {code}"),
            Error::BadPageSelect { device, page, code } => {
                write!(f, "{device}: selecting page {page} failed: {code}")
            }
            Error::BadCommand {
                device,
                command,
                code,
            } => write!(f, "{device}: command {command:#x} failed: {code}"),
            Error::InvalidOffset { device, offset } => {
                write!(f, "{device}: offset {offset:#x} is out of range")
            }
            Error::InvalidBlock { device, block } => {
                write!(f, "{device}: no protection block {block}")
            }
            Error::Unsupported { device } => {
                write!(f, "{device}: not supported by this device")
            }
            Error::OfflineModeRequired { device } => {
                write!(f, "{device}: device is not in offline mode")
            }
            Error::WriteDisabled { device } => {
                write!(f, "{device}: SPD writes are disabled by firmware")
            }
            Error::NoDevice { device } => {
                write!(f, "{device}: no device present")
            }
        }
    }
}

impl std::error::Error for Error {}

///
/// The logical operations on one SPD EEPROM.  Implementors supply the
/// addressed byte accesses and the protection commands; the array, update,
/// verify and write-test algorithms are shared.
///
/// Offsets are logical: 0 up to [`SpdAccess::size`], with any paging handled
/// underneath.
///
pub trait SpdAccess {
    /// The device being accessed, for error context.
    fn device(&self) -> BusAddress;

    /// Total bytes of EEPROM.
    fn size(&self) -> u16;

    fn rswp_blocks(&self) -> u8;

    fn read_byte(&mut self, offset: u16) -> Result<u8, Error>;

    fn write_byte(&mut self, offset: u16, val: u8) -> Result<(), Error>;

    /// Reports whether `block` is reversibly write protected.
    fn get_rswp(&mut self, block: u8) -> Result<bool, Error>;

    fn set_rswp(&mut self, block: u8) -> Result<(), Error>;

    /// Withdraws reversible protection from every block.
    fn clear_rswp(&mut self) -> Result<(), Error>;

    /// Withdraws reversible protection from `block` alone.
    fn clear_rswp_block(&mut self, block: u8) -> Result<(), Error>;

    /// Reports whether permanent write protection has been set.
    fn get_pswp(&mut self) -> Result<bool, Error>;

    /// Sets permanent write protection.  There is no undoing this.
    fn set_pswp(&mut self) -> Result<(), Error>;

    /// Fails with `InvalidOffset` unless `len` bytes from `offset` fit.
    fn check_range(&self, offset: u16, len: usize) -> Result<(), Error> {
        if usize::from(offset) + len > usize::from(self.size()) {
            return Err(Error::InvalidOffset {
                device: self.device(),
                offset,
            });
        }

        Ok(())
    }

    fn check_block(&self, block: u8) -> Result<(), Error> {
        if block >= self.rswp_blocks() {
            return Err(Error::InvalidBlock {
                device: self.device(),
                block,
            });
        }

        Ok(())
    }

    fn read_array(&mut self, offset: u16, buf: &mut [u8]) -> Result<(), Error> {
        self.check_range(offset, buf.len())?;

        for (o, byte) in (offset..).zip(buf.iter_mut()) {
            *byte = self.read_byte(o)?;
        }

        Ok(())
    }

    fn write_array(&mut self, offset: u16, data: &[u8]) -> Result<(), Error> {
        self.check_range(offset, data.len())?;

        for (o, &byte) in (offset..).zip(data) {
            self.write_byte(o, byte)?;
        }

        Ok(())
    }

    ///
    /// Writes `val` at `offset` only if it is not there already, sparing the
    /// cell a write cycle.  Returns `true` if a write was issued.
    ///
    fn update_byte(&mut self, offset: u16, val: u8) -> Result<bool, Error> {
        if self.read_byte(offset)? == val {
            return Ok(false);
        }

        self.write_byte(offset, val)?;
        Ok(true)
    }

    /// Returns the number of bytes that actually needed writing.
    fn update_array(&mut self, offset: u16, data: &[u8]) -> Result<usize, Error> {
        self.check_range(offset, data.len())?;

        let mut written = 0;

        for (o, &byte) in (offset..).zip(data) {
            if self.update_byte(o, byte)? {
                written += 1;
            }
        }

        Ok(written)
    }

    fn verify_byte(&mut self, offset: u16, val: u8) -> Result<bool, Error> {
        Ok(self.read_byte(offset)? == val)
    }

    fn verify_array(&mut self, offset: u16, data: &[u8]) -> Result<bool, Error> {
        self.check_range(offset, data.len())?;

        for (o, &byte) in (offset..).zip(data) {
            if !self.verify_byte(o, byte)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    ///
    /// Finds out whether `offset` can be written by writing its complement
    /// and putting the original back.  A refused write and a write that
    /// silently failed to land both mean the location is protected; either
    /// way the contents are left as they were.
    ///
    fn write_test(&mut self, offset: u16) -> Result<bool, Error> {
        let original = self.read_byte(offset)?;
        let flipped = original ^ 0xff;

        match self.write_byte(offset, flipped) {
            Ok(()) => {}
            Err(e) if e.is_refused_write() => return Ok(false),
            Err(e) => return Err(e),
        }

        if self.read_byte(offset)? != flipped {
            return Ok(false);
        }

        self.write_byte(offset, original)?;
        Ok(true)
    }

    /// The reversible protection of every block.
    fn rswp_snapshot(&mut self) -> Result<WriteProtection, Error> {
        let mut snapshot = WriteProtection::new(self.rswp_blocks());

        for block in 0..self.rswp_blocks() {
            let protected = self.get_rswp(block)?;
            snapshot.set(block, protected);
        }

        Ok(snapshot)
    }
}
