// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SPD EEPROM access through a PC SMBus host controller

use drv_pc_smbus::{PageSelect, SmbusController};
use drv_smbus_types::{AccessMode, BusAddress, ResponseCode};
use ringbuf::*;

use crate::{Error, Generation, SpdAccess};

//
// EE1004 (DDR4) command addresses.  These take a quick command with no data
// phase: the address and direction are the whole command, and every SPD
// device on the segment listens to them.
//
const SWP: [u8; 4] = [0x31, 0x34, 0x35, 0x30];
const CWP: u8 = 0x33;
const SPA: [u8; 2] = [0x36, 0x37];

/// EE1002 permanent protection lives at this base plus the select pins.
const PSWP_BASE: u8 = 0x30;

// SPD5118 (DDR5) mode registers
const MR11_PAGE: u8 = 0x0b;
const MR12_RSWP_LOW: u8 = 0x0c;
const MR13_RSWP_HIGH: u8 = 0x0d;
const MR48_STATUS: u8 = 0x30;
const MR48_OFFLINE: u8 = 1 << 2;

/// Set in an SPD5118 offset to address the NVM rather than the registers.
const NVM_TAG: u8 = 0x80;
const NVM_OFFSET_MASK: u8 = 0x7f;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Attached(BusAddress, Generation),
    Page(u8),
    PageFailed(u8, ResponseCode),
    Unidentified,
    SetRswp(u8),
    ClearRswp,
    ClearRswpBlock(u8),
    RestoreFailed(u8),
    SetPswp,
    WriteDisabled,
}

ringbuf!(Trace, 32, Trace::None);

///
/// One SPD EEPROM: the target currently addressed by an [`SmbusController`].
/// Paging is transparent; the page last selected is kept in the controller
/// and a select is only put on the bus when an access needs a different one.
///
/// The cached page is trusted without reading it back.  If something else
/// on the machine moves the page, [`SpdEeprom::reset_page`] brings the cache
/// back in line.
///
/// A module whose key byte was not recognized is read as a flat 256-byte
/// EEPROM, but write protection is refused on it: the command addresses
/// mean different things to each generation.
///
pub struct SpdEeprom<'a> {
    smbus: &'a mut SmbusController,
    generation: Generation,
    identified: bool,
}

impl<'a> SpdEeprom<'a> {
    ///
    /// Attaches to the device at the controller's active address, using what
    /// the controller learned when the address was set to pick the layout.
    ///
    pub fn new(smbus: &'a mut SmbusController) -> Result<Self, Error> {
        let device = smbus.bus_address();

        if !smbus.probe_address(device.address) {
            return Err(Error::NoDevice { device });
        }

        let detected =
            Generation::detect(smbus.is_ddr5_present(), smbus.max_spd_size());
        let generation = detected.unwrap_or(Generation::Legacy);

        ringbuf_entry!(Trace::Attached(device, generation));

        if detected.is_none() {
            ringbuf_entry!(Trace::Unidentified);
        }

        Ok(Self {
            smbus,
            generation,
            identified: detected.is_some(),
        })
    }

    /// Points the controller at `address` and attaches to what is there.
    pub fn open(
        smbus: &'a mut SmbusController,
        address: u8,
    ) -> Result<Self, Error> {
        let device = BusAddress {
            bus: smbus.bus(),
            address,
        };

        smbus
            .set_address(address)
            .map_err(|_| Error::NoDevice { device })?;

        Self::new(smbus)
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Whether the module's generation was actually determined.
    pub fn is_identified(&self) -> bool {
        self.identified
    }

    /// The page the device is believed to have mapped.
    pub fn page(&self) -> Option<u8> {
        self.smbus.cached_page()
    }

    pub fn controller(&self) -> &SmbusController {
        &*self.smbus
    }

    /// Selects page 0 whether or not it is believed to be selected already.
    pub fn reset_page(&mut self) -> Result<(), Error> {
        self.select_page(0, true)
    }

    /// Reads the entire EEPROM.
    pub fn dump(&mut self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0; usize::from(self.size())];
        self.read_array(0, &mut buf)?;
        Ok(buf)
    }

    ///
    /// Reports whether a DDR5 hub is in offline mode, which it must be
    /// before any reversible protection can be withdrawn.
    ///
    pub fn get_offline_mode(&self) -> Result<bool, Error> {
        if self.generation != Generation::Ddr5 {
            return Err(Error::Unsupported {
                device: self.device(),
            });
        }

        Ok(self.read_register(MR48_STATUS)? & MR48_OFFLINE != 0)
    }

    fn select_page(&mut self, page: u8, force: bool) -> Result<(), Error> {
        if !force && self.smbus.cached_page() == Some(page) {
            return Ok(());
        }

        let how = match self.generation {
            Generation::Legacy => return Ok(()),
            Generation::Ddr4 => match SPA.get(usize::from(page)) {
                Some(&spa) => PageSelect::Command(spa),
                None => {
                    return Err(Error::BadPageSelect {
                        device: self.device(),
                        page,
                        code: ResponseCode::BadArg,
                    })
                }
            },
            Generation::Ddr5 => PageSelect::Register(MR11_PAGE),
        };

        match self.smbus.select_page(page, how) {
            Ok(()) => {
                ringbuf_entry!(Trace::Page(page));
                Ok(())
            }
            Err(code) => {
                ringbuf_entry!(Trace::PageFailed(page, code));
                Err(Error::BadPageSelect {
                    device: self.device(),
                    page,
                    code,
                })
            }
        }
    }

    ///
    /// Maps the page holding `offset` and returns where within it `offset`
    /// lives on the wire.
    ///
    fn map(&mut self, offset: u16) -> Result<u8, Error> {
        let page_size = self.generation.page_size();
        let page = (offset / page_size) as u8;
        let within = (offset % page_size) as u8;

        if self.generation.is_paged() {
            self.select_page(page, false)?;
        }

        Ok(match self.generation {
            Generation::Ddr5 => NVM_TAG | (within & NVM_OFFSET_MASK),
            _ => within,
        })
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.smbus.spd_write_disabled() {
            ringbuf_entry!(Trace::WriteDisabled);
            return Err(Error::WriteDisabled {
                device: self.device(),
            });
        }

        Ok(())
    }

    fn read_register(&self, reg: u8) -> Result<u8, Error> {
        self.smbus
            .read_byte_data(reg)
            .map_err(|code| Error::BadCommand {
                device: self.device(),
                command: reg,
                code,
            })
    }

    fn write_register(&self, reg: u8, val: u8) -> Result<(), Error> {
        self.check_writable()?;

        self.smbus
            .write_byte_data(reg, val)
            .map_err(|code| Error::BadCommand {
                device: self.device(),
                command: reg,
                code,
            })
    }

    /// Issues one of the address-only protection commands.
    fn command(&self, address: u8) -> Result<(), Error> {
        self.smbus
            .quick(address, AccessMode::Write)
            .map_err(|code| Error::BadCommand {
                device: self.device(),
                command: address,
                code,
            })
    }

    fn check_identified(&self) -> Result<(), Error> {
        if !self.identified {
            return Err(Error::Unsupported {
                device: self.device(),
            });
        }

        Ok(())
    }

    fn require_offline(&self) -> Result<(), Error> {
        if !self.get_offline_mode()? {
            return Err(Error::OfflineModeRequired {
                device: self.device(),
            });
        }

        Ok(())
    }

    /// The DDR5 bitmap register and bit for `block`.
    fn rswp_register(block: u8) -> (u8, u8) {
        let reg = if block < 8 {
            MR12_RSWP_LOW
        } else {
            MR13_RSWP_HIGH
        };

        (reg, 1 << (block % 8))
    }

    fn pswp_address(&self) -> Result<u8, Error> {
        self.check_identified()?;

        match self.generation {
            Generation::Legacy => Ok(PSWP_BASE | (self.smbus.address() & 0x7)),
            _ => Err(Error::Unsupported {
                device: self.device(),
            }),
        }
    }
}

impl SpdAccess for SpdEeprom<'_> {
    fn device(&self) -> BusAddress {
        self.smbus.bus_address()
    }

    fn size(&self) -> u16 {
        self.generation.size()
    }

    fn rswp_blocks(&self) -> u8 {
        self.generation.rswp_blocks()
    }

    fn read_byte(&mut self, offset: u16) -> Result<u8, Error> {
        self.check_range(offset, 1)?;
        let physical = self.map(offset)?;

        self.smbus
            .read_byte_data(physical)
            .map_err(|code| Error::BadRead {
                device: self.device(),
                offset,
                code,
            })
    }

    fn write_byte(&mut self, offset: u16, val: u8) -> Result<(), Error> {
        self.check_range(offset, 1)?;
        self.check_writable()?;
        let physical = self.map(offset)?;

        self.smbus
            .write_byte_data(physical, val)
            .map_err(|code| Error::BadWrite {
                device: self.device(),
                offset,
                code,
            })
    }

    ///
    /// DDR5 reports protection in its bitmap registers.  Earlier parts have
    /// no way to ask, so a block counts as protected if its first byte
    /// cannot be written.
    ///
    fn get_rswp(&mut self, block: u8) -> Result<bool, Error> {
        self.check_block(block)?;
        self.check_identified()?;

        match self.generation {
            Generation::Ddr5 => {
                let (reg, bit) = Self::rswp_register(block);
                Ok(self.read_register(reg)? & bit != 0)
            }
            generation => {
                let first = u16::from(block) * generation.block_size();
                Ok(!self.write_test(first)?)
            }
        }
    }

    fn set_rswp(&mut self, block: u8) -> Result<(), Error> {
        self.check_block(block)?;
        self.check_identified()?;
        ringbuf_entry!(Trace::SetRswp(block));

        match self.generation {
            Generation::Ddr5 => {
                let (reg, bit) = Self::rswp_register(block);
                let bits = self.read_register(reg)?;
                self.write_register(reg, bits | bit)
            }
            _ => self.command(SWP[usize::from(block)]),
        }
    }

    fn clear_rswp(&mut self) -> Result<(), Error> {
        self.check_identified()?;
        ringbuf_entry!(Trace::ClearRswp);

        match self.generation {
            Generation::Ddr5 => {
                self.require_offline()?;
                self.write_register(MR12_RSWP_LOW, 0)?;
                self.write_register(MR13_RSWP_HIGH, 0)
            }
            _ => self.command(CWP),
        }
    }

    ///
    /// DDR5 clears the one bit.  Earlier parts can only clear everything at
    /// once, so every other protected block is protected again afterwards.
    /// If that fails partway, the blocks not yet restored are left
    /// unprotected and the error names the first one that failed.
    ///
    fn clear_rswp_block(&mut self, block: u8) -> Result<(), Error> {
        self.check_block(block)?;
        self.check_identified()?;
        ringbuf_entry!(Trace::ClearRswpBlock(block));

        if self.generation == Generation::Ddr5 {
            self.require_offline()?;

            let (reg, bit) = Self::rswp_register(block);
            let bits = self.read_register(reg)?;
            return self.write_register(reg, bits & !bit);
        }

        let snapshot = self.rswp_snapshot()?;
        self.clear_rswp()?;

        for other in snapshot.protected().filter(|&b| b != block) {
            if let Err(e) = self.set_rswp(other) {
                ringbuf_entry!(Trace::RestoreFailed(other));
                return Err(e);
            }
        }

        Ok(())
    }

    ///
    /// A device with permanent protection set refuses the protection
    /// command address when read.
    ///
    fn get_pswp(&mut self) -> Result<bool, Error> {
        let address = self.pswp_address()?;

        match self.smbus.quick(address, AccessMode::Read) {
            Ok(()) => Ok(false),
            Err(ResponseCode::DeviceError) => Ok(true),
            Err(code) => Err(Error::BadCommand {
                device: self.device(),
                command: address,
                code,
            }),
        }
    }

    fn set_pswp(&mut self) -> Result<(), Error> {
        let address = self.pswp_address()?;
        ringbuf_entry!(Trace::SetPswp);
        self.command(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rswp_registers() {
        assert_eq!(SpdEeprom::rswp_register(0), (MR12_RSWP_LOW, 0x01));
        assert_eq!(SpdEeprom::rswp_register(7), (MR12_RSWP_LOW, 0x80));
        assert_eq!(SpdEeprom::rswp_register(8), (MR13_RSWP_HIGH, 0x01));
        assert_eq!(SpdEeprom::rswp_register(15), (MR13_RSWP_HIGH, 0x80));
    }
}
