// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated SPD devices on one SMBus segment

use std::collections::BTreeMap;

use drv_smbus_types::{is_eeprom_address, AccessMode, CommandKind};

/// The memory generation a simulated module belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpdKind {
    /// An EE1002-style EEPROM: 256 bytes, one protectable half, PSWP
    Ddr3,
    /// An EE1004: 512 bytes in two pages, four protectable quarters
    Ddr4,
    /// An SPD5118 hub: 1 KiB in eight pages, sixteen protectable blocks
    Ddr5,
}

impl SpdKind {
    pub fn size(self) -> usize {
        match self {
            Self::Ddr3 => 256,
            Self::Ddr4 => 512,
            Self::Ddr5 => 1024,
        }
    }

    fn key_bytes(self) -> [u8; 3] {
        match self {
            Self::Ddr3 => [0x92, 0x13, 0x0b],
            Self::Ddr4 => [0x23, 0x11, 0x0c],
            Self::Ddr5 => [0x30, 0x10, 0x12],
        }
    }
}

// DDR4 (EE1004) command addresses
const SWP0: u8 = 0x31;
const SWP1: u8 = 0x34;
const SWP2: u8 = 0x35;
const SWP3: u8 = 0x30;
const CWP: u8 = 0x33;
const SPA0: u8 = 0x36;
const SPA1: u8 = 0x37;

// SPD5118 registers
const MR0: u8 = 0x00;
const MR1: u8 = 0x01;
const MR11: u8 = 0x0b;
const MR12: u8 = 0x0c;
const MR13: u8 = 0x0d;
const MR48: u8 = 0x30;
const MR48_OFFLINE: u8 = 1 << 2;
const NVM_TAG: u8 = 0x80;

const PMIC_BASE: u8 = 0x48;

/// One addressed operation, as decoded from a host's registers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub address: u8,
    pub access: AccessMode,
    pub command: CommandKind,
    pub offset: u8,
    pub input: u16,
}

impl Request {
    fn is_write(&self) -> bool {
        self.access == AccessMode::Write
    }
}

/// What a request amounts to, for accounting.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Effect {
    PageSelect,
    NvmRead,
    NvmWrite,
    Other,
}

pub(crate) struct SpdDevice {
    pub(crate) kind: SpdKind,
    pub(crate) nvm: Vec<u8>,
    pub(crate) rswp: u16,
    pub(crate) pswp: bool,
    pub(crate) page: u8,
    pub(crate) offline: bool,
    registers: [u8; 128],
    pointer: u8,
}

impl SpdDevice {
    pub(crate) fn new(kind: SpdKind) -> Self {
        let mut nvm: Vec<u8> = (0..kind.size())
            .map(|i| (i as u8).wrapping_mul(7) ^ 0xa5)
            .collect();
        nvm[..3].copy_from_slice(&kind.key_bytes());

        let mut registers = [0u8; 128];
        registers[usize::from(MR0)] = 0x51;
        registers[usize::from(MR1)] = 0x18;

        Self {
            kind,
            nvm,
            rswp: 0,
            pswp: false,
            page: 0,
            offline: false,
            registers,
            pointer: 0,
        }
    }

    fn page_size(&self) -> usize {
        match self.kind {
            SpdKind::Ddr3 => 256,
            SpdKind::Ddr4 => 256,
            SpdKind::Ddr5 => 128,
        }
    }

    fn block_size(&self) -> usize {
        match self.kind {
            SpdKind::Ddr3 | SpdKind::Ddr4 => 128,
            SpdKind::Ddr5 => 64,
        }
    }

    fn physical(&self, offset: u8) -> usize {
        let page = usize::from(self.page) * self.page_size();

        match self.kind {
            SpdKind::Ddr5 => page + usize::from(offset & !NVM_TAG),
            _ => page + usize::from(offset),
        }
    }

    fn protected(&self, physical: usize) -> bool {
        let block = physical / self.block_size();

        match self.kind {
            SpdKind::Ddr3 => block == 0 && (self.rswp != 0 || self.pswp),
            _ => self.rswp & (1 << block) != 0,
        }
    }

    fn read(&mut self, offset: u8) -> u8 {
        self.pointer = offset.wrapping_add(1);

        if self.kind == SpdKind::Ddr5 && offset & NVM_TAG == 0 {
            return match offset {
                MR11 => self.page,
                MR12 => self.rswp as u8,
                MR13 => (self.rswp >> 8) as u8,
                MR48 if self.offline => MR48_OFFLINE,
                MR48 => 0,
                _ => self.registers[usize::from(offset)],
            };
        }

        let physical = self.physical(offset);
        self.nvm[physical]
    }

    /// Returns `false` if the device NACKs the write.
    fn write(&mut self, offset: u8, val: u8) -> bool {
        self.pointer = offset.wrapping_add(1);

        if self.kind == SpdKind::Ddr5 && offset & NVM_TAG == 0 {
            match offset {
                MR0 | MR1 | MR48 => {}
                MR11 => self.page = val & 0x7,
                MR12 | MR13 => {
                    let shift = if offset == MR12 { 0 } else { 8 };
                    let old = (self.rswp >> shift) as u8;

                    // Protection can only be withdrawn in offline mode
                    let new = if self.offline { val } else { old | val };

                    self.rswp = (self.rswp & !(0xff << shift))
                        | (u16::from(new) << shift);
                }
                _ => self.registers[usize::from(offset)] = val,
            }

            return true;
        }

        let physical = self.physical(offset);

        if self.protected(physical) {
            // The SPD5118 accepts the write and quietly drops it; the older
            // parts refuse it outright.
            return self.kind == SpdKind::Ddr5;
        }

        self.nvm[physical] = val;
        true
    }

    fn addressed(&mut self, req: &Request) -> Option<u16> {
        match (req.command, req.access) {
            (CommandKind::Quick, _) => Some(0),
            (CommandKind::Byte, AccessMode::Read) => {
                let offset = self.pointer;
                Some(self.read(offset).into())
            }
            (CommandKind::Byte, AccessMode::Write) => {
                self.pointer = req.offset;
                Some(0)
            }
            (CommandKind::ByteData, AccessMode::Read) => {
                Some(self.read(req.offset).into())
            }
            (CommandKind::ByteData, AccessMode::Write) => {
                self.write(req.offset, req.input as u8).then_some(0)
            }
            (CommandKind::WordData, AccessMode::Read) => {
                let lo = self.read(req.offset);
                let hi = self.read(req.offset.wrapping_add(1));
                Some(u16::from_le_bytes([lo, hi]))
            }
            (CommandKind::WordData, AccessMode::Write) => {
                let [lo, hi] = req.input.to_le_bytes();
                let ok = self.write(req.offset, lo)
                    && self.write(req.offset.wrapping_add(1), hi);
                ok.then_some(0)
            }
        }
    }

    ///
    /// Responds to a quick command at one of the shared command addresses.
    /// Returns `None` if this device does not answer there at all, and
    /// otherwise whether it ACKs.
    ///
    fn command(&mut self, hid: u8, req: &Request) -> Option<bool> {
        let address = req.address;

        match self.kind {
            SpdKind::Ddr4 => {
                let block = match address {
                    SWP0 => Some(0),
                    SWP1 => Some(1),
                    SWP2 => Some(2),
                    SWP3 => Some(3),
                    _ => None,
                };

                if req.command != CommandKind::Quick {
                    return None;
                }

                if !req.is_write() {
                    // Reads report state: protection status by NACK, and
                    // page 1 by NACK at SPA0.
                    return Some(match (block, address) {
                        (Some(b), _) => self.rswp & (1 << b) == 0,
                        (None, SPA0) => self.page == 0,
                        _ => true,
                    });
                }

                match (block, address) {
                    (Some(b), _) => self.rswp |= 1 << b,
                    (None, CWP) => self.rswp = 0,
                    (None, SPA0) => self.page = 0,
                    (None, SPA1) => self.page = 1,
                    _ => return None,
                }

                Some(true)
            }
            SpdKind::Ddr3 => {
                let pswp_address = 0x30 | hid;

                if req.command != CommandKind::Quick {
                    return None;
                }

                // SWP and CWP shadow the PSWP addresses of modules 1 and 3
                match address {
                    SWP0 | CWP if !req.is_write() => Some(true),
                    SWP0 | CWP if self.pswp => Some(false),
                    SWP0 => {
                        self.rswp = 1;
                        Some(true)
                    }
                    CWP => {
                        self.rswp = 0;
                        Some(true)
                    }
                    a if a == pswp_address => {
                        if req.is_write() {
                            self.pswp = true;
                            Some(true)
                        } else {
                            Some(!self.pswp)
                        }
                    }
                    _ => None,
                }
            }
            SpdKind::Ddr5 => None,
        }
    }
}

///
/// The SPD devices on one segment, keyed by EEPROM address.
///
#[derive(Default)]
pub(crate) struct SimBus {
    pub(crate) devices: BTreeMap<u8, SpdDevice>,
}

impl SimBus {
    pub(crate) fn classify(&self, req: &Request) -> Effect {
        if (0x30..=0x37).contains(&req.address) {
            let ddr4 = self.devices.values().any(|d| d.kind == SpdKind::Ddr4);

            return match req.address {
                SPA0 | SPA1 if ddr4 && req.is_write() => Effect::PageSelect,
                _ => Effect::Other,
            };
        }

        let Some(dev) = self.devices.get(&req.address) else {
            return Effect::Other;
        };

        let data = matches!(req.command, CommandKind::ByteData | CommandKind::WordData);

        if !data {
            return Effect::Other;
        }

        match (dev.kind, req.is_write()) {
            (SpdKind::Ddr5, true) if req.offset == MR11 => Effect::PageSelect,
            (SpdKind::Ddr5, _) if req.offset & NVM_TAG == 0 => Effect::Other,
            (_, true) => Effect::NvmWrite,
            (_, false) => Effect::NvmRead,
        }
    }

    /// Runs a request against the segment; `Err` is a NACK.
    pub(crate) fn transact(&mut self, req: &Request) -> Result<u16, ()> {
        if (0x30..=0x37).contains(&req.address) {
            let mut acked = false;
            let mut answered = false;

            for (&address, dev) in self.devices.iter_mut() {
                if let Some(ack) = dev.command(address & 0x7, req) {
                    answered = true;
                    acked |= ack;
                }
            }

            return if answered && acked { Ok(0) } else { Err(()) };
        }

        if req.address & !0x7 == PMIC_BASE {
            let hub = 0x50 | (req.address & 0x7);

            return match self.devices.get(&hub) {
                Some(dev) if dev.kind == SpdKind::Ddr5 => Ok(0),
                _ => Err(()),
            };
        }

        if !is_eeprom_address(req.address) {
            return Err(());
        }

        match self.devices.get_mut(&req.address) {
            Some(dev) => dev.addressed(req).ok_or(()),
            None => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(address: u8, access: AccessMode) -> Request {
        Request {
            address,
            access,
            command: CommandKind::Quick,
            offset: 0,
            input: 0,
        }
    }

    fn byte_data(address: u8, access: AccessMode, offset: u8, input: u8) -> Request {
        Request {
            address,
            access,
            command: CommandKind::ByteData,
            offset,
            input: input.into(),
        }
    }

    #[test]
    fn ddr4_pages_and_protection() {
        let mut bus = SimBus::default();
        bus.devices.insert(0x50, SpdDevice::new(SpdKind::Ddr4));

        assert_eq!(bus.transact(&quick(SPA1, AccessMode::Write)), Ok(0));
        assert_eq!(bus.devices[&0x50].page, 1);
        assert_eq!(bus.transact(&quick(SPA0, AccessMode::Read)), Err(()));

        assert_eq!(bus.transact(&quick(SWP3, AccessMode::Write)), Ok(0));
        let write = byte_data(0x50, AccessMode::Write, 0x90, 0x12);
        assert_eq!(bus.transact(&write), Err(()));

        assert_eq!(bus.transact(&quick(CWP, AccessMode::Write)), Ok(0));
        assert_eq!(bus.transact(&write), Ok(0));
        assert_eq!(bus.devices[&0x50].nvm[0x190], 0x12);
    }

    #[test]
    fn ddr5_drops_protected_writes() {
        let mut bus = SimBus::default();
        bus.devices.insert(0x51, SpdDevice::new(SpdKind::Ddr5));

        assert_eq!(bus.transact(&quick(0x49, AccessMode::Read)), Ok(0));
        assert_eq!(bus.transact(&quick(0x48, AccessMode::Read)), Err(()));

        let protect = byte_data(0x51, AccessMode::Write, MR12, 0x01);
        assert_eq!(bus.transact(&protect), Ok(0));

        let before = bus.devices[&0x51].nvm[0];
        let write = byte_data(0x51, AccessMode::Write, NVM_TAG, !before);
        assert_eq!(bus.transact(&write), Ok(0));
        assert_eq!(bus.devices[&0x51].nvm[0], before);

        // Not offline: clearing is ignored
        let clear = byte_data(0x51, AccessMode::Write, MR12, 0x00);
        assert_eq!(bus.transact(&clear), Ok(0));
        assert_eq!(bus.devices[&0x51].rswp, 0x0001);

        bus.devices.get_mut(&0x51).unwrap().offline = true;
        assert_eq!(bus.transact(&clear), Ok(0));
        assert_eq!(bus.devices[&0x51].rswp, 0x0000);
    }

    #[test]
    fn ddr3_pswp_is_permanent() {
        let mut bus = SimBus::default();
        bus.devices.insert(0x52, SpdDevice::new(SpdKind::Ddr3));

        assert_eq!(bus.transact(&quick(0x32, AccessMode::Read)), Ok(0));
        assert_eq!(bus.transact(&quick(0x32, AccessMode::Write)), Ok(0));
        assert_eq!(bus.transact(&quick(0x32, AccessMode::Read)), Err(()));
        assert_eq!(bus.transact(&quick(CWP, AccessMode::Write)), Err(()));

        let low = byte_data(0x52, AccessMode::Write, 0x10, 0);
        let high = byte_data(0x52, AccessMode::Write, 0x90, 0);
        assert_eq!(bus.transact(&low), Err(()));
        assert_eq!(bus.transact(&high), Ok(0));
    }

    #[test]
    fn accounting_classification() {
        let mut bus = SimBus::default();
        bus.devices.insert(0x50, SpdDevice::new(SpdKind::Ddr5));
        bus.devices.insert(0x51, SpdDevice::new(SpdKind::Ddr4));

        let select = byte_data(0x50, AccessMode::Write, MR11, 1);
        assert_eq!(bus.classify(&select), Effect::PageSelect);
        assert_eq!(
            bus.classify(&quick(SPA1, AccessMode::Write)),
            Effect::PageSelect
        );
        assert_eq!(
            bus.classify(&byte_data(0x50, AccessMode::Read, 0x85, 0)),
            Effect::NvmRead
        );
        assert_eq!(
            bus.classify(&byte_data(0x50, AccessMode::Read, MR48, 0)),
            Effect::Other
        );
        assert_eq!(
            bus.classify(&byte_data(0x51, AccessMode::Write, 0x05, 0)),
            Effect::NvmWrite
        );
    }
}
