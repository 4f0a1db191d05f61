// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transaction engine, and the session that hands out controllers

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use drv_pc_hw_access::{
    MachineMutex, PciAddress, PciConfigAccessor, PciLocator, RawAccess,
};
use drv_smbus_types::{
    is_eeprom_address, AccessMode, BusAddress, ResponseCode, Status,
    Transaction, SPD_ADDRESSES,
};
use ringbuf::*;

use crate::config::SmbusConfig;
use crate::platform::{
    classify, Platform, PlatformFamily, Timing, SKYLAKE_X_SMBUS,
};
use crate::vendor;

/// PCI class/subclass of an SMBus host controller
const CLASS_SERIAL_BUS: u8 = 0x0c;
const SUBCLASS_SMBUS: u8 = 0x05;

/// PCI class/subclass of the ISA bridge that identifies an Intel chipset
const CLASS_BRIDGE: u8 = 0x06;
const SUBCLASS_ISA: u8 = 0x01;

/// Offset of the memory type key byte in every generation's SPD layout
const SPD_KEY_BYTE: u8 = 2;

/// DDR5 modules carry a PMIC whose address shares the low bits of the SPD hub
const DDR5_PMIC_BASE: u8 = 0x48;

/// EE1004 command address that maps page 0 of every EEPROM on the segment
const EE1004_SPA0: u8 = 0x36;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Detected {
        vendor: u16,
        device: u16,
        family: PlatformFamily,
    },
    SpdWriteDisabled,
    Execute {
        bus: u8,
        address: u8,
        offset: u8,
    },
    Failed(ResponseCode, Status),
    LockUnavailable,
    Bus(u8),
    Address(u8),
    Probed {
        ddr5: bool,
        size: u16,
    },
    ProbeFailed(ResponseCode),
    Page(u8, Option<ResponseCode>),
}

ringbuf!(Trace, 64, Trace::None);

/// Maps an SPD memory type key byte to the size of the EEPROM behind it.
fn spd_size_for_key(key: u8) -> u16 {
    match key {
        // DDR4, DDR4E, LPDDR4, LPDDR4X
        0x0c | 0x0e | 0x10 | 0x11 => 512,
        // DDR5, LPDDR5, DDR5 NVDIMM-P, LPDDR5X
        0x12..=0x15 => 1024,
        // Everything from fast page mode DRAM through DDR3, and LPDDR3
        0x01..=0x0b | 0x0f => 256,
        _ => 0,
    }
}

///
/// How a module is told which page of its EEPROM to map.
///
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageSelect {
    /// A quick write to a command address heard by every EEPROM on the
    /// segment (EE1004 SPA0/SPA1)
    Command(u8),
    /// A write of the page number to a register of the addressed device
    /// (SPD5118 MR11)
    Register(u8),
}

///
/// The process-wide lock that admits one transaction at a time.  This is a
/// flag under a mutex rather than a bare mutex so that waiters can give up
/// after a timeout.
///
#[derive(Debug, Default)]
pub struct BusLock {
    held: Mutex<bool>,
    released: Condvar,
}

/// Proof of holding the [`BusLock`]; releases it on drop.
#[derive(Debug)]
pub struct BusLockGuard<'a> {
    lock: &'a BusLock,
}

impl BusLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(
        &self,
        timeout: Duration,
    ) -> Result<BusLockGuard<'_>, ResponseCode> {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());

        let (mut held, result) = self
            .released
            .wait_timeout_while(held, timeout, |held| *held)
            .unwrap_or_else(|e| e.into_inner());

        if result.timed_out() && *held {
            return Err(ResponseCode::LockUnavailable);
        }

        *held = true;
        Ok(BusLockGuard { lock: self })
    }
}

impl Drop for BusLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.lock.held.lock().unwrap_or_else(|e| e.into_inner());
        *held = false;
        self.lock.released.notify_one();
    }
}

///
/// Everything shared by the controllers of one process: the hardware access
/// provider, the lock serializing transactions, the machine-wide I/O mutex,
/// and configuration.
///
pub struct SmbusSession {
    raw: Arc<dyn RawAccess>,
    lock: Arc<BusLock>,
    machine_mutex: Option<Arc<MachineMutex>>,
    config: SmbusConfig,
}

impl SmbusSession {
    pub fn new(
        raw: Arc<dyn RawAccess>,
        config: SmbusConfig,
    ) -> Result<Self, ResponseCode> {
        let machine_mutex = if config.cross_process_lock {
            Some(Arc::new(MachineMutex::open(&config.isa_mutex_name)?))
        } else {
            None
        };

        Ok(Self {
            raw,
            lock: Arc::new(BusLock::new()),
            machine_mutex,
            config,
        })
    }

    pub fn config(&self) -> &SmbusConfig {
        &self.config
    }

    /// The lock that every controller from this session shares.
    pub fn bus_lock(&self) -> &Arc<BusLock> {
        &self.lock
    }

    ///
    /// Finds the SMBus host on this machine and builds a controller for it.
    /// The CPU-integrated controller takes precedence over a chipset one.
    ///
    pub fn open(
        &self,
        locator: &dyn PciLocator,
    ) -> Result<SmbusController, ResponseCode> {
        if let Some(dev) = locator.find_by_id(vendor::INTEL, SKYLAKE_X_SMBUS, 0)
        {
            return self.controller_for(dev, None);
        }

        let dev = locator
            .find_by_class(CLASS_SERIAL_BUS, SUBCLASS_SMBUS, None, 0)
            .ok_or(ResponseCode::NoController)?;
        let isa_bridge = locator.find_by_class(CLASS_BRIDGE, SUBCLASS_ISA, None, 0);

        self.controller_for(dev, isa_bridge)
    }

    ///
    /// Builds a controller for the SMBus host at `smbus`.  On Intel
    /// chipsets, `isa_bridge` (if known) is read to identify the chipset.
    ///
    pub fn controller_for(
        &self,
        smbus: PciAddress,
        isa_bridge: Option<PciAddress>,
    ) -> Result<SmbusController, ResponseCode> {
        let pci = PciConfigAccessor::new(self.raw.clone(), smbus);
        let (vendor_id, device_id) = pci.ids()?;
        let family = classify(vendor_id, device_id);

        ringbuf_entry!(Trace::Detected {
            vendor: vendor_id,
            device: device_id,
            family
        });

        if family == PlatformFamily::Unknown {
            return Err(ResponseCode::NoController);
        }

        let chipset_id = match (vendor_id, isa_bridge) {
            (vendor::INTEL, Some(bridge)) => {
                PciConfigAccessor::new(self.raw.clone(), bridge)
                    .ids()
                    .ok()
                    .map(|(_, device)| device)
            }
            _ => None,
        };

        let platform = Platform::new(
            vendor_id,
            device_id,
            pci,
            &self.raw,
            self.machine_mutex.clone(),
            self.config.lock_timeout(),
        )?;

        let spd_write_disabled = platform.spd_write_disabled()?;

        if spd_write_disabled {
            ringbuf_entry!(Trace::SpdWriteDisabled);
        }

        Ok(SmbusController {
            platform,
            lock: self.lock.clone(),
            timing: self.config.timing(),
            lock_timeout: self.config.lock_timeout(),
            candidate_buses: self.config.candidate_buses.clone(),
            vendor_id,
            device_id,
            chipset_id,
            bus: 0,
            address: *SPD_ADDRESSES.start(),
            ddr5: false,
            max_spd_size: 0,
            spd_write_disabled,
            cached_page: None,
        })
    }
}

///
/// One logical SMBus: a host controller, the bus selected on it, and the
/// target currently being addressed.  What we have learned about that target
/// (whether it is a DDR5 SPD hub, how large its EEPROM is, which page it has
/// mapped) is forgotten and re-learned whenever the bus or address changes.
///
pub struct SmbusController {
    platform: Platform,
    lock: Arc<BusLock>,
    timing: Timing,
    lock_timeout: Duration,
    candidate_buses: Vec<u8>,

    vendor_id: u16,
    device_id: u16,
    chipset_id: Option<u16>,

    bus: u8,
    address: u8,
    ddr5: bool,
    max_spd_size: u16,
    spd_write_disabled: bool,
    cached_page: Option<u8>,
}

impl SmbusController {
    ///
    /// Executes a single transaction, holding the process-wide bus lock for
    /// its duration.  On return `txn.status` is terminal.  There are no
    /// retries here; callers decide whether a failure is worth another go.
    ///
    pub fn execute(&self, txn: &mut Transaction) -> Result<(), ResponseCode> {
        if !self.platform.supports_bus(txn.bus) {
            txn.status = Status::Aborted;
            return Err(ResponseCode::Unsupported);
        }

        let _guard = match self.lock.acquire(self.lock_timeout) {
            Ok(guard) => guard,
            Err(code) => {
                ringbuf_entry!(Trace::LockUnavailable);
                txn.status = Status::Aborted;
                return Err(code);
            }
        };

        ringbuf_entry!(Trace::Execute {
            bus: txn.bus,
            address: txn.address,
            offset: txn.offset,
        });

        let rval = self.platform.execute(txn, &self.timing);

        if let Err(code) = rval {
            ringbuf_entry!(Trace::Failed(code, txn.status));
        }

        rval
    }

    fn run(&self, mut txn: Transaction) -> Result<Transaction, ResponseCode> {
        self.execute(&mut txn)?;
        Ok(txn)
    }

    /// Reads the byte at `offset` from the active target.
    pub fn read_byte_data(&self, offset: u8) -> Result<u8, ResponseCode> {
        let txn = Transaction::read_byte_data(self.bus, self.address, offset);
        Ok(self.run(txn)?.output_byte())
    }

    pub fn write_byte_data(&self, offset: u8, val: u8) -> Result<(), ResponseCode> {
        let txn =
            Transaction::write_byte_data(self.bus, self.address, offset, val);
        self.run(txn).map(|_| ())
    }

    /// Reads the little-endian word at `offset` from the active target.
    pub fn read_word_data(&self, offset: u8) -> Result<u16, ResponseCode> {
        let txn = Transaction::read_word_data(self.bus, self.address, offset);
        Ok(self.run(txn)?.output)
    }

    pub fn receive_byte(&self) -> Result<u8, ResponseCode> {
        let txn = Transaction::receive_byte(self.bus, self.address);
        Ok(self.run(txn)?.output_byte())
    }

    ///
    /// Issues a quick command to `address` on the active bus.  SPD command
    /// addresses carry their whole meaning in the address and direction, so
    /// this is how write protection and page selection are driven.
    ///
    pub fn quick(&self, address: u8, access: AccessMode) -> Result<(), ResponseCode> {
        if address > 0x7f {
            return Err(ResponseCode::BadArg);
        }

        self.run(Transaction::quick(self.bus, address, access)).map(|_| ())
    }

    /// Returns `true` if anything acknowledges `address` on the active bus.
    pub fn probe_address(&self, address: u8) -> bool {
        self.quick(address, AccessMode::Read).is_ok()
    }

    ///
    /// Probes every SPD address on the active bus, returning those that
    /// answered.  With `minimal`, stops at the first one.
    ///
    pub fn scan(&self, minimal: bool) -> Vec<u8> {
        let mut found = vec![];

        for address in SPD_ADDRESSES {
            if self.probe_address(address) {
                found.push(address);

                if minimal {
                    break;
                }
            }
        }

        found
    }

    ///
    /// Returns every candidate bus with at least one SPD EEPROM on it.  The
    /// active bus is left as it was found.
    ///
    pub fn find_bus(&mut self) -> Vec<u8> {
        let original = self.bus;
        let candidates = self.candidate_buses.clone();
        let mut found = vec![];

        for bus in candidates {
            if !self.platform.supports_bus(bus) {
                continue;
            }

            self.bus = bus;

            if !self.scan(true).is_empty() {
                found.push(bus);
            }
        }

        self.bus = original;
        found
    }

    ///
    /// Selects the bus on which subsequent transactions take place.  If the
    /// module at the active address cannot be probed, the bus stays selected
    /// but nothing is known about the module.
    ///
    pub fn set_bus(&mut self, bus: u8) -> Result<(), ResponseCode> {
        if !self.platform.supports_bus(bus) {
            return Err(ResponseCode::Unsupported);
        }

        ringbuf_entry!(Trace::Bus(bus));
        self.bus = bus;
        self.probe_module()
    }

    /// Selects the target of subsequent transactions.
    pub fn set_address(&mut self, address: u8) -> Result<(), ResponseCode> {
        let target = BusAddress::new(self.bus, address)?;

        ringbuf_entry!(Trace::Address(target.address));
        self.address = target.address;
        self.probe_module()
    }

    ///
    /// Re-learns what sits at the active address.  DDR5 is recognized by
    /// the PMIC that accompanies every SPD hub; anything else is sized by its
    /// key byte, read with any EE1004 on the segment back on page 0.
    ///
    /// A NACK only means there is nothing (or nothing we recognize) there.
    /// Any other failure is returned, with the module left unidentified.
    ///
    fn probe_module(&mut self) -> Result<(), ResponseCode> {
        self.cached_page = None;
        self.ddr5 = false;
        self.max_spd_size = 0;

        if is_eeprom_address(self.address) {
            let rval = self.identify();

            if let Err(code) = rval {
                ringbuf_entry!(Trace::ProbeFailed(code));
                self.cached_page = None;
                self.ddr5 = false;
                self.max_spd_size = 0;
                return rval;
            }
        }

        ringbuf_entry!(Trace::Probed {
            ddr5: self.ddr5,
            size: self.max_spd_size
        });

        Ok(())
    }

    fn identify(&mut self) -> Result<(), ResponseCode> {
        if self.answers(DDR5_PMIC_BASE | (self.address & 0x7))? {
            self.ddr5 = true;
            self.max_spd_size = 1024;
            return Ok(());
        }

        let page0 = self.rewind_ee1004()?;

        self.max_spd_size = match self.read_byte_data(SPD_KEY_BYTE) {
            Ok(key) => spd_size_for_key(key),
            Err(ResponseCode::DeviceError) => 0,
            Err(code) => return Err(code),
        };

        self.cached_page = (page0 && self.max_spd_size == 512).then_some(0);
        Ok(())
    }

    /// Like [`Self::probe_address`], but only a NACK counts as absence.
    fn answers(&self, address: u8) -> Result<bool, ResponseCode> {
        match self.quick(address, AccessMode::Read) {
            Ok(()) => Ok(true),
            Err(ResponseCode::DeviceError) => Ok(false),
            Err(code) => Err(code),
        }
    }

    ///
    /// Puts any EE1004 on the segment back on page 0, returning whether page
    /// 0 is known to be mapped.  An EE1004 ACKs a read of SPA0 only on page
    /// 0.  SPA0 is written only when that read is refused: on an EE1002 at
    /// HID 6 the same address sets permanent protection.
    ///
    fn rewind_ee1004(&mut self) -> Result<bool, ResponseCode> {
        if self.answers(EE1004_SPA0)? {
            return Ok(true);
        }

        match self.select_page(0, PageSelect::Command(EE1004_SPA0)) {
            Ok(()) => Ok(true),
            Err(ResponseCode::DeviceError) => Ok(false),
            Err(code) => Err(code),
        }
    }

    ///
    /// Tells the active target to map `page`, and records the outcome: the
    /// page on success, and nothing known on failure.  This is the only way
    /// the cached page changes other than by readdressing.
    ///
    pub fn select_page(
        &mut self,
        page: u8,
        how: PageSelect,
    ) -> Result<(), ResponseCode> {
        let rval = match how {
            PageSelect::Command(address) => {
                self.quick(address, AccessMode::Write)
            }
            PageSelect::Register(reg) => self.write_byte_data(reg, page),
        };

        ringbuf_entry!(Trace::Page(page, rval.err()));
        self.cached_page = rval.ok().map(|()| page);
        rval
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn bus_address(&self) -> BusAddress {
        BusAddress {
            bus: self.bus,
            address: self.address,
        }
    }

    pub fn is_ddr5_present(&self) -> bool {
        self.ddr5
    }

    /// Size of the active target's SPD EEPROM in bytes, or 0 if unknown.
    pub fn max_spd_size(&self) -> u16 {
        self.max_spd_size
    }

    pub fn spd_write_disabled(&self) -> bool {
        self.spd_write_disabled
    }

    /// The page last selected on the active target, if any has been since
    /// it was addressed.
    pub fn cached_page(&self) -> Option<u8> {
        self.cached_page
    }

    pub fn platform_family(&self) -> PlatformFamily {
        self.platform.family()
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    /// Device id of the ISA bridge on Intel chipsets.
    pub fn chipset_id(&self) -> Option<u16> {
        self.chipset_id
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }
}
