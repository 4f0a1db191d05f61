// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated PC chipset for exercising SMBus drivers without hardware
//!
//! [`MockSmbus`] implements both [`RawAccess`] and [`PciLocator`], presenting
//! the registers of one of the supported host controllers (PIIX-style Intel
//! or AMD, Nvidia MCP, or the Skylake-X CPU SMBus) and, behind them, any
//! number of simulated DDR3, DDR4 and DDR5 SPD devices.  Every transaction
//! that reaches the bus is logged and counted, and the simulation tracks how
//! many transactions have been started but not yet reaped by the driver so
//! that overlapping transactions can be detected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use drv_pc_hw_access::{PciAddress, PciLocator, RawAccess};
use drv_smbus_types::{is_eeprom_address, AccessMode, CommandKind};

mod bus;

pub use bus::{Request, SpdKind};

use bus::{Effect, SimBus, SpdDevice};

/// Where the chipset SMBus function lives
pub const PCH_SMBUS: PciAddress = PciAddress {
    bus: 0,
    device: 0x1f,
    function: 4,
};

/// Where the chipset ISA bridge lives
pub const PCH_ISA_BRIDGE: PciAddress = PciAddress {
    bus: 0,
    device: 0x1f,
    function: 0,
};

/// Where the CPU-integrated SMBus lives on a Skylake-X machine
pub const CPU_SMBUS: PciAddress = PciAddress {
    bus: 0x16,
    device: 0x1e,
    function: 5,
};

/// Device id reported by the simulated Intel ISA bridge
pub const INTEL_ISA_BRIDGE_ID: u16 = 0x7a84;

pub const INTEL_SMBUS_BASE: u16 = 0xefa0;
pub const AMD_SMBUS_BASE: u16 = 0x0e00;
pub const NVIDIA_SMBUS_BASE: u16 = 0x1c00;

const AMD_PM_INDEX: u16 = 0xcd6;
const AMD_PM_DATA: u16 = 0xcd7;
const AMD_BUS_STRIDE: u16 = 0x20;

/// The host controller being simulated.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MockChipset {
    /// An Intel ICH/PCH with the given SMBus device id
    Intel { device_id: u16 },
    /// An AMD FCH
    Amd,
    /// An nForce/MCP
    Nvidia,
    /// A Skylake-X CPU, with a Lewisburg PCH alongside it
    SkylakeX,
}

/// Counters of what has reached the simulated bus.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// Every transaction started
    pub transactions: usize,
    pub quick: usize,
    pub nvm_reads: usize,
    /// Attempted writes to EEPROM contents, whether or not they were ACKed
    pub nvm_writes: usize,
    /// DDR4 SPA commands and DDR5 MR11 writes
    pub page_selects: usize,
    /// KILL commands written to a PIIX host
    pub kills: usize,
    /// The most transactions ever started and not yet reaped
    pub max_in_flight: usize,
}

/// A transaction as seen on the bus.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LoggedTransaction {
    pub bus: u8,
    pub address: u8,
    pub offset: u8,
    pub access: AccessMode,
    pub command: CommandKind,
    pub input: u16,
}

///
/// Completion bookkeeping shared by every host layout: a started transaction
/// reports busy for a configurable number of status reads, then its result.
///
#[derive(Default)]
struct Engine {
    in_flight: Option<InFlight>,
    unreaped: bool,
}

struct InFlight {
    polls_left: u32,
    stuck: bool,
    req: Request,
    result: Result<u16, ()>,
}

enum Poll {
    Busy,
    Idle,
    Done(Request, Result<u16, ()>),
}

// PIIX register offsets and bits
const HST_STS: u16 = 0x00;
const HST_CNT: u16 = 0x02;
const HST_CMD: u16 = 0x03;
const XMIT_SLVA: u16 = 0x04;
const HST_D0: u16 = 0x05;
const HST_D1: u16 = 0x06;
const STS_HOST_BUSY: u8 = 0x01;
const STS_INTR: u8 = 0x02;
const STS_DEV_ERR: u8 = 0x04;
const STS_FAILED: u8 = 0x10;
const STS_CLEARABLE: u8 = 0x1e;
const CNT_KILL: u8 = 0x02;
const CNT_START: u8 = 0x40;

#[derive(Default)]
struct PiixRegs {
    sts: u8,
    cnt: u8,
    cmd: u8,
    slva: u8,
    d0: u8,
    d1: u8,
    engine: Engine,
}

// Nvidia register offsets and bits
const NV_PRTCL: u16 = 0x00;
const NV_STS: u16 = 0x01;
const NV_ADDR: u16 = 0x02;
const NV_CMD: u16 = 0x03;
const NV_DATA0: u16 = 0x04;
const NV_DATA1: u16 = 0x05;
const NV_STS_DONE: u8 = 0x80;
const NV_STS_NACK: u8 = 0x10;
const NV_STS_INVALID: u8 = 0x1f;

#[derive(Default)]
struct NvidiaRegs {
    prtcl: u8,
    sts: u8,
    addr: u8,
    cmd: u8,
    data0: u8,
    data1: u8,
    engine: Engine,
}

// Skylake-X config registers and bits
const SKX_CMD: u16 = 0x9c;
const SKX_STAT: u16 = 0xa8;
const SKX_DATA: u16 = 0xb4;
const SKX_CMD_TRIGGER: u32 = 1 << 19;
const SKX_CMD_SPD_WD: u32 = 1 << 30;
const SKX_STAT_BUSY: u32 = 1 << 0;
const SKX_STAT_BUS_ERROR: u32 = 1 << 1;
const SKX_STAT_READ_VALID: u32 = 1 << 2;
const SKX_STAT_WRITE_DONE: u32 = 1 << 3;

#[derive(Default)]
struct SkxRegs {
    cmd: u32,
    stat: u32,
    data: u32,
    engine: Engine,
}

struct PciFunction {
    address: PciAddress,
    vendor: u16,
    device: u16,
    class: u8,
    subclass: u8,
}

struct State {
    chipset: MockChipset,
    functions: Vec<PciFunction>,
    config: HashMap<(PciAddress, u16), u32>,
    buses: [SimBus; 2],
    piix: [PiixRegs; 2],
    nvidia: NvidiaRegs,
    skx: [SkxRegs; 2],
    pm_index: u8,
    pm: [u8; 256],

    busy_polls: u32,
    stuck_busy: bool,
    spd_write_disabled: bool,

    pending: usize,
    stats: Stats,
    log: Vec<LoggedTransaction>,
}

///
/// The simulated machine.  Cheap to share: every method takes `&self`.
///
pub struct MockSmbus {
    state: Mutex<State>,
}

impl MockSmbus {
    pub fn new(chipset: MockChipset) -> Arc<Self> {
        let mut functions = vec![];
        let mut config = HashMap::new();
        let mut pm = [0u8; 256];

        let mut add = |address, vendor: u16, device: u16, class, subclass| {
            functions.push(PciFunction {
                address,
                vendor,
                device,
                class,
                subclass,
            });
            config.insert(
                (address, 0x00),
                u32::from(vendor) | u32::from(device) << 16,
            );
            config.insert(
                (address, 0x08),
                u32::from(class) << 24 | u32::from(subclass) << 16,
            );
        };

        match chipset {
            MockChipset::Intel { device_id } => {
                add(PCH_ISA_BRIDGE, 0x8086, INTEL_ISA_BRIDGE_ID, 0x06, 0x01);
                add(PCH_SMBUS, 0x8086, device_id, 0x0c, 0x05);
            }
            MockChipset::Amd => {
                add(PCH_SMBUS, 0x1022, 0x790b, 0x0c, 0x05);
                pm[0x00] = 1 << 4;
                pm[0x01] = (AMD_SMBUS_BASE >> 8) as u8;
            }
            MockChipset::Nvidia => {
                add(PCH_SMBUS, 0x10de, 0x0aa2, 0x0c, 0x05);
            }
            MockChipset::SkylakeX => {
                add(PCH_ISA_BRIDGE, 0x8086, 0xa1c3, 0x06, 0x01);
                add(PCH_SMBUS, 0x8086, 0xa1a3, 0x0c, 0x05);
                add(CPU_SMBUS, 0x8086, 0x2085, 0x08, 0x80);
            }
        }

        match chipset {
            MockChipset::Intel { .. } => {
                config.insert((PCH_SMBUS, 0x20), u32::from(INTEL_SMBUS_BASE) | 1);
            }
            MockChipset::Nvidia => {
                config.insert((PCH_SMBUS, 0x20), u32::from(NVIDIA_SMBUS_BASE) | 1);
            }
            _ => {}
        }

        Arc::new(Self {
            state: Mutex::new(State {
                chipset,
                functions,
                config,
                buses: Default::default(),
                piix: Default::default(),
                nvidia: Default::default(),
                skx: Default::default(),
                pm_index: 0,
                pm,
                busy_polls: 0,
                stuck_busy: false,
                spd_write_disabled: false,
                pending: 0,
                stats: Stats::default(),
                log: vec![],
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add(&self, bus: u8, address: u8, kind: SpdKind) {
        assert!(is_eeprom_address(address), "{address:#x} is not an SPD address");
        self.state().buses[usize::from(bus)]
            .devices
            .insert(address, SpdDevice::new(kind));
    }

    pub fn add_ddr3(&self, bus: u8, address: u8) {
        self.add(bus, address, SpdKind::Ddr3);
    }

    pub fn add_ddr4(&self, bus: u8, address: u8) {
        self.add(bus, address, SpdKind::Ddr4);
    }

    /// Adds an SPD5118 hub at `address` and its PMIC alongside it.
    pub fn add_ddr5(&self, bus: u8, address: u8) {
        self.add(bus, address, SpdKind::Ddr5);
    }

    /// Number of status reads for which a started transaction stays busy.
    pub fn set_busy_polls(&self, polls: u32) {
        self.state().busy_polls = polls;
    }

    /// Makes every subsequently started transaction stay busy forever.
    pub fn set_stuck_busy(&self, stuck: bool) {
        self.state().stuck_busy = stuck;
    }

    /// Emulates firmware locking out writes to SPD addresses.
    pub fn set_spd_write_disabled(&self, disabled: bool) {
        let mut state = self.state();
        state.spd_write_disabled = disabled;

        let hostc = (PCH_SMBUS, 0x40);
        if disabled {
            state.config.insert(hostc, 1 << 4);
        } else {
            state.config.remove(&hostc);
        }
    }

    fn with_device<R>(
        &self,
        bus: u8,
        address: u8,
        f: impl FnOnce(&mut SpdDevice) -> R,
    ) -> R {
        let mut state = self.state();
        let dev = state.buses[usize::from(bus)]
            .devices
            .get_mut(&address)
            .unwrap_or_else(|| panic!("no device at {bus}:{address:#x}"));
        f(dev)
    }

    /// Puts a DDR5 hub in or out of offline (write protect override) mode.
    pub fn set_offline(&self, bus: u8, address: u8, offline: bool) {
        self.with_device(bus, address, |dev| dev.offline = offline);
    }

    /// The full EEPROM contents of a device, bypassing the bus.
    pub fn nvm(&self, bus: u8, address: u8) -> Vec<u8> {
        self.with_device(bus, address, |dev| dev.nvm.clone())
    }

    /// Modifies EEPROM contents, bypassing the bus and any protection.
    pub fn poke(&self, bus: u8, address: u8, offset: usize, val: u8) {
        self.with_device(bus, address, |dev| dev.nvm[offset] = val);
    }

    /// The protection bitmap of a device, one bit per block.
    pub fn rswp(&self, bus: u8, address: u8) -> u16 {
        self.with_device(bus, address, |dev| dev.rswp)
    }

    pub fn set_rswp(&self, bus: u8, address: u8, rswp: u16) {
        self.with_device(bus, address, |dev| dev.rswp = rswp);
    }

    pub fn pswp(&self, bus: u8, address: u8) -> bool {
        self.with_device(bus, address, |dev| dev.pswp)
    }

    pub fn page(&self, bus: u8, address: u8) -> u8 {
        self.with_device(bus, address, |dev| dev.page)
    }

    /// Changes a device's page behind the driver's back.
    pub fn set_page(&self, bus: u8, address: u8, page: u8) {
        self.with_device(bus, address, |dev| dev.page = page);
    }

    pub fn stats(&self) -> Stats {
        self.state().stats
    }

    pub fn log(&self) -> Vec<LoggedTransaction> {
        self.state().log.clone()
    }

    /// Forgets every count and logged transaction.
    pub fn reset_stats(&self) {
        let mut state = self.state();
        state.stats = Stats::default();
        state.log.clear();
    }
}

impl Engine {
    fn poll(&mut self, pending: &mut usize) -> Poll {
        let Some(txn) = &mut self.in_flight else {
            return Poll::Idle;
        };

        if txn.stuck {
            return Poll::Busy;
        }

        if txn.polls_left > 0 {
            txn.polls_left -= 1;
            return Poll::Busy;
        }

        let Some(done) = self.in_flight.take() else {
            return Poll::Idle;
        };

        self.reap(pending);
        Poll::Done(done.req, done.result)
    }

    fn reap(&mut self, pending: &mut usize) {
        if self.unreaped {
            self.unreaped = false;
            *pending = pending.saturating_sub(1);
        }
    }

    fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }
}

impl State {
    /// Puts a request on the wire and arms `engine` with its result.
    fn start(&mut self, bus: u8, req: Request, which: Host) {
        let b = usize::from(bus);

        self.stats.transactions += 1;

        match self.buses[b].classify(&req) {
            Effect::PageSelect => self.stats.page_selects += 1,
            Effect::NvmRead => self.stats.nvm_reads += 1,
            Effect::NvmWrite => self.stats.nvm_writes += 1,
            Effect::Other => {}
        }

        if req.command == CommandKind::Quick {
            self.stats.quick += 1;
        }

        self.log.push(LoggedTransaction {
            bus,
            address: req.address,
            offset: req.offset,
            access: req.access,
            command: req.command,
            input: req.input,
        });

        self.pending += 1;
        self.stats.max_in_flight = self.stats.max_in_flight.max(self.pending);

        let locked_out = self.spd_write_disabled
            && req.access == AccessMode::Write
            && req.command != CommandKind::Quick
            && is_eeprom_address(req.address);

        let result = if locked_out {
            Err(())
        } else {
            self.buses[b].transact(&req)
        };

        let in_flight = InFlight {
            polls_left: self.busy_polls,
            stuck: self.stuck_busy,
            req,
            result,
        };

        let engine = match which {
            Host::Piix => &mut self.piix[b].engine,
            Host::Nvidia => &mut self.nvidia.engine,
            Host::SkylakeX => &mut self.skx[b].engine,
        };

        engine.in_flight = Some(in_flight);
        engine.unreaped = true;
    }

    /// Maps an I/O port to a PIIX window: the bus and register offset.
    fn piix_window(&self, port: u16) -> Option<(u8, u16)> {
        let (base, buses) = match self.chipset {
            MockChipset::Intel { .. } => (INTEL_SMBUS_BASE, 1u8),
            MockChipset::Amd => (AMD_SMBUS_BASE, 2u8),
            _ => return None,
        };

        (0..buses).find_map(|bus| {
            let start = base + u16::from(bus) * AMD_BUS_STRIDE;
            (start..start + 0x10)
                .contains(&port)
                .then(|| (bus, port - start))
        })
    }

    fn nvidia_window(&self, port: u16) -> Option<u16> {
        match self.chipset {
            MockChipset::Nvidia => (NVIDIA_SMBUS_BASE..NVIDIA_SMBUS_BASE + 8)
                .contains(&port)
                .then(|| port - NVIDIA_SMBUS_BASE),
            _ => None,
        }
    }

    fn read_io(&mut self, port: u16) -> Option<u8> {
        if self.chipset == MockChipset::Amd {
            match port {
                AMD_PM_INDEX => return Some(self.pm_index),
                AMD_PM_DATA => return Some(self.pm[usize::from(self.pm_index)]),
                _ => {}
            }
        }

        if let Some((bus, reg)) = self.piix_window(port) {
            return Some(self.read_piix(bus, reg));
        }

        if let Some(reg) = self.nvidia_window(port) {
            return Some(self.read_nvidia(reg));
        }

        None
    }

    fn write_io(&mut self, port: u16, val: u8) -> bool {
        if self.chipset == MockChipset::Amd {
            match port {
                AMD_PM_INDEX => {
                    self.pm_index = val;
                    return true;
                }
                AMD_PM_DATA => {
                    self.pm[usize::from(self.pm_index)] = val;
                    return true;
                }
                _ => {}
            }
        }

        if let Some((bus, reg)) = self.piix_window(port) {
            self.write_piix(bus, reg, val);
            return true;
        }

        if let Some(reg) = self.nvidia_window(port) {
            self.write_nvidia(reg, val);
            return true;
        }

        false
    }

    fn read_piix(&mut self, bus: u8, reg: u16) -> u8 {
        let b = usize::from(bus);

        match reg {
            HST_STS => {
                let regs = &mut self.piix[b];

                match regs.engine.poll(&mut self.pending) {
                    Poll::Busy => regs.sts | STS_HOST_BUSY,
                    Poll::Idle => regs.sts,
                    Poll::Done(req, Ok(data)) => {
                        if req.access == AccessMode::Read {
                            let [lo, hi] = data.to_le_bytes();
                            regs.d0 = lo;
                            regs.d1 = hi;
                        }
                        regs.sts |= STS_INTR;
                        regs.sts
                    }
                    Poll::Done(_, Err(())) => {
                        regs.sts |= STS_DEV_ERR;
                        regs.sts
                    }
                }
            }
            HST_CNT => self.piix[b].cnt,
            HST_CMD => self.piix[b].cmd,
            XMIT_SLVA => self.piix[b].slva,
            HST_D0 => self.piix[b].d0,
            HST_D1 => self.piix[b].d1,
            _ => 0,
        }
    }

    fn write_piix(&mut self, bus: u8, reg: u16, val: u8) {
        let b = usize::from(bus);

        match reg {
            HST_STS => self.piix[b].sts &= !(val & STS_CLEARABLE),
            HST_CNT => {
                if val & CNT_KILL != 0 {
                    self.stats.kills += 1;

                    let regs = &mut self.piix[b];
                    if regs.engine.is_busy() {
                        regs.engine.in_flight = None;
                        regs.engine.reap(&mut self.pending);
                        regs.sts |= STS_FAILED;
                    }

                    regs.cnt = val;
                    return;
                }

                self.piix[b].cnt = val & !CNT_START;

                if val & CNT_START != 0 {
                    let command = match (val >> 2) & 0x7 {
                        0 => CommandKind::Quick,
                        1 => CommandKind::Byte,
                        2 => CommandKind::ByteData,
                        3 => CommandKind::WordData,
                        _ => {
                            self.piix[b].sts |= STS_FAILED;
                            return;
                        }
                    };

                    let regs = &self.piix[b];
                    let req = Request {
                        address: regs.slva >> 1,
                        access: access(regs.slva),
                        command,
                        offset: regs.cmd,
                        input: u16::from_le_bytes([regs.d0, regs.d1]),
                    };

                    self.start(bus, req, Host::Piix);
                }
            }
            HST_CMD => self.piix[b].cmd = val,
            XMIT_SLVA => self.piix[b].slva = val,
            HST_D0 => self.piix[b].d0 = val,
            HST_D1 => self.piix[b].d1 = val,
            _ => {}
        }
    }

    fn read_nvidia(&mut self, reg: u16) -> u8 {
        let regs = &mut self.nvidia;

        match reg {
            NV_STS => match regs.engine.poll(&mut self.pending) {
                Poll::Busy => 0,
                Poll::Idle => regs.sts,
                Poll::Done(req, Ok(data)) => {
                    if req.access == AccessMode::Read {
                        let [lo, hi] = data.to_le_bytes();
                        regs.data0 = lo;
                        regs.data1 = hi;
                    }
                    regs.sts = NV_STS_DONE;
                    regs.sts
                }
                Poll::Done(_, Err(())) => {
                    regs.sts = NV_STS_DONE | NV_STS_NACK;
                    regs.sts
                }
            },
            NV_PRTCL => regs.prtcl,
            NV_ADDR => regs.addr,
            NV_CMD => regs.cmd,
            NV_DATA0 => regs.data0,
            NV_DATA1 => regs.data1,
            _ => 0,
        }
    }

    fn write_nvidia(&mut self, reg: u16, val: u8) {
        match reg {
            NV_STS => self.nvidia.sts &= !val,
            NV_ADDR => self.nvidia.addr = val,
            NV_CMD => self.nvidia.cmd = val,
            NV_DATA0 => self.nvidia.data0 = val,
            NV_DATA1 => self.nvidia.data1 = val,
            NV_PRTCL => {
                self.nvidia.prtcl = val;

                let command = match val & !1 {
                    0x02 => CommandKind::Quick,
                    0x04 => CommandKind::Byte,
                    0x06 => CommandKind::ByteData,
                    0x08 => CommandKind::WordData,
                    _ => {
                        self.nvidia.sts = NV_STS_DONE | NV_STS_INVALID;
                        return;
                    }
                };

                let regs = &self.nvidia;
                let req = Request {
                    address: regs.addr >> 1,
                    access: access(val),
                    command,
                    offset: regs.cmd,
                    input: u16::from_le_bytes([regs.data0, regs.data1]),
                };

                self.start(0, req, Host::Nvidia);
            }
            _ => {}
        }
    }

    fn skx_register(&self, dev: PciAddress, offset: u16) -> Option<(u8, u16)> {
        if self.chipset != MockChipset::SkylakeX || dev != CPU_SMBUS {
            return None;
        }

        [SKX_CMD, SKX_STAT, SKX_DATA].into_iter().find_map(|reg| {
            (0..2u8).find_map(|bus| {
                (offset == reg + u16::from(bus) * 4).then_some((bus, reg))
            })
        })
    }

    fn read_pci(&mut self, dev: PciAddress, offset: u16) -> Option<u32> {
        let Some((bus, reg)) = self.skx_register(dev, offset) else {
            if !self.functions.iter().any(|f| f.address == dev) {
                return None;
            }

            return Some(self.config.get(&(dev, offset)).copied().unwrap_or(0));
        };

        let b = usize::from(bus);
        let spd_wd = if self.spd_write_disabled { SKX_CMD_SPD_WD } else { 0 };

        Some(match reg {
            SKX_CMD => self.skx[b].cmd | spd_wd,
            SKX_DATA => self.skx[b].data,
            _ => {
                let regs = &mut self.skx[b];

                match regs.engine.poll(&mut self.pending) {
                    Poll::Busy => SKX_STAT_BUSY,
                    Poll::Idle => regs.stat,
                    Poll::Done(req, Ok(data)) => {
                        regs.stat = match (req.access, req.command) {
                            (AccessMode::Read, CommandKind::Quick) => 0,
                            (AccessMode::Read, _) => {
                                regs.data = (regs.data & 0xffff_0000) | u32::from(data);
                                SKX_STAT_READ_VALID
                            }
                            (AccessMode::Write, _) => SKX_STAT_WRITE_DONE,
                        };
                        regs.stat
                    }
                    Poll::Done(_, Err(())) => {
                        regs.stat = SKX_STAT_BUS_ERROR;
                        regs.stat
                    }
                }
            }
        })
    }

    fn write_pci(&mut self, dev: PciAddress, offset: u16, val: u32) -> bool {
        let Some((bus, reg)) = self.skx_register(dev, offset) else {
            if !self.functions.iter().any(|f| f.address == dev) {
                return false;
            }

            self.config.insert((dev, offset), val);
            return true;
        };

        let b = usize::from(bus);

        match reg {
            SKX_DATA => self.skx[b].data = val,
            SKX_CMD => {
                self.skx[b].cmd = val & !(SKX_CMD_TRIGGER | SKX_CMD_SPD_WD);

                if val & SKX_CMD_TRIGGER != 0 {
                    let command = match (val >> 16) & 0x3 {
                        0 => CommandKind::Quick,
                        1 => CommandKind::Byte,
                        2 => CommandKind::ByteData,
                        _ => CommandKind::WordData,
                    };

                    let slva = (val >> 8) as u8;
                    let req = Request {
                        address: slva >> 1,
                        access: access(slva),
                        command,
                        offset: val as u8,
                        input: (self.skx[b].data >> 16) as u16,
                    };

                    self.skx[b].stat = 0;
                    self.start(bus, req, Host::SkylakeX);
                }
            }
            _ => {}
        }

        true
    }
}

#[derive(Copy, Clone)]
enum Host {
    Piix,
    Nvidia,
    SkylakeX,
}

fn access(rw: u8) -> AccessMode {
    if rw & 1 != 0 {
        AccessMode::Read
    } else {
        AccessMode::Write
    }
}

impl RawAccess for MockSmbus {
    fn read_io_u8(&self, port: u16) -> Option<u8> {
        self.state().read_io(port)
    }

    fn read_io_u16(&self, port: u16) -> Option<u16> {
        let mut state = self.state();
        let lo = state.read_io(port)?;
        let hi = state.read_io(port.wrapping_add(1))?;
        Some(u16::from_le_bytes([lo, hi]))
    }

    fn read_io_u32(&self, port: u16) -> Option<u32> {
        let lo = self.read_io_u16(port)?;
        let hi = self.read_io_u16(port.wrapping_add(2))?;
        Some(u32::from(lo) | u32::from(hi) << 16)
    }

    fn write_io_u8(&self, port: u16, val: u8) -> bool {
        self.state().write_io(port, val)
    }

    fn write_io_u16(&self, port: u16, val: u16) -> bool {
        let [lo, hi] = val.to_le_bytes();
        let mut state = self.state();
        state.write_io(port, lo) && state.write_io(port.wrapping_add(1), hi)
    }

    fn write_io_u32(&self, port: u16, val: u32) -> bool {
        self.write_io_u16(port, val as u16)
            && self.write_io_u16(port.wrapping_add(2), (val >> 16) as u16)
    }

    fn read_pci_u32(&self, dev: PciAddress, offset: u16) -> Option<u32> {
        self.state().read_pci(dev, offset)
    }

    fn write_pci_u32(&self, dev: PciAddress, offset: u16, val: u32) -> bool {
        self.state().write_pci(dev, offset, val)
    }
}

impl PciLocator for MockSmbus {
    fn find_by_id(
        &self,
        vendor: u16,
        device: u16,
        index: usize,
    ) -> Option<PciAddress> {
        self.state()
            .functions
            .iter()
            .filter(|f| f.vendor == vendor && f.device == device)
            .nth(index)
            .map(|f| f.address)
    }

    fn find_by_class(
        &self,
        class: u8,
        subclass: u8,
        _prog_if: Option<u8>,
        index: usize,
    ) -> Option<PciAddress> {
        self.state()
            .functions
            .iter()
            .filter(|f| f.class == class && f.subclass == subclass)
            .nth(index)
            .map(|f| f.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piix_read(mock: &MockSmbus, base: u16, address: u8, offset: u8) -> (u8, u8) {
        assert!(mock.write_io_u8(base + HST_STS, STS_CLEARABLE));
        assert!(mock.write_io_u8(base + XMIT_SLVA, address << 1 | 1));
        assert!(mock.write_io_u8(base + HST_CMD, offset));
        assert!(mock.write_io_u8(base + HST_CNT, CNT_START | 0x08));

        let sts = loop {
            let sts = mock.read_io_u8(base + HST_STS).unwrap();
            if sts & STS_HOST_BUSY == 0 {
                break sts;
            }
        };

        (sts, mock.read_io_u8(base + HST_D0).unwrap())
    }

    #[test]
    fn piix_register_sequence() {
        let mock = MockSmbus::new(MockChipset::Intel { device_id: 0x7aa3 });
        mock.add_ddr4(0, 0x50);
        mock.set_busy_polls(3);

        let (sts, d0) = piix_read(&mock, INTEL_SMBUS_BASE, 0x50, 2);
        assert_eq!(sts, STS_INTR);
        assert_eq!(d0, 0x0c);

        let (sts, _) = piix_read(&mock, INTEL_SMBUS_BASE, 0x51, 2);
        assert_eq!(sts & STS_DEV_ERR, STS_DEV_ERR);

        let stats = mock.stats();
        assert_eq!(stats.transactions, 2);
        assert_eq!(stats.nvm_reads, 1);
        assert_eq!(stats.max_in_flight, 1);
    }

    #[test]
    fn overlapping_starts_are_counted() {
        let mock = MockSmbus::new(MockChipset::Amd);
        mock.add_ddr4(0, 0x50);
        mock.add_ddr4(1, 0x50);
        mock.set_busy_polls(10);

        for bus in 0..2u16 {
            let base = AMD_SMBUS_BASE + bus * AMD_BUS_STRIDE;
            assert!(mock.write_io_u8(base + XMIT_SLVA, 0xa1));
            assert!(mock.write_io_u8(base + HST_CNT, CNT_START | 0x08));
        }

        assert_eq!(mock.stats().max_in_flight, 2);
    }

    #[test]
    fn kill_reaps_a_stuck_transaction() {
        let mock = MockSmbus::new(MockChipset::Intel { device_id: 0x7aa3 });
        mock.set_stuck_busy(true);

        let base = INTEL_SMBUS_BASE;
        assert!(mock.write_io_u8(base + HST_CNT, CNT_START));
        assert_eq!(mock.read_io_u8(base + HST_STS), Some(STS_HOST_BUSY));

        assert!(mock.write_io_u8(base + HST_CNT, CNT_KILL));
        assert_eq!(mock.read_io_u8(base + HST_STS), Some(STS_FAILED));
        assert_eq!(mock.stats().kills, 1);
    }

    #[test]
    fn locator_and_config_space() {
        let mock = MockSmbus::new(MockChipset::SkylakeX);

        assert_eq!(mock.find_by_id(0x8086, 0x2085, 0), Some(CPU_SMBUS));
        assert_eq!(mock.find_by_id(0x8086, 0x2085, 1), None);
        assert_eq!(mock.find_by_class(0x0c, 0x05, None, 0), Some(PCH_SMBUS));
        assert_eq!(mock.read_pci_u16(CPU_SMBUS, 0x02), Some(0x2085));
        assert_eq!(
            mock.read_pci_u32(PciAddress::new(0, 2, 0), 0x00),
            None
        );

        assert_eq!(mock.read_io_u8(0x0cd6), None);
    }
}
