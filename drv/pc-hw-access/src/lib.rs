// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register access for PC chipsets
//!
//! The SMBus drivers never touch hardware directly.  Instead, they go through
//! two collaborators that are supplied by whatever has obtained ring-0 access
//! on this machine:
//!
//! - [`RawAccess`]: primitive reads and writes of legacy I/O ports and PCI
//!   configuration space.
//! - [`PciLocator`]: finds a function by vendor/device id or by class.
//!
//! On top of these, this crate provides the two thin accessors the drivers
//! actually hold: an [`IoPort`] window (which serializes every access through
//! a machine-wide [`MachineMutex`], because other monitoring software on the
//! box may be poking the same ports), and a [`PciConfigAccessor`] scoped to a
//! single function.

use std::sync::Arc;
use std::time::Duration;

use drv_smbus_types::ResponseCode;
use ringbuf::*;

mod mutex;

pub use mutex::{MachineMutex, MachineMutexGuard};

/// Name of the machine-wide mutex by which well-behaved hardware monitoring
/// software serializes access to legacy (ISA) I/O port space.
pub const ISA_BUS_MUTEX: &str = "Access_ISABUS.HTP.Method";

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    LockUnavailable(u16),
    ReadFailed(u16),
    WriteFailed(u16),
}

ringbuf!(Trace, 16, Trace::None);

///
/// Location of a PCI function.
///
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

impl core::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

///
/// Primitive hardware access.  How ring-0 access was obtained (a kernel
/// driver, `/dev/port`, a hypervisor, a simulation) is entirely the
/// implementor's business; failures are reported as `None`/`false` and are
/// never expected to panic.
///
/// PCI configuration space is only required to be implemented as aligned
/// dwords; narrower accesses default to extracting from (or merging into) the
/// containing dword.
///
pub trait RawAccess: Send + Sync {
    fn read_io_u8(&self, port: u16) -> Option<u8>;
    fn read_io_u16(&self, port: u16) -> Option<u16>;
    fn read_io_u32(&self, port: u16) -> Option<u32>;
    fn write_io_u8(&self, port: u16, val: u8) -> bool;
    fn write_io_u16(&self, port: u16, val: u16) -> bool;
    fn write_io_u32(&self, port: u16, val: u32) -> bool;

    fn read_pci_u32(&self, dev: PciAddress, offset: u16) -> Option<u32>;
    fn write_pci_u32(&self, dev: PciAddress, offset: u16, val: u32) -> bool;

    fn read_pci_u8(&self, dev: PciAddress, offset: u16) -> Option<u8> {
        let dword = self.read_pci_u32(dev, offset & !0b11)?;
        Some((dword >> ((offset & 0b11) * 8)) as u8)
    }

    fn read_pci_u16(&self, dev: PciAddress, offset: u16) -> Option<u16> {
        let dword = self.read_pci_u32(dev, offset & !0b11)?;
        Some((dword >> ((offset & 0b10) * 8)) as u16)
    }

    fn write_pci_u8(&self, dev: PciAddress, offset: u16, val: u8) -> bool {
        let aligned = offset & !0b11;
        let shift = (offset & 0b11) * 8;

        match self.read_pci_u32(dev, aligned) {
            Some(dword) => {
                let dword = (dword & !(0xff << shift)) | (u32::from(val) << shift);
                self.write_pci_u32(dev, aligned, dword)
            }
            None => false,
        }
    }

    fn write_pci_u16(&self, dev: PciAddress, offset: u16, val: u16) -> bool {
        let aligned = offset & !0b11;
        let shift = (offset & 0b10) * 8;

        match self.read_pci_u32(dev, aligned) {
            Some(dword) => {
                let dword =
                    (dword & !(0xffff << shift)) | (u32::from(val) << shift);
                self.write_pci_u32(dev, aligned, dword)
            }
            None => false,
        }
    }
}

///
/// PCI function discovery.  `index` selects among multiple matches, in
/// enumeration order.
///
pub trait PciLocator {
    fn find_by_id(
        &self,
        vendor: u16,
        device: u16,
        index: usize,
    ) -> Option<PciAddress>;

    fn find_by_class(
        &self,
        class: u8,
        subclass: u8,
        prog_if: Option<u8>,
        index: usize,
    ) -> Option<PciAddress>;
}

///
/// A window of legacy I/O ports starting at `base`.  If a machine-wide mutex
/// has been attached, every access acquires it first; failure to acquire it
/// within the timeout is reported as [`ResponseCode::LockUnavailable`].
///
#[derive(Clone)]
pub struct IoPort {
    raw: Arc<dyn RawAccess>,
    base: u16,
    mutex: Option<Arc<MachineMutex>>,
    lock_timeout: Duration,
}

impl core::fmt::Debug for IoPort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoPort")
            .field("base", &format_args!("{:#06x}", self.base))
            .field("locked", &self.mutex.is_some())
            .finish()
    }
}

impl IoPort {
    pub fn new(raw: Arc<dyn RawAccess>, base: u16) -> Self {
        Self {
            raw,
            base,
            mutex: None,
            lock_timeout: Duration::from_secs(1),
        }
    }

    /// Serializes every subsequent access through `mutex`.
    pub fn with_mutex(
        mut self,
        mutex: Option<Arc<MachineMutex>>,
        lock_timeout: Duration,
    ) -> Self {
        self.mutex = mutex;
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Returns the same window moved up by `delta` ports, sharing the lock.
    pub fn offset_by(&self, delta: u16) -> Self {
        Self {
            base: self.base.wrapping_add(delta),
            ..self.clone()
        }
    }

    fn locked<R>(
        &self,
        port: u16,
        op: impl FnOnce(&dyn RawAccess) -> R,
    ) -> Result<R, ResponseCode> {
        let _guard = match &self.mutex {
            Some(mutex) => match mutex.acquire(self.lock_timeout) {
                Ok(guard) => Some(guard),
                Err(code) => {
                    ringbuf_entry!(Trace::LockUnavailable(port));
                    return Err(code);
                }
            },
            None => None,
        };

        Ok(op(&*self.raw))
    }

    pub fn read_u8(&self, reg: u16) -> Result<u8, ResponseCode> {
        let port = self.base.wrapping_add(reg);

        self.locked(port, |raw| raw.read_io_u8(port))?.ok_or_else(|| {
            ringbuf_entry!(Trace::ReadFailed(port));
            ResponseCode::AccessFailed
        })
    }

    pub fn write_u8(&self, reg: u16, val: u8) -> Result<(), ResponseCode> {
        let port = self.base.wrapping_add(reg);

        if self.locked(port, |raw| raw.write_io_u8(port, val))? {
            Ok(())
        } else {
            ringbuf_entry!(Trace::WriteFailed(port));
            Err(ResponseCode::AccessFailed)
        }
    }

    /// Performs a write of `index` followed by a read of the data port
    /// `index_port + 1`, holding the lock across both so that nobody else
    /// can move the index in between.
    pub fn read_indexed(
        &self,
        index_port: u16,
        index: u8,
    ) -> Result<u8, ResponseCode> {
        let port = self.base.wrapping_add(index_port);

        self.locked(port, |raw| {
            if raw.write_io_u8(port, index) {
                raw.read_io_u8(port.wrapping_add(1))
            } else {
                None
            }
        })?
        .ok_or_else(|| {
            ringbuf_entry!(Trace::ReadFailed(port));
            ResponseCode::AccessFailed
        })
    }
}

///
/// Configuration space accessor for a single PCI function.
///
#[derive(Clone)]
pub struct PciConfigAccessor {
    raw: Arc<dyn RawAccess>,
    dev: PciAddress,
}

impl core::fmt::Debug for PciConfigAccessor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PciConfigAccessor({})", self.dev)
    }
}

impl PciConfigAccessor {
    pub fn new(raw: Arc<dyn RawAccess>, dev: PciAddress) -> Self {
        Self { raw, dev }
    }

    pub fn address(&self) -> PciAddress {
        self.dev
    }

    pub fn read_u8(&self, offset: u16) -> Result<u8, ResponseCode> {
        self.raw
            .read_pci_u8(self.dev, offset)
            .ok_or(ResponseCode::AccessFailed)
    }

    pub fn read_u32(&self, offset: u16) -> Result<u32, ResponseCode> {
        self.raw
            .read_pci_u32(self.dev, offset)
            .ok_or(ResponseCode::AccessFailed)
    }

    pub fn write_u32(&self, offset: u16, val: u32) -> Result<(), ResponseCode> {
        if self.raw.write_pci_u32(self.dev, offset, val) {
            Ok(())
        } else {
            Err(ResponseCode::AccessFailed)
        }
    }

    /// Vendor and device id of this function, in that order.
    pub fn ids(&self) -> Result<(u16, u16), ResponseCode> {
        let id = self.read_u32(0x00)?;
        Ok((id as u16, (id >> 16) as u16))
    }
}
