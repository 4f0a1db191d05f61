// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Machine-wide named mutex
//!
//! Legacy I/O port space is shared by every piece of software on the box
//! that believes it owns the SMBus or the Super I/O.  The convention among
//! such software is a named mutex held across each register access; we take
//! it too.  Within this process, a local mutex sits in front of the OS object
//! so that threads contend there rather than on the OS primitive (a `flock`
//! held by this process would otherwise happily admit a second thread using
//! the same descriptor).

use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use drv_smbus_types::ResponseCode;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod imp {
            use std::fs::{File, OpenOptions};
            use std::io;
            use std::os::unix::io::AsRawFd;
            use std::path::Path;
            use std::time::{Duration, Instant};

            pub(super) struct OsMutex {
                file: File,
            }

            impl OsMutex {
                pub(super) fn open(name: &str) -> io::Result<Self> {
                    Self::open_in(&std::env::temp_dir(), name)
                }

                pub(super) fn open_in(
                    dir: &Path,
                    name: &str,
                ) -> io::Result<Self> {
                    let file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(false)
                        .open(dir.join(format!("{name}.lock")))?;

                    Ok(Self { file })
                }

                pub(super) fn lock(&self, deadline: Instant) -> io::Result<bool> {
                    let fd = self.file.as_raw_fd();

                    loop {
                        // SAFETY: fd is owned by self.file for our lifetime.
                        let rc = unsafe {
                            libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB)
                        };

                        if rc == 0 {
                            return Ok(true);
                        }

                        let err = io::Error::last_os_error();
                        match err.raw_os_error() {
                            Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => {}
                            _ => return Err(err),
                        }

                        if Instant::now() >= deadline {
                            return Ok(false);
                        }

                        std::thread::sleep(Duration::from_millis(1));
                    }
                }

                pub(super) fn unlock(&self) {
                    // SAFETY: as above.
                    unsafe {
                        libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
                    }
                }
            }
        }
    } else if #[cfg(windows)] {
        mod imp {
            use std::io;
            use std::time::Instant;

            use windows::core::PCWSTR;
            use windows::Win32::Foundation::{
                CloseHandle, HANDLE, WAIT_ABANDONED, WAIT_OBJECT_0,
                WAIT_TIMEOUT,
            };
            use windows::Win32::System::Threading::{
                CreateMutexW, ReleaseMutex, WaitForSingleObject,
            };

            pub(super) struct OsMutex(HANDLE);

            // SAFETY: a mutex handle may be waited on and released from any
            // thread; ownership is tracked by the kernel per thread, and the
            // local mutex in front of us ensures the releasing thread is the
            // acquiring one.
            unsafe impl Send for OsMutex {}
            unsafe impl Sync for OsMutex {}

            impl OsMutex {
                pub(super) fn open(name: &str) -> io::Result<Self> {
                    let wide: Vec<u16> = format!("Global\\{name}")
                        .encode_utf16()
                        .chain(Some(0))
                        .collect();

                    // SAFETY: wide is NUL-terminated and outlives the call.
                    let handle = unsafe {
                        CreateMutexW(None, false, PCWSTR::from_raw(wide.as_ptr()))
                    }
                    .map_err(io::Error::other)?;

                    Ok(Self(handle))
                }

                pub(super) fn lock(&self, deadline: Instant) -> io::Result<bool> {
                    let wait = deadline
                        .saturating_duration_since(Instant::now())
                        .as_millis()
                        .min(u128::from(u32::MAX - 1)) as u32;

                    // SAFETY: self.0 is a valid mutex handle until drop.
                    let rc = unsafe { WaitForSingleObject(self.0, wait) };

                    // An abandoned mutex is still ours; its previous owner died
                    // holding it.
                    if rc == WAIT_OBJECT_0 || rc == WAIT_ABANDONED {
                        Ok(true)
                    } else if rc == WAIT_TIMEOUT {
                        Ok(false)
                    } else {
                        Err(io::Error::last_os_error())
                    }
                }

                pub(super) fn unlock(&self) {
                    // SAFETY: only called by the guard of a successful lock.
                    let _ = unsafe { ReleaseMutex(self.0) };
                }
            }

            impl Drop for OsMutex {
                fn drop(&mut self) {
                    // SAFETY: the handle is not used after this.
                    let _ = unsafe { CloseHandle(self.0) };
                }
            }
        }
    } else {
        mod imp {
            use std::io;
            use std::time::Instant;

            pub(super) struct OsMutex;

            impl OsMutex {
                pub(super) fn open(_name: &str) -> io::Result<Self> {
                    Ok(Self)
                }

                pub(super) fn lock(&self, _deadline: Instant) -> io::Result<bool> {
                    Ok(true)
                }

                pub(super) fn unlock(&self) {}
            }
        }
    }
}

///
/// A named mutex shared with every other process on the machine that uses the
/// same name.
///
pub struct MachineMutex {
    name: String,
    local: Mutex<()>,
    os: imp::OsMutex,
}

/// Held while the machine-wide mutex is owned; releases it on drop.
pub struct MachineMutexGuard<'a> {
    mutex: &'a MachineMutex,
    _local: MutexGuard<'a, ()>,
}

impl Drop for MachineMutexGuard<'_> {
    fn drop(&mut self) {
        // The OS object must be released before the local guard goes, so the
        // next local waiter finds it free.
        self.mutex.os.unlock();
    }
}

impl core::fmt::Debug for MachineMutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MachineMutex").field("name", &self.name).finish()
    }
}

impl MachineMutex {
    /// Opens (creating if need be) the named mutex.  Failure to create the OS
    /// object is reported as [`ResponseCode::AccessFailed`].
    pub fn open(name: &str) -> Result<Self, ResponseCode> {
        let os =
            imp::OsMutex::open(name).map_err(|_| ResponseCode::AccessFailed)?;

        Ok(Self {
            name: name.to_owned(),
            local: Mutex::new(()),
            os,
        })
    }

    /// Opens the named mutex with its lock file in `dir` rather than the
    /// system temporary directory.
    #[cfg(unix)]
    pub fn open_in(
        dir: &std::path::Path,
        name: &str,
    ) -> Result<Self, ResponseCode> {
        let os = imp::OsMutex::open_in(dir, name)
            .map_err(|_| ResponseCode::AccessFailed)?;

        Ok(Self {
            name: name.to_owned(),
            local: Mutex::new(()),
            os,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the mutex, giving up with [`ResponseCode::LockUnavailable`]
    /// once `timeout` has elapsed.
    pub fn acquire(
        &self,
        timeout: Duration,
    ) -> Result<MachineMutexGuard<'_>, ResponseCode> {
        let deadline = Instant::now() + timeout;

        let local = loop {
            match self.local.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::Poisoned(p)) => break p.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(ResponseCode::LockUnavailable);
                    }
                    std::thread::yield_now();
                }
            }
        };

        match self.os.lock(deadline) {
            Ok(true) => Ok(MachineMutexGuard {
                mutex: self,
                _local: local,
            }),
            Ok(false) => Err(ResponseCode::LockUnavailable),
            Err(_) => Err(ResponseCode::AccessFailed),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let a = MachineMutex::open_in(dir.path(), "smbus").unwrap();
        let b = MachineMutex::open_in(dir.path(), "smbus").unwrap();

        let guard = a.acquire(Duration::from_millis(10)).unwrap();

        let start = Instant::now();
        assert_eq!(
            b.acquire(Duration::from_millis(30)).err(),
            Some(ResponseCode::LockUnavailable)
        );
        assert!(start.elapsed() >= Duration::from_millis(30));

        drop(guard);
        assert!(b.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn threads_sharing_one_instance_exclude() {
        let dir = tempfile::tempdir().unwrap();
        let mutex =
            Arc::new(MachineMutex::open_in(dir.path(), "shared").unwrap());

        let guard = mutex.acquire(Duration::from_millis(10)).unwrap();

        let other = mutex.clone();
        let contended = std::thread::spawn(move || {
            other.acquire(Duration::from_millis(20)).err()
        })
        .join()
        .unwrap();
        assert_eq!(contended, Some(ResponseCode::LockUnavailable));

        drop(guard);

        let other = mutex.clone();
        let free = std::thread::spawn(move || {
            other.acquire(Duration::from_millis(20)).is_ok()
        })
        .join()
        .unwrap();
        assert!(free);
    }

    #[test]
    fn differently_named_mutexes_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let a = MachineMutex::open_in(dir.path(), "one").unwrap();
        let b = MachineMutex::open_in(dir.path(), "two").unwrap();

        let _ga = a.acquire(Duration::from_millis(10)).unwrap();
        let _gb = b.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(a.name(), "one");
    }
}
