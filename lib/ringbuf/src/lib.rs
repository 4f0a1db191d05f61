// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing SMBus drivers running in a hosted process
//!
//! This contains an implementation for a static ring buffer designed to be
//! used to instrument arbitrary contexts.  Each module that touches hardware
//! declares a ring buffer of its own `Trace` type and deposits entries as it
//! goes; the most recent entries can then be inspected from a debugger or
//! dumped with [`Ringbuf::iter`] when something has gone sideways on a real
//! bus.
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//!
//! If you use the variants of the `ringbuf!` macro that leave the name of the
//! data structure implicit, you can only have one per module. (You can lift
//! this constraint by providing a name.)
//!
//! ## Creating a ring buffer
//!
//! Ring buffers are instantiated with the [`ringbuf!`] macro, to which one
//! must provide the type of per-entry payload, the number of entries, and a
//! static initializer.  For example, to define a 16-entry ring buffer with
//! each entry containing a `u32`:
//!
//! ```ignore
//! ringbuf!(u32, 16, 0);
//! ```
//!
//! Ring buffer entries are generated with [`ringbuf_entry!`] specifying a
//! payload of the appropriate type, e.g.:
//!
//! ```ignore
//! ringbuf_entry!(status);
//! ```
//!
//! You can also provide a name for the ring buffer, to distinguish between
//! them if you have more than one:
//!
//! ```ignore
//! ringbuf!(PAGE_RINGBUF, u32, 16, 0);
//!
//! // ...
//!
//! ringbuf_entry!(PAGE_RINGBUF, page);
//! ```
//!
//! Unlike a ring buffer living in a single-threaded task, these may be poked
//! from any thread in the process; each buffer is therefore wrapped in a
//! `Mutex`.  A poisoned buffer is still written to: losing trace data because
//! some other thread panicked mid-entry would defeat the point.

use std::sync::Mutex;

/// Declares a ringbuffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ringbuffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all of
/// which are initialized to `expr`.
///
/// The resulting ringbuffer will be static, so `NAME` should be uppercase.
/// The actual type of `NAME` will be `Mutex<Ringbuf<T, N>>`.
///
/// To support the common case of having one quickly-installed ringbuffer per
/// module, if you omit the name, it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: ::std::sync::Mutex<$crate::Ringbuf<$t, $n>> =
            ::std::sync::Mutex::new($crate::Ringbuf::new($init));
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Inserts data into a named ringbuffer (which should have been declared with
/// the `ringbuf!` macro).
///
/// `ringbuf_entry!(NAME, expr)` will insert `expr` into the ringbuffer called
/// `NAME`.
///
/// If you declared your ringbuffer without a name, you can also use this
/// without a name, and it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate both buf and payload, without letting them access each
        // other, by evaluating them in a tuple where each cannot
        // accidentally use the other's binding.
        let (p, buf) = ($payload, &$buf);
        $crate::record(buf, line!() as u16, p);
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// Deposits `payload` into `buf`, tolerating a poisoned lock.  This is what
/// [`ringbuf_entry!`] expands to; it is public only so that the macro can
/// reach it from other crates.
#[doc(hidden)]
pub fn record<T: Copy + PartialEq, const N: usize>(
    buf: &Mutex<Ringbuf<T, N>>,
    line: u16,
    payload: T,
) {
    let mut ring = buf.lock().unwrap_or_else(|e| e.into_inner());
    ring.entry(line, payload);
}

///
/// The structure of a single [`Ringbuf`] entry, carrying a payload of arbitrary
/// type.  When a ring buffer entry is generated with an identical payload to
/// the most recent entry (in terms of both `line` and `payload`), `count` will
/// be incremented rather than generating a new entry.
///
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

///
/// A ring buffer of parametrized type and size.  In practice, instantiating
/// this directly is strange -- see the [`ringbuf!`] macro.
///
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // On the very first entry, last is None; treating that as an
        // out-of-range index makes the first deposit land in slot 0 without
        // bumping the count of whatever happens to be there.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                // Only reuse this entry if we don't overflow the count.
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Iterates over the populated entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(last) => last + 1,
            None => N,
        };

        (0..N)
            .map(move |i| &self.buffer[(start + i) % N])
            .filter(|ent| ent.count != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_entry_lands_in_slot_zero() {
        let mut ring = Ringbuf::<u8, 4>::new(0);
        ring.entry(10, 7);

        assert_eq!(ring.last, Some(0));
        assert_eq!(ring.buffer[0].payload, 7);
        assert_eq!(ring.buffer[0].count, 1);
        assert_eq!(ring.buffer[0].generation, 1);
    }

    #[test]
    fn identical_entries_coalesce() {
        let mut ring = Ringbuf::<u8, 4>::new(0);
        ring.entry(10, 7);
        ring.entry(10, 7);
        ring.entry(10, 7);
        ring.entry(11, 7);

        let entries: Vec<_> = ring.iter().copied().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].count, 3);
        assert_eq!(entries[1].line, 11);
    }

    #[test]
    fn wraps_and_iterates_oldest_first() {
        let mut ring = Ringbuf::<u8, 3>::new(0);
        for p in 1..=5 {
            ring.entry(1, p);
        }

        let payloads: Vec<u8> = ring.iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![3, 4, 5]);
        assert_eq!(ring.buffer[0].generation, 2);
    }

    #[test]
    fn static_buffer_records() {
        crate::ringbuf!(TEST_RINGBUF, u16, 8, 0);
        crate::ringbuf_entry!(TEST_RINGBUF, 0x50);
        crate::ringbuf_entry!(TEST_RINGBUF, 0x52);

        let ring = TEST_RINGBUF.lock().unwrap();
        let payloads: Vec<u16> = ring.iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![0x50, 0x52]);
    }
}
