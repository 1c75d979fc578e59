//! Readiness multiplexing across drivers.
//!
//! [`select`] splits the caller's interest sets by owning driver, asks each
//! driver to watch its share through
//! [`start_select`](crate::VfsDriver::start_select), parks on one shared
//! wake semaphore and collects per-driver readiness back into the caller's
//! sets through [`end_select`](crate::VfsDriver::end_select). A registered
//! socket space is special: its descriptors are handed to the socket
//! driver's own blocking [`socket_select`](crate::VfsDriver::socket_select),
//! which then doubles as the wait for everyone.

use core::sync::atomic::{AtomicU32, Ordering};

use esp_rtos_driver::semaphore::{SemaphoreHandle, SemaphoreKind, SemaphorePtr};

use crate::{Errno, MAX_DRIVERS, MAX_FDS, RawFd, VfsDriver, VfsResult};

const FD_WORDS: usize = MAX_FDS.div_ceil(32);

/// A set of global file descriptors, sized to the descriptor table.
///
/// Descriptors outside `0..MAX_FDS` are ignored by [`set`](Self::set) and
/// never reported as members, which keeps the POSIX shape (callers may pass
/// sets around without range checks) without undefined bits.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FdSet {
    bits: [u32; FD_WORDS],
}

impl FdSet {
    /// The empty set.
    pub const fn new() -> Self {
        Self {
            bits: [0; FD_WORDS],
        }
    }

    fn index(fd: RawFd) -> Option<(usize, u32)> {
        let fd = usize::try_from(fd).ok()?;
        if fd >= MAX_FDS {
            return None;
        }
        Some((fd / 32, 1 << (fd % 32)))
    }

    /// Adds `fd` to the set.
    pub fn set(&mut self, fd: RawFd) {
        if let Some((word, bit)) = Self::index(fd) {
            self.bits[word] |= bit;
        }
    }

    /// Removes `fd` from the set.
    pub fn clear(&mut self, fd: RawFd) {
        if let Some((word, bit)) = Self::index(fd) {
            self.bits[word] &= !bit;
        }
    }

    /// Whether `fd` is a member.
    pub fn is_set(&self, fd: RawFd) -> bool {
        Self::index(fd).is_some_and(|(word, bit)| self.bits[word] & bit != 0)
    }

    /// Empties the set.
    pub fn zero(&mut self) {
        self.bits = [0; FD_WORDS];
    }

    /// Whether the set has no members.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|word| *word == 0)
    }

    /// Number of members.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// The members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        (0..MAX_FDS as RawFd).filter(move |fd| self.is_set(*fd))
    }

    /// Adds every member of `other`.
    pub fn union_with(&mut self, other: &FdSet) {
        for (word, more) in self.bits.iter_mut().zip(other.bits.iter()) {
            *word |= *more;
        }
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for FdSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// The read/write/error interest (or readiness) triple used by [`select`]
/// and the driver select hooks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectSets {
    /// Descriptors watched for, or ready for, reading.
    pub read: FdSet,
    /// Descriptors watched for, or ready for, writing.
    pub write: FdSet,
    /// Descriptors watched for, or carrying, an error condition.
    pub error: FdSet,
}

impl SelectSets {
    /// Three empty sets.
    pub const fn new() -> Self {
        Self {
            read: FdSet::new(),
            write: FdSet::new(),
            error: FdSet::new(),
        }
    }

    /// Whether all three sets are empty.
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty() && self.error.is_empty()
    }
}

/// Identifies one in-flight [`select`] call in driver bookkeeping.
///
/// Minted fresh for every call, so drivers can key watcher state by value
/// instead of holding pointers into the caller's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SelectToken(u32);

static NEXT_TOKEN: AtomicU32 = AtomicU32::new(0);

/// Wake-up line handed to drivers for the duration of one [`select`] call.
///
/// Raising it unblocks the selecting task so it can collect readiness. The
/// signal is backed by a binary semaphore, so raising it any number of
/// times before the caller wakes still costs one wake-up.
#[derive(Debug, Clone, Copy)]
pub struct SelectSignal(SemaphorePtr);

impl SelectSignal {
    /// Wakes the selecting task.
    pub fn raise(&self) {
        unsafe { SemaphoreHandle::ref_from_ptr(&self.0) }.give();
    }

    /// Wakes the selecting task from an interrupt handler.
    pub fn raise_from_isr(&self) {
        unsafe { SemaphoreHandle::ref_from_ptr(&self.0) }.try_give_from_isr(None);
    }
}

// Drivers stash copies in state reachable from other tasks and interrupt
// handlers. The semaphore behind the pointer belongs to the select() frame
// and outlives every copy: each started driver sees its end_select before
// the frame drops the semaphore.
unsafe impl Send for SelectSignal {}
unsafe impl Sync for SelectSignal {}

struct DriverScratch {
    index: usize,
    driver: &'static dyn VfsDriver,
    interest: SelectSets,
    started: bool,
}

fn end_started(drivers: &[DriverScratch], token: SelectToken) {
    for scratch in drivers.iter().filter(|d| d.started) {
        let mut discard = SelectSets::new();
        if let Err(err) = scratch.driver.end_select(token, &mut discard) {
            warn!("vfs: end_select failed on driver {}: {}", scratch.index, err);
        }
    }
}

/// Waits until a descriptor in `read`, `write` or `error` below `nfds`
/// becomes ready, or until the timeout elapses.
///
/// On success the three sets are rewritten to hold only the ready
/// descriptors and the total count is returned; a pure timeout returns
/// `Ok(0)` with all sets empty. `timeout_us` of `None` waits forever.
/// Timeouts have millisecond resolution and a floor of one millisecond.
///
/// Descriptors map back to their owning drivers: each driver watches its
/// share via [`start_select`](VfsDriver::start_select) and reports through
/// [`end_select`](VfsDriver::end_select), while socket-range descriptors
/// are delegated wholesale to the socket driver's
/// [`socket_select`](VfsDriver::socket_select), which then performs the
/// blocking for the whole call.
///
/// Fails with [`Errno::EINVAL`] when `nfds` exceeds [`MAX_FDS`] and
/// [`Errno::EBADF`] when a watched descriptor is unmapped, in both cases
/// before any driver is started. When a driver's `start_select` fails,
/// drivers started before it are unwound with `end_select` and the error
/// is returned.
pub fn select(
    nfds: usize,
    read: &mut FdSet,
    write: &mut FdSet,
    error: &mut FdSet,
    timeout_us: Option<u64>,
) -> VfsResult<usize> {
    if nfds > MAX_FDS {
        return Err(Errno::EINVAL);
    }

    let interest_read = *read;
    let interest_write = *write;
    let interest_error = *error;
    read.zero();
    write.zero();
    error.zero();

    let mut drivers: heapless::Vec<DriverScratch, MAX_DRIVERS> = heapless::Vec::new();
    let mut socket_driver: Option<&'static dyn VfsDriver> = None;
    let mut socket_sets = SelectSets::new();

    for fd in 0..nfds {
        let fd = fd as RawFd;
        let want_read = interest_read.is_set(fd);
        let want_write = interest_write.is_set(fd);
        let want_error = interest_error.is_set(fd);
        if !(want_read || want_write || want_error) {
            continue;
        }
        let Some(target) = crate::select_target(fd) else {
            return Err(Errno::EBADF);
        };
        if target.socket_space {
            // Socket descriptors are identity-mapped; no translation.
            if want_read {
                socket_sets.read.set(fd);
            }
            if want_write {
                socket_sets.write.set(fd);
            }
            if want_error {
                socket_sets.error.set(fd);
            }
            socket_driver = Some(target.driver);
            continue;
        }
        let position = match drivers.iter().position(|d| d.index == target.index) {
            Some(position) => position,
            None => {
                let scratch = DriverScratch {
                    index: target.index,
                    driver: target.driver,
                    interest: SelectSets::new(),
                    started: false,
                };
                if drivers.push(scratch).is_err() {
                    return Err(Errno::ENOMEM);
                }
                drivers.len() - 1
            }
        };
        let scratch = &mut drivers[position];
        let local = target.local_fd;
        if want_read {
            scratch.interest.read.set(local);
        }
        if want_write {
            scratch.interest.write.set(local);
        }
        if want_error {
            scratch.interest.error.set(local);
        }
    }

    // One wake semaphore per call; every driver gets a copy of the signal.
    let sem = SemaphoreHandle::new(SemaphoreKind::Counting { max: 1, initial: 0 });
    let ptr = sem.leak();
    let sem = unsafe { SemaphoreHandle::from_ptr(ptr) };
    let signal = SelectSignal(ptr);
    let token = SelectToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));

    let mut failed = None;
    for scratch in drivers.iter_mut() {
        match scratch.driver.start_select(&scratch.interest, signal, token) {
            Ok(()) => scratch.started = true,
            Err(err) => {
                failed = Some(err);
                break;
            }
        }
    }
    if let Some(err) = failed {
        end_started(&drivers, token);
        return Err(err);
    }

    let waited: VfsResult<()> = match socket_driver {
        Some(driver) => driver
            .socket_select(&mut socket_sets, timeout_us, signal)
            .map(|_| ()),
        None => {
            let timeout = timeout_us.map(|us| {
                let ms = (us / 1000).max(1);
                u32::try_from(ms.saturating_mul(1000)).unwrap_or(u32::MAX)
            });
            sem.take(timeout);
            Ok(())
        }
    };
    if let Err(err) = waited {
        end_started(&drivers, token);
        return Err(err);
    }

    for scratch in drivers.iter() {
        let mut ready = SelectSets::new();
        if let Err(err) = scratch.driver.end_select(token, &mut ready) {
            warn!("vfs: end_select failed on driver {}: {}", scratch.index, err);
        }
        crate::for_each_fd_of(scratch.index, nfds, |fd, local| {
            if ready.read.is_set(local) {
                read.set(fd);
            }
            if ready.write.is_set(local) {
                write.set(fd);
            }
            if ready.error.is_set(local) {
                error.set(fd);
            }
        });
    }

    // socket_select rewrote its sets to ready-only; with no socket driver
    // involved they are untouched interest copies of nothing.
    read.union_with(&socket_sets.read);
    write.union_with(&socket_sets.write);
    error.union_with(&socket_sets.error);

    Ok(read.count() + write.count() + error.count())
}
