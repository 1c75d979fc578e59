//! Virtual filesystem dispatch for ESP32 devices.
//!
//! A bounded registry maps path prefixes to pluggable filesystem drivers and
//! routes every POSIX-like call to the right one. Paths resolve by longest
//! registered prefix, where a prefix only matches whole components
//! (`/data` matches `/data/log` but not `/data1/log`), and an empty prefix
//! acts as the fallback driver when nothing longer matches. The matched
//! prefix is stripped before the driver sees the path, so drivers work in
//! their own rooted namespace.
//!
//! File descriptors are global: a fixed table maps each descriptor to the
//! owning driver and the driver's local descriptor. The top
//! [`SOCKET_FDS`] entries are reserved for a socket stack registered with
//! [`register_socket_space`], because socket descriptors are minted by the
//! network stack rather than by [`open`] and must resolve from the
//! descriptor value alone.
//!
//! Drivers implement [`VfsDriver`] and only the operations they support;
//! everything left out fails with [`Errno::ENOSYS`]. All failures carry a
//! newlib-style [`Errno`], so a libc adapter only needs
//! [`Errno::to_errno`] and a `-1` return to present the classic interface.
//!
//! Readiness multiplexing lives in [`select()`], anonymous pipes in
//! [`pipe`]. Blocking goes through the `esp-rtos-driver` interface, so the
//! crate runs on any scheduler implementing it, including `esp-rtos-std`
//! on the host.
//!
//! ## Usage
//!
//! ```rust,no_run
//! # use esp_rtos_std as _;
//! use esp_vfs::{LocalFd, VfsDriver, VfsResult};
//!
//! struct Null;
//!
//! impl VfsDriver for Null {
//!     fn open(&self, _path: &str, _flags: i32, _mode: i32) -> VfsResult<LocalFd> {
//!         Ok(0)
//!     }
//!
//!     fn write(&self, _fd: LocalFd, data: &[u8]) -> VfsResult<usize> {
//!         Ok(data.len())
//!     }
//!
//!     fn close(&self, _fd: LocalFd) -> VfsResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! static NULL: Null = Null;
//!
//! esp_vfs::register("/dev/null", &NULL).unwrap();
//!
//! let fd = esp_vfs::open("/dev/null", 0, 0).unwrap();
//! assert_eq!(esp_vfs::write(fd, b"discarded").unwrap(), 9);
//! esp_vfs::close(fd).unwrap();
//! ```
//!
//! ## Configuration
//!
//! This crate is configurable via its [esp-config] options:
//!
#![doc = include_str!(concat!(env!("OUT_DIR"), "/esp_vfs_config_table.md"))]
//!
//! [esp-config]: https://crates.io/crates/esp-config
//!
//! ## Feature Flags
#![doc = document_features::document_features!()]
#![doc(html_logo_url = "https://avatars.githubusercontent.com/u/46717278")]
#![deny(missing_docs)]
#![cfg_attr(not(test), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// MUST be the first module
mod fmt;

use core::cell::RefCell;

use critical_section::Mutex;
use esp_config::esp_config_int_parse;

pub mod pipe;
pub mod select;

pub use select::{FdSet, SelectSets, SelectSignal, SelectToken, select};

/// Size of the global file descriptor table (`ESP_VFS_MAX_FDS`).
pub const MAX_FDS: usize = esp_config::esp_config_int!(usize, "ESP_VFS_MAX_FDS");

/// Capacity of the driver registry (`ESP_VFS_MAX_DRIVERS`).
pub const MAX_DRIVERS: usize = esp_config::esp_config_int!(usize, "ESP_VFS_MAX_DRIVERS");

/// Number of descriptors at the top of the table reserved for the
/// socket-space driver (`ESP_VFS_SOCKET_FDS`).
pub const SOCKET_FDS: usize = esp_config::esp_config_int!(usize, "ESP_VFS_SOCKET_FDS");

/// Longest allowed registration prefix, in bytes (`ESP_VFS_PATH_MAX`).
pub const PATH_MAX: usize = esp_config::esp_config_int!(usize, "ESP_VFS_PATH_MAX");

const _: () = {
    assert!(MAX_DRIVERS >= 1, "the registry must hold at least one driver");
    assert!(
        SOCKET_FDS <= MAX_FDS,
        "the socket range cannot exceed the descriptor table"
    );
    assert!(PATH_MAX >= 1, "prefixes need at least one byte");
};

/// Global file descriptor, as handed out by this crate.
pub type RawFd = i32;

/// Driver-local file descriptor, private to the driver that minted it.
pub type LocalFd = i32;

/// Result type of every driver-facing VFS operation.
pub type VfsResult<T> = Result<T, Errno>;

/// `fcntl` command: read the per-descriptor status flags.
pub const F_GETFL: i32 = 3;
/// `fcntl` command: replace the per-descriptor status flags.
pub const F_SETFL: i32 = 4;
/// Status flag: reads and writes fail immediately instead of blocking.
pub const O_NONBLOCK: i32 = 0x4000;

/// Error values for VFS operations, numbered like newlib's `errno.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
#[repr(i32)]
pub enum Errno {
    /// Operation not permitted.
    EPERM = 1,
    /// No such file or directory.
    ENOENT = 2,
    /// I/O error.
    EIO = 5,
    /// Bad file descriptor.
    EBADF = 9,
    /// Operation would block.
    EAGAIN = 11,
    /// Out of memory.
    ENOMEM = 12,
    /// Permission denied.
    EACCES = 13,
    /// Resource busy.
    EBUSY = 16,
    /// File exists.
    EEXIST = 17,
    /// Cross-device link.
    EXDEV = 18,
    /// Invalid argument.
    EINVAL = 22,
    /// Too many open files in the system.
    ENFILE = 23,
    /// Too many open files.
    EMFILE = 24,
    /// Not a terminal.
    ENOTTY = 25,
    /// Illegal seek.
    ESPIPE = 29,
    /// Broken pipe.
    EPIPE = 32,
    /// Result too large.
    ERANGE = 34,
    /// Operation not implemented.
    ENOSYS = 88,
    /// Operation not supported.
    ENOTSUP = 134,
}

impl Errno {
    /// The numeric `errno` value, for presenting the POSIX convention at a
    /// libc boundary.
    pub const fn to_errno(self) -> i32 {
        self as i32
    }

    /// The POSIX name of the error.
    pub const fn name(self) -> &'static str {
        match self {
            Errno::EPERM => "EPERM",
            Errno::ENOENT => "ENOENT",
            Errno::EIO => "EIO",
            Errno::EBADF => "EBADF",
            Errno::EAGAIN => "EAGAIN",
            Errno::ENOMEM => "ENOMEM",
            Errno::EACCES => "EACCES",
            Errno::EBUSY => "EBUSY",
            Errno::EEXIST => "EEXIST",
            Errno::EXDEV => "EXDEV",
            Errno::EINVAL => "EINVAL",
            Errno::ENFILE => "ENFILE",
            Errno::EMFILE => "EMFILE",
            Errno::ENOTTY => "ENOTTY",
            Errno::ESPIPE => "ESPIPE",
            Errno::EPIPE => "EPIPE",
            Errno::ERANGE => "ERANGE",
            Errno::ENOSYS => "ENOSYS",
            Errno::ENOTSUP => "ENOTSUP",
        }
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors returned by the registration APIs.
///
/// Dispatch failures use [`Errno`]; this separate domain covers the setup
/// surface, where callers are system integrators rather than libc shims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VfsError {
    /// A prefix or argument failed validation.
    InvalidArgument,
    /// The call does not fit the current registration state.
    InvalidState,
    /// A fixed table is full.
    NoMemory,
}

/// Seek origin for [`lseek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(i32)]
pub enum Whence {
    /// Relative to the start of the file.
    Start = 0,
    /// Relative to the current position.
    Current = 1,
    /// Relative to the end of the file.
    End = 2,
}

/// What a descriptor or path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Character device or other special node.
    Device,
}

/// Minimal stat record reported by drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Object size in bytes.
    pub size: u64,
    /// Object kind.
    pub kind: FileKind,
}

/// Longest directory entry name a driver can report, in bytes.
pub const DIR_ENTRY_NAME_MAX: usize = 64;

/// One directory entry reported by [`readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name, without any path components.
    pub name: heapless::String<DIR_ENTRY_NAME_MAX>,
    /// Entry kind.
    pub kind: FileKind,
}

/// Opaque directory-stream token minted by a driver's
/// [`opendir`](VfsDriver::opendir).
///
/// The value only means something to the driver that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirHandle(
    /// Driver-chosen stream identifier.
    pub usize,
);

/// An open directory stream, bound to the driver that produced it.
#[derive(Debug)]
pub struct Dir {
    index: usize,
    handle: DirHandle,
}

/// A filesystem driver pluggable into the dispatch table.
///
/// Every operation has a default body failing with [`Errno::ENOSYS`], so a
/// driver implements exactly the calls it supports; the pipe driver for
/// example supports `read`/`write`/`close`/`fcntl` and the select hooks but
/// no path operations. Paths arrive with the registration prefix already
/// stripped, descriptors in the driver's own [`LocalFd`] numbering.
///
/// Implementations must be shareable: dispatch calls drivers concurrently
/// from any task, outside of the registry's internal locking.
pub trait VfsDriver: Sync {
    /// Opens `path` and returns a driver-local descriptor.
    fn open(&self, path: &str, flags: i32, mode: i32) -> VfsResult<LocalFd> {
        let _ = (path, flags, mode);
        Err(Errno::ENOSYS)
    }

    /// Closes a descriptor previously returned by this driver.
    fn close(&self, fd: LocalFd) -> VfsResult<()> {
        let _ = fd;
        Err(Errno::ENOSYS)
    }

    /// Reads up to `data.len()` bytes, returning the count actually read.
    fn read(&self, fd: LocalFd, data: &mut [u8]) -> VfsResult<usize> {
        let _ = (fd, data);
        Err(Errno::ENOSYS)
    }

    /// Writes `data`, returning the count actually written.
    fn write(&self, fd: LocalFd, data: &[u8]) -> VfsResult<usize> {
        let _ = (fd, data);
        Err(Errno::ENOSYS)
    }

    /// Moves the file position, returning the new offset from the start.
    fn lseek(&self, fd: LocalFd, offset: i64, whence: Whence) -> VfsResult<i64> {
        let _ = (fd, offset, whence);
        Err(Errno::ENOSYS)
    }

    /// Reports metadata for an open descriptor.
    fn fstat(&self, fd: LocalFd) -> VfsResult<FileStat> {
        let _ = fd;
        Err(Errno::ENOSYS)
    }

    /// Reports metadata for a path.
    fn stat(&self, path: &str) -> VfsResult<FileStat> {
        let _ = path;
        Err(Errno::ENOSYS)
    }

    /// Creates a new name for an existing file.
    fn link(&self, old: &str, new: &str) -> VfsResult<()> {
        let _ = (old, new);
        Err(Errno::ENOSYS)
    }

    /// Removes a name.
    fn unlink(&self, path: &str) -> VfsResult<()> {
        let _ = path;
        Err(Errno::ENOSYS)
    }

    /// Renames `old` to `new` within this driver.
    fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        let _ = (old, new);
        Err(Errno::ENOSYS)
    }

    /// Performs a driver-specific control operation.
    fn ioctl(&self, fd: LocalFd, cmd: i32, arg: i32) -> VfsResult<i32> {
        let _ = (fd, cmd, arg);
        Err(Errno::ENOSYS)
    }

    /// Manipulates descriptor flags, [`F_GETFL`]/[`F_SETFL`] style.
    fn fcntl(&self, fd: LocalFd, cmd: i32, arg: i32) -> VfsResult<i32> {
        let _ = (fd, cmd, arg);
        Err(Errno::ENOSYS)
    }

    /// Flushes buffered writes to storage.
    fn fsync(&self, fd: LocalFd) -> VfsResult<()> {
        let _ = fd;
        Err(Errno::ENOSYS)
    }

    /// Opens a directory stream.
    fn opendir(&self, path: &str) -> VfsResult<DirHandle> {
        let _ = path;
        Err(Errno::ENOSYS)
    }

    /// Reads the next entry of a directory stream, `None` at the end.
    fn readdir(&self, dir: DirHandle) -> VfsResult<Option<DirEntry>> {
        let _ = dir;
        Err(Errno::ENOSYS)
    }

    /// Closes a directory stream.
    fn closedir(&self, dir: DirHandle) -> VfsResult<()> {
        let _ = dir;
        Err(Errno::ENOSYS)
    }

    /// Begins watching the descriptors in `interest` for one [`select()`]
    /// call.
    ///
    /// `interest` is expressed in this driver's local descriptors. The
    /// driver either raises `signal` right away, when some watched
    /// descriptor is already ready, or stores `(token, signal)` and raises
    /// the signal when an event arrives later. Every successful
    /// `start_select` is balanced by exactly one
    /// [`end_select`](Self::end_select) with the same token before the
    /// `select` call returns; copies of `signal` must not be used after
    /// that.
    fn start_select(
        &self,
        interest: &SelectSets,
        signal: SelectSignal,
        token: SelectToken,
    ) -> VfsResult<()> {
        let _ = (interest, signal, token);
        Err(Errno::ENOSYS)
    }

    /// Finishes the watch started with `token`: reports which watched
    /// descriptors are ready right now, in local numbering, and releases
    /// the per-call bookkeeping.
    fn end_select(&self, token: SelectToken, ready: &mut SelectSets) -> VfsResult<()> {
        let _ = (token, ready);
        Err(Errno::ENOSYS)
    }

    /// Full blocking `select` over the socket space.
    ///
    /// Only ever invoked on the [`register_socket_space`] driver, with
    /// `sets` holding socket-range descriptors (identity-mapped, so no
    /// translation applies). The call blocks until a socket is ready,
    /// `signal` is raised by another driver, or the timeout elapses; on
    /// return `sets` holds only the ready descriptors and the result is
    /// their count.
    fn socket_select(
        &self,
        sets: &mut SelectSets,
        timeout_us: Option<u64>,
        signal: SelectSignal,
    ) -> VfsResult<usize> {
        let _ = (sets, timeout_us, signal);
        Err(Errno::ENOSYS)
    }
}

/// Identifies a live registration.
///
/// Returned by [`register`] and consumed by [`register_fd`] /
/// [`unregister_fd`], the interface for drivers that mint descriptors
/// without going through [`open`]. Valid until the matching [`unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfsId(pub(crate) usize);

struct Registration {
    prefix: heapless::String<PATH_MAX>,
    driver: &'static dyn VfsDriver,
    socket_space: bool,
}

#[derive(Clone, Copy)]
struct FdEntry {
    vfs_index: usize,
    local_fd: LocalFd,
    permanent: bool,
}

struct Vfs {
    drivers: [Option<Registration>; MAX_DRIVERS],
    fds: [Option<FdEntry>; MAX_FDS],
}

impl Vfs {
    const fn new() -> Self {
        Self {
            drivers: [const { None }; MAX_DRIVERS],
            fds: [None; MAX_FDS],
        }
    }
}

static VFS: Mutex<RefCell<Vfs>> = Mutex::new(RefCell::new(Vfs::new()));

fn validate_prefix(prefix: &str) -> Result<(), VfsError> {
    if prefix.is_empty() {
        // The empty prefix registers the fallback driver.
        return Ok(());
    }
    if prefix.len() > PATH_MAX || !prefix.starts_with('/') || prefix.ends_with('/') {
        return Err(VfsError::InvalidArgument);
    }
    Ok(())
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    if !path.starts_with(prefix) {
        return false;
    }
    // Whole components only: /data must not claim /data1/log.
    path.len() == prefix.len() || path.as_bytes()[prefix.len()] == b'/'
}

fn translated(path: &str, prefix_len: usize) -> &str {
    let rest = &path[prefix_len..];
    if rest.is_empty() { "/" } else { rest }
}

/// Registers `driver` under `path_prefix`.
///
/// A non-empty prefix must start with `/`, must not end with `/` and must
/// fit [`PATH_MAX`] bytes; the empty prefix registers the fallback driver
/// used when no longer prefix matches. Prefixes are unique, and the
/// registry holds at most [`MAX_DRIVERS`] entries; freed slots are reused
/// first-fit, so the returned [`VfsId`] values are not monotonic.
pub fn register(path_prefix: &str, driver: &'static dyn VfsDriver) -> Result<VfsId, VfsError> {
    validate_prefix(path_prefix)?;
    let index = critical_section::with(|cs| {
        let mut vfs = VFS.borrow_ref_mut(cs);
        let duplicate = vfs
            .drivers
            .iter()
            .flatten()
            .any(|r| !r.socket_space && r.prefix.as_str() == path_prefix);
        if duplicate {
            return Err(VfsError::InvalidArgument);
        }
        let Some(index) = vfs.drivers.iter().position(Option::is_none) else {
            return Err(VfsError::NoMemory);
        };
        let mut prefix = heapless::String::new();
        prefix
            .push_str(path_prefix)
            .map_err(|_| VfsError::InvalidArgument)?;
        vfs.drivers[index] = Some(Registration {
            prefix,
            driver,
            socket_space: false,
        });
        Ok(index)
    })?;
    debug!("vfs: registered {} at slot {}", path_prefix, index);
    Ok(VfsId(index))
}

/// Registers `driver` as the socket-space handler.
///
/// The driver is never matched by path. Instead it claims the top
/// [`SOCKET_FDS`] descriptors of the table in bulk, identity-mapped and
/// permanent, so descriptors minted by the network stack resolve to it from
/// the value alone. Returns the claimed range as `(first,
/// one_past_last)`. Fails with [`VfsError::InvalidState`] if a socket space
/// is already registered.
pub fn register_socket_space(driver: &'static dyn VfsDriver) -> Result<(RawFd, RawFd), VfsError> {
    let min_fd = MAX_FDS - SOCKET_FDS;
    critical_section::with(|cs| {
        let mut vfs = VFS.borrow_ref_mut(cs);
        if vfs.drivers.iter().flatten().any(|r| r.socket_space) {
            return Err(VfsError::InvalidState);
        }
        let Some(index) = vfs.drivers.iter().position(Option::is_none) else {
            return Err(VfsError::NoMemory);
        };
        vfs.drivers[index] = Some(Registration {
            prefix: heapless::String::new(),
            driver,
            socket_space: true,
        });
        for fd in min_fd..MAX_FDS {
            vfs.fds[fd] = Some(FdEntry {
                vfs_index: index,
                local_fd: fd as LocalFd,
                permanent: true,
            });
        }
        Ok(())
    })?;
    debug!("vfs: socket space claims fds {}..{}", min_fd, MAX_FDS);
    Ok((min_fd as RawFd, MAX_FDS as RawFd))
}

fn scrub_fds(vfs: &mut Vfs, index: usize) {
    for entry in vfs.fds.iter_mut() {
        if entry.is_some_and(|e| e.vfs_index == index) {
            *entry = None;
        }
    }
}

/// Removes the driver registered under `path_prefix`.
///
/// Also clears every descriptor-table entry still pointing at it, so no
/// descriptor can reach a driver after its unregistration. Fails with
/// [`VfsError::InvalidState`] when no such registration exists.
pub fn unregister(path_prefix: &str) -> Result<(), VfsError> {
    critical_section::with(|cs| {
        let mut vfs = VFS.borrow_ref_mut(cs);
        let found = vfs.drivers.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|r| !r.socket_space && r.prefix.as_str() == path_prefix)
        });
        let Some(index) = found else {
            return Err(VfsError::InvalidState);
        };
        vfs.drivers[index] = None;
        scrub_fds(&mut vfs, index);
        Ok(())
    })?;
    debug!("vfs: unregistered {}", path_prefix);
    Ok(())
}

/// Removes the socket-space registration and releases its descriptor range.
pub fn unregister_socket_space() -> Result<(), VfsError> {
    critical_section::with(|cs| {
        let mut vfs = VFS.borrow_ref_mut(cs);
        let found = vfs
            .drivers
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|r| r.socket_space));
        let Some(index) = found else {
            return Err(VfsError::InvalidState);
        };
        vfs.drivers[index] = None;
        scrub_fds(&mut vfs, index);
        Ok(())
    })
}

/// Takes a free global descriptor below the socket range. The socket range
/// itself is only ever populated in bulk by [`register_socket_space`].
fn allocate_fd(vfs: &mut Vfs, vfs_index: usize, local_fd: LocalFd) -> Option<RawFd> {
    let limit = MAX_FDS - SOCKET_FDS;
    let fd = vfs.fds[..limit].iter().position(Option::is_none)?;
    vfs.fds[fd] = Some(FdEntry {
        vfs_index,
        local_fd,
        permanent: false,
    });
    Some(fd as RawFd)
}

/// Maps a descriptor the driver minted itself into the global table.
///
/// This is how drivers whose descriptors do not come from [`open`] (the
/// pipe driver, for instance) hand them to callers. Fails with
/// [`VfsError::InvalidArgument`] when `id` does not name a live
/// registration, [`VfsError::NoMemory`] when the table is full.
pub fn register_fd(id: VfsId, local_fd: LocalFd) -> Result<RawFd, VfsError> {
    critical_section::with(|cs| {
        let mut vfs = VFS.borrow_ref_mut(cs);
        if vfs.drivers[id.0].is_none() {
            return Err(VfsError::InvalidArgument);
        }
        allocate_fd(&mut vfs, id.0, local_fd).ok_or(VfsError::NoMemory)
    })
}

/// Releases a descriptor previously mapped with [`register_fd`].
///
/// `fd` must currently belong to the registration named by `id`.
pub fn unregister_fd(id: VfsId, fd: RawFd) -> Result<(), VfsError> {
    let Ok(index) = usize::try_from(fd) else {
        return Err(VfsError::InvalidArgument);
    };
    critical_section::with(|cs| {
        let mut vfs = VFS.borrow_ref_mut(cs);
        let owned = matches!(
            vfs.fds.get(index),
            Some(Some(e)) if e.vfs_index == id.0 && !e.permanent
        );
        if !owned {
            return Err(VfsError::InvalidArgument);
        }
        vfs.fds[index] = None;
        Ok(())
    })
}

struct Resolved {
    index: usize,
    driver: &'static dyn VfsDriver,
    prefix_len: usize,
}

fn resolve_path(path: &str) -> VfsResult<Resolved> {
    critical_section::with(|cs| {
        let vfs = VFS.borrow_ref(cs);
        let mut best: Option<(usize, usize)> = None;
        for (index, slot) in vfs.drivers.iter().enumerate() {
            let Some(reg) = slot.as_ref() else { continue };
            if reg.socket_space {
                continue;
            }
            let prefix = reg.prefix.as_str();
            if !prefix_matches(prefix, path) {
                continue;
            }
            if best.is_none_or(|(_, len)| prefix.len() > len) {
                best = Some((index, prefix.len()));
            }
        }
        let (index, prefix_len) = best.ok_or(Errno::ENOENT)?;
        let driver = match vfs.drivers[index].as_ref() {
            Some(reg) => reg.driver,
            None => return Err(Errno::ENOENT),
        };
        Ok(Resolved {
            index,
            driver,
            prefix_len,
        })
    })
}

#[derive(Clone, Copy)]
struct Mapped {
    driver: &'static dyn VfsDriver,
    local_fd: LocalFd,
}

fn mapped(fd: RawFd) -> VfsResult<Mapped> {
    let index = usize::try_from(fd).map_err(|_| Errno::EBADF)?;
    if index >= MAX_FDS {
        return Err(Errno::EBADF);
    }
    critical_section::with(|cs| {
        let vfs = VFS.borrow_ref(cs);
        let entry = vfs.fds[index].ok_or(Errno::EBADF)?;
        let reg = vfs.drivers[entry.vfs_index].as_ref().ok_or(Errno::EBADF)?;
        Ok(Mapped {
            driver: reg.driver,
            local_fd: entry.local_fd,
        })
    })
}

fn driver_at(index: usize) -> VfsResult<&'static dyn VfsDriver> {
    critical_section::with(|cs| {
        let vfs = VFS.borrow_ref(cs);
        vfs.drivers[index]
            .as_ref()
            .map(|reg| reg.driver)
            .ok_or(Errno::EBADF)
    })
}

pub(crate) struct SelectTarget {
    pub(crate) index: usize,
    pub(crate) driver: &'static dyn VfsDriver,
    pub(crate) local_fd: LocalFd,
    pub(crate) socket_space: bool,
}

pub(crate) fn select_target(fd: RawFd) -> Option<SelectTarget> {
    let index = usize::try_from(fd).ok()?;
    if index >= MAX_FDS {
        return None;
    }
    critical_section::with(|cs| {
        let vfs = VFS.borrow_ref(cs);
        let entry = vfs.fds[index]?;
        let reg = vfs.drivers[entry.vfs_index].as_ref()?;
        Some(SelectTarget {
            index: entry.vfs_index,
            driver: reg.driver,
            local_fd: entry.local_fd,
            socket_space: reg.socket_space,
        })
    })
}

pub(crate) fn for_each_fd_of(index: usize, nfds: usize, mut f: impl FnMut(RawFd, LocalFd)) {
    critical_section::with(|cs| {
        let vfs = VFS.borrow_ref(cs);
        for fd in 0..nfds.min(MAX_FDS) {
            if let Some(entry) = vfs.fds[fd] {
                if entry.vfs_index == index {
                    f(fd as RawFd, entry.local_fd);
                }
            }
        }
    })
}

/// Opens `path` on the driver owning the longest matching prefix.
///
/// Fails with [`Errno::ENOENT`] when no registration matches and
/// [`Errno::ENOMEM`] when the descriptor table is full (the driver-local
/// descriptor is closed again in that case, nothing leaks).
pub fn open(path: &str, flags: i32, mode: i32) -> VfsResult<RawFd> {
    let resolved = resolve_path(path)?;
    let local_fd = resolved
        .driver
        .open(translated(path, resolved.prefix_len), flags, mode)?;
    let fd = critical_section::with(|cs| {
        let mut vfs = VFS.borrow_ref_mut(cs);
        allocate_fd(&mut vfs, resolved.index, local_fd)
    });
    match fd {
        Some(fd) => Ok(fd),
        None => {
            let _ = resolved.driver.close(local_fd);
            Err(Errno::ENOMEM)
        }
    }
}

/// Closes `fd`.
///
/// The table entry is released unconditionally before the driver runs, so
/// the descriptor is gone even when the driver reports an error; that error
/// still propagates. Socket-range descriptors are permanent and stay
/// mapped.
pub fn close(fd: RawFd) -> VfsResult<()> {
    let index = usize::try_from(fd).map_err(|_| Errno::EBADF)?;
    if index >= MAX_FDS {
        return Err(Errno::EBADF);
    }
    let target = critical_section::with(|cs| {
        let mut vfs = VFS.borrow_ref_mut(cs);
        let entry = vfs.fds[index].ok_or(Errno::EBADF)?;
        let reg = vfs.drivers[entry.vfs_index].as_ref().ok_or(Errno::EBADF)?;
        let driver = reg.driver;
        if !entry.permanent {
            vfs.fds[index] = None;
        }
        Ok(Mapped {
            driver,
            local_fd: entry.local_fd,
        })
    })?;
    target.driver.close(target.local_fd)
}

/// Reads from `fd` into `data`, returning the number of bytes read.
pub fn read(fd: RawFd, data: &mut [u8]) -> VfsResult<usize> {
    let target = mapped(fd)?;
    target.driver.read(target.local_fd, data)
}

/// Writes `data` to `fd`, returning the number of bytes written.
pub fn write(fd: RawFd, data: &[u8]) -> VfsResult<usize> {
    let target = mapped(fd)?;
    target.driver.write(target.local_fd, data)
}

/// Moves the file position of `fd`.
pub fn lseek(fd: RawFd, offset: i64, whence: Whence) -> VfsResult<i64> {
    let target = mapped(fd)?;
    target.driver.lseek(target.local_fd, offset, whence)
}

/// Reports metadata for the open descriptor `fd`.
pub fn fstat(fd: RawFd) -> VfsResult<FileStat> {
    let target = mapped(fd)?;
    target.driver.fstat(target.local_fd)
}

/// Reports metadata for `path`.
pub fn stat(path: &str) -> VfsResult<FileStat> {
    let resolved = resolve_path(path)?;
    resolved.driver.stat(translated(path, resolved.prefix_len))
}

/// Creates the name `new` for the existing file `old`.
///
/// Both paths must resolve to the same driver; [`Errno::EXDEV`] otherwise.
pub fn link(old: &str, new: &str) -> VfsResult<()> {
    let from = resolve_path(old)?;
    let to = resolve_path(new)?;
    if from.index != to.index {
        return Err(Errno::EXDEV);
    }
    from.driver
        .link(translated(old, from.prefix_len), translated(new, to.prefix_len))
}

/// Removes the name `path`.
pub fn unlink(path: &str) -> VfsResult<()> {
    let resolved = resolve_path(path)?;
    resolved
        .driver
        .unlink(translated(path, resolved.prefix_len))
}

/// Renames `old` to `new`.
///
/// Both paths must resolve to the same driver; [`Errno::EXDEV`] otherwise.
pub fn rename(old: &str, new: &str) -> VfsResult<()> {
    let from = resolve_path(old)?;
    let to = resolve_path(new)?;
    if from.index != to.index {
        return Err(Errno::EXDEV);
    }
    from.driver
        .rename(translated(old, from.prefix_len), translated(new, to.prefix_len))
}

/// Performs a driver-specific control operation on `fd`.
pub fn ioctl(fd: RawFd, cmd: i32, arg: i32) -> VfsResult<i32> {
    let target = mapped(fd)?;
    target.driver.ioctl(target.local_fd, cmd, arg)
}

/// Manipulates the descriptor flags of `fd`.
pub fn fcntl(fd: RawFd, cmd: i32, arg: i32) -> VfsResult<i32> {
    let target = mapped(fd)?;
    target.driver.fcntl(target.local_fd, cmd, arg)
}

/// Flushes buffered writes on `fd` to storage.
pub fn fsync(fd: RawFd) -> VfsResult<()> {
    let target = mapped(fd)?;
    target.driver.fsync(target.local_fd)
}

/// Opens the directory at `path`.
pub fn opendir(path: &str) -> VfsResult<Dir> {
    let resolved = resolve_path(path)?;
    let handle = resolved
        .driver
        .opendir(translated(path, resolved.prefix_len))?;
    Ok(Dir {
        index: resolved.index,
        handle,
    })
}

/// Reads the next entry of `dir`, `None` at the end of the stream.
pub fn readdir(dir: &Dir) -> VfsResult<Option<DirEntry>> {
    driver_at(dir.index)?.readdir(dir.handle)
}

/// Closes `dir` and releases the driver's stream state.
pub fn closedir(dir: Dir) -> VfsResult<()> {
    driver_at(dir.index)?.closedir(dir.handle)
}

#[cfg(test)]
mod tests {
    use esp_rtos_std as _;

    use super::*;

    #[test]
    fn prefix_validation() {
        assert!(validate_prefix("").is_ok());
        assert!(validate_prefix("/data").is_ok());
        assert_eq!(validate_prefix("data"), Err(VfsError::InvalidArgument));
        assert_eq!(validate_prefix("/data/"), Err(VfsError::InvalidArgument));
        assert_eq!(validate_prefix("/"), Err(VfsError::InvalidArgument));
        assert_eq!(
            validate_prefix("/a/very/long/prefix"),
            Err(VfsError::InvalidArgument)
        );
    }

    #[test]
    fn prefix_match_requires_component_boundary() {
        assert!(prefix_matches("/data", "/data"));
        assert!(prefix_matches("/data", "/data/log"));
        assert!(!prefix_matches("/data", "/data1/log"));
        assert!(!prefix_matches("/data", "/dat"));
        assert!(prefix_matches("", "/anything"));
    }

    #[test]
    fn translation_strips_the_matched_prefix() {
        assert_eq!(translated("/data/log", 5), "/log");
        assert_eq!(translated("/data", 5), "/");
        assert_eq!(translated("/anything", 0), "/anything");
    }

    #[test]
    fn errno_follows_newlib_numbering() {
        assert_eq!(Errno::EPERM.to_errno(), 1);
        assert_eq!(Errno::EBADF.to_errno(), 9);
        assert_eq!(Errno::EPIPE.to_errno(), 32);
        assert_eq!(Errno::ENOSYS.to_errno(), 88);
    }

    #[test]
    fn errno_displays_its_name() {
        assert_eq!(format!("{}", Errno::EPIPE), "EPIPE");
        assert_eq!(Errno::EAGAIN.name(), "EAGAIN");
    }
}
