//! Anonymous pipes.
//!
//! [`register`] plugs the driver into the VFS under `/dev/pipe`; [`pipe`]
//! then mints connected read/write descriptor pairs out of a fixed pool of
//! slots. Data moves by rendezvous instead of through a kernel buffer: a
//! writer publishes its caller's buffer and parks until readers have
//! drained every byte, so a completed [`write`](crate::write) means the
//! payload was fully consumed and nothing is ever copied twice.
//!
//! One writer at a time: a second writer on the same pipe fails with
//! [`Errno::EBUSY`] while a hand-off is in flight. Closing either end
//! discards any in-flight buffer, fails parked peers with
//! [`Errno::EPIPE`] and wakes pending [`select`](crate::select()) calls.

use core::cell::RefCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use critical_section::{CriticalSection, Mutex};
use esp_config::esp_config_int_parse;
use esp_rtos_driver::{
    current_task_thread_semaphore,
    semaphore::{SemaphoreHandle, SemaphorePtr},
};

use crate::{
    Errno, F_GETFL, F_SETFL, LocalFd, O_NONBLOCK, RawFd, SelectSets, SelectSignal, SelectToken,
    VfsDriver, VfsError, VfsResult,
};

/// Number of pipes that can exist at once (`ESP_VFS_PIPE_COUNT`).
pub const PIPE_COUNT: usize = esp_config::esp_config_int!(usize, "ESP_VFS_PIPE_COUNT");

/// Size of the watcher pool behind the driver's select hooks
/// (`ESP_VFS_SELECT_WATCHERS`).
pub const SELECT_WATCHERS: usize = esp_config::esp_config_int!(usize, "ESP_VFS_SELECT_WATCHERS");

const _: () = {
    assert!(PIPE_COUNT >= 1, "the pipe pool needs at least one slot");
    assert!(
        2 * PIPE_COUNT <= crate::MAX_FDS,
        "pipe descriptors must fit the descriptor sets used by select()"
    );
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum End {
    Read,
    Write,
}

/// Slot index plus end bit, packed into the driver-local descriptor. The
/// encoding is private: callers only ever see the opaque [`RawFd`] values
/// minted by [`pipe`].
#[derive(Clone, Copy)]
struct PipeFd {
    slot: usize,
    end: End,
}

impl PipeFd {
    fn decode(fd: LocalFd) -> Option<Self> {
        let value = usize::try_from(fd).ok()?;
        let slot = value >> 1;
        if slot >= PIPE_COUNT {
            return None;
        }
        let end = if value & 1 == 0 { End::Read } else { End::Write };
        Some(Self { slot, end })
    }

    fn encode(self) -> LocalFd {
        let end_bit = match self.end {
            End::Read => 0,
            End::Write => 1,
        };
        ((self.slot << 1) | end_bit) as LocalFd
    }
}

/// A task parked in `read` or `write`, identified by its thread
/// notification semaphore. The semaphore lives as long as the task.
struct Parked(SemaphorePtr);

unsafe impl Send for Parked {}

impl Parked {
    fn wake(self) {
        unsafe { SemaphoreHandle::ref_from_ptr(&self.0) }.give();
    }
}

struct Pipe {
    in_use: bool,
    read_open: bool,
    write_open: bool,
    read_flags: i32,
    write_flags: i32,
    // In-flight buffer published by the parked writer, kept as an
    // address/length pair. Only read() dereferences it, under the slot's
    // critical section, while the writer still pins the memory.
    data: usize,
    data_len: usize,
    reader: Option<Parked>,
    writer: Option<Parked>,
}

impl Pipe {
    const fn idle() -> Self {
        Self {
            in_use: false,
            read_open: false,
            write_open: false,
            read_flags: 0,
            write_flags: 0,
            data: 0,
            data_len: 0,
            reader: None,
            writer: None,
        }
    }
}

static PIPES: [Mutex<RefCell<Pipe>>; PIPE_COUNT] =
    [const { Mutex::new(RefCell::new(Pipe::idle())) }; PIPE_COUNT];

#[derive(Clone, Copy)]
struct Watcher {
    fd: PipeFd,
    token: SelectToken,
    read: bool,
    write: bool,
    error: bool,
    signal: SelectSignal,
}

static WATCHERS: Mutex<RefCell<[Option<Watcher>; SELECT_WATCHERS]>> =
    Mutex::new(RefCell::new([None; SELECT_WATCHERS]));

/// Registry index of the pipe driver, `usize::MAX` until [`register`] runs.
static PIPE_VFS_ID: AtomicUsize = AtomicUsize::new(usize::MAX);

static DRIVER: PipeDriver = PipeDriver;

/// Registers the pipe driver with the VFS under `/dev/pipe`.
pub fn register() -> Result<(), VfsError> {
    let id = crate::register("/dev/pipe", &DRIVER)?;
    PIPE_VFS_ID.store(id.0, Ordering::Relaxed);
    debug!("pipe: driver registered");
    Ok(())
}

fn mint_error(err: VfsError) -> Errno {
    match err {
        VfsError::NoMemory => Errno::ENOMEM,
        _ => Errno::EPERM,
    }
}

/// Creates a pipe and returns `(read_fd, write_fd)`.
///
/// Fails with [`Errno::EPERM`] until [`register`] has run,
/// [`Errno::ENFILE`] when all [`PIPE_COUNT`] slots are taken and
/// [`Errno::ENOMEM`] when the global descriptor table is full. Both ends
/// start blocking; switch with
/// [`fcntl(fd, F_SETFL, O_NONBLOCK)`](crate::fcntl).
pub fn pipe() -> VfsResult<(RawFd, RawFd)> {
    let id = PIPE_VFS_ID.load(Ordering::Relaxed);
    if id == usize::MAX {
        return Err(Errno::EPERM);
    }
    let id = crate::VfsId(id);

    let Some(slot) = claim_slot() else {
        return Err(Errno::ENFILE);
    };
    let read_end = PipeFd {
        slot,
        end: End::Read,
    };
    let write_end = PipeFd {
        slot,
        end: End::Write,
    };

    let read_fd = match crate::register_fd(id, read_end.encode()) {
        Ok(fd) => fd,
        Err(err) => {
            release_slot(slot);
            return Err(mint_error(err));
        }
    };
    let write_fd = match crate::register_fd(id, write_end.encode()) {
        Ok(fd) => fd,
        Err(err) => {
            let _ = crate::unregister_fd(id, read_fd);
            release_slot(slot);
            return Err(mint_error(err));
        }
    };
    debug!("pipe: slot {} open as fds {}/{}", slot, read_fd, write_fd);
    Ok((read_fd, write_fd))
}

fn claim_slot() -> Option<usize> {
    for (slot, pipe) in PIPES.iter().enumerate() {
        let claimed = critical_section::with(|cs| {
            let mut pipe = pipe.borrow_ref_mut(cs);
            if pipe.in_use {
                return false;
            }
            *pipe = Pipe::idle();
            pipe.in_use = true;
            pipe.read_open = true;
            pipe.write_open = true;
            true
        });
        if claimed {
            return Some(slot);
        }
    }
    None
}

fn release_slot(slot: usize) {
    critical_section::with(|cs| {
        *PIPES[slot].borrow_ref_mut(cs) = Pipe::idle();
    });
}

fn park() {
    let sem = current_task_thread_semaphore();
    unsafe { SemaphoreHandle::ref_from_ptr(&sem) }.take(None);
}

enum ReadStep {
    Done(usize, Option<Parked>),
    Park,
}

fn read_impl(fd: PipeFd, data: &mut [u8]) -> VfsResult<usize> {
    loop {
        let step = critical_section::with(|cs| {
            let mut pipe = PIPES[fd.slot].borrow_ref_mut(cs);
            if !pipe.in_use {
                return Err(Errno::EBADF);
            }
            if !pipe.read_open || !pipe.write_open {
                return Err(Errno::EPIPE);
            }
            if data.is_empty() {
                return Ok(ReadStep::Done(0, None));
            }
            if pipe.data_len > 0 {
                // Drain under the lock; the writer stays parked until the
                // buffer is empty, so the memory is still pinned.
                let n = data.len().min(pipe.data_len);
                let source =
                    unsafe { core::slice::from_raw_parts(pipe.data as *const u8, pipe.data_len) };
                data[..n].copy_from_slice(&source[..n]);
                pipe.data += n;
                pipe.data_len -= n;
                let writer = if pipe.data_len == 0 {
                    pipe.data = 0;
                    pipe.writer.take()
                } else {
                    None
                };
                return Ok(ReadStep::Done(n, writer));
            }
            if pipe.read_flags & O_NONBLOCK != 0 {
                return Err(Errno::EAGAIN);
            }
            let me = current_task_thread_semaphore();
            match &pipe.reader {
                // A stale wake-up left our own park entry behind; keep it.
                Some(parked) if parked.0 == me => {}
                Some(_) => return Err(Errno::EBUSY),
                None => pipe.reader = Some(Parked(me)),
            }
            Ok(ReadStep::Park)
        })?;

        match step {
            ReadStep::Done(n, writer) => {
                if let Some(writer) = writer {
                    writer.wake();
                }
                return Ok(n);
            }
            ReadStep::Park => park(),
        }
    }
}

enum WriteStep {
    Empty,
    Published(Option<Parked>),
}

fn write_impl(fd: PipeFd, data: &[u8]) -> VfsResult<usize> {
    let step = critical_section::with(|cs| {
        let mut pipe = PIPES[fd.slot].borrow_ref_mut(cs);
        if !pipe.in_use {
            return Err(Errno::EBADF);
        }
        if !pipe.read_open || !pipe.write_open {
            return Err(Errno::EPIPE);
        }
        if pipe.data_len > 0 || pipe.writer.is_some() {
            // Single-writer hand-off; concurrent writers are an error, not
            // a queue.
            return Err(Errno::EBUSY);
        }
        if data.is_empty() {
            return Ok(WriteStep::Empty);
        }
        if pipe.write_flags & O_NONBLOCK != 0 && pipe.reader.is_none() {
            return Err(Errno::EAGAIN);
        }
        pipe.data = data.as_ptr() as usize;
        pipe.data_len = data.len();
        pipe.writer = Some(Parked(current_task_thread_semaphore()));
        Ok(WriteStep::Published(pipe.reader.take()))
    })?;

    let reader = match step {
        WriteStep::Empty => return Ok(0),
        WriteStep::Published(reader) => reader,
    };
    if let Some(reader) = reader {
        reader.wake();
    }
    notify_watchers(fd.slot);

    // The publication pins `data` until the final read or a close clears
    // it; park until our writer entry is gone.
    let me = current_task_thread_semaphore();
    loop {
        park();
        let outcome = critical_section::with(|cs| {
            let pipe = PIPES[fd.slot].borrow_ref(cs);
            if !pipe.in_use || !pipe.read_open || !pipe.write_open {
                // close() already discarded the buffer.
                return Some(Err(Errno::EPIPE));
            }
            match &pipe.writer {
                Some(parked) if parked.0 == me => None,
                // Our entry was taken by the drain; the slot may already
                // belong to the next writer.
                _ => Some(Ok(data.len())),
            }
        });
        if let Some(result) = outcome {
            return result;
        }
    }
}

fn close_impl(fd: PipeFd) -> VfsResult<()> {
    let (reader, writer, released) = critical_section::with(|cs| {
        let mut pipe = PIPES[fd.slot].borrow_ref_mut(cs);
        if !pipe.in_use {
            return Err(Errno::EBADF);
        }
        match fd.end {
            End::Read => {
                if !pipe.read_open {
                    return Err(Errno::EBADF);
                }
                pipe.read_open = false;
            }
            End::Write => {
                if !pipe.write_open {
                    return Err(Errno::EBADF);
                }
                pipe.write_open = false;
            }
        }
        // The in-flight buffer borrows the parked writer's frame; drop it
        // before anybody wakes.
        pipe.data = 0;
        pipe.data_len = 0;
        let reader = pipe.reader.take();
        let writer = pipe.writer.take();
        let released = !pipe.read_open && !pipe.write_open;
        if released {
            pipe.in_use = false;
        }
        Ok((reader, writer, released))
    })?;

    if released {
        debug!("pipe: slot {} released", fd.slot);
    }
    if let Some(reader) = reader {
        reader.wake();
    }
    if let Some(writer) = writer {
        writer.wake();
    }
    notify_watchers(fd.slot);
    Ok(())
}

fn fcntl_impl(fd: PipeFd, cmd: i32, arg: i32) -> VfsResult<i32> {
    critical_section::with(|cs| {
        let mut pipe = PIPES[fd.slot].borrow_ref_mut(cs);
        if !pipe.in_use {
            return Err(Errno::EBADF);
        }
        let open = match fd.end {
            End::Read => pipe.read_open,
            End::Write => pipe.write_open,
        };
        if !open {
            return Err(Errno::EBADF);
        }
        let flags = match fd.end {
            End::Read => &mut pipe.read_flags,
            End::Write => &mut pipe.write_flags,
        };
        match cmd {
            F_GETFL => Ok(*flags),
            F_SETFL => {
                *flags = arg;
                Ok(0)
            }
            _ => Err(Errno::EINVAL),
        }
    })
}

#[derive(Clone, Copy)]
struct Ready {
    read: bool,
    write: bool,
    error: bool,
}

fn pipe_readiness(cs: CriticalSection<'_>, fd: PipeFd) -> Ready {
    let pipe = PIPES[fd.slot].borrow_ref(cs);
    if !pipe.in_use {
        return Ready {
            read: false,
            write: true,
            error: true,
        };
    }
    Ready {
        // Probing the write end for readability always succeeds: the
        // caller may observe its own writes.
        read: pipe.data_len > 0 || matches!(fd.end, End::Write),
        // Writes never buffer; readiness is unconditional and EBUSY is
        // enforced by write() itself.
        write: true,
        error: !pipe.read_open || !pipe.write_open,
    }
}

fn notify_watchers(slot: usize) {
    let mut signals: heapless::Vec<SelectSignal, SELECT_WATCHERS> = heapless::Vec::new();
    critical_section::with(|cs| {
        let pool = WATCHERS.borrow_ref(cs);
        for watcher in pool.iter().flatten() {
            if watcher.fd.slot == slot {
                let _ = signals.push(watcher.signal);
            }
        }
    });
    for signal in signals.iter() {
        signal.raise();
    }
}

fn start_select_impl(
    interest: &SelectSets,
    signal: SelectSignal,
    token: SelectToken,
) -> VfsResult<()> {
    let mut immediate = false;
    critical_section::with(|cs| {
        let mut pool = WATCHERS.borrow_ref_mut(cs);
        for local in 0..(2 * PIPE_COUNT) as LocalFd {
            let read = interest.read.is_set(local);
            let write = interest.write.is_set(local);
            let error = interest.error.is_set(local);
            if !(read || write || error) {
                continue;
            }
            let Some(fd) = PipeFd::decode(local) else {
                continue;
            };
            let Some(free) = pool.iter().position(Option::is_none) else {
                // Watchers are all-or-nothing per call; drop the ones we
                // already placed.
                for node in pool.iter_mut() {
                    if node.is_some_and(|w| w.token == token) {
                        *node = None;
                    }
                }
                return Err(Errno::ENOMEM);
            };
            pool[free] = Some(Watcher {
                fd,
                token,
                read,
                write,
                error,
                signal,
            });
            let now = pipe_readiness(cs, fd);
            if (read && now.read) || (write && now.write) || (error && now.error) {
                immediate = true;
            }
        }
        Ok(())
    })?;
    if immediate {
        signal.raise();
    }
    Ok(())
}

fn end_select_impl(token: SelectToken, ready: &mut SelectSets) -> VfsResult<()> {
    critical_section::with(|cs| {
        let mut pool = WATCHERS.borrow_ref_mut(cs);
        for node in pool.iter_mut() {
            let Some(watcher) = *node else { continue };
            if watcher.token != token {
                continue;
            }
            let now = pipe_readiness(cs, watcher.fd);
            let local = watcher.fd.encode();
            if watcher.read && now.read {
                ready.read.set(local);
            }
            if watcher.write && now.write {
                ready.write.set(local);
            }
            if watcher.error && now.error {
                ready.error.set(local);
            }
            *node = None;
        }
        Ok(())
    })
}

struct PipeDriver;

impl VfsDriver for PipeDriver {
    fn read(&self, fd: LocalFd, data: &mut [u8]) -> VfsResult<usize> {
        let fd = PipeFd::decode(fd).ok_or(Errno::EBADF)?;
        if fd.end != End::Read {
            return Err(Errno::EBADF);
        }
        read_impl(fd, data)
    }

    fn write(&self, fd: LocalFd, data: &[u8]) -> VfsResult<usize> {
        let fd = PipeFd::decode(fd).ok_or(Errno::EBADF)?;
        if fd.end != End::Write {
            return Err(Errno::EBADF);
        }
        write_impl(fd, data)
    }

    fn close(&self, fd: LocalFd) -> VfsResult<()> {
        let fd = PipeFd::decode(fd).ok_or(Errno::EBADF)?;
        close_impl(fd)
    }

    fn fcntl(&self, fd: LocalFd, cmd: i32, arg: i32) -> VfsResult<i32> {
        let fd = PipeFd::decode(fd).ok_or(Errno::EBADF)?;
        fcntl_impl(fd, cmd, arg)
    }

    fn start_select(
        &self,
        interest: &SelectSets,
        signal: SelectSignal,
        token: SelectToken,
    ) -> VfsResult<()> {
        start_select_impl(interest, signal, token)
    }

    fn end_select(&self, token: SelectToken, ready: &mut SelectSets) -> VfsResult<()> {
        end_select_impl(token, ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_encoding_round_trips() {
        for slot in 0..PIPE_COUNT {
            for end in [End::Read, End::Write] {
                let fd = PipeFd { slot, end };
                let decoded = PipeFd::decode(fd.encode()).unwrap();
                assert_eq!(decoded.slot, slot);
                assert_eq!(decoded.end == End::Write, end == End::Write);
            }
        }
    }

    #[test]
    fn decode_rejects_foreign_descriptors() {
        assert!(PipeFd::decode(-1).is_none());
        assert!(PipeFd::decode((2 * PIPE_COUNT) as LocalFd).is_none());
    }

    #[test]
    fn write_end_is_odd() {
        let fd = PipeFd {
            slot: 3,
            end: End::Write,
        };
        assert_eq!(fd.encode(), 7);
        let fd = PipeFd {
            slot: 3,
            end: End::Read,
        };
        assert_eq!(fd.encode(), 6);
    }
}
