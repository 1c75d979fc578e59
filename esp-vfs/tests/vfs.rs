//! Dispatch-layer tests: registration, prefix resolution, the descriptor
//! table and the select fan-out, exercised through small recording drivers.
//!
//! The registry is process-global, so every test takes `TEST_LOCK` and
//! removes its registrations before returning.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use esp_rtos_std as _;
use esp_vfs::{
    DirEntry, DirHandle, Errno, FdSet, FileKind, LocalFd, MAX_DRIVERS, MAX_FDS, SOCKET_FDS,
    SelectSets, SelectSignal, SelectToken, VfsDriver, VfsError, VfsResult, Whence, close, closedir,
    fcntl, fstat, fsync, ioctl, link, lseek, open, opendir, read, readdir, register, register_fd,
    register_socket_space, rename, select, stat, unlink, unregister, unregister_fd,
    unregister_socket_space, write,
};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    match TEST_LOCK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Driver that records what dispatch hands it.
struct Recorder {
    opens: Mutex<Vec<String>>,
    writes: Mutex<Vec<(LocalFd, Vec<u8>)>>,
    closes: AtomicUsize,
    next_fd: AtomicI32,
}

impl Recorder {
    const fn new() -> Self {
        Self {
            opens: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            next_fd: AtomicI32::new(0),
        }
    }
}

impl VfsDriver for Recorder {
    fn open(&self, path: &str, _flags: i32, _mode: i32) -> VfsResult<LocalFd> {
        self.opens.lock().unwrap().push(path.to_string());
        Ok(self.next_fd.fetch_add(1, Ordering::Relaxed))
    }

    fn close(&self, _fd: LocalFd) -> VfsResult<()> {
        self.closes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write(&self, fd: LocalFd, data: &[u8]) -> VfsResult<usize> {
        self.writes.lock().unwrap().push((fd, data.to_vec()));
        Ok(data.len())
    }

    fn read(&self, _fd: LocalFd, _data: &mut [u8]) -> VfsResult<usize> {
        Ok(0)
    }
}

#[test]
fn longest_prefix_wins_and_the_empty_prefix_is_the_fallback() {
    let _guard = lock();
    static DEV: Recorder = Recorder::new();
    static UART: Recorder = Recorder::new();
    static FALLBACK: Recorder = Recorder::new();

    register("/dev", &DEV).unwrap();
    register("/dev/uart", &UART).unwrap();

    let fd = open("/dev/uart/0", 0, 0).unwrap();
    assert_eq!(*UART.opens.lock().unwrap(), ["/0"]);
    assert!(DEV.opens.lock().unwrap().is_empty());
    close(fd).unwrap();

    let fd = open("/dev/other", 0, 0).unwrap();
    assert_eq!(*DEV.opens.lock().unwrap(), ["/other"]);
    close(fd).unwrap();

    // Opening the mount point itself hands the driver a root path.
    let fd = open("/dev/uart", 0, 0).unwrap();
    assert_eq!(*UART.opens.lock().unwrap(), ["/0", "/"]);
    close(fd).unwrap();

    // /dev does not claim /device: matches are whole components.
    assert_eq!(open("/device", 0, 0), Err(Errno::ENOENT));

    register("", &FALLBACK).unwrap();
    let fd = open("/device", 0, 0).unwrap();
    assert_eq!(*FALLBACK.opens.lock().unwrap(), ["/device"]);
    close(fd).unwrap();

    unregister("/dev").unwrap();
    unregister("/dev/uart").unwrap();
    unregister("").unwrap();
}

#[test]
fn registration_validates_prefixes() {
    let _guard = lock();
    static D: Recorder = Recorder::new();

    assert_eq!(register("data", &D), Err(VfsError::InvalidArgument));
    assert_eq!(register("/data/", &D), Err(VfsError::InvalidArgument));
    assert_eq!(register("/", &D), Err(VfsError::InvalidArgument));
    assert_eq!(
        register("/a/very/long/prefix", &D),
        Err(VfsError::InvalidArgument)
    );

    register("/data", &D).unwrap();
    assert_eq!(register("/data", &D), Err(VfsError::InvalidArgument));

    unregister("/data").unwrap();
    assert_eq!(unregister("/data"), Err(VfsError::InvalidState));
}

#[test]
fn registry_capacity_is_bounded() {
    let _guard = lock();
    static D: Recorder = Recorder::new();

    let mut prefixes = Vec::new();
    for i in 0..MAX_DRIVERS {
        let prefix = format!("/m{i}");
        register(&prefix, &D).unwrap();
        prefixes.push(prefix);
    }
    assert_eq!(register("/extra", &D), Err(VfsError::NoMemory));

    for prefix in &prefixes {
        unregister(prefix).unwrap();
    }
}

#[test]
fn unregister_revokes_outstanding_descriptors() {
    let _guard = lock();
    static D: Recorder = Recorder::new();

    register("/scrub", &D).unwrap();
    let a = open("/scrub/a", 0, 0).unwrap();
    let b = open("/scrub/b", 0, 0).unwrap();
    unregister("/scrub").unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(read(a, &mut buf), Err(Errno::EBADF));
    assert_eq!(write(b, b"x"), Err(Errno::EBADF));
    assert_eq!(close(a), Err(Errno::EBADF));
}

#[test]
fn descriptors_route_to_their_owning_driver() {
    let _guard = lock();
    static A: Recorder = Recorder::new();
    static B: Recorder = Recorder::new();

    register("/da", &A).unwrap();
    register("/db", &B).unwrap();
    let fa = open("/da/x", 0, 0).unwrap();
    let fb = open("/db/y", 0, 0).unwrap();

    write(fa, b"aa").unwrap();
    write(fb, b"bb").unwrap();
    assert_eq!(*A.writes.lock().unwrap(), [(0, b"aa".to_vec())]);
    assert_eq!(*B.writes.lock().unwrap(), [(0, b"bb".to_vec())]);

    close(fa).unwrap();
    close(fb).unwrap();
    assert_eq!(A.closes.load(Ordering::Relaxed), 1);
    let mut buf = [0u8; 1];
    assert_eq!(read(fa, &mut buf), Err(Errno::EBADF));

    unregister("/da").unwrap();
    unregister("/db").unwrap();
}

#[test]
fn unimplemented_operations_fail_with_enosys() {
    let _guard = lock();
    static D: Recorder = Recorder::new();

    register("/no", &D).unwrap();
    let fd = open("/no/x", 0, 0).unwrap();

    assert_eq!(lseek(fd, 4, Whence::Start), Err(Errno::ENOSYS));
    assert_eq!(ioctl(fd, 1, 0), Err(Errno::ENOSYS));
    assert_eq!(fcntl(fd, esp_vfs::F_GETFL, 0), Err(Errno::ENOSYS));
    assert_eq!(fsync(fd), Err(Errno::ENOSYS));
    assert_eq!(fstat(fd), Err(Errno::ENOSYS));
    assert_eq!(stat("/no/x"), Err(Errno::ENOSYS));
    assert_eq!(unlink("/no/x"), Err(Errno::ENOSYS));
    match opendir("/no/dir") {
        Err(Errno::ENOSYS) => {}
        other => panic!("expected ENOSYS, got {other:?}"),
    }

    close(fd).unwrap();
    unregister("/no").unwrap();
}

#[test]
fn unknown_descriptors_are_rejected() {
    let _guard = lock();
    let mut buf = [0u8; 1];
    assert_eq!(read(-1, &mut buf), Err(Errno::EBADF));
    assert_eq!(write(9999, b"x"), Err(Errno::EBADF));
    assert_eq!(close(MAX_FDS as i32), Err(Errno::EBADF));
    // In range but never handed out.
    assert_eq!(read(10, &mut buf), Err(Errno::EBADF));
}

#[test]
fn socket_space_claims_the_top_descriptor_range() {
    let _guard = lock();
    static SOCK: Recorder = Recorder::new();

    let (first, end) = register_socket_space(&SOCK).unwrap();
    assert_eq!(first as usize, MAX_FDS - SOCKET_FDS);
    assert_eq!(end as usize, MAX_FDS);

    // Identity mapping: the driver sees the global value as its local fd.
    write(first, b"s").unwrap();
    assert_eq!(*SOCK.writes.lock().unwrap(), [(first, b"s".to_vec())]);

    // Socket entries are permanent; close reaches the driver but the
    // mapping survives.
    close(first).unwrap();
    assert_eq!(SOCK.closes.load(Ordering::Relaxed), 1);
    write(first, b"t").unwrap();

    assert_eq!(register_socket_space(&SOCK), Err(VfsError::InvalidState));

    unregister_socket_space().unwrap();
    assert_eq!(write(first, b"u"), Err(Errno::EBADF));
    assert_eq!(unregister_socket_space(), Err(VfsError::InvalidState));
}

#[test]
fn open_rolls_back_when_the_table_is_full() {
    let _guard = lock();
    static D: Recorder = Recorder::new();

    register("/full", &D).unwrap();
    let mut fds = Vec::new();
    for _ in 0..(MAX_FDS + 1) {
        match open("/full/x", 0, 0) {
            Ok(fd) => fds.push(fd),
            Err(err) => {
                assert_eq!(err, Errno::ENOMEM);
                break;
            }
        }
    }
    // The socket range is never handed out by open().
    assert_eq!(fds.len(), MAX_FDS - SOCKET_FDS);
    // The rejected open closed its driver-local descriptor again.
    assert_eq!(D.closes.load(Ordering::Relaxed), 1);

    for fd in fds {
        close(fd).unwrap();
    }
    unregister("/full").unwrap();
}

/// Driver recording path-pair operations.
struct Renamer {
    renames: Mutex<Vec<(String, String)>>,
    links: Mutex<Vec<(String, String)>>,
}

impl Renamer {
    const fn new() -> Self {
        Self {
            renames: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
        }
    }
}

impl VfsDriver for Renamer {
    fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        self.renames
            .lock()
            .unwrap()
            .push((old.to_string(), new.to_string()));
        Ok(())
    }

    fn link(&self, old: &str, new: &str) -> VfsResult<()> {
        self.links
            .lock()
            .unwrap()
            .push((old.to_string(), new.to_string()));
        Ok(())
    }
}

#[test]
fn path_pair_operations_stay_within_one_driver() {
    let _guard = lock();
    static A: Renamer = Renamer::new();
    static B: Renamer = Renamer::new();

    register("/ra", &A).unwrap();
    register("/rb", &B).unwrap();

    assert_eq!(link("/ra/x", "/rb/y"), Err(Errno::EXDEV));
    assert_eq!(rename("/ra/x", "/rb/y"), Err(Errno::EXDEV));
    assert!(A.renames.lock().unwrap().is_empty());

    rename("/ra/x", "/ra/y").unwrap();
    assert_eq!(
        *A.renames.lock().unwrap(),
        [("/x".to_string(), "/y".to_string())]
    );
    link("/ra/x", "/ra/z").unwrap();
    assert_eq!(
        *A.links.lock().unwrap(),
        [("/x".to_string(), "/z".to_string())]
    );

    unregister("/ra").unwrap();
    unregister("/rb").unwrap();
}

#[test]
fn drivers_can_mint_descriptors_directly() {
    let _guard = lock();
    static D: Recorder = Recorder::new();

    let id = register("/mint", &D).unwrap();
    let fd = register_fd(id, 33).unwrap();
    assert!((fd as usize) < MAX_FDS - SOCKET_FDS);

    write(fd, b"m").unwrap();
    assert_eq!(*D.writes.lock().unwrap(), [(33, b"m".to_vec())]);

    unregister_fd(id, fd).unwrap();
    assert_eq!(write(fd, b"m"), Err(Errno::EBADF));
    assert_eq!(unregister_fd(id, fd), Err(VfsError::InvalidArgument));

    unregister("/mint").unwrap();
    assert_eq!(register_fd(id, 1), Err(VfsError::InvalidArgument));
}

/// Driver with a two-entry directory listing.
struct Lister {
    cursor: AtomicUsize,
}

impl VfsDriver for Lister {
    fn opendir(&self, path: &str) -> VfsResult<DirHandle> {
        assert_eq!(path, "/logs");
        self.cursor.store(0, Ordering::Relaxed);
        Ok(DirHandle(7))
    }

    fn readdir(&self, dir: DirHandle) -> VfsResult<Option<DirEntry>> {
        assert_eq!(dir, DirHandle(7));
        let names = ["boot.log", "net.log"];
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(names.get(index).map(|name| DirEntry {
            name: heapless::String::try_from(*name).unwrap(),
            kind: FileKind::File,
        }))
    }

    fn closedir(&self, dir: DirHandle) -> VfsResult<()> {
        assert_eq!(dir, DirHandle(7));
        Ok(())
    }
}

#[test]
fn directory_streams_dispatch_through_their_driver() {
    let _guard = lock();
    static L: Lister = Lister {
        cursor: AtomicUsize::new(0),
    };

    register("/sd", &L).unwrap();
    let dir = opendir("/sd/logs").unwrap();
    let first = readdir(&dir).unwrap().unwrap();
    assert_eq!(first.name.as_str(), "boot.log");
    assert_eq!(first.kind, FileKind::File);
    let second = readdir(&dir).unwrap().unwrap();
    assert_eq!(second.name.as_str(), "net.log");
    assert!(readdir(&dir).unwrap().is_none());
    closedir(dir).unwrap();

    unregister("/sd").unwrap();
}

/// Select hooks that record being started and ended.
struct SpySelect {
    started: AtomicUsize,
    ended: AtomicUsize,
}

impl VfsDriver for SpySelect {
    fn open(&self, _path: &str, _flags: i32, _mode: i32) -> VfsResult<LocalFd> {
        Ok(5)
    }

    fn close(&self, _fd: LocalFd) -> VfsResult<()> {
        Ok(())
    }

    fn start_select(
        &self,
        _interest: &SelectSets,
        _signal: SelectSignal,
        _token: SelectToken,
    ) -> VfsResult<()> {
        self.started.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn end_select(&self, _token: SelectToken, _ready: &mut SelectSets) -> VfsResult<()> {
        self.ended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Select hooks that refuse to start.
struct FailingSelect;

impl VfsDriver for FailingSelect {
    fn open(&self, _path: &str, _flags: i32, _mode: i32) -> VfsResult<LocalFd> {
        Ok(9)
    }

    fn close(&self, _fd: LocalFd) -> VfsResult<()> {
        Ok(())
    }

    fn start_select(
        &self,
        _interest: &SelectSets,
        _signal: SelectSignal,
        _token: SelectToken,
    ) -> VfsResult<()> {
        Err(Errno::EIO)
    }
}

#[test]
fn select_unwinds_started_drivers_when_one_fails() {
    let _guard = lock();
    static SPY: SpySelect = SpySelect {
        started: AtomicUsize::new(0),
        ended: AtomicUsize::new(0),
    };
    static FLAKY: FailingSelect = FailingSelect;

    register("/spy", &SPY).unwrap();
    register("/flaky", &FLAKY).unwrap();
    let sfd = open("/spy/x", 0, 0).unwrap();
    let ffd = open("/flaky/x", 0, 0).unwrap();
    assert!(sfd < ffd);

    let mut read_set = FdSet::new();
    read_set.set(sfd);
    read_set.set(ffd);
    let mut write_set = FdSet::new();
    let mut error_set = FdSet::new();
    let nfds = ffd as usize + 1;
    assert_eq!(
        select(nfds, &mut read_set, &mut write_set, &mut error_set, Some(1_000)),
        Err(Errno::EIO)
    );
    // The spy was started before the failure and unwound afterwards.
    assert_eq!(SPY.started.load(Ordering::Relaxed), 1);
    assert_eq!(SPY.ended.load(Ordering::Relaxed), 1);

    close(sfd).unwrap();
    close(ffd).unwrap();
    unregister("/spy").unwrap();
    unregister("/flaky").unwrap();
}

#[test]
fn select_needs_driver_support() {
    let _guard = lock();
    static D: Recorder = Recorder::new();

    register("/plain", &D).unwrap();
    let fd = open("/plain/x", 0, 0).unwrap();

    let mut read_set = FdSet::new();
    read_set.set(fd);
    let mut write_set = FdSet::new();
    let mut error_set = FdSet::new();
    assert_eq!(
        select(fd as usize + 1, &mut read_set, &mut write_set, &mut error_set, Some(1_000)),
        Err(Errno::ENOSYS)
    );

    close(fd).unwrap();
    unregister("/plain").unwrap();
}

/// Socket stack whose `socket_select` reports the first watched read
/// descriptor as ready.
struct SocketStack {
    calls: AtomicUsize,
}

impl VfsDriver for SocketStack {
    fn socket_select(
        &self,
        sets: &mut SelectSets,
        timeout_us: Option<u64>,
        _signal: SelectSignal,
    ) -> VfsResult<usize> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        assert_eq!(timeout_us, Some(5_000));
        let ready = sets.read.iter().next();
        let mut out = SelectSets::new();
        if let Some(fd) = ready {
            out.read.set(fd);
        }
        *sets = out;
        Ok(if ready.is_some() { 1 } else { 0 })
    }
}

#[test]
fn select_delegates_socket_descriptors_to_the_socket_space() {
    let _guard = lock();
    static STACK: SocketStack = SocketStack {
        calls: AtomicUsize::new(0),
    };

    let (first, _end) = register_socket_space(&STACK).unwrap();
    let mut read_set = FdSet::new();
    read_set.set(first);
    let mut write_set = FdSet::new();
    let mut error_set = FdSet::new();
    let n = select(
        first as usize + 1,
        &mut read_set,
        &mut write_set,
        &mut error_set,
        Some(5_000),
    )
    .unwrap();
    assert_eq!(n, 1);
    assert!(read_set.is_set(first));
    assert_eq!(STACK.calls.load(Ordering::Relaxed), 1);

    unregister_socket_space().unwrap();
}
