//! POSIX-backed environment: buffered file I/O, mmap-or-`pread` random
//! access behind resource limiters, `fcntl` advisory locks with a
//! process-local lock table, and a single lazily-spawned background worker.

use std::collections::{HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use memmap2::Mmap;

use crate::config::EnvConfig;
use crate::env::{Env, FileLock, Logger, RandomAccessFile, SequentialFile, WritableFile};
use crate::error::{Error, Result};

/// Caps concurrent use of a resource. Acquisition never blocks; callers
/// fall back to a cheaper strategy when the limiter is exhausted.
struct Limiter {
    allowed: AtomicIsize,
}

impl Limiter {
    fn new(allowed: isize) -> Limiter {
        Limiter {
            allowed: AtomicIsize::new(allowed),
        }
    }

    fn acquire(&self) -> bool {
        let prev = self.allowed.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            self.allowed.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn release(&self) {
        self.allowed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Up to 1000 concurrent maps on 64-bit targets, none on smaller pointers.
fn default_mmap_limit() -> isize {
    if std::mem::size_of::<usize>() >= 8 {
        1000
    } else {
        0
    }
}

/// 20% of the soft file-descriptor limit may be pinned by long-lived
/// read-only files.
fn default_fd_limit() -> isize {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        return 50;
    }
    if rlim.rlim_cur == libc::RLIM_INFINITY {
        return isize::MAX;
    }
    (rlim.rlim_cur / 5) as isize
}

struct PosixSequentialFile {
    path: PathBuf,
    file: File,
}

impl SequentialFile for PosixSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.file.read(buf).map_err(|e| Error::io(&self.path, e))
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Current(n as i64))
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(())
    }
}

fn pread_full(file: &File, path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io(path, e)),
        }
    }
    Ok(total)
}

/// `pread`-backed reader. Holds its descriptor for the life of the object
/// when the descriptor budget allows, otherwise reopens on every read.
struct PosixRandomAccessFile {
    path: PathBuf,
    file: Option<File>,
    limiter: Arc<Limiter>,
}

impl PosixRandomAccessFile {
    fn new(path: PathBuf, file: File, limiter: Arc<Limiter>) -> PosixRandomAccessFile {
        let file = if limiter.acquire() { Some(file) } else { None };
        PosixRandomAccessFile {
            path,
            file,
            limiter,
        }
    }
}

impl RandomAccessFile for PosixRandomAccessFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match &self.file {
            Some(file) => pread_full(file, &self.path, offset, buf),
            None => {
                let file = File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
                pread_full(&file, &self.path, offset, buf)
            }
        }
    }
}

impl Drop for PosixRandomAccessFile {
    fn drop(&mut self) {
        if self.file.is_some() {
            self.limiter.release();
        }
    }
}

/// Memory-mapped reader; the kernel makes concurrent reads safe.
struct PosixMmapFile {
    map: Mmap,
    limiter: Arc<Limiter>,
}

impl RandomAccessFile for PosixMmapFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.map.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.map.len() - offset);
        buf[..n].copy_from_slice(&self.map[offset..offset + n]);
        Ok(n)
    }
}

impl Drop for PosixMmapFile {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[derive(Debug)]
struct PosixWritableFile {
    path: PathBuf,
    /// `None` once closed.
    writer: Option<BufWriter<File>>,
}

impl PosixWritableFile {
    fn new(path: PathBuf, file: File) -> PosixWritableFile {
        PosixWritableFile {
            path,
            writer: Some(BufWriter::new(file)),
        }
    }

    fn closed_error(path: &Path) -> Error {
        Error::IO(format!("{}: file is closed", path.display()))
    }

    /// MANIFEST files name the live version set; syncing one also syncs the
    /// directory so the filename itself is durable.
    fn sync_dir_if_manifest(&self) -> Result<()> {
        let is_manifest = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("MANIFEST"));
        if !is_manifest {
            return Ok(());
        }
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let handle = File::open(dir).map_err(|e| Error::io(dir, e))?;
        handle.sync_all().map_err(|e| Error::io(dir, e))
    }
}

impl WritableFile for PosixWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Self::closed_error(&self.path))?;
        writer.write_all(data).map_err(|e| Error::io(&self.path, e))
    }

    fn flush(&mut self) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Self::closed_error(&self.path))?;
        writer.flush().map_err(|e| Error::io(&self.path, e))
    }

    fn sync(&mut self) -> Result<()> {
        self.sync_dir_if_manifest()?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Self::closed_error(&self.path))?;
        writer.flush().map_err(|e| Error::io(&self.path, e))?;
        writer
            .get_ref()
            .sync_data()
            .map_err(|e| Error::io(&self.path, e))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| Error::io(&self.path, e))?;
        }
        Ok(())
    }
}

fn fcntl_lock(file: &File, lock: bool) -> std::io::Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = (if lock { libc::F_WRLCK } else { libc::F_UNLCK }) as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0; // whole file
    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Paths locked by this process. `fcntl` locks do not conflict within a
/// process, so double-locking is caught here.
#[derive(Default)]
struct LockTable {
    locked: Mutex<HashSet<PathBuf>>,
}

impl LockTable {
    fn insert(&self, path: &Path) -> bool {
        self.locked.lock().unwrap().insert(path.to_path_buf())
    }

    fn remove(&self, path: &Path) {
        self.locked.lock().unwrap().remove(path);
    }
}

struct PosixFileLock {
    file: File,
    path: PathBuf,
    table: Arc<LockTable>,
    released: bool,
}

impl FileLock for PosixFileLock {
    fn unlock(mut self: Box<Self>) -> Result<()> {
        self.released = true;
        self.table.remove(&self.path);
        fcntl_lock(&self.file, false).map_err(|e| Error::io(&self.path, e))
    }
}

impl Drop for PosixFileLock {
    fn drop(&mut self) {
        if !self.released {
            // Dropped without an explicit unlock; closing the descriptor
            // releases the OS lock.
            self.table.remove(&self.path);
        }
    }
}

type BackgroundTask = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct BackgroundState {
    queue: VecDeque<BackgroundTask>,
    worker_started: bool,
}

/// FIFO drained by one worker thread: tasks start, and therefore finish,
/// in submission order.
#[derive(Default)]
struct BackgroundQueue {
    state: Mutex<BackgroundState>,
    signal: Condvar,
}

impl BackgroundQueue {
    /// Enqueues `task`, spawning the worker on first use. The condvar is
    /// signalled after the insert so the worker never wakes to an empty
    /// queue.
    fn schedule(queue: &Arc<BackgroundQueue>, task: BackgroundTask) {
        let mut state = queue.state.lock().unwrap();
        if !state.worker_started {
            state.worker_started = true;
            let worker = Arc::clone(queue);
            thread::Builder::new()
                .name("emberdb-bg".to_string())
                .spawn(move || worker.run_worker())
                .expect("failed to spawn background worker");
            tracing::debug!("background worker started");
        }
        state.queue.push_back(task);
        queue.signal.notify_one();
    }

    fn run_worker(self: Arc<Self>) {
        loop {
            let task = {
                let mut state = self.state.lock().unwrap();
                loop {
                    match state.queue.pop_front() {
                        Some(task) => break task,
                        None => state = self.signal.wait(state).unwrap(),
                    }
                }
            };
            // Run outside the mutex so producers never block on a task.
            task();
        }
    }
}

/// Writes one line per message: microsecond timestamp, thread id, text.
struct PosixLogger {
    file: Mutex<BufWriter<File>>,
}

impl Logger for PosixLogger {
    fn log(&self, message: &str) {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or(0);
        let thread_id = thread::current().id();
        let mut file = self.file.lock().unwrap();
        // Logging is best-effort; a full disk must not fail the caller.
        let _ = writeln!(file, "{micros} {thread_id:?} {message}");
        let _ = file.flush();
    }
}

/// The production environment.
pub struct PosixEnv {
    mmap_limiter: Arc<Limiter>,
    fd_limiter: Arc<Limiter>,
    locks: Arc<LockTable>,
    background: Arc<BackgroundQueue>,
}

impl PosixEnv {
    pub fn new() -> PosixEnv {
        PosixEnv::with_config(EnvConfig::default())
    }

    pub fn with_config(config: EnvConfig) -> PosixEnv {
        let mmap_limit = config
            .mmap_limit
            .map(|n| n as isize)
            .unwrap_or_else(default_mmap_limit);
        let fd_limit = config
            .read_only_fd_limit
            .map(|n| n as isize)
            .unwrap_or_else(default_fd_limit);
        PosixEnv {
            mmap_limiter: Arc::new(Limiter::new(mmap_limit)),
            fd_limiter: Arc::new(Limiter::new(fd_limit)),
            locks: Arc::new(LockTable::default()),
            background: Arc::new(BackgroundQueue::default()),
        }
    }
}

impl Default for PosixEnv {
    fn default() -> Self {
        PosixEnv::new()
    }
}

impl Env for PosixEnv {
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Ok(Box::new(PosixSequentialFile {
            path: path.to_path_buf(),
            file,
        }))
    }

    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        if self.mmap_limiter.acquire() {
            match unsafe { Mmap::map(&file) } {
                Ok(map) => {
                    return Ok(Box::new(PosixMmapFile {
                        map,
                        limiter: Arc::clone(&self.mmap_limiter),
                    }));
                }
                Err(e) => {
                    self.mmap_limiter.release();
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "mmap failed, falling back to pread"
                    );
                }
            }
        }
        Ok(Box::new(PosixRandomAccessFile::new(
            path.to_path_buf(),
            file,
            Arc::clone(&self.fd_limiter),
        )))
    }

    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        Ok(Box::new(PosixWritableFile::new(path.to_path_buf(), file)))
    }

    fn new_appendable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        Ok(Box::new(PosixWritableFile::new(path.to_path_buf(), file)))
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn get_children(&self, dir: &Path) -> Result<Vec<String>> {
        let entries = fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(dir, e))?;
            children.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(children)
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| Error::io(path, e))
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir(path).map_err(|e| Error::io(path, e))
    }

    fn delete_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path).map_err(|e| Error::io(path, e))
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        let meta = fs::metadata(path).map_err(|e| Error::io(path, e))?;
        Ok(meta.len())
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(|e| Error::io(from, e))
    }

    fn lock_file(&self, path: &Path) -> Result<Box<dyn FileLock>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        // Locks are keyed by absolute path so the same file reached through
        // different spellings still conflicts.
        let key = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if !self.locks.insert(&key) {
            return Err(Error::IO(format!(
                "lock {}: already held by process",
                key.display()
            )));
        }
        if let Err(e) = fcntl_lock(&file, true) {
            self.locks.remove(&key);
            return Err(Error::io(&key, e));
        }
        Ok(Box::new(PosixFileLock {
            file,
            path: key,
            table: Arc::clone(&self.locks),
            released: false,
        }))
    }

    fn schedule(&self, task: Box<dyn FnOnce() + Send>) {
        BackgroundQueue::schedule(&self.background, task);
    }

    fn start_thread(&self, task: Box<dyn FnOnce() + Send>) {
        thread::spawn(task);
    }

    fn test_directory(&self) -> Result<PathBuf> {
        let dir = match std::env::var("TEST_TMPDIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => {
                let uid = unsafe { libc::geteuid() };
                std::env::temp_dir().join(format!("emberdbtest-{uid}"))
            }
        };
        // The directory may already exist.
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        Ok(dir)
    }

    fn new_logger(&self, path: &Path) -> Result<Box<dyn Logger>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        Ok(Box::new(PosixLogger {
            file: Mutex::new(BufWriter::new(file)),
        }))
    }

    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }

    fn sleep_for_micros(&self, micros: u64) {
        thread::sleep(Duration::from_micros(micros));
    }
}
