//! The environment is the storage layer's single dynamic-dispatch boundary:
//! every filesystem, clock, thread, and locking capability the layer
//! touches is bundled behind one trait so tests and embedders can
//! substitute their own.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};

pub mod posix;

pub use posix::PosixEnv;

/// A single-owner read cursor over a file. Callers serialize access
/// externally.
pub trait SequentialFile: Send {
    /// Reads up to `buf.len()` bytes. A short count means end of file, not
    /// an error.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Advances the cursor `n` bytes; stops at end of file.
    fn skip(&mut self, n: u64) -> Result<()>;
}

/// A reader usable from many threads at once.
pub trait RandomAccessFile: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// count. Reads entirely past end of file return zero; reads straddling
    /// it return short.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// A buffered append-only writer. Single-owner, like [`SequentialFile`].
pub trait WritableFile: Send + std::fmt::Debug {
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Pushes buffered bytes to the kernel.
    fn flush(&mut self) -> Result<()>;

    /// Pushes buffered bytes all the way to durable media. Files named
    /// `MANIFEST*` additionally sync their parent directory so the name
    /// itself survives a crash.
    fn sync(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// A held advisory lock; release it through [`Env::unlock_file`].
pub trait FileLock: Send {
    fn unlock(self: Box<Self>) -> Result<()>;
}

/// Line-oriented sink for informational messages.
pub trait Logger: Send + Sync {
    fn log(&self, message: &str);
}

/// The capability bundle injected into the storage layer.
pub trait Env: Send + Sync {
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>>;

    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>>;

    /// Truncates any existing file at `path`.
    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;

    /// Opens `path` for appending without truncation. Environments may not
    /// support this; callers must be prepared for `NotSupported`.
    fn new_appendable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let _ = path;
        Err(Error::NotSupported("new_appendable_file".to_string()))
    }

    fn file_exists(&self, path: &Path) -> bool;

    /// Names (not paths) of the entries in `dir`.
    fn get_children(&self, dir: &Path) -> Result<Vec<String>>;

    fn delete_file(&self, path: &Path) -> Result<()>;

    fn create_dir(&self, path: &Path) -> Result<()>;

    fn delete_dir(&self, path: &Path) -> Result<()>;

    fn file_size(&self, path: &Path) -> Result<u64>;

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Takes a whole-file advisory write lock, creating the file if needed.
    /// Never blocks: contention from any process, this one included, fails
    /// immediately with `IO`.
    fn lock_file(&self, path: &Path) -> Result<Box<dyn FileLock>>;

    fn unlock_file(&self, lock: Box<dyn FileLock>) -> Result<()> {
        lock.unlock()
    }

    /// Hands `task` to the background worker. Tasks run one at a time in
    /// submission order.
    fn schedule(&self, task: Box<dyn FnOnce() + Send>);

    /// Runs `task` on its own detached thread.
    fn start_thread(&self, task: Box<dyn FnOnce() + Send>);

    /// A per-user scratch directory for tests. The `TEST_TMPDIR`
    /// environment variable overrides the default location.
    fn test_directory(&self) -> Result<PathBuf>;

    fn new_logger(&self, path: &Path) -> Result<Box<dyn Logger>>;

    /// Microseconds since an arbitrary fixed point; only deltas are
    /// meaningful.
    fn now_micros(&self) -> u64;

    fn sleep_for_micros(&self, micros: u64);
}

/// Forwards every operation to an inner environment. Embedders that want to
/// override a few operations (rate-limited I/O, fault injection) hold one
/// of these and shadow the methods they care about.
pub struct EnvWrapper {
    target: Arc<dyn Env>,
}

impl EnvWrapper {
    pub fn new(target: Arc<dyn Env>) -> EnvWrapper {
        EnvWrapper { target }
    }

    /// The environment this wrapper forwards to.
    pub fn target(&self) -> &Arc<dyn Env> {
        &self.target
    }
}

impl Env for EnvWrapper {
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        self.target.new_sequential_file(path)
    }

    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        self.target.new_random_access_file(path)
    }

    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        self.target.new_writable_file(path)
    }

    fn new_appendable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        self.target.new_appendable_file(path)
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.target.file_exists(path)
    }

    fn get_children(&self, dir: &Path) -> Result<Vec<String>> {
        self.target.get_children(dir)
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        self.target.delete_file(path)
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        self.target.create_dir(path)
    }

    fn delete_dir(&self, path: &Path) -> Result<()> {
        self.target.delete_dir(path)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        self.target.file_size(path)
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
        self.target.rename_file(from, to)
    }

    fn lock_file(&self, path: &Path) -> Result<Box<dyn FileLock>> {
        self.target.lock_file(path)
    }

    fn unlock_file(&self, lock: Box<dyn FileLock>) -> Result<()> {
        self.target.unlock_file(lock)
    }

    fn schedule(&self, task: Box<dyn FnOnce() + Send>) {
        self.target.schedule(task)
    }

    fn start_thread(&self, task: Box<dyn FnOnce() + Send>) {
        self.target.start_thread(task)
    }

    fn test_directory(&self) -> Result<PathBuf> {
        self.target.test_directory()
    }

    fn new_logger(&self, path: &Path) -> Result<Box<dyn Logger>> {
        self.target.new_logger(path)
    }

    fn now_micros(&self) -> u64 {
        self.target.now_micros()
    }

    fn sleep_for_micros(&self, micros: u64) {
        self.target.sleep_for_micros(micros)
    }
}

/// Writes `data` to `path` through `env`, replacing any previous contents.
/// A failed write deletes the partial file.
pub fn write_string_to_file(env: &dyn Env, data: &[u8], path: &Path) -> Result<()> {
    let result = (|| {
        let mut file = env.new_writable_file(path)?;
        file.append(data)?;
        file.close()
    })();
    if result.is_err() {
        let _ = env.delete_file(path);
    }
    result
}

/// Reads the entire contents of `path` through `env`.
pub fn read_file_to_string(env: &dyn Env, path: &Path) -> Result<Vec<u8>> {
    let mut file = env.new_sequential_file(path)?;
    let mut contents = Vec::new();
    let mut scratch = [0u8; 8192];
    loop {
        let n = file.read(&mut scratch)?;
        if n == 0 {
            break;
        }
        contents.extend_from_slice(&scratch[..n]);
    }
    Ok(contents)
}
