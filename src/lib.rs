//! The on-disk key/value layer beneath an LSM-tree storage engine: the
//! internal-key scheme that defines the engine's sort order, the
//! prefix-compressed sorted block format with its restart index, and the
//! environment abstraction all file I/O goes through.

pub mod comparator;
pub mod config;
pub mod encoding;
pub mod env;
pub mod error;
pub mod filter;
pub mod internal_key;
pub mod sstable;
pub mod tmpfs;

pub use comparator::{BytewiseComparator, Comparator};
pub use config::EnvConfig;
pub use env::{Env, EnvWrapper, PosixEnv};
pub use error::{Error, Result};
pub use internal_key::{
    InternalKey, InternalKeyComparator, LookupKey, SequenceNumber, ValueType,
};
