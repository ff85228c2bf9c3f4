//! Package implement the storage half of a bloom-filter network service.
//!
//! A [FilterMgr] instance owns a named collection of bloom filters and
//! mediates all read/write access to them. Filter lookups on the hot path
//! never block behind creates and drops, this is achieved through a simple
//! form of [Multi-Version-Concurrency-Control][mvcc] over the name to
//! filter directory:
//!
//! * Every mutation of the directory, serialized by a writer mutex, builds
//!   a fresh directory version and publishes it with a single atomic store
//!   of the head pointer.
//! * Readers sample the head once and operate against that version for the
//!   duration of the call.
//! * A single reaper thread retires the chain of superseded versions after
//!   they have cooled, and finalizes filters that were dropped or cleared.
//!
//! Individual filters are [bloom::Bloom] values, persisted as
//! `bloomd.<name>` directories under a configured data directory and
//! paged in and out of memory on demand. Refer to [Config] and
//! [FilterConfig] for the tunables.
//!
//! [mvcc]: https://en.wikipedia.org/wiki/Multiversion_concurrency_control

use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// use crate::{Error, Result};
/// err_at!(InvalidInput, msg: "bad argument {}", arg)
/// ```
///
/// ```ignore
/// err_at!(IOError, fs::read(file_path))
/// ```
///
/// ```ignore
/// err_at!(IOError, fs::read(file_path), "reading {:?}", file_path)
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

pub mod bloom;
pub mod config;
pub mod hash;
pub mod mgr;
pub mod util;

pub use crate::bloom::Bloom;
pub use crate::config::{Config, FilterConfig};
pub use crate::mgr::{FilterMgr, Stats, REAP_INTERVAL, VERSION_COOLDOWN};

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location, and a message.
pub enum Error {
    /// Named filter is missing from the directory, or inactive.
    FilterNotFound(String, String),
    /// Create collided with an existing entry of the same name.
    FilterExists(String, String),
    /// Clear attempted on a filter that is still mapped in memory.
    NotProxied(String, String),
    /// Supplied configuration or argument is invalid.
    InvalidInput(String, String),
    /// On-disk filter is missing, truncated or corrupted.
    InvalidFile(String, String),
    IOError(String, String),
    FailConvert(String, String),
    ThreadFail(String, String),
    IPCFail(String, String),
    Fatal(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::{FailConvert, Fatal, IOError, IPCFail, ThreadFail};
        use Error::{FilterExists, FilterNotFound, InvalidFile, InvalidInput, NotProxied};

        match self {
            FilterNotFound(p, m) => write!(f, "FilterNotFound,{},{}", p, m),
            FilterExists(p, m) => write!(f, "FilterExists,{},{}", p, m),
            NotProxied(p, m) => write!(f, "NotProxied,{},{}", p, m),
            InvalidInput(p, m) => write!(f, "InvalidInput,{},{}", p, m),
            InvalidFile(p, m) => write!(f, "InvalidFile,{},{}", p, m),
            IOError(p, m) => write!(f, "IOError,{},{}", p, m),
            FailConvert(p, m) => write!(f, "FailConvert,{},{}", p, m),
            ThreadFail(p, m) => write!(f, "ThreadFail,{},{}", p, m),
            IPCFail(p, m) => write!(f, "IPCFail,{},{}", p, m),
            Fatal(p, m) => write!(f, "Fatal,{},{}", p, m),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}
