//! Module implement common utility functions and types.

use serde::{de::DeserializeOwned, Serialize};

use std::{fs, path};

use crate::{err_at, Error, Result};

pub mod spinlock;
pub mod thread;

pub use spinlock::Spinlock;
pub use thread::Thread;

/// Load the toml file at `loc`, typically a filter's persisted
/// parameters, and parse it into type `T`.
pub fn load_toml<P, T>(loc: P) -> Result<T>
where
    P: AsRef<path::Path>,
    T: DeserializeOwned,
{
    let loc: &path::Path = loc.as_ref();
    let data = err_at!(IOError, fs::read(loc), "file:{:?}", loc)?;
    let text = err_at!(FailConvert, String::from_utf8(data), "file:{:?}", loc)?;
    err_at!(FailConvert, toml::from_str(&text), "file:{:?}", loc)
}

/// Serialize value `T` into toml text and save it in file `loc`.
pub fn save_toml<P, T>(loc: P, value: &T) -> Result<()>
where
    P: AsRef<path::Path>,
    T: Serialize,
{
    let loc: &path::Path = loc.as_ref();
    let text = err_at!(FailConvert, toml::to_string(value), "file:{:?}", loc)?;
    err_at!(IOError, fs::write(loc, text.as_bytes()), "file:{:?}", loc)?;
    Ok(())
}
