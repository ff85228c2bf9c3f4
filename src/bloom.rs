//! Module `bloom` implement the persistent bloom filter served by
//! [FilterMgr][crate::FilterMgr].
//!
//! Bloom filters give probabilistic set-membership with no false
//! negatives. Bit positions are derived from a 128-bit murmur3 digest
//! using double hashing, so only two hash computations are needed per
//! key regardless of the number of hash functions.
//!
//! On-disk, a filter is a `bloomd.<name>` directory under the manager's
//! data directory, holding `filter.toml` with the filter parameters and
//! `data.bloom` with the raw bit array. A filter whose bit array is not
//! resident in memory is called _proxied_; the files stay authoritative
//! and the array is faulted back in on demand.

use log::debug;
use serde::{Deserialize, Serialize};

use std::{
    ffi, fs, path,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Mutex,
    },
};

use crate::{config::FilterConfig, err_at, hash, util, Error, Result};

/// Name prefix for filter directories under the data directory.
pub const DIR_PREFIX: &str = "bloomd.";

const META_FILE: &str = "filter.toml";
const DATA_FILE: &str = "data.bloom";

// Filter parameters, persisted as `filter.toml` inside the filter
// directory. `keys` is refreshed on every flush.
#[derive(Clone, Serialize, Deserialize)]
struct Meta {
    capacity: u64,
    fpp: f64,
    bits: u64,
    hashes: u32,
    keys: u64,
}

/// A bloom filter, optionally backed by an on-disk directory.
pub struct Bloom {
    name: String,
    config: FilterConfig,
    dir: Option<path::PathBuf>, // None for in-memory filters
    bits: u64,
    hashes: u32,
    keys: u64,
    words: Option<Vec<u64>>, // None while proxied
    dirty: AtomicBool,
    flush_mu: Mutex<u32>,
}

impl Bloom {
    /// Materialize or open the filter `name` under data directory `dir`.
    ///
    /// With `create` as true missing filters are created, resident in
    /// memory; an existing filter is re-opened with its persisted
    /// parameters. With `create` as false only existing filters can be
    /// opened and they come up in their proxied state.
    pub fn init(config: &FilterConfig, dir: &ffi::OsStr, name: &str, create: bool) -> Result<Bloom> {
        config.validate()?;

        if config.is_in_memory() {
            let (bits, hashes) = optimal_params(config.to_capacity(), config.to_fpp());
            let n_words = words_for(bits);
            let val = Bloom {
                name: name.to_string(),
                config: config.clone(),
                dir: None,
                bits,
                hashes,
                keys: 0,
                words: Some(vec![0_u64; n_words]),
                dirty: AtomicBool::new(false),
                flush_mu: Mutex::new(0),
            };
            return Ok(val);
        }

        let loc = filter_dir(dir, name);
        let meta_loc = loc.join(META_FILE);

        if create {
            err_at!(IOError, fs::create_dir_all(&loc), "mkdir {:?}", loc)?;
            let mut val = match meta_loc.exists() {
                true => Self::from_meta(config, name, &loc)?,
                false => {
                    let (bits, hashes) = optimal_params(config.to_capacity(), config.to_fpp());
                    let val = Bloom {
                        name: name.to_string(),
                        config: config.clone(),
                        dir: Some(loc.clone()),
                        bits,
                        hashes,
                        keys: 0,
                        words: Some(vec![0_u64; words_for(bits)]),
                        dirty: AtomicBool::new(false),
                        flush_mu: Mutex::new(0),
                    };
                    // persist the parameters right away, the directory
                    // scan at startup keys off this file.
                    util::save_toml(&meta_loc, &val.to_meta())?;
                    val
                }
            };
            val.warm()?;
            debug!(target: "bloom", "{:?} initialized {}/{} bits/hashes", name, val.bits, val.hashes);
            Ok(val)
        } else {
            if !meta_loc.is_file() {
                return err_at!(InvalidFile, msg: "missing filter meta {:?}", meta_loc);
            }
            Self::from_meta(config, name, &loc)
        }
    }

    // open from persisted meta, in proxied state.
    fn from_meta(config: &FilterConfig, name: &str, loc: &path::Path) -> Result<Bloom> {
        let meta: Meta = util::load_toml(loc.join(META_FILE))?;

        let mut config = config.clone();
        config.set_capacity(meta.capacity).set_fpp(meta.fpp).set_in_memory(false);

        let val = Bloom {
            name: name.to_string(),
            config,
            dir: Some(loc.to_path_buf()),
            bits: meta.bits,
            hashes: meta.hashes,
            keys: meta.keys,
            words: None,
            dirty: AtomicBool::new(false),
            flush_mu: Mutex::new(0),
        };
        Ok(val)
    }

    fn to_meta(&self) -> Meta {
        Meta {
            capacity: self.config.to_capacity(),
            fpp: self.config.to_fpp(),
            bits: self.bits,
            hashes: self.hashes,
            keys: self.keys,
        }
    }
}

impl Bloom {
    /// Check whether `key` is present in the filter. There are no false
    /// negatives, false positives are bounded by the configured
    /// probability while the filter stays within capacity.
    pub fn contains<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let words = match &self.words {
            Some(words) => words,
            None => return err_at!(Fatal, msg: "{:?} contains on proxied filter", self.name),
        };

        let (h1, h2) = hash::murmur3_x64_128(key.as_ref(), hash::SEED);
        for i in 0..self.hashes {
            let off = h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.bits;
            if words[(off >> 6) as usize] & (1 << (off & 63)) == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Add `key` into the filter. Return true if the key was newly
    /// added, false if it was possibly present already.
    pub fn add<K>(&mut self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let bits = self.bits;
        let words = match &mut self.words {
            Some(words) => words,
            None => return err_at!(Fatal, msg: "{:?} add on proxied filter", self.name),
        };

        let (h1, h2) = hash::murmur3_x64_128(key.as_ref(), hash::SEED);
        let mut added = false;
        for i in 0..self.hashes {
            let off = h1.wrapping_add((i as u64).wrapping_mul(h2)) % bits;
            let (w, m) = ((off >> 6) as usize, 1_u64 << (off & 63));
            if words[w] & m == 0 {
                words[w] |= m;
                added = true;
            }
        }

        if added {
            self.keys += 1;
            self.dirty.store(true, SeqCst);
        }
        Ok(added)
    }

    /// Fault the bit array back into memory. No-op for filters that are
    /// already resident.
    pub fn warm(&mut self) -> Result<()> {
        if self.words.is_some() {
            return Ok(());
        }
        let dir = match &self.dir {
            Some(dir) => dir,
            None => return err_at!(Fatal, msg: "{:?} warm without backing files", self.name),
        };

        let n_words = words_for(self.bits);
        let loc = dir.join(DATA_FILE);
        let words = if loc.is_file() {
            let data = err_at!(IOError, fs::read(&loc), "read {:?}", loc)?;
            if data.len() != n_words * 8 {
                return err_at!(InvalidFile, msg: "{:?} truncated, {} bytes", loc, data.len());
            }
            let mut words = Vec::with_capacity(n_words);
            for chunk in data.chunks_exact(8) {
                let mut buf = [0_u8; 8];
                buf.copy_from_slice(chunk);
                words.push(u64::from_le_bytes(buf));
            }
            words
        } else {
            // filter was created but never flushed.
            vec![0_u64; n_words]
        };

        debug!(target: "bloom", "{:?} faulted in, {} keys", self.name, self.keys);
        self.words = Some(words);
        Ok(())
    }

    /// Persist the bit array and parameters. Concurrent flushes are
    /// serialized internally, so a shared reference is sufficient.
    pub fn flush(&self) -> Result<()> {
        let dir = match &self.dir {
            Some(dir) => dir,
            None => return Ok(()),
        };
        let _f = err_at!(ThreadFail, self.flush_mu.lock())?;

        let words = match &self.words {
            Some(words) => words,
            None => return Ok(()), // proxied, disk is authoritative
        };
        if !self.dirty.load(SeqCst) {
            return Ok(());
        }

        let mut data = Vec::with_capacity(words.len() * 8);
        for word in words.iter() {
            data.extend_from_slice(&word.to_le_bytes());
        }
        let loc = dir.join(DATA_FILE);
        err_at!(IOError, fs::write(&loc, &data), "write {:?}", loc)?;
        util::save_toml(&dir.join(META_FILE), &self.to_meta())?;

        self.dirty.store(false, SeqCst);
        debug!(target: "bloom", "{:?} flushed, {} keys", self.name, self.keys);
        Ok(())
    }

    /// Flush and release the in-memory bit array, keeping the on-disk
    /// files. The filter moves to its proxied state.
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.words = None;
        Ok(())
    }

    /// Remove the on-disk representation and release memory. The filter
    /// is unusable afterwards.
    pub fn delete(&mut self) -> Result<()> {
        self.words = None;
        self.dirty.store(false, SeqCst);
        match self.dir.take() {
            Some(dir) => err_at!(IOError, fs::remove_dir_all(&dir), "rmdir {:?}", dir),
            None => Ok(()),
        }
    }
}

impl Bloom {
    /// Return name of this filter.
    pub fn to_name(&self) -> String {
        self.name.clone()
    }

    /// Return the filter's configuration.
    pub fn to_config(&self) -> FilterConfig {
        self.config.clone()
    }

    /// Return whether the bit array is currently not resident in memory.
    pub fn is_proxied(&self) -> bool {
        self.words.is_none()
    }

    /// Return whether this filter lives purely in memory.
    pub fn is_in_memory(&self) -> bool {
        self.config.is_in_memory()
    }

    /// Return the approximate number of keys added to this filter.
    pub fn num_keys(&self) -> u64 {
        self.keys
    }

    /// Return the size of the bit array.
    pub fn num_bits(&self) -> u64 {
        self.bits
    }

    /// Return the number of hash functions applied per key.
    pub fn num_hashes(&self) -> u32 {
        self.hashes
    }
}

/// Compute the full path of filter `name`'s directory under `dir`.
pub fn filter_dir(dir: &ffi::OsStr, name: &str) -> path::PathBuf {
    path::Path::new(dir).join(format!("{}{}", DIR_PREFIX, name))
}

// standard sizing for the target false-positive probability:
// bits = capacity * -ln(fpp) / ln(2)^2, hashes = bits/capacity * ln(2).
fn optimal_params(capacity: u64, fpp: f64) -> (u64, u32) {
    use std::f64::consts::LN_2;

    let bits = ((capacity as f64) * -fpp.ln() / (LN_2 * LN_2)).ceil();
    let bits = (bits as u64).max(64);
    let hashes = ((bits as f64 / capacity as f64) * LN_2).round();
    (bits, (hashes as u32).max(1))
}

fn words_for(bits: u64) -> usize {
    ((bits + 63) / 64) as usize
}

#[cfg(test)]
#[path = "bloom_test.rs"]
mod bloom_test;
