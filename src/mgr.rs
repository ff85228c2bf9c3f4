//! Module `mgr` implement the filter manager, the control plane of the
//! bloom-filter service.
//!
//! The manager owns a directory of named filters under a simple form of
//! [Multi-Version-Concurrency-Control][mvcc]. The latest version is
//! always the head of a linked list of versions and older versions
//! are kept alive until a separate reaper thread retires them. This
//! keeps lookups against the head non-blocking while creates and drops
//! are serialized behind a writer mutex.
//!
//! Versions and filter handles are reference counted. A map copied into
//! a newer version shares the handle identities of its predecessor and
//! an operation in flight holds its own reference, so retiring a version
//! can never pull a filter out from under a live operation. The reaper's
//! cool-off period is therefore a memory-pressure valve, not a
//! correctness requirement.
//!
//! [mvcc]: https://en.wikipedia.org/wiki/Multiversion_concurrency_control

use log::{debug, error, info};

use std::{
    collections::HashMap,
    fs,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::SeqCst},
        mpsc, Arc, Mutex, RwLock,
    },
    time,
};

use crate::{
    bloom::{self, Bloom},
    config::{Config, FilterConfig},
    err_at,
    util::{thread as rt, Spinlock},
    Error, Result,
};

/// Time a retired directory version stays cold before the reaper
/// reclaims it. Also the age beyond which an untouched filter counts
/// as cold. Refer to [FilterMgr::set_cooldown] to tune it.
pub const VERSION_COOLDOWN: time::Duration = time::Duration::from_secs(15);

/// Periodic interval at which the reaper samples the head version.
pub const REAP_INTERVAL: time::Duration = time::Duration::from_secs(1);

// Wraps a bloom filter to ensure only a single writer access it at a
// time, and carries the lifecycle state consulted by the directory and
// the reaper.
struct Handle {
    name: String,
    filter: RwLock<Bloom>,
    // flipped to false exactly once, under the manager's writer mutex,
    // when the filter is dropped or cleared.
    is_active: AtomicBool,
    // chosen at drop/clear time; decides whether finalizing destroys
    // the on-disk files or merely closes the filter.
    should_delete: AtomicBool,
    // wall-clock millis of the last access; 0 for filters discovered
    // on disk, so they start out cold.
    touched: AtomicU64,
    finalized: AtomicBool,
}

impl Handle {
    fn new(name: &str, filter: Bloom, hot: bool) -> Handle {
        Handle {
            name: name.to_string(),
            filter: RwLock::new(filter),
            is_active: AtomicBool::new(true),
            should_delete: AtomicBool::new(false),
            touched: AtomicU64::new(if hot { unix_millis() } else { 0 }),
            finalized: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        self.touched.store(unix_millis(), SeqCst);
    }

    fn is_hot(&self, cooldown: time::Duration) -> bool {
        let age = unix_millis().saturating_sub(self.touched.load(SeqCst));
        age < (cooldown.as_millis() as u64).max(1)
    }

    // Release the underlying filter, honoring the deletion intent.
    // Idempotent, shutdown can race a partially reaped chain.
    fn finalize(&self) -> Result<()> {
        if self.finalized.swap(true, SeqCst) {
            return Ok(());
        }
        let mut filter = err_at!(ThreadFail, self.filter.write())?;
        match self.should_delete.load(SeqCst) {
            true => filter.delete(),
            false => filter.close(),
        }
    }
}

// A snapshot of the name to filter directory. Immutable after publish,
// except for `tombstone` and `prev` which are handed over to the reaper.
struct Vsn {
    vsn: u64,
    map: HashMap<String, Arc<Handle>>,
    // holds the handle dropped when this version was superseded, it is
    // no longer reachable from the newer map.
    tombstone: Mutex<Option<Arc<Handle>>>,
    prev: Mutex<Option<Arc<Vsn>>>,
    is_hot: AtomicBool,
}

impl Vsn {
    fn first(map: HashMap<String, Arc<Handle>>) -> Vsn {
        Vsn {
            vsn: 0,
            map,
            tombstone: Mutex::new(None),
            prev: Mutex::new(None),
            is_hot: AtomicBool::new(false),
        }
    }

    // Entries are copied verbatim, handle identities are shared with
    // the predecessor until it retires.
    fn newer(prev: &Arc<Vsn>) -> Vsn {
        Vsn {
            vsn: prev.vsn + 1,
            map: prev.map.clone(),
            tombstone: Mutex::new(None),
            prev: Mutex::new(Some(Arc::clone(prev))),
            is_hot: AtomicBool::new(true),
        }
    }
}

struct Inner {
    config: Config,
    // serializes all destructive operations on the directory.
    w: Mutex<u32>,
    head: Spinlock<Arc<Vsn>>,
    cooldown: AtomicU64, // millis
}

impl Inner {
    fn to_cooldown(&self) -> time::Duration {
        time::Duration::from_millis(self.cooldown.load(SeqCst))
    }
}

/// Statistics for a [FilterMgr] instance.
#[derive(Clone, Debug)]
pub struct Stats {
    /// Version number of the current head.
    pub vsn: u64,
    /// Number of active filters in the head version.
    pub n_filters: usize,
    /// Number of versions alive, the head and any predecessors the
    /// reaper has not yet retired.
    pub n_versions: usize,
}

/// The filter manager, front door for every filter operation.
///
/// Cheap read operations sample the current head version without
/// blocking. Mutating operations, create/drop/clear, serialize behind a
/// writer mutex, build a new version and publish it with a single store
/// of the head pointer. Refer to [FilterMgr::start_reaper] for retiring
/// superseded versions.
pub struct FilterMgr {
    inner: Arc<Inner>,
    reaper: Option<rt::Thread<(), (), Result<()>>>,
}

impl Drop for FilterMgr {
    fn drop(&mut self) {
        if let Err(err) = self.do_close() {
            error!(target: "mgr", "error closing filter manager {}", err);
        }
    }
}

impl FilterMgr {
    /// Open a filter manager over `config`'s data directory. Filters
    /// already persisted under the directory are discovered and come up
    /// in their proxied, non-hot state. The reaper is not started yet,
    /// refer to [FilterMgr::start_reaper].
    pub fn open(config: Config) -> Result<FilterMgr> {
        err_at!(IOError, fs::create_dir_all(&config.dir), "mkdir {:?}", config.dir)?;

        let map = load_existing_filters(&config)?;
        info!(target: "mgr", "found {} existing filters under {:?}", map.len(), config.dir);

        let inner = Inner {
            config,
            w: Mutex::new(0),
            head: Spinlock::new(Arc::new(Vsn::first(map))),
            cooldown: AtomicU64::new(VERSION_COOLDOWN.as_millis() as u64),
        };
        let val = FilterMgr {
            inner: Arc::new(inner),
            reaper: None,
        };
        Ok(val)
    }

    /// Configure the cool-off period for version reclamation and cold
    /// scans. Takes effect for subsequent reaper cycles.
    pub fn set_cooldown(&mut self, cooldown: time::Duration) -> &mut Self {
        let millis = (cooldown.as_millis() as u64).max(1);
        self.inner.cooldown.store(millis, SeqCst);
        self
    }

    /// Start the manager's passive thread, cleaning up the garbage
    /// created by the MVCC model.
    pub fn start_reaper(&mut self) -> &mut Self {
        if self.reaper.is_none() {
            let inner = Arc::clone(&self.inner);
            let thread = rt::Thread::new("reaper", move |rx| move || reaper(inner, rx));
            self.reaper = Some(thread);
        }
        self
    }

    /// Shut the manager down. Joins the reaper and closes every filter,
    /// on-disk files are never destroyed on shutdown, whatever deletion
    /// intent a handle carried.
    pub fn close(mut self) -> Result<()> {
        self.do_close()
    }

    fn do_close(&mut self) -> Result<()> {
        if let Some(reaper) = self.reaper.take() {
            match reaper.join() {
                Ok(Ok(())) => (),
                Ok(Err(err)) => error!(target: "mgr", "reaper exited with {}", err),
                Err(err) => error!(target: "mgr", "reaper join failed {}", err),
            }
        }

        let head = self.head();

        let mut cursor = Some(Arc::clone(&head));
        while let Some(vsn) = cursor {
            let tombstone = match vsn.tombstone.lock() {
                Ok(mut tombstone) => tombstone.take(),
                Err(_) => None,
            };
            if let Some(handle) = tombstone {
                // a shutdown close never destroys on-disk files, even
                // for filters whose drop the reaper had not reached.
                handle.should_delete.store(false, SeqCst);
                if let Err(err) = handle.finalize() {
                    error!(target: "mgr", "error finalizing {:?}, {}", handle.name, err);
                }
            }
            cursor = match vsn.prev.lock() {
                Ok(mut prev) => prev.take(),
                Err(_) => None,
            };
        }

        for handle in head.map.values() {
            handle.should_delete.store(false, SeqCst);
            if let Err(err) = handle.finalize() {
                error!(target: "mgr", "error closing {:?}, {}", handle.name, err);
            }
        }
        Ok(())
    }

    fn head(&self) -> Arc<Vsn> {
        Arc::clone(&self.inner.head.read())
    }

    // only the writer mutex holder publishes.
    fn publish(&self, vsn: Vsn) {
        debug!(target: "mgr", "publishing directory version {}", vsn.vsn);
        *self.inner.head.write() = Arc::new(vsn);
    }
}

impl FilterMgr {
    /// Create a new filter under `name`. `custom` overrides the manager
    /// defaults for this filter alone and is persisted with it.
    pub fn create_filter(&self, name: &str, custom: Option<FilterConfig>) -> Result<()> {
        let _w = err_at!(ThreadFail, self.inner.w.lock())?;

        let head = self.head();
        head.is_hot.store(true, SeqCst);
        if head.map.contains_key(name) {
            return err_at!(FilterExists, msg: "filter {:?}", name);
        }

        let config = custom.unwrap_or_else(|| self.inner.config.filter.clone());
        let filter = Bloom::init(&config, &self.inner.config.dir, name, true /*create*/)?;
        let handle = Arc::new(Handle::new(name, filter, true /*hot*/));

        let mut vsn = Vsn::newer(&head);
        vsn.map.insert(name.to_string(), handle);
        self.publish(vsn);

        info!(target: "mgr", "created filter {:?}", name);
        Ok(())
    }

    /// Drop the filter `name` entirely. The filter stops resolving as
    /// soon as this returns; its in-memory and on-disk resources are
    /// reclaimed by the reaper once the carrying version has cooled.
    pub fn drop_filter(&self, name: &str) -> Result<()> {
        let _w = err_at!(ThreadFail, self.inner.w.lock())?;

        let head = self.head();
        let handle = match take_filter(&head, name) {
            Some(handle) => handle,
            None => return err_at!(FilterNotFound, msg: "filter {:?}", name),
        };

        handle.is_active.store(false, SeqCst);
        handle.should_delete.store(true, SeqCst);

        let mut vsn = Vsn::newer(&head);
        vsn.map.remove(name);
        // parked on the superseded version, where the reaper finds it.
        *err_at!(ThreadFail, head.tombstone.lock())? = Some(handle);
        self.publish(vsn);

        info!(target: "mgr", "dropped filter {:?}", name);
        Ok(())
    }

    /// Forget the filter `name` without touching its on-disk files.
    /// Permitted only while the filter is proxied; this is the one
    /// removal that preserves the persisted data.
    pub fn clear_filter(&self, name: &str) -> Result<()> {
        let _w = err_at!(ThreadFail, self.inner.w.lock())?;

        let head = self.head();
        let handle = match take_filter(&head, name) {
            Some(handle) => handle,
            None => return err_at!(FilterNotFound, msg: "filter {:?}", name),
        };

        {
            let filter = err_at!(ThreadFail, handle.filter.read())?;
            if !filter.is_proxied() {
                return err_at!(NotProxied, msg: "filter {:?}", name);
            }
        }

        handle.is_active.store(false, SeqCst);
        handle.should_delete.store(false, SeqCst);

        let mut vsn = Vsn::newer(&head);
        vsn.map.remove(name);
        *err_at!(ThreadFail, head.tombstone.lock())? = Some(handle);
        self.publish(vsn);

        info!(target: "mgr", "cleared filter {:?}", name);
        Ok(())
    }

    /// Release the filter's memory while keeping it registered, it is
    /// faulted back in on the next key operation. No-op for filters
    /// configured as in-memory.
    pub fn unmap_filter(&self, name: &str) -> Result<()> {
        let head = self.head();
        let handle = match take_filter(&head, name) {
            Some(handle) => handle,
            None => return err_at!(FilterNotFound, msg: "filter {:?}", name),
        };

        let in_memory = {
            let filter = err_at!(ThreadFail, handle.filter.read())?;
            filter.is_in_memory()
        };
        if !in_memory {
            let mut filter = err_at!(ThreadFail, handle.filter.write())?;
            filter.close()?;
        }
        Ok(())
    }

    /// Flush the filter `name` to disk.
    pub fn flush_filter(&self, name: &str) -> Result<()> {
        let head = self.head();
        let handle = match take_filter(&head, name) {
            Some(handle) => handle,
            None => return err_at!(FilterNotFound, msg: "filter {:?}", name),
        };

        {
            // flush is internally serialized, the read lock only keeps
            // writers out of the bit array meanwhile.
            let filter = err_at!(ThreadFail, handle.filter.read())?;
            filter.flush()?;
        }
        handle.touch();
        Ok(())
    }

    /// Check `keys` against the filter `name`. For every key a boolean
    /// is appended to `out`, false meaning definitely absent. On an
    /// internal error the results gathered so far are left in `out`.
    pub fn check_keys<K>(&self, name: &str, keys: &[K], out: &mut Vec<bool>) -> Result<()>
    where
        K: AsRef<[u8]>,
    {
        let head = self.head();
        let handle = match take_filter(&head, name) {
            Some(handle) => handle,
            None => return err_at!(FilterNotFound, msg: "filter {:?}", name),
        };

        let res = {
            let filter = err_at!(ThreadFail, handle.filter.read())?;
            match filter.is_proxied() {
                false => Some(check_under(&filter, keys, out)),
                true => None,
            }
        };
        let res = match res {
            Some(res) => res,
            None => {
                // fault the filter back in, and check under the write
                // lock itself.
                let mut filter = err_at!(ThreadFail, handle.filter.write())?;
                filter.warm()?;
                check_under(&filter, keys, out)
            }
        };

        handle.touch();
        res
    }

    /// Add `keys` into the filter `name`. For every key a boolean is
    /// appended to `out`, true meaning newly added. On an internal
    /// error the results gathered so far are left in `out`.
    pub fn set_keys<K>(&self, name: &str, keys: &[K], out: &mut Vec<bool>) -> Result<()>
    where
        K: AsRef<[u8]>,
    {
        let head = self.head();
        let handle = match take_filter(&head, name) {
            Some(handle) => handle,
            None => return err_at!(FilterNotFound, msg: "filter {:?}", name),
        };

        let res = {
            let mut filter = err_at!(ThreadFail, handle.filter.write())?;
            filter.warm()?;

            let mut res = Ok(());
            for key in keys.iter() {
                match filter.add(key) {
                    Ok(added) => out.push(added),
                    Err(err) => {
                        res = Err(err);
                        break;
                    }
                }
            }
            res
        };

        handle.touch();
        res
    }

    /// List the names of all active filters.
    pub fn list_filters(&self) -> Vec<String> {
        let head = self.head();
        head.is_hot.store(true, SeqCst);

        let mut names: Vec<String> = head
            .map
            .iter()
            .filter(|(_, handle)| handle.is_active.load(SeqCst))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// List the filters that have gone cold, candidates for unmapping.
    ///
    /// A filter is emitted only when a full cool-off period has passed
    /// without any access and the filter is still resident in memory.
    /// Emitting counts as an access, so an immediate rescan comes back
    /// empty.
    pub fn list_cold_filters(&self) -> Result<Vec<String>> {
        let cooldown = self.inner.to_cooldown();
        let head = self.head();
        head.is_hot.store(true, SeqCst);

        let mut names = vec![];
        for (name, handle) in head.map.iter() {
            if !handle.is_active.load(SeqCst) {
                continue;
            }
            if handle.is_hot(cooldown) {
                continue;
            }
            let proxied = {
                let filter = err_at!(ThreadFail, handle.filter.read())?;
                filter.is_proxied()
            };
            if proxied {
                continue;
            }
            handle.touch();
            names.push(name.clone());
        }
        names.sort();
        Ok(names)
    }

    /// Invoke `callb` with the filter `name`, for reading metadata like
    /// size and key counts. The callback must not engage in key
    /// operations, the filter is shared with concurrent readers.
    pub fn with_filter<F, T>(&self, name: &str, callb: F) -> Result<T>
    where
        F: FnOnce(&Bloom) -> T,
    {
        let head = self.head();
        head.is_hot.store(true, SeqCst);
        let handle = match take_filter(&head, name) {
            Some(handle) => handle,
            None => return err_at!(FilterNotFound, msg: "filter {:?}", name),
        };

        let filter = err_at!(ThreadFail, handle.filter.read())?;
        Ok(callb(&filter))
    }

    /// Gather quick statistics.
    pub fn to_stats(&self) -> Result<Stats> {
        let head = self.head();

        let n_filters = head
            .map
            .values()
            .filter(|handle| handle.is_active.load(SeqCst))
            .count();

        let mut n_versions = 1;
        let mut cursor = {
            let prev = err_at!(ThreadFail, head.prev.lock())?;
            prev.as_ref().map(Arc::clone)
        };
        while let Some(vsn) = cursor {
            n_versions += 1;
            cursor = {
                let prev = err_at!(ThreadFail, vsn.prev.lock())?;
                prev.as_ref().map(Arc::clone)
            };
        }

        Ok(Stats {
            vsn: head.vsn,
            n_filters,
            n_versions,
        })
    }
}

// Resolve a filter against version `vsn`, marking the version hot.
fn take_filter(vsn: &Arc<Vsn>, name: &str) -> Option<Arc<Handle>> {
    vsn.is_hot.store(true, SeqCst);
    match vsn.map.get(name) {
        Some(handle) if handle.is_active.load(SeqCst) => Some(Arc::clone(handle)),
        _ => None,
    }
}

fn check_under<K>(filter: &Bloom, keys: &[K], out: &mut Vec<bool>) -> Result<()>
where
    K: AsRef<[u8]>,
{
    for key in keys.iter() {
        out.push(filter.contains(key)?);
    }
    Ok(())
}

// Scan the data directory for `bloomd.` entries left behind by an
// earlier incarnation. Failing filters are logged and skipped, they
// must not hold up the rest of the directory.
fn load_existing_filters(config: &Config) -> Result<HashMap<String, Arc<Handle>>> {
    let mut map = HashMap::new();

    let entries = err_at!(IOError, fs::read_dir(&config.dir), "read_dir {:?}", config.dir)?;
    for entry in entries {
        let entry = err_at!(IOError, entry)?;
        if !entry.path().is_dir() {
            continue;
        }
        let fname = entry.file_name();
        let fname = match fname.to_str() {
            Some(fname) => fname,
            None => continue,
        };
        let name = match fname.strip_prefix(bloom::DIR_PREFIX) {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };
        match Bloom::init(&config.filter, &config.dir, name, false /*open*/) {
            Ok(filter) => {
                let handle = Arc::new(Handle::new(name, filter, false /*hot*/));
                map.insert(name.to_string(), handle);
            }
            Err(err) => {
                error!(target: "mgr", "failed to load filter {:?}, {}", name, err);
            }
        }
    }
    Ok(map)
}

// The reaper's main loop. Wakes up every REAP_INTERVAL, and whenever
// the head has moved since the last wake-up, detaches the superseded
// chain and retires it. Exits when the manager drops its sending half.
fn reaper(inner: Arc<Inner>, rx: rt::Rx<(), ()>) -> Result<()> {
    info!(target: "mgr", "reaper thread started, interval {:?}", REAP_INTERVAL);

    let mut last_seen = 0;
    loop {
        match rx.recv_timeout(REAP_INTERVAL) {
            Err(mpsc::RecvTimeoutError::Timeout) => (),
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Ok(_) => (),
        }

        let head = Arc::clone(&inner.head.read());
        if head.vsn == last_seen {
            continue;
        }
        last_seen = head.vsn;

        // detach the predecessor chain; future publishes hang off the
        // head and cannot re-link what is taken here.
        let old = match head.prev.lock() {
            Ok(mut prev) => prev.take(),
            Err(_) => None,
        };
        if let Some(old) = old {
            if !reap_chain(&inner, old, &rx) {
                break;
            }
        }
    }

    info!(target: "mgr", "reaper thread exiting");
    Ok(())
}

// Retire a detached chain of versions, oldest first. Each version must
// stay cold for a full cool-off period before it is destroyed; a reader
// sampling the version mid-wait restarts its clock. Returns false when
// shutdown was signalled mid-way.
fn reap_chain(inner: &Arc<Inner>, vsn: Arc<Vsn>, rx: &rt::Rx<(), ()>) -> bool {
    let mut chain = vec![vsn];
    loop {
        let prev = {
            let last = &chain[chain.len() - 1];
            match last.prev.lock() {
                Ok(mut prev) => prev.take(),
                Err(_) => None,
            }
        };
        match prev {
            Some(prev) => chain.push(prev),
            None => break,
        }
    }

    for vsn in chain.into_iter().rev() {
        loop {
            vsn.is_hot.store(false, SeqCst);
            match rx.recv_timeout(inner.to_cooldown()) {
                Err(mpsc::RecvTimeoutError::Timeout) => (),
                Err(mpsc::RecvTimeoutError::Disconnected) => return false,
                Ok(_) => (),
            }
            if !vsn.is_hot.load(SeqCst) {
                break;
            }
        }

        let tombstone = match vsn.tombstone.lock() {
            Ok(mut tombstone) => tombstone.take(),
            Err(_) => None,
        };
        if let Some(handle) = tombstone {
            debug!(target: "mgr", "reaper finalizing filter {:?}", handle.name);
            if let Err(err) = handle.finalize() {
                // never stall the chain, piling up versions leaks the
                // whole service.
                error!(target: "mgr", "error finalizing {:?}, {}", handle.name, err);
            }
        }

        debug!(target: "mgr", "reaper destroyed version {}", vsn.vsn);
    }
    true
}

fn unix_millis() -> u64 {
    match time::SystemTime::now().duration_since(time::UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as u64,
        Err(_) => 0,
    }
}

#[cfg(test)]
#[path = "mgr_test.rs"]
mod mgr_test;
