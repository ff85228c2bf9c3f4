use std::{ffi, path, thread};

use super::*;

fn scratch_dir(name: &str) -> ffi::OsString {
    let dir = std::env::temp_dir().join(name);
    fs::remove_dir_all(&dir).ok();
    dir.into_os_string()
}

#[test]
fn test_mgr_create_set_check() {
    let dir = scratch_dir("test_mgr_create_set_check");
    let mgr = FilterMgr::open(Config::new(&dir)).unwrap();

    mgr.create_filter("users", None).unwrap();

    let mut outs = vec![];
    mgr.set_keys("users", &["a", "b", "a"], &mut outs).unwrap();
    assert_eq!(outs, vec![true, true, false]);

    let mut outs = vec![];
    mgr.check_keys("users", &["a", "c"], &mut outs).unwrap();
    assert_eq!(outs, vec![true, false]);

    assert_eq!(mgr.list_filters(), vec!["users".to_string()]);
    mgr.close().unwrap();
}

#[test]
fn test_mgr_create_existing() {
    let dir = scratch_dir("test_mgr_create_existing");
    let mgr = FilterMgr::open(Config::new(&dir)).unwrap();

    mgr.create_filter("x", None).unwrap();
    let vsn = mgr.to_stats().unwrap().vsn;

    let res = mgr.create_filter("x", None);
    assert!(matches!(res, Err(Error::FilterExists(_, _))));
    // a failed create leaves the head untouched.
    assert_eq!(mgr.to_stats().unwrap().vsn, vsn);

    mgr.close().unwrap();
}

#[test]
fn test_mgr_drop_filter() {
    let dir = scratch_dir("test_mgr_drop_filter");
    let mgr = FilterMgr::open(Config::new(&dir)).unwrap();

    mgr.create_filter("x", None).unwrap();
    let mut outs = vec![];
    mgr.set_keys("x", &["a"], &mut outs).unwrap();

    mgr.drop_filter("x").unwrap();

    let mut outs = vec![];
    let res = mgr.check_keys("x", &["k"], &mut outs);
    assert!(matches!(res, Err(Error::FilterNotFound(_, _))));
    assert!(mgr.list_filters().is_empty());
    assert!(matches!(mgr.drop_filter("x"), Err(Error::FilterNotFound(_, _))));

    // same name can come right back, as a fresh filter.
    mgr.create_filter("x", None).unwrap();
    let mut outs = vec![];
    mgr.check_keys("x", &["a"], &mut outs).unwrap();
    assert_eq!(outs, vec![false]);

    mgr.close().unwrap();
}

#[test]
fn test_mgr_clear_filter() {
    let dir = scratch_dir("test_mgr_clear_filter");
    let mgr = FilterMgr::open(Config::new(&dir)).unwrap();

    // clear is refused while the filter is mapped in memory.
    mgr.create_filter("y", None).unwrap();
    assert!(matches!(mgr.clear_filter("y"), Err(Error::NotProxied(_, _))));

    mgr.create_filter("x", None).unwrap();
    let mut outs = vec![];
    mgr.set_keys("x", &["a"], &mut outs).unwrap();
    mgr.unmap_filter("x").unwrap();

    mgr.clear_filter("x").unwrap();
    let mut outs = vec![];
    let res = mgr.check_keys("x", &["k"], &mut outs);
    assert!(matches!(res, Err(Error::FilterNotFound(_, _))));

    // unlike drop, clear leaves the persisted filter behind.
    assert!(bloom::filter_dir(&dir, "x").is_dir());
    assert!(bloom::filter_dir(&dir, "x").join("filter.toml").is_file());

    mgr.close().unwrap();
}

#[test]
fn test_mgr_unmap_filter() {
    let dir = scratch_dir("test_mgr_unmap_filter");
    let mgr = FilterMgr::open(Config::new(&dir)).unwrap();

    mgr.create_filter("x", None).unwrap();
    let mut outs = vec![];
    mgr.set_keys("x", &["a"], &mut outs).unwrap();

    mgr.unmap_filter("x").unwrap();
    assert!(mgr.with_filter("x", |f| f.is_proxied()).unwrap());

    // key operations transparently fault the filter back in.
    let mut outs = vec![];
    mgr.check_keys("x", &["a", "b"], &mut outs).unwrap();
    assert_eq!(outs, vec![true, false]);
    assert!(!mgr.with_filter("x", |f| f.is_proxied()).unwrap());

    assert!(matches!(mgr.unmap_filter("nope"), Err(Error::FilterNotFound(_, _))));

    // in-memory filters have nothing to unmap to.
    let mut custom = FilterConfig::default();
    custom.set_in_memory(true);
    mgr.create_filter("mem", Some(custom)).unwrap();
    mgr.unmap_filter("mem").unwrap();
    assert!(!mgr.with_filter("mem", |f| f.is_proxied()).unwrap());

    mgr.close().unwrap();
}

#[test]
fn test_mgr_with_filter() {
    let dir = scratch_dir("test_mgr_with_filter");
    let mgr = FilterMgr::open(Config::new(&dir)).unwrap();

    mgr.create_filter("x", None).unwrap();
    assert_eq!(mgr.with_filter("x", |f| f.to_name()).unwrap(), "x".to_string());
    assert!(mgr.with_filter("x", |f| f.num_bits()).unwrap() > 0);

    let res = mgr.with_filter("nope", |f| f.num_bits());
    assert!(matches!(res, Err(Error::FilterNotFound(_, _))));

    mgr.close().unwrap();
}

#[test]
fn test_mgr_head_monotonic() {
    let dir = scratch_dir("test_mgr_head_monotonic");
    let mgr = FilterMgr::open(Config::new(&dir)).unwrap();

    assert_eq!(mgr.to_stats().unwrap().vsn, 0);
    mgr.create_filter("a", None).unwrap();
    assert_eq!(mgr.to_stats().unwrap().vsn, 1);
    mgr.create_filter("b", None).unwrap();
    assert_eq!(mgr.to_stats().unwrap().vsn, 2);
    mgr.drop_filter("a").unwrap();
    assert_eq!(mgr.to_stats().unwrap().vsn, 3);

    // without a reaper the whole chain stays linked.
    let stats = mgr.to_stats().unwrap();
    assert_eq!(stats.n_versions, 4);
    assert_eq!(stats.n_filters, 1);

    mgr.close().unwrap();
}

#[test]
fn test_mgr_list_cold() {
    let dir = scratch_dir("test_mgr_list_cold");
    let mut mgr = FilterMgr::open(Config::new(&dir)).unwrap();
    mgr.set_cooldown(time::Duration::from_millis(100));

    mgr.create_filter("x", None).unwrap();
    mgr.create_filter("z", None).unwrap();
    mgr.unmap_filter("z").unwrap();

    // both filters are freshly touched.
    assert_eq!(mgr.list_cold_filters().unwrap(), Vec::<String>::new());

    thread::sleep(time::Duration::from_millis(250));

    // x went cold; z is proxied already and never shows up.
    assert_eq!(mgr.list_cold_filters().unwrap(), vec!["x".to_string()]);
    // the scan itself counted as an access.
    assert_eq!(mgr.list_cold_filters().unwrap(), Vec::<String>::new());

    thread::sleep(time::Duration::from_millis(250));
    let mut outs = vec![];
    mgr.check_keys("x", &["k"], &mut outs).unwrap();
    assert_eq!(mgr.list_cold_filters().unwrap(), Vec::<String>::new());

    mgr.close().unwrap();
}

#[test]
fn test_mgr_persistence_round_trip() {
    let dir = scratch_dir("test_mgr_persistence_round_trip");
    {
        let mgr = FilterMgr::open(Config::new(&dir)).unwrap();
        let mut custom = FilterConfig::default();
        custom.set_capacity(5000).set_fpp(0.001);
        mgr.create_filter("users", Some(custom)).unwrap();
        mgr.create_filter("events", None).unwrap();

        let mut outs = vec![];
        mgr.set_keys("users", &["alice", "bob"], &mut outs).unwrap();
        mgr.close().unwrap();
    }
    {
        let mgr = FilterMgr::open(Config::new(&dir)).unwrap();
        let names = vec!["events".to_string(), "users".to_string()];
        assert_eq!(mgr.list_filters(), names);

        // filters come back in their proxied, non-hot state, with the
        // configuration they were created with.
        assert!(mgr.with_filter("users", |f| f.is_proxied()).unwrap());
        let capacity = mgr.with_filter("users", |f| f.to_config().to_capacity());
        assert_eq!(capacity.unwrap(), 5000);

        let mut outs = vec![];
        mgr.check_keys("users", &["alice", "bob", "carol"], &mut outs).unwrap();
        assert_eq!(outs, vec![true, true, false]);

        mgr.close().unwrap();
    }
}

#[test]
fn test_mgr_reaper_tombstone() {
    let dir = scratch_dir("test_mgr_reaper_tombstone");
    let mut mgr = FilterMgr::open(Config::new(&dir)).unwrap();
    mgr.set_cooldown(time::Duration::from_millis(50));
    mgr.start_reaper();

    mgr.create_filter("gone", None).unwrap();
    let mut outs = vec![];
    mgr.set_keys("gone", &["k"], &mut outs).unwrap();
    mgr.flush_filter("gone").unwrap();
    assert!(bloom::filter_dir(&dir, "gone").is_dir());

    mgr.create_filter("kept", None).unwrap();
    mgr.unmap_filter("kept").unwrap();

    mgr.drop_filter("gone").unwrap();
    mgr.clear_filter("kept").unwrap();

    // wait for the reaper to retire the superseded versions and
    // finalize both tombstones.
    let give_up = time::Instant::now() + time::Duration::from_secs(10);
    loop {
        let stats = mgr.to_stats().unwrap();
        if stats.n_versions == 1 && !bloom::filter_dir(&dir, "gone").exists() {
            break;
        }
        assert!(time::Instant::now() < give_up, "chain stuck at {}", stats.n_versions);
        thread::sleep(time::Duration::from_millis(50));
    }

    // dropped filter files are destroyed, cleared filter files survive.
    assert!(!bloom::filter_dir(&dir, "gone").exists());
    assert!(bloom::filter_dir(&dir, "kept").is_dir());

    mgr.close().unwrap();
}

#[test]
fn test_mgr_read_parallelism() {
    let dir = scratch_dir("test_mgr_read_parallelism");
    let mgr = FilterMgr::open(Config::new(&dir)).unwrap();

    mgr.create_filter("x", None).unwrap();
    let mut outs = vec![];
    mgr.set_keys("x", &["a"], &mut outs).unwrap();

    let mgr = Arc::new(mgr);
    let blocker = {
        let mgr = Arc::clone(&mgr);
        thread::spawn(move || {
            let res = mgr.with_filter("x", |_| {
                thread::sleep(time::Duration::from_millis(500));
            });
            res.unwrap();
        })
    };
    thread::sleep(time::Duration::from_millis(100));

    // a concurrent reader is not kept waiting behind another reader.
    let start = time::Instant::now();
    let mut outs = vec![];
    mgr.check_keys("x", &["a"], &mut outs).unwrap();
    assert_eq!(outs, vec![true]);
    assert!(start.elapsed() < time::Duration::from_millis(350));

    blocker.join().unwrap();
    match Arc::try_unwrap(mgr) {
        Ok(mgr) => mgr.close().unwrap(),
        Err(_) => unreachable!(),
    }
}

#[test]
fn test_mgr_concurrent_ops() {
    let dir = scratch_dir("test_mgr_concurrent_ops");
    let mut mgr = FilterMgr::open(Config::new(&dir)).unwrap();
    mgr.set_cooldown(time::Duration::from_millis(25));
    mgr.start_reaper();

    mgr.create_filter("x", None).unwrap();
    let mut outs = vec![];
    mgr.set_keys("x", &["sentinel"], &mut outs).unwrap();

    let mgr = Arc::new(mgr);
    let deadline = time::Instant::now() + time::Duration::from_secs(2);

    let setter = {
        let mgr = Arc::clone(&mgr);
        thread::spawn(move || {
            let mut i = 0_u64;
            while time::Instant::now() < deadline {
                let keys = vec![format!("a-{}", i), format!("a-{}", i + 1)];
                let mut outs = vec![];
                mgr.set_keys("x", &keys, &mut outs).unwrap();
                assert_eq!(outs.len(), keys.len());
                i += 2;
            }
            i
        })
    };

    let checker = {
        let mgr = Arc::clone(&mgr);
        thread::spawn(move || {
            let mut n_ops = 0_usize;
            while time::Instant::now() < deadline {
                let mut outs = vec![];
                mgr.check_keys("x", &["sentinel", "never-set"], &mut outs).unwrap();
                assert_eq!(outs[0], true);
                n_ops += 1;
            }
            n_ops
        })
    };

    let churner = {
        let mgr = Arc::clone(&mgr);
        thread::spawn(move || {
            let mut n_ops = 0_usize;
            while time::Instant::now() < deadline {
                mgr.create_filter("y", None).ok();
                thread::sleep(time::Duration::from_millis(20));
                mgr.drop_filter("y").ok();
                thread::sleep(time::Duration::from_millis(20));
                n_ops += 1;
            }
            n_ops
        })
    };

    let n_sets = setter.join().unwrap();
    let n_checks = checker.join().unwrap();
    let n_churns = churner.join().unwrap();
    println!(
        "test_mgr_concurrent_ops sets:{} checks:{} churns:{}",
        n_sets, n_checks, n_churns
    );
    assert!(n_sets > 0 && n_checks > 0 && n_churns > 0);

    // steady state; the reaper must drain the whole version chain.
    let give_up = time::Instant::now() + time::Duration::from_secs(30);
    loop {
        let stats = mgr.to_stats().unwrap();
        if stats.n_versions == 1 {
            break;
        }
        assert!(time::Instant::now() < give_up, "chain stuck at {}", stats.n_versions);
        thread::sleep(time::Duration::from_millis(100));
    }

    // "x" survived the churn intact.
    let mut outs = vec![];
    mgr.check_keys("x", &["sentinel"], &mut outs).unwrap();
    assert_eq!(outs, vec![true]);

    match Arc::try_unwrap(mgr) {
        Ok(mgr) => mgr.close().unwrap(),
        Err(_) => unreachable!(),
    }
}

#[test]
fn test_mgr_load_skips_strays() {
    let dir = scratch_dir("test_mgr_load_skips_strays");
    {
        let mgr = FilterMgr::open(Config::new(&dir)).unwrap();
        mgr.create_filter("real", None).unwrap();
        mgr.close().unwrap();
    }

    // stray entries under the data directory must not confuse the scan.
    let root = path::Path::new(&dir);
    fs::create_dir_all(root.join("not-a-filter")).unwrap();
    fs::create_dir_all(root.join("bloomd.broken")).unwrap();
    fs::write(root.join("bloomd.stray-file"), b"junk").unwrap();

    let mgr = FilterMgr::open(Config::new(&dir)).unwrap();
    assert_eq!(mgr.list_filters(), vec!["real".to_string()]);
    mgr.close().unwrap();
}
