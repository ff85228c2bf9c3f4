use std::{sync::Arc, thread, time};

use super::*;

#[test]
fn test_spinlock_rw() {
    let spin = Arc::new(Spinlock::new(vec![0_u64; 32]));
    let (n_writers, n_readers) = (2_u64, 4_usize);

    let mut writers = vec![];
    for idx in 0..n_writers {
        let spin = Arc::clone(&spin);
        writers.push(thread::spawn(move || {
            let mut n_ops = 0_usize;
            let start = time::Instant::now();
            while start.elapsed() < time::Duration::from_secs(1) {
                {
                    let mut data = spin.write();
                    for item in data.iter_mut() {
                        *item = idx;
                    }
                }
                n_ops += 1;
            }
            n_ops
        }));
    }

    let mut readers = vec![];
    for _ in 0..n_readers {
        let spin = Arc::clone(&spin);
        readers.push(thread::spawn(move || {
            let mut n_ops = 0_usize;
            let start = time::Instant::now();
            while start.elapsed() < time::Duration::from_secs(1) {
                {
                    let data = spin.read();
                    let first = data[0];
                    // a writer can never be seen mid-update.
                    assert!(data.iter().all(|item| *item == first), "torn read");
                }
                n_ops += 1;
            }
            n_ops
        }));
    }

    for (idx, writer) in writers.into_iter().enumerate() {
        let n_ops = writer.join().unwrap();
        println!("test_spinlock_rw writer-{} {} ops", idx, n_ops);
        assert!(n_ops > 0);
    }
    for (idx, reader) in readers.into_iter().enumerate() {
        let n_ops = reader.join().unwrap();
        println!("test_spinlock_rw reader-{} {} ops", idx, n_ops);
        assert!(n_ops > 0);
    }
}

#[test]
fn test_spinlock_value() {
    let spin = Spinlock::new(10_i32);
    assert_eq!(*spin.read(), 10);

    *spin.write() = 20;
    assert_eq!(*spin.read(), 20);
}
