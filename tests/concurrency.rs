use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use shared_map::SharedMap;

#[test]
fn disjoint_writers_fill_the_map() {
    let map = Arc::new(SharedMap::new(32_768, 8, 8).unwrap());
    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();

    for prefix in ["a", "b"] {
        let map = Arc::clone(&map);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..10_000 {
                map.set(&format!("{}{}", prefix, i), &i.to_string()).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.len(), 20_000);
    for prefix in ["a", "b"] {
        for i in 0..10_000 {
            assert_eq!(map.get(&format!("{}{}", prefix, i)), Some(i.to_string()));
        }
    }
}

#[test]
fn writers_racing_on_one_key_leave_one_value() {
    let workers = num_cpus::get().clamp(2, 8);
    let map = Arc::new(SharedMap::new(64, 8, 8).unwrap());
    let barrier = Arc::new(Barrier::new(workers));
    let mut handles = Vec::new();

    for worker in 0..workers {
        let map = Arc::clone(&map);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            map.set("shared", &worker.to_string()).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.len(), 1);
    let survivor = map.get("shared").unwrap();
    let survivor: usize = survivor.parse().unwrap();
    assert!(survivor < workers);
}

#[test]
fn deleter_chases_writer_to_empty() {
    const KEYS: usize = 1_000;
    let map = Arc::new(SharedMap::new(2_048, 8, 8).unwrap());
    let barrier = Arc::new(Barrier::new(2));

    let writer = {
        let map = Arc::clone(&map);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for i in 0..KEYS {
                map.set(&format!("k{}", i), "v").unwrap();
            }
        })
    };

    let deleter = {
        let map = Arc::clone(&map);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for i in 0..KEYS {
                let key = format!("k{}", i);
                // The writer may not have produced this key yet.
                while map.remove(&key).is_err() {
                    thread::yield_now();
                }
            }
        })
    };

    writer.join().unwrap();
    deleter.join().unwrap();

    assert_eq!(map.len(), 0);
    for i in 0..KEYS {
        assert_eq!(map.get(&format!("k{}", i)), None);
    }

    // The emptied map takes a full fresh load.
    for i in 0..KEYS {
        map.set(&format!("n{}", i), &i.to_string()).unwrap();
    }
    assert_eq!(map.len(), KEYS);
}

#[test]
fn iteration_only_yields_keys_that_existed() {
    let map = Arc::new(SharedMap::new(256, 8, 8).unwrap());
    let stop = Arc::new(AtomicBool::new(false));

    // The universe of keys the mutator will ever write.
    let universe: HashSet<String> = (0..64).map(|i| format!("k{}", i)).collect();
    for i in 0..32 {
        map.set(&format!("k{}", i), "v").unwrap();
    }

    let mutator = {
        let map = Arc::clone(&map);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut round = 0u32;
            while !stop.load(Ordering::Relaxed) {
                let key = format!("k{}", round % 64);
                if round % 3 == 0 {
                    let _ = map.remove(&key);
                } else {
                    map.set(&key, "v").unwrap();
                }
                round += 1;
            }
        })
    };

    for _ in 0..50 {
        for key in map.keys() {
            assert!(universe.contains(&key), "iterator yielded foreign key {:?}", key);
        }
    }

    stop.store(true, Ordering::Relaxed);
    mutator.join().unwrap();
}

#[test]
fn readers_and_writers_mix_across_handles() {
    // Two handles attached to one caller-owned region, exercised from
    // multiple threads: what two processes sharing a mapping would do.
    let size = SharedMap::region_size_for(1_024, 8, 8).unwrap();
    let words = size.div_ceil(8);
    let mut buf = vec![0u64; words];
    let region = std::ptr::NonNull::slice_from_raw_parts(
        std::ptr::NonNull::new(buf.as_mut_ptr() as *mut u8).unwrap(),
        words * 8,
    );

    let writer = Arc::new(unsafe { SharedMap::init_in(region, 1_024, 8, 8).unwrap() });
    let reader = Arc::new(unsafe { SharedMap::attach(region).unwrap() });
    let barrier = Arc::new(Barrier::new(2));

    let producing = {
        let writer = Arc::clone(&writer);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for i in 0..500 {
                writer.set(&format!("k{}", i), &i.to_string()).unwrap();
            }
        })
    };

    let consuming = {
        let reader = Arc::clone(&reader);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for i in 0..500 {
                let key = format!("k{}", i);
                // Spin until the writer's entry becomes visible.
                loop {
                    if let Some(value) = reader.get(&key) {
                        assert_eq!(value, i.to_string());
                        break;
                    }
                    thread::yield_now();
                }
            }
        })
    };

    producing.join().unwrap();
    consuming.join().unwrap();
    assert_eq!(reader.len(), 500);

    drop(writer);
    drop(reader);
    drop(buf);
}
