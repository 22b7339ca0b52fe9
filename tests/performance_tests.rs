use edge_gateway::tags::engine::TagEngine;
use edge_gateway::tags::structures::{Quality, Tag, TagMetadata, TagValue, ValueVariant};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio::time::{timeout, Duration};

fn create_sample_tag(index: usize) -> Tag {
    Tag {
        path: format!("Performance/Tag{index:06}"),
        value: TagValue::new(ValueVariant::F64(index as f64 * 1.5), Quality::Good),
        driver_id: format!("driver_{}", index % 10),
        driver_address: format!("addr_{index}"),
        poll_rate_ms: 1000,
        metadata: TagMetadata {
            description: Some(format!("Performance test tag {index}")),
            eng_unit: Some("units".to_string()),
            eng_low: Some(0.0),
            eng_high: Some(1000.0),
            writable: index % 5 == 0,
        },
    }
}

/// Scale smoke test: registering tens of thousands of tags completes and
/// every one of them stays reachable by path.
#[test]
fn registers_and_reads_back_a_large_batch_of_tags() {
    let engine = TagEngine::new();
    let tag_count = 20_000;

    let start = Instant::now();
    for i in 0..tag_count {
        engine.register_tag(create_sample_tag(i));
    }
    println!("registered {tag_count} tags in {:?}", start.elapsed());

    assert_eq!(engine.get_all_tag_paths().len(), tag_count);
    for i in (0..tag_count).step_by(500) {
        let path = format!("Performance/Tag{i:06}");
        assert!(engine.read_tag(&path).is_some());
    }
}

#[test]
fn concurrent_readers_observe_every_tag() {
    let engine = Arc::new(TagEngine::new());
    let tag_count = 10_000;
    let thread_count = 10;

    for i in 0..tag_count {
        engine.register_tag(create_sample_tag(i));
    }

    let mut handles = vec![];
    for thread_id in 0..thread_count {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            let per_thread = tag_count / thread_count;
            let start_idx = thread_id * per_thread;
            for i in start_idx..start_idx + per_thread {
                let path = format!("Performance/Tag{i:06}");
                assert!(engine.read_tag(&path).is_some());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn mixed_concurrent_reads_updates_and_lookups_leave_the_engine_consistent() {
    let engine = Arc::new(TagEngine::new());
    let tag_count = 5_000;
    let thread_count = 8;

    for i in 0..tag_count {
        engine.register_tag(create_sample_tag(i));
    }

    let mut handles = vec![];
    for thread_id in 0..thread_count {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            let ops_per_thread = tag_count / thread_count;
            for i in 0..ops_per_thread {
                let tag_idx = (thread_id * ops_per_thread + i) % tag_count;
                let path = format!("Performance/Tag{tag_idx:06}");
                match i % 3 {
                    0 => {
                        let _ = engine.read_tag(&path);
                    }
                    1 => {
                        engine.update_tag_value(&path, TagValue::new(ValueVariant::F64(i as f64), Quality::Good));
                    }
                    _ => {
                        let _ = engine.get_tag_details(&path);
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.get_all_tag_paths().len(), tag_count);
}

#[tokio::test]
async fn get_all_tags_stays_bounded_for_a_large_registry() {
    let engine = TagEngine::new();
    let tag_count = 5_000;
    for i in 0..tag_count {
        engine.register_tag(create_sample_tag(i));
    }

    let result = timeout(Duration::from_secs(10), engine.get_all_tags()).await;
    assert!(result.is_ok());
    assert_eq!(result.unwrap().len(), tag_count);
}

#[test]
fn driver_address_lookup_finds_every_registered_tag() {
    let engine = TagEngine::new();
    let tag_count = 20_000;

    for i in 0..tag_count {
        engine.register_tag(create_sample_tag(i));
    }

    let mut found_count = 0;
    for i in 0..tag_count {
        let driver_id = format!("driver_{}", i % 10);
        let address = format!("addr_{i}");
        if engine.find_path_by_address(&driver_id, &address).is_some() {
            found_count += 1;
        }
    }
    assert_eq!(found_count, tag_count);
}

#[test]
fn repeated_register_and_clear_cycles_converge_on_the_expected_count() {
    let engine = TagEngine::new();
    let cycles = 5;
    let tags_per_cycle = 2_000;

    for cycle in 0..cycles {
        for i in 0..tags_per_cycle {
            engine.register_tag(Tag {
                path: format!("Stress/Cycle{cycle}/Tag{i}"),
                value: TagValue::new(ValueVariant::I64(i as i64), Quality::Good),
                driver_id: "stress_driver".to_string(),
                driver_address: format!("cycle_{cycle}_addr_{i}"),
                poll_rate_ms: 1000,
                metadata: TagMetadata::default(),
            });
        }
        assert_eq!(engine.get_all_tag_paths().len(), (cycle + 1) * tags_per_cycle);
    }
}
