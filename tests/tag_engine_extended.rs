use edge_gateway::tags::engine::TagEngine;
use edge_gateway::tags::structures::{Quality, Tag, TagMetadata, TagValue, ValueVariant};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::time::timeout;

fn sample_tag(path: &str, driver_id: &str, address: &str) -> Tag {
    Tag {
        path: path.to_string(),
        value: TagValue::new(ValueVariant::I64(0), Quality::Good),
        driver_id: driver_id.to_string(),
        driver_address: address.to_string(),
        poll_rate_ms: 1000,
        metadata: TagMetadata::default(),
    }
}

#[test]
fn duplicate_tag_registration_overwrites() {
    let engine = TagEngine::new();
    let tag1 = sample_tag("Device/Tag1", "drv1", "addr1");
    let tag2 = sample_tag("Device/Tag1", "drv2", "addr2");

    engine.register_tag(tag1.clone());
    engine.register_tag(tag2.clone());

    let details = engine.get_tag_details("Device/Tag1").expect("details should exist");
    assert_eq!(details.driver_id, "drv2");
    assert_eq!(engine.get_all_tag_paths().len(), 1);
}

#[test]
fn value_types_round_trip_through_the_engine() {
    let engine = TagEngine::new();

    let bool_tag = Tag {
        path: "Test/Bool".to_string(),
        value: TagValue::new(ValueVariant::Bool(true), Quality::Good),
        ..sample_tag("Test/Bool", "test", "bool_addr")
    };
    let float_tag = Tag {
        path: "Test/Float".to_string(),
        value: TagValue::new(ValueVariant::F64(3.14159), Quality::Good),
        ..sample_tag("Test/Float", "test", "float_addr")
    };
    let string_tag = Tag {
        path: "Test/String".to_string(),
        value: TagValue::new(ValueVariant::String("Hello World".to_string()), Quality::Good),
        ..sample_tag("Test/String", "test", "string_addr")
    };

    engine.register_tag(bool_tag);
    engine.register_tag(float_tag);
    engine.register_tag(string_tag);

    assert_eq!(engine.read_tag("Test/Bool").unwrap().value, ValueVariant::Bool(true));
    assert_eq!(engine.read_tag("Test/Float").unwrap().value, ValueVariant::F64(3.14159));
    assert_eq!(
        engine.read_tag("Test/String").unwrap().value,
        ValueVariant::String("Hello World".to_string())
    );
}

#[test]
fn all_quality_levels_are_preserved() {
    let engine = TagEngine::new();

    let qualities = [
        Quality::Good,
        Quality::Uncertain,
        Quality::Bad,
        Quality::Initializing,
        Quality::CommFailure,
        Quality::ConfigError,
    ];

    for (i, quality) in qualities.iter().enumerate() {
        let tag = Tag {
            value: TagValue::new(ValueVariant::I64(i as i64), *quality),
            ..sample_tag(&format!("Test/Quality{i}"), "test", &format!("addr{i}"))
        };
        engine.register_tag(tag);
        let read = engine.read_tag(&format!("Test/Quality{i}")).unwrap();
        assert_eq!(read.quality, *quality);
    }
}

#[test]
fn concurrent_reads_and_writes_leave_every_tag_readable() {
    let engine = Arc::new(TagEngine::new());

    for i in 0..10 {
        engine.register_tag(sample_tag(&format!("Concurrent/Tag{i}"), "test", &format!("addr{i}")));
    }

    let mut handles = vec![];
    for i in 0..5i64 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            for j in 0..100i64 {
                let tag_path = format!("Concurrent/Tag{}", j % 10);
                let new_value = TagValue::new(ValueVariant::I64(i * 100 + j), Quality::Good);
                engine.update_tag_value(&tag_path, new_value);
                let _ = engine.read_tag(&tag_path);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for i in 0..10 {
        assert!(engine.read_tag(&format!("Concurrent/Tag{i}")).is_some());
    }
}

#[test]
fn a_large_number_of_tags_all_remain_reachable() {
    let engine = TagEngine::new();
    let tag_count = 20_000;

    for i in 0..tag_count {
        engine.register_tag(sample_tag(&format!("Load/Tag{i:05}"), "load_test", &format!("addr{i}")));
    }

    let all_paths = engine.get_all_tag_paths();
    assert_eq!(all_paths.len(), tag_count);

    for i in (0..tag_count).step_by(1000) {
        assert!(engine.read_tag(&format!("Load/Tag{i:05}")).is_some());
    }
}

#[tokio::test]
async fn get_all_tags_completes_within_a_timeout() {
    let engine = TagEngine::new();
    for i in 0..5 {
        engine.register_tag(sample_tag(&format!("Async/Tag{i}"), "async_test", &format!("addr{i}")));
    }

    let result = timeout(Duration::from_secs(5), engine.get_all_tags()).await;
    assert!(result.is_ok());
    assert_eq!(result.unwrap().len(), 5);
}

#[test]
fn tag_metadata_round_trips() {
    let engine = TagEngine::new();

    let metadata = TagMetadata {
        description: Some("Temperature sensor reading".to_string()),
        eng_unit: Some("°C".to_string()),
        eng_low: Some(-40.0),
        eng_high: Some(120.0),
        writable: false,
    };

    let tag = Tag {
        metadata,
        value: TagValue::new(ValueVariant::F64(25.5), Quality::Good),
        ..sample_tag("Plant/Temperature", "modbus1", "40001")
    };

    engine.register_tag(tag);

    let details = engine.get_tag_details("Plant/Temperature").expect("tag should exist");
    assert_eq!(details.metadata.description, Some("Temperature sensor reading".to_string()));
    assert_eq!(details.metadata.eng_unit, Some("°C".to_string()));
    assert_eq!(details.metadata.eng_low, Some(-40.0));
    assert_eq!(details.metadata.eng_high, Some(120.0));
    assert!(!details.metadata.writable);
}

#[test]
fn operations_on_unknown_tags_fail_gracefully() {
    let engine = TagEngine::new();

    assert!(engine.read_tag("NonExistent/Tag").is_none());
    assert!(engine.get_tag_details("NonExistent/Tag").is_none());
    assert!(!engine.update_tag_value("NonExistent/Tag", TagValue::new(ValueVariant::I64(42), Quality::Good)));
    assert!(engine.find_path_by_address("NonExistent", "addr").is_none());
}

#[test]
fn updating_a_tag_advances_its_timestamp() {
    let engine = TagEngine::new();
    engine.register_tag(sample_tag("Time/Test", "driver", "addr"));

    let initial_timestamp = engine.read_tag("Time/Test").unwrap().timestamp;

    thread::sleep(Duration::from_millis(10));
    engine.update_tag_value("Time/Test", TagValue::new(ValueVariant::I64(100), Quality::Good));

    let updated = engine.read_tag("Time/Test").unwrap();
    assert!(updated.timestamp > initial_timestamp);
    assert_eq!(updated.value, ValueVariant::I64(100));
}
