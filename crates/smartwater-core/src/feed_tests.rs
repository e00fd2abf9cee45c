use chrono::Utc;

use crate::feed::{
    latest_metrics, normalize_feeds, normalize_record_in, parse_binary, parse_numeric, FeedRecord,
    FeedResponse, FieldKind, NormalizedSample, FIELD_TABLE,
};

fn record(entry_id: u64) -> FeedRecord {
    FeedRecord {
        created_at: "2025-03-01T10:15:30Z".to_string(),
        entry_id,
        ..FeedRecord::default()
    }
}

#[test]
fn sparse_record_fills_missing_channels_with_defaults() {
    // Arrange
    let raw = FeedRecord {
        field1: Some("12.5".to_string()),
        field2: Some("1".to_string()),
        field4: Some("0".to_string()),
        field8: Some("3.75".to_string()),
        ..record(7)
    };

    // Act
    let sample = normalize_record_in(&raw, &Utc);

    // Assert
    assert_eq!(sample.level_cm, 12.5);
    assert!(sample.object_detected);
    assert_eq!(sample.distance_cm, 0.0);
    assert!(!sample.pump_on);
    assert!(!sample.level_ok);
    assert!(!sample.storage_ok);
    assert!(!sample.buzzer_active);
    assert_eq!(sample.pump_runtime_hours, 3.75);
    assert_eq!(sample.entry_id, 7);
    assert_eq!(sample.time, "10:15:30");
}

#[test]
fn empty_record_normalizes_to_all_defaults() {
    let sample = normalize_record_in(&FeedRecord::default(), &Utc);

    assert_eq!(
        NormalizedSample {
            time: String::new(),
            ..NormalizedSample::default()
        },
        sample
    );
    for idx in 0..8 {
        assert_eq!(sample.value(idx), Some(0.0));
    }
}

#[test]
fn only_exact_one_is_true_for_binary_channels() {
    assert!(parse_binary(Some("1")));
    for raw in ["0", "", " 1", "1 ", "1.0", "true", "yes", "01"] {
        assert!(!parse_binary(Some(raw)), "{raw:?} must be false");
    }
    assert!(!parse_binary(None));
}

#[test]
fn unparsable_numbers_default_to_zero() {
    assert_eq!(parse_numeric(Some(" 42.25 ")), 42.25);
    assert_eq!(parse_numeric(Some("-3")), -3.0);
    assert_eq!(parse_numeric(Some("abc")), 0.0);
    assert_eq!(parse_numeric(Some("")), 0.0);
    assert_eq!(parse_numeric(Some("NaN")), 0.0);
    assert_eq!(parse_numeric(Some("inf")), 0.0);
    assert_eq!(parse_numeric(None), 0.0);
}

#[test]
fn numbers_with_trailing_text_keep_their_leading_value() {
    assert_eq!(parse_numeric(Some("12.5cm")), 12.5);
    assert_eq!(parse_numeric(Some("3.7\r\n")), 3.7);
    assert_eq!(parse_numeric(Some("  -4.5 degrees")), -4.5);
    assert_eq!(parse_numeric(Some("1.5e2x")), 150.0);
    assert_eq!(parse_numeric(Some("7e")), 7.0);
    assert_eq!(parse_numeric(Some(".5")), 0.5);
    assert_eq!(parse_numeric(Some("5.")), 5.0);
    assert_eq!(parse_numeric(Some("cm12")), 0.0);
    assert_eq!(parse_numeric(Some("-")), 0.0);
    assert_eq!(parse_numeric(Some(".")), 0.0);
    assert_eq!(parse_numeric(Some("1e999")), 0.0);
}

#[test]
fn series_keeps_upstream_order() {
    let feeds = vec![record(101), record(102), record(103)];

    let series = normalize_feeds(&feeds);

    let ids: Vec<u64> = series.iter().map(|s| s.entry_id).collect();
    assert_eq!(ids, vec![101, 102, 103]);
    assert_eq!(latest_metrics(&series).entry_id, 103);
}

#[test]
fn latest_of_empty_series_is_all_default() {
    assert_eq!(latest_metrics(&[]), NormalizedSample::default());
}

#[test]
fn unparsable_timestamp_is_shown_verbatim() {
    let raw = FeedRecord {
        created_at: "yesterday".to_string(),
        ..FeedRecord::default()
    };

    let sample = normalize_record_in(&raw, &Utc);

    assert_eq!(sample.time, "yesterday");
    assert!(sample.created_at.is_none());
}

#[test]
fn feed_response_decodes_null_and_numeric_fields() {
    // Arrange
    let body = r#"{
        "channel": {"id": 9, "name": "tank"},
        "feeds": [
            {
                "created_at": "2025-03-01T10:00:00Z",
                "entry_id": 1,
                "field1": "20.5",
                "field2": null,
                "field8": 1.5
            },
            {"created_at": "2025-03-01T10:00:15Z", "entry_id": 2, "field4": "1"}
        ]
    }"#;

    // Act
    let response: FeedResponse = serde_json::from_str(body).expect("decode");
    let series = normalize_feeds(&response.feeds);

    // Assert
    assert_eq!(response.feeds[0].field2, None);
    assert_eq!(response.feeds[0].field8.as_deref(), Some("1.5"));
    assert_eq!(series[0].pump_runtime_hours, 1.5);
    assert!(series[1].pump_on);
    assert_eq!(series[1].level_cm, 0.0);
}

#[test]
fn missing_feeds_key_is_a_decode_error() {
    let decoded = serde_json::from_str::<FeedResponse>(r#"{"channel": {}}"#);

    assert!(decoded.is_err());
}

#[test]
fn binary_channels_ignore_non_string_json_values() {
    // Arrange
    let body = r#"{
        "channel": {},
        "feeds": [
            {
                "entry_id": 1,
                "field1": 12,
                "field2": true,
                "field4": 1,
                "field5": "1",
                "field8": false
            }
        ]
    }"#;

    // Act
    let response: FeedResponse = serde_json::from_str(body).expect("decode");
    let sample = normalize_record_in(&response.feeds[0], &Utc);

    // Assert
    assert_eq!(response.feeds[0].field2, None);
    assert_eq!(response.feeds[0].field4, None);
    assert!(!sample.object_detected);
    assert!(!sample.pump_on);
    assert!(sample.level_ok);
    assert_eq!(sample.level_cm, 12.0);
    assert_eq!(sample.pump_runtime_hours, 0.0);
}

#[test]
fn binary_channels_plot_as_zero_or_one() {
    let raw = FeedRecord {
        field1: Some("5".to_string()),
        field2: Some("1".to_string()),
        field3: Some("9".to_string()),
        field4: Some("1".to_string()),
        field5: Some("1".to_string()),
        field6: Some("1".to_string()),
        field7: Some("1".to_string()),
        field8: Some("2".to_string()),
        ..record(1)
    };
    let sample = normalize_record_in(&raw, &Utc);

    for (idx, field) in FIELD_TABLE.iter().enumerate() {
        let value = sample.value(idx).expect("channel");
        match field.kind {
            FieldKind::Binary => assert_eq!(value, 1.0, "{}", field.key),
            FieldKind::Numeric => assert!(value > 1.0, "{}", field.key),
        }
    }
    assert_eq!(sample.value(8), None);
}
