use std::path::PathBuf;

use tally::error::{exit_codes, Error, JsonError};

#[test]
fn exit_codes_map_correctly() {
    let user = Error::InvalidArgument("bad".to_string());
    assert_eq!(user.exit_code(), exit_codes::USER_ERROR);

    let missing = Error::TranscriptNotFound(PathBuf::from("chat.jsonl"));
    assert_eq!(missing.exit_code(), exit_codes::USER_ERROR);

    let op = Error::SourceUnavailable("not attached".to_string());
    assert_eq!(op.exit_code(), exit_codes::OPERATION_FAILED);

    let consumer = Error::ConsumerFailure {
        consumer: "task_app".to_string(),
        reason: "boom".to_string(),
    };
    assert_eq!(consumer.exit_code(), exit_codes::OPERATION_FAILED);
}

#[test]
fn json_error_includes_code_and_details() {
    let err = Error::ExtractionFailure {
        key: "points".to_string(),
        reason: "panicked".to_string(),
    };
    let json = JsonError::from(&err);
    assert_eq!(json.code, exit_codes::OPERATION_FAILED);
    assert!(json.error.contains("Extractor 'points' failed"));
    assert_eq!(
        json.details.expect("details")["pattern_key"],
        serde_json::json!("points")
    );
}

#[test]
fn only_source_errors_are_transient() {
    assert!(Error::SourceUnavailable("x".to_string()).is_transient());
    assert!(!Error::InvalidConfig("x".to_string()).is_transient());
    assert!(!Error::MalformedTranscript {
        line: 1,
        reason: "x".to_string()
    }
    .is_transient());
}
