//! Unit tests for decoding reassembled harness messages.

use liftlink::measurement::{
    parse_frame, CompanionStatus, ControlSignal, DeviceMessage, FrameReassembler, ParseError,
    Sample, SensorSource,
};

fn decode(stream: &[u8]) -> Vec<Result<DeviceMessage, ParseError>> {
    let mut reassembler = FrameReassembler::default();
    reassembler.feed(stream).iter().map(parse_frame).collect()
}

#[test]
fn test_malformed_fragment_between_good_records() {
    let results = decode(br#"{"id":"MASTER","idx":0,"angle":1.5}{"id":"MASTER",,}{"id":"SLAVE","idx":0,"angle":2}"#);

    assert_eq!(results.len(), 3);
    assert_eq!(
        results[0],
        Ok(DeviceMessage::Sample(Sample::new(SensorSource::Primary, 0, 1.5, 0)))
    );
    assert!(matches!(results[1], Err(ParseError::InvalidJson(_))));
    assert_eq!(
        results[2],
        Ok(DeviceMessage::Sample(Sample::new(SensorSource::Secondary, 0, 2.0, 0)))
    );
}

#[test]
fn test_missing_index_and_time_default_to_zero() {
    let results = decode(br#"{"id":"SLAVE","angle":12}"#);
    assert_eq!(
        results,
        vec![Ok(DeviceMessage::Sample(Sample::new(SensorSource::Secondary, 0, 12.0, 0)))]
    );
}

#[test]
fn test_status_tokens_and_noise() {
    let results = decode(b"SLAVE_OK hello SLAVE_ERROR END");
    assert_eq!(
        results,
        vec![
            Ok(DeviceMessage::Control(ControlSignal::Companion(CompanionStatus::Ok))),
            Err(ParseError::UnknownToken("hello".to_string())),
            Ok(DeviceMessage::Control(ControlSignal::Companion(CompanionStatus::Error))),
            Ok(DeviceMessage::Control(ControlSignal::EndOfStream)),
        ]
    );
}

#[test]
fn test_truncated_record_before_end_is_an_error() {
    let results = decode(br#"{"id":"MASTER","idx":4END"#);
    assert_eq!(results.len(), 2);
    assert!(results[0].is_err());
    assert_eq!(results[1], Ok(DeviceMessage::Control(ControlSignal::EndOfStream)));
}
