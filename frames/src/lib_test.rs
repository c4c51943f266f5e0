use super::*;
use serde_json::json;

fn decode_value(value: Value) -> Result<Frame, CodecError> {
    decode_frame(&value.to_string())
}

#[test]
fn frame_type_numeric_mapping_matches_wire() {
    assert_eq!(FrameType::Control.as_u8(), 1);
    assert_eq!(FrameType::Send.as_u8(), 2);
    assert_eq!(FrameType::Ack.as_u8(), 3);
    assert_eq!(FrameType::Request.as_u8(), 4);
    assert_eq!(FrameType::Response.as_u8(), 5);
}

#[test]
fn handshake_encodes_to_documented_tuple() {
    let text = encode_frame(&Frame::handshake());
    let value: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(value, json!(["", 1, {"type": "ack"}, null]));
}

#[test]
fn refresh_encodes_to_documented_tuple() {
    let text = encode_frame(&Frame::refresh());
    let value: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(value, json!(["", 1, {"type": "refresh"}, null]));
}

#[test]
fn request_encodes_typed_payload() {
    let frame = Frame::request("c1", Message::new("storage:get", json!({"key": "k"})));
    let value: Value = serde_json::from_str(&encode_frame(&frame)).expect("json");
    assert_eq!(value, json!(["c1", 4, {"type": "storage:get", "value": {"key": "k"}}, null]));
}

#[test]
fn error_response_puts_message_in_fourth_slot() {
    let frame = Frame::response("c9", Err("boom".to_owned()));
    let value: Value = serde_json::from_str(&encode_frame(&frame)).expect("json");
    assert_eq!(value, json!(["c9", 5, null, "boom"]));
}

#[test]
fn decode_round_trips_every_frame_type() {
    let frames = [
        Frame::handshake(),
        Frame::refresh(),
        Frame::send("a", Message::new("clipboard:write", json!("text"))),
        Frame::ack("a"),
        Frame::request("b", Message::new("echo", json!([1, 2, {"x": null}]))),
        Frame::response("b", Ok(json!({"nested": {"ok": true}}))),
        Frame::response("b", Err("failed".to_owned())),
    ];

    for frame in frames {
        let decoded = decode_frame(&encode_frame(&frame)).expect("decode");
        assert_eq!(decoded, frame);
    }
}

#[test]
fn decode_accepts_three_element_form() {
    let frame = decode_value(json!(["x", 2, {"type": "notify", "value": 1}])).expect("decode");
    assert_eq!(frame.channel_id, "x");
    assert_eq!(frame.body, Body::Send(Message::new("notify", 1)));
}

#[test]
fn decode_defaults_missing_message_value_to_null() {
    let frame = decode_value(json!(["x", 4, {"type": "ping"}, null])).expect("decode");
    assert_eq!(frame.body, Body::Request(Message::new("ping", Value::Null)));
}

#[test]
fn decode_keeps_unknown_control_purpose() {
    let frame = decode_value(json!(["", 1, {"type": "wake"}, null])).expect("decode");
    assert_eq!(frame.body, Body::Control(Control::Other("wake".into())));
}

#[test]
fn decode_null_response_payload_is_ok_null() {
    let frame = decode_value(json!(["r", 5, null, null])).expect("decode");
    assert_eq!(frame.body, Body::Response(Ok(Value::Null)));
}

#[test]
fn decode_rejects_malformed_json() {
    let err = decode_frame("[\"a\", 2,").expect_err("should fail");
    assert!(matches!(err, CodecError::Json(_)));
}

#[test]
fn decode_rejects_non_array() {
    let err = decode_value(json!({"channel": "a"})).expect_err("should fail");
    assert!(matches!(err, CodecError::NotArray));
}

#[test]
fn decode_rejects_wrong_arity() {
    let err = decode_value(json!(["a", 3])).expect_err("should fail");
    assert!(matches!(err, CodecError::Arity(2)));

    let err = decode_value(json!(["a", 3, null, null, null])).expect_err("should fail");
    assert!(matches!(err, CodecError::Arity(5)));
}

#[test]
fn decode_rejects_non_string_channel_id() {
    let err = decode_value(json!([7, 3, null, null])).expect_err("should fail");
    assert!(matches!(err, CodecError::InvalidChannelId));
}

#[test]
fn decode_rejects_out_of_range_frame_type() {
    let err = decode_value(json!(["a", 9, null, null])).expect_err("should fail");
    assert!(matches!(err, CodecError::InvalidFrameType(v) if v == json!(9)));

    let err = decode_value(json!(["a", "2", null, null])).expect_err("should fail");
    assert!(matches!(err, CodecError::InvalidFrameType(_)));
}

#[test]
fn decode_rejects_request_without_typed_payload() {
    let err = decode_value(json!(["a", 4, {"value": 1}, null])).expect_err("should fail");
    assert!(matches!(err, CodecError::InvalidPayload { frame_type: FrameType::Request, .. }));

    let err = decode_value(json!(["a", 2, null, null])).expect_err("should fail");
    assert!(matches!(err, CodecError::InvalidPayload { frame_type: FrameType::Send, .. }));
}

#[test]
fn decode_rejects_control_without_type() {
    let err = decode_value(json!(["", 1, {}, null])).expect_err("should fail");
    assert!(matches!(err, CodecError::InvalidPayload { frame_type: FrameType::Control, .. }));
}

#[test]
fn decode_rejects_control_with_channel_id() {
    let err = decode_value(json!(["abc", 1, {"type": "ack"}, null])).expect_err("should fail");
    assert!(matches!(err, CodecError::ControlChannelId(id) if id == "abc"));
}

#[test]
fn decode_rejects_data_frame_on_reserved_channel() {
    let err = decode_value(json!(["", 3, null, null])).expect_err("should fail");
    assert!(matches!(err, CodecError::MissingChannelId(FrameType::Ack)));
}

#[test]
fn decode_rejects_non_string_error_slot() {
    let err = decode_value(json!(["a", 5, null, {"code": 1}])).expect_err("should fail");
    assert!(matches!(err, CodecError::InvalidError));
}
