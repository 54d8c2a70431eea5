//! End-to-end decode/encode scenarios with byte-exact inputs and outputs.

use bytes::Bytes;
use protoloom::layout::{FieldSpec, FieldType, Label, LayoutId, LayoutSet, MessageSpec};
use protoloom::{
    Arena, ArenaOptions, DecodeErrorKind, DecodeOptions, EncodeOptions, Message, Value, decode,
    encode_to_vec, merge,
};

fn build(set: &mut LayoutSet, fields: Vec<FieldSpec>) -> LayoutId {
    set.build_message(&MessageSpec {
        fields,
        ..MessageSpec::default()
    })
    .expect("invalid layout")
}

fn reencode(message: Message<'_>, arena: &Arena) -> Vec<u8> {
    encode_to_vec(message, arena, &EncodeOptions::new()).expect("encode failed")
}

fn packed_int32(number: u32) -> FieldSpec {
    FieldSpec {
        label: Label::Repeated,
        packed: true,
        ..FieldSpec::new(number, FieldType::Int32)
    }
}

#[test]
fn test_varint_round_trip() {
    let mut set = LayoutSet::new();
    let id = build(&mut set, vec![FieldSpec::new(1, FieldType::Int32)]);
    let input: &'static [u8] = &[0x08, 0x96, 0x01];

    let mut arena = Arena::new();
    let message = decode(
        set.message(id),
        Bytes::from_static(input),
        &mut arena,
        &DecodeOptions::new(),
    )
    .expect("decode failed");
    let f1 = message.field(1).unwrap();
    assert!(message.has(&arena, f1));
    assert_eq!(message.get(&arena, f1), Value::I32(150));
    assert_eq!(reencode(message, &arena), input);
}

#[test]
fn test_packed_repeated() {
    let mut set = LayoutSet::new();
    let id = build(&mut set, vec![packed_int32(2)]);
    let input: &'static [u8] = &[0x12, 0x06, 0x03, 0x8E, 0x02, 0x9E, 0xA7, 0x05];

    let mut arena = Arena::new();
    let message = decode(
        set.message(id),
        Bytes::from_static(input),
        &mut arena,
        &DecodeOptions::new(),
    )
    .expect("decode failed");
    let f2 = message.field(2).unwrap();
    let values: Vec<_> = message.array_iter(&arena, f2).collect();
    assert_eq!(
        values,
        [Value::I32(3), Value::I32(270), Value::I32(86942)]
    );
    assert_eq!(reencode(message, &arena), input);
}

#[test]
fn test_unpacked_input_for_packed_field() {
    let mut set = LayoutSet::new();
    let id = build(&mut set, vec![packed_int32(2)]);
    let input = Bytes::from_static(&[0x10, 0x03, 0x10, 0x8E, 0x02, 0x10, 0x9E, 0xA7, 0x05]);

    let mut arena = Arena::new();
    let message =
        decode(set.message(id), input, &mut arena, &DecodeOptions::new()).expect("decode failed");
    let f2 = message.field(2).unwrap();
    assert_eq!(message.array_len(&arena, f2), 3);
    assert_eq!(message.array_get(&arena, f2, 0), Some(Value::I32(3)));
    assert_eq!(message.array_get(&arena, f2, 1), Some(Value::I32(270)));
    assert_eq!(message.array_get(&arena, f2, 2), Some(Value::I32(86942)));

    // Written back in the declared packed form.
    assert_eq!(
        reencode(message, &arena),
        [0x12, 0x06, 0x03, 0x8E, 0x02, 0x9E, 0xA7, 0x05]
    );
}

#[test]
fn test_nested_message() {
    let mut set = LayoutSet::new();
    let b = build(&mut set, vec![FieldSpec::new(1, FieldType::Int32)]);
    let a = build(&mut set, vec![FieldSpec::new(3, FieldType::Message)]);
    set.link_message(a, 3, b).expect("link failed");
    let input: &'static [u8] = &[0x1A, 0x03, 0x08, 0x2A];

    let mut arena = Arena::new();
    let message = decode(
        set.message(a),
        Bytes::from_static(input),
        &mut arena,
        &DecodeOptions::new(),
    )
    .expect("decode failed");
    let f3 = message.field(3).unwrap();
    assert!(message.has(&arena, f3));

    let child = message.get_submessage(&arena, f3).unwrap();
    let f1 = child.field(1).unwrap();
    assert!(child.has(&arena, f1));
    assert_eq!(child.get(&arena, f1), Value::I32(42));
    assert_eq!(reencode(message, &arena), input);
}

#[test]
fn test_oneof_last_member_wins() {
    let mut set = LayoutSet::new();
    let id = set
        .build_message(&MessageSpec {
            fields: vec![
                FieldSpec {
                    oneof: Some(0),
                    ..FieldSpec::new(5, FieldType::Int32)
                },
                FieldSpec {
                    oneof: Some(0),
                    ..FieldSpec::new(6, FieldType::String)
                },
            ],
            oneof_count: 1,
            ..MessageSpec::default()
        })
        .expect("invalid layout");
    let input: &'static [u8] = &[0x28, 0x07, 0x32, 0x03, 0x66, 0x6F, 0x6F];

    let mut arena = Arena::new();
    let message = decode(
        set.message(id),
        Bytes::from_static(input),
        &mut arena,
        &DecodeOptions::new(),
    )
    .expect("decode failed");
    let f5 = message.field(5).unwrap();
    let f6 = message.field(6).unwrap();
    assert!(!message.has(&arena, f5));
    assert!(message.has(&arena, f6));
    assert_eq!(message.get(&arena, f6).as_str(), Some("foo"));
    assert_eq!(message.which_oneof(&arena, 0), 6);
    assert_eq!(reencode(message, &arena), &input[2..]);
}

#[test]
fn test_unknown_fields_are_preserved() {
    let mut set = LayoutSet::new();
    let id = build(&mut set, vec![FieldSpec::new(1, FieldType::Int32)]);
    let input: &'static [u8] = &[0x08, 0x05, 0x10, 0x09];

    let mut arena = Arena::new();
    let message = decode(
        set.message(id),
        Bytes::from_static(input),
        &mut arena,
        &DecodeOptions::new(),
    )
    .expect("decode failed");
    let f1 = message.field(1).unwrap();
    assert!(message.has(&arena, f1));
    assert_eq!(message.get(&arena, f1), Value::I32(5));
    assert_eq!(message.unknown_fields(&arena), &[0x10, 0x09]);
    assert_eq!(reencode(message, &arena), input);
}

#[test]
fn test_newer_layout_recovers_unknown_fields() {
    let mut set = LayoutSet::new();
    let old = build(&mut set, vec![FieldSpec::new(1, FieldType::Int32)]);
    let new = build(
        &mut set,
        vec![
            FieldSpec::new(1, FieldType::Int32),
            FieldSpec::new(2, FieldType::String),
            FieldSpec {
                label: Label::Repeated,
                ..FieldSpec::new(3, FieldType::Fixed64)
            },
        ],
    );
    let input = Bytes::from_static(&[
        0x08, 0x01, 0x12, 0x02, b'h', b'i', 0x19, 1, 0, 0, 0, 0, 0, 0, 0, 0x19, 2, 0, 0, 0, 0, 0,
        0, 0,
    ]);

    let mut arena = Arena::new();
    let options = DecodeOptions::new();
    let legacy = decode(set.message(old), input.clone(), &mut arena, &options).expect("decode failed");
    assert_eq!(legacy.unknown_fields(&arena).len(), input.len() - 2);

    let bytes = Bytes::from(reencode(legacy, &arena));
    let current = decode(set.message(new), bytes, &mut arena, &options).expect("decode failed");
    assert_eq!(current.get(&arena, current.field(1).unwrap()), Value::I32(1));
    assert_eq!(
        current.get(&arena, current.field(2).unwrap()).as_str(),
        Some("hi")
    );
    let f3 = current.field(3).unwrap();
    let values: Vec<_> = current.array_iter(&arena, f3).collect();
    assert_eq!(values, [Value::U64(1), Value::U64(2)]);
    assert!(current.unknown_fields(&arena).is_empty());
}

#[test]
fn test_merging_twice_keeps_scalars_and_doubles_repeated() {
    let mut set = LayoutSet::new();
    let id = build(
        &mut set,
        vec![FieldSpec::new(1, FieldType::Int64), packed_int32(2)],
    );
    let input = Bytes::from_static(&[0x08, 0x2A, 0x12, 0x02, 0x01, 0x02]);

    let mut arena = Arena::new();
    let options = DecodeOptions::new();
    let message = Message::new(set.message(id), &mut arena).expect("arena full");
    merge(message, input.clone(), &mut arena, &options).expect("merge failed");
    let f1 = message.field(1).unwrap();
    let f2 = message.field(2).unwrap();
    assert_eq!(message.get(&arena, f1), Value::I64(42));
    assert_eq!(message.array_len(&arena, f2), 2);

    merge(message, input, &mut arena, &options).expect("merge failed");
    assert_eq!(message.get(&arena, f1), Value::I64(42));
    let values: Vec<_> = message.array_iter(&arena, f2).collect();
    assert_eq!(
        values,
        [Value::I32(1), Value::I32(2), Value::I32(1), Value::I32(2)]
    );
}

#[test]
fn test_malformed_merge_leaves_message_alone() {
    let mut set = LayoutSet::new();
    let id = build(
        &mut set,
        vec![
            FieldSpec::new(1, FieldType::Int32),
            FieldSpec::new(2, FieldType::Bytes),
        ],
    );
    let mut arena = Arena::new();
    let options = DecodeOptions::new();
    let message = decode(
        set.message(id),
        Bytes::from_static(&[0x08, 0x01]),
        &mut arena,
        &options,
    )
    .expect("decode failed");

    // Field 1 is valid, then field 2 claims more bytes than there are.
    let err = merge(
        message,
        Bytes::from_static(&[0x08, 0x07, 0x12, 0x09, 0x00]),
        &mut arena,
        &options,
    )
    .unwrap_err();
    assert_eq!(err.kind(), DecodeErrorKind::UnexpectedEndOfBuffer);
    assert_eq!(message.get(&arena, message.field(1).unwrap()), Value::I32(1));
    assert!(!message.has(&arena, message.field(2).unwrap()));
}

#[test]
fn test_wire_errors() {
    let mut set = LayoutSet::new();
    let id = build(&mut set, vec![FieldSpec::new(1, FieldType::Int32)]);
    let options = DecodeOptions::new();

    let cases: [(&'static [u8], DecodeErrorKind); 5] = [
        // Eleven continuation bytes.
        (
            &[0x08, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01],
            DecodeErrorKind::MalformedVarint,
        ),
        // Input ends inside the varint.
        (&[0x08, 0x96], DecodeErrorKind::MalformedVarint),
        // Wire type 7.
        (&[0x0F], DecodeErrorKind::MalformedTag),
        // Field number 0.
        (&[0x00, 0x01], DecodeErrorKind::MalformedTag),
        // Unknown fixed32 cut short.
        (&[0x15, 0x01, 0x02], DecodeErrorKind::UnexpectedEndOfBuffer),
    ];
    for (input, expected) in cases {
        let mut arena = Arena::new();
        let err = decode(set.message(id), Bytes::from_static(input), &mut arena, &options)
            .unwrap_err();
        assert_eq!(err.kind(), expected, "input {input:02X?}");
    }
}

#[test]
fn test_arena_limit_reports_out_of_memory() {
    let mut set = LayoutSet::new();
    let id = build(
        &mut set,
        vec![FieldSpec {
            label: Label::Repeated,
            ..FieldSpec::new(1, FieldType::Bytes)
        }],
    );
    let mut input = Vec::new();
    for _ in 0..32 {
        input.extend_from_slice(&[0x0A, 0x10]);
        input.extend_from_slice(&[0xAB; 16]);
    }

    let mut options = ArenaOptions::new();
    options.initial_block_size(64).limit(256);
    let mut arena = Arena::with_options(&options);
    let err = decode(
        set.message(id),
        Bytes::from(input.clone()),
        &mut arena,
        &DecodeOptions::new(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), DecodeErrorKind::OutOfMemory);

    let mut arena = Arena::new();
    let message = decode(
        set.message(id),
        Bytes::from(input),
        &mut arena,
        &DecodeOptions::new(),
    )
    .expect("decode failed");
    assert_eq!(message.array_len(&arena, message.field(1).unwrap()), 32);
}
