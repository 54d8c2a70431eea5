//! Property tests: reflection-level round trips, oneof exclusivity and the
//! dense field index.

use bytes::Bytes;
use proptest::prelude::*;
use proptest::property_test;
use protoloom::layout::{FieldSpec, FieldType, Label, LayoutId, LayoutSet, MessageKind, MessageSpec};
use protoloom::{
    Arena, DecodeOptions, EncodeOptions, MapKey, Message, Value, decode, encode_to_vec,
};

/// Field values of one `Sample`, `None` meaning unset.
#[derive(Debug, Clone)]
struct Sample {
    int32: Option<i32>,
    sint64: Option<i64>,
    fixed32: Option<u32>,
    double: Option<f64>,
    flag: Option<bool>,
    name: Option<String>,
    blob: Option<Vec<u8>>,
    packed: Vec<i32>,
    tags: Vec<String>,
    child: Option<i64>,
    counts: Vec<(String, i64)>,
}

fn sample() -> impl Strategy<Value = Sample> {
    (
        (
            any::<Option<i32>>(),
            any::<Option<i64>>(),
            any::<Option<u32>>(),
            proptest::option::of(-1.0e12f64..1.0e12),
            any::<Option<bool>>(),
            proptest::option::of(".{0,12}"),
        ),
        (
            proptest::option::of(proptest::collection::vec(any::<u8>(), 0..24)),
            proptest::collection::vec(any::<i32>(), 0..16),
            proptest::collection::vec("[a-z]{0,6}", 0..6),
            any::<Option<i64>>(),
            proptest::collection::vec(("[a-z]{1,4}", any::<i64>()), 0..6),
        ),
    )
        .prop_map(
            |((int32, sint64, fixed32, double, flag, name), (blob, packed, tags, child, counts))| {
                Sample {
                    int32,
                    sint64,
                    fixed32,
                    double,
                    flag,
                    name,
                    blob,
                    packed,
                    tags,
                    child,
                    counts,
                }
            },
        )
}

fn sample_layouts() -> (LayoutSet, LayoutId) {
    let mut set = LayoutSet::new();
    let child = set
        .build_message(&MessageSpec {
            fields: vec![FieldSpec::new(1, FieldType::Int64)],
            ..MessageSpec::default()
        })
        .unwrap();
    let entry = set
        .build_message(&MessageSpec {
            kind: MessageKind::MapEntry,
            fields: vec![
                FieldSpec::new(1, FieldType::String),
                FieldSpec::new(2, FieldType::Int64),
            ],
            ..MessageSpec::default()
        })
        .unwrap();
    let id = set
        .build_message(&MessageSpec {
            fields: vec![
                FieldSpec::new(1, FieldType::Int32),
                FieldSpec::new(2, FieldType::SInt64),
                FieldSpec::new(3, FieldType::Fixed32),
                FieldSpec::new(4, FieldType::Double),
                FieldSpec::new(5, FieldType::Bool),
                FieldSpec {
                    validate_utf8: true,
                    ..FieldSpec::new(6, FieldType::String)
                },
                FieldSpec::new(7, FieldType::Bytes),
                FieldSpec {
                    label: Label::Repeated,
                    packed: true,
                    ..FieldSpec::new(8, FieldType::SInt32)
                },
                FieldSpec {
                    label: Label::Repeated,
                    ..FieldSpec::new(9, FieldType::String)
                },
                FieldSpec::new(10, FieldType::Message),
                FieldSpec {
                    label: Label::Repeated,
                    map: true,
                    ..FieldSpec::new(11, FieldType::Message)
                },
            ],
            ..MessageSpec::default()
        })
        .unwrap();
    set.link_message(id, 10, child).unwrap();
    set.link_message(id, 11, entry).unwrap();
    (set, id)
}

fn populate(message: Message<'_>, arena: &mut Arena, sample: &Sample) {
    let field = |number| message.field(number).unwrap();
    let mut set = |number, value: Option<Value<'_>>| {
        if let Some(value) = value {
            message.set(arena, field(number), value).unwrap();
        }
    };
    set(1, sample.int32.map(Value::I32));
    set(2, sample.sint64.map(Value::I64));
    set(3, sample.fixed32.map(Value::U32));
    set(4, sample.double.map(Value::F64));
    set(5, sample.flag.map(Value::Bool));
    set(6, sample.name.as_deref().map(|name| Value::String(name.as_bytes())));
    set(7, sample.blob.as_deref().map(Value::Bytes));

    for value in &sample.packed {
        message
            .array_append(arena, field(8), Value::I32(*value))
            .unwrap();
    }
    for tag in &sample.tags {
        message
            .array_append(arena, field(9), Value::String(tag.as_bytes()))
            .unwrap();
    }
    if let Some(value) = sample.child {
        let (child, _) = message.mutable_submessage(arena, field(10)).unwrap();
        child
            .set(arena, child.field(1).unwrap(), Value::I64(value))
            .unwrap();
    }
    for (key, value) in &sample.counts {
        message
            .map_insert(arena, field(11), MapKey::from(key.as_str()), Value::I64(*value))
            .unwrap();
    }
}

/// Compare every field of two `Sample` instances through reflection.
fn assert_same(
    left: Message<'_>,
    right: Message<'_>,
    arena: &Arena,
) -> Result<(), TestCaseError> {
    for number in 1..=7 {
        let (l, r) = (left.field(number).unwrap(), right.field(number).unwrap());
        prop_assert_eq!(left.has(arena, l), right.has(arena, r), "has({})", number);
        prop_assert_eq!(left.get(arena, l), right.get(arena, r), "get({})", number);
    }
    for number in [8, 9] {
        let (l, r) = (left.field(number).unwrap(), right.field(number).unwrap());
        let l: Vec<_> = left.array_iter(arena, l).collect();
        let r: Vec<_> = right.array_iter(arena, r).collect();
        prop_assert_eq!(l, r, "array {}", number);
    }

    let (l, r) = (left.field(10).unwrap(), right.field(10).unwrap());
    let l_child = left.get_submessage(arena, l);
    let r_child = right.get_submessage(arena, r);
    prop_assert_eq!(l_child.is_some(), r_child.is_some());
    if let (Some(l_child), Some(r_child)) = (l_child, r_child) {
        prop_assert_eq!(
            l_child.get(arena, l_child.field(1).unwrap()),
            r_child.get(arena, r_child.field(1).unwrap())
        );
    }

    let (l, r) = (left.field(11).unwrap(), right.field(11).unwrap());
    prop_assert_eq!(left.map_len(arena, l), right.map_len(arena, r));
    for (key, value) in left.map_iter(arena, l) {
        prop_assert_eq!(right.map_get(arena, r, key), Some(value));
    }
    Ok(())
}

proptest! {
    #[test]
    fn proptest_message_round_trip(sample in sample()) {
        let (set, id) = sample_layouts();
        let mut arena = Arena::new();
        let original = Message::new(set.message(id), &mut arena).unwrap();
        populate(original, &mut arena, &sample);

        let bytes = encode_to_vec(original, &arena, &EncodeOptions::new()).unwrap();
        let decoded = decode(
            set.message(id),
            Bytes::from(bytes.clone()),
            &mut arena,
            &DecodeOptions::new(),
        )
        .unwrap();
        assert_same(original, decoded, &arena)?;
        prop_assert!(decoded.unknown_fields(&arena).is_empty());

        // Deterministic output is a fixed point.
        let mut options = EncodeOptions::new();
        options.deterministic(true);
        let first = encode_to_vec(original, &arena, &options).unwrap();
        let second = encode_to_vec(decoded, &arena, &options).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn proptest_merge_is_last_wins(first in sample(), second in sample()) {
        let (set, id) = sample_layouts();
        let mut arena = Arena::new();
        let a = Message::new(set.message(id), &mut arena).unwrap();
        populate(a, &mut arena, &first);
        let b = Message::new(set.message(id), &mut arena).unwrap();
        populate(b, &mut arena, &second);

        let mut combined = encode_to_vec(a, &arena, &EncodeOptions::new()).unwrap();
        combined.extend(encode_to_vec(b, &arena, &EncodeOptions::new()).unwrap());
        let merged = decode(
            set.message(id),
            Bytes::from(combined),
            &mut arena,
            &DecodeOptions::new(),
        )
        .unwrap();

        let int32 = merged.field(1).unwrap();
        let expected = second.int32.or(first.int32).unwrap_or_default();
        prop_assert_eq!(merged.get(&arena, int32), Value::I32(expected));
        let packed = merged.field(8).unwrap();
        prop_assert_eq!(
            merged.array_len(&arena, packed),
            first.packed.len() + second.packed.len()
        );
    }
}

#[derive(Debug, Clone)]
enum OneofOp {
    SetNumber(i32),
    SetText(String),
    TouchChild,
    Clear(u32),
}

fn oneof_op() -> impl Strategy<Value = OneofOp> {
    prop_oneof![
        any::<i32>().prop_map(OneofOp::SetNumber),
        "[a-z]{0,4}".prop_map(OneofOp::SetText),
        Just(OneofOp::TouchChild),
        (1u32..=3).prop_map(OneofOp::Clear),
    ]
}

proptest! {
    #[test]
    fn proptest_oneof_exclusivity(ops in proptest::collection::vec(oneof_op(), 1..24)) {
        let mut set = LayoutSet::new();
        let child = set
            .build_message(&MessageSpec {
                fields: vec![FieldSpec::new(1, FieldType::Int32)],
                ..MessageSpec::default()
            })
            .unwrap();
        let id = set
            .build_message(&MessageSpec {
                fields: vec![
                    FieldSpec { oneof: Some(0), ..FieldSpec::new(1, FieldType::Int32) },
                    FieldSpec { oneof: Some(0), ..FieldSpec::new(2, FieldType::String) },
                    FieldSpec { oneof: Some(0), ..FieldSpec::new(3, FieldType::Message) },
                ],
                oneof_count: 1,
                ..MessageSpec::default()
            })
            .unwrap();
        set.link_message(id, 3, child).unwrap();

        let mut arena = Arena::new();
        let message = Message::new(set.message(id), &mut arena).unwrap();
        let mut expected = 0;
        for op in ops {
            match op {
                OneofOp::SetNumber(value) => {
                    message.set(&mut arena, message.field(1).unwrap(), Value::I32(value)).unwrap();
                    expected = 1;
                }
                OneofOp::SetText(text) => {
                    message
                        .set(&mut arena, message.field(2).unwrap(), Value::String(text.as_bytes()))
                        .unwrap();
                    expected = 2;
                }
                OneofOp::TouchChild => {
                    message.mutable_submessage(&mut arena, message.field(3).unwrap()).unwrap();
                    expected = 3;
                }
                OneofOp::Clear(number) => {
                    message.clear(&mut arena, message.field(number).unwrap()).unwrap();
                    if expected == number {
                        expected = 0;
                    }
                }
            }

            let present: Vec<u32> = (1..=3)
                .filter(|number| message.has(&arena, message.field(*number).unwrap()))
                .collect();
            prop_assert!(present.len() <= 1);
            prop_assert_eq!(message.which_oneof(&arena, 0), expected);
            prop_assert_eq!(present.first().copied().unwrap_or(0), expected);
        }
    }

    #[test]
    fn proptest_dense_index(numbers in proptest::collection::btree_set(1u32..64, 1..24)) {
        let fields = numbers
            .iter()
            .map(|number| FieldSpec::new(*number, FieldType::UInt32))
            .collect();
        let mut set = LayoutSet::new();
        let id = set
            .build_message(&MessageSpec { fields, ..MessageSpec::default() })
            .unwrap();
        let layout = set.layout(id);

        let dense = usize::from(layout.dense_below());
        for n in 1..=dense {
            prop_assert_eq!(layout.fields()[n - 1].number(), u32::try_from(n).unwrap());
        }
        for number in 1..70 {
            let found = layout.find_field(number).map(|field| field.number());
            prop_assert_eq!(found, numbers.contains(&number).then_some(number));
        }
    }
}

#[property_test]
fn proptest_unset_fields_encode_to_nothing(skip: bool) {
    let (set, id) = sample_layouts();
    let mut arena = Arena::new();
    let message = Message::new(set.message(id), &mut arena).unwrap();
    if skip {
        // Clearing an unset field keeps it unset.
        message.clear(&mut arena, message.field(10).unwrap()).unwrap();
    }
    let bytes = encode_to_vec(message, &arena, &EncodeOptions::new()).unwrap();
    prop_assert!(bytes.is_empty());
}
