//! Decode and encode throughput for a small address-book style message.

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use protoloom::layout::{FieldSpec, FieldType, Label, LayoutId, LayoutSet, MessageSpec};
use protoloom::{Arena, DecodeOptions, EncodeOptions, Message, Value, decode, encode_to_vec};

/// `Person { string name = 1; int32 id = 2; string email = 3;
/// repeated PhoneNumber phones = 4; }` and
/// `PhoneNumber { string number = 1; int32 type = 2; }`.
fn person_layouts() -> (LayoutSet, LayoutId) {
    let mut set = LayoutSet::new();
    let phone = set
        .build_message(&MessageSpec {
            fields: vec![
                FieldSpec::new(1, FieldType::String),
                FieldSpec::new(2, FieldType::Int32),
            ],
            ..MessageSpec::default()
        })
        .unwrap();
    let person = set
        .build_message(&MessageSpec {
            fields: vec![
                FieldSpec::new(1, FieldType::String),
                FieldSpec::new(2, FieldType::Int32),
                FieldSpec::new(3, FieldType::String),
                FieldSpec {
                    label: Label::Repeated,
                    ..FieldSpec::new(4, FieldType::Message)
                },
            ],
            ..MessageSpec::default()
        })
        .unwrap();
    set.link_message(person, 4, phone).unwrap();
    (set, person)
}

fn person_bytes(set: &LayoutSet, person: LayoutId, phones: usize) -> Vec<u8> {
    let layout = set.message(person);
    let mut arena = Arena::new();
    let message = Message::new(layout, &mut arena).unwrap();
    let fields = layout.layout();
    let field = |number| fields.find_field(number).unwrap();

    message
        .set(&mut arena, field(1), Value::String(b"Ada Lovelace"))
        .unwrap();
    message.set(&mut arena, field(2), Value::I32(1815)).unwrap();
    message
        .set(&mut arena, field(3), Value::String(b"ada@example.com"))
        .unwrap();
    for i in 0..phones {
        let phone = message.append_message(&mut arena, field(4)).unwrap();
        let number = format!("+44 20 7946 {i:04}");
        let phone_layout = phone.layout();
        phone
            .set(
                &mut arena,
                phone_layout.find_field(1).unwrap(),
                Value::String(number.as_bytes()),
            )
            .unwrap();
        phone
            .set(&mut arena, phone_layout.find_field(2).unwrap(), Value::I32(1))
            .unwrap();
    }
    encode_to_vec(message, &arena, &EncodeOptions::new()).unwrap()
}

fn bench_decode(c: &mut Criterion) {
    let (set, person) = person_layouts();
    let mut group = c.benchmark_group("decode");

    for phones in [0, 4, 64] {
        let input = Bytes::from(person_bytes(&set, person, phones));
        group.throughput(Throughput::Bytes(input.len() as u64));

        group.bench_with_input(BenchmarkId::new("copy", phones), &input, |b, input| {
            let options = DecodeOptions::new();
            let mut arena = Arena::new();
            b.iter(|| {
                arena.reset();
                let message = decode(set.message(person), input.clone(), &mut arena, &options);
                std::hint::black_box(message.is_ok())
            })
        });
        group.bench_with_input(BenchmarkId::new("alias", phones), &input, |b, input| {
            let mut options = DecodeOptions::new();
            options.alias_strings(true);
            let mut arena = Arena::new();
            b.iter(|| {
                arena.reset();
                let message = decode(set.message(person), input.clone(), &mut arena, &options);
                std::hint::black_box(message.is_ok())
            })
        });
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let (set, person) = person_layouts();
    let mut group = c.benchmark_group("encode");

    for phones in [0, 4, 64] {
        let input = Bytes::from(person_bytes(&set, person, phones));
        group.throughput(Throughput::Bytes(input.len() as u64));

        let mut arena = Arena::new();
        let message = decode(
            set.message(person),
            input.clone(),
            &mut arena,
            &DecodeOptions::new(),
        )
        .unwrap();
        let options = EncodeOptions::new();
        group.bench_function(BenchmarkId::new("to_vec", phones), |b| {
            b.iter(|| {
                let bytes = encode_to_vec(message, &arena, &options).unwrap();
                std::hint::black_box(bytes)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decode, bench_encode);
criterion_main!(benches);
