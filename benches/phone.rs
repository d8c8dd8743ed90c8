//! Benchmarks for phone number parsing and address mapping.
//!
//! Run with: cargo bench --bench phone

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use xmpp_smsd::address::{normalize, AddressMapper, Jid, PhoneNumber};

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("phone/parse");

    group.bench_function("e164", |b| {
        b.iter(|| black_box(PhoneNumber::parse(black_box("+15551230000"))))
    });

    group.bench_function("formatted", |b| {
        b.iter(|| black_box(PhoneNumber::parse(black_box("+1 (555) 123-0000"))))
    });

    group.bench_function("with_default_prefix", |b| {
        b.iter(|| {
            black_box(PhoneNumber::parse_with_prefix(
                black_box("5551230000"),
                Some("+1"),
            ))
        })
    });

    group.bench_function("normalize", |b| {
        b.iter(|| black_box(normalize(black_box("+1 (555) 123-0000"))))
    });

    group.finish();
}

fn mapper(users: usize) -> AddressMapper {
    (0..users).fold(
        AddressMapper::new("sms.example.com").with_default_prefix(Some("+1".to_string())),
        |mapper, i| {
            mapper.with_user(
                Jid::new(format!("user{}", i), "example.com"),
                PhoneNumber::parse(&format!("+1555{:07}", i)).unwrap(),
            )
        },
    )
}

fn bench_mapping(c: &mut Criterion) {
    let mut group = c.benchmark_group("phone/mapping");

    for users in [1, 10, 100] {
        let mapper = mapper(users);
        let contact = Jid::new("5551230000", "sms.example.com");
        let user = Jid::new("user0", "example.com");
        let phone = PhoneNumber::parse("+15551230000").unwrap();
        let owned = PhoneNumber::parse("+15550000000").unwrap();

        group.bench_with_input(BenchmarkId::new("address_to_phone", users), &users, |b, _| {
            b.iter(|| black_box(mapper.address_to_phone(black_box(&contact))))
        });

        group.bench_with_input(BenchmarkId::new("user_to_phone", users), &users, |b, _| {
            b.iter(|| black_box(mapper.address_to_phone(black_box(&user))))
        });

        group.bench_with_input(BenchmarkId::new("phone_to_address", users), &users, |b, _| {
            b.iter(|| black_box(mapper.phone_to_address(black_box(&phone))))
        });

        group.bench_with_input(BenchmarkId::new("phone_to_user", users), &users, |b, _| {
            b.iter(|| black_box(mapper.phone_to_user(black_box(&owned))))
        });
    }

    group.finish();
}

fn bench_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("phone/throughput");
    let mapper = mapper(10);

    let contacts: Vec<Jid> = (0..1000)
        .map(|i| Jid::new(format!("555{:07}", i), "sms.example.com"))
        .collect();

    group.throughput(Throughput::Elements(contacts.len() as u64));
    group.bench_function("resolve_1000_contacts", |b| {
        b.iter(|| {
            for contact in &contacts {
                black_box(mapper.address_to_phone(contact).ok());
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_mapping, bench_throughput);

criterion_main!(benches);
