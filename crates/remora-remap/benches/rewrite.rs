//! Rewrite throughput
//!
//! Run with: cargo bench -p remora-remap

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use remora_classfile::{access, ClassBuilder, MemberKind, OBJECT};
use remora_remap::{ClassRepoFederation, MappingTable, NameMapping, RemapConfig, Remapper};
use std::sync::Arc;

fn internal_hierarchy(depth: usize) -> (Arc<ClassRepoFederation>, NameMapping) {
    let federation = Arc::new(ClassRepoFederation::new());
    let mut mapping = NameMapping::new();
    let mut parent = OBJECT.to_string();
    for level in 0..depth {
        let name = format!("a/b/C{}", level);
        let mut builder = ClassBuilder::new(&name, Some(&parent), access::PUBLIC | access::SUPER);
        builder.add_method(access::PUBLIC, &format!("m_{}", level), "()V").code(0, 1, vec![0xB1]);
        federation.runtime().put_bytes(&builder.build().unwrap()).unwrap();
        mapping.add_class(&name, &format!("org/pub/Class{}", level));
        mapping.add_method(&name, &format!("m_{}", level), "()V", &format!("method{}", level));
        parent = name;
    }
    (federation, mapping)
}

/// A class calling every inherited method through the deepest subclass
fn caller(depth: usize) -> Vec<u8> {
    let leaf = format!("a/b/C{}", depth - 1);
    let mut builder = ClassBuilder::new("x/Caller", Some(OBJECT), access::PUBLIC | access::SUPER);
    let mut code = Vec::new();
    for level in 0..depth {
        let index = builder
            .pool()
            .add_member_ref(MemberKind::Method, &leaf, &format!("m_{}", level), "()V")
            .unwrap();
        let [hi, lo] = index.to_be_bytes();
        code.extend_from_slice(&[0x2A, 0xB6, hi, lo]);
    }
    code.push(0xB1);
    builder
        .add_method(access::PUBLIC | access::STATIC, "call", &format!("(L{};)V", leaf))
        .code(1, 1, code);
    builder.build().unwrap()
}

fn bench_rewrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("rewrite");
    for depth in [1, 8, 32] {
        let (federation, mapping) = internal_hierarchy(depth);
        let remapper = Remapper::builder(RemapConfig::new("a/b/"), MappingTable::new(mapping))
            .federation(federation)
            .build()
            .unwrap();
        let bytes = caller(depth);
        group.bench_with_input(BenchmarkId::new("inherited_calls", depth), &bytes, |b, bytes| {
            b.iter(|| remapper.rewrite(black_box(bytes)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_rewrite);
criterion_main!(benches);
