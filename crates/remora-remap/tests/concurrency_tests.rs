//! Shared-engine behavior under concurrent use

use remora_classfile::{access, ClassBuilder, ClassFile, MemberKind, OBJECT};
use remora_remap::{ClassRepoFederation, MappingTable, NameMapping, RemapConfig, Remapper};
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: usize = 8;

fn remapper() -> Arc<Remapper> {
    let mut to_public = NameMapping::new();
    to_public.add_class("a/b/Entity", "org/pub/Entity");
    to_public.add_field("a/b/Entity", "f_1", Some("I"), "health");
    to_public.add_field("a/b/Entity", "f_2", Some("J"), "age");
    to_public.add_method("a/b/Entity", "m_1", "(I)V", "damage");

    let mut entity = ClassBuilder::new("a/b/Entity", Some(OBJECT), access::PUBLIC | access::SUPER);
    entity.add_field(access::PUBLIC, "f_1", "I");
    entity.add_field(access::PUBLIC, "f_2", "J");
    entity.add_method(access::PUBLIC, "m_1", "(I)V").code(0, 2, vec![0xB1]);

    let federation = Arc::new(ClassRepoFederation::new());
    federation.runtime().put_bytes(&entity.build().unwrap()).unwrap();
    Remapper::builder(RemapConfig::new("a/b/"), MappingTable::new(to_public))
        .federation(federation)
        .build()
        .unwrap()
}

#[test]
fn test_concurrent_field_table_publishes_once() {
    let remapper = remapper();
    let barrier = Barrier::new(THREADS);

    let tables: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    remapper.cache().field_table("a/b/Entity").unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let first = &tables[0];
    for table in &tables {
        assert!(Arc::ptr_eq(first, table));
    }
    assert_eq!(first.field("health").map(|f| f.name.as_str()), Some("f_1"));
    assert_eq!(first.field("age").map(|f| f.name.as_str()), Some("f_2"));
    assert_eq!(remapper.cache().cached_field_tables(), 1);
}

#[test]
fn test_concurrent_missing_class_synthesized_once() {
    let remapper = remapper();
    let barrier = Barrier::new(THREADS);

    thread::scope(|scope| {
        for i in 0..THREADS {
            let remapper = &remapper;
            let barrier = &barrier;
            scope.spawn(move || {
                let mut builder =
                    ClassBuilder::new(&format!("x/Caller{}", i), Some(OBJECT), access::PUBLIC | access::SUPER);
                let pool = builder.pool();
                let call = pool
                    .add_member_ref(MemberKind::Method, "a/b/Shared", "tick", "()V")
                    .unwrap();
                let [hi, lo] = call.to_be_bytes();
                builder
                    .add_method(access::PUBLIC | access::STATIC, "go", "(La/b/Shared;)V")
                    .code(1, 1, vec![0x2A, 0xB6, hi, lo, 0xB1]);
                let bytes = builder.build().unwrap();
                barrier.wait();
                remapper.rewrite(&bytes).unwrap();
            });
        }
    });

    assert_eq!(remapper.stubs().synthesized(), vec!["a/b/Shared".to_string()]);
    assert!(remapper.federation().runtime().contains("a/b/Shared"));
}

#[test]
fn test_concurrent_rewrites_agree() {
    let remapper = remapper();
    let mut builder = ClassBuilder::new("x/Damager", Some(OBJECT), access::PUBLIC | access::SUPER);
    let pool = builder.pool();
    let damage = pool
        .add_member_ref(MemberKind::Method, "a/b/Entity", "m_1", "(I)V")
        .unwrap();
    let [hi, lo] = damage.to_be_bytes();
    builder
        .add_method(access::PUBLIC | access::STATIC, "hit", "(La/b/Entity;)V")
        .code(2, 1, vec![0x2A, 0x04, 0xB6, hi, lo, 0xB1]);
    let bytes = builder.build().unwrap();

    let outputs: Vec<Vec<u8>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| scope.spawn(|| remapper.rewrite(&bytes).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for output in &outputs {
        assert_eq!(output, &outputs[0]);
    }
    let class = ClassFile::decode(&outputs[0]).unwrap();
    let method = &class.methods[0];
    assert_eq!(method.descriptor(&class.constant_pool).unwrap(), "(Lorg/pub/Entity;)V");
}
