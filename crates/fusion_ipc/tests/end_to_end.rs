//! The two-fusionee scenario: shared pool, shared object, bound call.

mod common;

use bytemuck::{Pod, Zeroable};
use fusion_core::{FusionConfig, FusionError};
use fusion_ipc::{CallContext, CallOutcome, ExecFlags, ObjectPool, Registry};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
struct Node {
    value: u64,
}

fn reversed_echo(_: &CallContext, request: &[u8]) -> CallOutcome {
    CallOutcome::Return(request.iter().rev().copied().collect())
}

fn object_call_scenario(backend: &str, registry: &Registry) {
    let a = registry.enter(0).unwrap();
    let b = registry.enter(0).unwrap();

    let shm = a.pool_create("objects", 1 << 20, false).unwrap();
    let objects = ObjectPool::<Node>::create(&a, &shm, "nodes").unwrap();
    let o = objects.create_object(&a, Node { value: 42 }).unwrap();
    assert_eq!(objects.info(o).unwrap().refs, 1, "{backend}");

    let c = a.call_register(reversed_echo, 0).unwrap();
    objects.bind_call(&a, o, c).unwrap();

    b.pool_attach(shm.id()).unwrap();
    assert_eq!(objects.get(o).unwrap().value, 42, "{backend}");

    let request: Vec<u8> = (0..64).collect();
    let reply = b.call_execute(c, ExecFlags::NONE, 0, &request, 256).unwrap();
    let expected: Vec<u8> = (0..64).rev().collect();
    assert_eq!(reply, expected, "{backend}");

    assert_eq!(objects.unref_object(&a, o).unwrap(), 0, "{backend}");
    let err = b.call_execute(c, ExecFlags::NONE, 0, &request, 256).unwrap_err();
    assert!(matches!(err, FusionError::NoSuchInstance(_)), "{backend}: {err:?}");
    assert!(matches!(objects.get(o), Err(FusionError::InvalidState(_))), "{backend}");
    assert_eq!(shm.stats().allocations, 0, "{backend}");

    b.leave().unwrap();
    drop(objects);
    a.pool_destroy(shm.id()).unwrap();
    a.leave().unwrap();
}

#[test]
fn test_object_call_scenario_on_both_backends() {
    for (backend, registry) in common::both_backends("e2e", FusionConfig::default()) {
        object_call_scenario(backend, &registry);
    }
}

#[test]
fn test_cleared_allocation_and_double_free() {
    for (backend, registry) in common::both_backends("alloc", FusionConfig::default()) {
        let a = registry.enter(0).unwrap();
        let b = registry.enter(0).unwrap();
        let shm = a.pool_create("scratch", 64 * 1024, false).unwrap();
        let pool = b.pool_attach(shm.id()).unwrap();

        // Dirty the memory first so clearing is observable
        let dirty = pool.allocate(4096, false).unwrap();
        pool.with_bytes_mut(dirty, |bytes| bytes.fill(0xEE)).unwrap();
        pool.deallocate(dirty).unwrap();

        let block = pool.allocate(4096, true).unwrap();
        assert_eq!(block.offset(), dirty.offset(), "{backend}");
        assert!(pool.read(block).unwrap().iter().all(|&byte| byte == 0), "{backend}");

        let pattern: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
        pool.write(block, 0, &pattern).unwrap();
        assert_eq!(pool.read(block).unwrap(), pattern, "{backend}");

        pool.deallocate(block).unwrap();
        let err = pool.deallocate(block).unwrap_err();
        assert!(matches!(err, FusionError::InvalidState(_)), "{backend}: {err:?}");
        assert_eq!(pool.stats().used, 0, "{backend}");

        // The same sequence under an explicitly held lock
        {
            let mut guard = pool.lock();
            let block = guard.allocate(4096, true).unwrap();
            assert!(guard.bytes(block).unwrap().iter().all(|&byte| byte == 0));
            guard.deallocate(block).unwrap();
            assert!(guard.deallocate(block).is_err());
        }

        b.pool_detach(shm.id()).unwrap();
        b.leave().unwrap();
        a.pool_destroy(shm.id()).unwrap();
        a.leave().unwrap();
    }
}
