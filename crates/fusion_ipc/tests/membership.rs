//! Joining, leaving and dying.

mod common;

use std::time::Duration;

use fusion_core::{FusionConfig, FusionError, FusionId};
use fusion_ipc::{CallContext, CallOutcome, ExecFlags, MemberState, Registry};

fn quick() -> FusionConfig {
    FusionConfig {
        join_timeout_ms: 500,
        liveness_interval_ms: 5,
        ..FusionConfig::default()
    }
}

#[test]
fn test_ids_are_issued_in_order_and_never_reused() {
    for (backend, registry) in common::both_backends("ids", quick()) {
        let master = registry.enter(0).unwrap();
        let first = registry.enter(0).unwrap();
        let second = registry.enter(0).unwrap();

        assert!(master.is_master(), "{backend}");
        assert_eq!(master.id(), FusionId::MASTER);
        assert_eq!(first.id(), FusionId::new(2));
        assert_eq!(second.id(), FusionId::new(3));
        assert_eq!(master.members(), vec![FusionId::MASTER, FusionId::new(2), FusionId::new(3)]);

        first.leave().unwrap();
        assert_eq!(first.state(), MemberState::Left);
        assert_eq!(master.members(), vec![FusionId::MASTER, FusionId::new(3)]);

        let third = registry.enter(0).unwrap();
        assert_eq!(third.id(), FusionId::new(4), "{backend}");

        second.leave().unwrap();
        third.leave().unwrap();
        master.leave().unwrap();
    }
}

#[test]
fn test_worlds_are_independent() {
    let registry = Registry::fake(quick()).unwrap();
    let zero = registry.enter(0).unwrap();
    let one = registry.enter(1).unwrap();
    assert!(zero.is_master());
    assert!(one.is_master());
    assert_eq!(one.world_index(), 1);
    assert_eq!(registry.live_worlds(), vec![0, 1]);
}

#[test]
fn test_master_leaves_last() {
    for (backend, registry) in common::both_backends("master_last", quick()) {
        let master = registry.enter(0).unwrap();
        let slave = registry.enter(0).unwrap();

        let err = master.leave().unwrap_err();
        assert!(matches!(err, FusionError::InvalidState(_)), "{backend}: {err:?}");
        assert_eq!(master.state(), MemberState::Joined);

        slave.leave().unwrap();
        master.leave().unwrap();
        assert!(matches!(master.leave(), Err(FusionError::InvalidState(_))), "{backend}");
        assert!(matches!(slave.send(FusionId::MASTER, b"late"), Err(FusionError::InvalidState(_))));
    }
}

#[test]
fn test_dropped_slave_becomes_implicit_leave() {
    for (backend, registry) in common::both_backends("implicit", quick()) {
        let master = registry.enter(0).unwrap();
        let slave = registry.enter(0).unwrap();
        let slave_id = slave.id();

        let call = slave
            .call_register(|_: &CallContext, _: &[u8]| CallOutcome::Return(Vec::new()), 0)
            .unwrap();
        let shm = master.pool_create("shared", 4096, false).unwrap();
        slave.pool_attach(shm.id()).unwrap();

        drop(slave);

        assert!(common::eventually(|| !master.members().contains(&slave_id)), "{backend}");
        assert!(!shm.is_attached(slave_id), "{backend}");
        let err = master.call_execute(call, ExecFlags::NONE, 0, b"", 0).unwrap_err();
        assert!(matches!(err, FusionError::NoSuchInstance(_)), "{backend}: {err:?}");

        // With the slave gone the master may leave
        master.leave().unwrap();
    }
}

#[test]
fn test_dead_master_is_replaced() {
    let registry = Registry::fake(quick()).unwrap();
    let master = registry.enter(0).unwrap();
    drop(master);

    let next = registry.enter(0).unwrap();
    assert!(next.is_master());
    assert_eq!(next.members(), vec![FusionId::MASTER]);
}

#[test]
fn test_force_slave_times_out_without_master() {
    let registry = Registry::fake(FusionConfig {
        force_slave: true,
        join_timeout_ms: 100,
        ..quick()
    })
    .unwrap();
    assert_eq!(registry.enter(0).unwrap_err(), FusionError::Timeout);
}

#[test]
fn test_force_slave_waits_for_master() {
    let registry = Registry::fake(FusionConfig {
        force_slave: true,
        join_timeout_ms: 2_000,
        ..quick()
    })
    .unwrap();

    std::thread::scope(|s| {
        let waiting = s.spawn(|| registry.enter(0));
        std::thread::sleep(Duration::from_millis(50));
        let master = registry.create_world(0).unwrap();

        let slave = waiting.join().unwrap().unwrap();
        assert!(!slave.is_master());
        assert_eq!(slave.id(), FusionId::new(2));
        assert!(matches!(registry.create_world(0), Err(FusionError::InvalidState(_))));

        slave.leave().unwrap();
        master.leave().unwrap();
    });
}

#[test]
fn test_fork_handler_is_unimplemented() {
    let err = Registry::fake(FusionConfig {
        fork_handler: true,
        ..FusionConfig::default()
    })
    .unwrap_err();
    assert!(matches!(err, FusionError::Unimplemented(_)));
}

#[test]
fn test_shared_backend_needs_existing_tmpfs() {
    let err = Registry::shared(FusionConfig {
        tmpfs: Some(std::env::temp_dir().join("fusion_test_missing_dir_does_not_exist")),
        ..FusionConfig::default()
    })
    .unwrap_err();
    assert!(matches!(err, FusionError::Io(_)), "{err:?}");
}

#[test]
fn test_send_delivers_messages() {
    for (backend, registry) in common::both_backends("send", quick()) {
        let master = registry.enter(0).unwrap();
        let slave = registry.enter(0).unwrap();

        master.send(slave.id(), b"hello").unwrap();
        master.send(slave.id(), b"again").unwrap();
        let timeout = Duration::from_secs(1);
        assert_eq!(slave.recv_message(timeout).unwrap(), (FusionId::MASTER, b"hello".to_vec()), "{backend}");
        assert_eq!(slave.recv_message(timeout).unwrap(), (FusionId::MASTER, b"again".to_vec()));

        slave.send(FusionId::MASTER, b"").unwrap();
        assert_eq!(master.recv_message(timeout).unwrap(), (slave.id(), Vec::new()));

        assert!(matches!(master.send(FusionId::new(99), b"?"), Err(FusionError::NoSuchInstance(_))));
        assert_eq!(master.recv_message(Duration::from_millis(20)).unwrap_err(), FusionError::Timeout);

        slave.leave().unwrap();
        master.leave().unwrap();
    }
}

#[test]
fn test_enter_after_shutdown_fails() {
    let registry = Registry::fake(quick()).unwrap();
    registry.shutdown();
    assert!(matches!(registry.enter(0), Err(FusionError::InvalidState(_))));
}
