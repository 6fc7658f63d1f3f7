//! Call execution paths and failure modes.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use fusion_core::{FusionConfig, FusionError};
use fusion_ipc::{CallContext, CallOutcome, ExecFlags, ReturnToken};

fn echo(_: &CallContext, request: &[u8]) -> CallOutcome {
    CallOutcome::Return(request.to_vec())
}

#[test]
fn test_payload_sizes_round_trip() {
    for (backend, registry) in common::both_backends("sizes", FusionConfig::default()) {
        let master = registry.enter(0).unwrap();
        let slave = registry.enter(0).unwrap();
        let call = master.call_register(echo, 0).unwrap();

        for size in [0usize, 1, 63, 64, 255, 4096, 65536] {
            let request: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
            let reply = slave.call_execute(call, ExecFlags::NONE, 0, &request, size).unwrap();
            assert_eq!(reply, request, "{backend} size {size}");

            if size > 0 {
                let err = slave.call_execute(call, ExecFlags::NONE, 0, &request, size - 1).unwrap_err();
                assert_eq!(
                    err,
                    FusionError::BufferTooSmall {
                        needed: size,
                        capacity: size - 1
                    },
                    "{backend} size {size}"
                );
            }
        }

        slave.leave().unwrap();
        master.leave().unwrap();
    }
}

#[test]
fn test_context_reaches_handler() {
    for (backend, registry) in common::both_backends("ctx", FusionConfig::default()) {
        let master = registry.enter(0).unwrap();
        let slave = registry.enter(0).unwrap();
        let slave_id = slave.id();

        let call = master
            .call_register(
                move |ctx: &CallContext, _: &[u8]| {
                    assert_eq!(ctx.caller, slave_id);
                    let mut reply = ctx.ctx.to_le_bytes().to_vec();
                    reply.extend_from_slice(&ctx.call_arg.to_le_bytes());
                    CallOutcome::Return(reply)
                },
                0xC0FFEE,
            )
            .unwrap();

        let reply = slave.call_execute(call, ExecFlags::NONE, -5, b"", 16).unwrap();
        assert_eq!(&reply[..8], &0xC0FFEE_u64.to_le_bytes(), "{backend}");
        assert_eq!(&reply[8..], &(-5i32).to_le_bytes(), "{backend}");

        slave.leave().unwrap();
        master.leave().unwrap();
    }
}

#[test]
fn test_handler_failure_travels_back() {
    for (backend, registry) in common::both_backends("fail", FusionConfig::default()) {
        let master = registry.enter(0).unwrap();
        let slave = registry.enter(0).unwrap();
        let call = master
            .call_register(|_: &CallContext, _: &[u8]| CallOutcome::Fail(-7), 0)
            .unwrap();

        let err = slave.call_execute(call, ExecFlags::NONE, 0, b"x", 8).unwrap_err();
        assert_eq!(err, FusionError::HandlerFailed { code: -7 }, "{backend}");

        slave.leave().unwrap();
        master.leave().unwrap();
    }
}

#[test]
fn test_owner_queued_self_call() {
    let registry = common::shared_registry("self", FusionConfig::default());
    let master = registry.enter(0).unwrap();
    let call = master.call_register(echo, 0).unwrap();

    assert_eq!(master.call_execute(call, ExecFlags::NONE, 0, b"direct", 8).unwrap(), b"direct");
    assert_eq!(master.call_execute(call, ExecFlags::QUEUE, 0, b"queued", 8).unwrap(), b"queued");
    master.leave().unwrap();
}

#[test]
fn test_unbounded_timeout_waits_for_reply() {
    for (backend, registry) in common::both_backends("forever", FusionConfig::default()) {
        let master = registry.enter(0).unwrap();
        let slave = registry.enter(0).unwrap();
        let call = master.call_register(echo, 0).unwrap();

        let reply = slave
            .call_execute_timeout(call, ExecFlags::NONE, 0, b"x", 8, Duration::MAX)
            .unwrap();
        assert_eq!(reply, b"x", "{backend}");

        slave.leave().unwrap();
        master.leave().unwrap();
    }
}

#[test]
fn test_timeout_discards_late_reply() {
    let registry = common::shared_registry("timeout", FusionConfig::default());
    let master = registry.enter(0).unwrap();
    let slave = registry.enter(0).unwrap();

    let call = master
        .call_register(
            |ctx: &CallContext, request: &[u8]| {
                if ctx.call_arg == 1 {
                    std::thread::sleep(Duration::from_millis(300));
                }
                CallOutcome::Return(request.to_vec())
            },
            0,
        )
        .unwrap();

    let err = slave
        .call_execute_timeout(call, ExecFlags::NONE, 1, b"slow", 16, Duration::from_millis(50))
        .unwrap_err();
    assert_eq!(err, FusionError::Timeout);

    // Served after the slow one; its reply must not be mistaken for ours
    let reply = slave.call_execute(call, ExecFlags::NONE, 0, b"fast", 16).unwrap();
    assert_eq!(reply, b"fast");

    slave.leave().unwrap();
    master.leave().unwrap();
}

#[test]
fn test_retry_resends_timed_out_call() {
    let registry = common::shared_registry(
        "retry",
        FusionConfig {
            call_retry_attempts: 2,
            call_retry_backoff_ms: 1,
            ..FusionConfig::default()
        },
    );
    let master = registry.enter(0).unwrap();
    let slave = registry.enter(0).unwrap();

    let invocations = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&invocations);
    let call = master
        .call_register(
            move |_: &CallContext, request: &[u8]| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    std::thread::sleep(Duration::from_millis(300));
                }
                CallOutcome::Return(request.to_vec())
            },
            0,
        )
        .unwrap();

    let reply = slave
        .call_execute_timeout(call, ExecFlags::NONE, 0, b"again", 16, Duration::from_millis(200))
        .unwrap();
    assert_eq!(reply, b"again");
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    slave.leave().unwrap();
    master.leave().unwrap();
}

#[test]
fn test_retained_call_answered_later() {
    for (backend, registry) in common::both_backends("retain", FusionConfig::default()) {
        let master = registry.enter(0).unwrap();
        let slave = registry.enter(0).unwrap();

        let parked: Arc<Mutex<Option<ReturnToken>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&parked);
        let call = master
            .call_register(
                move |ctx: &CallContext, _: &[u8]| {
                    *slot.lock() = Some(ctx.token());
                    CallOutcome::Retain
                },
                0,
            )
            .unwrap();

        std::thread::scope(|s| {
            let answering = s.spawn(|| {
                assert!(common::eventually(|| parked.lock().is_some()));
                let token = parked.lock().take().unwrap();
                master.call_return(token, b"later".to_vec()).unwrap();
                token
            });

            let reply = slave.call_execute(call, ExecFlags::NONE, 0, b"", 16).unwrap();
            assert_eq!(reply, b"later", "{backend}");

            // Nobody waits any more
            let token = answering.join().unwrap();
            let err = master.call_return(token, b"twice".to_vec()).unwrap_err();
            assert!(matches!(err, FusionError::NoSuchInstance(_)), "{backend}");
        });

        slave.leave().unwrap();
        master.leave().unwrap();
    }
}

#[test]
fn test_oneway_calls_run_in_send_order() {
    for bin in [0usize, 8, 512] {
        let registry = common::shared_registry(
            "oneway",
            FusionConfig {
                call_bin_max_num: bin,
                ..FusionConfig::default()
            },
        );
        let master = registry.enter(0).unwrap();
        let slave = registry.enter(0).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let call = master
            .call_register(
                move |ctx: &CallContext, _: &[u8]| {
                    sink.lock().push(ctx.call_arg);
                    CallOutcome::Return(Vec::new())
                },
                0,
            )
            .unwrap();

        for i in 0..100 {
            let reply = slave.call_execute(call, ExecFlags::ONEWAY, i, b"tick", 0).unwrap();
            assert!(reply.is_empty());
        }
        // A synchronous call is served after every earlier one-way call
        slave.call_execute(call, ExecFlags::NONE, -1, b"sync", 0).unwrap();

        let expected: Vec<i32> = (0..100).chain(std::iter::once(-1)).collect();
        assert_eq!(*log.lock(), expected, "call bin of {bin}");

        slave.leave().unwrap();
        master.leave().unwrap();
    }
}

#[test]
fn test_queued_oneway_flushed_explicitly() {
    let registry = common::shared_registry("flush", FusionConfig::default());
    let master = registry.enter(0).unwrap();
    let slave = registry.enter(0).unwrap();

    let count = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&count);
    let call = master
        .call_register(
            move |_: &CallContext, _: &[u8]| {
                seen.fetch_add(1, Ordering::SeqCst);
                CallOutcome::Return(Vec::new())
            },
            0,
        )
        .unwrap();

    for _ in 0..10 {
        slave.call_execute(call, ExecFlags::ONEWAY, 0, b"", 0).unwrap();
    }
    slave.flush_calls().unwrap();
    assert!(common::eventually(|| count.load(Ordering::SeqCst) == 10));

    slave.leave().unwrap();
    master.leave().unwrap();
}

#[test]
fn test_owner_death_while_waiting() {
    let registry = common::shared_registry(
        "death",
        FusionConfig {
            liveness_interval_ms: 5,
            ..FusionConfig::default()
        },
    );
    let master = registry.enter(0).unwrap();
    let owner = registry.enter(0).unwrap();

    let call = owner
        .call_register(
            |_: &CallContext, _: &[u8]| {
                std::thread::sleep(Duration::from_millis(300));
                CallOutcome::Return(Vec::new())
            },
            0,
        )
        .unwrap();

    std::thread::scope(|s| {
        let caller = s.spawn(|| master.call_execute(call, ExecFlags::NONE, 0, b"", 0));
        std::thread::sleep(Duration::from_millis(50));
        drop(owner);

        let err = caller.join().unwrap().unwrap_err();
        assert!(matches!(err, FusionError::NoSuchInstance(_)), "{err:?}");
    });

    let err = master.call_execute(call, ExecFlags::NONE, 0, b"", 0).unwrap_err();
    assert!(matches!(err, FusionError::NoSuchInstance(_)));
    master.leave().unwrap();
}

#[test]
fn test_call_administration() {
    for (backend, registry) in common::both_backends("admin", FusionConfig::default()) {
        let master = registry.enter(0).unwrap();
        let slave = registry.enter(0).unwrap();
        let call = master.call_register(echo, 0).unwrap();

        assert_eq!(master.call_owner(call).unwrap(), master.id(), "{backend}");
        assert_eq!(slave.call_name(call).unwrap(), None);
        master.call_set_name(call, "echo").unwrap();
        assert_eq!(slave.call_name(call).unwrap().as_deref(), Some("echo"));
        assert!(matches!(slave.call_set_name(call, "mine"), Err(FusionError::AccessDenied(_))));

        assert!(matches!(slave.call_destroy(call), Err(FusionError::AccessDenied(_))));
        master.call_destroy(call).unwrap();
        let err = slave.call_execute(call, ExecFlags::NONE, 0, b"", 0).unwrap_err();
        assert!(matches!(err, FusionError::NoSuchInstance(_)), "{backend}");
        assert!(matches!(master.call_owner(call), Err(FusionError::NoSuchInstance(_))));

        // The slot is reused with a new generation
        let next = master.call_register(echo, 0).unwrap();
        assert_ne!(next, call);
        assert!(slave.call_execute(call, ExecFlags::NONE, 0, b"", 0).is_err());
        assert_eq!(slave.call_execute(next, ExecFlags::NONE, 0, b"ok", 2).unwrap(), b"ok");

        slave.leave().unwrap();
        master.leave().unwrap();
    }
}
