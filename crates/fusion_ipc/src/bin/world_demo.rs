//! Walks through a two-fusionee session: shared pool, shared object, a call
//! bound to the object and a reactor notification.
//!
//! Options use the `name=value,...` syntax of `FUSION_OPTIONS`, e.g.
//! `FUSION_OPTIONS=debugshm,trace-ref=all RUST_LOG=debug world_demo`.
//! Pass `--fake` to run on the single-process backend.

use std::process::ExitCode;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};

use fusion_core::{FusionConfig, FusionResult, CONFIG_USAGE};
use fusion_ipc::{CallContext, CallOutcome, ExecFlags, ObjectPool, Registry};

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Surface {
    width: u32,
    height: u32,
    frames: u64,
}

const CHANNEL_DAMAGE: u32 = 1;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let options = std::env::var("FUSION_OPTIONS").unwrap_or_default();
    let config = match FusionConfig::parse_options(&options) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid FUSION_OPTIONS: {e}");
            eprintln!("{CONFIG_USAGE}");
            return ExitCode::FAILURE;
        }
    };
    let fake = std::env::args().any(|arg| arg == "--fake");

    match run(config, fake) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("demo failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: FusionConfig, fake: bool) -> FusionResult<()> {
    let registry = if fake {
        Registry::fake(config)?
    } else {
        Registry::shared(config)?
    };

    let a = registry.enter(0)?;
    let b = registry.enter(0)?;
    tracing::info!("{} and {} joined world 0 ({} backend)", a.id(), b.id(), registry.backend_kind());

    let shm = a.pool_create("objects", 1 << 20, false)?;
    let surfaces = ObjectPool::<Surface>::create(&a, &shm, "surfaces")?;
    let surface = surfaces.create_object(
        &a,
        Surface {
            width: 640,
            height: 480,
            frames: 0,
        },
    )?;

    let flip = a.call_register(
        |ctx: &CallContext, request: &[u8]| {
            tracing::info!("{} flips for {}", ctx.call, ctx.caller);
            CallOutcome::Return(request.iter().rev().copied().collect())
        },
        0,
    )?;
    surfaces.bind_call(&a, surface, flip)?;

    b.pool_attach(shm.id())?;
    let listener = surfaces.attach(&b, surface, CHANNEL_DAMAGE)?;

    let request: Vec<u8> = (0..64).collect();
    let reply = b.call_execute(flip, ExecFlags::NONE, 0, &request, 256)?;
    tracing::info!("B got {} reversed bytes, first {}", reply.len(), reply[0]);

    surfaces.update(surface, |s| s.frames += 1)?;
    surfaces.dispatch(&a, surface, CHANNEL_DAMAGE, b"damage")?;
    let message = listener.recv_timeout(Duration::from_secs(1))?;
    tracing::info!("B notified about object {} on channel {}", message.reference, message.channel);
    drop(listener);

    surfaces.unref_object(&a, surface)?;
    match b.call_execute(flip, ExecFlags::NONE, 0, &request, 256) {
        Err(e) => tracing::info!("After the last unref the call fails: {e}"),
        Ok(_) => tracing::warn!("Call survived its object"),
    }

    b.pool_detach(shm.id())?;
    b.leave()?;
    drop(surfaces);
    a.pool_destroy(shm.id())?;
    a.leave()?;
    Ok(())
}
