//! Process-wide safety net against orphaned children.
//!
//! Installed once per process. It keeps weak references to the registries
//! of live supervisors and SIGKILLs whatever is still registered when the
//! harness itself goes away:
//!
//! * normal exit, via `atexit`;
//! * SIGINT / SIGTERM, via a dedicated signal thread that then exits with
//!   `128 + signo` (unless the caller takes over signal handling);
//! * aborting panics, via a chained panic hook. Unwinding panics drop the
//!   supervisor, whose `Drop` does the same job.
//!
//! Nothing here survives SIGKILL of the harness.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, warn};

use crate::process::ProcessRegistry;

/// How long an exit path waits for a busy registry before giving up on it.
const LOCK_WAIT: Duration = Duration::from_millis(100);

static REGISTRIES: Lazy<Mutex<Vec<Weak<ProcessRegistry>>>> = Lazy::new(|| Mutex::new(Vec::new()));
static INSTALLED: OnceCell<()> = OnceCell::new();
static CALLER_HANDLES_SIGNALS: AtomicBool = AtomicBool::new(false);

/// Installs the hooks. Safe to call any number of times.
pub fn install() {
    INSTALLED.get_or_init(|| {
        // SAFETY: registering a plain extern "C" fn with no captured state.
        if unsafe { libc::atexit(on_exit) } != 0 {
            warn!("Failed to register exit hook");
        }

        #[cfg(panic = "abort")]
        install_panic_hook();

        if let Err(e) = spawn_signal_thread() {
            warn!("Failed to start exit guard signal thread: {}", e);
        }
        debug!("Exit guard installed");
    });
}

/// Adds a supervisor registry to the set the guard cleans up.
pub fn register(registry: &Arc<ProcessRegistry>) {
    let mut registries = REGISTRIES.lock();
    registries.retain(|weak| weak.strong_count() > 0);
    if !registries
        .iter()
        .any(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(registry)))
    {
        registries.push(Arc::downgrade(registry));
    }
}

/// When set, SIGINT / SIGTERM no longer terminate the harness; the caller
/// is expected to notice them and stop its supervisor itself.
pub fn leave_signals_to_caller(enabled: bool) {
    CALLER_HANDLES_SIGNALS.store(enabled, Ordering::SeqCst);
}

/// SIGKILLs every process still registered with a live supervisor.
/// Returns how many were signalled.
pub fn terminate_all() -> usize {
    let registries: Vec<Arc<ProcessRegistry>> = match REGISTRIES.try_lock_for(LOCK_WAIT) {
        Some(registries) => registries.iter().filter_map(Weak::upgrade).collect(),
        None => return 0,
    };

    registries
        .iter()
        .filter_map(|registry| registry.try_terminate_all(LOCK_WAIT))
        .map(|terminated| terminated.len())
        .sum()
}

extern "C" fn on_exit() {
    terminate_all();
}

#[cfg(panic = "abort")]
fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        terminate_all();
        previous(info);
    }));
}

fn spawn_signal_thread() -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    std::thread::Builder::new()
        .name("stagehand-exit-guard".to_string())
        .spawn(move || {
            runtime.block_on(async {
                let (mut interrupt, mut terminate) =
                    match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                        (Ok(i), Ok(t)) => (i, t),
                        (Err(e), _) | (_, Err(e)) => {
                            warn!("Exit guard cannot listen for signals: {}", e);
                            return;
                        }
                    };

                loop {
                    let signo = tokio::select! {
                        _ = interrupt.recv() => libc::SIGINT,
                        _ = terminate.recv() => libc::SIGTERM,
                    };

                    if CALLER_HANDLES_SIGNALS.load(Ordering::SeqCst) {
                        continue;
                    }

                    let killed = terminate_all();
                    debug!("Signal {} received, killed {} children", signo, killed);
                    std::process::exit(128 + signo);
                }
            });
        })?;
    Ok(())
}
