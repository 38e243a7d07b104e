//! Task spawning and panic logging.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;

use tokio::task::AbortHandle;
use tracing::{debug, error};

/// Spawn `fut` and log it if it ends in a panic.
///
/// Aborting the returned handle cancels the task quietly.
pub fn spawn_logged<F>(name: &'static str, fut: F) -> AbortHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    let abort = handle.abort_handle();
    tokio::spawn(async move {
        match handle.await {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                error!(task = name, panic = %panic_message(e.into_panic().as_ref()), "task panicked");
            }
            Err(_) => debug!(task = name, "task cancelled"),
        }
    });
    abort
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Route panics on any thread to the log, with a backtrace.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();
        error!(panic = %info, %backtrace, "run time panic");
    }));
}
