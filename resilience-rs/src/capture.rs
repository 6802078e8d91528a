//! # Capture Sources
//!
//! Platform hooks that observe failures without call-site changes. Every
//! source forwards raw [`CaptureEvent`]s through a [`CaptureSink`]; the
//! tracker owns filtering, deduplication and queueing, so it never depends
//! on which concrete hook produced an event.
//!
//! Sources:
//! - [`PanicHook`]: process-wide panic hook (uncaught exceptions)
//! - [`TaskWatcher`]: background tasks that resolve to `Err` (unhandled rejections)
//! - [`crate::http::TrackedHttpClient`]: outbound HTTP interception

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::{Error, ErrorKind, Result};

static PANIC_HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

/// A raw observation from a capture source
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    UncaughtException {
        message: String,
        stack: Option<String>,
        location: Option<String>,
    },
    UnhandledRejection {
        message: String,
        task: Option<String>,
    },
    /// An outbound call that failed at transport level (`status: None`)
    /// or answered with a server error
    Network {
        status: Option<u16>,
        method: String,
        url: String,
        message: String,
    },
}

/// Cloneable handle feeding events to the tracker
///
/// Sending never blocks, so the sink is safe to use from a panic hook.
#[derive(Debug, Clone)]
pub struct CaptureSink {
    tx: mpsc::UnboundedSender<CaptureEvent>,
}

impl CaptureSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Drops the event if the tracker is gone
    pub fn emit(&self, event: CaptureEvent) {
        if self.tx.send(event).is_err() {
            debug!("Capture sink closed, event dropped");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    UncaughtException,
    UnhandledRejection,
    NetworkInterceptor,
}

/// A best-effort platform hook
pub trait CaptureSource: Send + Sync {
    fn kind(&self) -> CaptureKind;

    fn install(&self, sink: CaptureSink) -> Result<()>;
}

/// Reports panics as uncaught exceptions, then defers to the previous hook
#[derive(Debug, Default)]
pub struct PanicHook;

impl CaptureSource for PanicHook {
    fn kind(&self) -> CaptureKind {
        CaptureKind::UncaughtException
    }

    fn install(&self, sink: CaptureSink) -> Result<()> {
        if PANIC_HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(Error::new(
                ErrorKind::Initialization,
                "Panic hook is already installed in this process",
            ));
        }

        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let payload = info.payload();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic with non-string payload".to_string());
            let location = info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));

            sink.emit(CaptureEvent::UncaughtException {
                message,
                stack: Some(format!("{:?}", backtrace::Backtrace::new())),
                location,
            });

            previous(info);
        }));

        debug!("Panic hook installed");
        Ok(())
    }
}

/// Spawns background tasks and reports the ones that fail unobserved
///
/// Panicking tasks are already seen by [`PanicHook`] and are not reported
/// a second time here.
#[derive(Debug, Default)]
pub struct TaskWatcher {
    sink: OnceCell<CaptureSink>,
}

impl TaskWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` in the background; an `Err` outcome becomes an
    /// unhandled-rejection event and the handle resolves to `None`
    pub fn spawn<F, T, E>(&self, name: &str, task: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let sink = self.sink.get().cloned();
        let name = name.to_string();

        tokio::spawn(async move {
            match task.await {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(task = %name, error = %e, "Background task failed");
                    if let Some(sink) = sink {
                        sink.emit(CaptureEvent::UnhandledRejection {
                            message: e.to_string(),
                            task: Some(name),
                        });
                    }
                    None
                }
            }
        })
    }
}

impl CaptureSource for TaskWatcher {
    fn kind(&self) -> CaptureKind {
        CaptureKind::UnhandledRejection
    }

    fn install(&self, sink: CaptureSink) -> Result<()> {
        self.sink.set(sink).map_err(|_| {
            Error::new(ErrorKind::Initialization, "Task watcher is already installed")
        })
    }
}
