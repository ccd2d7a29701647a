/// Signal handling for graceful shutdown.
///
/// SIGINT and SIGTERM both set the shared stop flag and are logged once per
/// delivery. The handler never exits the process itself: every suspension
/// point polls the flag and unwinds on its own.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

/// Process-wide cancellation token. Cloning shares the underlying flag.
///
/// Transitions false -> true at most once and is never reset.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    inner: Arc<AtomicBool>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cheap, non-blocking "should stop" query.
    pub fn should_stop(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    /// Request a stop. Returns `true` if this call flipped the flag.
    pub fn request_stop(&self) -> bool {
        !self.inner.swap(true, Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early if a stop is requested.
    ///
    /// Returns `true` if the full duration elapsed, `false` if interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        const TICK: Duration = Duration::from_millis(100);
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if self.should_stop() {
                return false;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep(TICK.min(deadline - now)).await;
        }
    }
}

/// Traps termination signals and routes them into a [`StopFlag`].
pub struct SignalController {
    stop: StopFlag,
    task: tokio::task::JoinHandle<()>,
}

impl SignalController {
    /// Register SIGINT and SIGTERM handlers that set `stop`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn install(stop: StopFlag) -> std::io::Result<Self> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let flag = stop.clone();

        let task = tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    received = sigint.recv() => match received {
                        Some(()) => "SIGINT",
                        None => break,
                    },
                    received = sigterm.recv() => match received {
                        Some(()) => "SIGTERM",
                        None => break,
                    },
                };
                let first = flag.request_stop();
                tracing::info!(signal = name, first, "termination signal received, shutting down gracefully");
            }
        });

        Ok(Self { stop, task })
    }

    pub fn should_stop(&self) -> bool {
        self.stop.should_stop()
    }

    pub fn flag(&self) -> &StopFlag {
        &self.stop
    }
}

impl Drop for SignalController {
    fn drop(&mut self) {
        self.task.abort();
    }
}
