use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Shutdown request broadcast by the [`Controller`] to all subscribed services.
///
/// Services should stop accepting new work. With a timeout, work in flight may finish within that
/// time. Without a timeout, the shutdown is immediate and work in flight should be abandoned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

/// Determines how to shut down the system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Finish work in flight within the configured shutdown timeout.
    Graceful,
    /// Stop immediately.
    Immediate,
}

/// Notifies a service about an upcoming shutdown.
#[derive(Clone, Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Waits for a shutdown to be triggered.
    ///
    /// Returns immediately if a shutdown has already been triggered. This is cancellation safe and
    /// can be used in a `select!` loop.
    pub async fn notified(&mut self) -> Shutdown {
        loop {
            if let Some(shutdown) = self.0.borrow_and_update().clone() {
                return shutdown;
            }

            // The controller is gone, nothing will keep the system alive.
            if self.0.changed().await.is_err() {
                return Shutdown { timeout: None };
            }
        }
    }

    /// Returns the shutdown if one has been triggered.
    pub fn get(&self) -> Option<Shutdown> {
        self.0.borrow().clone()
    }
}

/// Coordinates a graceful shutdown of all services.
///
/// Services obtain a [`ShutdownHandle`] from the controller and stop once it is notified. The
/// controller can be cloned and shared, and [`start`](Self::start) listens to process signals.
#[derive(Clone, Debug)]
pub struct Controller {
    tx: Arc<watch::Sender<Option<Shutdown>>>,
    timeout: Duration,
}

impl Controller {
    /// Creates a controller without listening to signals.
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            timeout: shutdown_timeout,
        }
    }

    /// Creates a controller and starts listening to shutdown signals.
    ///
    /// `SIGINT` and `SIGTERM` trigger a graceful shutdown, `SIGQUIT` stops immediately. Must be
    /// called within a tokio runtime.
    pub fn start(shutdown_timeout: Duration) -> Self {
        let controller = Self::new(shutdown_timeout);

        let monitor = controller.clone();
        tokio::spawn(async move {
            if let Err(error) = monitor.monitor_signals().await {
                rebalancer_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to listen to shutdown signals"
                );
            }
        });

        controller
    }

    /// Returns a handle that is notified when the system shuts down.
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.tx.subscribe())
    }

    /// Triggers a shutdown of all services holding a handle.
    pub fn shutdown(&self, mode: ShutdownMode) {
        let timeout = match mode {
            ShutdownMode::Graceful => Some(self.timeout),
            ShutdownMode::Immediate => None,
        };

        self.tx.send_replace(Some(Shutdown { timeout }));
    }

    #[cfg(unix)]
    async fn monitor_signals(&self) -> io::Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sig_int = signal(SignalKind::interrupt())?;
        let mut sig_quit = signal(SignalKind::quit())?;
        let mut sig_term = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sig_int.recv() => {
                rebalancer_log::info!("SIGINT received, stopping in {}s", self.timeout.as_secs());
                self.shutdown(ShutdownMode::Graceful);
            },
            _ = sig_quit.recv() => {
                rebalancer_log::info!("SIGQUIT received, exiting");
                self.shutdown(ShutdownMode::Immediate);
            },
            _ = sig_term.recv() => {
                rebalancer_log::info!("SIGTERM received, stopping in {}s", self.timeout.as_secs());
                self.shutdown(ShutdownMode::Graceful);
            },
        }

        Ok(())
    }

    #[cfg(not(unix))]
    async fn monitor_signals(&self) -> io::Result<()> {
        tokio::signal::ctrl_c().await?;
        rebalancer_log::info!("SIGINT received, stopping in {}s", self.timeout.as_secs());
        self.shutdown(ShutdownMode::Graceful);
        Ok(())
    }
}
