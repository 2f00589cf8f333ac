//! Process-wide graceful shutdown.
//!
//! One listener turns SIGTERM/ctrl-c into a broadcast flag; every task
//! selects on its own [`Shutdown::wait`] future and drains when it fires.

use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
};

/// How long tasks get to drain after the shutdown signal before the process
/// abandons them and exits.
pub const SHUTDOWN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Snafu)]
#[snafu(display("cannot listen for termination signals"))]
pub struct SignalError {
    source: std::io::Error,
}

/// A cloneable handle on the process termination flag.
#[derive(Clone)]
pub struct Shutdown {
    flag: watch::Receiver<bool>,
}

impl Shutdown {
    /// Installs the process signal listener. Call once at startup.
    pub fn install() -> Result<Self, SignalError> {
        let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;
        let (set, flag) = watch::channel(false);

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            let _ = set.send(true);
        });

        Ok(Self { flag })
    }

    /// A signal under caller control, for tests and fatal-error paths.
    pub fn manual() -> (watch::Sender<bool>, Self) {
        let (set, flag) = watch::channel(false);
        (set, Self { flag })
    }

    /// Completes once the flag is set, including when it was set before this
    /// call. Cheap enough for every task to hold one.
    pub fn wait(&self) -> impl Future<Output = ()> + use<> {
        let mut flag = self.flag.clone();

        async move {
            while !*flag.borrow_and_update() {
                if flag.changed().await.is_err() {
                    // The sender is gone and will never flip the flag;
                    // treat that as shutdown.
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_waiter_observes_the_signal() {
        let (set, shutdown) = Shutdown::manual();
        let first = shutdown.wait();
        let second = shutdown.wait();

        set.send(true).unwrap();
        first.await;
        second.await;
    }

    #[tokio::test]
    async fn waiters_created_after_the_signal_complete_immediately() {
        let (set, shutdown) = Shutdown::manual();
        set.send(true).unwrap();
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn a_dropped_sender_counts_as_shutdown() {
        let (set, shutdown) = Shutdown::manual();
        drop(set);
        shutdown.wait().await;
    }
}
