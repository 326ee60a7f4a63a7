//! Supervised periodic background tasks
//!
//! A `LoopSet` owns a shutdown channel and the join handles of every loop it
//! spawned. Each loop sleeps, runs its tick, and goes around again. Tick
//! errors and panics are logged and followed by a shorter retry sleep; only
//! `shutdown` ends a loop.

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Boxed future returned by a loop tick
pub type TickFuture = BoxFuture<'static, Result<()>>;

/// Lifecycle of a component that owns background loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Stopped => write!(f, "Stopped"),
            RunState::Running => write!(f, "Running"),
        }
    }
}

/// A group of loops stopped together
pub struct LoopSet {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for LoopSet {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopSet {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Spawn a loop that runs `tick` every `interval`
    pub fn spawn<F>(&mut self, name: &'static str, interval: Duration, retry_delay: Duration, tick: F)
    where
        F: FnMut() -> TickFuture + Send + 'static,
    {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(run_periodic(name, interval, retry_delay, shutdown_rx, tick));
        self.handles.push((name, handle));
    }

    /// Signal every loop and wait for all of them to finish
    pub async fn shutdown(self) {
        // No receivers left just means every loop already exited
        let _ = self.shutdown_tx.send(());

        let names: Vec<&'static str> = self.handles.iter().map(|(n, _)| *n).collect();
        let results = futures::future::join_all(self.handles.into_iter().map(|(_, h)| h)).await;

        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => debug!(task = name, "Background loop stopped"),
                Err(e) if e.is_cancelled() => debug!(task = name, "Background loop cancelled"),
                Err(e) => warn!(task = name, "Background loop ended abnormally: {}", e),
            }
        }
    }
}

async fn run_periodic<F>(
    name: &'static str,
    interval: Duration,
    retry_delay: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut tick: F,
) where
    F: FnMut() -> TickFuture + Send + 'static,
{
    let retry_delay = retry_delay.min(interval);
    let mut delay = interval;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            outcome = AssertUnwindSafe(tick()).catch_unwind() => {
                delay = match outcome {
                    Ok(Ok(())) => interval,
                    Ok(Err(e)) => {
                        warn!(task = name, "Background loop iteration failed: {:#}", e);
                        retry_delay
                    }
                    Err(_) => {
                        error!(task = name, "Background loop iteration panicked");
                        retry_delay
                    }
                };
            }
        }
    }

    debug!(task = name, "Background loop received shutdown");
}
