//! Tick Scheduler
//!
//! The single authoritative loop that advances every session at a fixed
//! rate, independent of connection I/O, and reaps finished sessions.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::game::directory::SharedDirectory;
use crate::game::session::SessionId;

/// Summary of one scheduler pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Sessions ticked.
    pub sessions_ticked: usize,
    /// Sessions removed after finishing.
    pub reaped: Vec<SessionId>,
}

/// Fixed-rate session advancement.
pub struct TickScheduler {
    directory: SharedDirectory,
    period: Duration,
    ticks: u64,
}

impl TickScheduler {
    /// Create a scheduler running at `tick_rate` Hz. A rate of 0 is treated as 1.
    pub fn new(directory: SharedDirectory, tick_rate: u32) -> Self {
        let period = Duration::from_micros(1_000_000 / u64::from(tick_rate.max(1)));
        Self {
            directory,
            period,
            ticks: 0,
        }
    }

    /// Nominal tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks run so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run one pass: tick every session, then remove the ones that finished.
    ///
    /// Removal happens after the whole pass so the collection is never
    /// mutated while it is being iterated.
    pub async fn step(&mut self) -> TickReport {
        let mut directory = self.directory.lock().await;
        self.ticks += 1;

        let sessions_ticked = directory.session_count();
        let finished = directory.tick_all();

        let mut reaped = Vec::with_capacity(finished.len());
        for id in finished {
            if let Some(session) = directory.remove(id) {
                let lifetime = Utc::now() - session.started_at();
                info!(
                    "Game {} stopped after {} ticks ({}s)",
                    id,
                    session.ticks(),
                    lifetime.num_seconds()
                );
                reaped.push(id);
            }
        }

        TickReport {
            sessions_ticked,
            reaped,
        }
    }

    /// Run until `shutdown` fires (or its sender is dropped).
    ///
    /// Sleeps only the remainder of each period. An overrunning tick is
    /// followed immediately by the next one, with no catch-up burst.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Tick scheduler running every {:?}", self.period);

        loop {
            let started = Instant::now();
            self.step().await;
            let elapsed = started.elapsed();

            let remaining = self.period.saturating_sub(elapsed);
            if remaining.is_zero() {
                warn!("Tick {} overran its budget: {:?} > {:?}", self.ticks, elapsed, self.period);
            }

            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = shutdown.recv() => {
                    debug!("Tick scheduler cancelled");
                    break;
                }
            }
        }

        info!("Tick scheduler stopped after {} ticks", self.ticks);
    }
}
