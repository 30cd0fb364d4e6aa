//! Periodic renewal of the workload certificate and trust store.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use log::{debug, error, info, warn};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::client::transport::Transport;
use crate::commons::error::{CaResult, Error};
use crate::constants::{TRUST_REFRESH_FACTOR, TRUST_REFRESH_INITIAL, TRUST_REFRESH_JITTER, TRUST_REFRESH_STEPS};

//------------ RetrySchedule -------------------------------------------------

/// Bounded exponential backoff for trust store refreshes.
#[derive(Clone, Copy, Debug)]
pub struct RetrySchedule {
    pub steps: u32,
    pub initial: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        RetrySchedule {
            steps: TRUST_REFRESH_STEPS,
            initial: TRUST_REFRESH_INITIAL,
            factor: TRUST_REFRESH_FACTOR,
            jitter: TRUST_REFRESH_JITTER,
        }
    }
}

impl RetrySchedule {
    fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial,
            multiplier: self.factor,
            randomization_factor: self.jitter,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Refreshes the trust store, retrying transient failures.
///
/// Gives up after the schedule's number of attempts, leaving the store as
/// it was.
pub async fn refresh_trust_store_with_backoff(transport: &Transport, schedule: RetrySchedule) -> CaResult<usize> {
    let mut attempts = 0;
    let op = || {
        attempts += 1;
        let attempt = attempts;
        async move {
            transport.refresh_trust_store().await.map_err(|e| {
                if attempt >= schedule.steps || !e.is_transient() {
                    backoff::Error::permanent(e)
                } else {
                    backoff::Error::transient(e)
                }
            })
        }
    };
    let notify = |err: Error, next: Duration| {
        warn!("trust store refresh failed, retrying in {}ms: {}", next.as_millis(), err);
    };

    backoff::future::retry_notify(schedule.policy(), op, notify).await
}

//------------ RotateController ----------------------------------------------

#[derive(Debug)]
pub struct RotateController {
    transport: Arc<Transport>,
    rotate_after: Duration,
    schedule: RetrySchedule,
}

impl RotateController {
    pub fn new(transport: Arc<Transport>, rotate_after: Duration) -> Self {
        RotateController {
            transport,
            rotate_after,
            schedule: RetrySchedule::default(),
        }
    }

    pub fn with_schedule(mut self, schedule: RetrySchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Runs one rotation. Returns whether a new certificate was installed.
    pub async fn tick(&self) -> bool {
        let renewed = match self.transport.auto_update().await {
            Ok(renewed) => renewed,
            Err(e) => {
                error!("cannot renew certificate of {}: {}", self.transport.identity(), e);
                false
            }
        };

        match refresh_trust_store_with_backoff(&self.transport, self.schedule).await {
            Ok(added) => debug!("trust store of {} refreshed, {} new certificates", self.transport.identity(), added),
            Err(e) => error!("giving up refreshing the trust store, keeping the current one: {}", e),
        }
        renewed
    }

    /// Runs the controller every `rotate_after` until the returned token is
    /// cancelled.
    pub fn spawn(self) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.rotate_after, self.rotate_after);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                "rotating the certificate of {} every {}s",
                self.transport.identity(),
                self.rotate_after.as_secs()
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("rotate controller of {} stopped", self.transport.identity());
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        });

        cancel
    }
}

//------------ Tests ---------------------------------------------------------
