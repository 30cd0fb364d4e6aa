//! Periodic health probes of the upstream CAs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::ca::upper::{UpperCa, UpperClients};
use crate::commons::metrics::{MetricsPoint, MetricsSink};
use crate::constants::{HEALTH_STATUS_UNREACHABLE, METRICS_UPPER_CA_INFO};

/// Starts probing every upstream CA at the given interval.
///
/// Each probe runs as its own task so a slow upstream does not delay the
/// others. The returned token stops the loop.
pub fn spawn_checker(
    uppers: UpperClients,
    metrics: Arc<dyn MetricsSink>,
    every: Duration,
    local_ip: String,
) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("checking {} upstream CAs every {}s", uppers.len(), every.as_secs());

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("upstream CA checker stopped");
                    break;
                }
                _ = ticker.tick() => {
                    for upper in uppers.all_clients() {
                        tokio::spawn(check_upper(upper.clone(), metrics.clone(), local_ip.clone()));
                    }
                }
            }
        }
    });

    cancel
}

/// Probes one upstream and records the outcome.
pub async fn check_upper(upper: Arc<dyn UpperCa>, metrics: Arc<dyn MetricsSink>, local_ip: String) {
    let started = Instant::now();
    let status = match upper.health().await {
        Ok(status) => {
            if !status.is_success() {
                warn!("upstream CA {} reports status {}", upper.host(), status);
            }
            status.as_u16()
        }
        Err(e) => {
            warn!("upstream CA {} unreachable: {}", upper.host(), e);
            HEALTH_STATUS_UNREACHABLE
        }
    };
    let delay = started.elapsed().as_millis() as i64;
    debug!("upstream CA {} answered {} in {}ms", upper.host(), status, delay);

    metrics.add_point(
        MetricsPoint::new(METRICS_UPPER_CA_INFO)
            .tag("host", upper.host())
            .tag("status", status)
            .tag("ip", &local_ip)
            .field("status", status)
            .field("delay", delay),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::metrics::{FieldValue, MemoryMetrics};
    use crate::test::FakeUpper;

    #[tokio::test]
    async fn failures_are_recorded_as_unreachable() {
        let metrics = Arc::new(MemoryMetrics::default());
        check_upper(FakeUpper::failing("down:8081"), metrics.clone(), "10.0.0.1".into()).await;
        check_upper(FakeUpper::healthy("up:8081"), metrics.clone(), "10.0.0.1".into()).await;

        let points = metrics.points_for(METRICS_UPPER_CA_INFO);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].get_tag("host"), Some("down:8081"));
        assert_eq!(points[0].get_tag("status"), Some("599"));
        assert_eq!(points[0].fields["status"], FieldValue::Int(599));
        assert_eq!(points[1].get_tag("status"), Some("200"));
        assert_eq!(points[1].get_tag("ip"), Some("10.0.0.1"));
        assert!(points[1].fields.contains_key("delay"));
    }

    #[tokio::test]
    async fn loop_probes_until_cancelled() {
        let metrics = Arc::new(MemoryMetrics::default());
        let uppers = UpperClients::new(vec![FakeUpper::healthy("a") as Arc<dyn UpperCa>]);
        let cancel = spawn_checker(uppers, metrics.clone(), Duration::from_millis(10), "ip".into());

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = metrics.points_for(METRICS_UPPER_CA_INFO).len();
        assert!(seen >= 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(metrics.points_for(METRICS_UPPER_CA_INFO).len(), seen);
    }
}
