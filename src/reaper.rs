//! Background actors that retire connections: the idle reaper (idle TTL and
//! periodic liveness probes) and the age reaper (absolute TTL).

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::debug;

use crate::pool::SharedPool;
use crate::ConnectionFactory;

/// Reaps one partition's free queue on a fixed period: connections idle past
/// `idle_max_age` are destroyed, and connections due a probe are pulled out
/// (invisible to acquirers), probed, and reinserted at the tail when they
/// pass. The period is the larger of the two configured intervals, so a
/// handle is never probed more often than it could expire.
pub(crate) async fn run_idle_reaper<F>(
    shared: Weak<SharedPool<F>>,
    index: usize,
    mut shutdown_rx: watch::Receiver<bool>,
    period: Duration,
) where
    F: ConnectionFactory,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => return,
        }
        let pool = match shared.upgrade() {
            Some(pool) => pool,
            None => return,
        };
        if pool.is_shutting_down() {
            return;
        }
        let partition = &pool.partitions[index];
        let (expired, due_probe) = partition.take_idle_reapable(
            pool.statics.idle_max_age,
            pool.statics.idle_test_period,
            pool.statics.service_order,
        );
        for handle in expired {
            debug!(server = %partition.server, "reaping idle connection");
            pool.destroy(handle);
        }
        for mut handle in due_probe {
            // Shutdown wins a race with the probe.
            if pool.is_shutting_down() {
                pool.destroy(handle);
                continue;
            }
            if pool.factory.is_alive(&mut handle.conn).await {
                handle.last_reset = Instant::now().into_std();
                pool.reinsert(handle);
            } else {
                debug!(server = %partition.server, "reaping connection that failed its probe");
                pool.destroy(handle);
            }
        }
    }
}

/// Destroys free connections past the absolute TTL. Borrowed connections are
/// left alone; the release path catches them as expired.
pub(crate) async fn run_age_reaper<F>(
    shared: Weak<SharedPool<F>>,
    index: usize,
    mut shutdown_rx: watch::Receiver<bool>,
    max_age: Duration,
) where
    F: ConnectionFactory,
{
    let mut ticker = interval_at(Instant::now() + max_age, max_age);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => return,
        }
        let pool = match shared.upgrade() {
            Some(pool) => pool,
            None => return,
        };
        if pool.is_shutting_down() {
            return;
        }
        let partition = &pool.partitions[index];
        for handle in partition.take_age_expired(max_age, pool.statics.service_order) {
            debug!(server = %partition.server, "reaping connection past its maximum age");
            pool.destroy(handle);
        }
    }
}
