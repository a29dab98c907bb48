//! The per-partition refill actor and the creation retry policy it shares
//! with bootstrap and reacquire.

use std::cmp::min;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::partition::{Handle, Partition};
use crate::pool::SharedPool;
use crate::{ConnectOptions, ConnectionFactory};

/// Creates one connection with the pool's retry policy: up to `attempts`
/// factory calls with `delay` between them. Failed attempts feed the
/// partition's server-down latch; a success clears it.
pub(crate) async fn create_with_retry<F>(
    factory: &F,
    partition: &Partition<F::Connection>,
    opts: &ConnectOptions,
    attempts: u32,
    delay: Duration,
    max_failed: u32,
) -> Result<F::Connection, F::Error>
where
    F: ConnectionFactory,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match factory.create(&partition.server, opts).await {
            Ok(conn) => {
                partition.note_create_success();
                return Ok(conn);
            }
            Err(err) => {
                warn!(
                    server = %partition.server,
                    attempt,
                    error = %err,
                    "connection create failed"
                );
                if partition.note_create_failure(max_failed) {
                    error!(
                        server = %partition.server,
                        "marking server down after repeated create failures"
                    );
                }
                if attempt >= attempts {
                    return Err(err);
                }
                sleep(delay).await;
            }
        }
    }
}

/// One watcher runs per partition. It parks on the partition's signal queue
/// and, on each wake, grows the partition by at most one acquire-increment
/// batch, then tops it up to the configured minimum. Pools built eagerly get
/// one immediate pass before the first park.
///
/// The watcher holds only a weak reference to the pool while parked, so
/// dropping the last `Pool` clone ends it; an explicit shutdown broadcast
/// ends it sooner.
pub(crate) async fn run_watcher<F>(
    shared: Weak<SharedPool<F>>,
    index: usize,
    mut signal_rx: mpsc::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    F: ConnectionFactory,
{
    let mut first_pass = match shared.upgrade() {
        Some(pool) => !pool.statics.lazy_init,
        None => return,
    };
    loop {
        if !first_pass {
            tokio::select! {
                received = signal_rx.recv() => {
                    if received.is_none() {
                        // Every signal sender is gone: the pool was dropped.
                        return;
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }
        first_pass = false;
        let pool = match shared.upgrade() {
            Some(pool) => pool,
            None => return,
        };
        if pool.is_shutting_down() || *shutdown_rx.borrow() {
            return;
        }
        replenish(&pool, index).await;
        // Only the weak reference survives the park.
        drop(pool);
    }
}

async fn replenish<F>(pool: &Arc<SharedPool<F>>, index: usize)
where
    F: ConnectionFactory,
{
    let partition = &pool.partitions[index];
    let statics = &pool.statics;

    let created = partition.created();
    let deficit = statics.max_connections_per_server.saturating_sub(created);
    if deficit == 0 {
        partition.block_growth();
        return;
    }
    let above_threshold =
        partition.available() * 100 / partition.max > statics.availability_threshold;
    if above_threshold && created >= statics.min_connections_per_server {
        // Someone beat us to it.
        return;
    }

    let batch = min(deficit, statics.acquire_increment);
    for _ in 0..batch {
        if pool.is_shutting_down() {
            return;
        }
        if !grow_one(pool, partition).await {
            return;
        }
    }
    while partition.created() < statics.min_connections_per_server {
        if pool.is_shutting_down() {
            return;
        }
        if !grow_one(pool, partition).await {
            return;
        }
    }
    debug!(
        created = partition.created(),
        available = partition.available(),
        "partition replenished"
    );
}

/// Adds one connection to the partition. Returns false when the create
/// failed after its retries, which abandons the current batch; the
/// retry delay has already been slept at that point, so the watcher will
/// not hot-loop if a release immediately re-signals.
async fn grow_one<F>(pool: &Arc<SharedPool<F>>, partition: &Partition<F::Connection>) -> bool
where
    F: ConnectionFactory,
{
    let statics = &pool.statics;
    match create_with_retry(
        &pool.factory,
        partition,
        &pool.connect_options,
        statics.acquire_retry_attempts,
        statics.acquire_retry_delay,
        statics.max_create_failed_count,
    )
    .await
    {
        Ok(conn) => {
            let handle = Handle::new(conn, partition.index);
            partition.increment_created();
            if let Err(handle) = partition.offer_free(handle) {
                error!(
                    server = %partition.server,
                    "free queue refused a handle below capacity"
                );
                partition.decrement_created();
                drop(handle);
            }
            true
        }
        Err(_) => {
            if partition.is_server_down() {
                // Suppress threshold-driven refill signals until a destroy
                // or a successful create reopens growth.
                partition.block_growth();
            }
            sleep(statics.acquire_retry_delay).await;
            false
        }
    }
}
