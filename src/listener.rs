use sqlx::postgres::{PgListener, PgNotification};
use sqlx::{Pool, Postgres};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dequeuers::Dequeuers;

/// Owns the one persistent LISTEN connection of a queue instance.
///
/// Notifications on the queue channel wake every blocked dequeuer, ids on the
/// cancel channel are re-broadcast in-process. Keeping the connection open
/// between waits avoids missing notifications sent in between.
pub(crate) struct Listener {
    pool: Pool<Postgres>,
    queue_channel: String,
    cancel_channel: String,
    dequeuers: Arc<Dequeuers>,
    cancellations: broadcast::Sender<Uuid>,
    backoff: Duration,
    conn: Option<PgListener>,
}

impl Listener {
    pub(crate) fn new(
        pool: Pool<Postgres>,
        queue_channel: String,
        cancel_channel: String,
        dequeuers: Arc<Dequeuers>,
        cancellations: broadcast::Sender<Uuid>,
        backoff: Duration,
    ) -> Self {
        Self {
            pool,
            queue_channel,
            cancel_channel,
            dequeuers,
            cancellations,
            backoff,
            conn: None,
        }
    }

    /// Establishes the LISTEN connection if there is none.
    pub(crate) async fn ensure_connection(&mut self) -> sqlx::Result<&mut PgListener> {
        if self.conn.is_none() {
            let mut conn = PgListener::connect_with(&self.pool).await?;
            conn.listen_all([self.queue_channel.as_str(), self.cancel_channel.as_str()])
                .await?;
            debug!(
                "listening on {} and {}",
                self.queue_channel, self.cancel_channel
            );
            self.conn = Some(conn);
            // anything published while we were not listening is lost, let the
            // waiters look for themselves
            self.dequeuers.notify_all();
        }
        match self.conn.as_mut() {
            Some(conn) => Ok(conn),
            None => Err(sqlx::Error::PoolClosed),
        }
    }

    /// Blocks until the next notification and fans it out.
    async fn wait_and_notify(&mut self) -> sqlx::Result<()> {
        let conn = self.ensure_connection().await?;
        match conn.try_recv().await {
            Ok(Some(notification)) => {
                self.dispatch(notification);
                Ok(())
            }
            Ok(None) => {
                warn!("lost connection to {}, reconnecting", self.queue_channel);
                self.conn = None;
                Ok(())
            }
            Err(err) => {
                self.conn = None;
                Err(err)
            }
        }
    }

    fn dispatch(&self, notification: PgNotification) {
        let channel = notification.channel();
        trace!("notification on {channel}: {}", notification.payload());

        if channel == self.cancel_channel {
            match Uuid::parse_str(notification.payload()) {
                Ok(id) => {
                    // no receivers is fine
                    let _ = self.cancellations.send(id);
                }
                Err(err) => {
                    warn!("unable to parse canceled task id {notification:?}: {err}");
                }
            }
        }

        // something changed, every blocked dequeuer retries its claim
        self.dequeuers.notify_all();
    }

    /// Runs until `stop` fires or the pool is closed. Connection errors are
    /// logged and retried after the configured backoff.
    pub(crate) async fn run(mut self, stop: CancellationToken) {
        info!("starting listener on {}", self.queue_channel);

        loop {
            let result = tokio::select! {
                _ = stop.cancelled() => break,
                result = self.wait_and_notify() => result,
            };

            match result {
                Ok(()) => {}
                Err(sqlx::Error::PoolClosed) => {
                    warn!("pool closed, stopping listener on {}", self.queue_channel);
                    break;
                }
                Err(err) => {
                    error!(
                        "error waiting for notification on {}: {err}",
                        self.queue_channel
                    );
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }

        if let Some(mut conn) = self.conn.take() {
            if let Err(err) = conn.unlisten_all().await {
                debug!("error unlistening {}: {err}", self.queue_channel);
            }
        }

        info!("shutting down the listener on {}", self.queue_channel);
    }
}
