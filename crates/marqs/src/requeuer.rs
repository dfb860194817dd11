//! Visibility-timeout requeueing.
//!
//! Workers poll the visibility ZSET for messages whose lease expired and
//! return them to their queue via the nack script, at their original enqueue
//! timestamp so late messages go back to the head. Workers run independently
//! and may overlap; the nack script is a no-op for ids another worker (or an
//! explicit ack/nack) already handled.

use crate::broker::Inner;
use crate::message::now_ms;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// How many expired messages one worker handles per tick.
const BATCH_SIZE: isize = 10;

pub(crate) struct Requeuer {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Requeuer {
    pub fn start(inner: Arc<Inner>, workers: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        let handles = (0..workers)
            .map(|worker| {
                let inner = inner.clone();
                let mut shutdown_rx = shutdown_tx.subscribe();

                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(POLL_INTERVAL);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                    loop {
                        tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            _ = ticker.tick() => {
                                if let Err(error) = requeue_expired(&inner).await {
                                    tracing::error!(worker, %error, "requeue pass failed");
                                }
                            }
                        }
                    }
                    tracing::debug!(worker, "requeue worker stopped");
                })
            })
            .collect();

        Self {
            shutdown_tx,
            handles,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = futures::future::join_all(self.handles).await;
    }
}

async fn requeue_expired(inner: &Inner) -> crate::Result<()> {
    let expired = inner.expired_message_ids(now_ms(), BATCH_SIZE).await?;

    for message_id in expired {
        match inner.read_payload(&message_id).await? {
            Some(payload) => {
                let requeued = inner.nack_message(&payload, payload.timestamp).await?;
                if requeued {
                    tracing::debug!(
                        %message_id,
                        queue = %payload.queue,
                        "returned expired message to its queue"
                    );
                }
            }
            None => {
                // Unparsable bodies were already logged by the read; dropping
                // the id from the visibility ZSET stops the redelivery loop.
                tracing::warn!(%message_id, "removing expired message without a usable body");
                inner.remove_from_visibility(&message_id).await?;
            }
        }
    }
    Ok(())
}
