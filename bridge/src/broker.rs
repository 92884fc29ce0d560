//! Broker Handler: durable consumer on Q_IN, durable publisher to Q_OUT,
//! ack/requeue contract.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{broadcast, Mutex as AsyncMutex, OnceCell};

use lib_common::Settings;

use crate::model::{ConnectionState, Counters, ForwardFn};

/// Connect attempts sleep `min(attempt * 2, 30)` seconds between tries,
/// capped regardless of how many attempts precede.
const BACKOFF_CAP_SECS: u64 = 30;
/// Retries on publish sleep a flat second between tries.
const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct BrokerHandler {
    settings: Settings,
    pub state: Arc<ConnectionState>,
    counters: Arc<Counters>,
    forward: OnceCell<ForwardFn>,
    channel: AsyncMutex<Option<Channel>>,
    connection: AsyncMutex<Option<Connection>>,
}

impl BrokerHandler {
    pub fn new(settings: Settings, counters: Arc<Counters>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            state: ConnectionState::new(),
            counters,
            forward: OnceCell::new(),
            channel: AsyncMutex::new(None),
            connection: AsyncMutex::new(None),
        })
    }

    /// Wires the callback invoked for every body consumed off Q_IN
    /// (normally the WebSocket handler's `send`). Must be called once,
    /// before `run()`.
    pub fn set_forward(&self, forward: ForwardFn) {
        let _ = self.forward.set(forward);
    }

    /// Main loop: sets `running=true` and enters the consume loop against
    /// Q_IN.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        self.state.set_running(true);
        self.consume_messages(&mut shutdown).await;
        self.state.set_running(false);
        log::info!("Exiting broker handler");
    }

    async fn consume_messages(&self, shutdown: &mut broadcast::Receiver<()>) {
        if self.connection.lock().await.is_none() {
            if !self.create_connection(shutdown).await {
                return;
            }
        }

        while self.state.is_running() {
            let channel = match self.open_channel().await {
                Ok(c) => c,
                Err(e) => {
                    if self.state.is_running() {
                        log::error!("broker exception opening channel: {e}");
                        if !self.create_connection(shutdown).await {
                            return;
                        }
                    }
                    continue;
                }
            };

            let consumer_res = channel
                .basic_consume(
                    &self.settings.mq_qname_to_ws,
                    &self.settings.mq_consumer_tag,
                    BasicConsumeOptions { no_ack: false, ..Default::default() },
                    FieldTable::default(),
                )
                .await;

            let mut consumer = match consumer_res {
                Ok(c) => c,
                Err(e) => {
                    log::error!("broker exception starting consumer: {e}");
                    if !self.create_connection(shutdown).await {
                        return;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        self.state.set_running(false);
                        let _ = self.close_connection().await;
                        return;
                    }
                    next = consumer.next() => {
                        match next {
                            Some(Ok(delivery)) => {
                                let acked = self.handle_delivery(&delivery.data).await;
                                let result = if acked {
                                    delivery.ack(BasicAckOptions::default()).await
                                } else {
                                    delivery
                                        .nack(BasicNackOptions { requeue: true, ..Default::default() })
                                        .await
                                };
                                if let Err(e) = result {
                                    log::error!("broker failed to ack/nack delivery: {e}");
                                }
                            }
                            Some(Err(e)) => {
                                if self.state.is_running() {
                                    log::error!("broker exception caught during consume loop: {e}");
                                    if !self.create_connection(shutdown).await {
                                        return;
                                    }
                                }
                                break;
                            }
                            None => {
                                // Consumer stream closed; reconnect if we're still meant to run.
                                if self.state.is_running() {
                                    if !self.create_connection(shutdown).await {
                                        return;
                                    }
                                }
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Message callback: reject-with-requeue if not running, else invoke
    /// `forward` and ack/reject on its result.
    async fn handle_delivery(&self, body: &[u8]) -> bool {
        if !self.state.is_running() {
            log::debug!("couldn't consume message since server is not running (msg re-queued)");
            return false;
        }

        let Some(forward) = self.forward.get() else {
            log::error!("broker handler has no forward callback wired; rejecting");
            return false;
        };
        let ok = forward(body.to_vec()).await;
        log::debug!("broker finished sending msg to WebSocket handler");
        ok
    }

    async fn open_channel(&self) -> Result<Channel, lapin::Error> {
        let conn_guard = self.connection.lock().await;
        let conn = conn_guard.as_ref().ok_or(lapin::Error::InvalidConnectionState(
            lapin::ConnectionState::Closed,
        ))?;
        let channel = conn.create_channel().await?;
        channel
            .queue_declare(
                &self.settings.mq_qname_to_ws,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        *self.channel.lock().await = Some(channel.clone());
        Ok(channel)
    }

    /// Connect/reconnect policy: attempts counted from 1, cumulative
    /// across the process lifetime, backoff `min(attempt * 2, 30)`
    /// seconds, terminal failure after `mq_max_retries`.
    async fn create_connection(&self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let mut attempts = 0u32;
        while self.state.is_running() {
            attempts += 1;
            self.counters.broker_connect_attempts.fetch_add(1, Ordering::Relaxed);

            match Connection::connect(&self.settings.broker_url(), ConnectionProperties::default()).await {
                Ok(conn) => {
                    *self.connection.lock().await = Some(conn);
                    return true;
                }
                Err(e) => {
                    if self.settings.mq_max_retries > 0 && attempts > self.settings.mq_max_retries {
                        log::error!("exceeded number of failed attempts to open broker connection: {e}");
                        self.state.set_failed("exceeded max connect retries");
                        return false;
                    }
                    log::error!(
                        "caught exception (retry {attempts}/{}) opening broker connection: {e}",
                        self.settings.mq_max_retries
                    );
                }
            }

            let backoff = Duration::from_secs((attempts as u64 * 2).min(BACKOFF_CAP_SECS));
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.recv() => {
                    self.state.set_running(false);
                    return false;
                }
            }
        }
        false
    }

    /// Publish: declare durable, attach `expiration`/`content_type`, retry
    /// up to `mq_max_retries` times with a flat 1s delay between tries.
    pub async fn publish(&self, queue: &str, body: Vec<u8>) -> bool {
        let channel = {
            let guard = self.channel.lock().await;
            guard.clone()
        };
        let Some(channel) = channel else {
            log::error!("broker message not sent; handler has no open channel");
            return false;
        };

        if let Err(e) = channel
            .queue_declare(queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await
        {
            log::error!("failed to declare queue {queue}: {e}");
            return false;
        }

        let properties = BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_expiration(self.settings.ttl_from_ws_millis().to_string().into());

        let mut retries_left = self.settings.mq_max_retries;
        loop {
            if !self.state.is_running() && retries_left < self.settings.mq_max_retries {
                log::error!("broker message not sent; handler is not running");
                return false;
            }

            match channel
                .basic_publish(
                    "",
                    queue,
                    BasicPublishOptions::default(),
                    &body,
                    properties.clone(),
                )
                .await
            {
                Ok(_) => {
                    log::debug!("sent broker message. routing key: {queue}");
                    return true;
                }
                Err(e) => {
                    if retries_left == 0 {
                        log::error!("broker message not sent due to errors: {e}");
                        return false;
                    }
                    retries_left -= 1;
                    log::error!("exception caught during broker publish: {e}. retries left: {retries_left}");
                    tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Idempotent close: clears `running`, cancels the consumer by tag,
    /// then drops channel/connection.
    pub async fn close(&self) {
        self.state.set_running(false);
        let _ = self.close_connection().await;
    }

    async fn close_connection(&self) -> Result<(), lapin::Error> {
        if let Some(channel) = self.channel.lock().await.take() {
            let _ = channel
                .basic_cancel(&self.settings.mq_consumer_tag, BasicCancelOptions::default())
                .await;
            let _ = channel.close(200, "bridge shutdown").await;
        }
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close(200, "bridge shutdown").await?;
        }
        Ok(())
    }
}
