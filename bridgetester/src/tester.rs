//! Probe client core: publishes numbered test messages to Q_IN, consumes
//! Q_OUT, and reconciles echoes against the outstanding [`Tracker`]. Uses
//! the same connect/backoff policy as `bridge::broker`
//! (`min(attempt * 2, 30)` seconds), restructured onto a tokio task for
//! the consume side plus the send loop on the caller's task, with its own
//! fixed `max_retries = 3` and `consumer_tag = "bridgetester"`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;

use lib_common::Settings;

use crate::tracker::Tracker;

const BACKOFF_CAP_SECS: u64 = 30;
const MAX_CONNECT_RETRIES: u32 = 3;
/// Fixed at 5 minutes, independent of whatever `mq_ttl_from_ws` the bridge
/// itself is configured with.
const MSG_TTL_MILLIS: u64 = 300_000;
const CONSUMER_TAG: &str = "bridgetester";

pub struct BridgeTester {
    settings: Settings,
    exclusive: bool,
    focused: bool,
    running: Arc<AtomicBool>,
    pub tracker: Arc<Mutex<Tracker>>,
    channel: Mutex<Option<Channel>>,
    connection: Mutex<Option<Connection>>,
}

impl BridgeTester {
    pub fn new(settings: Settings, exclusive: bool, focused: bool) -> Arc<Self> {
        Arc::new(Self {
            settings,
            exclusive,
            focused,
            running: Arc::new(AtomicBool::new(true)),
            tracker: Arc::new(Mutex::new(Tracker::default())),
            channel: Mutex::new(None),
            connection: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connects, opens a channel, and returns it — callers reuse the same
    /// channel for both publish (Q_IN) and consume (Q_OUT).
    async fn create_connection(&self) -> Option<Channel> {
        let mut attempts = 0u32;
        while self.running.load(Ordering::SeqCst) {
            attempts += 1;
            match Connection::connect(&self.settings.broker_url(), ConnectionProperties::default()).await {
                Ok(conn) => {
                    let channel = match conn.create_channel().await {
                        Ok(c) => c,
                        Err(e) => {
                            log::error!("bridgetester failed to open channel: {e}");
                            return None;
                        }
                    };
                    *self.connection.lock().await = Some(conn);
                    *self.channel.lock().await = Some(channel.clone());
                    return Some(channel);
                }
                Err(e) => {
                    if attempts > MAX_CONNECT_RETRIES {
                        log::error!("bridgetester exceeded connect retries; aborting: {e}");
                        self.running.store(false, Ordering::SeqCst);
                        return None;
                    }
                    log::error!("bridgetester connect attempt {attempts} failed: {e}");
                    let backoff = Duration::from_secs((attempts as u64 * 2).min(BACKOFF_CAP_SECS));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        None
    }

    /// Publishes one probe message to Q_IN (`send_message`).
    async fn send_message(&self, body: &str) -> bool {
        let channel = {
            let guard = self.channel.lock().await;
            guard.clone()
        };
        let Some(channel) = channel else {
            log::error!("bridgetester has no open channel; message not sent");
            return false;
        };

        if let Err(e) = channel
            .queue_declare(
                &self.settings.mq_qname_to_ws,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
        {
            log::error!("bridgetester failed to declare {}: {e}", self.settings.mq_qname_to_ws);
            return false;
        }

        let properties = BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_expiration(MSG_TTL_MILLIS.to_string().into());

        match channel
            .basic_publish(
                "",
                &self.settings.mq_qname_to_ws,
                BasicPublishOptions::default(),
                body.as_bytes(),
                properties,
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                log::error!("bridgetester publish failed: {e}");
                false
            }
        }
    }

    /// Sends `count` test messages, `delay` apart, recording each as sent
    /// in the tracker. Returns once all have been sent or `running` is
    /// cleared mid-run.
    pub async fn send_probes(&self, count: u32, delay: Duration) {
        if self.channel.lock().await.is_none() && self.create_connection().await.is_none() {
            return;
        }

        let pid = std::process::id();
        for n in 1..=count {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let time_send = Local::now();
            let body = format!("Test msg #{n} ({pid}.{})", time_send.format("%M%S"));

            self.tracker.lock().await.record_sent(body.clone(), time_send);
            let sent = self.send_message(&body).await;
            if !self.focused {
                if sent {
                    log::info!("{time_send}>>> Sent message #{n} to MQ");
                } else {
                    log::warn!("{time_send}>>> Failed to send message #{n}");
                }
            }

            if !delay.is_zero() && n < count {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Consumes Q_OUT, reconciling each received body against the
    /// tracker. Runs until `close()` clears `running` and the consumer
    /// stream ends.
    pub async fn consume_replies(self: Arc<Self>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let channel = {
                let guard = self.channel.lock().await;
                guard.clone()
            };
            let channel = match channel {
                Some(c) => c,
                None => match self.create_connection().await {
                    Some(c) => c,
                    None => return,
                },
            };

            if let Err(e) = channel
                .queue_declare(
                    &self.settings.mq_qname_from_ws,
                    QueueDeclareOptions { durable: true, ..Default::default() },
                    FieldTable::default(),
                )
                .await
            {
                log::error!("bridgetester failed to declare {}: {e}", self.settings.mq_qname_from_ws);
                return;
            }

            let consumer_res = channel
                .basic_consume(
                    &self.settings.mq_qname_from_ws,
                    CONSUMER_TAG,
                    BasicConsumeOptions { no_ack: false, ..Default::default() },
                    FieldTable::default(),
                )
                .await;
            let mut consumer = match consumer_res {
                Ok(c) => c,
                Err(e) => {
                    log::error!("bridgetester failed to start consumer: {e}");
                    return;
                }
            };

            while let Some(next) = consumer.next().await {
                if !self.running.load(Ordering::SeqCst) {
                    return;
                }
                match next {
                    Ok(delivery) => {
                        let body = String::from_utf8_lossy(&delivery.data).into_owned();
                        let time_recv = Local::now();
                        let recognized = self.tracker.lock().await.reconcile(&body, time_recv);

                        if recognized {
                            if !self.focused {
                                log::info!("{time_recv}<<< turnaround time for '{body}' recorded");
                            }
                            let _ = delivery.ack(BasicAckOptions::default()).await;
                        } else {
                            if !self.focused {
                                log::info!("{time_recv}<<< received unrecognized body: '{body}'");
                            }
                            let result = if self.exclusive {
                                delivery.ack(BasicAckOptions::default()).await
                            } else {
                                delivery
                                    .nack(BasicNackOptions { requeue: true, ..Default::default() })
                                    .await
                            };
                            if let Err(e) = result {
                                log::error!("bridgetester failed to ack/nack delivery: {e}");
                            }
                        }
                    }
                    Err(e) => {
                        if self.running.load(Ordering::SeqCst) {
                            log::error!("bridgetester consumer error: {e}; reconnecting");
                            *self.channel.lock().await = None;
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Idempotent shutdown (`close`): cancels the consumer, closes the
    /// channel then the connection.
    pub async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(channel) = self.channel.lock().await.take() {
            let _ = channel.basic_cancel(CONSUMER_TAG, Default::default()).await;
            let _ = channel.close(200, "bridgetester shutdown").await;
        }
        if let Some(connection) = self.connection.lock().await.take() {
            let _ = connection.close(200, "bridgetester shutdown").await;
        }
    }
}
