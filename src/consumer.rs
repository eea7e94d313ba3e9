//! RabbitMQ consumer: connection lifecycle, acknowledgement and reconnect.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::observer::{Observation, Observer};
use crate::service::NotificationService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub url: String,
    pub queue: String,
    pub exchange: String,
    pub consumer_tag: String,
    pub reconnect_delay: Duration,
    /// Requeue a failed delivery even when the broker already redelivered it once.
    pub requeue_redelivered: bool,
}

/// One connection attempt, run until the connection fails (`Err`) or
/// shutdown is observed (`Ok`).
#[async_trait]
pub trait QueueSession: Send {
    async fn run(&mut self, shutdown: &CancellationToken) -> Result<()>;
}

/// Run `session` again after every connection failure, `delay` apart, until
/// `shutdown` is cancelled.
pub async fn run_until_shutdown<S: QueueSession>(
    session: &mut S,
    shutdown: &CancellationToken,
    delay: Duration,
    observer: &dyn Observer,
) {
    while !shutdown.is_cancelled() {
        let error = match session.run(shutdown).await {
            Ok(()) => continue,
            Err(error) => error,
        };
        if shutdown.is_cancelled() {
            break;
        }

        observer.observe(&Observation::ReconnectScheduled {
            delay,
            error: &error,
        });
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    observer.observe(&Observation::ShutdownObserved);
}

/// Whether a failed delivery goes back on the queue.
pub fn requeue_on_failure(requeue_redelivered: bool, redelivered: bool) -> bool {
    requeue_redelivered || !redelivered
}

pub struct AmqpConsumer {
    settings: QueueSettings,
    service: NotificationService,
    observer: Arc<dyn Observer>,
    state: ConsumerState,
}

impl AmqpConsumer {
    pub fn new(
        settings: QueueSettings,
        service: NotificationService,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            settings,
            service,
            observer,
            state: ConsumerState::Disconnected,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn service(&self) -> &NotificationService {
        &self.service
    }

    /// Consume until `shutdown` is cancelled, reconnecting on failure.
    pub async fn consume_until_shutdown(
        mut self,
        shutdown: CancellationToken,
    ) -> NotificationService {
        let delay = self.settings.reconnect_delay;
        let observer = self.observer.clone();
        run_until_shutdown(&mut self, &shutdown, delay, observer.as_ref()).await;
        self.service
    }

    fn enter(&mut self, next: ConsumerState) {
        if self.state == next {
            return;
        }
        self.observer.observe(&Observation::ConsumerState {
            from: self.state,
            to: next,
        });
        self.state = next;
    }

    async fn open(&self) -> Result<(Connection, Channel)> {
        let s = &self.settings;
        let connection = Connection::connect(&s.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;
        let channel = connection
            .create_channel()
            .await
            .context("Failed to open AMQP channel")?;

        channel
            .exchange_declare(
                &s.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare exchange {}", s.exchange))?;
        channel
            .queue_declare(
                &s.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare queue {}", s.queue))?;
        channel
            .queue_bind(
                &s.queue,
                &s.exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to bind {} to {}", s.queue, s.exchange))?;

        Ok((connection, channel))
    }

    async fn consume(&mut self, channel: &Channel, shutdown: &CancellationToken) -> Result<()> {
        let mut deliveries = channel
            .basic_consume(
                &self.settings.queue,
                &self.settings.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("Failed to start consuming")?;
        self.enter(ConsumerState::Consuming);

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                next = deliveries.next() => next,
            };
            match next {
                Some(Ok(delivery)) => self.settle(delivery).await?,
                Some(Err(e)) => return Err(e).context("Delivery stream failed"),
                None => anyhow::bail!("Delivery stream closed by broker"),
            }
        }
    }

    async fn settle(&mut self, delivery: Delivery) -> Result<()> {
        match self.service.handle_message(&delivery.data).await {
            Ok(handled) => {
                debug!(tag = delivery.delivery_tag, ?handled, "Acknowledging message");
                delivery
                    .acker
                    .ack(BasicAckOptions::default())
                    .await
                    .context("Failed to ack message")?;
            }
            Err(e) => {
                let requeue =
                    requeue_on_failure(self.settings.requeue_redelivered, delivery.redelivered);
                warn!(
                    tag = delivery.delivery_tag,
                    redelivered = delivery.redelivered,
                    requeue,
                    "Rejecting message: {e}"
                );
                delivery
                    .acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue,
                    })
                    .await
                    .context("Failed to nack message")?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueueSession for AmqpConsumer {
    async fn run(&mut self, shutdown: &CancellationToken) -> Result<()> {
        self.enter(ConsumerState::Connecting);
        let (connection, channel) = match self.open().await {
            Ok(opened) => opened,
            Err(e) => {
                self.enter(ConsumerState::Disconnected);
                return Err(e);
            }
        };

        let outcome = self.consume(&channel, shutdown).await;

        if let Err(e) = channel.close(200, "closing").await {
            debug!("Channel close failed: {e}");
        }
        if let Err(e) = connection.close(200, "closing").await {
            debug!("Connection close failed: {e}");
        }
        self.enter(ConsumerState::Disconnected);
        outcome
    }
}
