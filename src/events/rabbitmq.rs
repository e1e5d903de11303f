//! RabbitMQ publisher over AMQP 0-9-1
//!
//! One connection and channel are kept open and reopened on the next call
//! after the broker drops them. Each (re)connect declares the durable event
//! queue with its message TTL.

use crate::config::RabbitMqConfig;
use crate::events::error::{PublishError, PublishResult};
use crate::events::types::UploadEvent;
use crate::events::EventPublisher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::time::Duration;
use tokio::sync::Mutex;

/// AMQP persistent delivery mode
const PERSISTENT: u8 = 2;

const CONTENT_TYPE: &str = "application/json";

struct Link {
    _connection: Connection,
    channel: Channel,
}

pub struct RabbitMqPublisher {
    config: RabbitMqConfig,
    timeout: Duration,
    link: Mutex<Option<Link>>,
}

fn queue_arguments(ttl_ms: u64) -> FieldTable {
    let mut args = FieldTable::default();
    let ttl = i32::try_from(ttl_ms).unwrap_or(i32::MAX);
    args.insert("x-message-ttl".into(), AMQPValue::LongInt(ttl));
    args
}

fn message_properties(now: DateTime<Utc>) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(CONTENT_TYPE.into())
        .with_delivery_mode(PERSISTENT)
        .with_timestamp(now.timestamp().max(0) as u64)
}

impl RabbitMqPublisher {
    /// Does not touch the network; the first publish or [`connect`](Self::connect) does
    pub fn new(config: RabbitMqConfig, timeout: Duration) -> PublishResult<Self> {
        if config.host.is_empty() {
            return Err(PublishError::NotConfigured);
        }
        Ok(Self {
            config,
            timeout,
            link: Mutex::new(None),
        })
    }

    /// Open the connection and declare the queue now
    pub async fn connect(&self) -> PublishResult<()> {
        self.channel().await.map(|_| ())
    }

    async fn channel(&self) -> PublishResult<Channel> {
        let mut link = self.link.lock().await;
        if let Some(current) = link.as_ref() {
            if current.channel.status().connected() {
                return Ok(current.channel.clone());
            }
            tracing::warn!(broker = %self.config.display_url(), "Broker channel closed, reconnecting");
        }
        *link = None;

        let fresh = tokio::time::timeout(self.timeout, self.open_link())
            .await
            .map_err(|_| PublishError::Timeout(self.timeout))??;
        let channel = fresh.channel.clone();
        *link = Some(fresh);
        Ok(channel)
    }

    async fn open_link(&self) -> PublishResult<Link> {
        let connection =
            Connection::connect(&self.config.amqp_url(), ConnectionProperties::default())
                .await
                .map_err(|e| PublishError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))?;

        if !self.config.queue.is_empty() {
            channel
                .queue_declare(
                    &self.config.queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    queue_arguments(self.config.ttl_ms),
                )
                .await
                .map_err(|e| PublishError::Connection(format!("queue declare: {e}")))?;
        }

        tracing::info!(
            broker = %self.config.display_url(),
            queue = %self.config.queue,
            ttl_ms = self.config.ttl_ms,
            "Connected to RabbitMQ"
        );
        Ok(Link {
            _connection: connection,
            channel,
        })
    }

    async fn send(&self, payload: &[u8]) -> PublishResult<()> {
        let channel = self.channel().await?;
        let confirm = channel
            .basic_publish(
                &self.config.exchange,
                &self.config.queue,
                BasicPublishOptions::default(),
                payload,
                message_properties(Utc::now()),
            )
            .await
            .map_err(|e| PublishError::Publish(e.to_string()))?;
        confirm
            .await
            .map_err(|e| PublishError::Publish(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for RabbitMqPublisher {
    async fn publish(&self, event: &UploadEvent) -> PublishResult<()> {
        let payload = serde_json::to_vec(event)?;
        tokio::time::timeout(self.timeout, self.send(&payload))
            .await
            .map_err(|_| PublishError::Timeout(self.timeout))??;

        tracing::info!(
            exchange = %self.config.exchange,
            queue = %self.config.queue,
            filename = %event.filename,
            "Event published to RabbitMQ"
        );
        Ok(())
    }

    async fn health_check(&self) -> PublishResult<()> {
        self.connect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    fn config() -> RabbitMqConfig {
        RabbitMqConfig {
            host: "127.0.0.1".into(),
            port: 5672,
            user: "guest".into(),
            password: "guest".into(),
            vhost: "/".into(),
            queue: "dvr_upload_events".into(),
            exchange: "iothub-webhook".into(),
            ttl_ms: 300_000,
        }
    }

    #[test]
    fn test_missing_host_not_configured() {
        let mut cfg = config();
        cfg.host.clear();
        assert!(matches!(
            RabbitMqPublisher::new(cfg, Duration::from_secs(1)),
            Err(PublishError::NotConfigured)
        ));
    }

    #[test]
    fn test_queue_arguments_carry_ttl() {
        let args = queue_arguments(300_000);
        assert_eq!(
            args.inner().get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongInt(300_000))
        );

        let clamped = queue_arguments(u64::MAX);
        assert_eq!(
            clamped.inner().get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongInt(i32::MAX))
        );
    }

    #[test]
    fn test_message_properties_persistent_json() {
        let now = Utc::now();
        let props = message_properties(now);
        assert_eq!(props.delivery_mode(), &Some(PERSISTENT));
        assert_eq!(
            props.content_type().as_ref().map(|c| c.as_str()),
            Some(CONTENT_TYPE)
        );
        assert_eq!(props.timestamp(), &Some(now.timestamp() as u64));
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_publish() {
        // Grab a free port and release it so nothing listens there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut cfg = config();
        cfg.port = port;
        let publisher = RabbitMqPublisher::new(cfg, Duration::from_secs(2)).unwrap();

        let event = UploadEvent {
            filename: "a.mp4".into(),
            size: 42,
            path: String::new(),
        };
        assert!(matches!(
            publisher.publish(&event).await,
            Err(PublishError::Connection(_) | PublishError::Timeout(_))
        ));
        assert!(publisher.health_check().await.is_err());
    }
}
