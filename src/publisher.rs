// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Serializes validated messages to the wire format and sends them through
//! the topic exchange. The broker call is wrapped first by the circuit
//! breaker, then by the retry loop; the inter-attempt backoff sleep is an
//! explicit suspension point, so publishing is cancellable between attempts.

use crate::breaker::CircuitBreaker;
use crate::config::MessagingConfig;
use crate::connection::{classify_lapin_error, AmqpConnection};
use crate::errors::MessagingError;
use crate::messages::QueueMessage;
use crate::metrics::MessagingMetrics;
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::topology::EXCHANGE_NAME;
use lapin::options::BasicPublishOptions;
use lapin::types::ShortString;
use lapin::BasicProperties;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Content type for the canonical JSON wire format
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Delivery mode marking messages persistent across broker restarts
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Publisher with retry, circuit breaker and metrics.
pub struct MessagePublisher {
    connection: Arc<AmqpConnection>,
    metrics: Arc<MessagingMetrics>,
    retry_strategy: Box<dyn RetryStrategy>,
    circuit_breaker: Option<CircuitBreaker>,
}

impl MessagePublisher {
    /// Creates a publisher with exponential backoff and a circuit breaker
    /// sized from configuration.
    pub fn new(connection: Arc<AmqpConnection>, metrics: Arc<MessagingMetrics>) -> MessagePublisher {
        let cfg = connection.config().clone();
        let retry = ExponentialBackoff {
            max_attempts: cfg.publish_retry_max_attempts,
            base_delay: cfg.publish_retry_base_delay,
            max_delay: cfg.publish_retry_max_delay,
            ..ExponentialBackoff::default()
        };
        let breaker = CircuitBreaker::new(
            cfg.circuit_breaker_failure_threshold,
            cfg.circuit_breaker_timeout,
        );

        MessagePublisher {
            connection,
            metrics,
            retry_strategy: Box::new(retry),
            circuit_breaker: Some(breaker),
        }
    }

    pub fn with_retry_strategy(mut self, strategy: Box<dyn RetryStrategy>) -> Self {
        self.retry_strategy = strategy;
        self
    }

    /// Disables circuit breaker protection; retries still apply.
    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker = None;
        self
    }

    /// Publishes a message with default routing options.
    pub async fn publish<M: QueueMessage>(
        &self,
        message: &M,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        self.publish_with_options(message, routing_key, false, false)
            .await
    }

    /// Publishes a message, optionally failing when no queue is bound
    /// (`mandatory`) or no consumer is ready (`immediate`).
    pub async fn publish_with_options<M: QueueMessage>(
        &self,
        message: &M,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
    ) -> Result<(), MessagingError> {
        if !self.connection.is_connected() {
            return Err(MessagingError::Connection(
                "not connected to the broker, call connect() first".to_owned(),
            ));
        }

        // Serialization failure is permanent, never retried.
        let payload = serde_json::to_vec(message).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize message");
            MessagingError::Serialization(err.to_string())
        })?;

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_correlation_id(ShortString::from(message.correlation_id()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()));

        self.publish_with_retry(&payload, routing_key, mandatory, immediate, properties)
            .await
    }

    async fn publish_with_retry(
        &self,
        payload: &[u8],
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        properties: BasicProperties,
    ) -> Result<(), MessagingError> {
        let mut attempt: u32 = 0;

        loop {
            let result = match &self.circuit_breaker {
                Some(breaker) => {
                    breaker
                        .call(|| {
                            self.do_publish(
                                payload,
                                routing_key,
                                mandatory,
                                immediate,
                                properties.clone(),
                            )
                        })
                        .await
                }
                None => {
                    self.do_publish(payload, routing_key, mandatory, immediate, properties.clone())
                        .await
                }
            };

            match result {
                Ok(()) => {
                    self.metrics.record_published(routing_key);
                    info!(routing_key, attempt = attempt + 1, "message published");
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;

                    // An open circuit rejects in microseconds; surface it
                    // immediately instead of sleeping through the backoff.
                    if matches!(err, MessagingError::CircuitOpen) {
                        self.metrics.record_error(routing_key, err.kind());
                        warn!(routing_key, "circuit breaker is open, failing fast");
                        return Err(err);
                    }

                    if !self.retry_strategy.should_retry(attempt, &err) {
                        self.metrics.record_error(routing_key, err.kind());
                        error!(
                            routing_key,
                            attempts = attempt,
                            error = err.to_string(),
                            "failure to publish, retries exhausted"
                        );
                        return Err(MessagingError::Publish {
                            routing_key: routing_key.to_owned(),
                            attempts: attempt,
                            cause: err.to_string(),
                        });
                    }

                    let backoff = self.retry_strategy.backoff(attempt);
                    warn!(
                        routing_key,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = err.to_string(),
                        "publish attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn do_publish(
        &self,
        payload: &[u8],
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        properties: BasicProperties,
    ) -> Result<(), MessagingError> {
        let channel = self.connection.channel().await?;

        let confirm = channel
            .basic_publish(
                EXCHANGE_NAME,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| classify_lapin_error(&err))?;

        // Resolves immediately as NotRequested unless confirm mode is on.
        let confirmation = confirm.await.map_err(|err| classify_lapin_error(&err))?;
        if confirmation.is_nack() {
            return Err(MessagingError::Internal(
                "broker negatively confirmed the publish".to_owned(),
            ));
        }

        Ok(())
    }

    /// Connected and the circuit is not open.
    pub fn health_check(&self) -> bool {
        if let Some(breaker) = &self.circuit_breaker {
            if breaker.is_open() {
                warn!("circuit breaker is open, publisher unhealthy");
                return false;
            }
        }
        self.connection.is_connected()
    }

    /// Manually closes the circuit after the broker is known to have
    /// recovered.
    pub fn reset_circuit_breaker(&self) {
        if let Some(breaker) = &self.circuit_breaker {
            breaker.reset();
            info!("publisher circuit breaker reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{SourceMessage, SourceType};
    use crate::metrics::MessagingMetrics;

    fn disconnected_publisher() -> MessagePublisher {
        let connection = AmqpConnection::new(MessagingConfig::default());
        MessagePublisher::new(connection, MessagingMetrics::new())
    }

    fn message() -> SourceMessage {
        SourceMessage::new(SourceType::Arxiv, "https://arxiv.org/abs/1", "title", "body").unwrap()
    }

    #[tokio::test]
    async fn publish_fails_fast_when_disconnected() {
        let publisher = disconnected_publisher();
        let result = publisher.publish(&message(), "content.discovered").await;
        assert!(matches!(result, Err(MessagingError::Connection(_))));
    }

    #[tokio::test]
    async fn disconnected_publish_records_no_metrics() {
        let connection = AmqpConnection::new(MessagingConfig::default());
        let metrics = MessagingMetrics::new();
        let publisher = MessagePublisher::new(connection, metrics.clone());

        let _ = publisher.publish(&message(), "content.discovered").await;
        assert_eq!(metrics.counter("messages.published.content.discovered"), 0);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_backoff() {
        let connection = AmqpConnection::new(MessagingConfig {
            circuit_breaker_failure_threshold: 1,
            ..MessagingConfig::default()
        });
        let metrics = MessagingMetrics::new();
        let publisher = MessagePublisher::new(connection, metrics.clone());
        let properties = BasicProperties::default();

        // First attempt trips the breaker through the failing channel accessor.
        let _ = publisher
            .publish_with_retry(b"{}", "content.discovered", false, false, properties.clone())
            .await;

        let started = std::time::Instant::now();
        let result = publisher
            .publish_with_retry(b"{}", "content.discovered", false, false, properties)
            .await;

        assert_eq!(result, Err(MessagingError::CircuitOpen));
        assert!(started.elapsed() < std::time::Duration::from_millis(200));
        assert_eq!(metrics.counter("total_errors.content.discovered"), 2);
    }

    #[tokio::test]
    async fn health_check_reflects_connection() {
        let publisher = disconnected_publisher();
        assert!(!publisher.health_check());
    }
}
