// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pipeline Topology
//!
//! Idempotent declaration of the broker topology, safe to run on every
//! startup: one topic exchange with an alternate-exchange fallback, one
//! direct dead-letter exchange, a catch-all DLQ for unroutable messages, and
//! per-queue main/DLQ pairs with bounded length and TTL.
//!
//! A message in the catch-all DLQ indicates a routing misconfiguration, not
//! a processing failure.

use crate::connection::AmqpConnection;
use crate::errors::MessagingError;
use crate::messages::QueueName;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::ExchangeKind;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Topic exchange every producer publishes to
pub const EXCHANGE_NAME: &str = "researcher";
/// Alternate exchange catching messages no binding matches
pub const ALTERNATE_EXCHANGE_NAME: &str = "researcher.ae";
/// Direct exchange dead-lettered messages are routed through
pub const DLQ_EXCHANGE_NAME: &str = "researcher.dlq";
/// Catch-all queue for unroutable messages
pub const UNROUTABLE_QUEUE_NAME: &str = "researcher.ae.dlq";

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify overflow behaviour
pub const AMQP_HEADERS_OVERFLOW: &str = "x-overflow";
/// Constant for the exchange argument naming the alternate exchange
pub const AMQP_HEADERS_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

/// Bounds for one main queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    pub max_length: u32,
    pub ttl: Option<Duration>,
}

/// Declares and inspects the pipeline topology.
pub struct QueueSetup {
    connection: Arc<AmqpConnection>,
}

impl QueueSetup {
    pub fn new(connection: Arc<AmqpConnection>) -> QueueSetup {
        QueueSetup { connection }
    }

    /// Bounds for `queue`, derived from configuration.
    ///
    /// The feedback queue never expires messages; triggers and digests are
    /// tightly bounded because they are rare and final-stage respectively.
    pub fn queue_spec(&self, queue: QueueName) -> QueueSpec {
        let cfg = self.connection.config();
        match queue {
            QueueName::ContentDiscovered | QueueName::ContentDeduplicated => QueueSpec {
                max_length: cfg.queue_max_length,
                ttl: cfg.queue_message_ttl,
            },
            QueueName::InsightsExtracted => QueueSpec {
                max_length: 5000,
                ttl: cfg.queue_message_ttl,
            },
            QueueName::DigestReady => QueueSpec {
                max_length: 100,
                ttl: cfg.queue_message_ttl,
            },
            QueueName::FeedbackSubmitted => QueueSpec {
                max_length: cfg.queue_max_length,
                ttl: None,
            },
            QueueName::TrainingTrigger => QueueSpec {
                max_length: 10,
                ttl: cfg.queue_message_ttl,
            },
        }
    }

    /// Declares every exchange, queue and binding. Safe to call on every
    /// startup.
    pub async fn setup_all(&self) -> Result<(), MessagingError> {
        self.declare_exchanges().await?;
        self.declare_unroutable_queue().await?;

        for queue in QueueName::ALL {
            self.declare_queue_pair(queue).await?;
        }

        info!("all exchanges, queues and bindings declared");
        Ok(())
    }

    async fn declare_exchanges(&self) -> Result<(), MessagingError> {
        let channel = self.connection.channel().await?;
        let durable = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };

        debug!(exchange = ALTERNATE_EXCHANGE_NAME, "creating alternate exchange");
        channel
            .exchange_declare(
                ALTERNATE_EXCHANGE_NAME,
                ExchangeKind::Fanout,
                durable,
                FieldTable::default(),
            )
            .await
            .map_err(|err| declare_error(ALTERNATE_EXCHANGE_NAME, &err))?;

        let mut params = BTreeMap::new();
        params.insert(
            ShortString::from(AMQP_HEADERS_ALTERNATE_EXCHANGE),
            AMQPValue::LongString(LongString::from(ALTERNATE_EXCHANGE_NAME)),
        );

        debug!(exchange = EXCHANGE_NAME, "creating topic exchange");
        channel
            .exchange_declare(
                EXCHANGE_NAME,
                ExchangeKind::Topic,
                durable,
                FieldTable::from(params),
            )
            .await
            .map_err(|err| declare_error(EXCHANGE_NAME, &err))?;

        debug!(exchange = DLQ_EXCHANGE_NAME, "creating dead-letter exchange");
        channel
            .exchange_declare(
                DLQ_EXCHANGE_NAME,
                ExchangeKind::Direct,
                durable,
                FieldTable::default(),
            )
            .await
            .map_err(|err| declare_error(DLQ_EXCHANGE_NAME, &err))?;

        Ok(())
    }

    /// Catch-all DLQ bound to the alternate exchange. Unbounded, no TTL.
    async fn declare_unroutable_queue(&self) -> Result<(), MessagingError> {
        let channel = self.connection.channel().await?;
        let durable = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };

        channel
            .queue_declare(UNROUTABLE_QUEUE_NAME, durable, FieldTable::default())
            .await
            .map_err(|err| declare_error(UNROUTABLE_QUEUE_NAME, &err))?;

        channel
            .queue_bind(
                UNROUTABLE_QUEUE_NAME,
                ALTERNATE_EXCHANGE_NAME,
                "",
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| bind_error(UNROUTABLE_QUEUE_NAME, ALTERNATE_EXCHANGE_NAME, &err))?;

        debug!(queue = UNROUTABLE_QUEUE_NAME, "catch-all DLQ declared and bound");
        Ok(())
    }

    /// Declares one main queue, its DLQ, and both bindings.
    async fn declare_queue_pair(&self, queue: QueueName) -> Result<(), MessagingError> {
        let channel = self.connection.channel().await?;
        let durable = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };

        // DLQs are unbounded with no TTL, retained for manual inspection.
        debug!(queue = queue.dlq_name(), "creating dead-letter queue");
        channel
            .queue_declare(queue.dlq_name(), durable, FieldTable::default())
            .await
            .map_err(|err| declare_error(queue.dlq_name(), &err))?;

        channel
            .queue_bind(
                queue.dlq_name(),
                DLQ_EXCHANGE_NAME,
                queue.dlq_name(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| bind_error(queue.dlq_name(), DLQ_EXCHANGE_NAME, &err))?;

        let spec = self.queue_spec(queue);
        debug!(queue = queue.as_str(), ?spec, "creating main queue");
        channel
            .queue_declare(
                queue.as_str(),
                durable,
                FieldTable::from(main_queue_arguments(queue, spec)),
            )
            .await
            .map_err(|err| declare_error(queue.as_str(), &err))?;

        debug!(
            queue = queue.as_str(),
            exchange = EXCHANGE_NAME,
            routing_key = queue.as_str(),
            "binding queue to topic exchange"
        );
        channel
            .queue_bind(
                queue.as_str(),
                EXCHANGE_NAME,
                queue.as_str(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| bind_error(queue.as_str(), EXCHANGE_NAME, &err))?;

        Ok(())
    }

    /// Current message count per queue (mains, DLQs and the catch-all).
    /// `None` marks a queue whose depth could not be read.
    pub async fn get_queue_depths(&self) -> HashMap<String, Option<u32>> {
        let mut depths = HashMap::new();

        for name in all_queue_names() {
            let depth = match self.connection.get_queue_info(&name).await {
                Ok(Some(info)) => Some(info.message_count),
                Ok(None) => None,
                Err(err) => {
                    warn!(queue = %name, error = err.to_string(), "failed to get queue depth");
                    None
                }
            };
            depths.insert(name, depth);
        }

        depths
    }

    /// Whether each queue exists on the broker.
    pub async fn check_queues_exist(&self) -> HashMap<String, bool> {
        let mut existence = HashMap::new();

        for name in all_queue_names() {
            let exists = match self.connection.get_queue_info(&name).await {
                Ok(info) => info.is_some(),
                Err(err) => {
                    warn!(queue = %name, error = err.to_string(), "error checking queue");
                    false
                }
            };
            existence.insert(name, exists);
        }

        existence
    }
}

/// Arguments for a main queue: dead-letter routing to its own DLQ, bounded
/// length with drop-oldest overflow, and optional message TTL.
fn main_queue_arguments(queue: QueueName, spec: QueueSpec) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();

    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from(DLQ_EXCHANGE_NAME)),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(queue.dlq_name())),
    );
    // AMQP long ints are signed 32-bit; clamp rather than wrap negative.
    args.insert(
        ShortString::from(AMQP_HEADERS_MAX_LENGTH),
        AMQPValue::LongInt(i32::try_from(spec.max_length).unwrap_or(i32::MAX)),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_OVERFLOW),
        AMQPValue::LongString(LongString::from("drop-head")),
    );

    if let Some(ttl) = spec.ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX)),
        );
    }

    args
}

fn all_queue_names() -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(QueueName::ALL.len() * 2 + 1);
    for queue in QueueName::ALL {
        names.push(queue.as_str().to_owned());
        names.push(queue.dlq_name().to_owned());
    }
    names.push(UNROUTABLE_QUEUE_NAME.to_owned());
    names
}

fn declare_error(name: &str, err: &lapin::Error) -> MessagingError {
    error!(error = err.to_string(), name, "error declaring topology element");
    MessagingError::Topology(name.to_owned(), err.to_string())
}

fn bind_error(queue: &str, exchange: &str, err: &lapin::Error) -> MessagingError {
    error!(error = err.to_string(), queue, exchange, "error binding queue to exchange");
    MessagingError::Topology(queue.to_owned(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessagingConfig;

    fn setup() -> QueueSetup {
        QueueSetup::new(AmqpConnection::new(MessagingConfig::default()))
    }

    #[test]
    fn queue_bounds_match_pipeline_design() {
        let setup = setup();

        assert_eq!(
            setup.queue_spec(QueueName::ContentDiscovered).max_length,
            10_000
        );
        assert_eq!(
            setup.queue_spec(QueueName::InsightsExtracted).max_length,
            5000
        );
        assert_eq!(setup.queue_spec(QueueName::DigestReady).max_length, 100);
        assert_eq!(setup.queue_spec(QueueName::TrainingTrigger).max_length, 10);
    }

    #[test]
    fn feedback_queue_never_expires() {
        let setup = setup();
        assert_eq!(setup.queue_spec(QueueName::FeedbackSubmitted).ttl, None);

        for queue in QueueName::ALL {
            if queue != QueueName::FeedbackSubmitted {
                assert_eq!(
                    setup.queue_spec(queue).ttl,
                    Some(Duration::from_secs(24 * 60 * 60)),
                    "{queue} should carry the default TTL"
                );
            }
        }
    }

    #[test]
    fn main_queue_arguments_route_to_own_dlq() {
        let spec = QueueSpec {
            max_length: 100,
            ttl: Some(Duration::from_secs(60)),
        };
        let args = main_queue_arguments(QueueName::DigestReady, spec);

        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString(LongString::from(DLQ_EXCHANGE_NAME)))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)),
            Some(&AMQPValue::LongString(LongString::from("digest.ready.dlq")))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_OVERFLOW)),
            Some(&AMQPValue::LongString(LongString::from("drop-head")))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MAX_LENGTH)),
            Some(&AMQPValue::LongInt(100))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongInt(60_000))
        );
    }

    #[test]
    fn oversized_bounds_clamp_instead_of_wrapping_negative() {
        let spec = QueueSpec {
            max_length: u32::MAX,
            ttl: Some(Duration::from_secs(60 * 24 * 60 * 60)),
        };
        let args = main_queue_arguments(QueueName::ContentDiscovered, spec);

        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MAX_LENGTH)),
            Some(&AMQPValue::LongInt(i32::MAX))
        );
        assert_eq!(
            args.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongInt(i32::MAX))
        );
    }

    #[test]
    fn queues_without_ttl_omit_the_argument() {
        let spec = QueueSpec {
            max_length: 10_000,
            ttl: None,
        };
        let args = main_queue_arguments(QueueName::FeedbackSubmitted, spec);
        assert!(!args.contains_key(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)));
    }

    #[test]
    fn all_queue_names_cover_mains_dlqs_and_catch_all() {
        let names = all_queue_names();
        assert_eq!(names.len(), 13);
        assert!(names.contains(&"content.discovered".to_owned()));
        assert!(names.contains(&"content.discovered.dlq".to_owned()));
        assert!(names.contains(&UNROUTABLE_QUEUE_NAME.to_owned()));
    }
}
