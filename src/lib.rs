// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

pub mod breaker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod health;
pub mod messages;
pub mod metrics;
pub mod publisher;
pub mod retry;
pub mod topology;

pub use breaker::{CircuitBreaker, CircuitState};
pub use config::MessagingConfig;
pub use connection::{AmqpConnection, QueueInfo};
pub use consumer::{MessageConsumer, MessageHandler, Outcome};
pub use errors::{HandlerError, MessagingError};
pub use health::{HealthChecker, HealthState, HealthStatus};
pub use messages::{
    DeduplicatedContentMessage, DigestItem, DigestReadyMessage, Envelope, ExtractedInsightsMessage,
    FeedbackMessage, QueueMessage, QueueName, SourceMessage, SourceType, TrainingTriggerMessage,
};
pub use metrics::{MessagingMetrics, MetricsSummary, TimerStats};
pub use publisher::MessagePublisher;
pub use retry::{ExponentialBackoff, LinearBackoff, NoRetry, RetryStrategy};
pub use topology::{QueueSetup, QueueSpec};
