// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Layer
//!
//! The `MessagingError` enum covers every failure class the layer can surface:
//! connection and channel lifecycle, topology declaration, publishing,
//! consuming, message validation and circuit breaker rejection. Handlers use
//! the separate `HandlerError` vocabulary to tell the consumer whether a
//! failure is permanent (dead-letter) or transient (requeue).

use thiserror::Error;

/// Errors surfaced by connection, topology, publisher and consumer operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MessagingError {
    /// Broker unreachable or the connection was lost
    #[error("failure to connect: {0}")]
    Connection(String),

    /// The broker closed the connection
    #[error("connection closed by broker [{reply_code}] {reply_text}")]
    ConnectionClosed { reply_code: u16, reply_text: String },

    /// The broker closed the channel
    #[error("channel closed by broker [{reply_code}] {reply_text}")]
    ChannelClosed { reply_code: u16, reply_text: String },

    /// Publish failed after exhausting retries, or the circuit stayed open
    #[error("failure to publish to `{routing_key}` after {attempts} attempts: {cause}")]
    Publish {
        routing_key: String,
        attempts: u32,
        cause: String,
    },

    /// Message could not be serialized to the wire format
    #[error("failure to serialize message: {0}")]
    Serialization(String),

    /// Message payload failed schema validation
    #[error("message validation failed: {0}")]
    Validation(String),

    /// Exchange or queue declaration/binding failed
    #[error("failure to declare or bind `{0}`: {1}")]
    Topology(String, String),

    /// Consumer could not be registered on a queue
    #[error("failure to consume from `{0}`: {1}")]
    Consume(String, String),

    /// Circuit breaker rejected the call without invoking it
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Explicitly permanent failure, never retried
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Explicitly transient failure, eligible for retry
    #[error("transient error: {0}")]
    Transient(String),

    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    Internal(String),
}

impl MessagingError {
    /// Whether retrying this error can never succeed.
    ///
    /// Permanent markers, already-exhausted publish failures and connection
    /// failures are final; everything else is treated as transient.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            MessagingError::Permanent(_)
                | MessagingError::Publish { .. }
                | MessagingError::Connection(_)
                | MessagingError::ConnectionClosed { .. }
                | MessagingError::Validation(_)
                | MessagingError::Serialization(_)
                | MessagingError::Config(_)
        )
    }

    /// Short stable name used as the error-kind dimension in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            MessagingError::Connection(_) => "connection_error",
            MessagingError::ConnectionClosed { .. } => "connection_closed",
            MessagingError::ChannelClosed { .. } => "channel_closed",
            MessagingError::Publish { .. } => "publish_error",
            MessagingError::Serialization(_) => "serialization_error",
            MessagingError::Validation(_) => "validation_error",
            MessagingError::Topology(_, _) => "topology_error",
            MessagingError::Consume(_, _) => "consume_error",
            MessagingError::CircuitOpen => "circuit_open",
            MessagingError::Config(_) => "config_error",
            MessagingError::Permanent(_) => "permanent_error",
            MessagingError::Transient(_) => "transient_error",
            MessagingError::Internal(_) => "internal_error",
        }
    }
}

/// Failure vocabulary for consumer handlers.
///
/// A handler signals the delivery outcome by returning one of these variants;
/// the consumer converts it into an ack/nack decision and never propagates it
/// further.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandlerError {
    /// Redelivery cannot fix this message; route it to the DLQ
    #[error("permanent handler error: {0}")]
    Permanent(String),

    /// Likely to succeed on redelivery; nack with requeue
    #[error("transient handler error: {0}")]
    Transient(String),

    /// A broker operation inside the handler failed
    #[error(transparent)]
    Messaging(#[from] MessagingError),
}
