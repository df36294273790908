// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! One long-lived connection and channel per process. `connect` is
//! idempotent, the channel accessor fails fast when the connection or
//! channel is gone, and an error callback flags unexpected closure so no
//! caller ever operates silently on a dead channel.

use crate::config::MessagingConfig;
use crate::errors::MessagingError;
use lapin::options::{ConfirmSelectOptions, QueueDeclareOptions, QueuePurgeOptions};
use lapin::types::{FieldTable, LongString};
use lapin::{Channel, Connection, ConnectionProperties};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Message and consumer counts for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    pub message_count: u32,
    pub consumer_count: u32,
}

struct ConnectedState {
    connection: Connection,
    channel: Channel,
}

/// Long-lived RabbitMQ connection shared by the publisher and consumer of a
/// process. Construct once, share via `Arc`.
pub struct AmqpConnection {
    config: MessagingConfig,
    state: Mutex<Option<ConnectedState>>,
    connected: Arc<AtomicBool>,
}

impl AmqpConnection {
    pub fn new(config: MessagingConfig) -> Arc<AmqpConnection> {
        Arc::new(AmqpConnection {
            config,
            state: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Establishes the connection and channel. Calling this while already
    /// connected is a no-op.
    pub async fn connect(&self) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;

        if let Some(connected) = state.as_ref() {
            if self.connected.load(Ordering::SeqCst) && connected.connection.status().connected() {
                debug!("already connected to the broker");
                return Ok(());
            }
        }

        let uri = self.config.connection_url();
        debug!(
            host = %self.config.host,
            port = self.config.port,
            "creating amqp connection..."
        );

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from("researcher-messaging"));

        let connection = match Connection::connect(&uri, options).await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                self.connected.store(false, Ordering::SeqCst);
                return Err(MessagingError::Connection(format!(
                    "failed to connect to {}:{}",
                    self.config.host, self.config.port
                )));
            }
        };

        // Flag unexpected closure so the channel accessor fails fast.
        let connected = self.connected.clone();
        connection.on_error(move |err| {
            warn!(error = err.to_string(), "broker connection closed unexpectedly");
            connected.store(false, Ordering::SeqCst);
        });

        debug!("creating amqp channel...");
        let channel = match connection.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "failure to create a channel");
                self.connected.store(false, Ordering::SeqCst);
                return Err(MessagingError::Connection("failed to create channel".to_owned()));
            }
        };

        *state = Some(ConnectedState {
            connection,
            channel,
        });
        self.connected.store(true, Ordering::SeqCst);
        info!(host = %self.config.host, port = self.config.port, "connected to the broker");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The shared channel. Fails fast when not connected or the channel has
    /// been closed by the broker.
    pub async fn channel(&self) -> Result<Channel, MessagingError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MessagingError::Connection(
                "not connected to the broker, call connect() first".to_owned(),
            ));
        }

        let state = self.state.lock().await;
        let connected = state.as_ref().ok_or_else(|| {
            MessagingError::Connection("not connected to the broker, call connect() first".to_owned())
        })?;

        if !connected.channel.status().connected() {
            return Err(MessagingError::Connection("channel is closed".to_owned()));
        }

        Ok(connected.channel.clone())
    }

    /// Switches the shared channel into publisher-confirm mode.
    pub async fn enable_publisher_confirms(&self) -> Result<(), MessagingError> {
        let channel = self.channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                classify_lapin_error(&err)
            })?;
        debug!("publisher confirms enabled");
        Ok(())
    }

    /// Runs `scope` inside a broker-side transaction: committed on success,
    /// rolled back on any error, released on every exit path.
    pub async fn with_transaction<F, Fut, T>(&self, scope: F) -> Result<T, MessagingError>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = Result<T, MessagingError>>,
    {
        let channel = self.channel().await?;

        channel.tx_select().await.map_err(|err| {
            error!(error = err.to_string(), "failure to begin transaction");
            classify_lapin_error(&err)
        })?;

        match scope(channel.clone()).await {
            Ok(value) => {
                channel.tx_commit().await.map_err(|err| {
                    error!(error = err.to_string(), "failure to commit transaction");
                    classify_lapin_error(&err)
                })?;
                debug!("transaction committed");
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = channel.tx_rollback().await {
                    error!(
                        error = rollback_err.to_string(),
                        "failure to roll back transaction"
                    );
                } else {
                    debug!("transaction rolled back");
                }
                Err(err)
            }
        }
    }

    /// Message/consumer counts for a queue, or `None` if it does not exist.
    ///
    /// A passive declare of a missing queue closes the channel with AMQP 404,
    /// so the channel is reopened before returning.
    pub async fn get_queue_info(
        &self,
        queue_name: &str,
    ) -> Result<Option<QueueInfo>, MessagingError> {
        let channel = self.channel().await?;

        match channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(queue) => Ok(Some(QueueInfo {
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            })),
            Err(err) => match classify_lapin_error(&err) {
                MessagingError::ChannelClosed {
                    reply_code: 404, ..
                } => {
                    debug!(queue = queue_name, "queue does not exist");
                    self.reopen_channel().await?;
                    Ok(None)
                }
                other => {
                    error!(error = err.to_string(), queue = queue_name, "error getting queue info");
                    Err(other)
                }
            },
        }
    }

    /// Drops every message from a queue, returning the purged count.
    pub async fn purge_queue(&self, queue_name: &str) -> Result<u32, MessagingError> {
        let channel = self.channel().await?;

        let count = channel
            .queue_purge(queue_name, QueuePurgeOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = queue_name, "failure to purge queue");
                classify_lapin_error(&err)
            })?;

        info!(queue = queue_name, purged = count, "queue purged");
        Ok(count)
    }

    /// Tears the connection down gracefully.
    pub async fn disconnect(&self) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;

        let Some(connected) = state.take() else {
            debug!("not connected, nothing to close");
            return Ok(());
        };

        self.connected.store(false, Ordering::SeqCst);

        if let Err(err) = connected.channel.close(200, "bye").await {
            debug!(error = err.to_string(), "error closing channel");
        }
        if let Err(err) = connected.connection.close(200, "bye").await {
            debug!(error = err.to_string(), "error closing connection");
        }

        info!("broker connection closed");
        Ok(())
    }

    async fn reopen_channel(&self) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;
        let connected = state.as_mut().ok_or_else(|| {
            MessagingError::Connection("not connected to the broker".to_owned())
        })?;

        debug!("reopening channel after broker close");
        let channel = connected.connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "failure to reopen channel");
            MessagingError::Connection("failed to reopen channel".to_owned())
        })?;

        connected.channel = channel;
        Ok(())
    }
}

/// Maps a lapin error onto the crate's taxonomy, preserving the AMQP reply
/// code when the broker supplied one.
pub(crate) fn classify_lapin_error(err: &lapin::Error) -> MessagingError {
    match err {
        lapin::Error::ProtocolError(amqp) => MessagingError::ChannelClosed {
            reply_code: amqp.get_id(),
            reply_text: amqp.get_message().to_string(),
        },
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_) => MessagingError::Connection(err.to_string()),
        other => MessagingError::Internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_accessor_fails_fast_when_disconnected() {
        let connection = AmqpConnection::new(MessagingConfig::default());
        assert!(!connection.is_connected());

        let result = connection.channel().await;
        assert!(matches!(result, Err(MessagingError::Connection(_))));
    }

    #[tokio::test]
    async fn transaction_fails_fast_when_disconnected() {
        let connection = AmqpConnection::new(MessagingConfig::default());
        let result = connection
            .with_transaction(|_channel| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(MessagingError::Connection(_))));
    }

    #[tokio::test]
    async fn disconnect_without_connection_is_noop() {
        let connection = AmqpConnection::new(MessagingConfig::default());
        connection.disconnect().await.unwrap();
        assert!(!connection.is_connected());
    }
}
