// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! Consumes every subscribed queue with one async handler per queue. Each
//! delivery is deserialized against the queue's statically mapped schema,
//! validated, dispatched to the handler, and resolved into exactly one
//! [`Outcome`]: ack, nack-with-requeue, or nack-to-DLQ. Consumer-side
//! failures are never surfaced to the caller; operators observe them through
//! metrics, health status and DLQ contents.
//!
//! Backpressure is the channel QoS prefetch count: the number of
//! unacknowledged in-flight messages permitted per consumer.

use crate::connection::AmqpConnection;
use crate::errors::{HandlerError, MessagingError};
use crate::messages::{QueueMessage, QueueName};
use crate::metrics::MessagingMetrics;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Resolution of one delivery, produced once by the classifier and
/// dispatched through a single switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Positive acknowledge
    Ack,
    /// Negative acknowledge with requeue; redelivery may succeed
    NackRequeue,
    /// Negative acknowledge without requeue, routing to the DLQ, with the
    /// reason recorded in metrics
    NackDlq(String),
}

/// Async handler for one queue's messages.
///
/// The handler signals the outcome by returning normally (ack) or raising a
/// permanent or transient [`HandlerError`].
#[async_trait]
pub trait MessageHandler<M>: Send + Sync {
    async fn handle(&self, message: M) -> Result<(), HandlerError>;
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for F
where
    M: Send + 'static,
    F: Fn(M) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: M) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

type DispatchFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;
type DispatchFn = Arc<dyn Fn(Vec<u8>) -> DispatchFuture + Send + Sync>;

/// Consumer with per-queue handler registration and graceful shutdown.
pub struct MessageConsumer {
    connection: Arc<AmqpConnection>,
    metrics: Arc<MessagingMetrics>,
    prefetch_count: u16,
    subscriptions: parking_lot::Mutex<HashMap<QueueName, DispatchFn>>,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    consumer_tags: parking_lot::Mutex<Vec<String>>,
    consuming: AtomicBool,
}

impl MessageConsumer {
    pub fn new(connection: Arc<AmqpConnection>, metrics: Arc<MessagingMetrics>) -> MessageConsumer {
        let prefetch_count = connection.config().consumer_prefetch_count;
        let (shutdown, _) = watch::channel(false);

        MessageConsumer {
            connection,
            metrics,
            prefetch_count,
            subscriptions: parking_lot::Mutex::new(HashMap::new()),
            shutdown,
            tasks: tokio::sync::Mutex::new(vec![]),
            consumer_tags: parking_lot::Mutex::new(vec![]),
            consuming: AtomicBool::new(false),
        }
    }

    /// Registers the handler for `M`'s queue. The schema mapping is fixed at
    /// compile time through [`QueueMessage`]; exactly one handler is allowed
    /// per queue.
    pub fn subscribe<M, H>(&self, handler: H) -> Result<(), MessagingError>
    where
        M: QueueMessage,
        H: MessageHandler<M> + 'static,
    {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(&M::QUEUE) {
            return Err(MessagingError::Consume(
                M::QUEUE.as_str().to_owned(),
                "a handler is already registered for this queue".to_owned(),
            ));
        }

        let handler = Arc::new(handler);
        let dispatch: DispatchFn = Arc::new(move |body: Vec<u8>| {
            let handler = handler.clone();
            Box::pin(async move { dispatch_payload(M::QUEUE, handler.as_ref(), &body).await })
                as DispatchFuture
        });

        subscriptions.insert(M::QUEUE, dispatch);
        info!(queue = M::QUEUE.as_str(), "handler registered");
        Ok(())
    }

    /// Sets channel QoS, begins consuming every subscribed queue, and blocks
    /// the calling task until [`stop`](Self::stop) is invoked.
    pub async fn start(&self) -> Result<(), MessagingError> {
        if self.consuming.swap(true, Ordering::SeqCst) {
            warn!("consumer already running");
            return Ok(());
        }

        let subscriptions: Vec<(QueueName, DispatchFn)> = self
            .subscriptions
            .lock()
            .iter()
            .map(|(queue, dispatch)| (*queue, dispatch.clone()))
            .collect();

        if subscriptions.is_empty() {
            warn!("no handlers registered, nothing to consume");
            self.consuming.store(false, Ordering::SeqCst);
            return Ok(());
        }

        if !self.connection.is_connected() {
            self.consuming.store(false, Ordering::SeqCst);
            return Err(MessagingError::Connection(
                "not connected to the broker, call connect() first".to_owned(),
            ));
        }

        self.shutdown.send_replace(false);

        let channel = self.connection.channel().await?;
        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                MessagingError::Internal(format!("failure to configure qos: {err}"))
            })?;

        let mut tasks = self.tasks.lock().await;
        for (queue, dispatch) in subscriptions {
            let tag = format!("researcher.{}", queue.as_str());
            let mut consumer = channel
                .basic_consume(
                    queue.as_str(),
                    &tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(
                        error = err.to_string(),
                        queue = queue.as_str(),
                        "error creating consumer"
                    );
                    MessagingError::Consume(queue.as_str().to_owned(), err.to_string())
                })?;

            self.consumer_tags.lock().push(tag);

            let metrics = self.metrics.clone();
            let mut shutdown_rx = self.shutdown.subscribe();

            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                debug!(queue = queue.as_str(), "shutdown requested");
                                break;
                            }
                        }
                        next = consumer.next() => match next {
                            Some(Ok(delivery)) => {
                                handle_delivery(queue, &dispatch, &metrics, delivery).await;
                            }
                            Some(Err(err)) => {
                                error!(
                                    error = err.to_string(),
                                    queue = queue.as_str(),
                                    "error receiving delivery"
                                );
                            }
                            None => {
                                warn!(queue = queue.as_str(), "consume stream ended");
                                break;
                            }
                        }
                    }
                }
            }));
        }
        drop(tasks);

        info!(prefetch = self.prefetch_count, "consumer started");

        // Block until stop() flips the shutdown flag.
        let mut shutdown_rx = self.shutdown.subscribe();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        Ok(())
    }

    /// Requests shutdown. When `graceful`, waits up to `timeout` for
    /// in-flight handlers to finish before cancelling the broker-side
    /// consumer registrations.
    pub async fn stop(&self, graceful: bool, timeout: Duration) -> Result<(), MessagingError> {
        if !self.consuming.load(Ordering::SeqCst) {
            return Ok(());
        }

        info!(graceful, "stopping consumer...");
        self.shutdown.send_replace(true);

        let mut tasks = self.tasks.lock().await;
        if graceful {
            let drained: Vec<JoinHandle<()>> = tasks.drain(..).collect();
            join_or_abort(drained, timeout).await;
        } else {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        drop(tasks);

        let tags: Vec<String> = self.consumer_tags.lock().drain(..).collect();
        match self.connection.channel().await {
            Ok(channel) => {
                for tag in tags {
                    if let Err(err) = channel
                        .basic_cancel(&tag, BasicCancelOptions::default())
                        .await
                    {
                        error!(error = err.to_string(), tag, "error cancelling consumer");
                    }
                }
            }
            Err(err) => debug!(error = err.to_string(), "channel gone, skipping cancel"),
        }

        self.consuming.store(false, Ordering::SeqCst);
        info!("consumer stopped");
        Ok(())
    }

    /// Connected, consuming, and not shutting down.
    pub fn health_check(&self) -> bool {
        self.connection.is_connected()
            && self.consuming.load(Ordering::SeqCst)
            && !*self.shutdown.borrow()
    }
}

/// Joins the consume tasks, aborting any that outlive `timeout` so no
/// handler keeps running (or holding its unacked delivery) after `stop`
/// returns.
async fn join_or_abort(tasks: Vec<JoinHandle<()>>, timeout: Duration) {
    let abort_handles: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();

    if tokio::time::timeout(timeout, futures_util::future::join_all(tasks))
        .await
        .is_err()
    {
        warn!("graceful shutdown timed out, aborting in-flight tasks");
        for handle in abort_handles {
            handle.abort();
        }
    }
}

/// Runs one delivery through the classifier and dispatches the outcome
/// through a single switch.
async fn handle_delivery(
    queue: QueueName,
    dispatch: &DispatchFn,
    metrics: &MessagingMetrics,
    mut delivery: Delivery,
) {
    let started = Instant::now();
    let body = std::mem::take(&mut delivery.data);
    let outcome = dispatch(body).await;

    match outcome {
        Outcome::Ack => {
            match delivery.ack(BasicAckOptions { multiple: false }).await {
                Ok(()) => {
                    metrics.record_consumed(queue.as_str());
                    metrics.record_acked(queue.as_str());
                    metrics.record_time(
                        &format!("consumed.{}", queue.as_str()),
                        started.elapsed().as_secs_f64() * 1000.0,
                    );
                    debug!(queue = queue.as_str(), "message processed");
                }
                Err(err) => {
                    error!(error = err.to_string(), queue = queue.as_str(), "error whiling ack msg");
                    metrics.record_error(queue.as_str(), "ack_error");
                }
            }
        }
        Outcome::NackRequeue => {
            warn!(queue = queue.as_str(), "transient failure, requeuing message");
            match delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
            {
                Ok(()) => metrics.record_nacked(queue.as_str(), true),
                Err(err) => {
                    error!(error = err.to_string(), queue = queue.as_str(), "error whiling nack msg");
                    metrics.record_error(queue.as_str(), "nack_error");
                }
            }
        }
        Outcome::NackDlq(reason) => {
            error!(queue = queue.as_str(), reason = %reason, "dead-lettering message");
            match delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: false,
                })
                .await
            {
                Ok(()) => {
                    metrics.record_nacked(queue.as_str(), false);
                    metrics.record_dlq(queue.as_str(), &reason);
                }
                Err(err) => {
                    error!(error = err.to_string(), queue = queue.as_str(), "error whiling nack msg");
                    metrics.record_error(queue.as_str(), "nack_error");
                }
            }
        }
    }
}

/// Deserializes, validates and handles one payload, producing the delivery
/// outcome. Malformed or invalid payloads are permanent: redelivery cannot
/// fix them.
pub(crate) async fn dispatch_payload<M, H>(queue: QueueName, handler: &H, body: &[u8]) -> Outcome
where
    M: QueueMessage,
    H: MessageHandler<M> + ?Sized,
{
    let message: M = match serde_json::from_slice(body) {
        Ok(message) => message,
        Err(err) => {
            error!(
                queue = queue.as_str(),
                error = err.to_string(),
                "failure to parse payload"
            );
            return Outcome::NackDlq("invalid_payload".to_owned());
        }
    };

    if let Err(err) = message.validate() {
        error!(
            queue = queue.as_str(),
            error = err.to_string(),
            "payload failed schema validation"
        );
        return Outcome::NackDlq("validation_error".to_owned());
    }

    debug!(
        queue = queue.as_str(),
        correlation_id = message.correlation_id(),
        "processing message"
    );

    match handler.handle(message).await {
        Ok(()) => Outcome::Ack,
        Err(err) => classify_handler_error(&err),
    }
}

/// Single classification point for handler failures.
pub(crate) fn classify_handler_error(err: &HandlerError) -> Outcome {
    match err {
        HandlerError::Permanent(_) => Outcome::NackDlq("permanent_error".to_owned()),
        HandlerError::Transient(_) => Outcome::NackRequeue,
        HandlerError::Messaging(err) => classify_messaging_error(err),
    }
}

fn classify_messaging_error(err: &MessagingError) -> Outcome {
    match err {
        MessagingError::ChannelClosed { reply_code, .. } => classify_reply_code(*reply_code),
        // The channel itself is gone; requeueing is futile.
        MessagingError::Connection(_) | MessagingError::ConnectionClosed { .. } => {
            Outcome::NackDlq("connection_closed".to_owned())
        }
        err if err.is_permanent() => Outcome::NackDlq(err.kind().to_owned()),
        _ => Outcome::NackRequeue,
    }
}

/// Classifies broker-originated channel closures by AMQP reply code.
///
/// Unrecognized codes are dead-lettered: the conservative default prevents
/// unbounded requeue loops on unknown failure classes.
pub(crate) fn classify_reply_code(reply_code: u16) -> Outcome {
    match reply_code {
        // Another consumer mid-processing; redelivery may succeed.
        405 => Outcome::NackRequeue,
        406 => Outcome::NackDlq("precondition_failed".to_owned()),
        404 => Outcome::NackDlq("queue_not_found".to_owned()),
        403 => Outcome::NackDlq("access_denied".to_owned()),
        // Server-side failure, likely transient.
        code if code >= 500 => Outcome::NackRequeue,
        code => Outcome::NackDlq(format!("channel_error_{code}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessagingConfig;
    use crate::messages::{SourceMessage, SourceType};
    use mockall::mock;
    use mockall::predicate::always;
    use std::sync::atomic::AtomicU32;

    mock! {
        DiscoveredHandler {}

        #[async_trait]
        impl MessageHandler<SourceMessage> for DiscoveredHandler {
            async fn handle(&self, message: SourceMessage) -> Result<(), HandlerError>;
        }
    }

    fn payload() -> Vec<u8> {
        let msg =
            SourceMessage::new(SourceType::Arxiv, "https://arxiv.org/abs/1", "title", "body")
                .unwrap();
        serde_json::to_vec(&msg).unwrap()
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered() {
        let handler = |_msg: SourceMessage| async { Ok(()) };
        let outcome = dispatch_payload(QueueName::ContentDiscovered, &handler, b"not json").await;
        assert_eq!(outcome, Outcome::NackDlq("invalid_payload".to_owned()));
    }

    #[tokio::test]
    async fn invalid_schema_is_dead_lettered_without_handler_call() {
        let mut handler = MockDiscoveredHandler::new();
        handler.expect_handle().times(0);

        // Parses as a SourceMessage but fails field validation.
        let body = serde_json::json!({
            "correlation_id": "abc",
            "created_at": "2026-08-25T00:00:00Z",
            "retry_count": 0,
            "source_type": "arxiv",
            "url": "https://arxiv.org/abs/1",
            "title": "   ",
            "content": "body",
        });
        let outcome = dispatch_payload(
            QueueName::ContentDiscovered,
            &handler,
            &serde_json::to_vec(&body).unwrap(),
        )
        .await;
        assert_eq!(outcome, Outcome::NackDlq("validation_error".to_owned()));
    }

    #[tokio::test]
    async fn successful_handler_acks() {
        let handler = |_msg: SourceMessage| async { Ok(()) };
        let outcome = dispatch_payload(QueueName::ContentDiscovered, &handler, &payload()).await;
        assert_eq!(outcome, Outcome::Ack);
    }

    #[tokio::test]
    async fn permanent_handler_error_is_dead_lettered_after_one_call() {
        let mut handler = MockDiscoveredHandler::new();
        handler
            .expect_handle()
            .with(always())
            .times(1)
            .returning(|_| Err(HandlerError::Permanent("unusable".to_owned())));

        let outcome = dispatch_payload(QueueName::ContentDiscovered, &handler, &payload()).await;
        assert_eq!(outcome, Outcome::NackDlq("permanent_error".to_owned()));
    }

    #[tokio::test]
    async fn transient_failures_requeue_until_success() {
        // Fails twice, succeeds on the third delivery.
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();
        let handler = move |_msg: SourceMessage| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HandlerError::Transient("not yet".to_owned()))
                } else {
                    Ok(())
                }
            }
        };

        let body = payload();
        let mut outcomes = vec![];
        for _ in 0..3 {
            outcomes.push(dispatch_payload(QueueName::ContentDiscovered, &handler, &body).await);
        }

        assert_eq!(
            outcomes,
            vec![Outcome::NackRequeue, Outcome::NackRequeue, Outcome::Ack]
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn reply_codes_classify_per_failure_class() {
        assert_eq!(classify_reply_code(405), Outcome::NackRequeue);
        assert_eq!(
            classify_reply_code(406),
            Outcome::NackDlq("precondition_failed".to_owned())
        );
        assert_eq!(
            classify_reply_code(404),
            Outcome::NackDlq("queue_not_found".to_owned())
        );
        assert_eq!(
            classify_reply_code(403),
            Outcome::NackDlq("access_denied".to_owned())
        );
        assert_eq!(classify_reply_code(541), Outcome::NackRequeue);
        assert_eq!(
            classify_reply_code(320),
            Outcome::NackDlq("channel_error_320".to_owned())
        );
    }

    #[test]
    fn connection_loss_is_never_requeued() {
        let err = HandlerError::Messaging(MessagingError::ConnectionClosed {
            reply_code: 320,
            reply_text: "connection forced".to_owned(),
        });
        assert_eq!(
            classify_handler_error(&err),
            Outcome::NackDlq("connection_closed".to_owned())
        );
    }

    #[test]
    fn unclassified_messaging_errors_requeue() {
        let err = HandlerError::Messaging(MessagingError::Internal("odd".to_owned()));
        assert_eq!(classify_handler_error(&err), Outcome::NackRequeue);
    }

    #[test]
    fn duplicate_subscription_is_rejected() {
        let consumer = MessageConsumer::new(
            AmqpConnection::new(MessagingConfig::default()),
            MessagingMetrics::new(),
        );

        let handler = |_msg: SourceMessage| async { Ok(()) };
        consumer.subscribe::<SourceMessage, _>(handler).unwrap();

        let again = |_msg: SourceMessage| async { Ok(()) };
        let result = consumer.subscribe::<SourceMessage, _>(again);
        assert!(matches!(result, Err(MessagingError::Consume(_, _))));
    }

    #[tokio::test]
    async fn start_fails_fast_when_disconnected() {
        let consumer = MessageConsumer::new(
            AmqpConnection::new(MessagingConfig::default()),
            MessagingMetrics::new(),
        );
        let handler = |_msg: SourceMessage| async { Ok(()) };
        consumer.subscribe::<SourceMessage, _>(handler).unwrap();

        let result = consumer.start().await;
        assert!(matches!(result, Err(MessagingError::Connection(_))));
        assert!(!consumer.health_check());
    }

    #[tokio::test]
    async fn graceful_stop_joins_tasks_that_finish_in_time() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let task = tokio::spawn(async move {
            flag.store(true, Ordering::SeqCst);
        });

        join_or_abort(vec![task], Duration::from_secs(1)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn graceful_stop_aborts_tasks_that_outlive_the_timeout() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flag.store(true, Ordering::SeqCst);
        });

        join_or_abort(vec![task], Duration::from_millis(20)).await;

        // An aborted task can never reach its final store.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn start_without_subscriptions_is_noop() {
        let consumer = MessageConsumer::new(
            AmqpConnection::new(MessagingConfig::default()),
            MessagingMetrics::new(),
        );
        consumer.start().await.unwrap();
        assert!(!consumer.health_check());
    }
}
