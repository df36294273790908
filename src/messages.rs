// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Schemas for the Content Pipeline
//!
//! Every queue is statically mapped to exactly one message schema. Messages
//! carry an immutable [`Envelope`] (correlation id, creation timestamp and an
//! informational retry count) and validate their fields fail-fast at
//! construction. Later pipeline stages reference earlier stages through
//! explicit `original_correlation_id`-style fields, forming an acyclic
//! lineage across the pipeline.
//!
//! The wire format is UTF-8 JSON: timestamps serialize as ISO-8601 strings
//! and enumerations as their string value.

use crate::errors::MessagingError;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Closed enumeration of the logical topics in the pipeline.
///
/// Each main queue has exactly one companion dead-letter queue named
/// `<domain>.<event>.dlq`; no other naming is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    ContentDiscovered,
    ContentDeduplicated,
    InsightsExtracted,
    DigestReady,
    FeedbackSubmitted,
    TrainingTrigger,
}

impl QueueName {
    /// Every main queue, in pipeline order.
    pub const ALL: [QueueName; 6] = [
        QueueName::ContentDiscovered,
        QueueName::ContentDeduplicated,
        QueueName::InsightsExtracted,
        QueueName::DigestReady,
        QueueName::FeedbackSubmitted,
        QueueName::TrainingTrigger,
    ];

    /// Queue name on the broker; doubles as the topic routing key.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::ContentDiscovered => "content.discovered",
            QueueName::ContentDeduplicated => "content.deduplicated",
            QueueName::InsightsExtracted => "insights.extracted",
            QueueName::DigestReady => "digest.ready",
            QueueName::FeedbackSubmitted => "feedback.submitted",
            QueueName::TrainingTrigger => "training.trigger",
        }
    }

    /// Companion dead-letter queue name.
    pub fn dlq_name(&self) -> &'static str {
        match self {
            QueueName::ContentDiscovered => "content.discovered.dlq",
            QueueName::ContentDeduplicated => "content.deduplicated.dlq",
            QueueName::InsightsExtracted => "insights.extracted.dlq",
            QueueName::DigestReady => "digest.ready.dlq",
            QueueName::FeedbackSubmitted => "feedback.submitted.dlq",
            QueueName::TrainingTrigger => "training.trigger.dlq",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of content source feeding the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Arxiv,
    Kaggle,
    Huggingface,
    WebSearch,
}

/// Common metadata carried by every message.
///
/// The correlation id is an opaque trace token generated at construction and
/// never reused across unrelated messages. `retry_count` is an informational
/// hint only; authoritative retry state lives in the retry strategy and the
/// circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl Envelope {
    pub fn new() -> Envelope {
        Envelope {
            correlation_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            retry_count: 0,
        }
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Envelope::new()
    }
}

/// A schema statically bound to one queue.
///
/// The consumer relies on this binding to deserialize and validate every
/// delivery before the handler ever sees it.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The one queue this schema travels on.
    const QUEUE: QueueName;

    fn envelope(&self) -> &Envelope;

    /// Field-level validation, applied at construction and again after
    /// deserialization on the consumer side.
    fn validate(&self) -> Result<(), MessagingError>;

    fn correlation_id(&self) -> &str {
        &self.envelope().correlation_id
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), MessagingError> {
    if value.trim().is_empty() {
        return Err(MessagingError::Validation(format!(
            "{field} cannot be empty"
        )));
    }
    Ok(())
}

fn require_max_length(field: &str, value: &str, max: usize) -> Result<(), MessagingError> {
    if value.len() > max {
        return Err(MessagingError::Validation(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(())
}

fn require_unit_score(field: &str, value: f64) -> Result<(), MessagingError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(MessagingError::Validation(format!(
            "{field} must be within [0.0, 1.0]"
        )));
    }
    Ok(())
}

/// Raw content discovered by a fetcher.
///
/// Published to `content.discovered`, consumed by the deduplication service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub source_type: SourceType,
    pub url: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SourceMessage {
    pub fn new(
        source_type: SourceType,
        url: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<SourceMessage, MessagingError> {
        let msg = SourceMessage {
            envelope: Envelope::new(),
            source_type,
            url: url.into(),
            title: title.into(),
            content: content.into(),
            metadata: serde_json::Map::new(),
        };
        msg.validate()?;
        Ok(msg)
    }
}

impl QueueMessage for SourceMessage {
    const QUEUE: QueueName = QueueName::ContentDiscovered;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn validate(&self) -> Result<(), MessagingError> {
        require_non_empty("url", &self.url)?;
        require_max_length("url", &self.url, 2048)?;
        require_non_empty("title", &self.title)?;
        require_max_length("title", &self.title, 512)?;
        require_non_empty("content", &self.content)
    }
}

/// Content that survived the deduplication check.
///
/// Published to `content.deduplicated`, consumed by the extraction service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeduplicatedContentMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub source_type: SourceType,
    pub url: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Correlation id of the originating `SourceMessage`
    pub original_correlation_id: String,
}

impl DeduplicatedContentMessage {
    pub fn from_source(source: &SourceMessage) -> DeduplicatedContentMessage {
        DeduplicatedContentMessage {
            envelope: Envelope::new(),
            source_type: source.source_type,
            url: source.url.clone(),
            title: source.title.clone(),
            content: source.content.clone(),
            metadata: source.metadata.clone(),
            original_correlation_id: source.envelope.correlation_id.clone(),
        }
    }
}

impl QueueMessage for DeduplicatedContentMessage {
    const QUEUE: QueueName = QueueName::ContentDeduplicated;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn validate(&self) -> Result<(), MessagingError> {
        require_non_empty("url", &self.url)?;
        require_max_length("url", &self.url, 2048)?;
        require_non_empty("title", &self.title)?;
        require_max_length("title", &self.title, 512)?;
        require_non_empty("content", &self.content)?;
        require_non_empty("original_correlation_id", &self.original_correlation_id)
    }
}

/// LLM-extracted insights for one piece of content.
///
/// Published to `insights.extracted`, consumed by the synthesis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedInsightsMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub source_type: SourceType,
    pub source_url: String,
    pub source_title: String,
    pub key_insights: String,
    #[serde(default)]
    pub core_techniques: Vec<String>,
    #[serde(default)]
    pub code_snippets: Vec<String>,
    /// How actionable the insight is for research, bounded to [0, 1]
    pub actionability_score: f64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub original_correlation_id: String,
    pub deduplicated_correlation_id: String,
}

impl QueueMessage for ExtractedInsightsMessage {
    const QUEUE: QueueName = QueueName::InsightsExtracted;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn validate(&self) -> Result<(), MessagingError> {
        require_non_empty("source_url", &self.source_url)?;
        require_max_length("source_url", &self.source_url, 2048)?;
        require_non_empty("source_title", &self.source_title)?;
        require_max_length("source_title", &self.source_title, 512)?;
        require_non_empty("key_insights", &self.key_insights)?;
        require_unit_score("actionability_score", self.actionability_score)?;
        require_non_empty("original_correlation_id", &self.original_correlation_id)?;
        require_non_empty(
            "deduplicated_correlation_id",
            &self.deduplicated_correlation_id,
        )
    }
}

/// Single categorized item inside a digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestItem {
    pub source_type: SourceType,
    pub source_url: String,
    pub source_title: String,
    pub key_insights: String,
    #[serde(default)]
    pub core_techniques: Vec<String>,
    #[serde(default)]
    pub code_snippets: Vec<String>,
    pub category: String,
    pub application_ideas: Vec<String>,
    #[serde(default)]
    pub relevance_score: Option<f64>,
}

impl DigestItem {
    fn validate(&self) -> Result<(), MessagingError> {
        require_non_empty("source_url", &self.source_url)?;
        require_max_length("source_url", &self.source_url, 2048)?;
        require_non_empty("source_title", &self.source_title)?;
        require_max_length("source_title", &self.source_title, 512)?;
        require_non_empty("key_insights", &self.key_insights)?;
        require_non_empty("category", &self.category)?;
        require_max_length("category", &self.category, 100)?;
        if self.application_ideas.is_empty() {
            return Err(MessagingError::Validation(
                "application_ideas requires at least one entry".to_owned(),
            ));
        }
        if let Some(score) = self.relevance_score {
            require_unit_score("relevance_score", score)?;
        }
        Ok(())
    }
}

/// Synthesized digest batch ready for generation.
///
/// Published to `digest.ready`, consumed by the digest generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestReadyMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub digest_items: Vec<DigestItem>,
    /// Must match `digest_items.len()`
    pub item_count: usize,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub insight_correlation_ids: Vec<String>,
}

impl DigestReadyMessage {
    pub fn new(
        digest_items: Vec<DigestItem>,
        categories: Vec<String>,
        insight_correlation_ids: Vec<String>,
    ) -> Result<DigestReadyMessage, MessagingError> {
        let msg = DigestReadyMessage {
            envelope: Envelope::new(),
            item_count: digest_items.len(),
            digest_items,
            generated_at: Utc::now(),
            categories,
            insight_correlation_ids,
        };
        msg.validate()?;
        Ok(msg)
    }
}

impl QueueMessage for DigestReadyMessage {
    const QUEUE: QueueName = QueueName::DigestReady;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn validate(&self) -> Result<(), MessagingError> {
        if self.digest_items.is_empty() {
            return Err(MessagingError::Validation(
                "digest_items requires at least one entry".to_owned(),
            ));
        }
        if self.item_count != self.digest_items.len() {
            return Err(MessagingError::Validation(
                "item_count must match digest_items length".to_owned(),
            ));
        }
        for item in &self.digest_items {
            item.validate()?;
        }
        Ok(())
    }
}

/// User feedback on a delivered digest item.
///
/// Published to `feedback.submitted`, consumed by the learning service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub item_id: String,
    /// Correlation id of the digest item this feedback refers to
    #[serde(default)]
    pub item_correlation_id: Option<String>,
    /// User rating, 1-5 stars
    pub rating: u8,
    pub implemented: bool,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub source_type: Option<SourceType>,
}

impl FeedbackMessage {
    pub fn new(
        item_id: impl Into<String>,
        rating: u8,
        implemented: bool,
    ) -> Result<FeedbackMessage, MessagingError> {
        let msg = FeedbackMessage {
            envelope: Envelope::new(),
            item_id: item_id.into(),
            item_correlation_id: None,
            rating,
            implemented,
            notes: None,
            category: None,
            source_type: None,
        };
        msg.validate()?;
        Ok(msg)
    }
}

impl QueueMessage for FeedbackMessage {
    const QUEUE: QueueName = QueueName::FeedbackSubmitted;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn validate(&self) -> Result<(), MessagingError> {
        require_non_empty("item_id", &self.item_id)?;
        if !(1..=5).contains(&self.rating) {
            return Err(MessagingError::Validation(
                "rating must be between 1 and 5".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Trigger for model retraining once enough feedback accumulated.
///
/// Published to `training.trigger`, consumed by the learning service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingTriggerMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Why training was triggered (threshold_reached, manual, scheduled)
    pub trigger_reason: String,
    pub feedback_count: u32,
    #[serde(default)]
    pub model_version: Option<String>,
    pub triggered_at: DateTime<Utc>,
    #[serde(default)]
    pub feedback_correlation_ids: Vec<String>,
}

impl TrainingTriggerMessage {
    pub fn new(
        trigger_reason: impl Into<String>,
        feedback_count: u32,
    ) -> Result<TrainingTriggerMessage, MessagingError> {
        let msg = TrainingTriggerMessage {
            envelope: Envelope::new(),
            trigger_reason: trigger_reason.into(),
            feedback_count,
            model_version: None,
            triggered_at: Utc::now(),
            feedback_correlation_ids: vec![],
        };
        msg.validate()?;
        Ok(msg)
    }
}

impl QueueMessage for TrainingTriggerMessage {
    const QUEUE: QueueName = QueueName::TrainingTrigger;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn validate(&self) -> Result<(), MessagingError> {
        require_non_empty("trigger_reason", &self.trigger_reason)
    }
}
