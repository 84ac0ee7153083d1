//! Threshold-triggered requests to the downstream analysis functions.
//!
//! Every inbound message re-counts the customer messages since the last
//! analysis of each kind. Reaching the threshold claims the window by swapping
//! a request marker into the conversation metadata, then posts
//! `{ conversationId }` to the analysis endpoint. Only the evaluation that wins
//! the swap posts; a failed post hands the window back.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::error::IngestError;
use crate::types::AppState;

const SENTIMENT_ENDPOINT: &str = "/functions/v1/analyze-whatsapp-sentiment";
const CATEGORIZATION_ENDPOINT: &str = "/functions/v1/categorize-whatsapp-conversation";
const TRANSCRIPTION_ENDPOINT: &str = "/functions/v1/transcribe-audio";

const CATEGORIZED_AT: &str = "categorized_at";
const SENTIMENT_REQUESTED_AT: &str = "sentiment_requested_at";
const CATEGORIZATION_REQUESTED_AT: &str = "categorization_requested_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisKind {
    Sentiment,
    Categorization,
    Transcription,
}

impl AnalysisKind {
    fn endpoint(self) -> &'static str {
        match self {
            AnalysisKind::Sentiment => SENTIMENT_ENDPOINT,
            AnalysisKind::Categorization => CATEGORIZATION_ENDPOINT,
            AnalysisKind::Transcription => TRANSCRIPTION_ENDPOINT,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisKind::Sentiment => "sentiment",
            AnalysisKind::Categorization => "categorization",
            AnalysisKind::Transcription => "transcription",
        }
    }
}

#[derive(Clone)]
pub struct AnalysisClient {
    http: reqwest::Client,
    base_url: Option<String>,
    api_key: String,
}

impl AnalysisClient {
    /// With no base URL every request is skipped.
    pub fn new(base_url: Option<String>, api_key: String) -> Result<Self, IngestError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.base_url.is_some()
    }

    pub async fn request(&self, kind: AnalysisKind, body: &Value) -> Result<(), IngestError> {
        let Some(base_url) = &self.base_url else {
            return Ok(());
        };
        let mut request = self
            .http
            .post(format!("{base_url}{}", kind.endpoint()))
            .json(body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Gateway { status, body });
        }
        tracing::info!(kind = kind.as_str(), "analysis requested");
        Ok(())
    }
}

/// Which analyses a call to [`maybe_trigger`] requested.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub sentiment: bool,
    pub categorization: bool,
}

fn metadata_time(metadata: &Value, key: &str) -> Option<DateTime<Utc>> {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Evaluates both thresholds for `conversation_id` after an inbound message
/// stamped `message_at` was stored.
pub async fn maybe_trigger(
    state: &AppState,
    conversation_id: &str,
    message_at: DateTime<Utc>,
) -> Result<TriggerOutcome, IngestError> {
    if !state.analysis.is_enabled() {
        return Ok(TriggerOutcome::default());
    }
    let Some(conversation) = state.store.conversation(conversation_id).await? else {
        return Err(IngestError::NotFound("conversation", conversation_id.to_string()));
    };
    let metadata = &conversation.metadata;

    let sentiment_since = state
        .store
        .latest_sentiment_at(conversation_id)
        .await?
        .max(metadata_time(metadata, SENTIMENT_REQUESTED_AT));
    let categorization_since = metadata_time(metadata, CATEGORIZED_AT)
        .max(metadata_time(metadata, CATEGORIZATION_REQUESTED_AT));

    // Every due window is claimed before the first post goes out.
    let mut claimed = Vec::new();
    for (kind, since, marker) in [
        (AnalysisKind::Sentiment, sentiment_since, SENTIMENT_REQUESTED_AT),
        (
            AnalysisKind::Categorization,
            categorization_since,
            CATEGORIZATION_REQUESTED_AT,
        ),
    ] {
        let previous = metadata.get(marker).and_then(Value::as_str);
        match claim_window(state, conversation_id, kind, since, marker, previous, message_at).await {
            Ok(Some(stamp)) => claimed.push((kind, marker, previous, stamp)),
            Ok(None) => {}
            Err(err) => tracing::warn!(
                conversation_id = %conversation_id,
                kind = kind.as_str(),
                error = %err,
                "automation check failed"
            ),
        }
    }

    let mut outcome = TriggerOutcome::default();
    for (kind, marker, previous, stamp) in claimed {
        let body = json!({ "conversationId": conversation_id });
        if let Err(err) = state.analysis.request(kind, &body).await {
            tracing::warn!(
                conversation_id = %conversation_id,
                kind = kind.as_str(),
                error = %err,
                "analysis request failed"
            );
            // Hand the window back; the next inbound message retries.
            state
                .store
                .swap_metadata_marker(conversation_id, marker, Some(&stamp), previous)
                .await?;
            continue;
        }
        match kind {
            AnalysisKind::Sentiment => outcome.sentiment = true,
            _ => outcome.categorization = true,
        }
    }
    Ok(outcome)
}

/// Counts the window and, when it reached the threshold, swaps the request
/// marker in. Returns the stamp written, or `None` when below the threshold or
/// another evaluation claimed the window first.
async fn claim_window(
    state: &AppState,
    conversation_id: &str,
    kind: AnalysisKind,
    since: Option<DateTime<Utc>>,
    marker: &str,
    previous: Option<&str>,
    message_at: DateTime<Utc>,
) -> Result<Option<String>, IngestError> {
    let count = state
        .store
        .count_inbound_since(conversation_id, since)
        .await?;
    tracing::debug!(
        conversation_id = %conversation_id,
        kind = kind.as_str(),
        count,
        "inbound messages since last analysis"
    );
    if count < state.automation_threshold {
        return Ok(None);
    }

    let stamp = message_at.to_rfc3339();
    if !state
        .store
        .swap_metadata_marker(conversation_id, marker, previous, Some(&stamp))
        .await?
    {
        tracing::debug!(
            conversation_id = %conversation_id,
            kind = kind.as_str(),
            "analysis window already claimed"
        );
        return Ok(None);
    }
    Ok(Some(stamp))
}

/// Asks for a transcript of a stored audio message.
pub async fn request_transcription(state: &AppState, message_row_id: &str) -> Result<(), IngestError> {
    state
        .analysis
        .request(
            AnalysisKind::Transcription,
            &json!({ "messageId": message_row_id }),
        )
        .await
}
