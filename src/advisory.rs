//! External advisory model that proposes parameter changes.
//!
//! The supervisor only sees the [`ParameterAdvisor`] trait. [`HttpAdvisor`]
//! talks to an OpenAI-compatible chat completions endpoint; [`StaticAdvisor`]
//! replays canned responses.

use crate::config::AdvisoryConfig;
use crate::model::{ParameterSuggestion, PerformanceMetrics, StrategyRecord, TradeRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum AdvisoryError {
    #[error("Advisory model not configured: {0}")]
    NotConfigured(String),
    #[error("Advisory request failed: {0}")]
    Request(String),
    #[error("Advisory model returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Malformed advisory response: {0}")]
    Malformed(String),
    #[error("Advisory call timed out after {0:?}")]
    Timeout(Duration),
}

/// What the advisory model is shown.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationContext {
    pub strategy_id: String,
    pub strategy_name: String,
    pub current_parameters: crate::model::ParameterSet,
    pub metrics: PerformanceMetrics,
    pub trade_count: usize,
    /// Most recent trades, oldest first
    pub recent_trades: Vec<TradeSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeSummary {
    pub symbol: String,
    pub side: String,
    pub volume: f64,
    pub profit: f64,
    pub closed_at: String,
}

const PROMPT_TRADE_LIMIT: usize = 30;

impl OptimizationContext {
    pub fn new(strategy: &StrategyRecord, trades: &[TradeRecord], metrics: PerformanceMetrics) -> Self {
        let skip = trades.len().saturating_sub(PROMPT_TRADE_LIMIT);
        Self {
            strategy_id: strategy.id.clone(),
            strategy_name: strategy.name.clone(),
            current_parameters: strategy.parameters.clone(),
            metrics,
            trade_count: trades.len(),
            recent_trades: trades
                .iter()
                .skip(skip)
                .map(|t| TradeSummary {
                    symbol: t.symbol.clone(),
                    side: t.side.to_string(),
                    volume: t.volume,
                    profit: t.profit,
                    closed_at: t.closed_at.to_rfc3339(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdvisoryResponse {
    #[serde(default)]
    pub suggestions: Vec<ParameterSuggestion>,
    /// Model confidence in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

#[async_trait]
pub trait ParameterAdvisor: Send + Sync {
    async fn suggest_parameters(
        &self,
        context: &OptimizationContext,
    ) -> Result<AdvisoryResponse, AdvisoryError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

const SYSTEM_PROMPT: &str = "You are a quantitative trading strategy optimizer. \
You propose small, conservative parameter adjustments backed by the trade history you are given.";

pub struct HttpAdvisor {
    config: AdvisoryConfig,
    http: Client,
}

impl HttpAdvisor {
    pub fn new(config: AdvisoryConfig) -> Result<Self, AdvisoryError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AdvisoryError::Request(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    pub fn is_configured(&self) -> bool {
        self.config.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    fn build_prompt(context: &OptimizationContext) -> Result<String, AdvisoryError> {
        let data = serde_json::to_string(context)
            .map_err(|e| AdvisoryError::Malformed(format!("Failed to encode context: {}", e)))?;
        Ok(format!(
            r#"Analyze the strategy below and suggest parameter changes that improve risk-adjusted returns.

Rules:
1. Only change parameters that already exist in current_parameters.
2. Prefer changes under 20% of the current value.
3. Never raise riskPerTrade.
4. If the data does not support a change, return no suggestions.

Reply strictly as JSON with keys:
  suggestions: array of {{parameter, current_value, suggested_value, reason}},
  confidence: number between 0 and 1,
  reasoning: short string.

Strategy:
{}"#,
            data
        ))
    }

    async fn chat(&self, prompt: String) -> Result<String, AdvisoryError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AdvisoryError::NotConfigured("advisory.api_key is unset".into()))?;

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        debug!(model = %self.config.model, "Sending optimization request to advisory model");

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdvisoryError::Timeout(Duration::from_secs(self.config.timeout_secs))
                } else {
                    AdvisoryError::Request(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(status, "Advisory model error: {}", body);
            return Err(AdvisoryError::Status { status, body });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| AdvisoryError::Malformed(e.to_string()))?;
        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AdvisoryError::Malformed("Response has no choices".into()))
    }
}

/// Parse the model's reply, tolerating a fenced ```json block.
pub fn parse_response(content: &str) -> Result<AdvisoryResponse, AdvisoryError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    let mut parsed: AdvisoryResponse =
        serde_json::from_str(body).map_err(|e| AdvisoryError::Malformed(e.to_string()))?;
    if !parsed.confidence.is_finite() {
        return Err(AdvisoryError::Malformed("Confidence is not a number".into()));
    }
    parsed.confidence = parsed.confidence.clamp(0.0, 1.0);
    parsed
        .suggestions
        .retain(|s| s.suggested_value.is_finite() && !s.parameter.trim().is_empty());
    Ok(parsed)
}

#[async_trait]
impl ParameterAdvisor for HttpAdvisor {
    async fn suggest_parameters(
        &self,
        context: &OptimizationContext,
    ) -> Result<AdvisoryResponse, AdvisoryError> {
        let prompt = Self::build_prompt(context)?;
        let content = self.chat(prompt).await?;
        let response = parse_response(&content)?;
        debug!(
            strategy_id = %context.strategy_id,
            suggestions = response.suggestions.len(),
            confidence = response.confidence,
            "Advisory response received"
        );
        Ok(response)
    }
}

/// Replays queued responses in order, then repeats the fallback.
pub struct StaticAdvisor {
    queued: Mutex<VecDeque<Result<AdvisoryResponse, String>>>,
    fallback: Result<AdvisoryResponse, String>,
    calls: AtomicUsize,
}

impl StaticAdvisor {
    pub fn new(response: AdvisoryResponse) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            fallback: Ok(response),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            fallback: Err(message.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, response: AdvisoryResponse) {
        self.queued.lock().push_back(Ok(response));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ParameterAdvisor for StaticAdvisor {
    async fn suggest_parameters(
        &self,
        _context: &OptimizationContext,
    ) -> Result<AdvisoryResponse, AdvisoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .queued
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        next.map_err(AdvisoryError::Request)
    }
}
