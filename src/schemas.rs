//! # Schemas Module
//!
//! Wire-level data structures: the client-facing chat API and the
//! upstream Ollama-compatible generation protocol.

use crate::codeblocks::CodeBlock;
use serde::{Deserialize, Serialize};

// =============================================================================
// CLIENT-FACING CHAT API
// =============================================================================

/// Body of `POST /api/chat` and `POST /api/chat/stream`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChatRequest {
    /// The user's message
    pub message: String,
    /// Model to generate with (configuration default when absent)
    pub model_name: Option<String>,
    /// Stream the response as SSE
    pub stream: Option<bool>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Generation token budget
    pub max_tokens: Option<u32>,
    /// Conversation this message belongs to
    pub conversation_id: Option<i64>,
    /// Set to false to bypass the response cache
    pub cache: Option<bool>,
    /// Reserved for the persistence collaborator
    pub extra: Option<serde_json::Value>,
}

/// Body of a completed `POST /api/chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    pub conversation_id: i64,
    pub code_blocks: Vec<CodeBlock>,
    pub tokens_used: u64,
    pub model: String,
}

/// One entry of `GET /api/models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Body of `POST /api/models/pull/{name}` (202).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullAccepted {
    pub message: String,
    pub model_name: String,
}

// =============================================================================
// UPSTREAM OLLAMA PROTOCOL
// =============================================================================

/// Body of `POST {backend}/api/generate`.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
    pub options: GenerateOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub num_predict: u32,
}

/// One NDJSON frame of a generation response. Incremental frames carry
/// `response`; the terminal frame sets `done` and may carry totals.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateFrame {
    pub model: Option<String>,
    pub response: Option<String>,
    pub done: Option<bool>,
    pub total_tokens: Option<u64>,
    pub total_duration: Option<u64>,
}

/// Body of `GET {backend}/api/tags`.
#[derive(Debug, Clone, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<TagModel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagModel {
    pub name: String,
    pub size: Option<u64>,
    pub modified_at: Option<String>,
}

/// One NDJSON progress frame of `POST {backend}/api/pull`.
#[derive(Debug, Clone, Deserialize)]
pub struct PullFrame {
    pub status: Option<String>,
}

/// Per-backend outcome of a model pull.
#[derive(Debug, Clone, Serialize)]
pub struct PullOutcome {
    pub instance: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
