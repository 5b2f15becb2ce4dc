//! Ollama-backed perception (vision model over `/api/generate`) and reasoning (chat model over
//! `/api/chat`), both in JSON mode.

use super::{PerceptionGateway, ReasoningContext, ReasoningReply, ReasoningService};
use crate::error::ServiceError;
use crate::types::{Emotion, Frame, SceneDescription};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, info};

const VISION_PROMPT: &str = "Describe this movie frame for a viewer who cannot see it well. \
Respond with JSON only: {\"caption\": one vivid sentence, \"objects\": [notable objects or people], \
\"people_count\": number of people visible, \"confidence\": 0.0 to 1.0}";

const COMPANION_PROMPT: &str = "You are CineMate, a warm and observant companion watching a movie \
with the user, who may be elderly or visually impaired. Keep remarks to one or two short sentences.

Rules:
1. Do not talk over dialogue. If dialogue is on screen and there is no question, set should_speak to false.
2. Match the tone of the scene: supportive when sad, light when funny, acknowledge tension.
3. Describe what matters visually: who did what, important objects, expressions.
4. Remind the user who characters are when they reappear.
5. If the user sounds distressed, gently suggest taking a break.

Respond with JSON only:
{\"should_speak\": true or false, \"emotion\": \"empathetic|cheerful|calm|concerned|warm|tense|neutral\", \
\"content\": \"what to say\", \"reasoning\": \"brief internal reasoning\"}";

fn client(timeout: Duration) -> Result<Client, ServiceError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ServiceError::unavailable("ollama", e))
}

/// Probe the endpoint. 401/403 surface as `Authentication`.
pub async fn health_check(base_url: &str, timeout: Duration) -> Result<(), ServiceError> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    client(timeout)?
        .get(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| ServiceError::from_http("ollama", e))?;
    info!("Ollama reachable at {}", base_url);
    Ok(())
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct VisionJson {
    #[serde(default)]
    caption: String,
    #[serde(default)]
    objects: Vec<String>,
    #[serde(default)]
    people_count: u32,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 {
    0.7
}

pub struct OllamaVision {
    client: Client,
    url: String,
    model: String,
}

impl OllamaVision {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, ServiceError> {
        Ok(Self {
            client: client(timeout)?,
            url: format!("{}/api/generate", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl PerceptionGateway for OllamaVision {
    async fn describe(&self, frame: &Frame) -> Result<SceneDescription, ServiceError> {
        let body = json!({
            "model": self.model,
            "prompt": VISION_PROMPT,
            "images": [general_purpose::STANDARD.encode(&frame.image)],
            "stream": false,
            "format": "json",
        });
        let reply: GenerateResponse = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ServiceError::from_http("vision", e))?
            .json()
            .await
            .map_err(|e| ServiceError::malformed("vision", e))?;

        let scene = parse_scene(&reply.response)?;
        debug!("Vision: {}", scene.caption);
        Ok(SceneDescription {
            timestamp: frame.timestamp,
            ..scene
        })
    }
}

fn parse_scene(raw: &str) -> Result<SceneDescription, ServiceError> {
    let raw = raw.trim();
    let (caption, objects, people_count, confidence) = match serde_json::from_str::<VisionJson>(raw) {
        Ok(v) => (v.caption, v.objects, v.people_count, v.confidence),
        // Some vision models ignore JSON mode and answer in prose.
        Err(_) if !raw.starts_with('{') => (raw.to_string(), Vec::new(), 0, 0.5),
        Err(e) => return Err(ServiceError::malformed("vision", e)),
    };
    let caption = caption.trim().to_string();
    if caption.is_empty() {
        return Err(ServiceError::malformed("vision", "empty caption"));
    }
    Ok(SceneDescription {
        caption,
        objects,
        people_count,
        confidence: confidence.clamp(0.0, 1.0),
        timestamp: tokio::time::Instant::now(),
    })
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct CompanionJson {
    #[serde(default)]
    should_speak: bool,
    #[serde(default)]
    emotion: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    reasoning: Option<String>,
}

pub struct OllamaReasoner {
    client: Client,
    url: String,
    model: String,
}

impl OllamaReasoner {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, ServiceError> {
        Ok(Self {
            client: client(timeout)?,
            url: format!("{}/api/chat", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl ReasoningService for OllamaReasoner {
    async fn reason(&self, context: &ReasoningContext) -> Result<ReasoningReply, ServiceError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": COMPANION_PROMPT},
                {"role": "user", "content": render_prompt(context)},
            ],
            "stream": false,
            "format": "json",
        });
        let reply: ChatResponse = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ServiceError::from_http("reasoning", e))?
            .json()
            .await
            .map_err(|e| ServiceError::malformed("reasoning", e))?;

        let parsed: CompanionJson = serde_json::from_str(reply.message.content.trim())
            .map_err(|e| ServiceError::malformed("reasoning", e))?;
        if let Some(reasoning) = &parsed.reasoning {
            debug!("Reasoning: {}", reasoning);
        }
        let text = parsed.content.trim().to_string();
        Ok(ReasoningReply {
            speak: parsed.should_speak && !text.is_empty(),
            text,
            emotion: Emotion::parse(&parsed.emotion),
        })
    }
}

/// The user turn of the chat: everything the model should consider, as plain text.
pub fn render_prompt(context: &ReasoningContext) -> String {
    let mut prompt = String::new();
    if let Some((current, earlier)) = context.scenes.split_last() {
        if !earlier.is_empty() {
            prompt.push_str("Earlier scenes:\n");
            for scene in earlier {
                let _ = writeln!(prompt, "- {}", scene);
            }
        }
        let _ = writeln!(prompt, "Current scene: {}", current);
    }
    let _ = writeln!(
        prompt,
        "Dialogue on screen: {}",
        if context.dialogue_active { "yes" } else { "no" }
    );
    if !context.user_comments.is_empty() {
        prompt.push_str("Recent things the user said:\n");
        for comment in &context.user_comments {
            let _ = writeln!(prompt, "- \"{}\"", comment);
        }
    }
    if !context.characters.is_empty() {
        prompt.push_str("Known characters:\n");
        for (name, description) in &context.characters {
            let _ = writeln!(prompt, "- {}: {}", name, description);
        }
    }
    if let Some(query) = &context.query {
        let _ = writeln!(prompt, "The user asks: \"{}\" (answer it, even during dialogue)", query);
    }
    if !context.draft.is_empty() {
        let _ = writeln!(prompt, "Draft remark: {}", context.draft);
    }
    prompt
}
