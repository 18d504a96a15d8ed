//! Response generator adapter: transcript history + new candidate text in,
//! interviewer reply out.
//!
//! Pure request/response like the STT boundary. The orchestrator snapshots
//! the history before calling and appends the reply after; no lock is held
//! across the call.

use crate::error::{VoiceError, VoiceResult};
use crate::state::{Speaker, Turn};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default system prompt for the interviewer persona.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly but rigorous technical interviewer \
for a software engineering role. Ask one question at a time, follow up on the candidate's \
answers, and keep replies short and conversational.";

/// Canned opening used when the generator cannot produce one.
pub const FALLBACK_OPENING: &str = "Hello! Welcome to your technical interview. Could you \
start by introducing yourself - your name, background, and experience level with programming?";

/// Generation knobs consumed by API-backed generators.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Token budget for one reply (default: 150).
    pub max_reply_tokens: u32,

    /// Sampling temperature (default: 0.7).
    pub temperature: f32,

    /// How many recent turns to send as context (default: 8).
    pub context_turns: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_reply_tokens: 150,
            temperature: 0.7,
            context_turns: 8,
        }
    }
}

/// Backend producing interviewer replies.
pub trait ResponseGenerator: Send + Sync {
    /// Greeting that opens the interview (the one place consecutive
    /// interviewer turns are legal).
    fn opening(&self) -> VoiceResult<String>;

    /// Next reply given bounded history and the latest candidate text.
    fn reply(&self, history: &[Turn], candidate_text: &str) -> VoiceResult<String>;
}

/// Build the chat-completions message list from transcript turns.
/// Exposed within the crate so the mapping is testable on its own.
pub(crate) fn build_messages(
    system_prompt: &str,
    history: &[Turn],
    candidate_text: &str,
) -> Vec<serde_json::Value> {
    let mut messages = vec![json!({ "role": "system", "content": system_prompt })];
    for turn in history {
        let role = match turn.speaker {
            Speaker::Candidate => "user",
            Speaker::Interviewer => "assistant",
        };
        messages.push(json!({ "role": role, "content": turn.text }));
    }
    // The latest candidate turn may already be in history; only add it when
    // the caller passes it separately.
    if !candidate_text.trim().is_empty() {
        messages.push(json!({ "role": "user", "content": candidate_text }));
    }
    messages
}

/// Scripted generator: fixed opening, queued replies, then a default nudge.
#[derive(Debug)]
pub struct ScriptedGenerator {
    opening: String,
    replies: Mutex<VecDeque<String>>,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self {
            opening: FALLBACK_OPENING.to_string(),
            replies: Mutex::new(VecDeque::new()),
        }
    }
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            opening: FALLBACK_OPENING.to_string(),
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
        }
    }

    pub fn with_opening(mut self, opening: impl Into<String>) -> Self {
        self.opening = opening.into();
        self
    }
}

impl ResponseGenerator for ScriptedGenerator {
    fn opening(&self) -> VoiceResult<String> {
        Ok(self.opening.clone())
    }

    fn reply(&self, _history: &[Turn], _candidate_text: &str) -> VoiceResult<String> {
        let mut replies = self.replies.lock().expect("scripted generator lock poisoned");
        Ok(replies
            .pop_front()
            .unwrap_or_else(|| "Interesting. Could you go deeper on that?".to_string()))
    }
}

/// Production generator: OpenAI-compatible chat completions API.
/// Configured via `LLM_API_URL` (default https://api.openai.com/v1),
/// `LLM_API_KEY`, and `LLM_MODEL` (default gpt-4o-mini).
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
    config: GeneratorConfig,
    client: reqwest::blocking::Client,
}

impl OpenAiGenerator {
    pub fn from_env(config: GeneratorConfig) -> VoiceResult<Self> {
        let base_url = std::env::var("LLM_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("generator requires LLM_API_KEY or OPENAI_API_KEY".to_string())
            })?;
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        Self::new(base_url, api_key, model, config)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        config: GeneratorConfig,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::GenerationFailed(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            config,
            client,
        })
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn complete(&self, messages: Vec<serde_json::Value>, max_tokens: u32) -> VoiceResult<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": self.config.temperature,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| VoiceError::GenerationFailed(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::GenerationFailed(format!(
                "LLM API error {}: {}",
                status, body
            )));
        }
        let json: serde_json::Value = res
            .json()
            .map_err(|e| VoiceError::GenerationFailed(e.to_string()))?;
        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(VoiceError::GenerationFailed(
                "LLM returned an empty reply".to_string(),
            ));
        }
        Ok(text)
    }
}

impl ResponseGenerator for OpenAiGenerator {
    fn opening(&self) -> VoiceResult<String> {
        let messages = vec![
            json!({ "role": "system", "content": self.system_prompt }),
            json!({ "role": "user", "content": "This is the start of a technical interview. \
Greet the candidate warmly and ask them to introduce themselves - their name, background, \
experience level, and areas of interest. Keep it conversational and welcoming." }),
        ];
        self.complete(messages, 100)
    }

    fn reply(&self, history: &[Turn], candidate_text: &str) -> VoiceResult<String> {
        // History arrives already bounded by the orchestrator; bound again
        // here so the adapter honors its own context budget regardless.
        let start = history.len().saturating_sub(self.config.context_turns);
        let messages = build_messages(&self.system_prompt, &history[start..], candidate_text);
        self.complete(messages, self.config.max_reply_tokens)
    }
}

/// Create the best available generator from environment: OpenAiGenerator when
/// a key is present, otherwise a scripted stand-in.
pub fn create_best_generator(config: GeneratorConfig) -> Box<dyn ResponseGenerator> {
    if let Ok(gen) = OpenAiGenerator::from_env(config) {
        return Box::new(gen);
    }
    Box::new(ScriptedGenerator::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn turn(index: u64, speaker: Speaker, text: &str) -> Turn {
        Turn {
            index,
            speaker,
            text: text.to_string(),
            at: Utc::now(),
        }
    }

    #[test]
    fn messages_map_speakers_to_roles() {
        let history = vec![
            turn(0, Speaker::Interviewer, "welcome"),
            turn(1, Speaker::Candidate, "hi, I'm Sam"),
        ];
        let messages = build_messages("prompt", &history, "tell me about arrays");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[3]["content"], "tell me about arrays");
    }

    #[test]
    fn blank_candidate_text_is_omitted() {
        let messages = build_messages("prompt", &[], "   ");
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn scripted_generator_pops_then_nudges() {
        let gen = ScriptedGenerator::with_replies(["first reply"]);
        assert_eq!(gen.reply(&[], "x").unwrap(), "first reply");
        assert!(gen.reply(&[], "y").unwrap().contains("deeper"));
        assert_eq!(gen.opening().unwrap(), FALLBACK_OPENING);
    }
}
