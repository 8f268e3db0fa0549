//! Chat templates and the formatter that renders conversations to tokens.
//!
//! A template wraps each message in a role-specific prefix and suffix and
//! opens the assistant turn with a generation prompt. Messages are encoded
//! one at a time and concatenated, so the token count of a rendered prompt
//! is exactly the sum of its parts. Sessions rely on that to account for
//! context usage per message.

use std::fmt;
use std::sync::Arc;

use scout_engine::{Message, Role, TokenId};
use serde::{Deserialize, Serialize};

use crate::stop::{detect_stop, StopMatch};
use crate::{TokenCodec, TokenizerError, TokenizerResult};

/// Text placed around one message's content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleFormat {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
}

impl RoleFormat {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }
}

/// Role framing, generation prompt and stop markers for one model family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTemplate {
    pub name: String,
    pub system: RoleFormat,
    pub user: RoleFormat,
    pub assistant: RoleFormat,
    pub tool: RoleFormat,
    /// Opens the assistant turn the model is asked to complete.
    pub generation_prompt: String,
    /// Prepend the codec's BOS token to every prompt.
    pub add_bos: bool,
    /// Text that marks the end of the assistant turn.
    pub stop_markers: Vec<String>,
}

impl ChatTemplate {
    pub const PRESETS: &'static [&'static str] = &["chatml", "llama3", "granite", "plain"];

    pub fn role(&self, role: Role) -> &RoleFormat {
        match role {
            Role::System => &self.system,
            Role::User => &self.user,
            Role::Assistant => &self.assistant,
            Role::Tool => &self.tool,
        }
    }

    pub fn chatml() -> Self {
        let f = |role: &str| RoleFormat::new(format!("<|im_start|>{role}\n"), "<|im_end|>\n");
        Self {
            name: "chatml".into(),
            system: f("system"),
            user: f("user"),
            assistant: f("assistant"),
            tool: f("tool"),
            generation_prompt: "<|im_start|>assistant\n".into(),
            add_bos: false,
            stop_markers: vec!["<|im_end|>".into(), "<|im_start|>".into()],
        }
    }

    pub fn llama3() -> Self {
        let f = |role: &str| {
            RoleFormat::new(
                format!("<|start_header_id|>{role}<|end_header_id|>\n\n"),
                "<|eot_id|>",
            )
        };
        Self {
            name: "llama3".into(),
            system: f("system"),
            user: f("user"),
            assistant: f("assistant"),
            tool: f("ipython"),
            generation_prompt: "<|start_header_id|>assistant<|end_header_id|>\n\n".into(),
            add_bos: true,
            stop_markers: vec!["<|eot_id|>".into(), "<|start_header_id|>".into()],
        }
    }

    pub fn granite() -> Self {
        let f = |role: &str| {
            RoleFormat::new(
                format!("<|start_of_role|>{role}<|end_of_role|>"),
                "<|end_of_text|>\n",
            )
        };
        Self {
            name: "granite".into(),
            system: f("system"),
            user: f("user"),
            assistant: f("assistant"),
            tool: f("tool_response"),
            generation_prompt: "<|start_of_role|>assistant<|end_of_role|>".into(),
            add_bos: false,
            stop_markers: vec!["<|end_of_text|>".into(), "<|start_of_role|>".into()],
        }
    }

    /// Role-labelled plain text, for vocabularies without chat control tokens.
    pub fn plain() -> Self {
        Self {
            name: "plain".into(),
            system: RoleFormat::new("", "\n\n"),
            user: RoleFormat::new("User: ", "\n"),
            assistant: RoleFormat::new("Assistant: ", "\n"),
            tool: RoleFormat::new("Tool: ", "\n"),
            generation_prompt: "Assistant:".into(),
            add_bos: true,
            stop_markers: vec!["\nUser:".into(), "\nSystem:".into()],
        }
    }

    pub fn preset(name: &str) -> TokenizerResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "chatml" => Ok(Self::chatml()),
            "llama3" | "llama-3" => Ok(Self::llama3()),
            "granite" => Ok(Self::granite()),
            "plain" => Ok(Self::plain()),
            other => Err(TokenizerError::UnknownTemplate(other.to_string())),
        }
    }

    /// Pick a preset from the control tokens the vocabulary defines.
    pub fn detect(codec: &dyn TokenCodec) -> Self {
        let template = if codec.token_id("<|im_start|>").is_some() {
            Self::chatml()
        } else if codec.token_id("<|start_header_id|>").is_some() {
            Self::llama3()
        } else if codec.token_id("<|start_of_role|>").is_some() {
            Self::granite()
        } else {
            Self::plain()
        };
        tracing::debug!(template = %template.name, "detected chat template");
        template
    }

    /// Render messages to text. Only the leading system message is passed
    /// through `preamble`.
    pub fn render_text(
        &self,
        messages: &[Message],
        preamble: &SystemPreamble,
        add_generation_prompt: bool,
    ) -> String {
        let (system, rest) = split_system(messages);
        let mut out = String::new();
        if let Some(content) = preamble.produce(system.map(|m| m.text()).as_deref()) {
            out.push_str(&self.system.prefix);
            out.push_str(&content);
            out.push_str(&self.system.suffix);
        }
        for msg in rest {
            let format = self.role(msg.role);
            out.push_str(&format.prefix);
            out.push_str(&msg.text());
            out.push_str(&format.suffix);
        }
        if add_generation_prompt {
            out.push_str(&self.generation_prompt);
        }
        out
    }
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self::chatml()
    }
}

fn split_system(messages: &[Message]) -> (Option<&Message>, &[Message]) {
    match messages.split_first() {
        Some((first, rest)) if first.role == Role::System => (Some(first), rest),
        _ => (None, messages),
    }
}

/// Template configuration: a preset (or auto-detection) with per-field overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Preset name. `None` detects one from the vocabulary.
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub system: Option<RoleFormat>,
    #[serde(default)]
    pub user: Option<RoleFormat>,
    #[serde(default)]
    pub assistant: Option<RoleFormat>,
    #[serde(default)]
    pub tool: Option<RoleFormat>,
    #[serde(default)]
    pub generation_prompt: Option<String>,
    #[serde(default)]
    pub add_bos: Option<bool>,
    /// Appended to the preset's stop markers.
    #[serde(default)]
    pub stop_markers: Vec<String>,
}

impl TemplateConfig {
    pub fn preset(name: impl Into<String>) -> Self {
        Self {
            preset: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn resolve(&self, codec: &dyn TokenCodec) -> TokenizerResult<ChatTemplate> {
        let mut template = match &self.preset {
            Some(name) => ChatTemplate::preset(name)?,
            None => ChatTemplate::detect(codec),
        };
        let overrides = [
            (&self.system, &mut template.system),
            (&self.user, &mut template.user),
            (&self.assistant, &mut template.assistant),
            (&self.tool, &mut template.tool),
        ];
        for (value, slot) in overrides {
            if let Some(format) = value {
                *slot = format.clone();
            }
        }
        if let Some(prompt) = &self.generation_prompt {
            template.generation_prompt = prompt.clone();
        }
        if let Some(add_bos) = self.add_bos {
            template.add_bos = add_bos;
        }
        for marker in &self.stop_markers {
            if !template.stop_markers.contains(marker) {
                template.stop_markers.push(marker.clone());
            }
        }
        Ok(template)
    }
}

type PreambleFn = dyn Fn(Option<&str>) -> Option<String> + Send + Sync;

/// Produces the system block content from the conversation's own system
/// message (if any). Resolved once per render.
#[derive(Clone)]
pub struct SystemPreamble(Arc<PreambleFn>);

impl SystemPreamble {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Option<&str>) -> Option<String> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Use the conversation's system message unchanged.
    pub fn passthrough() -> Self {
        Self::new(|system| system.map(str::to_string))
    }

    /// Put `text` ahead of the conversation's system message.
    pub fn prepend(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |system| match system {
            Some(s) if !s.is_empty() => Some(format!("{text}\n\n{s}")),
            _ => Some(text.clone()),
        })
    }

    pub fn produce(&self, system: Option<&str>) -> Option<String> {
        (self.0)(system)
    }
}

impl Default for SystemPreamble {
    fn default() -> Self {
        Self::passthrough()
    }
}

impl fmt::Debug for SystemPreamble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SystemPreamble(..)")
    }
}

/// Renders conversations into the token sequence a model expects.
#[derive(Clone)]
pub struct ChatFormatter {
    codec: Arc<dyn TokenCodec>,
    template: ChatTemplate,
    preamble: SystemPreamble,
}

impl fmt::Debug for ChatFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatFormatter")
            .field("template", &self.template.name)
            .field("vocab_size", &self.codec.vocab_size())
            .finish()
    }
}

impl ChatFormatter {
    pub fn new(codec: Arc<dyn TokenCodec>, template: ChatTemplate) -> Self {
        Self {
            codec,
            template,
            preamble: SystemPreamble::default(),
        }
    }

    pub fn with_preamble(mut self, preamble: SystemPreamble) -> Self {
        self.preamble = preamble;
        self
    }

    pub fn set_preamble(&mut self, preamble: SystemPreamble) {
        self.preamble = preamble;
    }

    pub fn template(&self) -> &ChatTemplate {
        &self.template
    }

    pub fn codec(&self) -> &Arc<dyn TokenCodec> {
        &self.codec
    }

    /// Render a complete prompt: BOS, system block, every message and the
    /// generation prompt. A leading system message goes through the preamble.
    pub fn render(&self, messages: &[Message]) -> TokenizerResult<Vec<TokenId>> {
        let (system, rest) = split_system(messages);
        let mut tokens = self.encode_header();
        tokens.extend(self.encode_system(system)?);
        for msg in rest {
            tokens.extend(self.encode_message(msg)?);
        }
        tokens.extend(self.encode_generation_prompt()?);
        Ok(tokens)
    }

    /// Render to text, mainly for display and debugging.
    pub fn render_text(&self, messages: &[Message], add_generation_prompt: bool) -> String {
        self.template
            .render_text(messages, &self.preamble, add_generation_prompt)
    }

    /// BOS token if the template asks for one.
    pub fn encode_header(&self) -> Vec<TokenId> {
        match (self.template.add_bos, self.codec.bos_token()) {
            (true, Some(bos)) => vec![bos],
            _ => Vec::new(),
        }
    }

    /// The system block after applying the preamble. Empty when the
    /// preamble produces nothing.
    pub fn encode_system(&self, system: Option<&Message>) -> TokenizerResult<Vec<TokenId>> {
        let base = system.map(Message::text);
        match self.preamble.produce(base.as_deref()) {
            Some(content) => self.encode_framed(&self.template.system, &content),
            None => Ok(Vec::new()),
        }
    }

    /// One message with its role framing. Content is encoded without
    /// special-token recognition.
    pub fn encode_message(&self, msg: &Message) -> TokenizerResult<Vec<TokenId>> {
        self.encode_framed(self.template.role(msg.role), &msg.text())
    }

    pub fn encode_generation_prompt(&self) -> TokenizerResult<Vec<TokenId>> {
        self.codec.encode(&self.template.generation_prompt)
    }

    fn encode_framed(&self, format: &RoleFormat, content: &str) -> TokenizerResult<Vec<TokenId>> {
        let mut tokens = self.codec.encode(&format.prefix)?;
        tokens.extend(self.codec.encode_ordinary(content)?);
        tokens.extend(self.codec.encode(&format.suffix)?);
        Ok(tokens)
    }

    /// Template stop markers followed by `extra`, without duplicates.
    pub fn stop_sequences(&self, extra: &[String]) -> Vec<String> {
        let mut stops = self.template.stop_markers.clone();
        for s in extra {
            if !s.is_empty() && !stops.contains(s) {
                stops.push(s.clone());
            }
        }
        stops
    }

    pub fn detect_stop(&self, text: &str, extra: &[String]) -> Option<StopMatch> {
        detect_stop(text, &self.stop_sequences(extra))
    }
}
