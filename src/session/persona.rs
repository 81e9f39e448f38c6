use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest knowledge context passed to the voice service, in characters
pub const MAX_CONTEXT_CHARS: usize = 2000;

/// Voices offered by the voice service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum VoiceId {
    #[default]
    Puck,
    Charon,
    Kore,
    Fenrir,
    Aoede,
}

impl VoiceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceId::Puck => "Puck",
            VoiceId::Charon => "Charon",
            VoiceId::Kore => "Kore",
            VoiceId::Fenrir => "Fenrir",
            VoiceId::Aoede => "Aoede",
        }
    }
}

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tutor personality sliders, each 0–100
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaTraits {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_trait")]
    pub strictness: u8,
    #[serde(default = "default_trait")]
    pub humor: u8,
    #[serde(default = "default_trait")]
    pub verbosity: u8,
    /// Material the tutor should draw on (e.g. the student's notes)
    #[serde(default)]
    pub knowledge_context: Option<String>,
}

fn default_trait() -> u8 {
    50
}

impl Default for PersonaTraits {
    fn default() -> Self {
        Self {
            name: None,
            strictness: default_trait(),
            humor: default_trait(),
            verbosity: default_trait(),
            knowledge_context: None,
        }
    }
}

fn describe(value: u8, low: &str, mid: &str, high: &str) -> String {
    match value.min(100) {
        0..=33 => low.to_string(),
        34..=66 => mid.to_string(),
        _ => high.to_string(),
    }
}

/// Voice plus the behavior instruction sent in the handshake
///
/// Immutable once built; changing either part means a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaConfig {
    voice: VoiceId,
    instruction: String,
}

impl PersonaConfig {
    pub fn new(voice: VoiceId, instruction: impl Into<String>) -> Self {
        Self {
            voice,
            instruction: instruction.into(),
        }
    }

    /// Derive the instruction from personality sliders
    pub fn from_traits(voice: VoiceId, traits: &PersonaTraits) -> Self {
        let mut instruction = match &traits.name {
            Some(name) if !name.trim().is_empty() => {
                format!("You are {}, a friendly voice tutor.", name.trim())
            }
            _ => "You are a friendly voice tutor.".to_string(),
        };

        instruction.push(' ');
        instruction.push_str(&describe(
            traits.strictness,
            "Be relaxed and encouraging; let small mistakes slide.",
            "Correct mistakes when they matter, kindly.",
            "Hold the student to a high standard and correct every mistake.",
        ));
        instruction.push(' ');
        instruction.push_str(&describe(
            traits.humor,
            "Keep a serious, focused tone.",
            "Use light humor now and then.",
            "Be playful and make the student laugh.",
        ));
        instruction.push(' ');
        instruction.push_str(&describe(
            traits.verbosity,
            "Answer in one or two short sentences.",
            "Give answers of moderate length.",
            "Explain thoroughly, with examples.",
        ));

        if let Some(context) = traits.knowledge_context.as_deref().map(str::trim) {
            if !context.is_empty() {
                let context: String = context.chars().take(MAX_CONTEXT_CHARS).collect();
                instruction.push_str("\n\nBase your answers on the following material:\n");
                instruction.push_str(&context);
            }
        }

        Self { voice, instruction }
    }

    pub fn voice(&self) -> VoiceId {
        self.voice
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self::from_traits(VoiceId::default(), &PersonaTraits::default())
    }
}
