use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Aspect ratios the generation endpoint is documented to accept. Other
/// strings are forwarded verbatim; the provider owns the accepted set.
pub const ASPECT_RATIOS: [&str; 8] = [
    "3:4", "1:1", "4:3", "16:9", "21:9", "9:16", "2.35:1", "4:5",
];

pub const STEP_PRESETS: [u32; 4] = [20, 30, 40, 50];

pub const MIN_STRENGTH: f64 = 0.5;
pub const MAX_STRENGTH: f64 = 2.0;
pub const MIN_STEPS: u32 = 1;
pub const MAX_STEPS: u32 = 50;

/// One portrait generation. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub finetune_id: String,
    pub strength: f64,
    pub aspect_ratio: String,
    pub steps: u32,
    pub raw: bool,
}

impl GenerationRequest {
    pub fn with_defaults(prompt: impl Into<String>, finetune_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            finetune_id: finetune_id.into(),
            strength: 1.2,
            aspect_ratio: "1:1".to_string(),
            steps: 30,
            raw: true,
        }
    }

    /// Clamp numeric fields into provider range and flag non-canonical
    /// values. Aspect-ratio strings are never rewritten, only warned about.
    pub fn normalize(mut self, warnings: &mut Vec<String>) -> anyhow::Result<GenerationRequest> {
        if self.prompt.trim().is_empty() {
            anyhow::bail!("prompt is empty");
        }
        if self.finetune_id.trim().is_empty() {
            anyhow::bail!("finetune id is empty");
        }

        let clamped_strength = self.strength.clamp(MIN_STRENGTH, MAX_STRENGTH);
        if (clamped_strength - self.strength).abs() > f64::EPSILON {
            push_unique_warning(
                warnings,
                format!("strength clamped to {clamped_strength} ({MIN_STRENGTH}..{MAX_STRENGTH})"),
            );
            self.strength = clamped_strength;
        }

        let clamped_steps = self.steps.clamp(MIN_STEPS, MAX_STEPS);
        if clamped_steps != self.steps {
            push_unique_warning(warnings, format!("steps clamped to {clamped_steps}"));
            self.steps = clamped_steps;
        }
        if !STEP_PRESETS.contains(&self.steps) {
            push_unique_warning(
                warnings,
                format!("steps {} is off-preset (expected one of {STEP_PRESETS:?})", self.steps),
            );
        }

        let ratio = self.aspect_ratio.trim();
        if ratio.is_empty() {
            anyhow::bail!("aspect ratio is empty");
        }
        if !ASPECT_RATIOS.contains(&ratio) {
            push_unique_warning(
                warnings,
                format!("aspect ratio '{ratio}' is not in the documented set; sending as-is"),
            );
        }

        Ok(self)
    }

    pub fn starts_with_trigger(&self, trigger_word: &str) -> bool {
        self.prompt
            .trim_start()
            .to_ascii_lowercase()
            .starts_with(&trigger_word.to_ascii_lowercase())
    }

    /// Wire body for the generation endpoint. Key names and the verbatim
    /// aspect-ratio string are part of the provider contract.
    pub fn payload(&self) -> Map<String, Value> {
        map_object(json!({
            "prompt": self.prompt,
            "finetune_id": self.finetune_id,
            "finetune_strength": self.strength,
            "aspect_ratio": self.aspect_ratio,
            "steps": self.steps,
            "raw": self.raw,
        }))
    }
}

/// One fine-tuning upload. Hyperparameters default to the values the
/// training endpoint was tuned against; the archive bytes travel base64
/// encoded inside the JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineTuneRequest {
    pub finetune_comment: String,
    pub trigger_word: String,
    pub iterations: u32,
    pub mode: String,
    pub learning_rate: f64,
    pub captioning: bool,
    pub priority: String,
    pub lora_rank: u32,
    pub finetune_type: String,
}

impl FineTuneRequest {
    pub fn with_defaults(
        finetune_comment: impl Into<String>,
        trigger_word: impl Into<String>,
    ) -> Self {
        Self {
            finetune_comment: finetune_comment.into(),
            trigger_word: trigger_word.into(),
            iterations: 300,
            mode: "character".to_string(),
            learning_rate: 0.00001,
            captioning: true,
            priority: "quality".to_string(),
            lora_rank: 32,
            finetune_type: "full".to_string(),
        }
    }

    /// Wire body for the training endpoint. `file_data` is the base64 of
    /// the exact archive bytes, unmodified.
    pub fn payload(&self, archive_bytes: &[u8]) -> Map<String, Value> {
        map_object(json!({
            "finetune_comment": self.finetune_comment,
            "trigger_word": self.trigger_word,
            "file_data": BASE64.encode(archive_bytes),
            "iterations": self.iterations,
            "mode": self.mode,
            "learning_rate": self.learning_rate,
            "captioning": self.captioning,
            "priority": self.priority,
            "lora_rank": self.lora_rank,
            "finetune_type": self.finetune_type,
        }))
    }
}

pub fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

pub fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
