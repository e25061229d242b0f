use crate::config::AdaptationConfig;
use crate::detector::{EmotionLabel, EmotionSample};
use serde::{Deserialize, Serialize};

/// UI color/tone treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Default,
    Calm,
}

/// UI intent derived from the latest emotion sample. Recomputed every
/// cycle, never mutated in place, holds no state of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptationPlan {
    pub theme: Theme,
    pub show_hint: bool,
    pub simplify_text: bool,
    pub show_encouragement: bool,
    pub breathing_prompt: bool,
    pub difficulty_delta: i8,
}

impl AdaptationPlan {
    /// Whether this plan asks for the stabilized assistive mode.
    pub fn recommends_assist(&self) -> bool {
        self.simplify_text
    }

    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if self.theme == Theme::Calm {
            parts.push("calm-theme".to_string());
        }
        if self.show_hint {
            parts.push("hint".to_string());
        }
        if self.simplify_text {
            parts.push("simplify".to_string());
        }
        if self.show_encouragement {
            parts.push("encouragement".to_string());
        }
        if self.breathing_prompt {
            parts.push("breathing".to_string());
        }
        if self.difficulty_delta != 0 {
            parts.push(format!("difficulty{:+}", self.difficulty_delta));
        }
        if parts.is_empty() {
            "defaults".to_string()
        } else {
            parts.join(" ")
        }
    }
}

impl Default for AdaptationPlan {
    fn default() -> Self {
        Self {
            theme: Theme::Default,
            show_hint: false,
            simplify_text: false,
            show_encouragement: false,
            breathing_prompt: false,
            difficulty_delta: 0,
        }
    }
}

/// Map one emotion sample (plus an optional quiz-performance score) to a
/// UI plan. Pure: no clocks, no stored state, same inputs same output.
///
/// A struggling learner gets the full assist package. Mild negative affect
/// gets encouragement alone. A weak performance score lowers the bar for
/// "struggling"; frustration plus failing answers should not have to wait
/// for a textbook frown.
pub fn adapt(
    sample: &EmotionSample,
    aux_performance: Option<f64>,
    config: &AdaptationConfig,
) -> AdaptationPlan {
    let mut struggling_threshold = config.struggling_threshold;
    if let Some(performance) = aux_performance {
        if performance < config.low_performance_floor {
            struggling_threshold -= config.performance_assist_margin;
        }
    }

    match sample.label {
        EmotionLabel::Negative if sample.confidence >= struggling_threshold => AdaptationPlan {
            theme: Theme::Calm,
            show_hint: true,
            simplify_text: true,
            show_encouragement: true,
            breathing_prompt: true,
            difficulty_delta: -1,
        },
        EmotionLabel::Negative if sample.confidence >= config.encouragement_floor => {
            AdaptationPlan {
                show_encouragement: true,
                ..AdaptationPlan::default()
            }
        }
        EmotionLabel::Positive if sample.confidence >= config.engaged_threshold => AdaptationPlan {
            difficulty_delta: 1,
            ..AdaptationPlan::default()
        },
        _ => AdaptationPlan::default(),
    }
}
