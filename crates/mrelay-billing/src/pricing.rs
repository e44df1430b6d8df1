//! Model price table.
//!
//! Quota units are the internal billing currency: `QUOTA_PER_UNIT` quota
//! equals one dollar of the base price. A request costs
//! `prompt × model_ratio × group_ratio + completion × model_ratio ×
//! completion_ratio × group_ratio`, unless the model carries a per-request
//! fixed price.

use std::collections::HashMap;

use mrelay_storage::TaskPlatform;
use serde::Deserialize;

pub const QUOTA_PER_UNIT: f64 = 500_000.0;

#[derive(Debug, Clone)]
pub struct PriceTable {
    model_ratio: HashMap<String, f64>,
    completion_ratio: HashMap<String, f64>,
    /// Per-request dollar price; overrides token-based billing entirely.
    fixed_price: HashMap<String, f64>,
    group_ratio: HashMap<String, f64>,
    default_model_ratio: f64,
    default_completion_ratio: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriceOverrides {
    #[serde(default)]
    pub model_ratio: HashMap<String, f64>,
    #[serde(default)]
    pub completion_ratio: HashMap<String, f64>,
    #[serde(default)]
    pub fixed_price: HashMap<String, f64>,
    #[serde(default)]
    pub group_ratio: HashMap<String, f64>,
}

impl Default for PriceTable {
    fn default() -> Self {
        let mut model_ratio = HashMap::new();
        let mut completion_ratio = HashMap::new();

        // Ratios are dollars per 1M prompt tokens divided by 2 (the historical
        // gpt-3.5 anchor); completion ratios are output/input price factors.
        for (model, ratio, completion) in [
            ("gpt-3.5-turbo", 0.25, 3.0),
            ("gpt-4", 15.0, 2.0),
            ("gpt-4-turbo", 5.0, 3.0),
            ("gpt-4o", 1.25, 4.0),
            ("gpt-4o-mini", 0.075, 4.0),
            ("o1", 7.5, 4.0),
            ("o3-mini", 0.55, 4.0),
            ("claude-3-5-haiku", 0.4, 5.0),
            ("claude-3-5-sonnet", 1.5, 5.0),
            ("claude-3-7-sonnet", 1.5, 5.0),
            ("claude-3-opus", 7.5, 5.0),
            ("gemini-1.5-pro", 0.625, 4.0),
            ("gemini-1.5-flash", 0.0375, 4.0),
            ("gemini-2.0-flash", 0.05, 4.0),
            ("deepseek-chat", 0.135, 4.0),
            ("deepseek-reasoner", 0.275, 4.0),
            ("moonshot-v1-8k", 0.006, 1.0),
            ("glm-4", 0.05, 1.0),
            ("qwen-turbo", 0.015, 3.0),
            ("qwen-plus", 0.04, 3.0),
            ("ernie-4.0-8k", 0.06, 3.0),
            ("command-r", 0.075, 4.0),
            ("command-r-plus", 1.25, 4.0),
            ("mistral-large-latest", 1.0, 3.0),
            ("text-embedding-3-small", 0.01, 1.0),
            ("text-embedding-3-large", 0.065, 1.0),
            ("omni-moderation-latest", 0.0, 1.0),
        ] {
            model_ratio.insert(model.to_string(), ratio);
            completion_ratio.insert(model.to_string(), completion);
        }

        let mut fixed_price = HashMap::new();
        fixed_price.insert("dall-e-3".to_string(), 0.04);
        fixed_price.insert("dall-e-2".to_string(), 0.02);

        let mut group_ratio = HashMap::new();
        group_ratio.insert("default".to_string(), 1.0);
        group_ratio.insert("vip".to_string(), 0.8);

        Self {
            model_ratio,
            completion_ratio,
            fixed_price,
            group_ratio,
            default_model_ratio: 2.5,
            default_completion_ratio: 1.0,
        }
    }
}

impl PriceTable {
    pub fn apply_overrides(&mut self, overrides: PriceOverrides) {
        self.model_ratio.extend(overrides.model_ratio);
        self.completion_ratio.extend(overrides.completion_ratio);
        self.fixed_price.extend(overrides.fixed_price);
        self.group_ratio.extend(overrides.group_ratio);
    }

    /// Exact name first, then the longest registered prefix. "-latest" and
    /// dated snapshots bill as their family that way.
    fn lookup(map: &HashMap<String, f64>, model: &str) -> Option<f64> {
        if let Some(value) = map.get(model) {
            return Some(*value);
        }
        map.iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, value)| *value)
    }

    pub fn model_ratio(&self, model: &str) -> f64 {
        Self::lookup(&self.model_ratio, model).unwrap_or(self.default_model_ratio)
    }

    pub fn completion_ratio(&self, model: &str) -> f64 {
        Self::lookup(&self.completion_ratio, model).unwrap_or(self.default_completion_ratio)
    }

    pub fn fixed_price(&self, model: &str) -> Option<f64> {
        Self::lookup(&self.fixed_price, model)
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratio.get(group).copied().unwrap_or(1.0)
    }

    /// Reserved quota for an async task submit, by platform and action.
    pub fn task_action_quota(&self, platform: TaskPlatform, action: &str) -> i64 {
        let dollars = match platform {
            TaskPlatform::Midjourney => match action {
                "imagine" | "blend" | "modal" => 0.1,
                "upscale" | "change" | "reroll" | "zoom" | "pan" => 0.05,
                "describe" | "shorten" => 0.025,
                _ => 0.1,
            },
            TaskPlatform::Suno => match action {
                "music" => 0.1,
                "lyrics" => 0.01,
                _ => 0.1,
            },
        };
        (dollars * QUOTA_PER_UNIT).round() as i64
    }
}

/// Token-based quota for a finished request.
pub fn usage_quota(
    prompt_tokens: i64,
    completion_tokens: i64,
    model_ratio: f64,
    completion_ratio: f64,
    group_ratio: f64,
) -> i64 {
    let prompt = prompt_tokens as f64 * model_ratio;
    let completion = completion_tokens as f64 * model_ratio * completion_ratio;
    let quota = (prompt + completion) * group_ratio;
    // A billable request never settles at zero when a ratio is in play.
    if quota < 1.0 && model_ratio > 0.0 && (prompt_tokens + completion_tokens) > 0 {
        1
    } else {
        quota.round() as i64
    }
}

pub fn fixed_quota(dollars: f64, group_ratio: f64) -> i64 {
    (dollars * QUOTA_PER_UNIT * group_ratio).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matching_bills_snapshots_as_family() {
        let table = PriceTable::default();
        assert_eq!(
            table.model_ratio("gpt-4o-2024-08-06"),
            table.model_ratio("gpt-4o")
        );
        // gpt-4o-mini is a longer prefix than gpt-4o, so it must win.
        assert_eq!(
            table.model_ratio("gpt-4o-mini-2024-07-18"),
            table.model_ratio("gpt-4o-mini")
        );
    }

    #[test]
    fn unknown_model_uses_default_ratio() {
        let table = PriceTable::default();
        assert_eq!(table.model_ratio("some-new-model"), 2.5);
    }

    #[test]
    fn usage_quota_rounds_and_floors_at_one() {
        assert_eq!(usage_quota(1, 1, 0.5, 1.0, 1.0), 1);
        assert_eq!(usage_quota(1000, 1000, 0.5, 2.0, 1.0), 1500);
        assert_eq!(usage_quota(0, 0, 0.5, 1.0, 1.0), 0);
        // Free models settle at zero.
        assert_eq!(usage_quota(100, 100, 0.0, 1.0, 1.0), 0);
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut table = PriceTable::default();
        table.apply_overrides(PriceOverrides {
            model_ratio: HashMap::from([("gpt-4o".to_string(), 9.0)]),
            ..Default::default()
        });
        assert_eq!(table.model_ratio("gpt-4o"), 9.0);
    }
}
