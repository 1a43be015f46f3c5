use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::PromptVariant;

const DEFAULT_MAX_VARIANTS: usize = 512;
const HARD_MAX_VARIANTS: usize = 8192;

/// How replacements are drawn from a rule's value list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawMode {
    /// One uniformly random value per application.
    #[default]
    Random,
    /// One value per application, cycling through the list across calls.
    #[serde(alias = "round_robin")]
    Sequential,
    /// Every value, multiplying the variant set (grid behavior).
    #[serde(alias = "grid", alias = "all")]
    Fanout,
}

/// One search/replace rule: every occurrence of `search` is replaced with a
/// drawn value from `replacements`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrRule {
    pub search: String,
    pub replacements: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SrConfig {
    pub enabled: bool,
    pub mode: DrawMode,
    pub rules: Vec<SrRule>,
}

/// A wildcard token (e.g. `__color__`) and its value pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WildcardToken {
    pub token: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WildcardConfig {
    pub enabled: bool,
    pub mode: DrawMode,
    pub tokens: Vec<WildcardToken>,
}

/// How matrix combinations are consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixMode {
    /// One variant per combination, all in one call.
    #[default]
    #[serde(alias = "grid", alias = "all")]
    Fanout,
    /// Exactly one combination per call, advancing with wraparound.
    #[serde(alias = "sequential", alias = "round_robin")]
    Rotate,
}

/// How the matrix `base_prompt` combines with the incoming prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// `base_prompt` replaces the incoming prompt entirely.
    #[default]
    Replace,
    /// `base_prompt` is appended with a `", "` separator.
    Append,
    /// `base_prompt` is prepended with a `", "` separator.
    Prepend,
}

/// One matrix axis: the placeholder `[[name]]` and its value list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixSlot {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    pub enabled: bool,
    pub mode: MatrixMode,
    /// Template the slot placeholders live in; empty = use the incoming
    /// prompt as-is.
    pub base_prompt: String,
    pub prompt_mode: PromptMode,
    pub slots: Vec<MatrixSlot>,
    /// Upper bound on combinations built; 0 = unlimited (still subject to
    /// the overall variant cap in fanout mode).
    pub limit: usize,
}

/// Configuration for all three transformation phases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomizerConfig {
    pub enabled: bool,
    /// Overall cap on variants per `generate` call; 0 = use the default.
    pub max_variants: usize,
    pub prompt_sr: SrConfig,
    pub wildcards: WildcardConfig,
    pub matrix: MatrixConfig,
}

/// Expands one prompt template into concrete prompt variants.
///
/// Three phases apply in fixed order per variant: prompt search/replace,
/// wildcard substitution, then matrix expansion. Fanout draw modes multiply
/// the variant set; sequential modes keep one persisted counter per
/// rule/token, advanced only when the rule actually applied, so rotation
/// survives across `generate` calls. Random draws consume the injected RNG;
/// tests seed it for reproducible output.
pub struct PromptRandomizer {
    enabled: bool,
    max_variants: usize,
    rng: StdRng,
    sr_mode: DrawMode,
    sr_rules: Vec<SrRule>,
    sr_indices: Vec<usize>,
    wildcard_mode: DrawMode,
    wildcard_tokens: Vec<WildcardToken>,
    wildcard_indices: HashMap<String, usize>,
    matrix_enabled: bool,
    matrix_mode: MatrixMode,
    matrix_base_prompt: String,
    matrix_prompt_mode: PromptMode,
    matrix_combos: Vec<Vec<(String, String)>>,
    matrix_index: usize,
}

impl PromptRandomizer {
    pub fn new(config: &RandomizerConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Deterministic construction for tests and reproducible runs.
    pub fn with_seed(config: &RandomizerConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &RandomizerConfig, rng: StdRng) -> Self {
        let max_variants = resolve_max_variants(config.max_variants);

        let sr_rules: Vec<SrRule> = if config.prompt_sr.enabled {
            config
                .prompt_sr
                .rules
                .iter()
                .filter(|r| !r.search.is_empty() && !r.replacements.is_empty())
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let wildcard_tokens: Vec<WildcardToken> = if config.wildcards.enabled {
            config
                .wildcards
                .tokens
                .iter()
                .filter(|t| !t.token.is_empty() && !t.values.is_empty())
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let matrix_slots: Vec<MatrixSlot> = if config.matrix.enabled {
            config
                .matrix
                .slots
                .iter()
                .filter(|s| !s.name.is_empty() && !s.values.is_empty())
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let matrix_limit = resolve_matrix_limit(
            &matrix_slots,
            config.matrix.mode,
            config.matrix.limit,
            max_variants,
        );
        let matrix_combos = build_matrix_combos(&matrix_slots, matrix_limit);
        if !matrix_combos.is_empty() {
            info!(
                "randomizer matrix: mode={:?} slots={} combos={}",
                config.matrix.mode,
                matrix_slots.len(),
                matrix_combos.len()
            );
        }

        let sr_indices = vec![0; sr_rules.len()];
        let wildcard_indices = wildcard_tokens
            .iter()
            .map(|t| (t.token.clone(), 0))
            .collect();

        Self {
            enabled: config.enabled,
            max_variants,
            rng,
            sr_mode: config.prompt_sr.mode,
            sr_rules,
            sr_indices,
            wildcard_mode: config.wildcards.mode,
            wildcard_tokens,
            wildcard_indices,
            matrix_enabled: config.matrix.enabled && !matrix_slots.is_empty(),
            matrix_mode: config.matrix.mode,
            matrix_base_prompt: config.matrix.base_prompt.clone(),
            matrix_prompt_mode: config.matrix.prompt_mode,
            matrix_combos,
            matrix_index: 0,
        }
    }

    /// Expand `prompt_text` into one or more variants. Never empty: identity
    /// passthrough when disabled or when nothing matched.
    pub fn generate(&mut self, prompt_text: &str) -> Vec<PromptVariant> {
        if !self.enabled {
            return vec![PromptVariant::identity(prompt_text)];
        }

        let working = self.working_prompt(prompt_text);
        let combos = self.combos_for_call();
        let sr_variants = self.expand_prompt_sr(&working);

        let mut variants: Vec<PromptVariant> = Vec::new();
        let mut truncated = false;
        'outer: for (sr_text, sr_labels) in sr_variants {
            for (text, labels) in self.expand_wildcards(&sr_text, sr_labels) {
                for combo in &combos {
                    let mut labels = labels.clone();
                    let text = apply_matrix_combo(&text, combo, &mut labels);
                    let label = if labels.is_empty() {
                        None
                    } else {
                        Some(labels.join("; "))
                    };
                    variants.push(PromptVariant { text, label });
                    if variants.len() >= self.max_variants {
                        truncated = true;
                        break 'outer;
                    }
                }
            }
        }

        if truncated {
            warn!(
                "randomization hit the {} variant cap; truncating. Raise \
                 `randomization.max_variants` or reduce expansion scope.",
                self.max_variants
            );
        }

        // Order-preserving dedup on (text, label).
        let mut seen: HashSet<(String, Option<String>)> = HashSet::new();
        let mut deduped: Vec<PromptVariant> = Vec::new();
        for variant in variants {
            if seen.insert((variant.text.clone(), variant.label.clone())) {
                deduped.push(variant);
            }
        }

        if deduped.is_empty() {
            deduped.push(PromptVariant::identity(prompt_text));
        }
        deduped
    }

    /// How many matrix combinations were pre-computed.
    pub fn matrix_combo_count(&self) -> usize {
        self.matrix_combos.len()
    }

    /// Combine the matrix `base_prompt` with the incoming prompt. Append and
    /// prepend skip the merge when the prompt already carries the base text
    /// at the matching end.
    fn working_prompt(&self, prompt_text: &str) -> String {
        if !self.matrix_enabled || self.matrix_base_prompt.is_empty() {
            return prompt_text.to_string();
        }
        let base = &self.matrix_base_prompt;
        let base_norm = base.trim().to_lowercase();
        let prompt_norm = prompt_text.trim().to_lowercase();
        match self.matrix_prompt_mode {
            PromptMode::Replace => base.clone(),
            PromptMode::Append => {
                if prompt_norm.ends_with(&base_norm) {
                    prompt_text.to_string()
                } else {
                    format!("{}, {}", prompt_text, base)
                }
            }
            PromptMode::Prepend => {
                if prompt_norm.starts_with(&base_norm) {
                    prompt_text.to_string()
                } else {
                    format!("{}, {}", base, prompt_text)
                }
            }
        }
    }

    // ── Phase 1: prompt search/replace ──────────────────────────────

    fn expand_prompt_sr(&mut self, text: &str) -> Vec<(String, Vec<String>)> {
        let mut variants = vec![(text.to_string(), Vec::new())];
        for idx in 0..self.sr_rules.len() {
            let rule = self.sr_rules[idx].clone();
            let len = rule.replacements.len();
            let selected: Vec<String> = match self.sr_mode {
                DrawMode::Random => {
                    vec![rule.replacements[self.rng.random_range(0..len)].clone()]
                }
                DrawMode::Sequential => {
                    vec![rule.replacements[self.sr_indices[idx] % len].clone()]
                }
                DrawMode::Fanout => rule.replacements.clone(),
            };
            let mut applied = false;
            let mut next = Vec::new();
            for (current, labels) in &variants {
                if !current.contains(&rule.search) {
                    next.push((current.clone(), labels.clone()));
                    continue;
                }
                applied = true;
                for replacement in &selected {
                    let mut labels = labels.clone();
                    labels.push(format!("{}->{}", rule.search, replacement));
                    next.push((current.replace(&rule.search, replacement), labels));
                }
            }
            variants = next;
            if applied && self.sr_mode == DrawMode::Sequential {
                self.sr_indices[idx] = (self.sr_indices[idx] + 1) % len;
            }
        }
        variants
    }

    // ── Phase 2: wildcard substitution ──────────────────────────────

    fn expand_wildcards(
        &mut self,
        text: &str,
        base_labels: Vec<String>,
    ) -> Vec<(String, Vec<String>)> {
        let mut variants = vec![(text.to_string(), base_labels)];
        for idx in 0..self.wildcard_tokens.len() {
            let entry = self.wildcard_tokens[idx].clone();
            let len = entry.values.len();
            let counter = self.wildcard_indices.get(&entry.token).copied().unwrap_or(0);
            let selected: Vec<String> = match self.wildcard_mode {
                DrawMode::Random => {
                    vec![entry.values[self.rng.random_range(0..len)].clone()]
                }
                DrawMode::Sequential => vec![entry.values[counter % len].clone()],
                DrawMode::Fanout => entry.values.clone(),
            };
            let mut applied = false;
            let mut next = Vec::new();
            for (current, labels) in &variants {
                if !current.contains(&entry.token) {
                    next.push((current.clone(), labels.clone()));
                    continue;
                }
                applied = true;
                for value in &selected {
                    let mut labels = labels.clone();
                    labels.push(format!("{}={}", entry.token, value));
                    next.push((current.replace(&entry.token, value), labels));
                }
            }
            variants = next;
            if applied && self.wildcard_mode == DrawMode::Sequential {
                self.wildcard_indices.insert(entry.token, (counter + 1) % len);
            }
        }
        variants
    }

    // ── Phase 3: matrix expansion ───────────────────────────────────

    fn combos_for_call(&mut self) -> Vec<Vec<(String, String)>> {
        if !self.matrix_enabled || self.matrix_combos.is_empty() {
            return vec![Vec::new()];
        }
        match self.matrix_mode {
            MatrixMode::Fanout => self.matrix_combos.clone(),
            MatrixMode::Rotate => {
                let combo = self.matrix_combos[self.matrix_index].clone();
                self.matrix_index = (self.matrix_index + 1) % self.matrix_combos.len();
                vec![combo]
            }
        }
    }
}

fn resolve_max_variants(requested: usize) -> usize {
    if requested == 0 {
        return DEFAULT_MAX_VARIANTS;
    }
    if requested > HARD_MAX_VARIANTS {
        warn!(
            "randomization.max_variants={} exceeds hard cap ({}); using the cap",
            requested, HARD_MAX_VARIANTS
        );
        return HARD_MAX_VARIANTS;
    }
    requested
}

fn resolve_matrix_limit(
    slots: &[MatrixSlot],
    mode: MatrixMode,
    user_limit: usize,
    max_variants: usize,
) -> usize {
    if slots.is_empty() {
        return 0;
    }
    if mode != MatrixMode::Fanout {
        return user_limit;
    }
    if user_limit > 0 {
        if user_limit > max_variants {
            warn!(
                "matrix limit {} exceeds randomization max_variants {}; capping",
                user_limit, max_variants
            );
        }
        return user_limit.min(max_variants);
    }
    let total: usize = slots.iter().map(|s| s.values.len().max(1)).product();
    if total > max_variants {
        warn!(
            "matrix fanout would expand to {} combinations; auto-limiting to {}",
            total, max_variants
        );
        return max_variants;
    }
    0
}

/// Cartesian product of the slot value lists, in slot order, stopping as
/// soon as `limit` combinations exist (0 = unbounded).
fn build_matrix_combos(slots: &[MatrixSlot], limit: usize) -> Vec<Vec<(String, String)>> {
    if slots.is_empty() {
        return Vec::new();
    }
    let mut combos = Vec::new();
    let mut current: Vec<(String, String)> = Vec::with_capacity(slots.len());
    fill_combos(slots, 0, limit, &mut current, &mut combos);
    combos
}

fn fill_combos(
    slots: &[MatrixSlot],
    idx: usize,
    limit: usize,
    current: &mut Vec<(String, String)>,
    combos: &mut Vec<Vec<(String, String)>>,
) {
    if limit > 0 && combos.len() >= limit {
        return;
    }
    if idx == slots.len() {
        combos.push(current.clone());
        return;
    }
    for value in &slots[idx].values {
        current.push((slots[idx].name.clone(), value.clone()));
        fill_combos(slots, idx + 1, limit, current, combos);
        current.pop();
        if limit > 0 && combos.len() >= limit {
            return;
        }
    }
}

fn apply_matrix_combo(
    text: &str,
    combo: &[(String, String)],
    labels: &mut Vec<String>,
) -> String {
    let mut current = text.to_string();
    for (name, value) in combo {
        let placeholder = format!("[[{}]]", name);
        if current.contains(&placeholder) {
            current = current.replace(&placeholder, value);
            labels.push(format!("[{}]={}", name, value));
        }
    }
    current
}
