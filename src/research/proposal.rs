//! 假設產生：選擇研究方向、組裝提示詞上下文、解析模型回覆

use crate::domain::ports::LanguageModel;
use crate::research::bandit::{ActionBandit, DEFAULT_REWARD_METRIC};
use crate::research::model::{Action, Hypothesis, Round, Trace};
use crate::research::prompts::{
    self, FactorPhase, ModelPhase, ACTION_SYSTEM_PROMPT, FIRST_ROUND, NO_HISTORY, NO_SOTA,
    SYSTEM_PROMPT,
};
use crate::utils::error::{EtlError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::Write;
use std::str::FromStr;
use std::sync::LazyLock;

pub const SUPPORTED_MODELS: [&str; 20] = [
    "ALSTM",
    "LSTM",
    "GRU",
    "TCN",
    "Transformer",
    "LocalFormer",
    "TCTS",
    "TabNet",
    "SFM",
    "Sandwich",
    "Hist",
    "IGMTF",
    "KRNN",
    "TRA",
    "GATs",
    "LightGBM",
    "XGBoost",
    "CatBoost",
    "GBDT",
    "Linear",
];

/// 連續幾次模型實驗未被採納就視為停滯
pub const STAGNATION_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ActionSelection {
    #[default]
    Bandit,
    Llm,
    Random,
}

impl FromStr for ActionSelection {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bandit" => Ok(ActionSelection::Bandit),
            "llm" => Ok(ActionSelection::Llm),
            "random" => Ok(ActionSelection::Random),
            other => Err(EtlError::InvalidConfigValueError {
                field: "action_selection".to_string(),
                value: other.to_string(),
                reason: "expected bandit, llm or random".to_string(),
            }),
        }
    }
}

/// 名稱長者優先，避免 `LSTM` 搶先匹配 `ALSTM`
static MODEL_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    let mut models = SUPPORTED_MODELS;
    models.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    models
        .into_iter()
        .filter_map(|name| {
            Regex::new(&format!(r"(?i)\b{}\b", regex::escape(name)))
                .ok()
                .map(|re| (name, re))
        })
        .collect()
});

/// 在文字中找出支援的模型名稱：名稱長者優先、整字比對、不分大小寫
pub fn find_model_type(text: &str) -> Option<&'static str> {
    MODEL_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(name, _)| *name)
}

fn round_model_type(round: &Round) -> Option<&'static str> {
    find_model_type(&round.experiment.hypothesis.hypothesis).or_else(|| {
        round
            .experiment
            .tasks
            .first()
            .and_then(|task| find_model_type(task))
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stagnation {
    pub consecutive_failures: usize,
    /// 自最近一次被採納的實驗（含）以來出現過的模型
    pub tried: BTreeSet<&'static str>,
    pub sota_model: Option<String>,
}

impl Stagnation {
    /// 由新到舊走訪，遇到第一個被採納的實驗即停止
    pub fn analyze<'a>(rounds: impl DoubleEndedIterator<Item = &'a Round>) -> Self {
        let mut state = Self::default();
        for round in rounds.rev() {
            let model_type = round_model_type(round);
            if let Some(model) = model_type {
                state.tried.insert(model);
            }
            if round.is_accepted() {
                state.sota_model = Some(model_type.unwrap_or("Unknown").to_string());
                break;
            }
            state.consecutive_failures += 1;
        }
        state
    }

    pub fn is_stagnated(&self) -> bool {
        self.consecutive_failures >= STAGNATION_THRESHOLD
    }

    pub fn untried(&self) -> Vec<&'static str> {
        let mut untried: Vec<&'static str> = SUPPORTED_MODELS
            .into_iter()
            .filter(|m| !self.tried.contains(m))
            .collect();
        untried.sort_unstable();
        untried
    }

    pub fn guidance(&self) -> String {
        let sota = self.sota_model.as_deref().unwrap_or("N/A");
        let mut out = String::new();

        if !self.is_stagnated() {
            let _ = writeln!(
                out,
                "1. The current best model is built on **{}**. Refining its hyperparameters \
                 (hidden size, dropout, learning rate) or making a small architectural change is welcome.",
                sota
            );
            let _ = writeln!(
                out,
                "2. A related architecture with a similar inductive bias is also fine when well argued."
            );
            let _ = writeln!(
                out,
                "3. Keep the model size reasonable for a training set of roughly half a million samples."
            );
            return out;
        }

        let mut available = SUPPORTED_MODELS.to_vec();
        available.sort_unstable();
        let tried = if self.tried.is_empty() {
            "None".to_string()
        } else {
            self.tried.iter().copied().collect::<Vec<_>>().join(", ")
        };
        let untried = self.untried();

        let _ = writeln!(out, "**The search has stalled.**");
        let _ = writeln!(
            out,
            "The last {} model experiments failed to beat the **{}** baseline. Stop refining it \
             and propose a different architecture.",
            self.consecutive_failures, sota
        );
        let _ = writeln!(out, "- Available architectures: [{}]", available.join(", "));
        let _ = writeln!(out, "- Tried since the last accepted model: [{}]", tried);
        if untried.is_empty() {
            let _ = writeln!(
                out,
                "Every architecture has been tried. Pick the one most different from {} \
                 and justify a fresh angle on it.",
                sota
            );
        } else {
            let _ = writeln!(
                out,
                "Choose from the untried architectures: [{}], and explain why its inductive bias \
                 suits daily price/volume data.",
                untried.join(", ")
            );
        }
        out
    }
}

/// 交給語言模型的上下文，各欄位對應提示詞中的一段
#[derive(Debug, Clone, Serialize)]
pub struct HypothesisContext {
    pub action: Option<Action>,
    pub hypothesis_and_feedback: String,
    pub last_hypothesis_and_feedback: Option<String>,
    pub sota_hypothesis_and_feedback: Option<String>,
    pub rag: String,
    pub output_format: String,
    pub specification: String,
}

impl HypothesisContext {
    pub fn user_prompt(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Guidance\n{}\n", self.rag.trim_end());
        let _ = writeln!(out, "# Hypothesis specification\n{}\n", self.specification);
        let _ = writeln!(out, "# Experiment history\n{}\n", self.hypothesis_and_feedback.trim_end());
        if let Some(last) = &self.last_hypothesis_and_feedback {
            let _ = writeln!(out, "# Most recent experiment\n{}\n", last.trim_end());
        }
        if let Some(sota) = &self.sota_hypothesis_and_feedback {
            let _ = writeln!(out, "# Current best experiment\n{}\n", sota.trim_end());
        }
        let _ = write!(out, "# Output format\n{}", self.output_format);
        out
    }
}

/// 因子/模型混合情境的上下文
pub fn quant_context(trace: &Trace, action: Action) -> HypothesisContext {
    let hypothesis_and_feedback = if trace.is_empty() {
        FIRST_ROUND.to_string()
    } else {
        let rounds = trace.filtered_for(action);
        if rounds.is_empty() {
            NO_HISTORY.to_string()
        } else {
            prompts::render_history(&rounds)
        }
    };

    let rag = match action {
        Action::Factor => FactorPhase::for_count(trace.count(Action::Factor)).guidance(),
        Action::Model => ModelPhase::for_count(trace.count(Action::Model))
            .guidance()
            .to_string(),
    };
    let sota = match action {
        Action::Model => trace.sota_of(Action::Model).map(prompts::render_round),
        Action::Factor => None,
    };

    HypothesisContext {
        action: Some(action),
        hypothesis_and_feedback,
        last_hypothesis_and_feedback: trace.last_of(action).map(prompts::render_round),
        sota_hypothesis_and_feedback: sota,
        rag,
        output_format: prompts::output_format(true),
        specification: prompts::specification(action).to_string(),
    }
}

/// 純模型情境：整段歷史都是模型實驗
pub fn model_context(trace: &Trace) -> HypothesisContext {
    let all: Vec<&Round> = trace.hist.iter().rev().collect();
    let (history, last, sota) = if all.is_empty() {
        (
            FIRST_ROUND.to_string(),
            FIRST_ROUND.to_string(),
            "No SOTA hypothesis and feedback available since it is the first round.".to_string(),
        )
    } else {
        (
            prompts::render_history(&all),
            trace.last().map(prompts::render_round).unwrap_or_default(),
            trace
                .last_accepted()
                .map(prompts::render_round)
                .unwrap_or_else(|| NO_SOTA.to_string()),
        )
    };

    let stagnation = Stagnation::analyze(trace.hist.iter());
    if stagnation.is_stagnated() {
        tracing::warn!(
            "⚠️ {} consecutive model experiments without a new best, forcing exploration",
            stagnation.consecutive_failures
        );
    }

    HypothesisContext {
        action: None,
        hypothesis_and_feedback: history,
        last_hypothesis_and_feedback: Some(last),
        sota_hypothesis_and_feedback: Some(sota),
        rag: stagnation.guidance(),
        output_format: prompts::output_format(false),
        specification: prompts::specification(Action::Model).to_string(),
    }
}

fn optional_text(reply: &Value, key: &str) -> Option<String> {
    match reply.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

/// 把模型的 JSON 回覆轉成 `Hypothesis`
pub fn convert_response(reply: &Value) -> Result<Hypothesis> {
    let hypothesis = optional_text(reply, "hypothesis")
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| EtlError::ValidationError {
            message: format!("LLM reply has no hypothesis: {}", reply),
        })?;
    let action = match reply.get("action").and_then(Value::as_str) {
        Some(a) => Some(a.parse::<Action>()?),
        None => None,
    };

    Ok(Hypothesis {
        hypothesis,
        reason: optional_text(reply, "reason").unwrap_or_default(),
        concise_reason: optional_text(reply, "concise_reason"),
        concise_observation: optional_text(reply, "concise_observation"),
        concise_justification: optional_text(reply, "concise_justification"),
        concise_knowledge: optional_text(reply, "concise_knowledge"),
        action,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct Proposal {
    pub context: HypothesisContext,
    pub hypothesis: Hypothesis,
}

#[derive(Debug, Clone)]
pub struct QuantProposer {
    pub selection: ActionSelection,
    pub reward_metric: String,
    pub seed: Option<u64>,
}

impl Default for QuantProposer {
    fn default() -> Self {
        Self {
            selection: ActionSelection::default(),
            reward_metric: DEFAULT_REWARD_METRIC.to_string(),
            seed: None,
        }
    }
}

impl QuantProposer {
    pub async fn choose_action<L: LanguageModel + ?Sized>(&self, trace: &Trace, llm: &L) -> Result<Action> {
        let action = match self.selection {
            ActionSelection::Bandit => {
                if trace.is_empty() {
                    Action::Factor
                } else {
                    ActionBandit::from_trace(trace, &self.reward_metric).decide()
                }
            }
            ActionSelection::Llm => {
                let all: Vec<&Round> = trace.hist.iter().collect();
                let (history, last) = if all.is_empty() {
                    (FIRST_ROUND.to_string(), FIRST_ROUND.to_string())
                } else {
                    (
                        prompts::render_history(&all),
                        trace.last().map(prompts::render_round).unwrap_or_default(),
                    )
                };
                let user = format!(
                    "# Experiment history\n{}\n\n# Most recent experiment\n{}",
                    history.trim_end(),
                    last.trim_end()
                );
                let reply = llm.complete_json(ACTION_SYSTEM_PROMPT, &user).await?;
                reply
                    .get("action")
                    .and_then(Value::as_str)
                    .and_then(|a| a.parse().ok())
                    .unwrap_or(Action::Factor)
            }
            ActionSelection::Random => {
                let mut rng = match self.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                Action::ALL.choose(&mut rng).copied().unwrap_or(Action::Factor)
            }
        };
        tracing::info!("🎯 Next research action: {} ({:?})", action, self.selection);
        Ok(action)
    }

    pub async fn propose<L: LanguageModel + ?Sized>(&self, trace: &Trace, llm: &L) -> Result<Proposal> {
        let action = self.choose_action(trace, llm).await?;
        let context = quant_context(trace, action);
        let reply = llm.complete_json(SYSTEM_PROMPT, &context.user_prompt()).await?;
        let mut hypothesis = convert_response(&reply)?;
        if hypothesis.action.is_none() {
            hypothesis.action = Some(action);
        }
        Ok(Proposal { context, hypothesis })
    }
}

pub async fn propose_model<L: LanguageModel + ?Sized>(trace: &Trace, llm: &L) -> Result<Proposal> {
    let context = model_context(trace);
    let reply = llm.complete_json(SYSTEM_PROMPT, &context.user_prompt()).await?;
    let hypothesis = convert_response(&reply)?;
    Ok(Proposal { context, hypothesis })
}
