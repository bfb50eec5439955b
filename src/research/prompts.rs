//! 提示詞片段：分階段指引、歷史摘要與輸出格式

use crate::research::model::{Action, Round};
use std::fmt::Write;

pub const FIRST_ROUND: &str =
    "No previous hypothesis and feedback available since it's the first round.";
pub const NO_HISTORY: &str = "No previous hypothesis and feedback available.";
pub const NO_SOTA: &str =
    "No SOTA hypothesis and feedback available since previous experiments were not accepted.";

pub const FACTOR_CATEGORIES: [&str; 15] = [
    "Momentum and Reversal",
    "Volatility and Risk",
    "Price-Volume Interaction",
    "Intraday Price Patterns",
    "Higher-Order Derivatives and Transformations",
    "Cross-Sectional Relative Value",
    "Liquidity and Market Impact",
    "Return Distribution Skewness & Kurtosis",
    "Regime-Dependent / Conditional Factors",
    "Proxy for Fundamental Quality",
    "Proxy for Information Asymmetry & Informed Trading",
    "Proxy for Investor Sentiment & Behavior",
    "Proxy for Corporate Actions & Special Events",
    "Proxy for Investment Style Profile",
    "Proxy for Systemic Risk Contribution & Connectivity",
];

const SCAN_ROUNDS: usize = 15;
const FIRST_PASS_END: usize = 30;
const DEEP_END: usize = 35;
const FOCUSED_END: usize = 40;

const MODEL_FOUNDATION_END: usize = 7;
const MODEL_ADVANCED_END: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorPhase {
    InitialScan { round: usize },
    FirstPass { round: usize },
    DeepOptimization { round: usize },
    FocusedEnhancement { round: usize },
    Unrestricted { round: usize },
}

impl FactorPhase {
    /// `done` 是先前已完成的因子實驗數；回合從 1 起算
    pub fn for_count(done: usize) -> Self {
        if done < SCAN_ROUNDS {
            FactorPhase::InitialScan { round: done + 1 }
        } else if done < FIRST_PASS_END {
            FactorPhase::FirstPass {
                round: done - SCAN_ROUNDS + 1,
            }
        } else if done < DEEP_END {
            FactorPhase::DeepOptimization {
                round: done - FIRST_PASS_END + 1,
            }
        } else if done < FOCUSED_END {
            FactorPhase::FocusedEnhancement {
                round: done - DEEP_END + 1,
            }
        } else {
            FactorPhase::Unrestricted {
                round: done - FOCUSED_END + 1,
            }
        }
    }

    pub fn guidance(&self) -> String {
        match *self {
            FactorPhase::InitialScan { round } => format!(
                "**Phase 1: Initial Scan (Round {round}/{SCAN_ROUNDS}).**\n\
                 Build one simple baseline factor per category, one category per round.\n\
                 - Propose exactly 1 factor from a category not yet covered in this phase.\n\
                 - Keep it easy to implement; breadth matters more than depth here.\n\
                 - Categories: {}",
                FACTOR_CATEGORIES.join("; ")
            ),
            FactorPhase::FirstPass { round } => format!(
                "**Phase 2: First Optimization Pass (Round {round}/{}).**\n\
                 Pick 1 factor from the Phase 1 baselines and refine it using its feedback.\n\
                 - Stay within the original ideas; no new concepts yet.",
                FIRST_PASS_END - SCAN_ROUNDS
            ),
            FactorPhase::DeepOptimization { round } => format!(
                "**Phase 3: Deep Optimization (Round {round}/{}).**\n\
                 Rank the factors tried so far and take the 3-5 strongest further.\n\
                 - More complex constructions are welcome when they capture a real effect.",
                DEEP_END - FIRST_PASS_END
            ),
            FactorPhase::FocusedEnhancement { round } => format!(
                "**Phase 4: Focused Enhancement (Round {round}/{}).**\n\
                 Polish the most promising Phase 3 factors with 3 new optimizations.\n\
                 - Interactions, non-linear transforms or regime awareness are all fair game.",
                FOCUSED_END - DEEP_END
            ),
            FactorPhase::Unrestricted { round } => format!(
                "**Phase 5: Unrestricted Research (Round {round}).**\n\
                 The structured phases are over. Review the full history and propose a \
                 bold, first-principles insight about market behaviour. Borrowing mental \
                 models from other disciplines (complex systems, information theory, \
                 behavioural psychology, network diffusion, game theory) is encouraged."
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPhase {
    Foundational,
    Advanced,
    MetaStrategies,
}

impl ModelPhase {
    pub fn for_count(done: usize) -> Self {
        if done < MODEL_FOUNDATION_END {
            ModelPhase::Foundational
        } else if done < MODEL_ADVANCED_END {
            ModelPhase::Advanced
        } else {
            ModelPhase::MetaStrategies
        }
    }

    pub fn guidance(&self) -> &'static str {
        match self {
            ModelPhase::Foundational => {
                "**Phase 1: Foundational Modeling.**\n\
                 Establish a strong baseline with architectures built for sequential data \
                 and local temporal dependencies. Hyperparameter tuning is a valid move."
            }
            ModelPhase::Advanced => {
                "**Phase 2: Advanced Pattern Recognition.**\n\
                 Move to architectures that capture long-range and non-local dependencies \
                 that simple sequential models miss."
            }
            ModelPhase::MetaStrategies => {
                "**Phase 3: Meta-Strategies.**\n\
                 Prefer ensembles of diverse models that already did well. Hybrid designs \
                 that fuse tabular and time-series views come second, and relational models \
                 over inter-asset structure are the high-risk option."
            }
        }
    }
}

pub fn output_format(with_action: bool) -> String {
    let mut fields = Vec::new();
    if with_action {
        fields.push(r#"  "action": "factor or model","#);
    }
    fields.extend([
        r#"  "hypothesis": "one conceptual insight, no formulas or code","#,
        r#"  "reason": "why this follows from earlier results and what it should reveal","#,
        r#"  "concise_reason": "one sentence","#,
        r#"  "concise_observation": "one sentence","#,
        r#"  "concise_justification": "one sentence","#,
        r#"  "concise_knowledge": "one sentence, if-then form""#,
    ]);
    format!(
        "Reply with a single JSON object:\n{{\n{}\n}}",
        fields.join("\n")
    )
}

/// 任務回覆格式：以任務名稱為鍵的 JSON 物件
pub fn task_output_format(action: Action) -> String {
    let fields: &[&str] = match action {
        Action::Factor => &[
            r#"    "description": "what the factor measures","#,
            r#"    "formulation": "LaTeX formula","#,
            r#"    "variables": { "symbol in the formula": "meaning" }"#,
        ],
        Action::Model => &[
            r#"    "description": "what the model does","#,
            r#"    "formulation": "LaTeX formula of the forward pass","#,
            r#"    "architecture": "layer-by-layer description","#,
            r#"    "variables": { "symbol in the formula": "meaning" },"#,
            r#"    "hyperparameters": { "name": "value" },"#,
            r#"    "training_hyperparameters": { "n_epochs": "100", "lr": "1e-3", "early_stop": "10", "batch_size": "256", "weight_decay": "1e-4" },"#,
            r#"    "model_type": "Tabular or TimeSeries""#,
        ],
    };
    format!(
        "Reply with a single JSON object keyed by task name:\n{{\n  \"<{}_name>\": {{\n{}\n  }}\n}}",
        action,
        fields.join("\n")
    )
}

pub fn specification(action: Action) -> &'static str {
    match action {
        Action::Factor => {
            "A factor hypothesis states a market mechanism that a price/volume factor \
             could measure. It must be testable on daily OHLCV data."
        }
        Action::Model => {
            "A model hypothesis names the architecture family and the inductive bias it \
             brings, and says which part of the previous result it aims to improve."
        }
    }
}

pub fn render_round(round: &Round) -> String {
    let experiment = &round.experiment;
    let mut out = String::new();
    let _ = write!(out, "{}", experiment.hypothesis);
    if !experiment.tasks.is_empty() {
        let _ = writeln!(out, "Tasks: {}", experiment.tasks.join(", "));
    }
    if !experiment.metrics.is_empty() {
        let metrics: Vec<String> = experiment
            .metrics
            .iter()
            .map(|(k, v)| format!("{}={:.6}", k, v))
            .collect();
        let _ = writeln!(out, "Result: {}", metrics.join(", "));
    }
    let feedback = &round.feedback;
    if !feedback.observations.is_empty() {
        let _ = writeln!(out, "Observations: {}", feedback.observations);
    }
    if !feedback.hypothesis_evaluation.is_empty() {
        let _ = writeln!(out, "Evaluation: {}", feedback.hypothesis_evaluation);
    }
    if !feedback.reason.is_empty() {
        let _ = writeln!(out, "Feedback reason: {}", feedback.reason);
    }
    let _ = writeln!(out, "Accepted: {}", feedback.decision);
    out
}

pub fn render_history(rounds: &[&Round]) -> String {
    rounds
        .iter()
        .enumerate()
        .map(|(i, r)| format!("# Experiment {}\n{}", i + 1, render_round(r)))
        .collect::<Vec<_>>()
        .join("\n")
}

pub const SYSTEM_PROMPT: &str = "You are a quantitative researcher iterating on alpha factors \
and prediction models for the China A-share market. Each round you propose one hypothesis, \
grounded in the experiment history you are given.";

pub const ACTION_SYSTEM_PROMPT: &str = "You decide whether the next research round should \
work on factors or on models. Reply with a JSON object {\"action\": \"factor\"} or \
{\"action\": \"model\"}.";

pub const TASK_SYSTEM_PROMPT: &str = "You turn an accepted research hypothesis into concrete, \
implementable tasks. Each task must be specific enough to be coded without further questions.";
