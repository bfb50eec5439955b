//! 研究迴圈的紀錄模型：假設、實驗、回饋與歷史軌跡

use crate::utils::error::{EtlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Factor,
    Model,
}

impl Action {
    pub const ALL: [Action; 2] = [Action::Factor, Action::Model];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Factor => "factor",
            Action::Model => "model",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "factor" => Ok(Action::Factor),
            "model" => Ok(Action::Model),
            other => Err(EtlError::ValidationError {
                message: format!("Unknown action '{}', expected factor or model", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub hypothesis: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub concise_reason: Option<String>,
    #[serde(default)]
    pub concise_observation: Option<String>,
    #[serde(default)]
    pub concise_justification: Option<String>,
    #[serde(default)]
    pub concise_knowledge: Option<String>,
    /// 只有因子/模型混合情境才會有
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
}

impl fmt::Display for Hypothesis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(action) = self.action {
            writeln!(f, "Chosen Action: {}", action)?;
        }
        writeln!(f, "Hypothesis: {}", self.hypothesis)?;
        writeln!(f, "Reason: {}", self.reason)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub hypothesis: Hypothesis,
    /// 子任務名稱，例如因子或模型名
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl Experiment {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().filter(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub decision: bool,
    #[serde(default)]
    pub observations: String,
    #[serde(default)]
    pub hypothesis_evaluation: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub experiment: Experiment,
    pub feedback: Feedback,
}

impl Round {
    pub fn action(&self) -> Option<Action> {
        self.experiment.hypothesis.action
    }

    pub fn is_accepted(&self) -> bool {
        self.feedback.decision
    }
}

/// 依時間先後排列的實驗歷史
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    #[serde(default)]
    pub hist: Vec<Round>,
}

impl Trace {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_empty(&self) -> bool {
        self.hist.is_empty()
    }

    pub fn last(&self) -> Option<&Round> {
        self.hist.last()
    }

    pub fn count(&self, action: Action) -> usize {
        self.hist.iter().filter(|r| r.action() == Some(action)).count()
    }

    pub fn last_of(&self, action: Action) -> Option<&Round> {
        self.hist.iter().rev().find(|r| r.action() == Some(action))
    }

    pub fn sota_of(&self, action: Action) -> Option<&Round> {
        self.hist
            .iter()
            .rev()
            .find(|r| r.action() == Some(action) && r.is_accepted())
    }

    pub fn last_accepted(&self) -> Option<&Round> {
        self.hist.iter().rev().find(|r| r.is_accepted())
    }

    /// 產生提示詞用的子歷史：所有同類實驗，加上另一類最近一次被採納的實驗，最新的在前
    pub fn filtered_for(&self, action: Action) -> Vec<&Round> {
        let other_sota = self
            .hist
            .iter()
            .rposition(|r| r.action().is_some_and(|a| a != action) && r.is_accepted());

        self.hist
            .iter()
            .enumerate()
            .rev()
            .filter(|(i, r)| r.action() == Some(action) || Some(*i) == other_sota)
            .map(|(_, r)| r)
            .collect()
    }
}
