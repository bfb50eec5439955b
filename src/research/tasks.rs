//! 把假設展開成可實作的因子/模型任務

use crate::domain::ports::LanguageModel;
use crate::research::hyperparams::TrainingHyperparameters;
use crate::research::model::{Action, Experiment, Hypothesis, Round, Trace};
use crate::research::prompts::{self, FIRST_ROUND, NO_HISTORY, NO_SOTA, TASK_SYSTEM_PROMPT};
use crate::utils::error::{EtlError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Write;

const MODEL_TASK_GUIDANCE: &str = "The training set holds fewer than 1 million samples and the \
validation set about 250,000. Size the model and its hyperparameters accordingly. If the \
previous model is sound but its hyperparameters are not, return the same model with new \
hyperparameters instead.";

const FACTOR_TASK_GUIDANCE: &str = "Every factor must be computable from the daily $open, $close, \
$high, $low, $volume and $factor columns, indexed by (datetime, instrument).";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorTask {
    pub name: String,
    pub description: String,
    pub formulation: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTask {
    pub name: String,
    pub description: String,
    pub formulation: String,
    pub architecture: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub hyperparameters: Map<String, Value>,
    /// 保留原樣，交給 `TrainingHyperparameters::from_value` 解析
    #[serde(default)]
    pub training_hyperparameters: Value,
    pub model_type: String,
}

impl ModelTask {
    pub fn training(&self) -> Result<Option<TrainingHyperparameters>> {
        TrainingHyperparameters::from_value(&self.training_hyperparameters)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Task {
    Factor(FactorTask),
    Model(ModelTask),
}

impl Task {
    pub fn name(&self) -> &str {
        match self {
            Task::Factor(t) => &t.name,
            Task::Model(t) => &t.name,
        }
    }

    /// 寫回歷史紀錄用的一行摘要
    pub fn summary(&self) -> String {
        match self {
            Task::Factor(t) => format!("{}: {}", t.name, t.description),
            Task::Model(t) => format!("{} ({}): {}", t.name, t.model_type, t.description),
        }
    }
}

/// 任務產生提示詞的上下文
#[derive(Debug, Clone, Serialize)]
pub struct TaskContext {
    pub action: Action,
    pub target_hypothesis: String,
    pub hypothesis_and_feedback: String,
    pub last_hypothesis_and_feedback: String,
    pub sota_hypothesis_and_feedback: String,
    /// 先前實驗做過的任務
    pub target_list: Vec<String>,
    pub rag: String,
    pub output_format: String,
}

impl TaskContext {
    pub fn user_prompt(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Target hypothesis\n{}\n", self.target_hypothesis.trim_end());
        let _ = writeln!(out, "# Guidance\n{}\n", self.rag);
        let _ = writeln!(out, "# Experiment history\n{}\n", self.hypothesis_and_feedback.trim_end());
        let _ = writeln!(
            out,
            "# Most recent experiment\n{}\n",
            self.last_hypothesis_and_feedback.trim_end()
        );
        let _ = writeln!(
            out,
            "# Current best experiment\n{}\n",
            self.sota_hypothesis_and_feedback.trim_end()
        );
        if !self.target_list.is_empty() {
            let _ = writeln!(out, "# Tasks already implemented\n- {}\n", self.target_list.join("\n- "));
        }
        let _ = write!(out, "# Output format\n{}", self.output_format);
        out
    }
}

/// 模型任務看整段歷史；因子任務只看因子實驗與最近被採納的模型
pub fn task_context(hypothesis: &Hypothesis, trace: &Trace, action: Action) -> TaskContext {
    let rounds: Vec<&Round> = match action {
        Action::Model => trace.hist.iter().rev().collect(),
        Action::Factor => trace.filtered_for(Action::Factor),
    };
    let (last, sota) = match action {
        Action::Model => (trace.last(), trace.last_accepted()),
        Action::Factor => (trace.last_of(Action::Factor), trace.sota_of(Action::Factor)),
    };

    let hypothesis_and_feedback = if trace.is_empty() {
        FIRST_ROUND.to_string()
    } else if rounds.is_empty() {
        NO_HISTORY.to_string()
    } else {
        prompts::render_history(&rounds)
    };

    TaskContext {
        action,
        target_hypothesis: hypothesis.to_string(),
        hypothesis_and_feedback,
        last_hypothesis_and_feedback: last
            .map(prompts::render_round)
            .unwrap_or_else(|| FIRST_ROUND.to_string()),
        sota_hypothesis_and_feedback: sota
            .map(prompts::render_round)
            .unwrap_or_else(|| NO_SOTA.to_string()),
        target_list: trace
            .hist
            .iter()
            .flat_map(|r| r.experiment.tasks.iter().cloned())
            .collect(),
        rag: match action {
            Action::Model => MODEL_TASK_GUIDANCE,
            Action::Factor => FACTOR_TASK_GUIDANCE,
        }
        .to_string(),
        output_format: prompts::task_output_format(action),
    }
}

fn required_text(spec: &Map<String, Value>, task: &str, key: &str) -> Result<String> {
    match spec.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(EtlError::ValidationError {
            message: format!("Task '{}' has no usable '{}'", task, key),
        }),
    }
}

fn object_field(spec: &Map<String, Value>, task: &str, key: &str) -> Result<Map<String, Value>> {
    match spec.get(key) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(other) => Err(EtlError::ValidationError {
            message: format!("Task '{}' field '{}' must be an object, got {}", task, key, other),
        }),
    }
}

/// 解析 `{任務名: {欄位...}}` 形式的回覆
pub fn convert_tasks(reply: &Value, action: Action) -> Result<Vec<Task>> {
    let entries = reply.as_object().ok_or_else(|| EtlError::ValidationError {
        message: format!("Task reply must be a JSON object, got {}", reply),
    })?;
    if entries.is_empty() {
        return Err(EtlError::ValidationError {
            message: "Task reply holds no tasks".to_string(),
        });
    }

    entries
        .iter()
        .map(|(name, spec)| {
            let spec = spec.as_object().ok_or_else(|| EtlError::ValidationError {
                message: format!("Task '{}' must be a JSON object", name),
            })?;
            let task = match action {
                Action::Factor => Task::Factor(FactorTask {
                    name: name.clone(),
                    description: required_text(spec, name, "description")?,
                    formulation: required_text(spec, name, "formulation")?,
                    variables: object_field(spec, name, "variables")?,
                }),
                Action::Model => {
                    let task = ModelTask {
                        name: name.clone(),
                        description: required_text(spec, name, "description")?,
                        formulation: required_text(spec, name, "formulation")?,
                        architecture: required_text(spec, name, "architecture")?,
                        variables: object_field(spec, name, "variables")?,
                        hyperparameters: object_field(spec, name, "hyperparameters")?,
                        training_hyperparameters: spec
                            .get("training_hyperparameters")
                            .cloned()
                            .unwrap_or(Value::Null),
                        model_type: required_text(spec, name, "model_type")?,
                    };
                    task.training()?;
                    Task::Model(task)
                }
            };
            Ok(task)
        })
        .collect()
}

/// 一個假設展開後的實驗計畫
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentPlan {
    pub context: TaskContext,
    pub hypothesis: Hypothesis,
    pub tasks: Vec<Task>,
    /// 被採納實驗在歷史中的索引
    pub based_experiments: Vec<usize>,
}

impl ExperimentPlan {
    /// 尚未執行的實驗，可直接附加到歷史
    pub fn to_experiment(&self) -> Experiment {
        Experiment {
            hypothesis: self.hypothesis.clone(),
            tasks: self.tasks.iter().map(Task::summary).collect(),
            ..Default::default()
        }
    }
}

/// 沒有標明方向的假設視為模型假設
pub async fn plan_experiment<L: LanguageModel + ?Sized>(
    hypothesis: &Hypothesis,
    trace: &Trace,
    llm: &L,
) -> Result<ExperimentPlan> {
    let action = hypothesis.action.unwrap_or(Action::Model);
    let context = task_context(hypothesis, trace, action);
    let reply = llm.complete_json(TASK_SYSTEM_PROMPT, &context.user_prompt()).await?;
    let tasks = convert_tasks(&reply, action)?;
    tracing::info!(
        "🧩 {} {} task(s): {}",
        tasks.len(),
        action,
        tasks.iter().map(Task::name).collect::<Vec<_>>().join(", ")
    );

    Ok(ExperimentPlan {
        context,
        hypothesis: hypothesis.clone(),
        tasks,
        based_experiments: trace
            .hist
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_accepted())
            .map(|(i, _)| i)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::model::tests::round;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct OneReply {
        reply: Value,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LanguageModel for OneReply {
        async fn complete_json(&self, system: &str, user: &str) -> Result<Value> {
            assert_eq!(system, TASK_SYSTEM_PROMPT);
            self.prompts.lock().unwrap().push(user.to_string());
            Ok(self.reply.clone())
        }
    }

    fn gru_reply() -> Value {
        json!({
            "GRU_Attn": {
                "description": "GRU encoder with temporal attention",
                "formulation": "h_t = GRU(x_t, h_{t-1})",
                "architecture": "2-layer GRU, attention pooling, linear head",
                "variables": { "h_t": "hidden state" },
                "hyperparameters": { "hidden_size": 64, "dropout": 0.1 },
                "training_hyperparameters": { "n_epochs": "50", "lr": "5e-4" },
                "model_type": "TimeSeries"
            }
        })
    }

    #[test]
    fn test_convert_model_tasks() {
        let tasks = convert_tasks(&gru_reply(), Action::Model).unwrap();
        assert_eq!(tasks.len(), 1);
        let Task::Model(task) = &tasks[0] else {
            panic!("expected a model task, got {:?}", tasks[0]);
        };
        assert_eq!(task.name, "GRU_Attn");
        assert_eq!(task.model_type, "TimeSeries");
        assert_eq!(task.hyperparameters["hidden_size"], json!(64));
        let training = task.training().unwrap().unwrap();
        assert_eq!(training.n_epochs, 50);
        assert_eq!(training.lr, 5e-4);
        assert_eq!(tasks[0].summary(), "GRU_Attn (TimeSeries): GRU encoder with temporal attention");
    }

    #[test]
    fn test_convert_factor_tasks() {
        let reply = json!({
            "Reversal5D": {
                "description": "negative 5-day return",
                "formulation": "-(close_t / close_{t-5} - 1)",
                "variables": { "close_t": "close on day t" }
            },
            "VolumeShock": {
                "description": "volume relative to its 20-day mean",
                "formulation": "volume_t / mean(volume, 20)"
            }
        });
        let tasks = convert_tasks(&reply, Action::Factor).unwrap();
        let names: Vec<&str> = tasks.iter().map(Task::name).collect();
        assert_eq!(names, vec!["Reversal5D", "VolumeShock"]);
        let Task::Factor(second) = &tasks[1] else {
            panic!("expected a factor task");
        };
        assert!(second.variables.is_empty());
    }

    #[test]
    fn test_convert_rejects_incomplete_tasks() {
        assert!(convert_tasks(&json!({}), Action::Model).is_err());
        assert!(convert_tasks(&json!(["GRU"]), Action::Model).is_err());
        assert!(convert_tasks(&json!({"GRU": "just a name"}), Action::Model).is_err());

        let mut missing_arch = gru_reply();
        missing_arch["GRU_Attn"]
            .as_object_mut()
            .unwrap()
            .remove("architecture");
        let err = convert_tasks(&missing_arch, Action::Model).unwrap_err();
        assert!(err.to_string().contains("architecture"), "{}", err);

        let mut bad_training = gru_reply();
        bad_training["GRU_Attn"]["training_hyperparameters"] = json!({ "n_epochs": "many" });
        assert!(convert_tasks(&bad_training, Action::Model).is_err());

        // 模型任務所需欄位在因子任務中不是必要的
        let factor = json!({"F": {"description": "d", "formulation": "f"}});
        assert!(convert_tasks(&factor, Action::Factor).is_ok());
        assert!(convert_tasks(&factor, Action::Model).is_err());
    }

    #[test]
    fn test_task_context_lists_previous_tasks() {
        let mut first = round(Some(Action::Model), "LSTM baseline", true);
        first.experiment.tasks.push("LSTM_Base".to_string());
        let mut second = round(Some(Action::Factor), "reversal", false);
        second.experiment.tasks.push("Reversal5D".to_string());
        let trace = Trace {
            hist: vec![first, second],
        };
        let hypothesis = Hypothesis {
            hypothesis: "Attention helps GRU".to_string(),
            action: Some(Action::Model),
            ..Default::default()
        };

        let ctx = task_context(&hypothesis, &trace, Action::Model);
        assert_eq!(ctx.target_list, vec!["LSTM_Base", "Reversal5D"]);
        assert!(ctx.target_hypothesis.contains("Attention helps GRU"));
        assert!(ctx.last_hypothesis_and_feedback.contains("reversal"));
        assert!(ctx.sota_hypothesis_and_feedback.contains("LSTM baseline"));
        let history = &ctx.hypothesis_and_feedback;
        assert!(history.find("reversal").unwrap() < history.find("LSTM baseline").unwrap());
        assert!(ctx.user_prompt().contains("- LSTM_Base\n- Reversal5D"));

        let ctx = task_context(&hypothesis, &trace, Action::Factor);
        assert_eq!(ctx.sota_hypothesis_and_feedback, NO_SOTA);
        assert!(ctx.rag.contains("$factor"));

        let ctx = task_context(&hypothesis, &Trace::default(), Action::Model);
        assert_eq!(ctx.hypothesis_and_feedback, FIRST_ROUND);
        assert!(!ctx.user_prompt().contains("# Tasks already implemented"));
    }

    #[tokio::test]
    async fn test_plan_experiment_records_based_experiments() {
        let trace = Trace {
            hist: vec![
                round(Some(Action::Model), "m1", true),
                round(Some(Action::Model), "m2", false),
                round(Some(Action::Factor), "f1", true),
            ],
        };
        let llm = OneReply {
            reply: gru_reply(),
            prompts: Mutex::new(Vec::new()),
        };
        let hypothesis = Hypothesis {
            hypothesis: "Attention helps GRU".to_string(),
            ..Default::default()
        };

        let plan = plan_experiment(&hypothesis, &trace, &llm).await.unwrap();
        assert_eq!(plan.context.action, Action::Model);
        assert_eq!(plan.based_experiments, vec![0, 2]);
        assert_eq!(plan.tasks.len(), 1);
        assert!(llm.prompts.lock().unwrap()[0].contains("\"<model_name>\""));

        let experiment = plan.to_experiment();
        assert_eq!(experiment.hypothesis.hypothesis, "Attention helps GRU");
        assert_eq!(experiment.tasks, vec![plan.tasks[0].summary()]);
        assert!(experiment.metrics.is_empty());

        let value = serde_json::to_value(&plan).unwrap();
        assert_eq!(value["tasks"][0]["kind"], "model");
        assert_eq!(value["tasks"][0]["name"], "GRU_Attn");
    }
}
