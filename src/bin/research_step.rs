use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use pv_etl::domain::ports::LanguageModel;
use pv_etl::research::proposal::{self, ActionSelection, QuantProposer};
use pv_etl::research::tasks::{self, plan_experiment};
use pv_etl::research::{Action, Hypothesis, LlmClient, Trace, TrainingHyperparameters};
use pv_etl::utils::error::{EtlError, Result as EtlResult};
use pv_etl::utils::logger;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "research_step")]
#[command(about = "Run one hypothesis-generation step over an experiment trace")]
struct Args {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    step: Step,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scenario {
    /// 因子與模型交替
    Quant,
    /// 只做模型
    Model,
}

#[derive(Subcommand)]
enum Step {
    /// 產生下一個假設 (或在 --dry-run 時只輸出提示詞上下文)
    Propose {
        /// JSON trace file; omitted means the first round
        #[arg(long)]
        trace: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "quant")]
        scenario: Scenario,
        #[arg(long, default_value = "bandit")]
        action_selection: String,
        #[arg(long)]
        reward_metric: Option<String>,
        #[arg(long)]
        seed: Option<u64>,
        /// Defaults to $LLM_API_URL
        #[arg(long)]
        api_url: Option<String>,
        /// Defaults to $LLM_MODEL
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value = "120")]
        timeout_seconds: u64,
        #[arg(long)]
        dry_run: bool,
    },
    /// 把一個假設展開成具體的因子或模型任務
    Plan {
        /// Hypothesis JSON file, or the output of `propose`
        #[arg(long)]
        hypothesis: PathBuf,
        #[arg(long)]
        trace: Option<PathBuf>,
        #[arg(long)]
        api_url: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value = "120")]
        timeout_seconds: u64,
        #[arg(long)]
        dry_run: bool,
    },
    /// 把訓練超參數轉成 KEY=VALUE 環境變數
    TrainingEnv {
        /// JSON object, or a JSON string holding one
        hyperparameters: String,
    },
}

/// --dry-run 時使用，任何呼叫都視為配置缺失
struct NoModel;

#[async_trait]
impl LanguageModel for NoModel {
    async fn complete_json(&self, _system_prompt: &str, _user_prompt: &str) -> EtlResult<Value> {
        Err(EtlError::MissingConfigError {
            field: "api_url".to_string(),
        })
    }
}

fn from_env(value: Option<String>, var: &str) -> Option<String> {
    value.or_else(|| std::env::var(var).ok()).filter(|v| !v.is_empty())
}

async fn load_trace(path: Option<PathBuf>) -> anyhow::Result<Trace> {
    let Some(path) = path else {
        return Ok(Trace::default());
    };
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading trace {}", path.display()))?;
    let trace = Trace::from_json(&text).with_context(|| format!("parsing trace {}", path.display()))?;
    tracing::info!("📜 Loaded {} rounds from {}", trace.hist.len(), path.display());
    Ok(trace)
}

/// 接受單獨的假設物件，或 `propose` 輸出中的 `hypothesis` 欄位
async fn load_hypothesis(path: &Path) -> anyhow::Result<Hypothesis> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading hypothesis {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)?;
    let value = match value.get("hypothesis") {
        Some(inner) if inner.is_object() => inner.clone(),
        _ => value,
    };
    serde_json::from_value(value).with_context(|| format!("parsing hypothesis {}", path.display()))
}

fn llm_client(api_url: Option<String>, model: Option<String>, timeout: Duration) -> anyhow::Result<LlmClient> {
    let api_url = from_env(api_url, "LLM_API_URL").context("no --api-url and LLM_API_URL is unset")?;
    let model = from_env(model, "LLM_MODEL").context("no --model and LLM_MODEL is unset")?;
    let api_key = std::env::var("LLM_API_KEY").unwrap_or_default();
    Ok(LlmClient::new(&api_url, &api_key, &model, timeout)?)
}

#[allow(clippy::too_many_arguments)]
async fn propose(
    trace: Trace,
    scenario: Scenario,
    selection: ActionSelection,
    reward_metric: Option<String>,
    seed: Option<u64>,
    api_url: Option<String>,
    model: Option<String>,
    timeout: Duration,
    dry_run: bool,
) -> anyhow::Result<Value> {
    let mut proposer = QuantProposer {
        selection,
        seed,
        ..Default::default()
    };
    if let Some(metric) = reward_metric {
        proposer.reward_metric = metric;
    }

    if dry_run {
        let context = match scenario {
            Scenario::Quant => {
                if selection == ActionSelection::Llm {
                    bail!("--dry-run cannot ask the LLM to choose the action; use bandit or random");
                }
                let action = proposer.choose_action(&trace, &NoModel).await?;
                proposal::quant_context(&trace, action)
            }
            Scenario::Model => proposal::model_context(&trace),
        };
        return Ok(serde_json::json!({
            "context": context,
            "user_prompt": context.user_prompt(),
        }));
    }

    let client = llm_client(api_url, model, timeout)?;

    let result = match scenario {
        Scenario::Quant => proposer.propose(&trace, &client).await?,
        Scenario::Model => proposal::propose_model(&trace, &client).await?,
    };
    tracing::info!("💡 {}", result.hypothesis.hypothesis);
    Ok(serde_json::to_value(&result)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout 只放 JSON 結果
    logger::init_stderr_logger(args.verbose);

    match args.step {
        Step::Propose {
            trace,
            scenario,
            action_selection,
            reward_metric,
            seed,
            api_url,
            model,
            timeout_seconds,
            dry_run,
        } => {
            let selection: ActionSelection = action_selection.parse()?;
            let trace = load_trace(trace).await?;
            let output = propose(
                trace,
                scenario,
                selection,
                reward_metric,
                seed,
                api_url,
                model,
                Duration::from_secs(timeout_seconds),
                dry_run,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Step::Plan {
            hypothesis,
            trace,
            api_url,
            model,
            timeout_seconds,
            dry_run,
        } => {
            let hypothesis = load_hypothesis(&hypothesis).await?;
            let trace = load_trace(trace).await?;
            let output = if dry_run {
                let action = hypothesis.action.unwrap_or(Action::Model);
                let context = tasks::task_context(&hypothesis, &trace, action);
                serde_json::json!({
                    "context": context,
                    "user_prompt": context.user_prompt(),
                })
            } else {
                let client = llm_client(api_url, model, Duration::from_secs(timeout_seconds))?;
                let plan = plan_experiment(&hypothesis, &trace, &client).await?;
                serde_json::json!({
                    "plan": plan,
                    "experiment": plan.to_experiment(),
                })
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Step::TrainingEnv { hyperparameters } => {
            let value: Value = serde_json::from_str(&hyperparameters)
                .unwrap_or_else(|_| Value::String(hyperparameters.clone()));
            match TrainingHyperparameters::from_value(&value)? {
                Some(params) => {
                    for (key, val) in params.to_env() {
                        println!("{}={}", key, val);
                    }
                }
                None => tracing::info!("No training hyperparameters given, nothing to export"),
            }
        }
    }

    Ok(())
}
