pub mod bandit;
pub mod hyperparams;
pub mod llm;
pub mod model;
pub mod prompts;
pub mod proposal;
pub mod tasks;

pub use hyperparams::TrainingHyperparameters;
pub use llm::LlmClient;
pub use model::{Action, Experiment, Feedback, Hypothesis, Round, Trace};
pub use proposal::{ActionSelection, HypothesisContext, Proposal, QuantProposer};
pub use tasks::{ExperimentPlan, FactorTask, ModelTask, Task};
