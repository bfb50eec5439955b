use crate::research::model::{Action, Trace};

pub const DEFAULT_REWARD_METRIC: &str = "IC";

#[derive(Debug, Clone, Copy, Default)]
struct Arm {
    pulls: u32,
    total_reward: f64,
}

impl Arm {
    fn mean(&self) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            self.total_reward / self.pulls as f64
        }
    }
}

/// UCB1 在 factor / model 兩個動作之間做選擇
#[derive(Debug, Clone)]
pub struct ActionBandit {
    arms: [Arm; 2],
    exploration: f64,
}

impl Default for ActionBandit {
    fn default() -> Self {
        Self::new(2f64.sqrt())
    }
}

fn slot(action: Action) -> usize {
    match action {
        Action::Factor => 0,
        Action::Model => 1,
    }
}

impl ActionBandit {
    pub fn new(exploration: f64) -> Self {
        Self {
            arms: [Arm::default(); 2],
            exploration,
        }
    }

    /// 以歷史中每一輪的指標重建狀態；缺少指標的輪次獎勵為 0
    pub fn from_trace(trace: &Trace, metric: &str) -> Self {
        let mut bandit = Self::default();
        for round in &trace.hist {
            if let Some(action) = round.action() {
                bandit.record(action, round.experiment.metric(metric).unwrap_or(0.0));
            }
        }
        bandit
    }

    pub fn record(&mut self, action: Action, reward: f64) {
        let arm = &mut self.arms[slot(action)];
        arm.pulls += 1;
        arm.total_reward += reward;
    }

    pub fn pulls(&self, action: Action) -> u32 {
        self.arms[slot(action)].pulls
    }

    pub fn score(&self, action: Action) -> f64 {
        let arm = self.arms[slot(action)];
        if arm.pulls == 0 {
            return f64::INFINITY;
        }
        let total: u32 = self.arms.iter().map(|a| a.pulls).sum();
        arm.mean() + self.exploration * ((total as f64).ln() / arm.pulls as f64).sqrt()
    }

    /// 未試過的動作優先，同分時選 factor
    pub fn decide(&self) -> Action {
        let mut best = Action::Factor;
        for action in Action::ALL {
            if self.score(action) > self.score(best) {
                best = action;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::model::tests::round;

    #[test]
    fn test_untried_arm_first() {
        let mut bandit = ActionBandit::default();
        assert_eq!(bandit.decide(), Action::Factor);
        bandit.record(Action::Factor, 0.05);
        assert_eq!(bandit.decide(), Action::Model);
    }

    #[test]
    fn test_prefers_higher_reward() {
        let mut bandit = ActionBandit::new(0.1);
        for _ in 0..10 {
            bandit.record(Action::Factor, 0.01);
            bandit.record(Action::Model, 0.08);
        }
        assert_eq!(bandit.decide(), Action::Model);
    }

    #[test]
    fn test_from_trace() {
        let mut r1 = round(Some(Action::Factor), "f", false);
        r1.experiment.metrics.insert("IC".into(), 0.03);
        let r2 = round(None, "unlabelled", false);
        let trace = Trace { hist: vec![r1, r2] };

        let bandit = ActionBandit::from_trace(&trace, DEFAULT_REWARD_METRIC);
        assert_eq!(bandit.pulls(Action::Factor), 1);
        assert_eq!(bandit.pulls(Action::Model), 0);
        assert_eq!(bandit.decide(), Action::Model);
    }
}
