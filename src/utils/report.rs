//! 審核與比對共用的檢查清單與主控台輸出

const GREEN: &str = "\x1b[92m";
const YELLOW: &str = "\x1b[93m";
const RED: &str = "\x1b[91m";
const END: &str = "\x1b[0m";

#[derive(Debug, Clone, PartialEq)]
pub enum CheckStatus {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub title: String,
    pub status: CheckStatus,
    pub message: String,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Checklist {
    pub results: Vec<CheckResult>,
}

impl Checklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// 記錄一項檢查，回傳條件本身方便串接
    pub fn check(
        &mut self,
        title: impl Into<String>,
        condition: bool,
        pass_msg: impl Into<String>,
        fail_msg: impl Into<String>,
        details: Option<String>,
    ) -> bool {
        let (status, message) = if condition {
            (CheckStatus::Pass, pass_msg.into())
        } else {
            (CheckStatus::Fail, fail_msg.into())
        };
        self.results.push(CheckResult {
            title: title.into(),
            status,
            message,
            details: if condition { None } else { details },
        });
        condition
    }

    pub fn skip(&mut self, title: impl Into<String>, reason: impl Into<String>) {
        self.results.push(CheckResult {
            title: title.into(),
            status: CheckStatus::Skip,
            message: reason.into(),
            details: None,
        });
    }

    pub fn passed(&self) -> usize {
        self.count(CheckStatus::Pass)
    }

    pub fn failed(&self) -> usize {
        self.count(CheckStatus::Fail)
    }

    fn count(&self, status: CheckStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for result in &self.results {
            out.push_str(&format!("\n--- {} ---\n", result.title));
            let tag = match result.status {
                CheckStatus::Pass => format!("{}[PASS]{}", GREEN, END),
                CheckStatus::Fail => format!("{}[FAIL]{}", RED, END),
                CheckStatus::Skip => format!("{}[SKIP]{}", YELLOW, END),
            };
            out.push_str(&format!("{} {}\n", tag, result.message));
            if let Some(details) = &result.details {
                out.push_str(details);
                out.push('\n');
            }
        }
        out
    }

    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("總計檢查項: {}\n", self.passed() + self.failed()));
        out.push_str(&format!("  - {}通過: {}{}\n", GREEN, self.passed(), END));
        out.push_str(&format!("  - {}失敗: {}{}\n", RED, self.failed(), END));
        out
    }
}

pub fn section(title: &str) -> String {
    let bar = "=".repeat(80);
    format!("\n{}\n=== {:^74} ===\n{}", bar, title, bar)
}

/// 取前 n 個元素作為樣例輸出
pub fn sample<T: std::fmt::Display>(items: &[T], n: usize) -> String {
    let shown: Vec<String> = items.iter().take(n).map(|i| i.to_string()).collect();
    if items.len() > n {
        format!("[{}, ...]", shown.join(", "))
    } else {
        format!("[{}]", shown.join(", "))
    }
}
