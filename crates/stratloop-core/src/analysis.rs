//! Digest of a successful run, used to ask for a results analysis.

use std::sync::OnceLock;

use regex::Regex;

use crate::domain::ExecutionResult;

const KEY_INDICATORS: &[&str] = &[
    "总交易次数",
    "盈利交易",
    "亏损交易",
    "胜率",
    "初始权益",
    "期末权益",
    "净值",
    "总净盈亏",
    "总手续费",
    "盈亏比",
    "最大回撤",
    "年化收益率",
    "夏普比率",
    "Total trades",
    "Win rate",
    "Max drawdown",
    "Annual return",
    "Sharpe",
];

struct DigestPatterns {
    summary: Regex,
    trades: Regex,
    indicators: Vec<(&'static str, Regex)>,
}

fn patterns() -> &'static DigestPatterns {
    static PATTERNS: OnceLock<DigestPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| DigestPatterns {
        summary: Regex::new(r"(?s)(?:回测结果摘要|Backtest summary)\s*[:：](.*?)(?:\n\s*\n|\z)")
            .expect("summary pattern compiles"),
        trades: Regex::new(r"(?s)(?:交易明细|Trades)\s*[:：](.*?)(?:\n\s*\n|\z)")
            .expect("trades pattern compiles"),
        indicators: KEY_INDICATORS
            .iter()
            .map(|name| {
                let re = Regex::new(&format!(
                    r"{}\s*[:：]\s*(-?[\d.,]+%?)",
                    regex::escape(name)
                ))
                .expect("indicator pattern compiles");
                (*name, re)
            })
            .collect(),
    })
}

/// Indicator values found in `output`, in catalogue order.
pub fn key_indicators(output: &str) -> Vec<(&'static str, String)> {
    patterns()
        .indicators
        .iter()
        .filter_map(|(name, re)| {
            re.captures(output)
                .and_then(|c| c.get(1))
                .map(|m| (*name, m.as_str().to_string()))
        })
        .collect()
}

/// Compact text describing a run: summary block, key indicators, trade
/// list and result files. Falls back to the output tail when the run
/// printed no recognisable summary.
pub fn results_digest(execution: &ExecutionResult) -> String {
    let output = &execution.combined_output;
    let p = patterns();
    let mut digest = String::new();

    let summary = p
        .summary
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());
    match &summary {
        Some(text) => {
            digest.push_str("## Summary\n");
            digest.push_str(text);
            digest.push_str("\n\n");
        }
        None => {
            digest.push_str("## Output (tail)\n");
            digest.push_str(&execution.output_tail(40));
            digest.push_str("\n\n");
        }
    }

    let indicators = key_indicators(output);
    if !indicators.is_empty() {
        digest.push_str("## Key indicators\n");
        for (name, value) in &indicators {
            digest.push_str(&format!("- {}: {}\n", name, value));
        }
        digest.push('\n');
    }

    if let Some(trades) = p.trades.captures(output).and_then(|c| c.get(1)) {
        digest.push_str("## Trades\n");
        digest.push_str(trades.as_str().trim());
        digest.push_str("\n\n");
    }

    if !execution.derived_paths.is_empty() {
        digest.push_str("## Result files\n");
        for path in &execution.derived_paths {
            digest.push_str(&format!("- {}\n", path.display()));
        }
    }

    digest.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_digest_collects_summary_and_indicators() {
        let output = "\
loading data
回测结果摘要:
[2024-12-31] 总交易次数: 42
[2024-12-31] 胜率: 55.5%
[2024-12-31] 最大回撤: 12.3%

交易明细:
2024-03-01 BUY 3500
2024-03-09 SELL 3620
";
        let execution = ExecutionResult::success(output, vec![PathBuf::from("chart_1.png")]);
        let digest = results_digest(&execution);

        assert!(digest.starts_with("## Summary"));
        assert!(digest.contains("- 胜率: 55.5%"));
        assert!(digest.contains("- 最大回撤: 12.3%"));
        assert!(digest.contains("2024-03-09 SELL 3620"));
        assert!(digest.ends_with("- chart_1.png"));
    }

    #[test]
    fn test_digest_without_summary_uses_tail() {
        let execution = ExecutionResult::success("a\nb\nSharpe: 1.8", Vec::new());
        let digest = results_digest(&execution);
        assert!(digest.starts_with("## Output (tail)"));
        assert!(digest.contains("- Sharpe: 1.8"));
    }
}
