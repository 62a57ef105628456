//! Fixed trading parameters folded into generation prompts.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Instrument, date range and bar period for a strategy request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingParams {
    pub symbol: String,
    pub start_date: String,
    pub end_date: String,
    pub period: String,
}

impl Default for TradingParams {
    fn default() -> Self {
        Self {
            symbol: "rb888".to_string(),
            start_date: "2024-01-01".to_string(),
            end_date: "2025-12-31".to_string(),
            period: "1d".to_string(),
        }
    }
}

struct ParamPatterns {
    symbol: Regex,
    start: Regex,
    end: Regex,
    period: Regex,
}

fn patterns() -> &'static ParamPatterns {
    static PATTERNS: OnceLock<ParamPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ParamPatterns {
        symbol: Regex::new(r"(?:\bsymbol\s*[=:]\s*|标的(?:是|为)?[\s:：]*)([A-Za-z0-9.]+)")
            .expect("static regex"),
        start: Regex::new(
            r"(?:\bstart\s*[=:]\s*|开始(?:日期|时间)(?:是|为)?[\s:：]*)(\d{4}[-/]\d{1,2}[-/]\d{1,2})",
        )
        .expect("static regex"),
        end: Regex::new(
            r"(?:\bend\s*[=:]\s*|(?:结束|截止)(?:日期|时间)(?:是|为)?[\s:：]*)(\d{4}[-/]\d{1,2}[-/]\d{1,2})",
        )
        .expect("static regex"),
        period: Regex::new(r"(?:\bperiod\s*[=:]\s*|(?:周期|K线)(?:是|为)?[\s:：]*)(\d*[mhdwMy])\b")
            .expect("static regex"),
    })
}

impl TradingParams {
    pub fn new(
        symbol: impl Into<String>,
        start_date: impl Into<String>,
        end_date: impl Into<String>,
        period: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            start_date: start_date.into(),
            end_date: end_date.into(),
            period: period.into(),
        }
    }

    /// Update fields mentioned in a free-form command such as
    /// `symbol=au888 start=2023-01-01 period=1h` or `标的为au888`.
    ///
    /// Returns the number of fields changed. Dates written with `/` are
    /// normalised to `-`.
    pub fn apply_command(&mut self, text: &str) -> usize {
        let p = patterns();
        let mut changed = 0;

        if let Some(symbol) = p.symbol.captures(text).and_then(|c| c.get(1)) {
            self.symbol = symbol.as_str().to_string();
            changed += 1;
        }
        if let Some(start) = p.start.captures(text).and_then(|c| c.get(1)) {
            self.start_date = start.as_str().replace('/', "-");
            changed += 1;
        }
        if let Some(end) = p.end.captures(text).and_then(|c| c.get(1)) {
            self.end_date = end.as_str().replace('/', "-");
            changed += 1;
        }
        if let Some(period) = p.period.captures(text).and_then(|c| c.get(1)) {
            self.period = period.as_str().to_string();
            changed += 1;
        }
        changed
    }

    /// Placeholder values for the generation template.
    pub fn template_values(&self) -> [(&'static str, &str); 4] {
        [
            ("symbol", self.symbol.as_str()),
            ("start_date", self.start_date.as_str()),
            ("end_date", self.end_date.as_str()),
            ("period", self.period.as_str()),
        ]
    }
}

impl std::fmt::Display for TradingParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}..{} @ {}",
            self.symbol, self.start_date, self.end_date, self.period
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_english_command() {
        let mut params = TradingParams::default();
        let changed = params.apply_command("symbol=au888 start=2023/1/5 end=2023-12-31 period=1h");
        assert_eq!(changed, 4);
        assert_eq!(params.symbol, "au888");
        assert_eq!(params.start_date, "2023-1-5");
        assert_eq!(params.end_date, "2023-12-31");
        assert_eq!(params.period, "1h");
    }

    #[test]
    fn test_apply_chinese_command() {
        let mut params = TradingParams::default();
        let changed = params.apply_command("标的为i888，开始日期：2022-01-01，周期是15m");
        assert_eq!(changed, 3);
        assert_eq!(params.symbol, "i888");
        assert_eq!(params.start_date, "2022-01-01");
        assert_eq!(params.period, "15m");
        assert_eq!(params.end_date, TradingParams::default().end_date);
    }

    #[test]
    fn test_unrelated_text_changes_nothing() {
        let mut params = TradingParams::default();
        assert_eq!(params.apply_command("make it more aggressive"), 0);
        assert_eq!(params, TradingParams::default());
    }
}
