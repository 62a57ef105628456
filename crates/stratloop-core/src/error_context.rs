//! Error Context Extractor: reduce a failed run's output to the excerpt
//! worth sending with a repair request.

use serde::{Deserialize, Serialize};

/// How an excerpt was located.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Window around the first exception/traceback line.
    Fault,
    /// Window spanning empty-data / out-of-range indications.
    SoftFailure,
    /// Neither found; the last lines of output.
    Tail,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Fault => "fault",
            ErrorKind::SoftFailure => "soft_failure",
            ErrorKind::Tail => "tail",
        }
    }
}

/// The excerpt handed to the next fix request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub excerpt: String,
    pub iteration: u32,
    pub kind: ErrorKind,
}

impl ErrorContext {
    pub fn line_count(&self) -> usize {
        self.excerpt.lines().count()
    }
}

/// Markers are plain, case-sensitive substrings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorContextConfig {
    pub fault_markers: Vec<String>,
    /// Lines kept on each side of the first fault line.
    pub fault_window: usize,
    pub soft_markers: Vec<String>,
    /// Lines kept before the first soft marker.
    pub soft_lead: usize,
    /// Lines kept after the last soft marker.
    pub soft_trail: usize,
    pub tail_lines: usize,
}

impl Default for ErrorContextConfig {
    fn default() -> Self {
        let soft = [
            "未获取到",
            "服务器内部错误",
            "API请求",
            "数据请求开始",
            "未能获取任何数据",
            "警告",
            "没有数据",
            "数据为空",
            "min() arg is an empty sequence",
            "empty DataFrame",
            "index out of bounds",
            "IndexError",
            "没有找到",
            "无法获取",
            "数据不可用",
            "缺少数据",
            "empty data",
            "zero-size array",
            "无效的日期范围",
            "期间没有交易数据",
            "无法下载",
        ];
        Self {
            fault_markers: ["Error", "Exception", "Traceback"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fault_window: 50,
            soft_markers: soft.iter().map(|s| s.to_string()).collect(),
            soft_lead: 10,
            soft_trail: 20,
            tail_lines: 50,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErrorContextExtractor {
    config: ErrorContextConfig,
}

impl ErrorContextExtractor {
    pub fn new(config: ErrorContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ErrorContextConfig {
        &self.config
    }

    /// Pick the excerpt of `output` for fix attempt `iteration`.
    pub fn extract(&self, output: &str, iteration: u32) -> ErrorContext {
        let lines: Vec<&str> = output.lines().collect();
        let (range, kind) = self
            .fault_window(&lines)
            .map(|r| (r, ErrorKind::Fault))
            .or_else(|| self.soft_window(&lines).map(|r| (r, ErrorKind::SoftFailure)))
            .unwrap_or_else(|| {
                let start = lines.len().saturating_sub(self.config.tail_lines);
                (start..lines.len(), ErrorKind::Tail)
            });

        ErrorContext {
            excerpt: lines[range].join("\n"),
            iteration,
            kind,
        }
    }

    fn fault_window(&self, lines: &[&str]) -> Option<std::ops::Range<usize>> {
        let hit = lines
            .iter()
            .position(|line| contains_any(line, &self.config.fault_markers))?;
        let start = hit.saturating_sub(self.config.fault_window);
        let end = (hit + self.config.fault_window + 1).min(lines.len());
        Some(start..end)
    }

    fn soft_window(&self, lines: &[&str]) -> Option<std::ops::Range<usize>> {
        let hits: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| contains_any(line, &self.config.soft_markers))
            .map(|(i, _)| i)
            .collect();
        let first = *hits.first()?;
        let last = *hits.last()?;
        let start = first.saturating_sub(self.config.soft_lead);
        let end = (last + self.config.soft_trail).min(lines.len());
        Some(start..end.max(last + 1))
    }
}

fn contains_any(line: &str, markers: &[String]) -> bool {
    markers.iter().any(|m| line.contains(m.as_str()))
}
