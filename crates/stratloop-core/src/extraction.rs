//! Code Extraction Engine: pick the single code block a model response
//! most likely intends as its deliverable.
//!
//! Fenced blocks are tried first. Only when none of them passes the
//! validity check are unfenced runs of indented or keyword-led lines
//! considered. Among valid candidates the configured preference order
//! decides; nothing is ever executed.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{CodeArtifact, ForgeError, Result};

/// One ranking criterion for choosing between valid candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preference {
    /// Contains a program-entry marker.
    EntryMarker,
    /// Contains a strategy-definition marker.
    StrategyMarker,
    /// Any candidate; the longest wins.
    Longest,
}

/// Matching rules. Marker fields are regular expressions; keyword fields
/// are plain words.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionRules {
    pub entry_markers: Vec<String>,
    pub strategy_markers: Vec<String>,
    pub structural_keywords: Vec<String>,
    /// Words that always start a code line in unfenced text.
    pub line_start_keywords: Vec<String>,
    /// Words that start a code line only when the line ends with `:`.
    pub block_keywords: Vec<String>,
    pub min_plausible_len: usize,
    pub min_unfenced_len: usize,
    pub preference: Vec<Preference>,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            entry_markers: vec![r#"if\s+__name__\s*==\s*["']__main__["']\s*:"#.to_string()],
            strategy_markers: vec![
                r"def\s+strategy_function\b".to_string(),
                r"def\s+initialize\b".to_string(),
                r"class\s+\w*Strategy\b".to_string(),
            ],
            structural_keywords: ["def", "class", "import", "from"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            line_start_keywords: ["import", "from", "class", "def"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            block_keywords: ["if", "elif", "else", "for", "while", "try", "except", "with"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_plausible_len: 200,
            min_unfenced_len: 50,
            preference: vec![
                Preference::EntryMarker,
                Preference::StrategyMarker,
                Preference::Longest,
            ],
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    text: String,
    position: usize,
}

/// Compiled extraction rules.
#[derive(Debug, Clone)]
pub struct CodeExtractor {
    rules: ExtractionRules,
    fence: Regex,
    entry: Vec<Regex>,
    strategy: Vec<Regex>,
    structural: Option<Regex>,
    line_start: Option<Regex>,
    block_start: Option<Regex>,
}

impl Default for CodeExtractor {
    fn default() -> Self {
        Self::new(ExtractionRules::default()).expect("built-in extraction rules compile")
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ForgeError::InvalidRule {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

fn word_alternation(words: &[String], anchored: bool) -> Result<Option<Regex>> {
    if words.is_empty() {
        return Ok(None);
    }
    let alternation = words
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join("|");
    let pattern = if anchored {
        format!(r"^(?:{})(?:\s|\(|:|$)", alternation)
    } else {
        format!(r"\b(?:{})\b", alternation)
    };
    compile(&pattern).map(Some)
}

impl CodeExtractor {
    pub fn new(rules: ExtractionRules) -> Result<Self> {
        let fence = compile(r"(?s)```(?:[A-Za-z0-9_+.\-]*[ \t]*\r?\n)?(.*?)```")?;
        let entry = rules
            .entry_markers
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>>>()?;
        let strategy = rules
            .strategy_markers
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>>>()?;
        let structural = word_alternation(&rules.structural_keywords, false)?;
        let line_start = word_alternation(&rules.line_start_keywords, true)?;
        let block_start = word_alternation(&rules.block_keywords, true)?;

        Ok(Self {
            rules,
            fence,
            entry,
            strategy,
            structural,
            line_start,
            block_start,
        })
    }

    pub fn rules(&self) -> &ExtractionRules {
        &self.rules
    }

    /// Extract the best code artifact from `response`, or `None` when the
    /// response contains no plausible code. A miss is a normal outcome.
    pub fn extract(&self, response: &str) -> Option<CodeArtifact> {
        let fenced: Vec<Candidate> = self
            .fenced_blocks(response)
            .into_iter()
            .filter(|c| self.is_valid(&c.text))
            .collect();

        let (source, pool) = if !fenced.is_empty() {
            ("fenced", fenced)
        } else {
            let unfenced: Vec<Candidate> = self
                .unfenced_runs(response)
                .into_iter()
                .filter(|c| c.text.chars().count() >= self.rules.min_unfenced_len)
                .filter(|c| self.is_valid(&c.text))
                .collect();
            ("unfenced", unfenced)
        };

        let candidates = pool.len();
        let chosen = self.select(pool)?;
        debug!(source, candidates, chars = chosen.text.len(), "extracted code block");
        Some(CodeArtifact::new(chosen.text, response))
    }

    /// Whether `code` passes the plausibility check.
    pub fn is_valid(&self, code: &str) -> bool {
        let has_keyword = self
            .structural
            .as_ref()
            .map(|re| re.is_match(code))
            .unwrap_or(true);
        if !has_keyword {
            return false;
        }

        let indented = code
            .lines()
            .any(|l| (l.starts_with(' ') || l.starts_with('\t')) && !l.trim().is_empty());
        if !indented {
            return false;
        }

        if !brackets_balanced(code) {
            return false;
        }

        self.has_entry_marker(code)
            || self.has_strategy_marker(code)
            || code.chars().count() > self.rules.min_plausible_len
    }

    fn has_entry_marker(&self, code: &str) -> bool {
        self.entry.iter().any(|re| re.is_match(code))
    }

    fn has_strategy_marker(&self, code: &str) -> bool {
        self.strategy.iter().any(|re| re.is_match(code))
    }

    fn fenced_blocks(&self, response: &str) -> Vec<Candidate> {
        self.fence
            .captures_iter(response)
            .filter_map(|caps| caps.get(1))
            .map(|m| Candidate {
                text: m
                    .as_str()
                    .trim_start_matches(|c: char| c == '\n' || c == '\r')
                    .trim_end()
                    .to_string(),
                position: m.start(),
            })
            .filter(|c| !c.text.trim().is_empty())
            .collect()
    }

    fn is_code_line(&self, line: &str) -> bool {
        if line.trim().is_empty() {
            return false;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            return true;
        }
        let starts = |re: &Option<Regex>| re.as_ref().map(|re| re.is_match(line)).unwrap_or(false);
        starts(&self.line_start) || (line.trim_end().ends_with(':') && starts(&self.block_start))
    }

    fn unfenced_runs(&self, response: &str) -> Vec<Candidate> {
        let mut runs = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut start = 0;
        let mut offset = 0;

        for line in response.split('\n') {
            if self.is_code_line(line) {
                if current.is_empty() {
                    start = offset;
                }
                current.push(line);
            } else if !current.is_empty() && line.trim().is_empty() {
                current.push(line);
            } else if !current.is_empty() {
                runs.push(finish_run(&current, start));
                current.clear();
            }
            offset += line.len() + 1;
        }
        if !current.is_empty() {
            runs.push(finish_run(&current, start));
        }
        runs
    }

    fn satisfies(&self, candidate: &Candidate, preference: Preference) -> bool {
        match preference {
            Preference::EntryMarker => self.has_entry_marker(&candidate.text),
            Preference::StrategyMarker => self.has_strategy_marker(&candidate.text),
            Preference::Longest => true,
        }
    }

    fn select(&self, candidates: Vec<Candidate>) -> Option<Candidate> {
        let mut pool = candidates;
        for preference in &self.rules.preference {
            if pool.iter().any(|c| self.satisfies(c, *preference)) {
                pool.retain(|c| self.satisfies(c, *preference));
                break;
            }
        }

        pool.sort_by_key(|c| c.position);
        let mut best: Option<Candidate> = None;
        for candidate in pool {
            let longer = best
                .as_ref()
                .map(|b| candidate.text.chars().count() > b.text.chars().count())
                .unwrap_or(true);
            if longer {
                best = Some(candidate);
            }
        }
        best
    }
}

fn finish_run(lines: &[&str], position: usize) -> Candidate {
    Candidate {
        text: lines.join("\n").trim_end().to_string(),
        position,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Scan {
    Code,
    Comment,
    Str { quote: char, triple: bool },
}

/// Bracket balance ignoring string literals and `#` comments.
/// An unterminated string counts as unbalanced.
fn brackets_balanced(code: &str) -> bool {
    let chars: Vec<char> = code.chars().collect();
    let mut stack: Vec<char> = Vec::new();
    let mut state = Scan::Code;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match state {
            Scan::Comment => {
                if c == '\n' {
                    state = Scan::Code;
                }
            }
            Scan::Str { quote, triple } => {
                if c == '\\' {
                    i += 1;
                } else if triple {
                    if c == quote && chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
                        state = Scan::Code;
                        i += 2;
                    }
                } else if c == quote {
                    state = Scan::Code;
                } else if c == '\n' {
                    return false;
                }
            }
            Scan::Code => match c {
                '#' => state = Scan::Comment,
                '"' | '\'' => {
                    let triple = chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c);
                    state = Scan::Str { quote: c, triple };
                    if triple {
                        i += 2;
                    }
                }
                '(' | '[' | '{' => stack.push(c),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    if stack.pop() != Some(expected) {
                        return false;
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }

    stack.is_empty() && !matches!(state, Scan::Str { .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brackets_ignore_strings_and_comments() {
        assert!(brackets_balanced("print(')')  # (\n"));
        assert!(brackets_balanced("x = [1, {'a': (2, 3)}]"));
        assert!(brackets_balanced("s = \"\"\"doc ( [ \n more\"\"\"\nf(s)"));
        assert!(!brackets_balanced("f(1, 2"));
        assert!(!brackets_balanced("f(1]"));
        assert!(!brackets_balanced("s = 'open"));
    }

    #[test]
    fn test_validity_requires_indentation() {
        let extractor = CodeExtractor::default();
        assert!(!extractor.is_valid("import os\ndef strategy_function(): pass"));
        assert!(extractor.is_valid("import os\ndef strategy_function():\n    pass"));
    }

    #[test]
    fn test_validity_requires_marker_or_length() {
        let extractor = CodeExtractor::default();
        let short = "import os\ndef helper():\n    return 1";
        assert!(!extractor.is_valid(short));

        let long = format!("{}\n    # {}", short, "x".repeat(200));
        assert!(extractor.is_valid(&long));
    }

    #[test]
    fn test_strategy_class_marker() {
        let extractor = CodeExtractor::default();
        assert!(extractor.is_valid("class DualMaStrategy:\n    pass"));
        assert!(!extractor.is_valid("class Helper:\n    pass"));
    }

    #[test]
    fn test_invalid_rule_is_reported() {
        let rules = ExtractionRules {
            entry_markers: vec!["(unclosed".to_string()],
            ..ExtractionRules::default()
        };
        let err = CodeExtractor::new(rules).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidRule { ref pattern, .. } if pattern == "(unclosed"));
    }

    #[test]
    fn test_fence_language_tag_is_not_part_of_code() {
        let extractor = CodeExtractor::default();
        let response = "```python\nimport os\ndef initialize():\n    pass\n```";
        let artifact = extractor.extract(response).unwrap();
        assert!(artifact.source_text().starts_with("import os"));
        assert_eq!(artifact.origin_response(), response);
    }
}
