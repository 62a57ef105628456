use stratloop_core::{CodeExtractor, ExtractionRules, Preference};

const WITH_ENTRY: &str = r#"import pandas as pd

def strategy_function(bars):
    return bars

if __name__ == "__main__":
    run()"#;

const LONG_WITHOUT_ENTRY: &str = r#"import numpy as np
from collections import deque

class MovingAverageStrategy:
    def __init__(self, fast=5, slow=20):
        self.fast = fast
        self.slow = slow
        self.prices = deque(maxlen=slow)

    def on_bar(self, price):
        self.prices.append(price)
        if len(self.prices) < self.slow:
            return None
        fast_ma = np.mean(list(self.prices)[-self.fast:])
        slow_ma = np.mean(self.prices)
        return "buy" if fast_ma > slow_ma else "sell""#;

fn fenced(code: &str) -> String {
    format!("```python\n{}\n```", code)
}

#[test]
fn entry_marker_block_wins_regardless_of_order_or_length() {
    let extractor = CodeExtractor::default();

    let first = format!(
        "Here you go:\n{}\nAnd an alternative:\n{}",
        fenced(WITH_ENTRY),
        fenced(LONG_WITHOUT_ENTRY)
    );
    let second = format!(
        "Helper first:\n{}\nThen the program:\n{}",
        fenced(LONG_WITHOUT_ENTRY),
        fenced(WITH_ENTRY)
    );

    assert!(LONG_WITHOUT_ENTRY.len() > WITH_ENTRY.len());
    assert_eq!(extractor.extract(&first).unwrap().source_text(), WITH_ENTRY);
    assert_eq!(extractor.extract(&second).unwrap().source_text(), WITH_ENTRY);
}

#[test]
fn prose_only_response_yields_none() {
    let extractor = CodeExtractor::default();
    let response = "I could not build that strategy.\nPlease give me the instrument\nand the date range.";
    assert!(extractor.extract(response).is_none());
}

#[test]
fn invalid_fenced_block_is_skipped_for_valid_one() {
    let extractor = CodeExtractor::default();
    let response = format!(
        "```\npip install pandas\n```\n\n{}",
        fenced(WITH_ENTRY)
    );
    assert_eq!(extractor.extract(&response).unwrap().source_text(), WITH_ENTRY);
}

#[test]
fn unbalanced_block_is_rejected() {
    let extractor = CodeExtractor::default();
    let broken = "import os\ndef initialize(ctx:\n    pass";
    assert!(extractor.extract(&fenced(broken)).is_none());
}

#[test]
fn unfenced_code_is_found_between_prose() {
    let extractor = CodeExtractor::default();
    let response = format!(
        "Sure, below is the full program.\n{}\nRun it with python.",
        WITH_ENTRY
    );
    let artifact = extractor.extract(&response).unwrap();
    assert!(artifact.source_text().starts_with("import pandas as pd"));
    assert!(artifact.source_text().contains("if __name__ == \"__main__\":"));
    assert!(!artifact.source_text().contains("Run it with python"));
}

#[test]
fn prose_starting_with_a_keyword_ends_the_unfenced_run() {
    let extractor = CodeExtractor::default();
    let response = "import pandas as pd\n\ndef strategy_function(ctx):\n    x = ctx.close\n    return x\n\nif you run it, don't forget to set the symbol.";
    let artifact = extractor.extract(response).unwrap();
    assert!(artifact.source_text().contains("def strategy_function"));
    assert!(artifact.source_text().ends_with("return x"));
    assert!(!artifact.source_text().contains("don't forget"));
}

#[test]
fn short_unfenced_runs_are_ignored() {
    let extractor = CodeExtractor::default();
    let response = "Try this:\nimport os\n    x = 1\nthat is all.";
    assert!(extractor.extract(response).is_none());
}

#[test]
fn preference_order_is_configurable() {
    let rules = ExtractionRules {
        preference: vec![Preference::Longest],
        ..ExtractionRules::default()
    };
    let extractor = CodeExtractor::new(rules).unwrap();
    let response = format!("{}\n{}", fenced(WITH_ENTRY), fenced(LONG_WITHOUT_ENTRY));
    assert_eq!(
        extractor.extract(&response).unwrap().source_text(),
        LONG_WITHOUT_ENTRY
    );
}

#[test]
fn strategy_marker_beats_longer_plain_block() {
    let extractor = CodeExtractor::default();
    let plain = format!(
        "import os\n\ndef helper(path):\n    return os.path.join(path, \"{}\")",
        "d".repeat(220)
    );
    let strategy = "import os\n\ndef initialize(context):\n    context.symbol = \"rb888\"";
    let response = format!("{}\n{}", fenced(&plain), fenced(strategy));
    assert_eq!(extractor.extract(&response).unwrap().source_text(), strategy);
}
