//! On-disk artifacts: strategy files and digest-verified session records.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Local, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stratloop_llm::Message;
use tracing::debug;

use crate::controller::{RepairOutcome, RepairSession};
use crate::domain::{ForgeError, Result, TradingParams};

/// SHA-256 hex digest of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn docstring_name() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)(?:"""|''')\s*([^\n]*?策略)"#).expect("docstring pattern compiles")
    })
}

/// File stem for an unnamed strategy: the first "...策略" phrase of the
/// leading docstring when there is one, else `strategy`.
pub fn suggested_name(code: &str) -> String {
    docstring_name()
        .captures(code)
        .and_then(|c| c.get(1))
        .map(|m| {
            m.as_str()
                .trim()
                .chars()
                .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
                .collect::<String>()
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "strategy".to_string())
}

/// Write `code` into `dir`.
///
/// With a `name` the file is `<name>.py` (the extension is added when
/// missing). Without one it is `<suggested>_<YYYYmmdd_HHMMSS>.py`.
pub fn save_strategy(dir: &Path, code: &str, name: Option<&str>) -> Result<PathBuf> {
    let mut file_name = match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => format!(
            "{}_{}",
            suggested_name(code),
            Local::now().format("%Y%m%d_%H%M%S")
        ),
    };
    if !file_name.ends_with(".py") {
        file_name.push_str(".py");
    }

    std::fs::create_dir_all(dir)?;
    let path = dir.join(file_name);
    std::fs::write(&path, code)?;
    debug!(path = %path.display(), "strategy saved");
    Ok(path)
}

/// Everything worth keeping about one finished request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: RepairSession,
    pub params: TradingParams,
    pub conversation: Vec<Message>,
    pub outcome: Option<RepairOutcome>,
    pub recorded_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn session_id(&self) -> String {
        self.session.id.to_string()
    }
}

/// Persist `<dir>/<session_id>/session.json` and `<dir>/<session_id>/session.digest`.
pub fn write_session_artifact(record: &SessionRecord, dir: &Path) -> Result<PathBuf> {
    let session_dir = dir.join(record.session_id());
    std::fs::create_dir_all(&session_dir)?;

    let artifact_path = session_dir.join("session.json");
    let digest_path = session_dir.join("session.digest");
    let json = serde_json::to_vec_pretty(record)?;
    let digest = content_digest(&json);

    std::fs::write(&artifact_path, &json)?;
    std::fs::write(&digest_path, digest.as_bytes())?;

    Ok(artifact_path)
}

/// Read `<dir>/<session_id>/session.json`, verifying it against its digest.
pub fn read_session_artifact(session_id: &str, dir: &Path) -> Result<SessionRecord> {
    let session_dir = dir.join(session_id);
    let json = std::fs::read(session_dir.join("session.json"))?;
    let expected = std::fs::read_to_string(session_dir.join("session.digest"))?;
    let actual = content_digest(&json);
    if expected.trim() != actual {
        return Err(ForgeError::DigestMismatch {
            expected: expected.trim().to_string(),
            actual,
        });
    }

    Ok(serde_json::from_slice(&json)?)
}
