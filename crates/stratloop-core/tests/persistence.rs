use stratloop_core::controller::RepairSession;
use stratloop_core::persistence::{content_digest, suggested_name};
use stratloop_core::{
    read_session_artifact, save_strategy, write_session_artifact, ForgeError, Message,
    SessionRecord, TradingParams,
};
use tempfile::TempDir;

const CODE: &str = "\"\"\"\n双均线交叉策略\n\"\"\"\nimport pandas as pd\n";

fn record() -> SessionRecord {
    let session: RepairSession = serde_json::from_value(serde_json::json!({
        "id": "6f1c1d0e-8a55-4b8e-9f4e-3a1d2b7c9e10",
        "request": "dual moving average",
        "iteration_count": 2,
        "current_artifact": null,
        "last_execution": null,
        "last_error": null,
        "state": "EXHAUSTED",
        "started_at": "2026-10-01T08:00:00Z",
        "finished_at": "2026-10-01T08:01:30Z"
    }))
    .unwrap();
    SessionRecord {
        session,
        params: TradingParams::default(),
        conversation: vec![
            Message::system("You write strategies."),
            Message::user("dual moving average"),
        ],
        outcome: None,
        recorded_at: chrono::Utc::now(),
    }
}

#[test]
fn named_save_uses_the_given_name() {
    let dir = TempDir::new().unwrap();
    let path = save_strategy(dir.path(), CODE, Some("dual_ma")).unwrap();

    assert_eq!(path, dir.path().join("dual_ma.py"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), CODE);

    let path = save_strategy(dir.path(), CODE, Some("already.py")).unwrap();
    assert_eq!(path, dir.path().join("already.py"));
}

#[test]
fn unnamed_save_uses_docstring_name_and_timestamp() {
    let dir = TempDir::new().unwrap();
    let path = save_strategy(&dir.path().join("out"), CODE, None).unwrap();

    let file_name = path.file_name().unwrap().to_str().unwrap().to_string();
    assert!(file_name.starts_with("双均线交叉策略_"));
    assert!(file_name.ends_with(".py"));
    // <name>_YYYYmmdd_HHMMSS.py
    let stamp = file_name
        .trim_start_matches("双均线交叉策略_")
        .trim_end_matches(".py");
    assert_eq!(stamp.len(), 15);
    assert_eq!(suggested_name("print(1)"), "strategy");
}

#[test]
fn session_artifact_round_trips() {
    let dir = TempDir::new().unwrap();
    let record = record();

    let path = write_session_artifact(&record, dir.path()).unwrap();
    assert_eq!(
        path,
        dir.path()
            .join("6f1c1d0e-8a55-4b8e-9f4e-3a1d2b7c9e10")
            .join("session.json")
    );

    let loaded = read_session_artifact(&record.session_id(), dir.path()).unwrap();
    assert_eq!(loaded, record);
}

#[test]
fn tampered_session_artifact_is_rejected() {
    let dir = TempDir::new().unwrap();
    let record = record();
    let path = write_session_artifact(&record, dir.path()).unwrap();

    let tampered = std::fs::read_to_string(&path)
        .unwrap()
        .replace("dual moving average", "triple moving average");
    std::fs::write(&path, &tampered).unwrap();

    let err = read_session_artifact(&record.session_id(), dir.path()).unwrap_err();
    match err {
        ForgeError::DigestMismatch { actual, .. } => {
            assert_eq!(actual, content_digest(tampered.as_bytes()))
        }
        other => panic!("unexpected error {:?}", other),
    }
}
