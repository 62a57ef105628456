//! Structured lifecycle events for the repair loop.
//!
//! Every event carries an `event` field so log pipelines can filter on it:
//! `loop.started`, `loop.iteration`, `loop.finished`,
//! `conversation.trimmed`, `execution.finished`.

use tracing::{info, warn};

/// Span that tags every event of one repair session with its id.
///
/// ```ignore
/// controller_future.instrument(session_span(&session.id.to_string())).await
/// ```
pub fn session_span(session_id: &str) -> tracing::Span {
    tracing::info_span!("stratloop.session", session_id = %session_id)
}

/// A repair loop began (`phase` is `generation`, `modification` or `run`).
pub fn emit_loop_started(session_id: &str, phase: &str, max_iterations: u32) {
    info!(
        event = "loop.started",
        session_id = %session_id,
        phase = %phase,
        max_iterations = max_iterations,
    );
}

/// A run failed and a fix attempt is about to be requested.
pub fn emit_loop_iteration(session_id: &str, iteration: u32, error_kind: &str, excerpt_lines: usize) {
    info!(
        event = "loop.iteration",
        session_id = %session_id,
        iteration = iteration,
        error_kind = %error_kind,
        lines = excerpt_lines,
    );
}

/// The loop reached a terminal state.
pub fn emit_loop_finished(session_id: &str, state: &str, iterations: u32, duration_ms: u64) {
    info!(
        event = "loop.finished",
        session_id = %session_id,
        state = %state,
        iterations = iterations,
        duration_ms = duration_ms,
    );
}

/// The conversation store dropped, collapsed or truncated history.
pub fn emit_conversation_trimmed(
    dropped: usize,
    truncated: usize,
    collapsed: bool,
    fail_safe: bool,
    tokens: usize,
) {
    if fail_safe {
        warn!(
            event = "conversation.trimmed",
            dropped = dropped,
            truncated = truncated,
            collapsed = collapsed,
            fail_safe = fail_safe,
            tokens = tokens,
        );
    } else {
        info!(
            event = "conversation.trimmed",
            dropped = dropped,
            truncated = truncated,
            collapsed = collapsed,
            tokens = tokens,
        );
    }
}

/// A strategy process exited.
pub fn emit_execution_finished(exit_code: Option<i32>, lines: usize, paths: usize, duration_ms: u64) {
    info!(
        event = "execution.finished",
        exit_code = ?exit_code,
        lines = lines,
        paths = paths,
        duration_ms = duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_span_enter() {
        let _entered = session_span("0b6f2c1e").entered();
        emit_loop_started("0b6f2c1e", "generation", 5);
        emit_loop_finished("0b6f2c1e", "SUCCEEDED", 0, 12);
    }
}
