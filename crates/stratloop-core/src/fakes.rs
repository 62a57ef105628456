//! In-memory [`StrategyRunner`] for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::{CodeArtifact, ExecutionError, ExecutionResult};
use crate::runner::StrategyRunner;

enum Scripted {
    Result(ExecutionResult),
    SpawnFailure(String),
}

/// Runner that replays queued results and records every artifact it was
/// asked to run. Once the queue is drained the `repeat` result (if any) is
/// returned; otherwise the run fails to spawn.
#[derive(Default)]
pub struct ScriptedRunner {
    queue: Mutex<VecDeque<Scripted>>,
    repeat: Mutex<Option<ExecutionResult>>,
    artifacts: Mutex<Vec<CodeArtifact>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results<I>(results: I) -> Self
    where
        I: IntoIterator<Item = ExecutionResult>,
    {
        let runner = Self::new();
        for result in results {
            runner.push_result(result);
        }
        runner
    }

    /// A runner whose every run fails with `output`.
    pub fn always_failing(output: impl Into<String>) -> Self {
        Self::new().repeating(ExecutionResult::failure(Some(1), output))
    }

    pub fn repeating(self, result: ExecutionResult) -> Self {
        *self.repeat.lock().unwrap() = Some(result);
        self
    }

    pub fn push_result(&self, result: ExecutionResult) {
        self.queue
            .lock()
            .unwrap()
            .push_back(Scripted::Result(result));
    }

    /// Queue a resource failure (the process cannot be spawned).
    pub fn push_spawn_failure(&self, program: impl Into<String>) {
        self.queue
            .lock()
            .unwrap()
            .push_back(Scripted::SpawnFailure(program.into()));
    }

    pub fn run_count(&self) -> usize {
        self.artifacts.lock().unwrap().len()
    }

    /// Every artifact run so far, oldest first.
    pub fn artifacts(&self) -> Vec<CodeArtifact> {
        self.artifacts.lock().unwrap().clone()
    }
}

#[async_trait]
impl StrategyRunner for ScriptedRunner {
    async fn run(
        &self,
        artifact: &CodeArtifact,
        mut sink: Option<&mut (dyn for<'a> FnMut(&'a str) + Send)>,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.artifacts.lock().unwrap().push(artifact.clone());
        let scripted = self.queue.lock().unwrap().pop_front();
        let result = match scripted {
            Some(Scripted::Result(result)) => result,
            Some(Scripted::SpawnFailure(program)) => {
                return Err(ExecutionError::Spawn {
                    program,
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted"),
                })
            }
            None => match self.repeat.lock().unwrap().clone() {
                Some(result) => result,
                None => {
                    return Err(ExecutionError::Spawn {
                        program: "scripted".to_string(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "no scripted result left",
                        ),
                    })
                }
            },
        };

        if let Some(sink) = sink.as_deref_mut() {
            for line in result.combined_output.lines() {
                sink(line);
            }
        }
        Ok(result)
    }
}
