//! Model backend that delegates every call to an external worker program.
//!
//! Protocol, one process per call:
//! - argv: `<program> <args...> <op>`
//! - stdin: one JSON request object, then EOF
//! - stdout: NDJSON events, `start`, any number of `progress`, then exactly
//!   one of `done` (carrying `result`) or `error`
//!
//! Non-JSON stdout lines are logged and ignored. stderr is kept for the
//! error message when the process exits non-zero.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::backend::{
    metrics_from_value, Artifact, BackendError, FitData, FitOutcome, Metrics, ModelBackend,
    Result, SplitRef, TrainConfig,
};

const STDERR_TAIL: usize = 2048;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum BackendEvent {
    #[serde(rename = "start")]
    Start,

    #[serde(rename = "progress")]
    Progress {
        #[serde(default)]
        epoch: Option<u32>,
        #[serde(default)]
        step: Option<u32>,
        #[serde(default)]
        loss: Option<f64>,
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(rename = "done")]
    Done {
        #[serde(default)]
        result: JsonValue,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Clone, Debug)]
pub struct ProcessBackend {
    program: PathBuf,
    args: Vec<String>,
    work_dir: Option<PathBuf>,
}

impl ProcessBackend {
    /// `program` is typically an interpreter and `args` the worker script.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            work_dir: None,
        }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    fn run(&self, op: &str, request: &JsonValue) -> Result<JsonValue> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(op);
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(op, program = %self.program.display(), "backend: spawning worker");
        let mut child = cmd.spawn().map_err(BackendError::Spawn)?;

        // Drain stderr on its own thread so a chatty worker cannot block on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        let outcome = match Self::exchange(op, request, &mut child) {
            Ok(outcome) => outcome,
            Err(e) => {
                reap(&mut child, op);
                return Err(e);
            }
        };

        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        match outcome {
            Some(Err(message)) => Err(BackendError::Worker(message)),
            Some(Ok(_)) | None if !status.success() => {
                warn!(op, %status, "backend: worker exited non-zero");
                Err(BackendError::Exit {
                    status: status.to_string(),
                    stderr: tail(&stderr, STDERR_TAIL),
                })
            }
            Some(Ok(result)) => Ok(result),
            None => Err(BackendError::Protocol(format!(
                "worker exited without a done event for {op}"
            ))),
        }
    }

    /// Sends the request and reads events until stdout closes.
    fn exchange(
        op: &str,
        request: &JsonValue,
        child: &mut Child,
    ) -> Result<Option<std::result::Result<JsonValue, String>>> {
        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| BackendError::Protocol("worker stdin unavailable".into()))?;
            let bytes = serde_json::to_vec(request)
                .map_err(|e| BackendError::Protocol(e.to_string()))?;
            stdin.write_all(&bytes)?;
            stdin.write_all(b"\n")?;
            // dropping stdin closes it
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Protocol("worker stdout unavailable".into()))?;

        let mut outcome = None;
        for line in BufReader::new(stdout).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<BackendEvent>(line) {
                Ok(BackendEvent::Start) => debug!(op, "backend: worker started"),
                Ok(BackendEvent::Progress {
                    epoch,
                    step,
                    loss,
                    message,
                }) => {
                    info!(op, ?epoch, ?step, ?loss, message = message.as_deref().unwrap_or(""), "backend: progress");
                }
                Ok(BackendEvent::Done { result }) => {
                    outcome.get_or_insert(Ok(result));
                }
                Ok(BackendEvent::Error { message }) => {
                    outcome.get_or_insert(Err(message));
                }
                Err(_) => debug!(op, line, "backend: non-json stdout line"),
            }
        }
        Ok(outcome)
    }

    fn artifact_from(result: &JsonValue, input_shape: &[u32]) -> Result<Artifact> {
        let handle = result
            .get("handle")
            .cloned()
            .ok_or_else(|| BackendError::Protocol("result has no handle".into()))?;
        let input_shape = match result.get("input_shape") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| BackendError::Protocol(format!("bad input_shape: {e}")))?,
            None => input_shape.to_vec(),
        };
        Ok(Artifact {
            handle,
            input_shape,
        })
    }
}

/// Kills and waits a worker abandoned mid-conversation.
fn reap(child: &mut Child, op: &str) {
    if let Err(e) = child.kill() {
        debug!(op, error = %e, "backend: kill failed");
    }
    if let Err(e) = child.wait() {
        warn!(op, error = %e, "backend: could not wait for worker");
    }
}

fn tail(s: &str, max: usize) -> String {
    let s = s.trim_end();
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

impl ModelBackend for ProcessBackend {
    fn construct(&self, architecture: &JsonValue, input_shape: &[u32]) -> Result<Artifact> {
        let result = self.run(
            "construct",
            &json!({ "architecture": architecture, "input_shape": input_shape }),
        )?;
        Self::artifact_from(&result, input_shape)
    }

    fn configure(&self, artifact: &mut Artifact, config: &TrainConfig) -> Result<()> {
        let result = self.run("configure", &json!({ "artifact": artifact, "config": config }))?;
        // a worker may configure in place and return no new handle
        if result.get("handle").is_some() {
            *artifact = Self::artifact_from(&result, &artifact.input_shape)?;
        }
        Ok(())
    }

    fn fit(&self, artifact: &Artifact, data: &FitData, config: &TrainConfig) -> Result<FitOutcome> {
        let result = self.run(
            "fit",
            &json!({ "artifact": artifact, "data": data, "config": config }),
        )?;
        let trained = Self::artifact_from(&result, &artifact.input_shape)?;
        let history = result.get("history").cloned().unwrap_or(JsonValue::Null);
        let metrics = match result.get("metrics") {
            Some(v) => metrics_from_value(v, &config.metrics)?,
            None => Metrics::new(),
        };
        Ok(FitOutcome {
            artifact: trained,
            history,
            metrics,
        })
    }

    fn evaluate(&self, artifact: &Artifact, data: &SplitRef) -> Result<Metrics> {
        let result = self.run("evaluate", &json!({ "artifact": artifact, "data": data }))?;
        let names: Vec<String> = result
            .get("metrics_names")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let metrics = result.get("metrics").unwrap_or(&result);
        metrics_from_value(metrics, &names)
    }

    fn predict(&self, artifact: &Artifact, input: &JsonValue) -> Result<JsonValue> {
        let result = self.run("predict", &json!({ "artifact": artifact, "input": input }))?;
        Ok(result.get("output").cloned().unwrap_or(result))
    }

    fn save(&self, artifact: &Artifact, location: &Path) -> Result<()> {
        if let Some(parent) = location.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.run("save", &json!({ "artifact": artifact, "location": location }))?;
        Ok(())
    }

    fn load(&self, location: &Path) -> Result<Artifact> {
        if !location.exists() {
            return Err(BackendError::InvalidArtifact(format!(
                "no artifact at {}",
                location.display()
            )));
        }
        let result = self.run("load", &json!({ "location": location }))?;
        Self::artifact_from(&result, &[])
    }
}
