use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use core_model::{
    ClassificationSignal, Classifier, CrmRecord, FieldSet, NormalizedMessage, RefineRequest,
    SyncError,
};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::{parse_field_set, parse_signal, parse_text, record_json};

/// Environment variable the classifier key is handed over in.
pub const CLASSIFIER_KEY_ENV: &str = "CONTACT_SYNC_CLASSIFIER_KEY";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Delegates to an external program, typically a model wrapper.
///
/// Each call writes one JSON request (`{"task": ..., ...}`) to the program's
/// stdin and reads the reply from stdout. Exit status 77 means the key was
/// rejected.
pub struct CommandClassifier {
    program: String,
    args: Vec<String>,
    key: Option<String>,
    timeout: Duration,
}

impl CommandClassifier {
    pub fn new(program: impl Into<String>, args: Vec<String>, key: Option<String>) -> Self {
        Self {
            program: program.into(),
            args,
            key,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn invoke(&self, request: &Value) -> Result<String, SyncError> {
        let task = request.get("task").and_then(Value::as_str).unwrap_or("?");
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(key) = &self.key {
            cmd.env(CLASSIFIER_KEY_ENV, key);
        }
        let mut child = cmd.spawn().map_err(|e| {
            SyncError::Transport(format!("cannot start classifier `{}`: {e}", self.program))
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.to_string().as_bytes())
                .await
                .map_err(SyncError::transport)?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SyncError::Transport(format!("classifier timed out on {task}")))?
            .map_err(SyncError::transport)?;
        if output.status.code() == Some(77) {
            return Err(SyncError::Authentication {
                service: "classifier".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if !output.status.success() {
            return Err(SyncError::Transport(format!(
                "classifier exited with {} on {task}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(task, bytes = output.stdout.len(), "classifier replied");
        String::from_utf8(output.stdout).map_err(|e| SyncError::ClassificationParse(e.to_string()))
    }
}

#[async_trait(?Send)]
impl Classifier for CommandClassifier {
    async fn classify(
        &self,
        message: &NormalizedMessage,
        existing: Option<&CrmRecord>,
    ) -> Result<ClassificationSignal, SyncError> {
        let request = json!({
            "task": "classify",
            "message": message,
            "existing": existing.map(record_json),
        });
        parse_signal(&self.invoke(&request).await?)
    }

    async fn summarize_thread(&self, messages: &[NormalizedMessage]) -> Result<String, SyncError> {
        let request = json!({ "task": "summarize", "messages": messages });
        Ok(parse_text(&self.invoke(&request).await?))
    }

    async fn refine(&self, request: &RefineRequest<'_>) -> Result<FieldSet, SyncError> {
        let fields: Vec<&str> = request.fields.iter().map(|f| f.as_str()).collect();
        let payload = json!({
            "task": "refine",
            "record": record_json(request.record),
            "messages": request.messages,
            "fields": fields,
            "guidance": request.guidance,
        });
        parse_field_set(&self.invoke(&payload).await?, request.fields)
    }

    async fn answer(&self, question: &str, records: &[CrmRecord]) -> Result<String, SyncError> {
        let records: Vec<Value> = records.iter().map(record_json).collect();
        let request = json!({ "task": "answer", "question": question, "records": records });
        Ok(parse_text(&self.invoke(&request).await?))
    }
}
