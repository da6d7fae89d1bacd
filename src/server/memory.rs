//! In-process server for tests.
//!
//! Every run created on a `MemoryServer` follows the same scripted
//! `Workflow`: it declares the given ports, stays running for a fixed number
//! of status polls, then finishes with the scripted exit code and outputs.

use super::{Run, Server};
use crate::error::{Error, Result};
use crate::model::{Credentials, InputPortInfo, OutputPort, PortValue, RunStatus};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct Workflow {
    inputs: Vec<(String, usize)>,
    outputs: Vec<OutputPort>,
    references: HashMap<String, Bytes>,
    bundle: Bytes,
    exit_code: i32,
    stdout: String,
    stderr: String,
    polls_until_finished: u32,
    stall_status: bool,
}

impl Default for Workflow {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            references: HashMap::new(),
            bundle: Bytes::from_static(b"<dataThingMap/>"),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            polls_until_finished: 2,
            stall_status: false,
        }
    }
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, name: &str, depth: usize) -> Self {
        self.inputs.push((name.to_string(), depth));
        self
    }

    pub fn output(mut self, port: OutputPort) -> Self {
        self.outputs.push(port);
        self
    }

    /// Payload served for a `PortValue::Reference` with this URI.
    pub fn reference(mut self, uri: &str, data: impl Into<Bytes>) -> Self {
        self.references.insert(uri.to_string(), data.into());
        self
    }

    pub fn bundle(mut self, data: impl Into<Bytes>) -> Self {
        self.bundle = data.into();
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn console(mut self, stdout: &str, stderr: &str) -> Self {
        self.stdout = stdout.to_string();
        self.stderr = stderr.to_string();
        self
    }

    pub fn polls_until_finished(mut self, polls: u32) -> Self {
        self.polls_until_finished = polls;
        self
    }

    /// Status requests on a running run never answer.
    pub fn stall_status(mut self) -> Self {
        self.stall_status = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredInput {
    Value(String),
    File { name: String, contents: Bytes },
}

#[derive(Debug)]
struct RunState {
    status: RunStatus,
    polls_left: u32,
    inputs: BTreeMap<String, StoredInput>,
    bundle_input: Option<(String, Bytes)>,
    bundle_output_requested: bool,
    created_at: OffsetDateTime,
    started_at: Option<OffsetDateTime>,
    finished_at: Option<OffsetDateTime>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    runs: HashMap<String, RunState>,
    deleted: Vec<String>,
    start_calls: usize,
}

#[derive(Debug, Clone)]
pub struct MemoryServer {
    workflow: Arc<Workflow>,
    state: Arc<Mutex<State>>,
}

impl MemoryServer {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow: Arc::new(workflow),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Ids of runs deleted so far, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    /// Number of times any run was asked to start.
    pub fn start_calls(&self) -> usize {
        self.lock().start_calls
    }

    pub fn run_count(&self) -> usize {
        self.lock().runs.len()
    }

    /// Inputs stored on a run, if it still exists.
    pub fn stored_inputs(&self, id: &str) -> Option<BTreeMap<String, StoredInput>> {
        self.lock().runs.get(id).map(|r| r.inputs.clone())
    }

    pub fn stored_bundle_input(&self, id: &str) -> Option<(String, Bytes)> {
        self.lock()
            .runs
            .get(id)
            .and_then(|r| r.bundle_input.clone())
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Server for MemoryServer {
    type Run = MemoryRun;

    async fn create_run(
        &self,
        workflow: Bytes,
        _credentials: Option<&Credentials>,
    ) -> Result<MemoryRun> {
        if workflow.is_empty() {
            return Err(Error::WorkflowRejected {
                reason: "empty workflow document".into(),
            });
        }
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("00000000-0000-4000-8000-{:012x}", state.next_id);
        state.runs.insert(
            id.clone(),
            RunState {
                status: RunStatus::Created,
                polls_left: self.workflow.polls_until_finished,
                inputs: BTreeMap::new(),
                bundle_input: None,
                bundle_output_requested: false,
                created_at: OffsetDateTime::now_utc(),
                started_at: None,
                finished_at: None,
            },
        );
        Ok(MemoryRun {
            id,
            workflow: self.workflow.clone(),
            state: self.state.clone(),
        })
    }

    async fn get_run(&self, id: &str, _credentials: Option<&Credentials>) -> Result<MemoryRun> {
        if !self.lock().runs.contains_key(id) {
            return Err(Error::RunNotFound { id: id.to_string() });
        }
        Ok(MemoryRun {
            id: id.to_string(),
            workflow: self.workflow.clone(),
            state: self.state.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MemoryRun {
    id: String,
    workflow: Arc<Workflow>,
    state: Arc<Mutex<State>>,
}

impl MemoryRun {
    fn with_run<T>(&self, f: impl FnOnce(&mut RunState) -> Result<T>) -> Result<T> {
        let mut state = lock(&self.state);
        let run = state.runs.get_mut(&self.id).ok_or_else(|| Error::RunNotFound {
            id: self.id.clone(),
        })?;
        f(run)
    }

    fn declared(&self, port: &str) -> Result<()> {
        if self.workflow.inputs.iter().any(|(name, _)| name == port) {
            Ok(())
        } else {
            Err(not_found(&format!("input/input/{port}")))
        }
    }
}

fn not_found(resource: &str) -> Error {
    Error::UnexpectedResponse {
        url: format!("memory:///{resource}"),
        status: 404,
        body: "no such resource".into(),
    }
}

#[async_trait]
impl Run for MemoryRun {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_time(&self) -> Result<Option<OffsetDateTime>> {
        self.with_run(|r| Ok(Some(r.created_at)))
    }

    async fn start_time(&self) -> Result<Option<OffsetDateTime>> {
        self.with_run(|r| Ok(r.started_at))
    }

    async fn finish_time(&self) -> Result<Option<OffsetDateTime>> {
        self.with_run(|r| Ok(r.finished_at))
    }

    async fn status(&self) -> Result<RunStatus> {
        if self.workflow.stall_status
            && self.with_run(|r| Ok(r.status == RunStatus::Running))?
        {
            return std::future::pending().await;
        }
        self.with_run(|r| {
            if r.status == RunStatus::Running {
                if r.polls_left == 0 {
                    r.status = RunStatus::Finished;
                    r.finished_at = Some(OffsetDateTime::now_utc());
                } else {
                    r.polls_left -= 1;
                }
            }
            Ok(r.status)
        })
    }

    async fn exit_code(&self) -> Result<Option<i32>> {
        let code = self.workflow.exit_code;
        self.with_run(|r| Ok((r.status == RunStatus::Finished).then_some(code)))
    }

    async fn console_output(&self) -> Result<String> {
        let out = self.workflow.stdout.clone();
        self.with_run(|r| Ok(if r.status.is_terminal() { out } else { String::new() }))
    }

    async fn console_error(&self) -> Result<String> {
        let err = self.workflow.stderr.clone();
        self.with_run(|r| Ok(if r.status.is_terminal() { err } else { String::new() }))
    }

    async fn start(&self) -> Result<()> {
        let declared = self.workflow.inputs.clone();
        let mut state = lock(&self.state);
        state.start_calls += 1;
        let run = state.runs.get_mut(&self.id).ok_or_else(|| Error::RunNotFound {
            id: self.id.clone(),
        })?;
        if run.status != RunStatus::Created {
            return Ok(());
        }
        if run.bundle_input.is_none() {
            let missing: Vec<String> = declared
                .into_iter()
                .map(|(name, _)| name)
                .filter(|name| !run.inputs.contains_key(name))
                .collect();
            if !missing.is_empty() {
                return Err(Error::InputsNotSet { names: missing });
            }
        }
        run.status = RunStatus::Running;
        run.started_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.runs.remove(&self.id).is_none() {
            return Err(Error::RunNotFound {
                id: self.id.clone(),
            });
        }
        state.deleted.push(self.id.clone());
        Ok(())
    }

    async fn input_ports(&self) -> Result<Vec<InputPortInfo>> {
        let declared = self.workflow.inputs.clone();
        self.with_run(|r| {
            Ok(declared
                .into_iter()
                .map(|(name, depth)| InputPortInfo {
                    is_set: r.bundle_input.is_some() || r.inputs.contains_key(&name),
                    name,
                    depth,
                })
                .collect())
        })
    }

    async fn set_input_value(&self, port: &str, value: &str) -> Result<()> {
        self.declared(port)?;
        self.with_run(|r| {
            r.inputs
                .insert(port.to_string(), StoredInput::Value(value.to_string()));
            Ok(())
        })
    }

    async fn set_input_file(&self, port: &str, file_name: &str, contents: Bytes) -> Result<()> {
        self.declared(port)?;
        self.with_run(|r| {
            r.inputs.insert(
                port.to_string(),
                StoredInput::File {
                    name: file_name.to_string(),
                    contents,
                },
            );
            Ok(())
        })
    }

    async fn set_bundle_input(&self, file_name: &str, contents: Bytes) -> Result<()> {
        self.with_run(|r| {
            r.bundle_input = Some((file_name.to_string(), contents));
            Ok(())
        })
    }

    async fn request_bundle_output(&self) -> Result<()> {
        self.with_run(|r| {
            r.bundle_output_requested = true;
            Ok(())
        })
    }

    async fn bundle_output(&self) -> Result<Bytes> {
        let bundle = self.workflow.bundle.clone();
        self.with_run(|r| {
            if r.bundle_output_requested && r.status == RunStatus::Finished {
                Ok(bundle)
            } else {
                Err(not_found("wd/out.xml"))
            }
        })
    }

    async fn output_ports(&self) -> Result<Vec<OutputPort>> {
        let outputs = self.workflow.outputs.clone();
        self.with_run(|r| {
            if r.status == RunStatus::Finished {
                Ok(outputs)
            } else {
                Ok(Vec::new())
            }
        })
    }

    async fn fetch_value(&self, value: &PortValue) -> Result<Bytes> {
        match value {
            PortValue::Inline { data, .. } => Ok(data.clone()),
            PortValue::Error { message } => Err(Error::ErrorValue {
                message: message.clone(),
            }),
            PortValue::Reference { uri, .. } => self
                .workflow
                .references
                .get(uri)
                .cloned()
                .ok_or_else(|| not_found(uri)),
        }
    }
}
