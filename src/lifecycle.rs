//! Run lifecycle driver.
//!
//! Takes a workflow from creation to collected outputs: create, configure
//! inputs, optionally request a bundle, start, poll to completion, collect,
//! optionally delete. All run state lives on the server; the driver keeps
//! only the handle and reports progress as `RunEvent`s.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::model::{
    CollectedOutputs, Completion, Credentials, DriverConfig, InputPlan, InputSource, OutputMode,
    RunEvent, RunOutcome, RunPlan, RunReport, RunStatus,
};
use crate::server::{Run, Server};
use bytes::Bytes;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct RunDriver<S: Server> {
    server: S,
    credentials: Option<Credentials>,
    cfg: DriverConfig,
    event_tx: mpsc::UnboundedSender<RunEvent>,
}

impl<S: Server> RunDriver<S> {
    pub fn new(
        server: S,
        credentials: Option<Credentials>,
        cfg: DriverConfig,
        event_tx: mpsc::UnboundedSender<RunEvent>,
    ) -> Self {
        Self {
            server,
            credentials,
            cfg,
            event_tx,
        }
    }

    pub fn server(&self) -> &S {
        &self.server
    }

    fn emit(&self, ev: RunEvent) {
        // Nobody listening is fine; events are progress only.
        let _ = self.event_tx.send(ev);
    }

    pub async fn create(&self, workflow: Bytes) -> Result<S::Run> {
        if workflow.is_empty() {
            return Err(Error::WorkflowRejected {
                reason: "empty workflow document".into(),
            });
        }
        let run = self
            .server
            .create_run(workflow, self.credentials.as_ref())
            .await?;
        let created_at = run.create_time().await?;
        info!(run = run.id(), "run created");
        self.emit(RunEvent::Created {
            id: run.id().to_string(),
            created_at,
        });
        Ok(run)
    }

    /// Set inputs from `plan`. A local file that cannot be read deletes the
    /// run and fails with `UnreadableInput`.
    pub async fn configure_inputs(&self, run: &S::Run, plan: &InputPlan) -> Result<()> {
        let res = self.apply_inputs(run, plan).await;
        self.abandon_on_abort(run, res).await
    }

    async fn apply_inputs(&self, run: &S::Run, plan: &InputPlan) -> Result<()> {
        if let Some(bundle) = plan.bundle.as_deref() {
            if !plan.ports.is_empty() {
                warn!(
                    run = run.id(),
                    ignored = plan.ports.len(),
                    "bundle input given; per-port inputs ignored"
                );
            }
            let contents = read_input(bundle).await?;
            run.set_bundle_input(&file_name(bundle), contents).await?;
            self.emit(RunEvent::BundleUploaded {
                path: bundle.to_path_buf(),
            });
            return Ok(());
        }

        let declared = run.input_ports().await?;
        for port in &declared {
            match plan.ports.get(&port.name) {
                Some(InputSource::Value(value)) => {
                    run.set_input_value(&port.name, value).await?;
                    self.emit(RunEvent::InputSet {
                        port: port.name.clone(),
                        value: value.clone(),
                    });
                }
                Some(InputSource::File(path)) => {
                    let contents = read_input(path).await?;
                    let name = file_name(path);
                    run.set_input_file(&port.name, &name, contents).await?;
                    self.emit(RunEvent::InputFileSet {
                        port: port.name.clone(),
                        file_name: name,
                    });
                }
                None => {}
            }
        }
        for name in plan.ports.keys() {
            if !declared.iter().any(|p| &p.name == name) {
                warn!(run = run.id(), port = %name, "workflow has no such input port");
                self.emit(RunEvent::InputIgnored { port: name.clone() });
            }
        }
        Ok(())
    }

    pub async fn request_bundle_output(&self, run: &S::Run) -> Result<()> {
        run.request_bundle_output().await?;
        self.emit(RunEvent::BundleOutputRequested);
        Ok(())
    }

    /// Start the run. Unset inputs delete the run and fail with `InputsNotSet`
    /// before the server is asked to start.
    pub async fn start(&self, run: &S::Run) -> Result<()> {
        let res = self.checked_start(run).await;
        self.abandon_on_abort(run, res).await?;
        let started_at = run.start_time().await?;
        info!(run = run.id(), "run started");
        self.emit(RunEvent::Started { started_at });
        Ok(())
    }

    async fn checked_start(&self, run: &S::Run) -> Result<()> {
        let missing: Vec<String> = run
            .input_ports()
            .await?
            .into_iter()
            .filter(|p| !p.is_set)
            .map(|p| p.name)
            .collect();
        if !missing.is_empty() {
            return Err(Error::InputsNotSet { names: missing });
        }
        run.start().await
    }

    async fn abandon_on_abort(&self, run: &S::Run, res: Result<()>) -> Result<()> {
        let Err(err) = res else {
            return Ok(());
        };
        if err.is_lifecycle_abort() {
            warn!(run = run.id(), error = %err, "deleting run that cannot start");
            match run.delete().await {
                Ok(()) => self.emit(RunEvent::Deleted {
                    id: run.id().to_string(),
                }),
                Err(e) => warn!(run = run.id(), error = %e, "failed to delete run"),
            }
        }
        Err(err)
    }

    /// Poll until the run reaches a terminal state or `cancel` fires. Every
    /// remote call in the loop is abandoned as soon as `cancel` fires.
    pub async fn await_completion(&self, run: &S::Run, cancel: &CancelToken) -> Result<Completion> {
        let mut last = RunStatus::Created;
        loop {
            let Some(status) = cancel.guard(run.status()).await else {
                info!(run = run.id(), "wait cancelled");
                return Ok(Completion::Cancelled);
            };
            let mut status = status?;
            if last.regresses_to(status) {
                warn!(run = run.id(), %last, reported = %status, "server reported status regression");
                status = last;
            }
            last = status;

            if status.is_terminal() {
                let Some(finished_at) = cancel.guard(run.finish_time()).await else {
                    info!(run = run.id(), "wait cancelled");
                    return Ok(Completion::Cancelled);
                };
                let finished_at = finished_at?;
                info!(run = run.id(), %status, "run completed");
                self.emit(RunEvent::Finished {
                    status,
                    finished_at,
                });
                return Ok(Completion::Finished(status));
            }
            self.emit(RunEvent::Polled { status });

            if cancel
                .guard(tokio::time::sleep(self.cfg.poll_interval))
                .await
                .is_none()
            {
                info!(run = run.id(), "wait cancelled");
                return Ok(Completion::Cancelled);
            }
        }
    }

    /// Gather console output, exit code and, on a clean exit, the outputs.
    pub async fn collect(&self, run: &S::Run, mode: OutputMode) -> Result<RunReport> {
        let status = run.status().await?;
        let exit_code = run.exit_code().await?;
        let stdout = run.console_output().await?;
        let stderr = run.console_error().await?;

        let outputs = match (exit_code, mode) {
            (Some(0), OutputMode::Bundle) => {
                let data = run.bundle_output().await?;
                CollectedOutputs::Bundle {
                    size: data.len() as u64,
                    data,
                }
            }
            (Some(0), OutputMode::Ports) => CollectedOutputs::Ports {
                ports: run.output_ports().await?,
            },
            _ => CollectedOutputs::NotCollected,
        };

        Ok(RunReport {
            id: run.id().to_string(),
            status,
            created_at: run.create_time().await?,
            started_at: run.start_time().await?,
            finished_at: run.finish_time().await?,
            exit_code,
            stdout,
            stderr,
            outputs,
            deleted: false,
        })
    }

    pub async fn teardown(&self, run: &S::Run) -> Result<()> {
        run.delete().await?;
        info!(run = run.id(), "run deleted");
        self.emit(RunEvent::Deleted {
            id: run.id().to_string(),
        });
        Ok(())
    }

    /// Drive one workflow through the whole lifecycle.
    ///
    /// Cancellation before the run is started deletes it; once started, the
    /// run is left on the server.
    pub async fn execute(&self, plan: RunPlan, cancel: &CancelToken) -> Result<RunOutcome> {
        let run = self.create(plan.workflow).await?;

        match cancel
            .guard(self.prepare(&run, &plan.inputs, plan.output_mode))
            .await
        {
            Some(res) => res?,
            None => return Ok(self.abandon_unstarted(&run).await),
        }
        if cancel.is_cancelled() {
            return Ok(self.abandon_unstarted(&run).await);
        }
        self.start(&run).await?;

        let left_running = || RunOutcome::Cancelled {
            id: run.id().to_string(),
            deleted: false,
        };
        match self.await_completion(&run, cancel).await? {
            Completion::Cancelled => return Ok(left_running()),
            Completion::Finished(_) => {}
        }

        let Some(report) = cancel.guard(self.collect(&run, plan.output_mode)).await else {
            info!(run = run.id(), "collection cancelled");
            return Ok(left_running());
        };
        let mut report = report?;
        self.emit(RunEvent::Collected {
            report: Box::new(report.clone()),
        });
        if plan.delete_after {
            self.teardown(&run).await?;
            report.deleted = true;
        }
        Ok(RunOutcome::Completed(Box::new(report)))
    }

    async fn prepare(&self, run: &S::Run, inputs: &InputPlan, mode: OutputMode) -> Result<()> {
        self.configure_inputs(run, inputs).await?;
        if mode == OutputMode::Bundle {
            self.request_bundle_output(run).await?;
        }
        Ok(())
    }

    async fn abandon_unstarted(&self, run: &S::Run) -> RunOutcome {
        info!(run = run.id(), "cancelled before start");
        let deleted = match run.delete().await {
            Ok(()) => {
                self.emit(RunEvent::Deleted {
                    id: run.id().to_string(),
                });
                true
            }
            Err(e) => {
                warn!(run = run.id(), error = %e, "failed to delete run");
                false
            }
        };
        RunOutcome::Cancelled {
            id: run.id().to_string(),
            deleted,
        }
    }
}

async fn read_input(path: &Path) -> Result<Bytes> {
    tokio::fs::read(path)
        .await
        .map(Bytes::from)
        .map_err(|source| Error::UnreadableInput {
            path: path.to_path_buf(),
            source,
        })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OutputPort, PortData, PortValue};
    use crate::server::memory::{MemoryServer, StoredInput, Workflow};
    use std::time::Duration;

    fn driver(wf: Workflow) -> (RunDriver<MemoryServer>, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cfg = DriverConfig {
            poll_interval: Duration::from_millis(1),
        };
        (RunDriver::new(MemoryServer::new(wf), None, cfg, tx), rx)
    }

    fn hello_out() -> OutputPort {
        OutputPort {
            name: "out1".into(),
            depth: 0,
            data: PortData::Value(PortValue::Inline {
                content_type: "text/plain".into(),
                data: Bytes::from_static(b"hello"),
            }),
        }
    }

    #[tokio::test]
    async fn empty_workflow_is_rejected_locally() {
        let (d, _rx) = driver(Workflow::new());
        assert!(matches!(
            d.create(Bytes::new()).await,
            Err(Error::WorkflowRejected { .. })
        ));
        assert_eq!(d.server().run_count(), 0);
    }

    #[tokio::test]
    async fn start_without_inputs_lists_missing_and_deletes() {
        let (d, _rx) = driver(Workflow::new().input("a", 0).input("b", 1).input("c", 0));
        let run = d.create(Bytes::from_static(b"<wf/>")).await.unwrap();
        let mut plan = InputPlan::default();
        plan.ports
            .insert("b".into(), InputSource::Value("set".into()));
        d.configure_inputs(&run, &plan).await.unwrap();

        match d.start(&run).await {
            Err(Error::InputsNotSet { names }) => assert_eq!(names, vec!["a", "c"]),
            other => panic!("expected InputsNotSet, got {other:?}"),
        }
        assert_eq!(d.server().start_calls(), 0);
        assert_eq!(d.server().deleted(), vec![run.id().to_string()]);
    }

    #[tokio::test]
    async fn unreadable_input_file_deletes_run() {
        let (d, _rx) = driver(Workflow::new().input("in1", 0));
        let run = d.create(Bytes::from_static(b"<wf/>")).await.unwrap();
        let mut plan = InputPlan::default();
        plan.ports.insert(
            "in1".into(),
            InputSource::File("/definitely/not/here.txt".into()),
        );
        assert!(matches!(
            d.configure_inputs(&run, &plan).await,
            Err(Error::UnreadableInput { .. })
        ));
        assert_eq!(d.server().deleted(), vec![run.id().to_string()]);
    }

    #[tokio::test]
    async fn file_inputs_are_uploaded_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq.fasta");
        std::fs::write(&path, b">x\nACGT\n").unwrap();

        let (d, _rx) = driver(Workflow::new().input("seq", 0));
        let run = d.create(Bytes::from_static(b"<wf/>")).await.unwrap();
        let mut plan = InputPlan::default();
        plan.ports.insert("seq".into(), InputSource::File(path));
        d.configure_inputs(&run, &plan).await.unwrap();

        let stored = d.server().stored_inputs(run.id()).unwrap();
        assert_eq!(
            stored.get("seq"),
            Some(&StoredInput::File {
                name: "seq.fasta".into(),
                contents: Bytes::from_static(b">x\nACGT\n"),
            })
        );
    }

    #[tokio::test]
    async fn bundle_input_overrides_port_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.xml");
        std::fs::write(&path, b"<dataThingMap/>").unwrap();

        let (d, mut rx) = driver(Workflow::new().input("in1", 0));
        let run = d.create(Bytes::from_static(b"<wf/>")).await.unwrap();
        let mut plan = InputPlan {
            bundle: Some(path),
            ..Default::default()
        };
        plan.ports
            .insert("in1".into(), InputSource::Value("ignored".into()));
        d.configure_inputs(&run, &plan).await.unwrap();
        d.start(&run).await.unwrap();

        assert!(d.server().stored_inputs(run.id()).unwrap().is_empty());
        assert_eq!(
            d.server().stored_bundle_input(run.id()).map(|(n, _)| n),
            Some("in.xml".to_string())
        );
        let mut saw_bundle = false;
        while let Ok(ev) = rx.try_recv() {
            assert!(!matches!(ev, RunEvent::InputSet { .. }));
            saw_bundle |= matches!(ev, RunEvent::BundleUploaded { .. });
        }
        assert!(saw_bundle);
    }

    #[tokio::test]
    async fn undeclared_inputs_are_reported_and_skipped() {
        let (d, mut rx) = driver(Workflow::new().input("in1", 0));
        let run = d.create(Bytes::from_static(b"<wf/>")).await.unwrap();
        let mut plan = InputPlan::default();
        plan.ports
            .insert("in1".into(), InputSource::Value("x".into()));
        plan.ports
            .insert("typo".into(), InputSource::Value("y".into()));
        d.configure_inputs(&run, &plan).await.unwrap();

        let events: Vec<RunEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, RunEvent::InputIgnored { port } if port == "typo")));
    }

    #[tokio::test]
    async fn poll_statuses_are_monotonic() {
        let (d, mut rx) = driver(Workflow::new().polls_until_finished(3));
        let run = d.create(Bytes::from_static(b"<wf/>")).await.unwrap();
        d.start(&run).await.unwrap();
        let done = d.await_completion(&run, &CancelToken::new()).await.unwrap();
        assert_eq!(done, Completion::Finished(RunStatus::Finished));

        let seen: Vec<RunStatus> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                RunEvent::Polled { status } | RunEvent::Finished { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert!(seen.windows(2).all(|w| !w[0].regresses_to(w[1])));
        assert_eq!(seen.last(), Some(&RunStatus::Finished));

        // Once finished the server keeps answering Finished.
        for _ in 0..3 {
            assert_eq!(run.status().await.unwrap(), RunStatus::Finished);
        }
    }

    #[tokio::test]
    async fn cancel_interrupts_wait_without_touching_run() {
        let (d, _rx) = driver(Workflow::new().polls_until_finished(u32::MAX));
        let run = d.create(Bytes::from_static(b"<wf/>")).await.unwrap();
        d.start(&run).await.unwrap();

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let done = tokio::time::timeout(Duration::from_secs(2), d.await_completion(&run, &cancel))
            .await
            .expect("cancel should end the wait")
            .unwrap();
        assert_eq!(done, Completion::Cancelled);
        assert_eq!(run.status().await.unwrap(), RunStatus::Running);
        assert!(d.server().deleted().is_empty());
    }

    #[tokio::test]
    async fn failed_run_collects_no_outputs() {
        let (d, _rx) = driver(
            Workflow::new()
                .output(hello_out())
                .exit_code(3)
                .console("", "it broke"),
        );
        let run = d.create(Bytes::from_static(b"<wf/>")).await.unwrap();
        d.start(&run).await.unwrap();
        d.await_completion(&run, &CancelToken::new()).await.unwrap();
        let report = d.collect(&run, OutputMode::Ports).await.unwrap();
        assert_eq!(report.exit_code, Some(3));
        assert_eq!(report.stderr, "it broke");
        assert!(matches!(report.outputs, CollectedOutputs::NotCollected));
    }

    #[tokio::test]
    async fn execute_collects_bundle_and_deletes() {
        let (d, _rx) = driver(Workflow::new().bundle(&b"<bundle/>"[..]));
        let plan = RunPlan {
            workflow: Bytes::from_static(b"<wf/>"),
            inputs: InputPlan::default(),
            output_mode: OutputMode::Bundle,
            delete_after: true,
        };
        let outcome = d.execute(plan, &CancelToken::new()).await.unwrap();
        let RunOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };
        assert!(report.deleted);
        match &report.outputs {
            CollectedOutputs::Bundle { data, size } => {
                assert_eq!(&data[..], b"<bundle/>");
                assert_eq!(*size, 9);
            }
            other => panic!("expected bundle, got {other:?}"),
        }
        assert_eq!(d.server().deleted(), vec![report.id.clone()]);
    }

    #[tokio::test]
    async fn cancel_abandons_a_stalled_status_request() {
        let (d, _rx) = driver(Workflow::new().stall_status());
        let run = d.create(Bytes::from_static(b"<wf/>")).await.unwrap();
        d.start(&run).await.unwrap();

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let done = tokio::time::timeout(Duration::from_secs(2), d.await_completion(&run, &cancel))
            .await
            .expect("cancel should end a wait blocked on a status request")
            .unwrap();
        assert_eq!(done, Completion::Cancelled);
        assert!(d.server().deleted().is_empty());
    }

    #[tokio::test]
    async fn execute_cancelled_while_polling_leaves_run() {
        let (d, _rx) = driver(Workflow::new().stall_status());
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let plan = RunPlan {
            workflow: Bytes::from_static(b"<wf/>"),
            inputs: InputPlan::default(),
            output_mode: OutputMode::Ports,
            delete_after: true,
        };
        let outcome = tokio::time::timeout(Duration::from_secs(2), d.execute(plan, &cancel))
            .await
            .expect("execute should return once cancelled")
            .unwrap();
        match outcome {
            RunOutcome::Cancelled { deleted, .. } => assert!(!deleted),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(d.server().start_calls(), 1);
        assert!(d.server().deleted().is_empty());
    }

    #[tokio::test]
    async fn execute_cancelled_before_start_deletes_run() {
        let (d, mut rx) = driver(Workflow::new().input("in1", 0));
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut inputs = InputPlan::default();
        inputs
            .ports
            .insert("in1".into(), InputSource::Value("x".into()));
        let plan = RunPlan {
            workflow: Bytes::from_static(b"<wf/>"),
            inputs,
            output_mode: OutputMode::Ports,
            delete_after: false,
        };
        let outcome = d.execute(plan, &cancel).await.unwrap();
        let RunOutcome::Cancelled { id, deleted } = outcome else {
            panic!("expected cancellation");
        };
        assert!(deleted);
        assert_eq!(d.server().start_calls(), 0);
        assert_eq!(d.server().deleted(), vec![id]);
        while let Ok(ev) = rx.try_recv() {
            assert!(!matches!(ev, RunEvent::InputSet { .. } | RunEvent::Started { .. }));
        }
    }
}
