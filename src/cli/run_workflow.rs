//! `run-workflow`: submit a workflow, set its inputs, wait for it and print
//! the results.

use super::{
    cancel_on_ctrl_c, find_server, fmt_time, print_help, spawn_output_writer, ConnectionArgs,
    OutputLine, AFTER_HELP,
};
use crate::cancel::CancelToken;
use crate::error::Error;
use crate::lifecycle::RunDriver;
use crate::model::{
    CollectedOutputs, DriverConfig, InputPlan, InputSource, OutputMode, RunEvent, RunOutcome,
    RunPlan, RunStatus, DEFAULT_BUNDLE_OUTPUT,
};
use crate::server::rest::RestServer;
use crate::text_summary::{build_run_summary, ValueStyle};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "run-workflow",
    version,
    disable_version_flag = true,
    about = "Run a workflow on a T2 server and collect its outputs",
    override_usage = "run-workflow [options] server-address",
    after_help = AFTER_HELP
)]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Show the version and exit
    #[arg(short = 'v', long, action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// The workflow to run. If this is not specified then the workflow is read from standard input
    #[arg(short = 'w', long, value_name = "WORKFLOW")]
    pub workflow: Option<PathBuf>,

    /// Set input port INPUT to VALUE
    #[arg(short = 'i', long = "input", value_name = "INPUT:VALUE")]
    pub inputs: Vec<String>,

    /// Set input port INPUT to use FILE for its input
    #[arg(short = 'f', long = "input-file", value_name = "INPUT:FILE")]
    pub input_files: Vec<String>,

    /// Set baclava file for input port values
    #[arg(short = 'b', long = "baclava-in", value_name = "BACLAVA")]
    pub baclava_in: Option<PathBuf>,

    /// Return outputs in baclava format. A filename may be specified or 'out.xml' is used
    #[arg(
        short = 'o',
        long = "baclava-out",
        value_name = "BACLAVA",
        num_args = 0..=1,
        default_missing_value = DEFAULT_BUNDLE_OUTPUT
    )]
    pub baclava_out: Option<PathBuf>,

    /// Return URIs that point to the data items of the output rather than the data items themselves
    #[arg(short = 'r', long)]
    pub output_refs: bool,

    /// Delete the run from the server when it is complete. By default the run and its
    /// results are preserved until the server's expiry time is reached
    #[arg(short = 'D', long)]
    pub delete: bool,

    /// Interval between run status polls
    #[arg(long, default_value = "1s")]
    pub poll_interval: humantime::Duration,

    /// Print the run report as JSON instead of text
    #[arg(long)]
    pub json: bool,

    /// Server address, e.g. http://example.com:8080/taverna
    #[arg(value_name = "server-address")]
    pub positionals: Vec<String>,
}

/// Build a `DriverConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> DriverConfig {
    DriverConfig {
        poll_interval: args.poll_interval.into(),
    }
}

/// Build the input plan. A port given both as a value and as a file takes the value.
pub fn build_input_plan(args: &Cli) -> Result<InputPlan> {
    let mut plan = InputPlan {
        bundle: args.baclava_in.clone(),
        ..Default::default()
    };
    for pair in &args.input_files {
        let (name, file) = split_pair("input-file", pair)?;
        plan.ports
            .insert(name.to_string(), InputSource::File(PathBuf::from(file)));
    }
    for pair in &args.inputs {
        let (name, value) = split_pair("input", pair)?;
        plan.ports
            .insert(name.to_string(), InputSource::Value(value.to_string()));
    }
    Ok(plan)
}

fn split_pair<'a>(arg: &'static str, pair: &'a str) -> Result<(&'a str, &'a str)> {
    match pair.trim().split_once(':') {
        Some((name, rest)) if !name.is_empty() => Ok((name, rest)),
        _ => Err(Error::InvalidArgument {
            arg,
            value: pair.to_string(),
        }
        .into()),
    }
}

async fn load_workflow(path: Option<&Path>) -> Result<Bytes> {
    if let Some(path) = path {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read file '{}'", path.display()))?;
        return Ok(Bytes::from(data));
    }
    if std::io::stdin().is_terminal() {
        bail!("No workflow provided.");
    }
    let mut buf = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut buf)
        .await
        .context("cannot read workflow from standard input")?;
    if buf.is_empty() {
        bail!("No workflow provided.");
    }
    Ok(Bytes::from(buf))
}

pub async fn run(args: Cli) -> Result<()> {
    let Some((_, server_url)) = find_server(&args.positionals) else {
        print_help::<Cli>();
        bail!("no server address given");
    };
    let workflow = load_workflow(args.workflow.as_deref()).await?;
    let inputs = build_input_plan(&args)?;
    let plan = RunPlan {
        workflow,
        inputs,
        output_mode: if args.baclava_out.is_some() {
            OutputMode::Bundle
        } else {
            OutputMode::Ports
        },
        delete_after: args.delete,
    };

    let server = RestServer::new(server_url)?;
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<RunEvent>();
    let driver = RunDriver::new(
        server,
        args.connection.credentials(),
        build_config(&args),
        evt_tx,
    );

    let cancel = CancelToken::new();
    let ctrl_c = cancel_on_ctrl_c(cancel.clone());
    let handle = tokio::spawn(async move { driver.execute(plan, &cancel).await });

    let (out_tx, out_handle) = spawn_output_writer();
    let style = if args.output_refs {
        ValueStyle::References
    } else {
        ValueStyle::Values
    };
    let mut bundle_error = None;
    while let Some(ev) = evt_rx.recv().await {
        if args.json {
            continue;
        }
        if let RunEvent::Collected { report } = &ev {
            for line in build_run_summary(report, style).lines {
                let _ = out_tx.send(OutputLine::Stdout(line));
            }
            if let (CollectedOutputs::Bundle { data, .. }, Some(path)) =
                (&report.outputs, args.baclava_out.as_deref())
            {
                match tokio::fs::write(path, data).await {
                    Ok(()) => {
                        let _ = out_tx.send(OutputLine::Stdout(format!(
                            "Baclava file written to '{}'",
                            path.display()
                        )));
                    }
                    Err(e) => {
                        bundle_error = Some(anyhow::Error::new(e).context(format!(
                            "could not write baclava file '{}'",
                            path.display()
                        )));
                    }
                }
            }
            continue;
        }
        if let Some(line) = render_event(&ev) {
            let _ = out_tx.send(line);
        }
    }
    ctrl_c.abort();

    let outcome = handle.await.context("run task failed")?;
    let result = match outcome {
        Ok(RunOutcome::Completed(report)) => {
            let written = async {
                if args.json {
                    let out = serde_json::to_string_pretty(&report)?;
                    let _ = out_tx.send(OutputLine::Stdout(out));
                    if let (CollectedOutputs::Bundle { data, .. }, Some(path)) =
                        (&report.outputs, args.baclava_out.as_deref())
                    {
                        tokio::fs::write(path, data).await.with_context(|| {
                            format!("could not write baclava file '{}'", path.display())
                        })?;
                    }
                }
                anyhow::Ok(())
            }
            .await;
            written.and(bundle_error.map_or(Ok(()), Err))
        }
        Ok(RunOutcome::Cancelled { id, deleted }) => {
            let _ = out_tx.send(OutputLine::Stdout(String::new()));
            Err(interrupted(&id, deleted))
        }
        Err(Error::InputsNotSet { names }) => {
            let (lines, err) = inputs_not_set(&names);
            for line in lines {
                let _ = out_tx.send(line);
            }
            Err(err)
        }
        Err(e) => Err(e.into()),
    };

    drop(out_tx);
    let _ = out_handle.await;
    result
}

fn interrupted(id: &str, deleted: bool) -> anyhow::Error {
    if deleted {
        anyhow::anyhow!("interrupted before the run started; run {id} was deleted")
    } else {
        anyhow::anyhow!("interrupted; run {id} was left on the server")
    }
}

/// The unset names are listed once, on stderr; the returned error only says
/// what happened to the run.
fn inputs_not_set(names: &[String]) -> (Vec<OutputLine>, anyhow::Error) {
    let mut lines = vec![OutputLine::Stderr(
        "At least one input has not been set:".to_string(),
    )];
    lines.extend(names.iter().map(|n| OutputLine::Stderr(format!(" - {n}"))));
    (lines, anyhow::anyhow!("the run was not started and has been deleted"))
}

/// Console rendering of a lifecycle event.
fn render_event(ev: &RunEvent) -> Option<OutputLine> {
    let line = match ev {
        RunEvent::Created { id, created_at } => OutputLine::Stdout(format!(
            "Created run with id: {id}\nCreated at {}",
            fmt_time(*created_at)
        )),
        RunEvent::BundleUploaded { path } => {
            OutputLine::Stdout(format!("Uploaded baclava input file '{}'", path.display()))
        }
        RunEvent::InputSet { port, value } => {
            OutputLine::Stdout(format!("Set input '{port}' to '{value}'"))
        }
        RunEvent::InputFileSet { port, file_name } => OutputLine::Stdout(format!(
            "Set input '{port}' to use file '{file_name}' as input"
        )),
        RunEvent::InputIgnored { port } => {
            OutputLine::Stderr(format!("Workflow has no input '{port}'; ignored"))
        }
        RunEvent::BundleOutputRequested => return None,
        RunEvent::Started { started_at } => OutputLine::Progress(format!(
            "Started at {}\nRunning",
            fmt_time(*started_at)
        )),
        RunEvent::Polled { .. } => OutputLine::Progress(".".to_string()),
        RunEvent::Finished {
            status,
            finished_at,
        } => {
            let verb = if *status == RunStatus::Stopped {
                "Stopped"
            } else {
                "Finished"
            };
            OutputLine::Stdout(format!("\n{verb} at {}", fmt_time(*finished_at)))
        }
        RunEvent::Collected { .. } => return None,
        RunEvent::Deleted { .. } => OutputLine::Stdout("Run deleted".to_string()),
    };
    Some(line)
}
