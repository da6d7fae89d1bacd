//! `get-output`: inspect the outputs of an existing run.

use super::{
    find_server, print_help, select_run_id, spawn_output_writer, ConnectionArgs, OutputLine,
    AFTER_HELP,
};
use crate::error::Result as LibResult;
use crate::model::{OutputPort, PortData, PortValue, RunStatus};
use crate::port::{self, Coordinate};
use crate::server::rest::RestServer;
use crate::server::{Run, Server};
use crate::text_summary::{leaf_block, port_header};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use futures::future::try_join_all;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "get-output",
    version,
    disable_version_flag = true,
    about = "Print the outputs of a run on a T2 server",
    override_usage = "get-output [options] server-address [run-id]",
    after_help = AFTER_HELP
)]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Show the version and exit
    #[arg(short = 'v', long, action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// The run to inspect. May also be given as the only positional besides the server address
    #[arg(long, value_name = "ID")]
    pub run_id: Option<String>,

    /// Print the actual data of every value
    #[arg(short = 'd', long, conflicts_with = "refs")]
    pub data: bool,

    /// Print only the references of every value
    #[arg(short = 'r', long)]
    pub refs: bool,

    /// Restrict output to a port, or to an index within it
    #[arg(short = 'c', long = "coordinate", value_name = "NAME[:I,J,...]")]
    pub coordinates: Vec<String>,

    /// Fetch the outputs as a baclava file instead
    #[arg(
        short = 'b',
        long = "baclava-out",
        value_name = "BACLAVA",
        conflicts_with_all = ["data", "refs", "coordinates", "total_size", "json"]
    )]
    pub baclava_out: Option<PathBuf>,

    /// Print the total size of the data of each port
    #[arg(short = 't', long)]
    pub total_size: bool,

    /// Delete the run from the server afterwards
    #[arg(short = 'D', long)]
    pub delete: bool,

    /// Print the selected outputs as JSON
    #[arg(long)]
    pub json: bool,

    #[arg(value_name = "server-address")]
    pub positionals: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    pub data: bool,
    pub refs: bool,
    pub total_size: bool,
    pub json: bool,
}

impl From<&Cli> for RenderOptions {
    fn from(args: &Cli) -> Self {
        Self {
            data: args.data,
            refs: args.refs,
            total_size: args.total_size,
            json: args.json,
        }
    }
}

#[derive(Serialize)]
struct Selection<'a> {
    port: &'a str,
    depth: usize,
    index: &'a [usize],
    #[serde(skip_serializing_if = "Option::is_none")]
    total_size: Option<u64>,
    data: &'a PortData,
}

/// Render the run's outputs, restricted to `coords` when any are given.
///
/// Every coordinate is resolved before any payload is fetched, so a bad
/// coordinate fails without further server traffic.
pub async fn render_outputs<R: Run>(
    run: &R,
    coords: &[Coordinate],
    opts: RenderOptions,
) -> LibResult<Vec<String>> {
    let ports = run.output_ports().await?;
    let selected: Vec<(&OutputPort, Vec<usize>)> = if coords.is_empty() {
        ports.iter().map(|p| (p, Vec::new())).collect()
    } else {
        coords
            .iter()
            .map(|c| -> LibResult<(&OutputPort, Vec<usize>)> {
                let p = port::find(&ports, &c.name)?;
                port::subtree(p, &c.index)?;
                Ok((p, c.index.clone()))
            })
            .collect::<LibResult<_>>()?
    };

    if opts.json {
        let mut out = Vec::with_capacity(selected.len());
        for (p, index) in &selected {
            out.push(Selection {
                port: &p.name,
                depth: p.depth,
                index,
                total_size: opts.total_size.then(|| port::total_size(p)),
                data: port::subtree(p, index)?,
            });
        }
        let text = serde_json::to_string_pretty(&out)?;
        return Ok(vec![text]);
    }

    let mut lines = Vec::new();
    for (p, prefix) in selected {
        lines.push(port_header(p, opts.total_size));
        let leaves: Vec<(Vec<usize>, &PortValue)> = port::index_space(p)
            .into_iter()
            .filter(|idx| idx.starts_with(&prefix))
            .map(|idx| port::resolve(p, &idx).map(|v| (idx, v)))
            .collect::<LibResult<_>>()?;

        if opts.refs {
            for (idx, v) in &leaves {
                lines.push(format!(" {} -> {}", fmt_index(idx), reference_of(v)));
            }
        } else {
            let payloads = if opts.data {
                try_join_all(leaves.iter().map(|(_, v)| fetch_payload(run, v))).await?
            } else {
                vec![None; leaves.len()]
            };
            for ((idx, v), data) in leaves.iter().zip(payloads) {
                lines.extend(leaf_block(idx, v, data.as_deref()));
            }
        }
        lines.push("}".to_string());
    }
    Ok(lines)
}

async fn fetch_payload<R: Run>(run: &R, v: &PortValue) -> LibResult<Option<Bytes>> {
    if v.is_error() {
        return Ok(None);
    }
    run.fetch_value(v).await.map(Some)
}

fn reference_of(v: &PortValue) -> String {
    match v {
        PortValue::Reference { uri, .. } => uri.clone(),
        PortValue::Inline { .. } => "(inline)".to_string(),
        PortValue::Error { message } => format!("ERROR: {message}"),
    }
}

fn fmt_index(idx: &[usize]) -> String {
    if idx.is_empty() {
        return "-".to_string();
    }
    idx.iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub async fn run(args: Cli) -> Result<()> {
    // Coordinates are checked before anything touches the network.
    let coords = args
        .coordinates
        .iter()
        .map(|c| port::parse_coordinate(c))
        .collect::<LibResult<Vec<_>>>()?;

    let Some((server_at, server_url)) = find_server(&args.positionals) else {
        print_help::<Cli>();
        bail!("no server address given");
    };
    let run_id = select_run_id(args.run_id.as_deref(), &args.positionals, server_at)?;

    let server = RestServer::new(server_url)?;
    let credentials = args.connection.credentials();
    let run = server
        .get_run(&run_id, credentials.as_ref())
        .await
        .with_context(|| format!("cannot open run {run_id}"))?;

    let (out_tx, out_handle) = spawn_output_writer();
    let result = read_outputs(&run, &args, &coords).await.map(|lines| {
        for line in lines {
            let _ = out_tx.send(line);
        }
    });

    drop(out_tx);
    let _ = out_handle.await;
    result
}

/// Print the requested outputs of a finished run, then delete it if asked.
/// The run is only deleted once every output has been read.
pub(crate) async fn read_outputs<R: Run>(
    run: &R,
    args: &Cli,
    coords: &[Coordinate],
) -> Result<Vec<OutputLine>> {
    let status = run.status().await?;
    if !status.is_terminal() {
        bail!("run {} has no outputs yet (status: {status})", run.id());
    }
    info!(run = run.id(), %status, "reading outputs");

    let mut lines = Vec::new();
    if let Some(path) = &args.baclava_out {
        let data = run.bundle_output().await?;
        tokio::fs::write(path, &data)
            .await
            .with_context(|| format!("could not write baclava file '{}'", path.display()))?;
        lines.push(OutputLine::Stdout(format!(
            "Baclava file written to '{}'",
            path.display()
        )));
    } else {
        if status == RunStatus::Stopped {
            lines.push(OutputLine::Stderr(format!(
                "Run {} was stopped; outputs may be incomplete",
                run.id()
            )));
        }
        let rendered = render_outputs(run, coords, RenderOptions::from(args)).await?;
        lines.extend(rendered.into_iter().map(OutputLine::Stdout));
    }

    if args.delete {
        run.delete()
            .await
            .with_context(|| format!("could not delete run {}", run.id()))?;
        lines.push(OutputLine::Stdout("Run deleted".to_string()));
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::memory::{MemoryRun, MemoryServer, Workflow};

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        let mut full = vec!["get-output"];
        full.extend_from_slice(args);
        Cli::try_parse_from(full)
    }

    #[test]
    fn accepts_repeated_coordinates() {
        let cli = parse(&["-c", "OUT:0,1", "-c", "other", "-t", "http://h/t2", "run-1"]).unwrap();
        assert_eq!(cli.coordinates, vec!["OUT:0,1", "other"]);
        assert!(cli.total_size);
        assert_eq!(cli.positionals, vec!["http://h/t2", "run-1"]);
    }

    #[test]
    fn data_and_refs_conflict() {
        assert!(parse(&["-d", "-r", "http://h/t2"]).is_err());
    }

    #[test]
    fn baclava_excludes_port_rendering() {
        assert!(parse(&["-b", "out.xml", "-d", "http://h/t2"]).is_err());
        assert!(parse(&["-b", "out.xml", "-D", "http://h/t2", "r"]).is_ok());
    }

    async fn memory_run(finish: bool) -> (MemoryServer, MemoryRun) {
        let wf = Workflow::new()
            .output(OutputPort {
                name: "out1".into(),
                depth: 0,
                data: PortData::Value(PortValue::Inline {
                    content_type: "text/plain".into(),
                    data: Bytes::from_static(b"hello"),
                }),
            })
            .polls_until_finished(0);
        let server = MemoryServer::new(wf);
        let run = server
            .create_run(Bytes::from_static(b"<wf/>"), None)
            .await
            .unwrap();
        if finish {
            run.start().await.unwrap();
            run.status().await.unwrap();
        }
        (server, run)
    }

    fn coords(specs: &[&str]) -> Vec<Coordinate> {
        specs
            .iter()
            .map(|s| port::parse_coordinate(s).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn delete_follows_rendering() {
        let (server, run) = memory_run(true).await;
        let args = parse(&["-D", "http://h/t2", run.id()]).unwrap();
        let lines = read_outputs(&run, &args, &coords(&["out1"])).await.unwrap();

        assert_eq!(lines.first(), Some(&OutputLine::Stdout("out1 (depth 0) {".into())));
        assert_eq!(lines.last(), Some(&OutputLine::Stdout("Run deleted".into())));
        assert_eq!(server.deleted(), vec![run.id().to_string()]);
    }

    #[tokio::test]
    async fn failed_rendering_keeps_the_run() {
        let (server, run) = memory_run(true).await;
        let args = parse(&["-D", "http://h/t2", run.id()]).unwrap();
        let err = read_outputs(&run, &args, &coords(&["missing"]))
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("no output port named 'missing'"));
        assert!(server.deleted().is_empty());
        assert_eq!(server.run_count(), 1);
    }

    #[tokio::test]
    async fn unfinished_run_is_refused_and_kept() {
        let (server, run) = memory_run(false).await;
        let args = parse(&["-D", "http://h/t2", run.id()]).unwrap();
        let err = read_outputs(&run, &args, &[]).await.unwrap_err();

        assert!(err.to_string().contains("has no outputs yet (status: created)"));
        assert!(server.deleted().is_empty());
    }

    #[tokio::test]
    async fn bundle_is_written_before_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("res.xml");
        let (server, run) = memory_run(false).await;
        run.request_bundle_output().await.unwrap();
        run.start().await.unwrap();
        run.status().await.unwrap();

        let path_arg = path.to_string_lossy().into_owned();
        let args = parse(&["-b", &path_arg, "-D", "http://h/t2", run.id()]).unwrap();
        let lines = read_outputs(&run, &args, &[]).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"<dataThingMap/>");
        assert_eq!(lines.len(), 2);
        assert_eq!(server.deleted(), vec![run.id().to_string()]);
    }

    #[test]
    fn index_formatting() {
        assert_eq!(fmt_index(&[]), "-");
        assert_eq!(fmt_index(&[0, 2, 1]), "0,2,1");
    }
}
