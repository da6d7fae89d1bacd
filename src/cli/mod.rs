//! Command-line front ends.
//!
//! Both tools take `[options] server-address`. This module holds what they
//! share: connection options, server discovery among positional arguments,
//! the console writer, and Ctrl-C wiring.

pub mod get_output;
pub mod run_workflow;

use crate::cancel::CancelToken;
use crate::model::Credentials;
use anyhow::{bail, Result};
use clap::{Args, CommandFactory, Parser};
use reqwest::Url;
use std::io::Write;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;

pub(crate) const AFTER_HELP: &str = "Where server-address is the full URI of the server to connect to, \
e.g.: http://example.com:8080/taverna";

/// Options shared by every tool.
#[derive(Debug, Args, Clone, Default)]
pub struct ConnectionArgs {
    /// The username to use for server operations
    #[arg(short = 'u', long, env = "T2_USERNAME", value_name = "USERNAME")]
    pub username: Option<String>,

    /// The password to use for the supplied username
    #[arg(
        short = 'p',
        long,
        env = "T2_PASSWORD",
        value_name = "PASSWORD",
        hide_env_values = true
    )]
    pub password: Option<String>,
}

impl ConnectionArgs {
    /// Credentials are only sent when a username is given; a lone password is ignored.
    pub fn credentials(&self) -> Option<Credentials> {
        self.username.as_ref().map(|u| {
            Credentials::new(u.clone(), self.password.clone().unwrap_or_default())
        })
    }
}

/// Parse arguments, exiting 0 for help/version and 1 for usage errors.
pub fn parse_or_exit<C: Parser>() -> C {
    match C::try_parse() {
        Ok(c) => c,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    }
}

pub(crate) fn print_help<C: CommandFactory>() {
    let _ = C::command().print_help();
    println!();
}

/// First positional argument that is an absolute http(s) URL.
pub fn find_server(positionals: &[String]) -> Option<(usize, Url)> {
    positionals.iter().enumerate().find_map(|(i, arg)| {
        // Anything that is not a server address is left for the caller.
        Url::parse(arg)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
            .map(|u| (i, u))
    })
}

/// Pick the run id from an explicit flag or the single remaining positional.
pub fn select_run_id(
    flag: Option<&str>,
    positionals: &[String],
    server_at: usize,
) -> Result<String> {
    let rest: Vec<&String> = positionals
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != server_at)
        .map(|(_, a)| a)
        .collect();
    match (flag, rest.as_slice()) {
        (Some(id), []) => Ok(id.to_string()),
        (Some(_), extra) => bail!(
            "unexpected arguments alongside --run-id: {}",
            join(extra)
        ),
        (None, [id]) => Ok(id.to_string()),
        (None, []) => bail!("no run id given"),
        (None, many) => bail!("ambiguous run id, candidates: {}", join(many)),
    }
}

fn join(args: &[&String]) -> String {
    args.iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn fmt_time(t: Option<OffsetDateTime>) -> String {
    t.and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| "unknown".into())
}

/// Cancel `token` on the first Ctrl-C and exit with status 1 on the second.
/// Abort the returned handle once it is no longer needed.
pub(crate) fn cancel_on_ctrl_c(token: CancelToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        token.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted again; exiting without cleanup");
            std::process::exit(1);
        }
    })
}

/// Output line routing for stdout/stderr writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OutputLine {
    Stdout(String),
    Stderr(String),
    /// Written to stdout without a newline, flushed immediately.
    Progress(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
pub(crate) fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
                OutputLine::Progress(msg) => {
                    let _ = write!(out, "{}", msg);
                    let _ = out.flush();
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn finds_first_http_url() {
        let pos = args(&["abc", "file.txt", "http://example.com:8080/taverna", "https://other"]);
        let (i, url) = find_server(&pos).unwrap();
        assert_eq!(i, 2);
        assert_eq!(url.as_str(), "http://example.com:8080/taverna");
    }

    #[test]
    fn run_id_like_strings_are_not_servers() {
        let pos = args(&["0f1e2d3c-aaaa-bbbb-cccc-000000000000", "mailto:x@y"]);
        assert!(find_server(&pos).is_none());
    }

    #[test]
    fn run_id_from_single_positional() {
        let pos = args(&["http://h/t2", "run-1"]);
        assert_eq!(select_run_id(None, &pos, 0).unwrap(), "run-1");
    }

    #[test]
    fn run_id_flag_wins_but_rejects_extras() {
        let pos = args(&["http://h/t2"]);
        assert_eq!(select_run_id(Some("r9"), &pos, 0).unwrap(), "r9");
        let pos = args(&["http://h/t2", "stray"]);
        assert!(select_run_id(Some("r9"), &pos, 0).is_err());
    }

    #[test]
    fn two_candidates_are_ambiguous() {
        let pos = args(&["a", "http://h/t2", "b"]);
        let err = select_run_id(None, &pos, 1).unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
        assert!(select_run_id(None, &args(&["http://h"]), 0).is_err());
    }

    #[test]
    fn password_without_username_sends_nothing() {
        let c = ConnectionArgs {
            username: None,
            password: Some("pw".into()),
        };
        assert!(c.credentials().is_none());
        let c = ConnectionArgs {
            username: Some("bob".into()),
            password: None,
        };
        assert_eq!(c.credentials(), Some(Credentials::new("bob", "")));
    }
}
