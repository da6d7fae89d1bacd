//! `reqwest` implementation of the server traits.
//!
//! Run resources live under `<server>/rest/runs/<id>/`. Plain values
//! (status, timestamps, console text) are exchanged as `text/plain`; port
//! listings and port value trees as JSON.

use super::{Run, Server};
use crate::error::{Error, Result};
use crate::model::{
    Credentials, InputPortInfo, OutputPort, PortData, PortValue, RunStatus, DEFAULT_BUNDLE_OUTPUT,
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

const WORKFLOW_CONTENT_TYPE: &str = "application/vnd.taverna.t2flow+xml";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct RestServer {
    http: reqwest::Client,
    base: Url,
}

impl RestServer {
    pub fn new(base: Url) -> Result<Self> {
        let url = base.to_string();
        let http = reqwest::Client::builder()
            .user_agent(format!("t2server-cli/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| Error::ServerUnavailable { url, source })?;
        Ok(Self { http, base })
    }

    fn runs_url(&self) -> Result<Url> {
        join_segments(&self.base, &["rest", "runs"])
    }

    fn handle(&self, url: Url, id: String, credentials: Option<&Credentials>) -> RestRun {
        RestRun {
            http: self.http.clone(),
            url,
            id,
            credentials: credentials.cloned(),
        }
    }
}

#[async_trait]
impl Server for RestServer {
    type Run = RestRun;

    async fn create_run(
        &self,
        workflow: Bytes,
        credentials: Option<&Credentials>,
    ) -> Result<RestRun> {
        let url = self.runs_url()?;
        debug!(%url, bytes = workflow.len(), "submitting workflow");
        let rb = authed(self.http.post(url.clone()), credentials)
            .header(CONTENT_TYPE, WORKFLOW_CONTENT_TYPE)
            .body(workflow);
        let resp = send(rb, &url).await?;
        let status = resp.status();
        if status.is_client_error()
            && status != StatusCode::UNAUTHORIZED
            && status != StatusCode::FORBIDDEN
        {
            let reason = resp.text().await.unwrap_or_default();
            return Err(Error::WorkflowRejected {
                reason: non_empty_or(reason.trim(), status.as_str()),
            });
        }
        let resp = expect_success(resp).await?;

        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::MalformedResponse {
                url: url.to_string(),
                detail: "no Location header for new run".into(),
            })?;
        let run_url = url.join(location).map_err(|e| Error::MalformedResponse {
            url: url.to_string(),
            detail: format!("bad Location header '{location}': {e}"),
        })?;
        let id = run_id_from_url(&run_url).ok_or_else(|| Error::MalformedResponse {
            url: url.to_string(),
            detail: format!("cannot find run id in '{run_url}'"),
        })?;
        Ok(self.handle(run_url, id, credentials))
    }

    async fn get_run(&self, id: &str, credentials: Option<&Credentials>) -> Result<RestRun> {
        let url = join_segments(&self.runs_url()?, &[id])?;
        let run = self.handle(url, id.to_string(), credentials);
        // Fetch the status resource so a missing run fails here rather than later.
        run.status().await?;
        Ok(run)
    }
}

#[derive(Debug, Clone)]
pub struct RestRun {
    http: reqwest::Client,
    url: Url,
    id: String,
    credentials: Option<Credentials>,
}

impl RestRun {
    fn resource(&self, segments: &[&str]) -> Result<Url> {
        join_segments(&self.url, segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        debug!(%method, %url, run = %self.id, "request");
        authed(self.http.request(method, url), self.credentials.as_ref())
    }

    /// Send and require a 2xx; a 404 means the run itself has gone.
    async fn call(&self, rb: RequestBuilder, url: &Url) -> Result<Response> {
        let resp = send(rb, url).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::RunNotFound {
                id: self.id.clone(),
            });
        }
        expect_success(resp).await
    }

    async fn get_text(&self, segments: &[&str]) -> Result<String> {
        let url = self.resource(segments)?;
        let rb = self.request(Method::GET, url.clone()).header(ACCEPT, "text/plain");
        let resp = self.call(rb, &url).await?;
        resp.text()
            .await
            .map_err(|source| Error::ServerUnavailable {
                url: url.to_string(),
                source,
            })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, segments: &[&str]) -> Result<T> {
        let url = self.resource(segments)?;
        let rb = self
            .request(Method::GET, url.clone())
            .header(ACCEPT, "application/json");
        let resp = self.call(rb, &url).await?;
        let body = resp.bytes().await.map_err(|source| Error::ServerUnavailable {
            url: url.to_string(),
            source,
        })?;
        serde_json::from_slice(&body).map_err(|e| Error::MalformedResponse {
            url: url.to_string(),
            detail: e.to_string(),
        })
    }

    async fn put_text(&self, segments: &[&str], body: &str) -> Result<()> {
        let url = self.resource(segments)?;
        let rb = self
            .request(Method::PUT, url.clone())
            .header(CONTENT_TYPE, "text/plain")
            .body(body.to_string());
        self.call(rb, &url).await?;
        Ok(())
    }

    async fn put_json<T: Serialize + ?Sized>(&self, segments: &[&str], body: &T) -> Result<()> {
        let url = self.resource(segments)?;
        let rb = self.request(Method::PUT, url.clone()).json(body);
        self.call(rb, &url).await?;
        Ok(())
    }

    async fn upload(&self, file_name: &str, contents: Bytes) -> Result<()> {
        let url = self.resource(&["wd", file_name])?;
        let rb = self
            .request(Method::PUT, url.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(contents);
        self.call(rb, &url).await?;
        Ok(())
    }

    async fn get_time(&self, segment: &str) -> Result<Option<OffsetDateTime>> {
        let raw = self.get_text(&[segment]).await?;
        parse_time(&raw).map_err(|detail| Error::MalformedResponse {
            url: self.url.to_string(),
            detail,
        })
    }
}

#[async_trait]
impl Run for RestRun {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_time(&self) -> Result<Option<OffsetDateTime>> {
        self.get_time("createTime").await
    }

    async fn start_time(&self) -> Result<Option<OffsetDateTime>> {
        self.get_time("startTime").await
    }

    async fn finish_time(&self) -> Result<Option<OffsetDateTime>> {
        self.get_time("finishTime").await
    }

    async fn status(&self) -> Result<RunStatus> {
        let raw = self.get_text(&["status"]).await?;
        raw.parse().map_err(|detail| Error::MalformedResponse {
            url: self.url.to_string(),
            detail,
        })
    }

    async fn exit_code(&self) -> Result<Option<i32>> {
        let raw = self
            .get_text(&["listeners", "io", "properties", "exitcode"])
            .await?;
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse()
            .map(Some)
            .map_err(|_| Error::MalformedResponse {
                url: self.url.to_string(),
                detail: format!("exit code '{raw}' is not an integer"),
            })
    }

    async fn console_output(&self) -> Result<String> {
        self.get_text(&["listeners", "io", "properties", "stdout"])
            .await
    }

    async fn console_error(&self) -> Result<String> {
        self.get_text(&["listeners", "io", "properties", "stderr"])
            .await
    }

    async fn start(&self) -> Result<()> {
        self.put_text(&["status"], RunStatus::Running.as_wire_str())
            .await
    }

    async fn delete(&self) -> Result<()> {
        let url = self.url.clone();
        let rb = self.request(Method::DELETE, url.clone());
        self.call(rb, &url).await?;
        Ok(())
    }

    async fn input_ports(&self) -> Result<Vec<InputPortInfo>> {
        let list: WireInputList = self.get_json(&["input"]).await?;
        Ok(list
            .ports
            .into_iter()
            .map(|p| InputPortInfo {
                name: p.name,
                depth: p.depth,
                is_set: p.set,
            })
            .collect())
    }

    async fn set_input_value(&self, port: &str, value: &str) -> Result<()> {
        self.put_json(&["input", "input", port], &WireInputValue::Value(value))
            .await
    }

    async fn set_input_file(&self, port: &str, file_name: &str, contents: Bytes) -> Result<()> {
        self.upload(file_name, contents).await?;
        self.put_json(&["input", "input", port], &WireInputValue::File(file_name))
            .await
    }

    async fn set_bundle_input(&self, file_name: &str, contents: Bytes) -> Result<()> {
        self.upload(file_name, contents).await?;
        self.put_text(&["input", "baclava"], file_name).await
    }

    async fn request_bundle_output(&self) -> Result<()> {
        self.put_text(&["output"], DEFAULT_BUNDLE_OUTPUT).await
    }

    async fn bundle_output(&self) -> Result<Bytes> {
        let url = self.resource(&["wd", DEFAULT_BUNDLE_OUTPUT])?;
        let rb = self.request(Method::GET, url.clone());
        let resp = self.call(rb, &url).await?;
        resp.bytes()
            .await
            .map_err(|source| Error::ServerUnavailable {
                url: url.to_string(),
                source,
            })
    }

    async fn output_ports(&self) -> Result<Vec<OutputPort>> {
        let list: WireOutputList = self.get_json(&["output"]).await?;
        Ok(list.ports.into_iter().map(WirePort::into_port).collect())
    }

    async fn fetch_value(&self, value: &PortValue) -> Result<Bytes> {
        match value {
            PortValue::Inline { data, .. } => Ok(data.clone()),
            PortValue::Error { message } => Err(Error::ErrorValue {
                message: message.clone(),
            }),
            PortValue::Reference { uri, .. } => {
                let url = Url::parse(uri).map_err(|e| Error::MalformedResponse {
                    url: self.url.to_string(),
                    detail: format!("bad reference '{uri}': {e}"),
                })?;
                let rb = self.request(Method::GET, url.clone());
                let resp = expect_success(send(rb, &url).await?).await?;
                resp.bytes()
                    .await
                    .map_err(|source| Error::ServerUnavailable {
                        url: url.to_string(),
                        source,
                    })
            }
        }
    }
}

fn authed(rb: RequestBuilder, credentials: Option<&Credentials>) -> RequestBuilder {
    match credentials {
        Some(c) => rb.basic_auth(&c.username, Some(&c.password)),
        None => rb,
    }
}

async fn send(rb: RequestBuilder, url: &Url) -> Result<Response> {
    rb.send().await.map_err(|source| Error::ServerUnavailable {
        url: url.to_string(),
        source,
    })
}

async fn expect_success(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::AccessDenied { url }),
        _ => {
            let body = resp.text().await.unwrap_or_default();
            Err(Error::UnexpectedResponse {
                url,
                status: status.as_u16(),
                body: body.trim().to_string(),
            })
        }
    }
}

fn non_empty_or(s: &str, fallback: &str) -> String {
    if s.is_empty() {
        fallback.to_string()
    } else {
        s.to_string()
    }
}

/// Append percent-encoded path segments, dropping any trailing slash first.
fn join_segments(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::InvalidArgument {
            arg: "server-address",
            value: base.to_string(),
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn run_id_from_url(url: &Url) -> Option<String> {
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

fn parse_time(raw: &str) -> std::result::Result<Option<OffsetDateTime>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    OffsetDateTime::parse(raw, &Rfc3339)
        .map(Some)
        .map_err(|e| format!("bad timestamp '{raw}': {e}"))
}

#[derive(Debug, Deserialize)]
struct WireInputList {
    #[serde(default)]
    ports: Vec<WireInput>,
}

#[derive(Debug, Deserialize)]
struct WireInput {
    name: String,
    #[serde(default)]
    depth: usize,
    #[serde(default)]
    set: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum WireInputValue<'a> {
    Value(&'a str),
    File(&'a str),
}

#[derive(Debug, Deserialize)]
struct WireOutputList {
    #[serde(default)]
    ports: Vec<WirePort>,
}

#[derive(Debug, Deserialize)]
struct WirePort {
    name: String,
    #[serde(default)]
    depth: usize,
    value: WireNode,
}

impl WirePort {
    fn into_port(self) -> OutputPort {
        OutputPort {
            name: self.name,
            depth: self.depth,
            data: self.value.into_data(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireNode {
    List(Vec<WireNode>),
    Value(WireValue),
    Error(WireError),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireValue {
    reference: Option<String>,
    #[serde(default = "default_content_type")]
    content_type: String,
    size: Option<u64>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl WireNode {
    fn into_data(self) -> PortData {
        match self {
            WireNode::List(items) => {
                PortData::List(items.into_iter().map(WireNode::into_data).collect())
            }
            WireNode::Error(e) => PortData::Value(PortValue::Error { message: e.message }),
            WireNode::Value(v) => PortData::Value(match (v.data, v.reference) {
                (Some(data), _) => PortValue::Inline {
                    content_type: v.content_type,
                    data: Bytes::from(data),
                },
                (None, Some(uri)) => PortValue::Reference {
                    uri,
                    content_type: v.content_type,
                    size: v.size.unwrap_or(0),
                },
                (None, None) => PortValue::Inline {
                    content_type: v.content_type,
                    data: Bytes::new(),
                },
            }),
        }
    }
}
