//! Collaborator interface to a T2 workflow server.
//!
//! The driver only talks to these traits. `rest` maps them onto the server's
//! HTTP resources; `memory` is an in-process stand-in for tests.

#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod rest;

use crate::error::Result;
use crate::model::{Credentials, InputPortInfo, OutputPort, PortValue, RunStatus};
use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;

#[async_trait]
pub trait Server: Send + Sync {
    type Run: Run;

    /// Submit a workflow definition, returning a handle to the new run.
    async fn create_run(
        &self,
        workflow: Bytes,
        credentials: Option<&Credentials>,
    ) -> Result<Self::Run>;

    /// Look up an existing run by identifier.
    async fn get_run(&self, id: &str, credentials: Option<&Credentials>) -> Result<Self::Run>;
}

/// Handle to one server-side run. All state lives on the server; every
/// accessor is a remote call.
#[async_trait]
pub trait Run: Send + Sync {
    fn id(&self) -> &str;

    async fn create_time(&self) -> Result<Option<OffsetDateTime>>;
    async fn start_time(&self) -> Result<Option<OffsetDateTime>>;
    async fn finish_time(&self) -> Result<Option<OffsetDateTime>>;
    async fn status(&self) -> Result<RunStatus>;
    /// `None` until the run has finished.
    async fn exit_code(&self) -> Result<Option<i32>>;
    async fn console_output(&self) -> Result<String>;
    async fn console_error(&self) -> Result<String>;

    async fn start(&self) -> Result<()>;
    async fn delete(&self) -> Result<()>;

    async fn input_ports(&self) -> Result<Vec<InputPortInfo>>;
    async fn set_input_value(&self, port: &str, value: &str) -> Result<()>;
    async fn set_input_file(&self, port: &str, file_name: &str, contents: Bytes) -> Result<()>;

    async fn set_bundle_input(&self, file_name: &str, contents: Bytes) -> Result<()>;
    async fn request_bundle_output(&self) -> Result<()>;
    async fn bundle_output(&self) -> Result<Bytes>;

    async fn output_ports(&self) -> Result<Vec<OutputPort>>;
    /// Payload of a leaf, fetching it from the server if it is a reference.
    async fn fetch_value(&self, value: &PortValue) -> Result<Bytes>;
}
