//! Protocol message types
//!
//! Every type here can travel inside an [`AnyPayload`](crate::AnyPayload) and
//! carries a stable `wharf/wharf.v1.*` type URL. Optionality mirrors the wire
//! format: a `None` field was simply not set by the peer.

use crate::envelope::{pack_any, unpack_any, AnyPayload, Payload};
use crate::error::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

macro_rules! impl_payload {
    ($($ty:ident => $name:literal),+ $(,)?) => {
        $(impl Payload for $ty {
            const TYPE_URL: &'static str = concat!("wharf/wharf.v1.", $name);
        })+
    };
}

// ── files ────────────────────────────────────────────────────────────

/// A file argument: either an inline blob or a `sha256:<hex>` reference to a
/// file the broker (and ideally the provider) already holds. Exactly one of
/// `blob` and `ref` must be set; resolution fills `media` and the canonical
/// ref.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct File {
    #[prost(string, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub media: Option<String>,

    #[prost(bytes = "bytes", optional, tag = "2")]
    #[serde(
        with = "crate::serde_utils::option_base64_bytes",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub blob: Option<Bytes>,

    #[prost(string, optional, tag = "3")]
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none", default)]
    pub r#ref: Option<String>,
}

// ── tasks ────────────────────────────────────────────────────────────

/// Common metadata identifying a task within a job.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct TaskMetadata {
    #[prost(string, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub job_id: Option<String>,

    #[prost(uint64, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub index: Option<u64>,

    #[prost(string, optional, tag = "3")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client: Option<String>,
}

impl TaskMetadata {
    /// Display identifier of the form `job/index` used in logs.
    pub fn task_id(&self) -> String {
        format!(
            "{}/{:04}",
            self.job_id.as_deref().unwrap_or("?"),
            self.index.unwrap_or(0)
        )
    }
}

/// Parameters for a WASI (preview 1) execution.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct Wasip1Params {
    #[prost(message, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub binary: Option<File>,

    #[prost(string, repeated, tag = "2")]
    #[serde(default)]
    pub args: Vec<String>,

    #[prost(string, repeated, tag = "3")]
    #[serde(default)]
    pub envs: Vec<String>,

    #[prost(bytes = "bytes", optional, tag = "4")]
    #[serde(
        with = "crate::serde_utils::option_base64_bytes",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub stdin: Option<Bytes>,

    #[prost(message, optional, tag = "5")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rootfs: Option<File>,

    #[prost(string, repeated, tag = "6")]
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl Wasip1Params {
    /// Fill unset fields from a parent specification. Empty repeated fields
    /// count as unset.
    pub fn inherit(mut self, parent: &Wasip1Params) -> Self {
        if self.binary.is_none() {
            self.binary = parent.binary.clone();
        }
        if self.args.is_empty() {
            self.args = parent.args.clone();
        }
        if self.envs.is_empty() {
            self.envs = parent.envs.clone();
        }
        if self.stdin.is_none() {
            self.stdin = parent.stdin.clone();
        }
        if self.rootfs.is_none() {
            self.rootfs = parent.rootfs.clone();
        }
        if self.artifacts.is_empty() {
            self.artifacts = parent.artifacts.clone();
        }
        self
    }
}

/// Parameters for a Pyodide (Python-in-WASM) execution.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct PyodideParams {
    #[prost(string, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub script: Option<String>,

    #[prost(string, repeated, tag = "2")]
    #[serde(default)]
    pub packages: Vec<String>,

    #[prost(bytes = "bytes", optional, tag = "3")]
    #[serde(
        with = "crate::serde_utils::option_base64_bytes",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub stdin: Option<Bytes>,
}

/// Runtime-specific task parameters.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Oneof)]
pub enum TaskParams {
    #[prost(message, tag = "4")]
    Wasip1(Wasip1Params),
    #[prost(message, tag = "5")]
    Pyodide(PyodideParams),
}

/// The execution request sent to a provider.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct TaskRequest {
    #[prost(message, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub info: Option<TaskMetadata>,

    #[prost(oneof = "TaskParams", tags = "4, 5")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub params: Option<TaskParams>,
}

impl TaskRequest {
    /// Content refs a provider must hold locally to run this task.
    /// WASI tasks need their binary and rootfs refs; Pyodide tasks fetch
    /// their packages themselves and need none.
    pub fn required_files(&self) -> Vec<String> {
        let mut files = Vec::with_capacity(2);
        if let Some(TaskParams::Wasip1(p)) = &self.params {
            if let Some(r) = p.binary.as_ref().and_then(|f| f.r#ref.clone()) {
                files.push(r);
            }
            if let Some(r) = p.rootfs.as_ref().and_then(|f| f.r#ref.clone()) {
                files.push(r);
            }
        }
        files
    }

    /// Display identifier for logs.
    pub fn task_id(&self) -> String {
        self.info
            .as_ref()
            .map(|i| i.task_id())
            .unwrap_or_else(|| "?/????".to_string())
    }
}

/// Output of a successful execution.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct TaskOutput {
    /// Process exit status.
    #[prost(int32, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<i32>,

    #[prost(bytes = "bytes", optional, tag = "2")]
    #[serde(
        with = "crate::serde_utils::option_base64_bytes",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub stdout: Option<Bytes>,

    #[prost(bytes = "bytes", optional, tag = "3")]
    #[serde(
        with = "crate::serde_utils::option_base64_bytes",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub stderr: Option<Bytes>,

    /// Zipped artifacts requested by the task, if any.
    #[prost(message, optional, tag = "4")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub artifacts: Option<File>,
}

/// Either an output or an application-level error string.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Oneof)]
pub enum TaskResult {
    #[prost(message, tag = "2")]
    Ok(TaskOutput),
    #[prost(string, tag = "3")]
    Error(String),
}

/// The execution response returned by a provider.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct TaskResponse {
    #[prost(message, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub info: Option<TaskMetadata>,

    #[prost(oneof = "TaskResult", tags = "2, 3")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<TaskResult>,
}

impl TaskResponse {
    /// True if the result variant is present and not an error.
    pub fn is_ok(&self) -> bool {
        matches!(self.result, Some(TaskResult::Ok(_)))
    }

    /// The application error string, if the provider reported one.
    pub fn error_message(&self) -> Option<&str> {
        match &self.result {
            Some(TaskResult::Error(e)) => Some(e),
            _ => None,
        }
    }
}

// ── provider events ──────────────────────────────────────────────────

/// Initial hello from a provider with identification details.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct ProviderHello {
    #[prost(string, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,

    #[prost(string, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub useragent: Option<String>,
}

/// Resource update: how many tasks the provider is willing to run at once.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct ProviderResources {
    #[prost(uint32, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub concurrency: Option<u32>,

    #[prost(uint32, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tasks: Option<u32>,
}

/// Incremental update of the files a provider holds locally.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct FileSystemUpdate {
    #[prost(string, repeated, tag = "1")]
    #[serde(default)]
    pub added: Vec<String>,

    #[prost(string, repeated, tag = "2")]
    #[serde(default)]
    pub removed: Vec<String>,
}

/// Free-form text message, logged on the receiving side.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct GenericMessage {
    #[prost(string, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

/// Best-effort notice that a task's context was cancelled broker-side.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct CancelTask {
    #[prost(message, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub info: Option<TaskMetadata>,

    #[prost(string, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

// ── cluster events ───────────────────────────────────────────────────

/// Cluster membership update broadcast to all providers.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct ClusterInfo {
    #[prost(uint32, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub providers: Option<u32>,
}

/// Cluster throughput in tasks per second, broadcast periodically.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct Throughput {
    #[prost(float, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub overall: Option<f32>,
}

// ── file RPCs (broker → provider) ────────────────────────────────────

/// Ask the provider to list the refs it holds.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct FileListingRequest {}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct FileListingResponse {
    #[prost(string, repeated, tag = "1")]
    #[serde(default)]
    pub files: Vec<String>,
}

/// Cheap existence check for a single ref.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct FileProbeRequest {
    #[prost(string, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file: Option<String>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct FileProbeResponse {
    #[prost(bool, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ok: Option<bool>,
}

/// Push a file's bytes to the provider.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct FileUploadRequest {
    #[prost(message, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub upload: Option<File>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct FileUploadResponse {
    #[prost(string, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub err: Option<String>,
}

// ── offloading jobs (client → broker) ────────────────────────────────

/// A batch of task specifications sharing optional parent defaults.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct OffloadJobRequest {
    #[prost(message, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<Wasip1Params>,

    #[prost(message, repeated, tag = "2")]
    #[serde(default)]
    pub tasks: Vec<Wasip1Params>,
}

/// Aggregated job response: per-task results in original order, plus an
/// overall failure string when the job never dispatched.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct OffloadJobResponse {
    #[prost(string, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure: Option<String>,

    #[prost(message, repeated, tag = "2")]
    #[serde(default)]
    pub tasks: Vec<TaskResponse>,
}

impl_payload! {
    File => "File",
    TaskMetadata => "TaskMetadata",
    TaskRequest => "TaskRequest",
    TaskResponse => "TaskResponse",
    TaskOutput => "TaskOutput",
    Wasip1Params => "Wasip1Params",
    PyodideParams => "PyodideParams",
    ProviderHello => "ProviderHello",
    ProviderResources => "ProviderResources",
    FileSystemUpdate => "FileSystemUpdate",
    GenericMessage => "GenericMessage",
    CancelTask => "CancelTask",
    ClusterInfo => "ClusterInfo",
    Throughput => "Throughput",
    FileListingRequest => "FileListingRequest",
    FileListingResponse => "FileListingResponse",
    FileProbeRequest => "FileProbeRequest",
    FileProbeResponse => "FileProbeResponse",
    FileUploadRequest => "FileUploadRequest",
    FileUploadResponse => "FileUploadResponse",
    OffloadJobRequest => "OffloadJobRequest",
    OffloadJobResponse => "OffloadJobResponse",
}

// ── typed events ─────────────────────────────────────────────────────

/// A decoded event message. Events whose type URL this build does not know
/// are passed through as [`Event::Other`] so handlers can log them.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    ProviderHello(ProviderHello),
    ProviderResources(ProviderResources),
    FileSystemUpdate(FileSystemUpdate),
    GenericMessage(GenericMessage),
    CancelTask(CancelTask),
    ClusterInfo(ClusterInfo),
    Throughput(Throughput),
    Other(AnyPayload),
}

impl Event {
    /// Decode an event payload by its type URL. Fails only when the payload
    /// bytes are malformed for a known type.
    pub fn from_any(any: &AnyPayload) -> Result<Event> {
        Ok(match any.type_url.as_str() {
            ProviderHello::TYPE_URL => Event::ProviderHello(unpack_any(any)?),
            ProviderResources::TYPE_URL => Event::ProviderResources(unpack_any(any)?),
            FileSystemUpdate::TYPE_URL => Event::FileSystemUpdate(unpack_any(any)?),
            GenericMessage::TYPE_URL => Event::GenericMessage(unpack_any(any)?),
            CancelTask::TYPE_URL => Event::CancelTask(unpack_any(any)?),
            ClusterInfo::TYPE_URL => Event::ClusterInfo(unpack_any(any)?),
            Throughput::TYPE_URL => Event::Throughput(unpack_any(any)?),
            _ => Event::Other(any.clone()),
        })
    }

    /// Pack the event back into a self-describing payload.
    pub fn to_any(&self) -> AnyPayload {
        match self {
            Event::ProviderHello(m) => pack_any(m),
            Event::ProviderResources(m) => pack_any(m),
            Event::FileSystemUpdate(m) => pack_any(m),
            Event::GenericMessage(m) => pack_any(m),
            Event::CancelTask(m) => pack_any(m),
            Event::ClusterInfo(m) => pack_any(m),
            Event::Throughput(m) => pack_any(m),
            Event::Other(any) => any.clone(),
        }
    }

    /// The type URL this event travels under.
    pub fn type_url(&self) -> &str {
        match self {
            Event::ProviderHello(_) => ProviderHello::TYPE_URL,
            Event::ProviderResources(_) => ProviderResources::TYPE_URL,
            Event::FileSystemUpdate(_) => FileSystemUpdate::TYPE_URL,
            Event::GenericMessage(_) => GenericMessage::TYPE_URL,
            Event::CancelTask(_) => CancelTask::TYPE_URL,
            Event::ClusterInfo(_) => ClusterInfo::TYPE_URL,
            Event::Throughput(_) => Throughput::TYPE_URL,
            Event::Other(any) => &any.type_url,
        }
    }
}
