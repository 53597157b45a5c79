//! The closed set of messages exchanged between clients, workers, monitors
//! and the coordinator, together with their payload types.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::machine::{MachineId, MachineName};
use crate::net::CidrAddr;

/// The result of running a command.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecResult {
    /// Interleaved stdout/stderr of the command.
    #[serde(with = "serde_bytes")]
    pub output: Vec<u8>,
    /// Return code of the program, -1 when killed by a signal.
    pub ret: i32,
}

/// Parsed compiler command line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Build {
    pub args: Vec<String>,
    /// Index of the output path argument.
    pub oindex: Option<usize>,
    /// Index of the input file argument.
    pub iindex: Option<usize>,
    /// Index of the "-c" flag.
    pub cindex: Option<usize>,
    pub distributable: bool,
}

/// A pre-processed translation unit to be farmed out to the cluster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CompileJob {
    /// Host requesting the build.
    pub host: String,
    pub build: Build,
    /// The pre-processed source to build.
    #[serde(with = "serde_bytes")]
    pub input: Vec<u8>,
    /// The compiler to build it with.
    pub compiler: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CompileResult {
    pub exec: ExecResult,
    #[serde(with = "serde_bytes")]
    pub object_code: Vec<u8>,
}

/// Load and capacity of a worker, pushed to the coordinator periodically.
/// `speed` and `updated` are owned by the coordinator and overwritten there.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerState {
    pub id: MachineId,
    pub host: String,
    pub addrs: Vec<CidrAddr>,
    /// Port the worker accepts jobs on.
    pub port: u16,
    /// Number of cores available for building.
    pub capacity: u32,
    /// How many cores are currently in use.
    pub load: u32,
    pub updated: SystemTime,
    pub speed: f64,
}

/// Sent by a client that wants a worker for one job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    pub client: MachineName,
    /// Networks the client can reach workers on.
    pub addrs: Vec<CidrAddr>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkerAllocation {
    pub id: MachineId,
    pub host: String,
    /// Worker address reachable from the requesting client.
    pub address: CidrAddr,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum WorkerResponse {
    /// No free worker yet, the request is waiting in the queue.
    Queued,
    /// The cluster has no workers at all.
    NoWorkers,
    Valid(WorkerAllocation),
}

/// Sent by a process that wishes to observe the cluster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MonitorRequest {
    pub host: String,
}

/// One job finished somewhere on the cluster; used to update the worker
/// speed estimate and to feed monitors.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompletedJob {
    pub client: MachineName,
    pub worker: MachineName,
    /// Bytes of source code compiled.
    pub input_size: u64,
    /// Bytes of object code produced.
    pub output_size: u64,
    pub compile_time: Duration,
    pub compile_speed: f64,
}

impl CompletedJob {
    /// Speed rating of the job in KiB of object code per second.
    pub fn compute_compile_speed(&mut self) {
        self.compile_speed =
            self.output_size as f64 / self.compile_time.as_secs_f64() / 1024.0;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestInfo {
    pub requester: MachineName,
    pub enqueued_at: SystemTime,
}

/// Snapshot of the coordinator state pushed to monitors.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ServerStateInfo {
    pub workers: Vec<WorkerState>,
    pub requests: Vec<RequestInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    CompileJob = 0,
    CompileResult = 1,
    WorkerRequest = 2,
    WorkerResponse = 3,
    WorkerState = 4,
    MonitorRequest = 5,
    CompletedJob = 6,
    ServerStateInfo = 7,
}

impl MessageTag {
    pub fn from_u8(tag: u8) -> Option<MessageTag> {
        match tag {
            0 => Some(MessageTag::CompileJob),
            1 => Some(MessageTag::CompileResult),
            2 => Some(MessageTag::WorkerRequest),
            3 => Some(MessageTag::WorkerResponse),
            4 => Some(MessageTag::WorkerState),
            5 => Some(MessageTag::MonitorRequest),
            6 => Some(MessageTag::CompletedJob),
            7 => Some(MessageTag::ServerStateInfo),
            _ => None,
        }
    }
}

/// Everything that can travel over a [`MessageConnection`]. The header tag
/// of each variant is stable; payloads are free to grow fields.
///
/// [`MessageConnection`]: crate::protocol::MessageConnection
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    CompileJob(CompileJob),
    CompileResult(CompileResult),
    WorkerRequest(WorkerRequest),
    WorkerResponse(WorkerResponse),
    WorkerState(WorkerState),
    MonitorRequest(MonitorRequest),
    CompletedJob(CompletedJob),
    ServerStateInfo(ServerStateInfo),
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::CompileJob(_) => MessageTag::CompileJob,
            Message::CompileResult(_) => MessageTag::CompileResult,
            Message::WorkerRequest(_) => MessageTag::WorkerRequest,
            Message::WorkerResponse(_) => MessageTag::WorkerResponse,
            Message::WorkerState(_) => MessageTag::WorkerState,
            Message::MonitorRequest(_) => MessageTag::MonitorRequest,
            Message::CompletedJob(_) => MessageTag::CompletedJob,
            Message::ServerStateInfo(_) => MessageTag::ServerStateInfo,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Message::CompileJob(_) => "CompileJob",
            Message::CompileResult(_) => "CompileResult",
            Message::WorkerRequest(_) => "WorkerRequest",
            Message::WorkerResponse(_) => "WorkerResponse",
            Message::WorkerState(_) => "WorkerState",
            Message::MonitorRequest(_) => "MonitorRequest",
            Message::CompletedJob(_) => "CompletedJob",
            Message::ServerStateInfo(_) => "ServerStateInfo",
        }
    }
}
