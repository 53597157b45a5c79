//! The worker agent: serves inbound compile jobs and keeps the coordinator
//! informed about its capacity and load.

use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::sleep;

use crate::machine::{get_load_average, get_machine_id, hostname_string};
use crate::net::get_local_ip_addrs;
use crate::protocol::messages::{CompileResult, ExecResult, Message, WorkerState};
use crate::protocol::{connect, MessageConnection, DEFAULT_TIMEOUT};
use crate::{DEFAULT_SERVER_PORT, END_PORT, START_PORT};

/// How often we push our state to the coordinator.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);
/// How long we wait before a reconnection attempt.
const RECONNECT_WAIT: Duration = Duration::from_secs(1);

/// Binds the job listener, either on the requested port or on the first
/// free port of the auto-listen range.
pub async fn bind_worker_listener(port: Option<u16>) -> crate::Result<(TcpListener, u16)> {
    match port {
        Some(port) => {
            let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
            Ok((listener, port))
        }
        None => {
            for port in START_PORT..=END_PORT {
                if let Ok(listener) = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                    return Ok((listener, port));
                }
            }
            Err(crate::Error::GenericError(format!(
                "no free port in the worker listen range {}..={}",
                START_PORT, END_PORT
            )))
        }
    }
}

/// Serves build requests, and pushes status updates when a coordinator
/// address is known. Without one the worker runs standalone and only
/// explicitly named clients will find it. Must run within a LocalSet.
pub async fn run_worker(
    listener: TcpListener,
    port: u16,
    server_addr: Option<String>,
) -> crate::Result<()> {
    match server_addr {
        Some(server_addr) => {
            tokio::select! {
                result = accept_loop(listener) => result,
                result = status_loop(server_addr, port) => result,
            }
        }
        None => {
            log::info!("No coordinator configured, serving standalone");
            accept_loop(listener).await
        }
    }
}

async fn accept_loop(listener: TcpListener) -> crate::Result<()> {
    loop {
        let (socket, address) = listener.accept().await?;
        socket.set_nodelay(true)?;
        tokio::task::spawn_local(async move {
            log::debug!("New job connection: {}", address);
            let conn = MessageConnection::new(socket, DEFAULT_TIMEOUT);
            if let Err(e) = handle_request(conn).await {
                log::error!("Job connection {} failed: {}", address, e);
            }
            log::debug!("Job connection ended: {}", address);
        });
    }
}

/// One connection carries exactly one job: read it, build it, answer.
pub async fn handle_request<T: AsyncRead + AsyncWrite + Unpin>(
    mut conn: MessageConnection<T>,
) -> crate::Result<()> {
    let job = conn.read_compile_job().await?;
    log::debug!("Handling job from {} ({} bytes)", job.host, job.input.len());

    let built = match job.validate() {
        Ok(()) => job.compile().await,
        Err(e) => Err(e),
    };
    let result = match built {
        Ok(result) => result,
        Err(e) => {
            // The job never ran; ship the failure back as a result
            log::error!("Compile setup failed: {}", e);
            CompileResult {
                exec: ExecResult {
                    output: e.to_string().into_bytes(),
                    ret: -1,
                },
                object_code: Vec::new(),
            }
        }
    };

    conn.send(&Message::CompileResult(result)).await?;
    log::debug!("Job from {} done", job.host);
    Ok(())
}

/// Maintains a push connection to the coordinator, reporting capacity and
/// load every few seconds until the connection fails, then reconnects.
async fn status_loop(server_addr: String, port: u16) -> crate::Result<()> {
    // Identity and capacity do not change while we run
    let host = hostname_string()?;
    let id = get_machine_id();
    let addrs = get_local_ip_addrs()?;
    let capacity = num_cpus::get() as u32;

    loop {
        let mut conn = match connect(&server_addr, DEFAULT_SERVER_PORT, DEFAULT_TIMEOUT).await {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("Error connecting to coordinator: {}", e);
                sleep(RECONNECT_WAIT).await;
                continue;
            }
        };
        log::info!("Connected to coordinator at {}", server_addr);

        loop {
            let state = WorkerState {
                id: id.clone(),
                host: host.clone(),
                addrs: addrs.clone(),
                port,
                capacity,
                load: current_load(),
                updated: SystemTime::now(),
                speed: 0.0,
            };
            if let Err(e) = conn.send(&Message::WorkerState(state)).await {
                log::error!("Error sending state to coordinator: {}", e);
                break;
            }
            sleep(STATUS_INTERVAL).await;
        }

        sleep(RECONNECT_WAIT).await;
    }
}

/// The load is re-read on every tick; a probe failure counts as idle
/// rather than taking the worker down.
fn current_load() -> u32 {
    match get_load_average() {
        Ok(load) => load.ceil() as u32,
        Err(e) => {
            log::error!("Could not read load average: {}", e);
            0
        }
    }
}
