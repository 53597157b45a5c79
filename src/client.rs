//! The client driver wraps one compiler invocation: ask the coordinator for
//! a worker, ship the job, and fall back to building locally when the
//! cluster cannot help.

use std::time::{Duration, Instant};

use crate::machine::{get_machine_id, hostname_string, MachineName};
use crate::net::get_local_ip_addrs;
use crate::protocol::messages::{
    CompileJob, CompileResult, CompletedJob, Message, WorkerRequest, WorkerResponse,
};
use crate::protocol::{connect, DEFAULT_TIMEOUT};
use crate::{DEFAULT_SERVER_PORT, DEFAULT_WORKER_PORT};

/// Total time a client waits for the coordinator to name a worker.
const FIND_WORKER_TIMEOUT: Duration = Duration::from_secs(10);
/// Completion reports must never hold up the build.
const REPORT_TIMEOUT: Duration = Duration::from_secs(1);

/// Builds the job remotely when possible, locally otherwise, and reports
/// the completed job to the coordinator either way.
///
/// Environment: `CBD_SERVER` names the coordinator, `CBD_POTENTIAL_HOST`
/// bypasses it and uses that worker directly, `CBD_NO_LOCAL=yes` turns the
/// local fallback into a hard error.
pub async fn client_build_job(job: CompileJob) -> crate::Result<CompileResult> {
    let server = std::env::var("CBD_SERVER").unwrap_or_default();
    let mut address = std::env::var("CBD_POTENTIAL_HOST").unwrap_or_default();
    let mut worker = None;

    // With a server but no explicit host, ask the server
    if address.is_empty() && !server.is_empty() {
        match find_worker(&server).await {
            Ok((name, found)) => {
                address = found;
                worker = Some(name);
            }
            Err(e) => log::error!("Find worker error: {}", e),
        }
    }

    let start = Instant::now();
    let mut result = None;

    if !address.is_empty() {
        match build_remote(&address, &job).await {
            Ok(remote) => result = Some(remote),
            Err(e) => log::error!("Remote build error: {}", e),
        }
    }

    if result.is_none() {
        let no_local = std::env::var("CBD_NO_LOCAL").unwrap_or_default() == "yes";
        if no_local {
            return Err(crate::Error::GenericError(
                "can't find a worker and local builds are disabled".into(),
            ));
        }
        log::debug!("Building locally");
        result = Some(job.compile().await?);
        worker = Some(MachineName {
            id: get_machine_id(),
            host: job.host.clone(),
        });
    }

    let result = result.expect("either the remote or the local build produced a result");

    if !server.is_empty() {
        let duration = start.elapsed();
        if let Err(e) = report_completion(&server, worker, &job, &result, duration).await {
            log::error!("Report job error: {}", e);
        }
    }

    Ok(result)
}

/// Asks the coordinator for a worker. `Queued` responses keep us reading
/// until the overall deadline; `NoWorkers` or anything unexpected gives up.
pub async fn find_worker(server: &str) -> crate::Result<(MachineName, String)> {
    log::debug!("Finding worker via coordinator {}", server);
    let mut conn = connect(server, DEFAULT_SERVER_PORT, DEFAULT_TIMEOUT).await?;

    let request = WorkerRequest {
        client: MachineName {
            id: get_machine_id(),
            host: hostname_string()?,
        },
        addrs: get_local_ip_addrs()?,
    };
    conn.send(&Message::WorkerRequest(request)).await?;

    let deadline = Instant::now() + FIND_WORKER_TIMEOUT;
    loop {
        if Instant::now() >= deadline {
            return Err(crate::Error::Timeout);
        }
        match conn.read_worker_response().await? {
            WorkerResponse::Queued => {
                log::debug!("Queued, waiting for a free worker");
            }
            WorkerResponse::NoWorkers => return Err(crate::Error::NoReachableWorker),
            WorkerResponse::Valid(allocation) => {
                let address = format!("{}:{}", allocation.address.ip, allocation.port);
                log::debug!("Using worker: {} ({})", allocation.host, address);
                return Ok((
                    MachineName {
                        id: allocation.id,
                        host: allocation.host,
                    },
                    address,
                ));
            }
        }
    }
}

/// Builds the given job on the remote worker.
async fn build_remote(address: &str, job: &CompileJob) -> crate::Result<CompileResult> {
    log::debug!("Building on worker: {}", address);
    let mut conn = connect(address, DEFAULT_WORKER_PORT, DEFAULT_TIMEOUT).await?;
    conn.send(&Message::CompileJob(job.clone())).await?;
    let result = conn.read_compile_result().await?;
    log::debug!("Remote build complete");
    Ok(result)
}

/// Reports the completion of the given job to the coordinator.
async fn report_completion(
    server: &str,
    worker: Option<MachineName>,
    job: &CompileJob,
    result: &CompileResult,
    duration: Duration,
) -> crate::Result<()> {
    let mut cj = CompletedJob {
        client: MachineName {
            id: get_machine_id(),
            host: job.host.clone(),
        },
        worker: worker.unwrap_or_default(),
        input_size: job.input.len() as u64,
        output_size: result.object_code.len() as u64,
        compile_time: duration,
        compile_speed: 0.0,
    };
    cj.compute_compile_speed();

    let mut conn = connect(server, DEFAULT_SERVER_PORT, REPORT_TIMEOUT).await?;
    conn.send(&Message::CompletedJob(cj)).await
}

/// Routes debug output to `CBD_LOGFILE` when the caller asked for it, so a
/// compiler stand-in can log without polluting the build output.
pub fn setup_client_logging() {
    if let Ok(path) = std::env::var("CBD_LOGFILE") {
        if !path.is_empty() {
            match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    env_logger::Builder::from_env(
                        env_logger::Env::default().default_filter_or("debug"),
                    )
                    .target(env_logger::Target::Pipe(Box::new(file)))
                    .init();
                    return;
                }
                Err(e) => eprintln!("Could not open log file {}: {}", path, e),
            }
        }
    }
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "error");
    }
    pretty_env_logger::init();
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::find_worker;
    use crate::machine::MachineId;
    use crate::net::CidrAddr;
    use crate::protocol::messages::{Message, WorkerAllocation, WorkerRequest, WorkerResponse};
    use crate::protocol::MessageConnection;

    async fn scripted_coordinator(
        responses: Vec<WorkerResponse>,
    ) -> (String, tokio::task::JoinHandle<WorkerRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = MessageConnection::new(socket, Duration::from_secs(10));
            let request = match conn.read().await.unwrap() {
                Message::WorkerRequest(request) => request,
                other => panic!("Unexpected message: {:?}", other),
            };
            for response in responses {
                conn.send(&Message::WorkerResponse(response)).await.unwrap();
            }
            request
        });
        (address, handle)
    }

    #[tokio::test]
    async fn find_worker_waits_through_queued_responses() {
        let allocation = WorkerAllocation {
            id: MachineId::new("w"),
            host: "w".to_string(),
            address: CidrAddr::new(Ipv4Addr::new(192, 168, 1, 9), 24),
            port: 4242,
        };
        let (address, server) = scripted_coordinator(vec![
            WorkerResponse::Queued,
            WorkerResponse::Queued,
            WorkerResponse::Valid(allocation),
        ])
        .await;

        let (name, worker_address) = find_worker(&address).await.unwrap();
        assert_eq!(name.host, "w");
        assert_eq!(worker_address, "192.168.1.9:4242");

        let request = server.await.unwrap();
        assert!(!request.client.host.is_empty());
    }

    #[tokio::test]
    async fn find_worker_gives_up_without_workers() {
        let (address, server) = scripted_coordinator(vec![WorkerResponse::NoWorkers]).await;
        match find_worker(&address).await {
            Err(crate::Error::NoReachableWorker) => {}
            other => panic!("Unexpected result: {:?}", other),
        }
        server.await.unwrap();
    }
}
