//! The coordinator: accepts connections, demultiplexes them by their first
//! message and drives the scheduler. Must run within a LocalSet.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;

use crate::discovery::DiscoveryServer;
use crate::protocol::messages::{
    Message, MonitorRequest, WorkerRequest, WorkerResponse, WorkerState,
};
use crate::protocol::{MessageConnection, DEFAULT_TIMEOUT};
use crate::scheduler::{SchedulerRef, SchedulerRequest};
use crate::server::observer::{MonitorUpdate, UpdatePublisher, OBSERVER_QUEUE_SIZE};

/// Cadence of `Queued` keepalives to waiting clients.
const QUEUED_HEARTBEAT: Duration = Duration::from_secs(1);
/// Cadence of state snapshots pushed to monitors.
const STATE_BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

/// Serves the coordinator on `listener` until `end_rx` fires. The discovery
/// server is stopped and drained before this returns.
pub async fn run_server(
    listener: TcpListener,
    scheduler: SchedulerRef,
    mut end_rx: UnboundedReceiver<()>,
    discovery_port: u16,
) -> crate::Result<()> {
    let publisher = UpdatePublisher::start();

    let service_port = listener.local_addr()?.port();
    let discovery = DiscoveryServer::bind(service_port, discovery_port).await?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let discovery_handle = tokio::task::spawn_local(discovery.run(stop_rx));

    tokio::task::spawn_local(send_work_state(scheduler.clone(), publisher.clone()));

    tokio::select! {
        result = connection_initiator(listener, scheduler, publisher) => result?,
        _ = end_rx.recv() => {
            log::debug!("Stop requested, shutting down");
        }
    }

    let _ = stop_tx.send(true);
    discovery_handle
        .await
        .map_err(|e| crate::Error::GenericError(format!("discovery task failed: {}", e)))??;
    Ok(())
}

pub async fn connection_initiator(
    listener: TcpListener,
    scheduler: SchedulerRef,
    publisher: UpdatePublisher,
) -> crate::Result<()> {
    loop {
        let (socket, address) = listener.accept().await?;
        socket.set_nodelay(true)?;
        let scheduler = scheduler.clone();
        let publisher = publisher.clone();
        tokio::task::spawn_local(async move {
            log::debug!("New connection: {}", address);
            let conn = MessageConnection::new(socket, DEFAULT_TIMEOUT);
            if let Err(e) = generic_rpc_loop(scheduler, publisher, conn).await {
                log::error!("Connection {} failed: {}", address, e);
            }
            log::debug!("Connection ended: {}", address);
        });
    }
}

/// The first message decides the role of the connection for its whole
/// lifetime.
pub async fn generic_rpc_loop<T: AsyncRead + AsyncWrite + Unpin>(
    scheduler: SchedulerRef,
    publisher: UpdatePublisher,
    mut conn: MessageConnection<T>,
) -> crate::Result<()> {
    match conn.read().await? {
        Message::WorkerState(state) => worker_rpc_loop(&scheduler, conn, state).await,
        Message::WorkerRequest(request) => client_rpc_loop(&scheduler, conn, request).await,
        Message::MonitorRequest(request) => monitor_rpc_loop(&publisher, conn, request).await,
        Message::CompletedJob(cj) => {
            log::debug!("Completed job on {}: speed {:.0}", cj.worker, cj.compile_speed);
            if let Err(e) = scheduler.get_mut().completed(&cj) {
                log::error!("Failed to record completed job: {}", e);
            }
            publisher.publish(MonitorUpdate::Completed(cj));
            Ok(())
        }
        other => {
            log::error!("Un-handled first message type: {}", other.type_name());
            Ok(())
        }
    }
}

/// Integrates state pushes from one worker; the worker lives exactly as
/// long as its connection.
async fn worker_rpc_loop<T: AsyncRead + AsyncWrite + Unpin>(
    scheduler: &SchedulerRef,
    mut conn: MessageConnection<T>,
    initial: WorkerState,
) -> crate::Result<()> {
    let id = initial.id.clone();
    let host = initial.host.clone();
    log::info!("Worker {}[{}] registered", host, id);
    scheduler.get_mut().add_worker(initial);

    loop {
        match conn.read_worker_state().await {
            Ok(state) => scheduler.get_mut().update_worker(state),
            Err(e) => {
                log::info!("Worker {} connection closed: {}", host, e);
                scheduler.get_mut().remove_worker(&id);
                return Ok(());
            }
        }
    }
}

/// Feeds one client request through the scheduler and keeps the client
/// informed until a terminal answer arrives. A failed send means the client
/// is gone, which cancels the request.
async fn client_rpc_loop<T: AsyncRead + AsyncWrite + Unpin>(
    scheduler: &SchedulerRef,
    mut conn: MessageConnection<T>,
    request: WorkerRequest,
) -> crate::Result<()> {
    log::debug!("Worker request from {}", request.client);
    let (sched_request, mut response_rx) = SchedulerRequest::new(request.client.clone(), request.addrs);
    let guid = sched_request.guid;
    scheduler.get_mut().schedule(sched_request)?;

    loop {
        let response = tokio::select! {
            response = response_rx.recv() => match response {
                Some(response) => response,
                None => return Ok(()),
            },
            _ = tokio::time::sleep(QUEUED_HEARTBEAT) => WorkerResponse::Queued,
        };

        let terminal = !matches!(response, WorkerResponse::Queued);
        if let Err(e) = conn.send(&Message::WorkerResponse(response)).await {
            log::debug!("Client {} gone, canceling request: {}", request.client, e);
            let _ = scheduler.get_mut().cancel(guid);
            return Ok(());
        }
        if terminal {
            return Ok(());
        }
    }
}

/// Shuffles published updates onto one monitor connection until a send
/// fails, then deregisters.
async fn monitor_rpc_loop<T: AsyncRead + AsyncWrite + Unpin>(
    publisher: &UpdatePublisher,
    mut conn: MessageConnection<T>,
    request: MonitorRequest,
) -> crate::Result<()> {
    let (sink, mut updates) = tokio::sync::mpsc::channel(OBSERVER_QUEUE_SIZE);
    log::info!("Monitor {} registered", request.host);
    publisher.add_observer(request.host.clone(), sink);

    while let Some(update) = updates.recv().await {
        let message = match update {
            MonitorUpdate::Completed(cj) => Message::CompletedJob(cj),
            MonitorUpdate::State(info) => Message::ServerStateInfo(info),
        };
        if let Err(e) = conn.send(&message).await {
            log::info!("Dropping monitor {}: {}", request.host, e);
            break;
        }
    }
    publisher.remove_observer(&request.host);
    Ok(())
}

/// Pushes a state snapshot to every monitor at 1 Hz.
async fn send_work_state(scheduler: SchedulerRef, publisher: UpdatePublisher) {
    let mut interval = tokio::time::interval(STATE_BROADCAST_INTERVAL);
    loop {
        interval.tick().await;
        publisher.publish(MonitorUpdate::State(scheduler.get().state_info()));
    }
}
