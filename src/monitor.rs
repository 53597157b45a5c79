//! Read-only observer of the cluster: subscribes to the coordinator's event
//! stream and prints completed jobs and worker state.

use std::fmt::Write as _;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::discovery::discover_server;
use crate::machine::hostname_string;
use crate::protocol::messages::{Message, MonitorRequest};
use crate::protocol::{connect, MessageConnection, DEFAULT_TIMEOUT};
use crate::DEFAULT_SERVER_PORT;

/// How long auto-discovery may search before the monitor gives up.
const DISCOVERY_SEARCH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Monitor {
    server_addr: Option<String>,
}

impl Monitor {
    pub fn new(server_addr: Option<String>) -> Monitor {
        Monitor { server_addr }
    }

    /// Connects to the coordinator (searching for it when no address was
    /// given) and registers for updates.
    pub async fn connect(&self) -> crate::Result<MessageConnection<TcpStream>> {
        let address = match &self.server_addr {
            Some(address) => address.clone(),
            None => {
                log::debug!("Finding coordinator with auto-discovery");
                discover_server(DISCOVERY_SEARCH_TIMEOUT).await?.to_string()
            }
        };

        let mut conn = connect(&address, DEFAULT_SERVER_PORT, DEFAULT_TIMEOUT).await?;

        // Identify uniquely even with several monitors per host
        let host = format!("{}({})", hostname_string()?, std::process::id());
        conn.send(&Message::MonitorRequest(MonitorRequest { host }))
            .await?;

        Ok(conn)
    }

    /// Prints report data in raw form until the connection fails.
    pub async fn basic_report(&self) -> crate::Result<()> {
        let mut conn = self.connect().await?;

        loop {
            match conn.read().await? {
                Message::CompletedJob(cj) => {
                    println!(
                        "{}: finished job in {:.3}s (speed: {:.0})",
                        cj.worker,
                        cj.compile_time.as_secs_f64(),
                        cj.compile_speed
                    );
                }
                Message::ServerStateInfo(info) => {
                    let mut line = String::from("[");
                    for state in &info.workers {
                        let _ = write!(
                            line,
                            "{}[{}|{}|{:.0}] ",
                            state.host, state.load, state.capacity, state.speed
                        );
                    }
                    line.push(']');
                    println!("{}", line);
                }
                other => {
                    log::error!("Unknown message type: {}", other.type_name());
                }
            }
        }
    }
}
