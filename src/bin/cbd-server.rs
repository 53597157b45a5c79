use std::net::{Ipv4Addr, SocketAddr};

use structopt::StructOpt;
use tokio::net::TcpListener;

use cbd::scheduler::SchedulerRef;
use cbd::server::rpc::run_server;
use cbd::{setup_interrupt, DISCOVERY_PORT};

#[derive(Debug, StructOpt)]
#[structopt(name = "cbd-server", about = "Central scheduler of the cbd build cluster")]
struct Opt {
    /// Port to listen on
    #[structopt(long, default_value = "15796")]
    port: u16,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> cbd::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();
    let opt = Opt::from_args();

    let address = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), opt.port);
    let listener = TcpListener::bind(address).await?;
    log::info!("cbd server started at port {}", opt.port);

    let end_rx = setup_interrupt();
    let scheduler = SchedulerRef::new();

    let task_set = tokio::task::LocalSet::new();
    task_set
        .run_until(run_server(listener, scheduler, end_rx, DISCOVERY_PORT))
        .await?;

    log::info!("cbd server ends");
    Ok(())
}
