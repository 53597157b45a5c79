use structopt::StructOpt;

use cbd::worker::{bind_worker_listener, run_worker};

#[derive(Debug, StructOpt)]
#[structopt(name = "cbd-worker", about = "Build worker of the cbd build cluster")]
struct Opt {
    /// Port to accept jobs on; picked from the worker range when omitted
    #[structopt(long)]
    port: Option<u16>,
    /// Address of the coordinator; standalone when omitted
    #[structopt(long, env = "CBD_SERVER")]
    server: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> cbd::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();
    let opt = Opt::from_args();

    let (listener, port) = bind_worker_listener(opt.port).await?;
    log::info!("cbd worker started at port {}", port);

    let task_set = tokio::task::LocalSet::new();
    task_set
        .run_until(run_worker(listener, port, opt.server))
        .await
}
