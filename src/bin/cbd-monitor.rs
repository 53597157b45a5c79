use std::time::Duration;

use structopt::StructOpt;

use cbd::monitor::Monitor;

#[derive(Debug, StructOpt)]
#[structopt(name = "cbd-monitor", about = "Monitoring CLI for the cbd build cluster")]
struct Opt {
    /// Address of the coordinator; auto-discovery when omitted
    #[structopt(long, env = "CBD_SERVER")]
    server: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();
    let opt = Opt::from_args();

    let monitor = Monitor::new(opt.server);
    loop {
        match monitor.basic_report().await {
            Ok(()) => break,
            Err(e) => {
                eprintln!("Can't report: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
