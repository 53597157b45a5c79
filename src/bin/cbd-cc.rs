//! Compiler stand-in: `cbd-cc gcc -c main.c -o main.o` behaves like the
//! wrapped compiler but farms distributable jobs out to the cluster.

use std::io::Write;
use std::process::exit;

use structopt::clap::AppSettings;
use structopt::StructOpt;

use cbd::client::{client_build_job, setup_client_logging};
use cbd::compile::{make_compile_job, parse_args, run_cmd};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "cbd-cc",
    about = "Distributed compiler wrapper",
    setting = AppSettings::TrailingVarArg,
    setting = AppSettings::AllowLeadingHyphen
)]
struct Opt {
    /// The compiler to wrap
    compiler: String,
    /// Arguments passed through to the compiler
    args: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    setup_client_logging();
    let opt = Opt::from_args();

    match run(opt).await {
        Ok(code) => exit(code),
        Err(e) => {
            log::error!("Build error: {}", e);
            eprintln!("cbd-cc: {}", e);
            exit(1);
        }
    }
}

async fn run(opt: Opt) -> cbd::Result<i32> {
    let build = parse_args(opt.args.clone());
    log::debug!("args: {:?}", opt.args);
    log::debug!("  distribute?: {}", build.distributable);
    log::debug!("  output path: {:?}", build.output());
    log::debug!("  input path:  {:?}", build.input());

    if !build.distributable {
        let result = run_cmd(&opt.compiler, &opt.args).await?;
        std::io::stdout().write_all(&result.output)?;
        return Ok(result.ret);
    }

    let output_path = match build.output() {
        Some(path) => path.to_string(),
        None => {
            return Err(cbd::Error::GenericError(
                "compile command has no output path".into(),
            ))
        }
    };

    // Pre-process locally into a self-contained job
    let job = match make_compile_job(&opt.compiler, build).await {
        Ok(job) => job,
        Err(cbd::Error::CompilerFailed(result)) => {
            std::io::stdout().write_all(&result.output)?;
            return Ok(result.ret);
        }
        Err(e) => return Err(e),
    };

    let result = client_build_job(job).await?;
    if result.exec.ret != 0 {
        std::io::stdout().write_all(&result.exec.output)?;
        return Ok(result.exec.ret);
    }

    tokio::fs::write(&output_path, &result.object_code).await?;
    log::debug!("Build success");
    Ok(0)
}
