//! Compiler collaborators: command-line parsing, local pre-processing and
//! the actual compiler invocation used by workers and the local fallback.

use std::path::{Path, PathBuf};

use tempfile::TempPath;

use crate::machine::hostname_string;
use crate::protocol::messages::{Build, CompileJob, CompileResult, ExecResult};

impl Build {
    /// The output path of the build job, when the command line has one.
    pub fn output(&self) -> Option<&str> {
        self.oindex
            .and_then(|idx| self.args.get(idx))
            .map(String::as_str)
    }

    /// The input path of the build job, when the command line has one.
    pub fn input(&self) -> Option<&str> {
        self.iindex
            .and_then(|idx| self.args.get(idx))
            .map(String::as_str)
    }
}

/// Takes the compiler arguments without the compiler command itself, so
/// "gcc -c main.c -o main.o" comes in as {"-c", "main.c", "-o", "main.o"}.
/// Only "-c" jobs can be distributed; linking stays local.
pub fn parse_args(args: Vec<String>) -> Build {
    let mut distributable = false;
    let mut oindex = None;
    let mut iindex = None;
    let mut cindex = None;

    for (i, arg) in args.iter().enumerate() {
        if arg == "-c" {
            distributable = true;
            cindex = Some(i);
        }
        if arg == "-o" {
            oindex = Some(i + 1);
        } else if !arg.starts_with('-') && oindex != Some(i) {
            // Any non-flag argument that is not the -o target is the input
            iindex = Some(i);
        }
    }

    Build {
        args,
        oindex,
        iindex,
        cindex,
        distributable,
    }
}

/// Executes the program, capturing interleaved output and the return code
/// (-1 when the program was killed by a signal).
pub async fn run_cmd(prog: &str, args: &[String]) -> crate::Result<ExecResult> {
    let output = tokio::process::Command::new(prog)
        .args(args)
        .output()
        .await?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);

    Ok(ExecResult {
        output: combined,
        ret: output.status.code().unwrap_or(-1),
    })
}

/// Pre-processes the input into a temporary file, turning the "-c" into a
/// "-E". The returned path is removed when dropped.
pub async fn preprocess(compiler: &str, build: &Build) -> crate::Result<(TempPath, ExecResult)> {
    let oindex = index_or_err(build.oindex, "output")?;
    let cindex = index_or_err(build.cindex, "compile flag")?;

    let temp = make_temp_file("cbd-pre-", &extension_of(build.input()))?;

    let mut args = build.args.clone();
    args[oindex] = temp.to_string_lossy().into_owned();
    args[cindex] = "-E".to_string();

    let result = run_cmd(compiler, &args).await?;
    Ok((temp, result))
}

/// Compiles `input`, redirecting the object code to a temporary file. The
/// returned path is removed when dropped.
pub async fn compile_file(
    compiler: &str,
    build: &Build,
    input: &Path,
) -> crate::Result<(TempPath, ExecResult)> {
    let oindex = index_or_err(build.oindex, "output")?;
    let iindex = index_or_err(build.iindex, "input")?;

    let temp = make_temp_file("cbd-comp-", &extension_of(build.output()))?;

    let mut args = build.args.clone();
    args[oindex] = temp.to_string_lossy().into_owned();
    args[iindex] = input.to_string_lossy().into_owned();

    let result = run_cmd(compiler, &args).await?;
    Ok((temp, result))
}

/// Pre-processes the requested build into a self-contained [`CompileJob`]
/// that any worker can execute without access to our headers.
pub async fn make_compile_job(compiler: &str, build: Build) -> crate::Result<CompileJob> {
    let host = hostname_string()?;

    let (pre_path, result) = preprocess(compiler, &build).await?;
    if result.ret != 0 {
        return Err(crate::Error::CompilerFailed(result));
    }

    let input = tokio::fs::read(&pre_path).await?;

    Ok(CompileJob {
        host,
        build,
        input,
        compiler: compiler.to_string(),
    })
}

impl CompileJob {
    /// Returns an error if there is something wrong with the build job.
    pub fn validate(&self) -> crate::Result<()> {
        if self.input.is_empty() {
            return Err(crate::Error::GenericError("input is length 0".into()));
        }
        if self.compiler.is_empty() {
            return Err(crate::Error::GenericError("no compiler provided".into()));
        }
        if self.build.args.is_empty() {
            return Err(crate::Error::GenericError(
                "build has no command line arguments".into(),
            ));
        }
        for (index, name) in [
            (self.build.oindex, "oindex"),
            (self.build.iindex, "iindex"),
            (self.build.cindex, "cindex"),
        ] {
            if let Some(idx) = index {
                if idx >= self.build.args.len() {
                    return Err(crate::Error::GenericError(format!(
                        "build {} out of range",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Compiles the job with temporary files. Compiler failures come back
    /// as a result with a non-zero return code and empty object code, so
    /// they can travel back to the requesting client.
    pub async fn compile(&self) -> crate::Result<CompileResult> {
        let input = make_temp_file("cbd-input-", &extension_of(self.build.input()))?;
        tokio::fs::write(&input, &self.input).await?;

        let (output_path, exec) = compile_file(&self.compiler, &self.build, &input).await?;

        let object_code = if exec.ret == 0 {
            tokio::fs::read(&output_path).await?
        } else {
            Vec::new()
        };

        Ok(CompileResult { exec, object_code })
    }
}

fn index_or_err(index: Option<usize>, what: &str) -> crate::Result<usize> {
    index.ok_or_else(|| crate::Error::GenericError(format!("build has no {} argument", what)))
}

fn extension_of(path: Option<&str>) -> String {
    path.map(Path::new)
        .and_then(Path::extension)
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

fn make_temp_file(prefix: &str, suffix: &str) -> crate::Result<TempPath> {
    let file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(temp_file_dir())?;
    Ok(file.into_temp_path())
}

/// Prefer the memory-backed directory when the platform has one.
fn temp_file_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}
