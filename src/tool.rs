//! Running an external tool as `java <jvmargs> -jar <tool> <args>`.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ToolError;
use crate::utils::{as_overhead, ensure_parent};

#[derive(Debug, Clone)]
pub struct ExternalTool {
    pub java: Utf8PathBuf,
    pub jar: Utf8PathBuf,
    pub jvmargs: Vec<String>,
    pub args: Vec<String>,
    /// Working directory of the process.
    pub workdir: Utf8PathBuf,
    /// Receives everything the process prints.
    pub log: Utf8PathBuf,
}

impl ExternalTool {
    fn name(&self) -> &str {
        self.jar.file_name().unwrap_or(self.jar.as_str())
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.java);
        command
            .args(&self.jvmargs)
            .arg("-jar")
            .arg(&self.jar)
            .args(&self.args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    /// Runs the tool to completion. Output lines go both to the log file and
    /// to `tracing` under the `patchline::tool` target. A non-zero exit is an
    /// error.
    pub fn run(&self) -> Result<(), ToolError> {
        let s = Instant::now();

        ensure_parent(&self.log)?;
        std::fs::create_dir_all(&self.workdir)?;

        let log = Mutex::new(BufWriter::new(File::create(&self.log)?));
        {
            let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);
            writeln!(log, "Java: {}", self.java)?;
            writeln!(log, "JVM Args: {}", self.jvmargs.join(" "))?;
            writeln!(log, "Run Args: {}", self.args.join(" "))?;
            writeln!(log, "Jar: {}", self.jar)?;
            writeln!(log)?;
        }

        tracing::info!("running {}", self.name());
        tracing::debug!("{} {}", self.name(), self.args.join(" "));

        let mut child = self.command().spawn().map_err(|source| ToolError::Spawn {
            program: self.java.to_string(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let tee = thread::scope(|s| {
            let out = stdout.map(|pipe| s.spawn(|| tee(pipe, &log)));
            let err = stderr.map(|pipe| s.spawn(|| tee(pipe, &log)));

            [out, err]
                .into_iter()
                .flatten()
                .map(|handle| handle.join().unwrap_or(Ok(())))
                .collect::<std::io::Result<Vec<_>>>()
        });

        let status = child.wait()?;
        tee?;

        log.into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;

        if !status.success() {
            let status = match status.code() {
                Some(code) => format!("exit code {code}"),
                None => String::from("a signal"),
            };

            return Err(ToolError::Exit {
                tool: self.name().to_string(),
                status,
                log: self.log.clone(),
            });
        }

        tracing::info!("finished {} {}", self.name(), as_overhead(s));
        Ok(())
    }

    /// Runs the tool and checks that it produced `output`.
    pub fn run_for(&self, output: &Utf8Path) -> Result<(), ToolError> {
        self.run()?;

        if !output.exists() {
            return Err(ToolError::MissingOutput {
                tool: self.name().to_string(),
                output: output.to_path_buf(),
            });
        }

        Ok(())
    }
}

fn tee(pipe: impl Read, log: &Mutex<BufWriter<File>>) -> std::io::Result<()> {
    for line in BufReader::new(pipe).lines() {
        let line = line?;
        tracing::info!(target: "patchline::tool", "{line}");

        let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(log, "{line}")?;
    }

    Ok(())
}
