//! Package and service control, delegated to the host system.

use crate::error::{AppError, AppResult};
use std::process::Command;
use tracing::{debug, info};

pub trait ProcessControl: Send + Sync {
    fn install_packages(&self, names: &[String]) -> AppResult<()>;
    fn start_or_restart_service(&self, name: &str) -> AppResult<()>;
    fn stop_service(&self, name: &str) -> AppResult<()>;
    fn expose_port(&self, port: u16) -> AppResult<()>;
}

/// Shells out to `apt-get`, `service` and `open-port`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessControl;

/// Run `program` to completion and return its standard output.
///
/// Arguments stay out of logs and errors; callers pass secrets here.
pub(crate) fn output(program: &str, args: &[&str]) -> AppResult<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| AppError::process(format!("{program}: {e}")))?;
    if !output.status.success() {
        return Err(AppError::process(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn run(program: &str, args: &[&str]) -> AppResult<()> {
    debug!("Running {} {}", program, args.join(" "));
    output(program, args).map(|_| ())
}

impl ProcessControl for SystemProcessControl {
    fn install_packages(&self, names: &[String]) -> AppResult<()> {
        if names.is_empty() {
            return Ok(());
        }
        info!("Installing packages: {}", names.join(", "));
        let mut args = vec!["install", "-y", "--no-install-recommends"];
        args.extend(names.iter().map(String::as_str));
        run("apt-get", &args)
    }

    fn start_or_restart_service(&self, name: &str) -> AppResult<()> {
        info!("Starting/restarting {}", name);
        run("service", &[name, "restart"])
    }

    fn stop_service(&self, name: &str) -> AppResult<()> {
        info!("Stopping {}", name);
        run("service", &[name, "stop"])
    }

    fn expose_port(&self, port: u16) -> AppResult<()> {
        let spec = format!("{port}/tcp");
        run("open-port", &[spec.as_str()])
    }
}
