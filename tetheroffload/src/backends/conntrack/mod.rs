// Connection tracking event monitor

use anyhow::{Context, Result, anyhow};
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::thread;

/// Source of connection tracking events, running only while started
pub trait ConntrackMonitor: Send {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);
}

/// Runs `conntrack -E` and forwards its event lines to the log
pub struct CommandConntrackMonitor {
    command: String,
    child: Option<Child>,
}

impl CommandConntrackMonitor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            child: None,
        }
    }
}

impl ConntrackMonitor for CommandConntrackMonitor {
    fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(anyhow!("conntrack monitor already running"));
        }

        let mut child = Command::new(&self.command)
            .args(["-E", "-f", "ipv4", "-e", "NEW,UPDATE,DESTROY"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.command))?;

        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    match line {
                        Ok(line) => log::trace!("conntrack: {}", line),
                        Err(e) => {
                            log::debug!("conntrack stream closed: {}", e);
                            break;
                        }
                    }
                }
            });
        }

        log::info!("Started conntrack monitor (pid {})", child.id());
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = child.kill() {
            log::warn!("Failed to stop conntrack monitor: {}", e);
        }
        match child.wait() {
            Ok(status) => log::info!("Stopped conntrack monitor ({})", status),
            Err(e) => log::warn!("Failed to reap conntrack monitor: {}", e),
        }
    }
}

impl Drop for CommandConntrackMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
