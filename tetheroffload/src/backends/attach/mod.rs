// Forwarding program attachment to network interfaces

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::Config;

#[cfg(feature = "offload-ebpf")]
pub mod tc;

/// Which forwarding program an interface gets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamDirection {
    /// Traffic from tethered clients towards the upstream
    Upstream,
    /// Traffic from the upstream towards tethered clients
    Downstream,
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamDirection::Upstream => write!(f, "upstream"),
            StreamDirection::Downstream => write!(f, "downstream"),
        }
    }
}

/// Attaches and detaches the forwarding programs
pub trait ProgramAttacher: Send {
    fn attach(&mut self, iface: &str, direction: StreamDirection) -> Result<()>;

    fn detach(&mut self, iface: &str) -> Result<()>;
}

/// Build the attacher named by the configuration, `None` when attachment is unavailable
pub fn create_attacher(config: &Config) -> Option<Box<dyn ProgramAttacher>> {
    let Some(object) = config.program_object.as_deref() else {
        log::info!("No program object configured, interface attachment disabled");
        return None;
    };

    #[cfg(feature = "offload-ebpf")]
    {
        match tc::TcAttacher::new(object, &config.upstream_program, &config.downstream_program) {
            Ok(attacher) => Some(Box::new(attacher)),
            Err(e) => {
                log::error!("❌ Failed to load forwarding programs: {:#}", e);
                None
            }
        }
    }

    #[cfg(not(feature = "offload-ebpf"))]
    {
        log::warn!(
            "Program object {:?} configured but eBPF support is not compiled in",
            object
        );
        None
    }
}
