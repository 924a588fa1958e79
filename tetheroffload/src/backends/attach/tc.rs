// TC classifier attachment through aya

use anyhow::{Context, Result, anyhow};
use aya::Ebpf;
use aya::programs::tc::{self, SchedClassifier, SchedClassifierLinkId, TcAttachType};
use std::collections::HashMap;
use std::path::Path;

use super::{ProgramAttacher, StreamDirection};

pub struct TcAttacher {
    bpf: Ebpf,
    upstream_program: String,
    downstream_program: String,
    // iface -> (program name, link)
    links: HashMap<String, (String, SchedClassifierLinkId)>,
}

impl TcAttacher {
    /// Load the object file and both classifier programs
    pub fn new(object: &Path, upstream_program: &str, downstream_program: &str) -> Result<Self> {
        let mut bpf = Ebpf::load_file(object)
            .with_context(|| format!("failed to load eBPF object {:?}", object))?;

        for name in [upstream_program, downstream_program] {
            let program: &mut SchedClassifier = bpf
                .program_mut(name)
                .with_context(|| format!("program {name} not found"))?
                .try_into()
                .with_context(|| format!("program {name} is not a tc classifier"))?;
            program
                .load()
                .with_context(|| format!("failed to load program {name}"))?;
            log::debug!("Loaded tc program {}", name);
        }

        Ok(Self {
            bpf,
            upstream_program: upstream_program.to_string(),
            downstream_program: downstream_program.to_string(),
            links: HashMap::new(),
        })
    }

    fn program_mut(&mut self, name: &str) -> Result<&mut SchedClassifier> {
        self.bpf
            .program_mut(name)
            .with_context(|| format!("program {name} not found"))?
            .try_into()
            .with_context(|| format!("program {name} is not a tc classifier"))
    }
}

impl ProgramAttacher for TcAttacher {
    fn attach(&mut self, iface: &str, direction: StreamDirection) -> Result<()> {
        if self.links.contains_key(iface) {
            return Err(anyhow!("{} already has a forwarding program", iface));
        }

        // Fails when the qdisc already exists, which is fine
        if let Err(e) = tc::qdisc_add_clsact(iface) {
            log::debug!("clsact qdisc on {}: {}", iface, e);
        }

        let name = match direction {
            StreamDirection::Upstream => self.upstream_program.clone(),
            StreamDirection::Downstream => self.downstream_program.clone(),
        };
        let link = self
            .program_mut(&name)?
            .attach(iface, TcAttachType::Ingress)
            .with_context(|| format!("failed to attach {name} on {iface}"))?;

        log::info!("Attached {} program to {}", direction, iface);
        self.links.insert(iface.to_string(), (name, link));
        Ok(())
    }

    fn detach(&mut self, iface: &str) -> Result<()> {
        let (name, link) = self
            .links
            .remove(iface)
            .ok_or_else(|| anyhow!("{} has no forwarding program", iface))?;

        self.program_mut(&name)?
            .detach(link)
            .with_context(|| format!("failed to detach {name} from {iface}"))?;

        log::info!("Detached {} from {}", name, iface);
        Ok(())
    }
}
