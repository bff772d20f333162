use eyre::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::{config::Host, run::RunCommand};

/// Splits `items` into exactly `parts` contiguous chunks.
///
/// Chunk `i` ends at the floor of a cursor advanced `i + 1` times by
/// `len / parts`, computed in integers so the boundaries are exact. The last
/// chunk always ends at `len`. Chunks are empty when there are fewer items
/// than parts.
pub fn chunk<T: Clone>(items: &[T], parts: usize) -> Result<Vec<Vec<T>>> {
    if parts == 0 {
        bail!("Cannot split {} items into zero chunks", items.len());
    }

    let len = items.len();
    let mut chunks = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 1..=parts {
        let end = i * len / parts;
        chunks.push(items[start..end].to_vec());
        start = end;
    }
    Ok(chunks)
}

/// The commands each host runs, in host order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostWorkAssignment {
    pub hosts: Vec<HostWork>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostWork {
    pub host: Host,
    pub commands: Vec<RunCommand>,
}

impl HostWorkAssignment {
    pub fn new(hosts: &[Host], commands: &[RunCommand]) -> Result<Self> {
        let chunks = chunk(commands, hosts.len())?;
        Ok(Self {
            hosts: hosts
                .iter()
                .cloned()
                .zip(chunks)
                .map(|(host, commands)| HostWork { host, commands })
                .collect(),
        })
    }

    pub fn total_commands(&self) -> usize {
        self.hosts.iter().map(|h| h.commands.len()).sum()
    }
}
