//! Status manager: the single serialisation point for mapping updates.
//!
//! Consumes `UpdateEvent`s from a bounded queue, deduplicates them against
//! the in-memory table, rewrites the status file on change and fires the
//! optional hook command.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cancelled;
use crate::error::{NatterError, Result};
use crate::Protocol;

/// Queue capacity; bursts during reconvergence beyond this are dropped by
/// the producer, which re-observes the mapping on its next poll.
const QUEUE_CAPACITY: usize = 100;

/// A single mapping change. Enqueued only when `outer` differs from the
/// last value published for `inner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEvent {
    pub protocol: Protocol,
    pub inner: String,
    pub outer: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct StatusRecord {
    inner: String,
    outer: String,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
struct StatusDocument {
    tcp: Vec<StatusRecord>,
    udp: Vec<StatusRecord>,
}

pub struct StatusManager {
    tx: mpsc::Sender<UpdateEvent>,
    rx: mpsc::Receiver<UpdateEvent>,
    hook: Option<String>,
    file: File,
    // BTreeMap keeps serialisation order deterministic, so rewriting an
    // unchanged table produces a byte-identical document.
    tcp: BTreeMap<String, String>,
    udp: BTreeMap<String, String>,
}

impl StatusManager {
    /// Open (create + truncate) the status file. Failure here is fatal at
    /// startup. An empty `hook` disables hook execution.
    pub fn new(status_file: impl AsRef<Path>, hook: &str) -> Result<Self> {
        let path = status_file.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                NatterError::Config(format!("cannot open status file {:?}: {}", path, e))
            })?;
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Ok(Self {
            tx,
            rx,
            hook: Some(hook.to_string()).filter(|h| !h.is_empty()),
            file,
            tcp: BTreeMap::new(),
            udp: BTreeMap::new(),
        })
    }

    /// Producer handle. Producers should `try_send` and may drop on a full
    /// queue.
    pub fn sender(&self) -> mpsc::Sender<UpdateEvent> {
        self.tx.clone()
    }

    /// Consume updates until shutdown.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        info!("status manager started");
        loop {
            tokio::select! {
                _ = cancelled(&mut cancel) => break,
                ev = self.rx.recv() => match ev {
                    Some(ev) => self.handle(ev),
                    None => break,
                }
            }
        }
        info!("status manager exiting");
    }

    fn handle(&mut self, ev: UpdateEvent) {
        let table = match ev.protocol {
            Protocol::Tcp => &mut self.tcp,
            Protocol::Udp => &mut self.udp,
        };
        if table.get(&ev.inner) == Some(&ev.outer) {
            return;
        }
        table.insert(ev.inner.clone(), ev.outer.clone());
        info!(
            protocol = %ev.protocol,
            inner = %ev.inner,
            outer = %ev.outer,
            "mapping updated"
        );

        if let Err(e) = self.write_file() {
            warn!(error = %e, "failed to write status file");
        }

        if let Some(hook) = &self.hook {
            let cmd = expand_hook(hook, &ev);
            debug!(cmd = %cmd, "executing hook");
            spawn_hook(&cmd);
        }
    }

    /// Truncate and rewrite the whole document in one encode pass. Readers
    /// may observe an empty file in a narrow window but never a
    /// mixed-generation document.
    fn write_file(&mut self) -> std::io::Result<()> {
        let doc = self.document();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        serde_json::to_writer_pretty(&mut self.file, &doc)
            .map_err(std::io::Error::from)?;
        self.file.write_all(b"\n")?;
        self.file.flush()
    }

    fn document(&self) -> StatusDocument {
        let records = |table: &BTreeMap<String, String>| -> Vec<StatusRecord> {
            table
                .iter()
                .map(|(inner, outer)| StatusRecord {
                    inner: inner.clone(),
                    outer: outer.clone(),
                })
                .collect()
        };
        StatusDocument {
            tcp: records(&self.tcp),
            udp: records(&self.udp),
        }
    }
}

/// Substitute the `{inner}`, `{outer}` and `{protocol}` placeholders.
/// Pure: the same template and event always yield the same command.
pub fn expand_hook(template: &str, ev: &UpdateEvent) -> String {
    template
        .replace("{inner}", &ev.inner)
        .replace("{outer}", &ev.outer)
        .replace("{protocol}", ev.protocol.as_str())
}

/// Fire-and-forget under the platform shell. The exit code is not awaited
/// and spawn errors are ignored.
fn spawn_hook(cmd: &str) {
    #[cfg(unix)]
    let _ = tokio::process::Command::new("sh").args(["-c", cmd]).spawn();
    #[cfg(windows)]
    let _ = tokio::process::Command::new("cmd").args(["/C", cmd]).spawn();
}
