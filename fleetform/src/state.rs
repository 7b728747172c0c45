//! The state file: an append-only log of JSON patches (RFC 6902).
//!
//! Replaying the log yields a document that maps resource names to what
//! fleetform last observed of them. It is a record, not a source of truth:
//! every command reads the remote before acting on a resource.

use anyhow::{bail, Context as _, Result};
use chrono::Utc;
use fleetform_core::{ObservedState, Properties, ResourceIdentifier};
use serde::{Deserialize, Serialize};
use serde_json::{json, Deserializer, Value};
use std::{
    fs::{File, OpenOptions},
    io::{self, Read as _, Seek as _, Write as _},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tracing::{debug, info};

pub const STATE_TYPE: &str = "fleetformState";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEvent {
    pub index: u64,
    pub meta: StateEventMeta,
    pub patch: json_patch::Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEventMeta {
    /// RFC 3339
    pub time: String,
    /// The command that made the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// The last observation of a managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    #[serde(rename = "type")]
    pub type_name: String,
    pub id: ResourceIdentifier,
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl ResourceRecord {
    pub fn new(type_name: &str, id: &ResourceIdentifier, observed: &ObservedState) -> Self {
        ResourceRecord {
            type_name: type_name.to_string(),
            id: id.clone(),
            properties: observed.properties.clone(),
            etag: observed.etag.clone(),
        }
    }
}

/// Parse a state log. Indices must count up from 0.
pub fn read_events(reader: impl io::Read) -> Result<Vec<StateEvent>> {
    let mut events = Vec::new();
    for event in Deserializer::from_reader(reader).into_iter::<StateEvent>() {
        let event = event.with_context(|| {
            format!("State file invalid: error parsing state event {}", events.len())
        })?;
        if event.index != events.len() as u64 {
            bail!(
                "State file invalid: expected state event with index {}, got {}",
                events.len(),
                event.index
            );
        }
        events.push(event);
    }
    if events.is_empty() {
        bail!("State file invalid: no initial state event");
    }
    Ok(events)
}

pub fn apply_state_events<'a>(
    state: &mut Value,
    events: impl IntoIterator<Item = &'a StateEvent>,
) -> Result<()> {
    for event in events {
        json_patch::patch(state, &event.patch.0)
            .with_context(|| format!("State file invalid: cannot apply event {}", event.index))?;
    }
    Ok(())
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn init_event() -> StateEvent {
    StateEvent {
        index: 0,
        meta: StateEventMeta {
            time: now(),
            command: None,
        },
        patch: json_patch::Patch(vec![json_patch::PatchOperation::Add(
            json_patch::AddOperation {
                path: "".parse().expect("empty path"),
                value: json!({
                    "_type": STATE_TYPE,
                    "resources": {},
                }),
            },
        )]),
    }
}

const LOCK_WAIT_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Take the write lock, telling the user when someone else holds it.
fn lock_write<'a>(
    path: &Path,
    lock: &'a mut fd_lock::RwLock<File>,
) -> Result<fd_lock::RwLockWriteGuard<'a, File>> {
    let start = Instant::now();
    let mut next_log = start;
    loop {
        match lock.try_write() {
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= next_log {
                    info!(
                        path = %path.display(),
                        waited_s = start.elapsed().as_secs(),
                        "Waiting for state file write lock"
                    );
                    next_log += LOCK_WAIT_LOG_INTERVAL;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Could not lock {}", path.display()))
            }
        }
    }
    lock.write()
        .with_context(|| format!("Could not lock {}", path.display()))
}

/// An open state file and the document it describes.
pub struct StateFile {
    path: PathBuf,
    lock: fd_lock::RwLock<File>,
    document: Value,
    next_index: u64,
    /// Where our last write ended. Anything beyond was written by someone else.
    expected_size: u64,
}

impl StateFile {
    /// Open the state file at `path`, creating it if it does not exist.
    pub fn open(path: &Path) -> Result<StateFile> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("Could not open state file {}", path.display()))?;
        let mut lock = fd_lock::RwLock::new(file);

        let mut text = String::new();
        {
            let guard = lock
                .read()
                .with_context(|| format!("Could not lock {}", path.display()))?;
            let mut file: &File = &guard;
            file.read_to_string(&mut text)
                .with_context(|| format!("Could not read state file {}", path.display()))?;
        }

        let mut state = StateFile {
            path: path.to_path_buf(),
            lock,
            document: Value::Null,
            next_index: 0,
            expected_size: text.len() as u64,
        };

        if text.trim().is_empty() {
            debug!(path = %path.display(), "creating state file");
            state.expected_size = 0;
            let event = init_event();
            state.write_event(&event)?;
            apply_state_events(&mut state.document, [&event])?;
            state.next_index = 1;
        } else {
            let events = read_events(text.as_bytes())
                .with_context(|| format!("Could not load state file {}", path.display()))?;
            apply_state_events(&mut state.document, &events)?;
            state.next_index = events.len() as u64;
        }

        match state.document.get("_type").and_then(Value::as_str) {
            Some(STATE_TYPE) => {}
            other => bail!(
                "State file {} has unexpected _type: expected '{}', got {:?}",
                path.display(),
                STATE_TYPE,
                other
            ),
        }
        Ok(state)
    }

    pub fn resource(&self, name: &str) -> Option<ResourceRecord> {
        let record = self.document.get("resources")?.get(name)?;
        serde_json::from_value(record.clone()).ok()
    }

    pub fn resource_names(&self) -> Vec<String> {
        match self.document.get("resources") {
            Some(Value::Object(resources)) => resources.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Record the observation of resource `name`.
    pub fn record(&mut self, command: &str, name: &str, record: &ResourceRecord) -> Result<()> {
        let mut next = self.document.clone();
        let value = serde_json::to_value(record)?;
        match next.get_mut("resources") {
            Some(Value::Object(resources)) => {
                resources.insert(name.to_string(), value);
            }
            _ => bail!("State file {} has no resources", self.path.display()),
        }
        self.commit(command, next)
    }

    /// Record that resource `name` no longer exists.
    pub fn forget(&mut self, command: &str, name: &str) -> Result<()> {
        let mut next = self.document.clone();
        if let Some(Value::Object(resources)) = next.get_mut("resources") {
            resources.remove(name);
        }
        self.commit(command, next)
    }

    fn commit(&mut self, command: &str, next: Value) -> Result<()> {
        let patch = json_patch::diff(&self.document, &next);
        if patch.0.is_empty() {
            return Ok(());
        }
        let event = StateEvent {
            index: self.next_index,
            meta: StateEventMeta {
                time: now(),
                command: Some(command.to_string()),
            },
            patch,
        };
        self.write_event(&event)?;
        self.next_index += 1;
        self.document = next;
        Ok(())
    }

    fn write_event(&mut self, event: &StateEvent) -> Result<()> {
        let mut guard = lock_write(&self.path, &mut self.lock)?;
        let end = guard.seek(io::SeekFrom::End(0))?;
        if end != self.expected_size {
            bail!(
                "State file {} was modified by another process (foreign bytes [{}..{})); not writing event {}",
                self.path.display(),
                self.expected_size,
                end,
                event.index
            );
        }
        {
            let mut writer = io::BufWriter::new(&mut *guard);
            // Pretty, for the humans who end up reading state files.
            serde_json::to_writer_pretty(&mut writer, event)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        self.expected_size = guard.stream_position()?;
        Ok(())
    }
}
