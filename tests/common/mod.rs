// In-memory doubles for the remote store and the subprocess runner

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use drivekeep::error::BackupError;
use drivekeep::process::{CommandRunner, ExternalCommand, ProcessOutput};
use drivekeep::storage::{NameFilter, RemoteObject, StorageProvider};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub fn remote(id: &str, name: &str, created: DateTime<Utc>) -> RemoteObject {
    RemoteObject {
        id: id.to_string(),
        name: name.to_string(),
        created_time: created,
        mime_type: None,
        owners: Vec::new(),
        size: None,
    }
}

pub fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap()
}

/// Files that are left in `dir`, sorted by name.
pub fn leftovers(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

pub struct FakeStore {
    backup_dir: PathBuf,
    objects: Mutex<Vec<RemoteObject>>,
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_upload: bool,
    pub undeletable: HashSet<String>,
}

impl FakeStore {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            objects: Mutex::new(Vec::new()),
            bodies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_upload: false,
            undeletable: HashSet::new(),
        }
    }

    pub fn seed(&self, object: RemoteObject, body: &[u8]) {
        self.bodies
            .lock()
            .unwrap()
            .insert(object.id.clone(), body.to_vec());
        self.objects.lock().unwrap().push(object);
    }

    pub fn objects(&self) -> Vec<RemoteObject> {
        self.objects.lock().unwrap().clone()
    }

    pub fn body(&self, id: &str) -> Option<Vec<u8>> {
        self.bodies.lock().unwrap().get(id).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl StorageProvider for FakeStore {
    async fn get(&self, id: &str, _include_shared_drives: bool) -> Result<RemoteObject> {
        match self.objects().into_iter().find(|o| o.id == id) {
            Some(object) => Ok(object),
            None => bail!("unknown id {}", id),
        }
    }

    async fn search(
        &self,
        filter: &NameFilter,
        _include_shared_drives: bool,
    ) -> Result<Vec<RemoteObject>> {
        Ok(self
            .objects()
            .into_iter()
            .filter(|o| filter.matches(&o.name))
            .collect())
    }

    async fn list(&self, page_size: u32) -> Result<Vec<RemoteObject>> {
        Ok(self
            .objects()
            .into_iter()
            .take(page_size as usize)
            .collect())
    }

    async fn upload(&self, local_path: &Path, _parent_id: Option<&str>) -> Result<RemoteObject> {
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.record(format!("upload:{}", name));
        if self.fail_upload {
            bail!("upload rejected");
        }
        let body = fs::read(local_path)?;
        let id = format!("id-{}", self.objects.lock().unwrap().len() + 1);
        let object = RemoteObject {
            size: Some(body.len() as u64),
            ..remote(&id, &name, Utc::now())
        };
        self.seed(object.clone(), &body);
        Ok(object)
    }

    async fn fetch(&self, id: &str, dest: &Path) -> Result<bool> {
        self.record(format!("fetch:{}", id));
        match self.body(id) {
            Some(body) => {
                fs::write(dest, body)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.record(format!("delete:{}", id));
        if self.undeletable.contains(id) {
            return Ok(false);
        }
        self.objects.lock().unwrap().retain(|o| o.id != id);
        Ok(true)
    }

    fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }
}

/// Pretends to be gpg / pg_dump / pg_restore by copying bytes around.
#[derive(Default)]
pub struct FakeRunner {
    pub commands: Mutex<Vec<ExternalCommand>>,
    pub failing: HashSet<String>,
}

impl FakeRunner {
    pub fn failing(program: &str) -> Self {
        Self {
            failing: [program.to_string()].into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn commands(&self) -> Vec<ExternalCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.commands().into_iter().map(|c| c.program).collect()
    }
}

fn ok() -> ProcessOutput {
    ProcessOutput {
        code: Some(0),
        ..Default::default()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, command: &ExternalCommand) -> Result<ProcessOutput, BackupError> {
        self.commands.lock().unwrap().push(command.clone());
        if self.failing.contains(&command.program) {
            return Ok(ProcessOutput {
                code: Some(2),
                stdout: Vec::new(),
                stderr: b"simulated failure".to_vec(),
            });
        }

        match command.program.as_str() {
            "pg_dump" => {
                if let Some(out) = command.value_of("--file") {
                    fs::write(out, b"PGDMP fake dump").ok();
                }
            }
            "gpg" => {
                let input = command.args.last().cloned().unwrap_or_default();
                if let Some(out) = command.value_of("--output") {
                    let body = fs::read(&input).unwrap_or_default();
                    fs::write(out, body).ok();
                }
            }
            _ => {}
        }
        Ok(ok())
    }
}
