//! Container metadata read from the Docker runtime and data directories.
//!
//! Running containers are listed from `<runtime>/containerd`, their init process
//! comes from the runc state descriptor and their name from the Docker config
//! descriptor. The parent of the init process (usually the runtime shim) is
//! looked up in procfs.

use std::{
    fmt,
    fs::{self, File},
    io::{self, prelude::*, BufReader},
    path::{Path, PathBuf},
};

use nix::unistd::Pid;
use thiserror::Error;

use crate::procfs::{ProcFs, ProcfsError};

pub const DEFAULT_RUNTIME_ROOT: &str = "/run/docker";
pub const DEFAULT_DATA_ROOT: &str = "/data/docker";

/// Only this many bytes of the state descriptor are scanned for the init pid.
const STATE_PREFIX_LEN: u64 = 1024;
const INIT_PID_KEY: &str = "\"init_process_pid\":";
const NAME_KEY: &str = "\"Name\":";

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("invalid path {path}")]
    InvalidPath {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("reading file {path} failed")]
    ReadFailure {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("field {field} not found or malformed in {path}")]
    MissingField { path: String, field: &'static str },
    #[error(transparent)]
    Procfs(#[from] ProcfsError),
}

/// A running container, as seen from the host pid namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    /// Top-level process of the container.
    pub init_pid: Pid,
    /// Parent of `init_pid`, typically a runtime shim.
    pub parent_pid: Pid,
}

impl fmt::Display for ContainerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ id: {}, name: {}, init_pid: {}, parent_pid: {} }}",
            self.id, self.name, self.init_pid, self.parent_pid
        )
    }
}

#[derive(Debug, Clone)]
pub struct ContainerMetadataReader {
    runtime_root: PathBuf,
    data_root: PathBuf,
    procfs: ProcFs,
}

impl Default for ContainerMetadataReader {
    fn default() -> Self {
        Self::new(DEFAULT_RUNTIME_ROOT, DEFAULT_DATA_ROOT, ProcFs::default())
    }
}

impl ContainerMetadataReader {
    pub fn new(
        runtime_root: impl Into<PathBuf>,
        data_root: impl Into<PathBuf>,
        procfs: ProcFs,
    ) -> Self {
        Self {
            runtime_root: runtime_root.into(),
            data_root: data_root.into(),
            procfs,
        }
    }

    pub fn procfs(&self) -> &ProcFs {
        &self.procfs
    }

    /// Returns the ids of the running containers, one per directory in
    /// `<runtime>/containerd`.
    pub fn list_running_container_ids(&self) -> Result<Vec<String>, ContainerError> {
        let path = self.runtime_root.join("containerd");
        let entries = fs::read_dir(&path).map_err(|source| ContainerError::InvalidPath {
            source,
            path: path.display().to_string(),
        })?;

        let mut ids: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Returns the init process of a container, scanning the beginning of
    /// its runc state descriptor.
    pub fn read_init_pid(&self, id: &str) -> Result<Pid, ContainerError> {
        let path = self
            .runtime_root
            .join("runtime-runc/moby")
            .join(id)
            .join("state.json");
        let file = File::open(&path).map_err(|source| read_failure(source, &path))?;

        let mut prefix = Vec::with_capacity(STATE_PREFIX_LEN as usize);
        file.take(STATE_PREFIX_LEN)
            .read_to_end(&mut prefix)
            .map_err(|source| read_failure(source, &path))?;

        parse_init_pid(&String::from_utf8_lossy(&prefix)).ok_or_else(|| {
            ContainerError::MissingField {
                path: path.display().to_string(),
                field: "init_process_pid",
            }
        })
    }

    /// Returns the name of a container, streaming its config descriptor until
    /// the name field shows up. The leading `/` Docker puts in front of names
    /// is removed.
    pub fn read_name(&self, id: &str) -> Result<String, ContainerError> {
        let path = self
            .data_root
            .join("containers")
            .join(id)
            .join("config.v2.json");
        let file = File::open(&path).map_err(|source| read_failure(source, &path))?;

        let reader = BufReader::new(file);
        for line in reader.lines() {
            let line = line.map_err(|source| read_failure(source, &path))?;
            if let Some(name) = parse_name(&line) {
                return Ok(strip_separator(name).to_string());
            }
        }

        Err(ContainerError::MissingField {
            path: path.display().to_string(),
            field: "Name",
        })
    }

    /// Reads all the metadata of a single container. A missing name is not
    /// fatal: the record gets an empty one.
    pub fn read_one(&self, id: &str) -> Result<ContainerRecord, ContainerError> {
        let init_pid = self.read_init_pid(id)?;
        let parent_pid = self.procfs.parent_of(init_pid)?;
        let name = self.read_name(id).unwrap_or_else(|err| {
            crate::log_error(&format!("Reading name of container {id}"), err);
            String::new()
        });

        Ok(ContainerRecord {
            id: id.to_string(),
            name,
            init_pid,
            parent_pid,
        })
    }

    /// Reads all running containers. Containers which can't be read are
    /// logged and skipped, only a failure listing them is returned.
    pub fn read_all(&self) -> Result<Vec<ContainerRecord>, ContainerError> {
        let records = self
            .list_running_container_ids()?
            .into_iter()
            .filter_map(|id| match self.read_one(&id) {
                Ok(record) => Some(record),
                Err(err) => {
                    crate::log_error(&format!("Reading container {id}"), err);
                    None
                }
            })
            .collect();
        Ok(records)
    }
}

fn read_failure(source: io::Error, path: &Path) -> ContainerError {
    ContainerError::ReadFailure {
        source,
        path: path.display().to_string(),
    }
}

/// Extracts the numeric value following `"init_process_pid":`.
fn parse_init_pid(content: &str) -> Option<Pid> {
    let start = content.find(INIT_PID_KEY)? + INIT_PID_KEY.len();
    let value = content[start..].trim_start();
    let end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    value[..end].parse().ok().map(Pid::from_raw)
}

/// Extracts the quoted value following `"Name":`.
fn parse_name(line: &str) -> Option<&str> {
    let start = line.find(NAME_KEY)? + NAME_KEY.len();
    let rest = &line[start..];
    let rest = &rest[rest.find('"')? + 1..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Docker prefixes container names with a separator character.
fn strip_separator(name: &str) -> &str {
    let mut chars = name.chars();
    match chars.next() {
        Some(_) if !chars.as_str().is_empty() => chars.as_str(),
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        procfs::HOST_INIT_PID,
        test_utils::{FakeDocker, FakeProc},
    };

    const SHIM: Pid = Pid::from_raw(1000);
    const INIT: Pid = Pid::from_raw(1001);

    fn reader(docker: &FakeDocker, proc: &FakeProc) -> ContainerMetadataReader {
        ContainerMetadataReader::new(docker.runtime_root(), docker.data_root(), proc.procfs())
    }

    #[test]
    fn parse_init_pid_variants() {
        assert_eq!(
            parse_init_pid(r#"{"id":"x","init_process_pid":4242,"x":1}"#),
            Some(Pid::from_raw(4242))
        );
        assert_eq!(
            parse_init_pid("{\"init_process_pid\": \n\t77}"),
            Some(Pid::from_raw(77))
        );
        assert_eq!(parse_init_pid(r#"{"init_process_pid":"abc"}"#), None);
        assert_eq!(parse_init_pid(r#"{"id":"x"}"#), None);
    }

    #[test]
    fn parse_name_variants() {
        assert_eq!(parse_name(r#"{"ID":"x","Name":"/web","Driver":"overlay2"}"#), Some("/web"));
        assert_eq!(parse_name(r#""Name": "/db""#), Some("/db"));
        assert_eq!(parse_name(r#"{"ID":"x"}"#), None);
        assert_eq!(parse_name(r#""Name":"unterminated"#), None);
    }

    #[test]
    fn separator_is_stripped_once() {
        assert_eq!(strip_separator("/web"), "web");
        assert_eq!(strip_separator("//web"), "/web");
        assert_eq!(strip_separator("/"), "/");
        assert_eq!(strip_separator(""), "");
    }

    #[test]
    fn list_running_containers() {
        let docker = FakeDocker::new();
        let proc = FakeProc::new();
        docker.container_dir("bbb");
        docker.container_dir("aaa");
        std::fs::write(docker.runtime_root().join("containerd/not-a-dir"), "").unwrap();

        let ids = reader(&docker, &proc).list_running_container_ids().unwrap();
        assert_eq!(ids, vec!["aaa", "bbb"]);
    }

    #[test]
    fn list_fails_on_invalid_runtime_root() {
        let proc = FakeProc::new();
        let reader = ContainerMetadataReader::new("/nonexistent/runtime", "/nonexistent/data", proc.procfs());
        assert!(matches!(
            reader.list_running_container_ids(),
            Err(ContainerError::InvalidPath { .. })
        ));
    }

    #[test]
    fn init_pid_beyond_prefix_is_not_found() {
        let docker = FakeDocker::new();
        let proc = FakeProc::new();
        let padding = "x".repeat(STATE_PREFIX_LEN as usize);
        docker.state("abc", &format!(r#"{{"pad":"{padding}","init_process_pid":12}}"#));
        assert!(matches!(
            reader(&docker, &proc).read_init_pid("abc"),
            Err(ContainerError::MissingField { field: "init_process_pid", .. })
        ));
    }

    #[test]
    fn name_is_found_on_a_later_line() {
        let docker = FakeDocker::new();
        let proc = FakeProc::new();
        docker.config("abc", "{\n  \"ID\": \"abc\",\n  \"Name\": \"/api\",\n  \"Driver\": \"overlay2\"\n}\n");
        assert_eq!(reader(&docker, &proc).read_name("abc").unwrap(), "api");
    }

    #[test]
    fn read_one_container() {
        let docker = FakeDocker::new();
        let proc = FakeProc::new();
        docker.container("abc", INIT, "/web");
        proc.process(SHIM, HOST_INIT_PID);
        proc.process(INIT, SHIM);

        let record = reader(&docker, &proc).read_one("abc").unwrap();
        assert_eq!(
            record,
            ContainerRecord {
                id: "abc".to_string(),
                name: "web".to_string(),
                init_pid: INIT,
                parent_pid: SHIM,
            }
        );
    }

    #[test]
    fn missing_name_does_not_abort_record() {
        let docker = FakeDocker::new();
        let proc = FakeProc::new();
        docker.container_dir("abc");
        docker.state("abc", &format!(r#"{{"init_process_pid":{INIT}}}"#));
        proc.process(INIT, SHIM);

        let record = reader(&docker, &proc).read_one("abc").unwrap();
        assert_eq!(record.name, "");
        assert_eq!(record.parent_pid, SHIM);
    }

    #[test]
    fn read_all_skips_broken_containers() {
        let docker = FakeDocker::new();
        let proc = FakeProc::new();
        docker.container("good", INIT, "/web");
        proc.process(INIT, SHIM);
        // state descriptor without init pid
        docker.container_dir("no-state");
        docker.state("no-state", r#"{"id":"no-state"}"#);
        // init process already gone
        docker.container("exited", Pid::from_raw(5000), "/gone");

        let records = reader(&docker, &proc).read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "good");
    }
}
