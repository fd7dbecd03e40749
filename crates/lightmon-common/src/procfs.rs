//! Utility functions used to extract data from procfs
//!
//! Every lookup goes through a [`ProcFs`] handle, which knows where procfs is
//! mounted. Besides the per-process readers used to enrich events, it offers
//! the ancestry helpers used for container attribution: parent lookup, the two
//! root ancestor policies and descendant enumeration. All of them keep a
//! visited set, so a malformed process tree never makes them loop forever.

use std::{
    collections::HashSet,
    fs::{self, File},
    io::{self, prelude::*, BufReader},
    path::{Path, PathBuf},
};

use nix::unistd::{Pid, Uid, User};
use thiserror::Error;

/// The host init process. Ancestry walks stop right below it.
pub const HOST_INIT_PID: Pid = Pid::from_raw(1);

const DEFAULT_PROC_ROOT: &str = "/proc";

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("process {0} not found")]
    ProcessNotFound(Pid),
    #[error("reading {path} failed")]
    ReadFailure {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("cycle detected in the ancestry of process {0}")]
    CycleDetected(Pid),
    #[error("invalid value {value:?} in {path}")]
    InvalidValue { path: String, value: String },
}

/// Convenience type for command lines.
pub type CommandLine = Vec<String>;

/// Handle to a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn process_dir(&self, pid: Pid) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Returns the path of the executable image of a given process.
    pub fn process_path(&self, pid: Pid) -> Result<PathBuf, ProcfsError> {
        let path = self.process_dir(pid).join("exe");
        fs::read_link(&path).map_err(|source| read_error(pid, source, &path))
    }

    /// Returns the command line for the given process.
    pub fn process_command_line(&self, pid: Pid) -> Result<CommandLine, ProcfsError> {
        let path = self.process_dir(pid).join("cmdline");
        let data = fs::read(&path).map_err(|source| read_error(pid, source, &path))?;

        Ok(data
            .split(|byte| *byte == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect())
    }

    /// Returns the arguments of the given process, without the program name,
    /// joined by a single space.
    pub fn process_args(&self, pid: Pid) -> Result<String, ProcfsError> {
        let command_line = self.process_command_line(pid)?;
        Ok(command_line
            .get(1..)
            .map(|args| args.join(" "))
            .unwrap_or_default())
    }

    /// Returns the parent of a given process, read from its status descriptor.
    pub fn parent_of(&self, pid: Pid) -> Result<Pid, ProcfsError> {
        let path = self.process_dir(pid).join("status");
        let file = File::open(&path).map_err(|source| read_error(pid, source, &path))?;

        let reader = BufReader::new(file);
        for line in reader.lines() {
            let line = line.map_err(|source| ProcfsError::ReadFailure {
                source,
                path: path.display().to_string(),
            })?;
            let Some(value) = line.strip_prefix("PPid:") else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            return value
                .parse()
                .map(Pid::from_raw)
                .map_err(|_| ProcfsError::InvalidValue {
                    path: path.display().to_string(),
                    value: value.to_string(),
                });
        }

        Err(ProcfsError::ProcessNotFound(pid))
    }

    /// Root ancestor used for plain Docker hosts: the topmost process of the
    /// chain, i.e. the one directly parented by host init.
    pub fn root_ancestor(&self, pid: Pid) -> Result<Pid, ProcfsError> {
        self.walk_to_host_init(pid).map(|(top, _)| top)
    }

    /// Root ancestor used for Kubernetes hosts: the process one level below
    /// the one directly parented by host init. When `pid` is itself parented
    /// by host init, `pid` is returned.
    pub fn root_prev_ancestor(&self, pid: Pid) -> Result<Pid, ProcfsError> {
        self.walk_to_host_init(pid)
            .map(|(top, below)| below.unwrap_or(top))
    }

    /// Walks the parent chain of `pid` until the process parented by host
    /// init. Returns that process and the one visited right before it.
    fn walk_to_host_init(&self, pid: Pid) -> Result<(Pid, Option<Pid>), ProcfsError> {
        let mut visited = HashSet::new();
        let mut previous = None;
        let mut current = pid;

        loop {
            if !visited.insert(current) {
                return Err(ProcfsError::CycleDetected(current));
            }

            let parent = self.parent_of(current)?;
            if parent == HOST_INIT_PID {
                return Ok((current, previous));
            }

            previous = Some(current);
            current = parent;
        }
    }

    /// Returns all the descendants of `pid`, discovered through the per-thread
    /// `children` lists.
    ///
    /// A process which no longer exists has no descendants. Failures while
    /// visiting a subtree are logged and the subtree is skipped.
    pub fn descendants(&self, pid: Pid) -> Result<HashSet<Pid>, ProcfsError> {
        let process_dir = self.process_dir(pid);
        match fs::metadata(&process_dir) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(source) => {
                return Err(ProcfsError::ReadFailure {
                    source,
                    path: process_dir.display().to_string(),
                });
            }
        }

        let mut visited = HashSet::from([pid]);
        let mut descendants = HashSet::new();
        let mut pending = self.children_of(pid)?;

        while let Some(child) = pending.pop() {
            if child != pid {
                descendants.insert(child);
            }
            if !visited.insert(child) {
                continue;
            }
            match self.children_of(child) {
                Ok(children) => pending.extend(children),
                Err(err) => {
                    crate::log_warning(&format!("Reading children of process {child}"), err)
                }
            }
        }

        Ok(descendants)
    }

    /// Returns the direct children of `pid`, merging the lists of all its threads.
    /// Unreadable per-thread lists are skipped, since threads can exit at any time.
    fn children_of(&self, pid: Pid) -> Result<Vec<Pid>, ProcfsError> {
        let task_dir = self.process_dir(pid).join("task");
        let tasks = fs::read_dir(&task_dir).map_err(|source| read_error(pid, source, &task_dir))?;

        let mut children = Vec::new();
        for task in tasks.flatten() {
            let Ok(content) = fs::read_to_string(task.path().join("children")) else {
                continue;
            };
            for token in content.split_whitespace() {
                match token.parse() {
                    Ok(child) => children.push(Pid::from_raw(child)),
                    Err(_) => log::debug!("ignoring invalid child pid {token:?} of {pid}"),
                }
            }
        }

        Ok(children)
    }

    /// Tells whether the running kernel exports `symbol`, according to
    /// `kallsyms`.
    pub fn kernel_symbol_exists(&self, symbol: &str) -> Result<bool, ProcfsError> {
        let path = self.root.join("kallsyms");
        let file = File::open(&path).map_err(|source| ProcfsError::ReadFailure {
            source,
            path: path.display().to_string(),
        })?;

        for line in BufReader::new(file).lines() {
            let line = line.map_err(|source| ProcfsError::ReadFailure {
                source,
                path: path.display().to_string(),
            })?;
            // address, type, name and an optional [module]
            if line.split_whitespace().nth(2) == Some(symbol) {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// A missing descriptor means the process is gone, everything else is a read failure.
fn read_error(pid: Pid, source: io::Error, path: &Path) -> ProcfsError {
    if source.kind() == io::ErrorKind::NotFound {
        ProcfsError::ProcessNotFound(pid)
    } else {
        ProcfsError::ReadFailure {
            source,
            path: path.display().to_string(),
        }
    }
}

/// Returns the name of the given user, if it exists.
pub fn get_user_name(uid: Uid) -> Option<String> {
    match User::from_uid(uid) {
        Ok(user) => user.map(|user| user.name),
        Err(err) => {
            log::debug!("looking up user {uid} failed: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeProc;

    const PID_1: Pid = Pid::from_raw(100);
    const PID_2: Pid = Pid::from_raw(200);
    const PID_3: Pid = Pid::from_raw(300);
    const PID_4: Pid = Pid::from_raw(400);

    #[test]
    fn parent_of_reads_status() {
        let proc = FakeProc::new();
        proc.process(PID_2, PID_1);
        assert_eq!(proc.procfs().parent_of(PID_2).unwrap(), PID_1);
    }

    #[test]
    fn parent_of_missing_process() {
        let proc = FakeProc::new();
        assert!(matches!(
            proc.procfs().parent_of(PID_1),
            Err(ProcfsError::ProcessNotFound(pid)) if pid == PID_1
        ));
    }

    #[test]
    fn parent_of_without_ppid_field() {
        let proc = FakeProc::new();
        proc.raw_status(PID_1, "Name:\tsleep\nState:\tS (sleeping)\n");
        assert!(matches!(
            proc.procfs().parent_of(PID_1),
            Err(ProcfsError::ProcessNotFound(_))
        ));
    }

    #[test]
    fn parent_of_malformed_ppid() {
        let proc = FakeProc::new();
        proc.raw_status(PID_1, "PPid:\tabc\n");
        assert!(matches!(
            proc.procfs().parent_of(PID_1),
            Err(ProcfsError::InvalidValue { .. })
        ));
    }

    /// PID_4 -> PID_3 -> PID_2 -> PID_1 -> init
    fn chain() -> FakeProc {
        let proc = FakeProc::new();
        proc.process(PID_1, HOST_INIT_PID);
        proc.process(PID_2, PID_1);
        proc.process(PID_3, PID_2);
        proc.process(PID_4, PID_3);
        proc
    }

    #[test]
    fn docker_policy_returns_process_below_init() {
        let proc = chain();
        assert_eq!(proc.procfs().root_ancestor(PID_4).unwrap(), PID_1);
        assert_eq!(proc.procfs().root_ancestor(PID_1).unwrap(), PID_1);
    }

    #[test]
    fn k8s_policy_returns_one_level_lower() {
        let proc = chain();
        assert_eq!(proc.procfs().root_prev_ancestor(PID_4).unwrap(), PID_2);
        assert_eq!(proc.procfs().root_prev_ancestor(PID_2).unwrap(), PID_2);
        // the starting process is directly parented by init
        assert_eq!(proc.procfs().root_prev_ancestor(PID_1).unwrap(), PID_1);
    }

    #[test]
    fn ancestry_cycle_is_detected() {
        let proc = FakeProc::new();
        proc.process(PID_1, PID_2);
        proc.process(PID_2, PID_3);
        proc.process(PID_3, PID_1);
        assert!(matches!(
            proc.procfs().root_ancestor(PID_1),
            Err(ProcfsError::CycleDetected(pid)) if pid == PID_1
        ));
        assert!(matches!(
            proc.procfs().root_prev_ancestor(PID_2),
            Err(ProcfsError::CycleDetected(_))
        ));
    }

    #[test]
    fn ancestry_broken_chain() {
        let proc = FakeProc::new();
        proc.process(PID_2, PID_1);
        assert!(matches!(
            proc.procfs().root_ancestor(PID_2),
            Err(ProcfsError::ProcessNotFound(pid)) if pid == PID_1
        ));
    }

    #[test]
    fn descendants_are_collected_recursively() {
        let proc = chain();
        proc.children(PID_1, &[PID_2]);
        proc.children(PID_2, &[PID_3]);
        proc.children(PID_3, &[PID_4]);
        proc.children(PID_4, &[]);

        let descendants = proc.procfs().descendants(PID_1).unwrap();
        assert_eq!(descendants, HashSet::from([PID_2, PID_3, PID_4]));
    }

    #[test]
    fn descendants_merge_thread_lists() {
        let proc = FakeProc::new();
        proc.process(PID_1, HOST_INIT_PID);
        proc.thread_children(PID_1, Pid::from_raw(101), &[PID_2]);
        proc.thread_children(PID_1, Pid::from_raw(102), &[PID_3]);
        proc.children(PID_2, &[]);
        proc.children(PID_3, &[]);

        let descendants = proc.procfs().descendants(PID_1).unwrap();
        assert_eq!(descendants, HashSet::from([PID_2, PID_3]));
    }

    #[test]
    fn descendants_survive_cycles_and_vanished_children() {
        let proc = FakeProc::new();
        proc.process(PID_1, HOST_INIT_PID);
        proc.children(PID_1, &[PID_2, PID_3]);
        proc.children(PID_2, &[PID_1]);
        // PID_3 exited after being listed

        let descendants = proc.procfs().descendants(PID_1).unwrap();
        assert_eq!(descendants, HashSet::from([PID_2, PID_3]));
    }

    #[test]
    fn descendants_never_contain_the_process_itself() {
        let proc = FakeProc::new();
        proc.process(PID_1, HOST_INIT_PID);
        proc.children(PID_1, &[PID_1]);

        assert!(proc.procfs().descendants(PID_1).unwrap().is_empty());
    }

    #[test]
    fn descendants_of_missing_process_is_empty() {
        let proc = FakeProc::new();
        assert!(proc.procfs().descendants(PID_1).unwrap().is_empty());
    }

    #[test]
    fn process_args_skip_program_name() {
        let proc = FakeProc::new();
        proc.cmdline(PID_1, &["/usr/bin/curl", "-s", "http://example.com"]);
        let procfs = proc.procfs();
        assert_eq!(
            procfs.process_command_line(PID_1).unwrap(),
            vec!["/usr/bin/curl", "-s", "http://example.com"]
        );
        assert_eq!(procfs.process_args(PID_1).unwrap(), "-s http://example.com");
    }

    #[test]
    fn process_path_follows_exe_link() {
        let proc = FakeProc::new();
        proc.exe(PID_1, "/usr/bin/curl");
        assert_eq!(
            proc.procfs().process_path(PID_1).unwrap(),
            PathBuf::from("/usr/bin/curl")
        );
        assert!(matches!(
            proc.procfs().process_path(PID_2),
            Err(ProcfsError::ProcessNotFound(_))
        ));
    }

    #[test]
    fn kernel_symbols() {
        let proc = FakeProc::new();
        proc.kallsyms(&[
            "ffffffff81000000 T _stext",
            "ffffffff81a3c2d0 T tcp_connect",
            "ffffffffc0a01000 t nf_conntrack_in\t[nf_conntrack]",
        ]);
        let procfs = proc.procfs();
        assert!(procfs.kernel_symbol_exists("tcp_connect").unwrap());
        assert!(procfs.kernel_symbol_exists("nf_conntrack_in").unwrap());
        assert!(!procfs.kernel_symbol_exists("tcp_conn").unwrap());
        assert!(!procfs.kernel_symbol_exists("T").unwrap());
    }

    #[test]
    fn kernel_symbols_unreadable() {
        let proc = FakeProc::new();
        assert!(matches!(
            proc.procfs().kernel_symbol_exists("tcp_connect"),
            Err(ProcfsError::ReadFailure { .. })
        ));
    }

    #[test]
    fn root_user_is_resolved() {
        assert_eq!(get_user_name(Uid::from_raw(0)).as_deref(), Some("root"));
    }
}
