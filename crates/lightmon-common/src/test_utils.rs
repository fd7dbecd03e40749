//! Synthetic procfs and container runtime trees for tests.

use std::{fs, os::unix::fs::symlink, path::Path};

use nix::unistd::Pid;
use tempfile::TempDir;

use crate::procfs::ProcFs;

/// A fake procfs living in a temporary directory.
pub struct FakeProc {
    dir: TempDir,
}

impl Default for FakeProc {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProc {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("creating temporary procfs"),
        }
    }

    pub fn procfs(&self) -> ProcFs {
        ProcFs::new(self.dir.path())
    }

    fn process_dir(&self, pid: Pid) -> std::path::PathBuf {
        let dir = self.dir.path().join(pid.to_string());
        fs::create_dir_all(&dir).expect("creating process directory");
        dir
    }

    /// Creates a process with the given parent.
    pub fn process(&self, pid: Pid, ppid: Pid) {
        self.raw_status(pid, &format!("Name:\tproc{pid}\nState:\tS (sleeping)\nPid:\t{pid}\nPPid:\t{ppid}\n"));
    }

    pub fn raw_status(&self, pid: Pid, content: &str) {
        fs::write(self.process_dir(pid).join("status"), content).expect("writing status");
    }

    /// Sets the children list of the main thread of `pid`.
    pub fn children(&self, pid: Pid, children: &[Pid]) {
        self.thread_children(pid, pid, children)
    }

    pub fn thread_children(&self, pid: Pid, tid: Pid, children: &[Pid]) {
        let task_dir = self.process_dir(pid).join("task").join(tid.to_string());
        fs::create_dir_all(&task_dir).expect("creating task directory");
        let list = children
            .iter()
            .map(|child| format!("{child} "))
            .collect::<String>();
        fs::write(task_dir.join("children"), list).expect("writing children");
    }

    pub fn cmdline(&self, pid: Pid, argv: &[&str]) {
        let mut data = Vec::new();
        for arg in argv {
            data.extend_from_slice(arg.as_bytes());
            data.push(0);
        }
        fs::write(self.process_dir(pid).join("cmdline"), data).expect("writing cmdline");
    }

    pub fn exe(&self, pid: Pid, target: &str) {
        symlink(target, self.process_dir(pid).join("exe")).expect("linking exe");
    }

    /// Writes the kernel symbol table, one `kallsyms` line per entry.
    pub fn kallsyms(&self, lines: &[&str]) {
        fs::write(self.dir.path().join("kallsyms"), lines.join("\n")).expect("writing kallsyms");
    }

    pub fn remove(&self, pid: Pid) {
        fs::remove_dir_all(self.dir.path().join(pid.to_string())).expect("removing process");
    }
}

/// A fake Docker host: runtime root and data root.
pub struct FakeDocker {
    runtime: TempDir,
    data: TempDir,
}

impl Default for FakeDocker {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDocker {
    pub fn new() -> Self {
        let runtime = TempDir::new().expect("creating runtime root");
        fs::create_dir_all(runtime.path().join("containerd")).expect("creating containerd dir");
        Self {
            runtime,
            data: TempDir::new().expect("creating data root"),
        }
    }

    pub fn runtime_root(&self) -> &Path {
        self.runtime.path()
    }

    pub fn data_root(&self) -> &Path {
        self.data.path()
    }

    /// Registers a running container with its state and config descriptors.
    pub fn container(&self, id: &str, init_pid: Pid, name: &str) {
        self.container_dir(id);
        self.state(id, &format!(r#"{{"id":"{id}","init_process_pid":{init_pid},"init_process_start":1234}}"#));
        self.config(
            id,
            &format!(r#"{{"StreamConfig":{{}},"ID":"{id}","Image":"sha256:0000","Name":"{name}","Driver":"overlay2"}}"#),
        );
    }

    pub fn container_dir(&self, id: &str) {
        fs::create_dir_all(self.runtime.path().join("containerd").join(id))
            .expect("creating container dir");
    }

    pub fn state(&self, id: &str, content: &str) {
        let dir = self.runtime.path().join("runtime-runc/moby").join(id);
        fs::create_dir_all(&dir).expect("creating state dir");
        fs::write(dir.join("state.json"), content).expect("writing state.json");
    }

    pub fn config(&self, id: &str, content: &str) {
        let dir = self.data.path().join("containers").join(id);
        fs::create_dir_all(&dir).expect("creating config dir");
        fs::write(dir.join("config.v2.json"), content).expect("writing config.v2.json");
    }
}
