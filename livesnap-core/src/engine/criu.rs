// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CRIU-backed snapshot engine.
//!
//! Drives the `criu` binary for pre-dump, dump and restore, and `crit` to
//! translate CRIU pagemaps to and from page frames. Each pass runs in a
//! scratch directory under the engine state dir; the orchestrator owns the
//! images directory and only ever sees [`EngineImage`] values.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::OnceCell;

use super::{
    DumpKind, DumpOptions, EngineImage, HostInfo, PageFrame, ProcessImage, RestoreImage,
    RestoredTree, SnapshotEngine, PAGE_SIZE,
};
use crate::error::EngineError;
use crate::types::{ContainerId, PageId, ProcessId, SnapshotId};

/// Name of the pid file the container runtime writes for each container.
const INIT_PID_FILE: &str = "init.pid";

/// Name of the pid file CRIU writes after a detached restore.
const RESTORED_PID_FILE: &str = "restored.pid";

const PROC_ROOT: &str = "/proc";

/// Settings for [`CriuEngine`].
#[derive(Debug, Clone)]
pub struct CriuSettings {
    /// Explicit criu binary; auto-detected when `None`.
    pub criu_path: Option<PathBuf>,
    /// Explicit crit binary; auto-detected when `None`.
    pub crit_path: Option<PathBuf>,
    /// Scratch space for per-pass CRIU output.
    pub state_dir: PathBuf,
    /// Runtime state root holding `<container>/init.pid`.
    pub runtime_state_dir: PathBuf,
    pub shell_job: bool,
    pub tcp_established: bool,
}

#[derive(Debug, Clone)]
struct PassRecord {
    snapshot_id: SnapshotId,
    dir: PathBuf,
}

/// Snapshot engine that shells out to CRIU.
pub struct CriuEngine {
    criu_path: PathBuf,
    crit_path: PathBuf,
    state_dir: PathBuf,
    runtime_state_dir: PathBuf,
    shell_job: bool,
    tcp_established: bool,
    /// Last pass per container; the parent for `--prev-images-dir`.
    passes: DashMap<ContainerId, PassRecord>,
    /// Host PIDs of the last dumped or restored tree per container.
    trees: DashMap<ContainerId, Vec<u32>>,
    version: OnceCell<String>,
}

impl CriuEngine {
    /// Create a new CriuEngine.
    ///
    /// # Errors
    /// Returns EngineError if the criu or crit binaries cannot be found or
    /// the state directory cannot be created.
    pub fn new(settings: CriuSettings) -> Result<Self, EngineError> {
        let criu_path = match settings.criu_path {
            Some(path) => path,
            None => Self::find_binary("criu")?,
        };
        let crit_path = match settings.crit_path {
            Some(path) => path,
            None => Self::find_binary("crit")?,
        };

        std::fs::create_dir_all(&settings.state_dir).map_err(|e| EngineError::Io {
            context: format!("creating engine state dir {}", settings.state_dir.display()),
            source: e,
        })?;

        tracing::info!(
            criu_path = %criu_path.display(),
            crit_path = %crit_path.display(),
            state_dir = %settings.state_dir.display(),
            "CriuEngine initialized"
        );

        Ok(Self {
            criu_path,
            crit_path,
            state_dir: settings.state_dir,
            runtime_state_dir: settings.runtime_state_dir,
            shell_job: settings.shell_job,
            tcp_established: settings.tcp_established,
            passes: DashMap::new(),
            trees: DashMap::new(),
            version: OnceCell::new(),
        })
    }

    /// Find a CRIU tool binary.
    fn find_binary(name: &'static str) -> Result<PathBuf, EngineError> {
        let dirs = [
            "/usr/sbin",
            "/usr/bin",
            "/sbin",
            "/bin",
            "/usr/local/sbin",
            "/usr/local/bin",
        ];

        for dir in dirs {
            let p = Path::new(dir).join(name);
            if p.exists() {
                return Ok(p);
            }
        }

        // Try which
        if let Ok(output) = std::process::Command::new("which").arg(name).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Ok(PathBuf::from(path));
                }
            }
        }

        Err(EngineError::BinaryNotFound { binary: name })
    }

    /// Resolve the init process of a container from the runtime state dir.
    fn init_pid(&self, container: &ContainerId) -> Result<u32, EngineError> {
        let pid_file = self
            .runtime_state_dir
            .join(container.as_str())
            .join(INIT_PID_FILE);
        let content =
            std::fs::read_to_string(&pid_file).map_err(|_| EngineError::ContainerNotFound {
                container_id: container.clone(),
            })?;
        content
            .trim()
            .parse::<u32>()
            .map_err(|e| EngineError::InvalidContainerState {
                container_id: container.clone(),
                reason: format!("invalid pid in {}: {}", pid_file.display(), e),
            })
    }

    fn container_dir(&self, container: &ContainerId) -> PathBuf {
        self.state_dir.join(container.as_str())
    }

    /// Scratch dir of the parent pass, recorded by this process or left on
    /// disk by an earlier one.
    fn parent_dir(&self, container: &ContainerId, parent: SnapshotId) -> Option<PathBuf> {
        if let Some(record) = self.passes.get(container) {
            if record.snapshot_id == parent {
                return Some(record.dir.clone());
            }
        }
        let dir = self.container_dir(container).join(parent.to_string());
        dir.is_dir().then_some(dir)
    }

    /// PIDs to signal for `container`. Falls back to walking the live tree
    /// from the init process when nothing was recorded.
    fn known_tree(&self, container: &ContainerId) -> Result<Vec<u32>, String> {
        if let Some(tree) = self.trees.get(container) {
            return Ok(tree.clone());
        }
        let pid = self.init_pid(container).map_err(|e| e.to_string())?;
        Ok(proc_tree(Path::new(PROC_ROOT), pid))
    }

    fn common_args(&self, args: &mut Vec<OsString>) {
        if self.shell_job {
            args.push("--shell-job".into());
        }
        if self.tcp_established {
            args.push("--tcp-established".into());
        }
    }

    /// Run criu, returning stderr on failure.
    async fn run_criu(&self, args: &[OsString]) -> Result<(), String> {
        let output = Command::new(&self.criu_path)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("Failed to execute CRIU: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("CRIU exited with {}: {}", output.status, stderr.trim()));
        }
        Ok(())
    }

    async fn crit_decode(&self, path: &Path) -> Result<Value, String> {
        let output = Command::new(&self.crit_path)
            .arg("decode")
            .arg("-i")
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("Failed to execute crit: {}", e))?;
        if !output.status.success() {
            return Err(format!(
                "crit decode {} failed: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| format!("crit output for {} is not JSON: {}", path.display(), e))
    }

    async fn crit_encode(&self, value: &Value, out: &Path) -> Result<(), String> {
        let json_path = out.with_extension("json");
        let body = serde_json::to_vec(value).map_err(|e| e.to_string())?;
        tokio::fs::write(&json_path, body)
            .await
            .map_err(|e| format!("writing {}: {}", json_path.display(), e))?;

        let output = Command::new(&self.crit_path)
            .arg("encode")
            .arg("-i")
            .arg(&json_path)
            .arg("-o")
            .arg(out)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("Failed to execute crit: {}", e))?;
        let _ = tokio::fs::remove_file(&json_path).await;

        if !output.status.success() {
            return Err(format!(
                "crit encode {} failed: {}",
                out.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }

    /// Run one pre-dump or dump pass into a fresh scratch directory.
    async fn pass(
        &self,
        kind: DumpKind,
        container: &ContainerId,
        opts: &DumpOptions,
    ) -> Result<EngineImage, EngineError> {
        let fail = |reason: String, tree_stopped: bool| match kind {
            DumpKind::PreDump => EngineError::PreDumpFailed { reason },
            DumpKind::Dump => EngineError::DumpFailed {
                reason,
                tree_stopped,
            },
        };

        let pid = self.init_pid(container)?;
        let container_dir = self.container_dir(container);
        let dir = container_dir.join(opts.snapshot_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::Io {
                context: format!("creating scratch dir {}", dir.display()),
                source: e,
            })?;

        let mut args: Vec<OsString> = vec![
            kind.name().into(),
            "-t".into(),
            pid.to_string().into(),
            "-D".into(),
            dir.clone().into(),
            "-W".into(),
            opts.work_dir.clone().into(),
            "-o".into(),
            format!("{}-{}.log", kind.name(), opts.snapshot_id).into(),
            "-v4".into(),
        ];
        self.common_args(&mut args);
        if opts.track_memory {
            args.push("--track-mem".into());
        }
        let parent = opts
            .parent
            .and_then(|p| self.parent_dir(container, p));
        if let Some(parent) = parent.as_ref().and_then(|p| p.file_name()) {
            let mut prev = OsString::from("../");
            prev.push(parent);
            args.push("--prev-images-dir".into());
            args.push(prev);
        }
        if kind == DumpKind::Dump {
            args.push(if opts.leave_running {
                "--leave-running".into()
            } else {
                "--leave-stopped".into()
            });
        }

        tracing::debug!(
            container_id = %container,
            pid = pid,
            pass = kind.name(),
            path = %dir.display(),
            incremental = parent.is_some(),
            "Starting CRIU pass"
        );

        let start = Instant::now();
        self.run_criu(&args).await.map_err(|reason| fail(reason, false))?;

        let tree_stopped = kind == DumpKind::Dump && !opts.leave_running;
        if kind == DumpKind::Dump {
            self.trees
                .insert(container.clone(), proc_tree(Path::new(PROC_ROOT), pid));
        }
        let image = self
            .collect(kind, &dir)
            .await
            .map_err(|reason| fail(reason, tree_stopped))?;

        tracing::info!(
            container_id = %container,
            pass = kind.name(),
            pages = image.pages.len(),
            processes = image.processes.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "CRIU pass completed"
        );

        let previous = self.passes.insert(
            container.clone(),
            PassRecord {
                snapshot_id: opts.snapshot_id,
                dir: dir.clone(),
            },
        );
        let mut keep = vec![dir.as_path()];
        keep.extend(parent.as_deref());
        keep.extend(previous.as_ref().map(|p| p.dir.as_path()));
        self.prune_scratch(&container_dir, &keep).await;

        Ok(image)
    }

    /// Remove scratch passes older than the ones still needed as parents.
    async fn prune_scratch(&self, container_dir: &Path, keep: &[&Path]) {
        let Ok(mut entries) = tokio::fs::read_dir(container_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if keep.iter().any(|k| *k == path) {
                continue;
            }
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to prune CRIU scratch dir");
            }
        }
    }

    /// Translate CRIU output in `dir` into an engine image.
    ///
    /// A pre-dump only writes memory images, so its processes are taken from
    /// the pagemap file names and carry no parent or command.
    async fn collect(&self, kind: DumpKind, dir: &Path) -> Result<EngineImage, String> {
        let files = list_files(dir).await?;
        let tree: Vec<(u32, u32)> = match kind {
            DumpKind::Dump => {
                let pstree = self.crit_decode(&dir.join("pstree.img")).await?;
                let mut tree = Vec::new();
                for entry in entries(&pstree) {
                    let pid = json_u64(&entry["pid"]).ok_or("pstree entry without pid")? as u32;
                    let ppid = json_u64(&entry["ppid"]).unwrap_or(0) as u32;
                    tree.push((pid, ppid));
                }
                tree
            }
            DumpKind::PreDump => pagemap_pids(&files).into_iter().map(|pid| (pid, 0)).collect(),
        };

        let mut processes = Vec::with_capacity(tree.len());
        let mut pages = Vec::new();
        for (pid, ppid) in tree {
            let command = match kind {
                DumpKind::Dump => self.command_of(dir, pid).await,
                DumpKind::PreDump => String::new(),
            };
            let resident = self.collect_pages(dir, pid, &mut pages).await?;
            processes.push(ProcessImage {
                pid,
                ppid,
                command,
                resident,
            });
        }

        let mut native_files = BTreeMap::new();
        for name in files {
            if name.starts_with("pages-") || name.starts_with("pagemap-") || name.ends_with(".log")
            {
                continue;
            }
            let data = tokio::fs::read(dir.join(&name))
                .await
                .map_err(|e| format!("reading {}: {}", name, e))?;
            native_files.insert(name, data);
        }

        Ok(EngineImage {
            processes,
            pages,
            native_files,
        })
    }

    async fn command_of(&self, dir: &Path, pid: u32) -> String {
        match self.crit_decode(&dir.join(format!("core-{}.img", pid))).await {
            Ok(core) => entries(&core)
                .first()
                .and_then(|c| c["tc"]["comm"].as_str())
                .unwrap_or_default()
                .to_string(),
            Err(_) => String::new(),
        }
    }

    /// Decode the pagemap of `pid`, pushing present pages and returning every
    /// resident address.
    async fn collect_pages(
        &self,
        dir: &Path,
        pid: u32,
        pages: &mut Vec<PageFrame>,
    ) -> Result<Vec<u64>, String> {
        let pagemap = self
            .crit_decode(&dir.join(format!("pagemap-{}.img", pid)))
            .await?;
        let mut resident = Vec::new();
        let mut blob: Option<Vec<u8>> = None;
        let mut cursor = 0usize;

        for item in entries(&pagemap) {
            if let Some(pages_id) = json_u64(&item["pages_id"]) {
                let path = dir.join(format!("pages-{}.img", pages_id));
                let data = tokio::fs::read(&path)
                    .await
                    .map_err(|e| format!("reading {}: {}", path.display(), e))?;
                blob = Some(data);
                cursor = 0;
                continue;
            }

            let vaddr = json_u64(&item["vaddr"]).ok_or("pagemap entry without vaddr")?;
            let nr_pages = json_u64(&item["nr_pages"]).unwrap_or(1) as usize;
            let flags = item["flags"].as_str().unwrap_or("PE_PRESENT");
            let in_parent =
                flags.contains("PE_PARENT") || item["in_parent"].as_bool().unwrap_or(false);
            if !in_parent && !flags.contains("PE_PRESENT") {
                continue;
            }

            for n in 0..nr_pages {
                let page_vaddr = vaddr + (n * PAGE_SIZE) as u64;
                resident.push(page_vaddr);
                if in_parent {
                    continue;
                }
                let data = blob.as_ref().ok_or("pagemap without pages_id header")?;
                let chunk = data
                    .get(cursor..cursor + PAGE_SIZE)
                    .ok_or_else(|| format!("pages file too short for pid {}", pid))?;
                pages.push(PageFrame {
                    id: PageId::new(pid, page_vaddr),
                    data: chunk.to_vec(),
                });
                cursor += PAGE_SIZE;
            }
        }
        Ok(resident)
    }

    /// Write native files plus regenerated pagemaps/pages into `dir`.
    async fn materialize(&self, dir: &Path, image: &RestoreImage) -> Result<(), String> {
        for (name, data) in &image.native_files {
            tokio::fs::write(dir.join(name), data)
                .await
                .map_err(|e| format!("writing {}: {}", name, e))?;
        }

        for (index, process) in image.processes.iter().enumerate() {
            let pages_id = index as u64 + 1;
            let mut blob = Vec::new();
            let mut items = vec![json!({ "pages_id": pages_id })];
            let mut resident = process.resident.clone();
            resident.sort_unstable();
            for vaddr in resident {
                let id = PageId::new(process.pid, vaddr);
                let data = image
                    .pages
                    .get(&id)
                    .ok_or_else(|| format!("page {} missing from image", id))?;
                blob.extend_from_slice(data);
                items.push(json!({
                    "vaddr": format!("{:#x}", vaddr),
                    "nr_pages": 1,
                    "flags": "PE_PRESENT",
                }));
            }

            tokio::fs::write(dir.join(format!("pages-{}.img", pages_id)), &blob)
                .await
                .map_err(|e| format!("writing pages for pid {}: {}", process.pid, e))?;
            let pagemap = json!({ "magic": "PAGEMAP", "entries": items });
            self.crit_encode(&pagemap, &dir.join(format!("pagemap-{}.img", process.pid)))
                .await?;
        }
        Ok(())
    }

    fn signal_tree(&self, container: &ContainerId, signal: Signal) -> Result<(), String> {
        let pids = self.known_tree(container)?;
        for pid in pids {
            match kill(Pid::from_raw(pid as i32), signal) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => return Err(format!("kill({}, {}) failed: {}", pid, signal.as_str(), e)),
            }
        }
        Ok(())
    }
}

/// Names of the regular files in `dir`.
async fn list_files(dir: &Path) -> Result<Vec<String>, String> {
    let mut names = Vec::new();
    let mut dir_entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| format!("listing {}: {}", dir.display(), e))?;
    while let Some(entry) = dir_entries
        .next_entry()
        .await
        .map_err(|e| format!("listing {}: {}", dir.display(), e))?
    {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// PIDs that have a `pagemap-<pid>.img` among `names`.
fn pagemap_pids(names: &[String]) -> Vec<u32> {
    let mut pids: Vec<u32> = names
        .iter()
        .filter_map(|name| {
            name.strip_prefix("pagemap-")?
                .strip_suffix(".img")?
                .parse()
                .ok()
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// `root` and its descendants, following `<proc>/<pid>/task/<tid>/children`.
fn proc_tree(proc_root: &Path, root: u32) -> Vec<u32> {
    let mut tree = vec![root];
    let mut next = 0;
    while next < tree.len() {
        let pid = tree[next];
        next += 1;
        let Ok(tasks) = std::fs::read_dir(proc_root.join(pid.to_string()).join("task")) else {
            continue;
        };
        for task in tasks.flatten() {
            let Ok(children) = std::fs::read_to_string(task.path().join("children")) else {
                continue;
            };
            for child in children.split_whitespace().filter_map(|c| c.parse::<u32>().ok()) {
                if !tree.contains(&child) {
                    tree.push(child);
                }
            }
        }
    }
    tree
}

/// CRIU image entries as decoded by crit.
fn entries(value: &Value) -> Vec<Value> {
    value["entries"].as_array().cloned().unwrap_or_default()
}

/// crit renders some integers as hex strings.
fn json_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
}

#[async_trait]
impl SnapshotEngine for CriuEngine {
    fn name(&self) -> &'static str {
        "criu"
    }

    async fn host_info(&self) -> Result<HostInfo, EngineError> {
        let uts = nix::sys::utsname::uname().map_err(|e| EngineError::HostInfo {
            reason: format!("uname failed: {}", e),
        })?;

        let version = self
            .version
            .get_or_try_init(|| async {
                let output = Command::new(&self.criu_path)
                    .arg("--version")
                    .kill_on_drop(true)
                    .output()
                    .await
                    .map_err(|e| EngineError::HostInfo {
                        reason: format!("Failed to execute CRIU: {}", e),
                    })?;
                let stdout = String::from_utf8_lossy(&output.stdout);
                Ok::<_, EngineError>(
                    stdout
                        .lines()
                        .find_map(|l| l.strip_prefix("Version:"))
                        .map(|v| v.trim().to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                )
            })
            .await?;

        Ok(HostInfo {
            kernel_release: uts.release().to_string_lossy().to_string(),
            arch: uts.machine().to_string_lossy().to_string(),
            engine: self.name().to_string(),
            engine_version: version.clone(),
        })
    }

    async fn pre_dump(
        &self,
        container: &ContainerId,
        opts: &DumpOptions,
    ) -> Result<EngineImage, EngineError> {
        self.pass(DumpKind::PreDump, container, opts).await
    }

    async fn dump(
        &self,
        container: &ContainerId,
        opts: &DumpOptions,
    ) -> Result<EngineImage, EngineError> {
        self.pass(DumpKind::Dump, container, opts).await
    }

    async fn resume(&self, container: &ContainerId) -> Result<(), EngineError> {
        self.signal_tree(container, Signal::SIGCONT)
            .map_err(|reason| EngineError::ResumeFailed { reason })?;
        tracing::info!(container_id = %container, "Resumed process tree");
        Ok(())
    }

    async fn terminate(&self, container: &ContainerId) -> Result<(), EngineError> {
        self.signal_tree(container, Signal::SIGKILL)
            .map_err(|reason| EngineError::InvalidContainerState {
                container_id: container.clone(),
                reason,
            })?;
        self.trees.remove(container);
        self.passes.remove(container);

        let dir = self.container_dir(container);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::warn!(path = %dir.display(), error = %e, "Failed to remove CRIU scratch dir");
        }
        Ok(())
    }

    async fn restore(
        &self,
        container: &ContainerId,
        image: RestoreImage,
    ) -> Result<RestoredTree, EngineError> {
        let dir = self
            .container_dir(container)
            .join(format!("restore-{}", SnapshotId::generate()));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::Io {
                context: format!("creating restore dir {}", dir.display()),
                source: e,
            })?;

        let result = self.restore_in(container, &dir, &image).await;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::warn!(path = %dir.display(), error = %e, "Failed to remove restore dir");
        }
        result
    }
}

impl CriuEngine {
    async fn restore_in(
        &self,
        container: &ContainerId,
        dir: &Path,
        image: &RestoreImage,
    ) -> Result<RestoredTree, EngineError> {
        self.materialize(dir, image)
            .await
            .map_err(|reason| EngineError::RestoreFailed { reason })?;

        let pid_file = dir.join(RESTORED_PID_FILE);
        let mut args: Vec<OsString> = vec![
            "restore".into(),
            "-D".into(),
            dir.to_path_buf().into(),
            "-W".into(),
            image.work_dir.clone().into(),
            "-o".into(),
            "restore.log".into(),
            "-v4".into(),
            "-d".into(),
            "--pidfile".into(),
            pid_file.clone().into(),
        ];
        self.common_args(&mut args);

        let start = Instant::now();
        self.run_criu(&args)
            .await
            .map_err(|reason| EngineError::RestoreFailed { reason })?;

        let pid_str =
            tokio::fs::read_to_string(&pid_file)
                .await
                .map_err(|e| EngineError::RestoreFailed {
                    reason: format!("Failed to read PID file: {}", e),
                })?;
        let pid = pid_str
            .trim()
            .parse::<u32>()
            .map_err(|e| EngineError::RestoreFailed {
                reason: format!("Invalid PID: {}", e),
            })?;
        let root_pid = ProcessId::new(pid).map_err(|e| EngineError::RestoreFailed {
            reason: e.to_string(),
        })?;

        tracing::info!(
            container_id = %container,
            new_pid = pid,
            elapsed_ms = start.elapsed().as_millis(),
            "CRIU restore completed"
        );

        self.trees
            .insert(container.clone(), proc_tree(Path::new(PROC_ROOT), pid));

        Ok(RestoredTree {
            root_pid,
            process_count: image.processes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn engine(root: &Path) -> CriuEngine {
        CriuEngine::new(CriuSettings {
            criu_path: Some(PathBuf::from("/nonexistent/criu")),
            crit_path: Some(PathBuf::from("/nonexistent/crit")),
            state_dir: root.join("state"),
            runtime_state_dir: root.join("run"),
            shell_job: true,
            tcp_established: false,
        })
        .unwrap()
    }

    #[test]
    fn test_json_u64_accepts_hex_and_numbers() {
        assert_eq!(json_u64(&json!("0x400000")), Some(0x40_0000));
        assert_eq!(json_u64(&json!(4096)), Some(4096));
        assert_eq!(json_u64(&json!("17")), Some(17));
        assert_eq!(json_u64(&json!(null)), None);
    }

    #[test]
    fn test_entries_of_decoded_image() {
        let decoded = json!({ "magic": "PSTREE", "entries": [{ "pid": 1 }, { "pid": 2 }] });
        assert_eq!(entries(&decoded).len(), 2);
        assert!(entries(&json!({})).is_empty());
    }

    #[test]
    fn test_missing_binary_override_is_respected() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        assert_eq!(engine.name(), "criu");

        let missing = ContainerId::new("absent").unwrap();
        assert!(matches!(
            engine.init_pid(&missing),
            Err(EngineError::ContainerNotFound { .. })
        ));
    }

    #[test]
    fn test_pre_dump_pids_come_from_pagemaps() {
        let names: Vec<String> = [
            "pagemap-12.img",
            "pages-1.img",
            "pagemap-7.img",
            "pagemap-shmem-3.img",
            "stats-dump",
            "pagemap-7.img.json",
        ]
        .iter()
        .map(|n| n.to_string())
        .collect();
        assert_eq!(pagemap_pids(&names), vec![7, 12]);
    }

    #[test]
    fn test_proc_tree_follows_children() {
        let proc_root = tempfile::tempdir().unwrap();
        let children = |pid: u32, tid: u32, list: &str| {
            let task = proc_root
                .path()
                .join(pid.to_string())
                .join("task")
                .join(tid.to_string());
            std::fs::create_dir_all(&task).unwrap();
            std::fs::write(task.join("children"), list).unwrap();
        };
        children(10, 10, "11 12 ");
        children(10, 15, "13");
        children(11, 11, "14\n");
        children(12, 12, "");

        let mut tree = proc_tree(proc_root.path(), 10);
        tree.sort_unstable();
        assert_eq!(tree, vec![10, 11, 12, 13, 14]);
        assert_eq!(proc_tree(proc_root.path(), 99), vec![99]);
    }

    #[test]
    fn test_parent_pass_is_found_on_disk() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let container = ContainerId::new("web").unwrap();
        let parent = SnapshotId::generate();
        let dir = engine.container_dir(&container).join(parent.to_string());
        std::fs::create_dir_all(&dir).unwrap();

        assert_eq!(engine.parent_dir(&container, parent), Some(dir));
        assert_eq!(engine.parent_dir(&container, SnapshotId::generate()), None);
    }

    #[tokio::test]
    async fn test_resume_without_recorded_tree_uses_init_pid() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());
        let container = ContainerId::new("web").unwrap();

        assert!(matches!(
            engine.resume(&container).await,
            Err(EngineError::ResumeFailed { .. })
        ));

        let run = root.path().join("run").join("web");
        std::fs::create_dir_all(&run).unwrap();
        std::fs::write(run.join(INIT_PID_FILE), std::process::id().to_string()).unwrap();
        engine.resume(&container).await.unwrap();
    }

    /// Process state letter from `/proc/<pid>/stat`, or `None` once reaped.
    fn proc_state(pid: u32) -> Option<char> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        stat.rsplit_once(')')?.1.trim_start().chars().next()
    }

    #[tokio::test]
    async fn test_dropped_pass_kills_criu() {
        let root = tempfile::tempdir().unwrap();
        let mut engine = engine(root.path());
        engine.criu_path = PathBuf::from("/bin/sh");
        let pid_file = root.path().join("child.pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());
        let args: Vec<OsString> = vec!["-c".into(), script.into()];

        let run = tokio::time::timeout(Duration::from_secs(1), engine.run_criu(&args)).await;
        assert!(run.is_err());

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut gone = false;
        for _ in 0..50 {
            if matches!(proc_state(pid), None | Some('Z') | Some('X')) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(gone, "criu child {} outlived its pass", pid);
    }
}
