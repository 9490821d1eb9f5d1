//! net_cls cgroup (v1) classifier
//!
//! Layout below the hierarchy root:
//!
//! ```text
//! <root>/release_agent
//! <root>/<base>/notify_on_release
//! <root>/<base>/<group>/{net_cls.classid, cgroup.procs, notify_on_release}
//! ```

use std::fs;
use std::io;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use error_stack::{Report, ResultExt};
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::domain::pu_management::{CgroupClassifier, ClassifierError, ClassifierResult};

const CLASSID_FILE: &str = "net_cls.classid";
const PROCS_FILE: &str = "cgroup.procs";
const NOTIFY_FILE: &str = "notify_on_release";
const RELEASE_AGENT_FILE: &str = "release_agent";

/// Filesystem backed [`CgroupClassifier`]
#[derive(Debug, Clone)]
pub struct NetClsController {
    root: PathBuf,
    base: String,
    release_agent: Option<PathBuf>,
}

impl NetClsController {
    /// `base` is the cgroup every group lives under, e.g. `/pu-monitor`.
    pub fn new(root: impl Into<PathBuf>, base: &str, release_agent: Option<PathBuf>) -> Self {
        Self {
            root: root.into(),
            base: base.trim_matches('/').to_string(),
            release_agent,
        }
    }

    pub fn base_path(&self) -> PathBuf {
        self.root.join(&self.base)
    }

    fn group_path(&self, cgroup: &str) -> ClassifierResult<PathBuf> {
        let name = cgroup.trim_start_matches('/');
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(Report::new(ClassifierError::Read {
                cgroup: cgroup.to_string(),
            })
            .attach_printable("invalid cgroup name"));
        }
        Ok(self.base_path().join(name))
    }

    fn install_release_agent(&self) -> io::Result<()> {
        if let Some(agent) = &self.release_agent {
            fs::write(
                self.root.join(RELEASE_AGENT_FILE),
                agent.as_os_str().as_encoded_bytes(),
            )?;
        }
        fs::write(self.base_path().join(NOTIFY_FILE), b"1")
    }
}

/// Remove a cgroup directory.
///
/// cgroupfs only supports `rmdir`; plain directories used as a hierarchy fall back
/// to a recursive removal.
fn remove_group_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::DirectoryNotEmpty => fs::remove_dir_all(path),
        Err(err) => Err(err),
    }
}

fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

impl CgroupClassifier for NetClsController {
    fn create_group(&self, cgroup: &str) -> ClassifierResult<()> {
        let create_error = || ClassifierError::Create {
            cgroup: cgroup.to_string(),
        };
        let path = self.group_path(cgroup).change_context_lazy(create_error)?;

        fs::create_dir_all(&path)
            .change_context_lazy(create_error)
            .attach_printable_lazy(|| format!("path: {}", path.display()))?;
        self.install_release_agent()
            .change_context_lazy(create_error)?;
        fs::write(path.join(NOTIFY_FILE), b"1").change_context_lazy(create_error)?;

        debug!(cgroup = cgroup, path = %path.display(), "Created net_cls cgroup");
        Ok(())
    }

    fn delete_group(&self, cgroup: &str) -> ClassifierResult<()> {
        let delete_error = || ClassifierError::Delete {
            cgroup: cgroup.to_string(),
        };
        let path = self.group_path(cgroup).change_context_lazy(delete_error)?;

        remove_group_dir(&path)
            .change_context_lazy(delete_error)
            .attach_printable_lazy(|| format!("path: {}", path.display()))?;

        debug!(cgroup = cgroup, "Deleted net_cls cgroup");
        Ok(())
    }

    fn assign_mark(&self, cgroup: &str, mark: u32) -> ClassifierResult<()> {
        let mark_error = || ClassifierError::AssignMark {
            cgroup: cgroup.to_string(),
            mark,
        };
        let path = self.group_path(cgroup).change_context_lazy(mark_error)?;
        if !path.is_dir() {
            return Err(Report::new(mark_error()).attach_printable("cgroup does not exist"));
        }

        fs::write(path.join(CLASSID_FILE), mark.to_string()).change_context_lazy(mark_error)?;
        Ok(())
    }

    fn add_process(&self, cgroup: &str, pid: u32) -> ClassifierResult<()> {
        let add_error = || ClassifierError::AddProcess {
            cgroup: cgroup.to_string(),
            pid,
        };
        let path = self.group_path(cgroup).change_context_lazy(add_error)?;
        if !path.is_dir() {
            return Err(Report::new(add_error()).attach_printable("cgroup does not exist"));
        }

        let mut procs = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path.join(PROCS_FILE))
            .change_context_lazy(add_error)?;
        writeln!(procs, "{pid}").change_context_lazy(add_error)?;
        Ok(())
    }

    fn list_groups(&self) -> ClassifierResult<Vec<String>> {
        let pattern = format!(
            "{}/*",
            glob::Pattern::escape(&self.base_path().to_string_lossy())
        );
        let paths = glob::glob(&pattern)
            .change_context(ClassifierError::Enumerate)
            .attach_printable_lazy(|| format!("pattern: {pattern}"))?;

        let mut groups = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    warn!(error = %err, "Failed to read cgroup entry");
                    continue;
                }
            };
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                groups.push(name.to_string());
            }
        }
        groups.sort();
        Ok(groups)
    }

    fn list_group_members(&self, cgroup: &str) -> ClassifierResult<Vec<u32>> {
        let read_error = || ClassifierError::Read {
            cgroup: cgroup.to_string(),
        };
        let path = self.group_path(cgroup)?;
        let content = read_optional(&path.join(PROCS_FILE)).change_context_lazy(read_error)?;

        let mut pids = Vec::new();
        for line in content.unwrap_or_default().lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let pid = line
                .parse::<u32>()
                .change_context_lazy(read_error)
                .attach_printable_lazy(|| format!("invalid pid entry `{line}`"))?;
            pids.push(pid);
        }
        Ok(pids)
    }

    fn mark_of(&self, cgroup: &str) -> ClassifierResult<Option<String>> {
        let path = self.group_path(cgroup)?;
        let content = read_optional(&path.join(CLASSID_FILE)).change_context(
            ClassifierError::Read {
                cgroup: cgroup.to_string(),
            },
        )?;
        Ok(content
            .map(|mark| mark.trim().to_string())
            .filter(|mark| !mark.is_empty()))
    }

    fn delete_base_path(&self, base: &str) -> ClassifierResult<()> {
        let path = self.root.join(base.trim_matches('/'));
        if path == self.root {
            return Err(Report::new(ClassifierError::Delete {
                cgroup: base.to_string(),
            })
            .attach_printable("refusing to delete the hierarchy root"));
        }

        remove_group_dir(&path).change_context(ClassifierError::Delete {
            cgroup: base.to_string(),
        })?;

        info!(path = %path.display(), "Deleted base cgroup");
        Ok(())
    }
}
