//! Minimal cgroup-v2 handling for builds that own a uid range or asked for
//! resource accounting: create a fresh cgroup, move the child into it, and
//! tear it down (killing every member) afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::lock::UserLock;
use crate::prelude::*;
use crate::settings::Settings;

#[derive(Debug, Default)]
pub(crate) struct CgroupStats {
  pub cpu_user: Option<Duration>,
  pub cpu_system: Option<Duration>,
}

fn cgroup_fs() -> Result<PathBuf> {
  let mounts = fs::read_to_string("/proc/self/mounts")?;
  for line in mounts.lines() {
    let mut fields = line.split_ascii_whitespace();
    let _dev = fields.next();
    let mountpoint = fields.next();
    let fstype = fields.next();
    if fstype == Some("cgroup2") {
      if let Some(mp) = mountpoint {
        return Ok(PathBuf::from(mp));
      }
    }
  }
  bail!("cannot determine the cgroups file system");
}

fn current_cgroup() -> Result<String> {
  let raw = fs::read_to_string("/proc/self/cgroup")?;
  for line in raw.lines() {
    // v2 entries look like `0::/some/path`
    if let Some(rest) = line.strip_prefix("0::") {
      return Ok(rest.trim().to_string());
    }
  }
  bail!("cannot determine the current cgroup");
}

/// Create the cgroup this build's child will be moved into. When a build
/// user is present, remember it on disk so a crashed predecessor's group
/// can be destroyed first.
pub(crate) fn prepare_cgroup(settings: &Settings, build_user: Option<&UserLock>) -> Result<PathBuf> {
  let root = cgroup_fs()?.append(current_cgroup()?.trim_start_matches('/'));
  ensure!(
    root.exists(),
    "expected cgroup directory '{}'",
    root.display()
  );

  let cgroup = match build_user {
    Some(user) => {
      let dir = settings.state_dir.join("cgroups");
      fs::create_dir_all(&dir)?;
      let bookkeeping = dir.join(user.uid().as_raw().to_string());
      if bookkeeping.exists() {
        let prev = fs::read_to_string(&bookkeeping)?;
        let _ = destroy_cgroup(Path::new(prev.trim()));
      }
      let cgroup = root.join(format!("silo-build-uid-{}", user.uid()));
      fs::write(&bookkeeping, cgroup.display().to_string())?;
      cgroup
    }
    None => {
      let n = settings.cgroup_counter.fetch_add(1, Ordering::SeqCst);
      root.join(format!("silo-build-pid-{}-{}", std::process::id(), n))
    }
  };

  debug!("using cgroup '{}'", cgroup.display());
  let _ = destroy_cgroup(&cgroup);

  Ok(cgroup)
}

/// The directory is created late, after `kill_sandbox` has cleaned up any
/// predecessor, and owned by the build user when there is one.
pub(crate) fn create_cgroup(cgroup: &Path, user: Option<&UserLock>) -> Result<()> {
  fs::create_dir_all(cgroup)?;
  if let Some(user) = user {
    for f in [
      cgroup.to_path_buf(),
      cgroup.join("cgroup.procs"),
      cgroup.join("cgroup.threads"),
    ]
    .iter()
    {
      nix::unistd::chown(f.as_path(), Some(user.uid()), Some(user.gid()))?;
    }
  }
  Ok(())
}

pub(crate) fn move_into_cgroup(cgroup: &Path, pid: Pid) -> Result<()> {
  fs::write(cgroup.join("cgroup.procs"), pid.as_raw().to_string())
    .with_context(|| format!("moving child into cgroup '{}'", cgroup.display()))
}

/// Kill every process in the cgroup, collect its cpu accounting, and remove
/// it. Safe to call on a group that never existed.
pub(crate) fn destroy_cgroup(cgroup: &Path) -> Result<CgroupStats> {
  let mut stats = CgroupStats::default();
  if !cgroup.exists() {
    return Ok(stats);
  }

  // kill members until none remain; new ones can appear while we work
  loop {
    let procs = match fs::read_to_string(cgroup.join("cgroup.procs")) {
      Ok(p) => p,
      Err(_) => break,
    };
    let pids: Vec<i32> = procs.lines().filter_map(|l| l.trim().parse().ok()).collect();
    if pids.is_empty() {
      break;
    }
    for pid in pids {
      let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
    std::thread::sleep(Duration::from_millis(10));
  }

  if let Ok(stat) = fs::read_to_string(cgroup.join("cpu.stat")) {
    for line in stat.lines() {
      let mut fields = line.split_ascii_whitespace();
      match (fields.next(), fields.next()) {
        (Some("user_usec"), Some(v)) => {
          stats.cpu_user = v.parse().ok().map(Duration::from_micros)
        }
        (Some("system_usec"), Some(v)) => {
          stats.cpu_system = v.parse().ok().map(Duration::from_micros)
        }
        _ => {}
      }
    }
  }

  // children first; the build may have created sub-groups
  if let Ok(entries) = fs::read_dir(cgroup) {
    for e in entries.flatten() {
      if e.file_type().map_or(false, |t| t.is_dir()) {
        let _ = destroy_cgroup(&e.path());
      }
    }
  }

  fs::remove_dir(cgroup).with_context(|| format!("deleting cgroup '{}'", cgroup.display()))?;

  Ok(stats)
}
