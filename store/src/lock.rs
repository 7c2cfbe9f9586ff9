use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::os::unix::prelude::RawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, setuid, ForkResult, Gid, Pid, Uid};
use users::os::unix::GroupExt;

use super::prelude::*;
use super::settings::Settings;

pub struct UserLocker<'a> {
  settings: &'a Settings,
}

impl<'a> UserLocker<'a> {
  pub fn get(settings: &'a Settings) -> Self {
    Self { settings }
  }

  /// Find a free build user, or a free range of `count` consecutive uids
  /// when `count > 1`. `None` means every candidate is busy and the caller
  /// should retry later.
  pub fn find(&self, count: u32) -> Result<Option<UserLock>> {
    if self.settings.auto_allocate_uids {
      return self.find_free_range(count);
    }

    ensure!(
      count == 1,
      "uid ranges require the auto-allocate-uids setting"
    );

    let group_name = self
      .settings
      .build_users_group
      .as_deref()
      .ok_or_else(|| anyhow!("build users are disabled"))?;

    let gr = users::get_group_by_name(group_name)
      .ok_or_else(|| anyhow!("the group `{}' specified in build-users-group does not exist", group_name))?;
    if gr.members().is_empty() {
      bail!("the build users group `{}' has no members", group_name);
    }
    for m in gr.members() {
      let userinfo = users::get_user_by_name(m).ok_or_else(|| {
        anyhow!(
          "the user {:?} in the group `{}' does not exist",
          m,
          group_name
        )
      })?;
      if let Some(userlock) = FileWriteLock::try_lock(self.pool_file(userinfo.uid()))? {
        // carry the user's real group memberships, so admins can grant
        // access to e.g. "kvm" by group
        let primary = userinfo.primary_group_id();
        let supplementary_gids = users::get_user_groups(userinfo.name(), primary)
          .unwrap_or_default()
          .into_iter()
          .map(|g| g.gid())
          .filter(|gid| *gid != primary)
          .map(Gid::from_raw)
          .collect();
        return Ok(Some(UserLock {
          uid: Uid::from_raw(userinfo.uid()),
          gid: Gid::from_raw(primary),
          count: 1,
          supplementary_gids,
          _lock: userlock,
        }));
      }
    }
    Ok(None)
  }

  fn find_free_range(&self, count: u32) -> Result<Option<UserLock>> {
    ensure!(
      count <= self.settings.uid_pool_size,
      "uid count {} exceeds the configured uid pool of {}",
      count,
      self.settings.uid_pool_size
    );
    let mut uid = self.settings.start_id;
    let end = self.settings.start_id + self.settings.uid_pool_size;
    while uid + count <= end {
      if let Some(lock) = FileWriteLock::try_lock(self.pool_file(uid))? {
        return Ok(Some(UserLock {
          uid: Uid::from_raw(uid),
          // all slots share one nogroup-style gid
          gid: Gid::from_raw(uid),
          count,
          // synthetic uids are in no group database
          supplementary_gids: vec![],
          _lock: lock,
        }));
      }
      uid += count.max(1);
    }
    Ok(None)
  }

  fn pool_file(&self, uid: u32) -> PathBuf {
    self.settings.state_dir.join("userpool").join(uid.to_string())
  }
}

pub struct UserLock {
  uid: Uid,
  gid: Gid,
  count: u32,
  supplementary_gids: Vec<Gid>,
  _lock: FileWriteLock,
}

impl UserLock {
  pub fn uid(&self) -> Uid {
    self.uid
  }

  pub fn gid(&self) -> Gid {
    self.gid
  }

  /// Number of consecutive uids covered, starting at `uid()`. 65536 for
  /// user-namespace ranges, 1 otherwise.
  pub fn uid_count(&self) -> u32 {
    self.count
  }

  pub fn supplementary_gids(&self) -> &[Gid] {
    &self.supplementary_gids
  }

  /// Kill every process running under this lease's primary uid. Must not
  /// be called for uid 0; a root lease would take the whole host with it.
  pub fn kill(&self) -> Result<()> {
    debug!("killing all processes running under uid `{}'", self.uid());

    ensure!(!self.uid().is_root(), "refusing to kill processes as root");

    match unsafe { fork()? } {
      ForkResult::Child => {
        let ok = setuid(self.uid()).is_ok();

        if ok {
          while let Err(errno) = kill(Pid::from_raw(-1), Signal::SIGKILL) {
            if errno == Errno::ESRCH || errno == Errno::EPERM {
              break;
            } else if errno != Errno::EINTR {
              std::process::exit(1);
            }
          }
        }

        std::process::exit(if ok { 0 } else { 1 });
      }
      ForkResult::Parent { child } => match waitpid(child, None) {
        Ok(WaitStatus::Exited(_, _)) => Ok(()),
        Ok(w) => bail!("unusual waitpid() result: {:?}", w),
        Err(e) if e != Errno::EINTR => bail!("cannot get child exit status"),
        Err(e) => Err(e.into()),
      },
    }
  }
}

pub struct FileReadLock {
  _fd: File,
}

impl FileReadLock {
  pub fn try_lock<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
    let path = path.as_ref();
    let file = File::create(path)?;
    if lock_file(file.as_raw_fd(), FlockArg::LockSharedNonblock)? {
      Ok(Some(Self { _fd: file }))
    } else {
      Ok(None)
    }
  }

  pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let file = File::create(path)?;
    lock_file(file.as_raw_fd(), FlockArg::LockShared)?;
    Ok(Self { _fd: file })
  }
}

pub struct FileWriteLock {
  _fd: File,
}

impl FileWriteLock {
  pub fn try_lock<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
    let path = path.as_ref();
    std::fs::create_dir_all(path.parent().expect("path cannot be empty"))?;
    let file =
      File::create(path).with_context(|| format!("while creating path {}", path.display()))?;
    if lock_file(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)? {
      Ok(Some(Self { _fd: file }))
    } else {
      Ok(None)
    }
  }

  pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let file = File::create(path)?;
    lock_file(file.as_raw_fd(), FlockArg::LockExclusive)?;
    Ok(Self { _fd: file })
  }
}

/// Exclusive locks on a set of (not yet existing) store paths, taken via
/// `<path>.lock` siblings. Dropping releases; `set_deletion` additionally
/// removes the lock files.
pub struct PathLocks {
  locks: Vec<(PathBuf, FileWriteLock)>,
  delete_on_release: bool,
}

impl PathLocks {
  pub fn new() -> Self {
    Self {
      locks: vec![],
      delete_on_release: false,
    }
  }

  pub fn set_deletion(&mut self, delete: bool) {
    self.delete_on_release = delete;
  }

  pub fn lock_paths(&mut self, paths: &[PathBuf]) -> Result<()> {
    for p in paths {
      let lock_path = PathBuf::from(format!("{}.lock", p.display()));
      if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
      }
      let lock = FileWriteLock::lock(&lock_path)?;
      self.locks.push((lock_path, lock));
    }
    Ok(())
  }
}

impl Default for PathLocks {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for PathLocks {
  fn drop(&mut self) {
    if self.delete_on_release {
      for (path, _) in &self.locks {
        let _ = std::fs::remove_file(path);
      }
    }
  }
}

fn lock_file(fd: RawFd, ty: FlockArg) -> Result<bool> {
  if let Err(e) = flock(fd, ty) {
    if e == Errno::EWOULDBLOCK {
      Ok(false)
    } else {
      Err(e.into())
    }
  } else {
    Ok(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::settings::Settings;

  #[test]
  fn write_lock_excludes_second_locker() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lockfile");
    let first = FileWriteLock::try_lock(&path).unwrap();
    assert!(first.is_some());
    assert!(FileWriteLock::try_lock(&path).unwrap().is_none());
    drop(first);
    assert!(FileWriteLock::try_lock(&path).unwrap().is_some());
  }

  #[test]
  fn auto_allocated_leases_do_not_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
      auto_allocate_uids: true,
      start_id: 10000,
      uid_pool_size: 4,
      state_dir: dir.path().to_path_buf(),
      ..Default::default()
    };
    let locker = UserLocker::get(&settings);
    let a = locker.find(1).unwrap().unwrap();
    let b = locker.find(1).unwrap().unwrap();
    assert_ne!(a.uid(), b.uid());
    // synthetic uids have no group database entry to inherit from
    assert!(a.supplementary_gids().is_empty());
    let c = locker.find(1).unwrap().unwrap();
    let d = locker.find(1).unwrap().unwrap();
    assert_ne!(c.uid(), d.uid());
    // the pool is exhausted now
    assert!(locker.find(1).unwrap().is_none());
    drop(a);
    assert!(locker.find(1).unwrap().is_some());
  }

  #[test]
  fn uid_range_needs_auto_allocation() {
    let settings = Settings::default();
    let locker = UserLocker::get(&settings);
    assert!(locker.find(65536).is_err());
  }
}
