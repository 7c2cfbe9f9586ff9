//! Executes a single derivation in an isolated environment and installs its
//! declared outputs into the store.
//!
//! The lifecycle is linear: `prepare_build` acquires the build user and
//! decides the sandbox strategy, `start_builder` sets up the scratch tree
//! and spawns the isolated child, and once the caller has observed EOF on
//! the log pipe, `unprepare_build` reaps the child, registers the outputs
//! and tears everything down. Teardown runs on every exit path.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::os::unix::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::pty::{posix_openpt, ptsname, unlockpt};
use nix::sys::signal::{killpg, Signal};
use nix::sys::stat::Mode;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chown, Pid};
use parking_lot::Mutex;
use thiserror::Error;

use crate::canonicalise::UidRange;
use crate::derivation::output_path_name;
use crate::lock::{UserLock, UserLocker};
use crate::prelude::*;
use crate::settings::{BuildMode, SandboxMode, Settings};
use crate::{DerivationOptions, StorePathSet};

cfg_if::cfg_if! {
  if #[cfg(target_os = "linux")] {
    mod cgroup;
    mod linux;
    use self::linux as sys;
  } else if #[cfg(target_os = "macos")] {
    mod macos;
    use self::macos as sys;
  } else {
    compile_error!("derivation builds are not supported on this platform.")
  }
}

mod builtins;
pub mod daemon;
mod env;
mod register;
pub mod rewrite;

pub use daemon::RestrictedStore;

/// How far a known output path has made it into the store already.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathStatus {
  Corrupt,
  Absent,
  Valid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialOutputStatus {
  pub path: StorePath,
  pub status: PathStatus,
}

impl InitialOutputStatus {
  pub fn is_present(&self) -> bool {
    matches!(self.status, PathStatus::Corrupt | PathStatus::Valid)
  }

  pub fn is_valid(&self) -> bool {
    self.status == PathStatus::Valid
  }
}

#[derive(Debug, Clone)]
pub struct InitialOutput {
  pub wanted: bool,
  /// Hash identifying this derivation modulo its own outputs; joined with
  /// the output name it forms the realisation key.
  pub output_hash: Hash,
  pub known: Option<InitialOutputStatus>,
}

/// The realisations of one derivation's outputs, keyed by output name.
pub type SingleDrvOutputs = BTreeMap<String, Realisation>;

/// Back-edges into the scheduler that owns this build.
pub trait DerivationBuilderCallbacks: Send {
  fn open_log_file(&mut self) -> Result<Option<PathBuf>>;
  fn close_log_file(&mut self);
  /// The builder's log pipe; the scheduler drains it until EOF.
  fn child_started(&mut self, fd: RawFd);
  fn child_terminated(&mut self);
  /// Append the tail of the build log to a failure message.
  fn append_log_tail_error_msg(&mut self, msg: &mut String);
  fn note_hash_mismatch(&mut self);
  fn note_check_mismatch(&mut self);
  fn mark_contents_good(&mut self, path: &StorePath);
  /// Check-mode short-circuit: all outputs were already valid.
  fn assert_path_validity(&mut self) -> Result<SingleDrvOutputs>;
}

/// Typed failures raised inside the build core. `unprepare_build` maps them
/// onto [`FailureKind`]s; they never escape as panics.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error("{0}")]
  Config(String),
  #[error("{0}")]
  Spawn(String),
  #[error("while setting up the build environment: {0}")]
  ChildSetup(String),
  #[error("{0}")]
  Rejected(String),
  #[error("{0}")]
  BuilderFailed(String),
  #[error(
    "hash mismatch in fixed-output derivation '{drv}':\n  specified: {specified}\n     got:    \
     {got}"
  )]
  HashMismatch {
    drv: String,
    specified: String,
    got: String,
  },
  #[error("{0}")]
  NotDeterministic(String),
  #[error(
    "cycle detected in build of '{drv}' in the references of output '{output}' from output \
     '{parent}'"
  )]
  ReferenceCycle {
    drv: String,
    output: String,
    parent: String,
  },
  #[error("internal error: {0}")]
  Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
  OutputRejected,
  HashMismatch,
  NotDeterministic,
  ReferenceCycle,
  TransientFailure,
  PermanentFailure,
}

#[derive(Debug)]
pub enum BuildOutcome {
  Success(SingleDrvOutputs),
  Failure(FailureKind, anyhow::Error),
}

/// Everything the scheduler hands over for one build.
pub struct DerivationBuilderParams {
  pub drv_path: StorePath,
  pub drv: Derivation,
  pub options: DerivationOptions,
  pub input_paths: StorePathSet,
  pub initial_outputs: HashMap<String, InitialOutput>,
  pub build_mode: BuildMode,
  /// A user lease carried over from a previous attempt, if any.
  pub build_user: Option<UserLock>,
}

#[derive(Debug, Clone)]
pub(crate) struct ChrootPath {
  pub path: PathBuf,
  pub optional: bool,
}

/// Pieces of the live sandbox that the recursive daemon needs to reach from
/// its worker threads.
#[derive(Default)]
pub(crate) struct SandboxState {
  pub use_chroot: bool,
  pub chroot_root: Option<PathBuf>,
  pub using_user_namespace: bool,
  /// Saved namespace fds of the child, pre-pivot; `add_dependency` re-enters
  /// them from a helper process.
  pub mount_ns: Option<File>,
  pub user_ns: Option<File>,
}

pub struct DerivationBuilder {
  pub(crate) store: Arc<dyn Store>,
  pub(crate) settings: Arc<Settings>,
  pub(crate) callbacks: Box<dyn DerivationBuilderCallbacks>,

  pub(crate) drv_path: StorePath,
  pub(crate) drv: Derivation,
  pub(crate) options: DerivationOptions,
  pub(crate) input_paths: Arc<StorePathSet>,
  pub(crate) initial_outputs: HashMap<String, InitialOutput>,
  pub(crate) build_mode: BuildMode,

  pub(crate) build_user: Option<UserLock>,
  pub(crate) use_chroot: bool,
  pub(crate) cgroup: Option<PathBuf>,
  pub(crate) top_tmp_dir: Option<PathBuf>,
  pub(crate) tmp_dir: Option<PathBuf>,
  pub(crate) tmp_dir_in_sandbox: PathBuf,
  pub(crate) paths_in_chroot: HashMap<PathBuf, ChrootPath>,
  pub(crate) env: HashMap<String, String>,
  pub(crate) input_rewrites: HashMap<String, String>,
  pub(crate) output_rewrites: HashMap<String, String>,
  pub(crate) redirected_outputs: BTreeMap<StorePath, StorePath>,
  pub(crate) scratch_outputs: BTreeMap<String, StorePath>,
  pub(crate) pid: Option<Pid>,
  pub(crate) builder_out: Option<File>,

  pub(crate) sandbox: Arc<Mutex<SandboxState>>,
  pub(crate) added_paths: Arc<Mutex<StorePathSet>>,
  pub(crate) added_drv_outputs: Arc<Mutex<HashSet<DrvOutput>>>,
  pub(crate) daemon: Option<daemon::Daemon>,
}

const HOME_DIR: &str = "/homeless-shelter";

impl DerivationBuilder {
  pub fn new(
    store: Arc<dyn Store>,
    settings: Arc<Settings>,
    callbacks: Box<dyn DerivationBuilderCallbacks>,
    params: DerivationBuilderParams,
  ) -> Self {
    Self {
      store,
      settings,
      callbacks,
      drv_path: params.drv_path,
      drv: params.drv,
      options: params.options,
      input_paths: Arc::new(params.input_paths),
      initial_outputs: params.initial_outputs,
      build_mode: params.build_mode,
      build_user: params.build_user,
      use_chroot: false,
      cgroup: None,
      top_tmp_dir: None,
      tmp_dir: None,
      tmp_dir_in_sandbox: PathBuf::new(),
      paths_in_chroot: Default::default(),
      env: Default::default(),
      input_rewrites: Default::default(),
      output_rewrites: Default::default(),
      redirected_outputs: Default::default(),
      scratch_outputs: Default::default(),
      pid: None,
      builder_out: None,
      sandbox: Default::default(),
      added_paths: Default::default(),
      added_drv_outputs: Default::default(),
      daemon: None,
    }
  }

  /// Decide the sandbox strategy and acquire a build user. `Ok(false)`
  /// means every candidate uid is busy; the caller should back off and call
  /// again. Anything else that goes wrong here is a configuration problem.
  pub fn prepare_build(&mut self) -> Result<bool> {
    if self.drv.outputs.is_empty() {
      return Err(
        BuildError::Config(format!(
          "derivation '{}' declares no outputs",
          self.store.print_store_path(&self.drv_path)
        ))
        .into(),
      );
    }

    if !self.options.can_build_locally(&self.settings, &self.drv) {
      // aarch64-darwin can still run x86_64-darwin recipes through Rosetta
      if self.drv.platform == "x86_64-darwin" && self.settings.system == "aarch64-darwin" {
        return Err(
          BuildError::Config(format!(
            "run `/usr/sbin/softwareupdate --install-rosetta' to let this {} build {}",
            self.settings.system, self.drv.platform
          ))
          .into(),
        );
      }
      return Err(
        BuildError::Config(format!(
          "a '{}' with features {{{}}} is required to build '{}', but I am a '{}' with features \
           {{{}}}",
          self.drv.platform,
          itertools_join(self.options.required_system_features.iter()),
          self.store.print_store_path(&self.drv_path),
          self.settings.system,
          itertools_join(self.settings.system_features.iter()),
        ))
        .into(),
      );
    }

    self.use_chroot = match self.settings.sandbox_mode {
      SandboxMode::On => {
        if self.options.no_chroot {
          return Err(
            BuildError::Config(format!(
              "derivation '{}' has '__noChroot' set, but that's not allowed when sandboxing is \
               enforced",
              self.store.print_store_path(&self.drv_path)
            ))
            .into(),
          );
        }
        #[cfg(target_os = "macos")]
        if !self.options.additional_sandbox_profile.is_empty() {
          return Err(
            BuildError::Config(format!(
              "derivation '{}' specifies a sandbox profile, but this is only allowed when \
               sandboxing is relaxed",
              self.store.print_store_path(&self.drv_path)
            ))
            .into(),
          );
        }
        true
      }
      SandboxMode::Off => false,
      SandboxMode::Relaxed => self.drv.is_sandboxed() && !self.options.no_chroot,
    };

    if self.store.store_path() != self.store.real_store_dir() {
      if cfg!(target_os = "linux") {
        self.use_chroot = true;
      } else {
        return Err(
          BuildError::Config("building using a diverted store is not supported on this platform".into())
            .into(),
        );
      }
    }

    #[cfg(target_os = "linux")]
    if self.use_chroot && !sys::namespaces_supported() {
      if !self.settings.sandbox_fallback {
        return Err(
          BuildError::Config(
            "this system does not support the kernel namespaces that are required for sandboxing"
              .into(),
          )
          .into(),
        );
      }
      debug!("auto-disabling sandboxing because the prerequisite namespaces are not available");
      self.use_chroot = false;
    }

    if self.settings.use_build_users() && self.build_user.is_none() {
      let count = if self.options.use_uid_range(&self.drv) {
        65536
      } else {
        1
      };
      self.build_user = UserLocker::get(&self.settings)
        .find(count)
        .map_err(|e| BuildError::Config(format!("{:#}", e)))?;
      if self.build_user.is_none() {
        return Ok(false);
      }
    }

    Ok(true)
  }

  /// Whether valid output paths must be hidden via hash rewriting rather
  /// than private mounts.
  pub(crate) fn needs_hash_rewrite(&self) -> bool {
    if cfg!(target_os = "linux") {
      !self.use_chroot
    } else {
      true
    }
  }

  pub(crate) fn sandbox_uid(&self) -> u32 {
    let user_ns = self.sandbox.lock().using_user_namespace;
    match (&self.build_user, user_ns) {
      (Some(u), true) if u.uid_count() != 1 => 0,
      (_, true) => 1000,
      (Some(u), false) => u.uid().as_raw(),
      (None, false) => nix::unistd::getuid().as_raw(),
    }
  }

  pub(crate) fn sandbox_gid(&self) -> u32 {
    let user_ns = self.sandbox.lock().using_user_namespace;
    match (&self.build_user, user_ns) {
      (Some(u), true) if u.uid_count() != 1 => 0,
      (_, true) => 100,
      (Some(u), false) => u.gid().as_raw(),
      (None, false) => nix::unistd::getgid().as_raw(),
    }
  }

  pub(crate) fn fallback_from_output(&self, output_name: &str) -> Result<StorePath> {
    // a synthetic path type that cannot collide with any real store path
    self.store.make_store_path(
      &format!("rewrite:{}:name:{}", self.drv_path, output_name),
      Hash::zeroes(HashType::SHA256),
      &output_path_name(&self.drv.name, output_name),
    )
  }

  pub(crate) fn fallback_from_path(&self, path: &StorePath) -> Result<StorePath> {
    self.store.make_store_path(
      &format!("rewrite:{}:{}", self.drv_path, path),
      Hash::zeroes(HashType::SHA256),
      path.name(),
    )
  }

  pub(crate) fn chown_to_builder<P: AsRef<Path>>(&self, path: P) -> Result<()> {
    let user = match &self.build_user {
      Some(u) => u,
      None => return Ok(()),
    };
    let path = path.as_ref();
    chown(path, Some(user.uid()), Some(user.gid())).with_context(|| {
      format!(
        "unable to chown `{}' to uid:gid {}:{}",
        path.display(),
        user.uid(),
        user.gid()
      )
    })
  }

  /// Pick the path each output is materialized at during the build, per the
  /// planning table, and install the placeholder and hash rewrites.
  pub(crate) fn plan_scratch_outputs(&mut self) -> Result<()> {
    let needs_rewrite = self.needs_hash_rewrite();
    for (output_name, status) in self.initial_outputs.clone() {
      let scratch_path = match &status.known {
        None => self.fallback_from_output(&output_name)?,
        Some(k) => {
          if use_final_path(needs_rewrite, self.build_mode, k) {
            k.path.clone()
          } else {
            self.fallback_from_path(&k.path)?
          }
        }
      };

      self.input_rewrites.insert(
        Hash::placeholder(&output_name),
        self.store.print_store_path(&scratch_path),
      );
      self
        .scratch_outputs
        .insert(output_name.clone(), scratch_path.clone());

      let fixed_final_path = match status.known {
        None => continue,
        Some(k) => k.path,
      };

      if fixed_final_path == scratch_path {
        continue;
      }

      // the scratch location must be ours alone
      rm_rf::ensure_removed(self.store.to_real_path(&scratch_path))?;

      self
        .input_rewrites
        .insert(fixed_final_path.hash_part(), scratch_path.hash_part());

      self.redirected_outputs.insert(fixed_final_path, scratch_path);
    }
    Ok(())
  }

  /// Set up the scratch tree and spawn the builder. On return the child is
  /// alive and has reported sandbox-setup-complete.
  pub fn start_builder(&mut self) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
      let wants_cgroup =
        self.settings.use_cgroups || self.build_user.as_ref().map_or(false, |u| u.uid_count() != 1);
      if wants_cgroup {
        self.cgroup = Some(cgroup::prepare_cgroup(&self.settings, self.build_user.as_ref())?);
      }
    }
    #[cfg(not(target_os = "linux"))]
    {
      if self.build_user.as_ref().map_or(false, |u| u.uid_count() != 1) {
        return Err(BuildError::Config("cgroups are not supported on this platform".into()).into());
      }
    }

    // no process may survive from an earlier lease of this uid
    self.kill_sandbox(false)?;

    let top_tmp_dir = tempfile::Builder::new()
      .prefix(&format!("silo-build-{}-", self.drv_path.name()))
      .tempdir_in(
        self
          .settings
          .build_dir
          .clone()
          .unwrap_or_else(std::env::temp_dir),
      )?
      .into_path();
    let tmp_dir = if cfg!(target_os = "linux") && self.use_chroot {
      // an inaccessible root-owned parent keeps other users out
      let inner = top_tmp_dir.join("build");
      fs::create_dir(&inner)?;
      inner
    } else {
      top_tmp_dir.clone()
    };
    self.chown_to_builder(&tmp_dir)?;
    self.top_tmp_dir = Some(top_tmp_dir);
    self.tmp_dir = Some(tmp_dir.clone());

    self.tmp_dir_in_sandbox = if cfg!(target_os = "linux") && self.use_chroot {
      self.settings.sandbox_build_dir.clone()
    } else {
      tmp_dir
    };

    self.plan_scratch_outputs()?;

    self.init_env()?;
    self.write_structured_attrs()?;
    self.export_references_graphs()?;

    if self.use_chroot {
      self.plan_chroot_paths()?;
    } else if self.options.use_uid_range(&self.drv) {
      return Err(
        BuildError::Config("feature 'uid-range' is only supported in sandboxed builds".into()).into(),
      );
    }

    if self.needs_hash_rewrite() && Path::new(HOME_DIR).exists() {
      bail!(
        "home directory '{}' exists; please remove it to assure purity of builds without \
         sandboxing",
        HOME_DIR
      );
    }

    if self.options.wants_recursive_daemon() {
      self.start_daemon()?;
    }

    info!("executing builder {}", self.drv.builder.display());

    let _log_file = self.callbacks.open_log_file()?;

    // a pseudoterminal carries the builder's output back to us
    let builder_read = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
      .map_err(|e| BuildError::Spawn(format!("opening pseudoterminal master: {}", e)))?;
    let slave_name = unsafe { ptsname(&builder_read) }
      .map_err(|e| BuildError::Spawn(format!("getting pseudoterminal name: {}", e)))?;

    if let Some(user) = &self.build_user {
      chmod_path(Path::new(&slave_name), 0o600)?;
      chown(Path::new(&slave_name), Some(user.uid()), None)?;
    }

    unlockpt(&builder_read).map_err(|e| BuildError::Spawn(format!("unlocking pseudoterminal: {}", e)))?;

    let builder_write = open(Path::new(&slave_name), OFlag::O_RDWR | OFlag::O_NOCTTY, Mode::empty())
      .map_err(|e| BuildError::Spawn(format!("opening pseudoterminal slave: {}", e)))?;

    // raw mode, so \n doesn't come back as \r\n
    let mut term = tcgetattr(builder_write)?;
    cfmakeraw(&mut term);
    tcsetattr(builder_write, SetArg::TCSANOW, &term)?;

    let master_fd = builder_read.as_raw_fd();
    let master: File = unsafe { File::from_raw_fd(builder_read.into_raw_fd()) };
    self.builder_out = Some(master);

    sys::spawn(self, builder_write)?;

    let _ = nix::unistd::close(builder_write);

    self.callbacks.child_started(master_fd);

    self.process_sandbox_setup_messages()
  }

  /// Read the sandbox-setup frames off the log pipe: `\2` means the child
  /// is about to exec, `\1` carries a serialized setup error, anything else
  /// is a debug line.
  pub(crate) fn process_sandbox_setup_messages(&mut self) -> Result<()> {
    let master = self
      .builder_out
      .as_ref()
      .ok_or_else(|| BuildError::Internal("no builder pipe".into()))?
      .try_clone()?;
    let mut reader = BufReader::new(master);
    let mut msgs: Vec<String> = vec![];

    loop {
      let mut line = String::new();
      match reader.read_line(&mut line) {
        Ok(0) | Err(_) => {
          let status = self.pid.map(wait_for_exit);
          return Err(
            BuildError::Spawn(format!(
              "while waiting for the build environment for '{}' to initialize ({:?}, previous \
               messages: {})",
              self.store.print_store_path(&self.drv_path),
              status,
              msgs.join("|")
            ))
            .into(),
          );
        }
        Ok(_) => {}
      }
      let trimmed = line.trim_end_matches(['\r', '\n'].as_ref());
      if trimmed.starts_with('\u{2}') {
        return Ok(());
      }
      if let Some(len) = trimmed.strip_prefix('\u{1}') {
        // length-prefixed error payload follows
        let len: usize = len.trim().parse().unwrap_or(0);
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        return Err(BuildError::ChildSetup(String::from_utf8_lossy(&buf).into_owned()).into());
      }
      debug!("sandbox setup: {}", trimmed);
      msgs.push(trimmed.to_string());
    }
  }

  /// Tear down after the builder exited (or was killed): reap, kill
  /// stragglers, stop the daemon, then either register outputs or classify
  /// the failure. The build user is released last, after every file it owns
  /// has been moved.
  pub fn unprepare_build(mut self) -> Result<BuildOutcome> {
    let res = self.unprepare_inner();
    // dropping the lease after all chowns/moves keeps the uid from being
    // reused while our files still belong to it
    self.build_user.take();
    res
  }

  fn unprepare_inner(&mut self) -> Result<BuildOutcome> {
    {
      let mut sb = self.sandbox.lock();
      sb.mount_ns = None;
      sb.user_ns = None;
    }

    // EOF on the log pipe usually means the builder is gone; kill to be sure
    let status = match self.pid.take() {
      Some(pid) => kill_and_reap(pid),
      None => WaitStatus::Exited(Pid::from_raw(0), 1),
    };

    debug!(
      "builder process for '{}' finished",
      self.store.print_store_path(&self.drv_path)
    );

    self.callbacks.child_terminated();
    self.builder_out = None;
    self.callbacks.close_log_file();

    // processes under the build uid could still hold our outputs open
    if let Err(e) = self.kill_sandbox(true) {
      warn!("killing sandbox processes: {:#}", e);
    }

    self.stop_daemon();

    let status_ok = matches!(status, WaitStatus::Exited(_, 0));
    let mut disk_full = false;

    let res: Result<SingleDrvOutputs> = if !status_ok {
      disk_full = self.cleanup_decide_whether_disk_full();

      let mut msg = format!(
        "Cannot build '{}'.\nReason: builder {}.",
        self.store.print_store_path(&self.drv_path),
        status_to_string(status)
      );
      msg.push_str(&self.show_known_outputs());
      self.callbacks.append_log_tail_error_msg(&mut msg);
      if disk_full {
        msg.push_str("\nnote: build failure may have been caused by lack of free disk space");
      }
      Err(BuildError::BuilderFailed(msg).into())
    } else {
      self.register_outputs()
    };

    match res {
      Ok(built_outputs) => {
        // the tails of redirected outputs are dead weight now
        for scratch in self.redirected_outputs.values() {
          let _ = rm_rf::ensure_removed(self.store.to_real_path(scratch));
        }

        self.delete_chroot();
        self.delete_tmp_dir(true);

        Ok(BuildOutcome::Success(built_outputs))
      }
      Err(e) => {
        // retention of the temp tree is keep-failed's call; the chroot
        // never survives
        self.delete_tmp_dir(false);
        self.delete_chroot();
        let kind = classify_failure(&e, status_ok, self.drv.is_sandboxed(), disk_full);
        Ok(BuildOutcome::Failure(kind, e))
      }
    }
  }

  fn show_known_outputs(&self) -> String {
    let mut s = String::new();
    for (name, st) in &self.initial_outputs {
      if let Some(known) = &st.known {
        s.push_str(&format!(
          "\n  output '{}' at '{}'",
          name,
          self.store.print_store_path(&known.path)
        ));
      }
    }
    s
  }

  /// Infer whether the failure was likely ENOSPC: any relevant filesystem
  /// with under 8 MiB free taints the classification. Also moves failed
  /// outputs out of the chroot for inspection and deletes the temp tree.
  fn cleanup_decide_whether_disk_full(&mut self) -> bool {
    let mut disk_full = false;

    const REQUIRED: u64 = 8 * 1024 * 1024;
    for dir in [
      Some(self.store.real_store_dir().to_path_buf()),
      self.tmp_dir.clone(),
    ]
    .iter()
    .flatten()
    {
      if let Ok(st) = nix::sys::statvfs::statvfs(dir.as_path()) {
        if (st.blocks_available() as u64) * (st.fragment_size() as u64) < REQUIRED {
          disk_full = true;
        }
      }
    }

    self.delete_tmp_dir(false);

    // move the half-built outputs out of the chroot so they can be examined
    let chroot_root = self.sandbox.lock().chroot_root.clone();
    if let Some(chroot_root) = chroot_root {
      if self.build_mode == BuildMode::Normal {
        for status in self.initial_outputs.values() {
          let known = match &status.known {
            Some(k) if !k.is_valid() => k,
            _ => continue,
          };
          let p = self.store.to_real_path(&known.path);
          let inside = chroot_root.append(&p);
          if inside.exists() {
            let _ = fs::rename(&inside, &p);
          }
        }
      }
    }

    disk_full
  }

  fn delete_chroot(&mut self) {
    let chroot_root = self.sandbox.lock().chroot_root.take();
    if let Some(dir) = chroot_root {
      // the parent <drv>.chroot dir is removed along with /root inside it
      let parent = dir.parent().map(|p| p.to_path_buf()).unwrap_or(dir);
      if let Err(e) = rm_rf::ensure_removed(&parent) {
        warn!("cannot remove chroot directory `{}': {}", parent.display(), e);
      }
    }
  }

  /// Remove the temp tree; with `force` false and keep-failed configured it
  /// survives (opened up for inspection), except for builtins which may
  /// have written credentials into it.
  pub fn delete_tmp_dir(&mut self, force: bool) {
    let top = match self.top_tmp_dir.take() {
      Some(t) => t,
      None => return,
    };
    let tmp = self.tmp_dir.take().unwrap_or_else(|| top.clone());

    if self.settings.keep_failed && !force && !self.drv.is_builtin() {
      warn!("note: keeping build directory '{}'", tmp.display());
      let _ = chmod_path(&top, 0o755);
      let _ = chmod_path(&tmp, 0o755);
    } else if let Err(e) = rm_rf::ensure_removed(&top) {
      warn!("cannot remove build directory `{}': {}", top.display(), e);
    }
  }

  /// Kill whatever is still running in the build's cgroup or under the
  /// build uid. Idempotent; called both before spawning and during
  /// teardown.
  pub fn kill_sandbox(&mut self, get_stats: bool) -> Result<()> {
    if let Some(cg) = &self.cgroup {
      #[cfg(target_os = "linux")]
      {
        let stats = cgroup::destroy_cgroup(cg)?;
        if get_stats {
          debug!(
            "build consumed {:?} user cpu, {:?} system cpu",
            stats.cpu_user, stats.cpu_system
          );
        }
        return Ok(());
      }
      #[cfg(not(target_os = "linux"))]
      {
        let _ = (cg, get_stats);
        return Err(BuildError::Internal("cgroup on non-linux host".into()).into());
      }
    }

    if let Some(user) = &self.build_user {
      user.kill()?;
    }
    Ok(())
  }

  pub(crate) fn uid_range(&self) -> Option<UidRange> {
    self.build_user.as_ref().map(|u| UidRange {
      first: u.uid().as_raw(),
      count: u.uid_count(),
    })
  }

  pub(crate) fn to_real_path_chroot(&self, path: &StorePath) -> PathBuf {
    let printed = self.store.print_store_path(path);
    let chroot_root = self.sandbox.lock().chroot_root.clone();
    match chroot_root {
      Some(root) if self.use_chroot && !self.needs_hash_rewrite() => root.append(printed),
      _ => self.store.to_real_path(path),
    }
  }
}

/// First matching row of the scratch-path table wins; `true` means the
/// final path itself is safe to build into.
pub(crate) fn use_final_path(
  needs_hash_rewrite: bool,
  build_mode: BuildMode,
  known: &InitialOutputStatus,
) -> bool {
  if !needs_hash_rewrite {
    // private mounts hide any pre-existing copy
    true
  } else if !known.is_present() {
    true
  } else if build_mode != BuildMode::Repair && !known.is_valid() {
    // the stale copy will be deleted before the build
    true
  } else {
    false
  }
}

pub(crate) fn classify_failure(
  e: &anyhow::Error,
  status_ok: bool,
  sandboxed: bool,
  disk_full: bool,
) -> FailureKind {
  match e.downcast_ref::<BuildError>() {
    Some(BuildError::NotDeterministic(_)) => FailureKind::NotDeterministic,
    Some(BuildError::HashMismatch { .. }) => FailureKind::HashMismatch,
    Some(BuildError::ReferenceCycle { .. }) => FailureKind::ReferenceCycle,
    _ if status_ok => FailureKind::OutputRejected,
    _ if !sandboxed || disk_full => FailureKind::TransientFailure,
    _ => FailureKind::PermanentFailure,
  }
}

pub(crate) fn chmod_path(path: &Path, mode: u32) -> Result<()> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, fs::Permissions::from_mode(mode))
    .with_context(|| format!("setting permissions on `{}'", path.display()))
}

fn kill_and_reap(pid: Pid) -> WaitStatus {
  // the child leads its own process group, so take the group down with it
  let _ = killpg(pid, Signal::SIGKILL);
  let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
  wait_for_exit(pid)
}

fn wait_for_exit(pid: Pid) -> WaitStatus {
  loop {
    match waitpid(pid, None) {
      Ok(WaitStatus::StillAlive) => continue,
      Ok(st @ WaitStatus::Exited(..)) | Ok(st @ WaitStatus::Signaled(..)) => return st,
      Ok(_) => continue,
      Err(Errno::EINTR) => continue,
      Err(_) => return WaitStatus::Exited(pid, 255),
    }
  }
}

pub(crate) fn status_to_string(status: WaitStatus) -> String {
  match status {
    WaitStatus::Exited(_, 0) => "succeeded".into(),
    WaitStatus::Exited(_, code) => format!("failed with exit code {}", code),
    WaitStatus::Signaled(_, sig, _) => format!("failed due to signal {}", sig),
    other => format!("died abnormally ({:?})", other),
  }
}

fn itertools_join<'a, I: Iterator<Item = &'a String>>(iter: I) -> String {
  iter.map(|x| x.as_str()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{LocalStore, Output};

  struct NoopCallbacks;

  impl DerivationBuilderCallbacks for NoopCallbacks {
    fn open_log_file(&mut self) -> Result<Option<PathBuf>> {
      Ok(None)
    }

    fn close_log_file(&mut self) {}

    fn child_started(&mut self, _fd: RawFd) {}

    fn child_terminated(&mut self) {}

    fn append_log_tail_error_msg(&mut self, _msg: &mut String) {}

    fn note_hash_mismatch(&mut self) {}

    fn note_check_mismatch(&mut self) {}

    fn mark_contents_good(&mut self, _path: &StorePath) {}

    fn assert_path_validity(&mut self) -> Result<SingleDrvOutputs> {
      Ok(Default::default())
    }
  }

  fn test_settings() -> Settings {
    Settings {
      build_users_group: None,
      sandbox_mode: SandboxMode::Off,
      ..Default::default()
    }
  }

  fn test_builder(drv: Derivation, settings: Settings) -> (tempfile::TempDir, DerivationBuilder) {
    let dir = tempfile::tempdir().unwrap();
    let settings = Arc::new(settings);
    let store: Arc<dyn Store> = Arc::new(
      LocalStore::open_at(dir.path().join("silo"), Arc::clone(&settings)).unwrap(),
    );
    let drv_path = store
      .make_store_path(
        "text",
        Hash::hash(&drv.name, HashType::SHA256),
        &format!("{}.drv", drv.name),
      )
      .unwrap();
    let initial_outputs = drv
      .outputs
      .iter()
      .map(|(name, out)| {
        let known = match out {
          Output::InputAddressed(p) => Some(InitialOutputStatus {
            path: p.clone(),
            status: PathStatus::Absent,
          }),
          _ => None,
        };
        (
          name.clone(),
          InitialOutput {
            wanted: true,
            output_hash: Hash::hash(&drv.name, HashType::SHA256),
            known,
          },
        )
      })
      .collect();
    let options = crate::DerivationOptions::from_env(&drv);
    let builder = DerivationBuilder::new(
      store,
      settings,
      Box::new(NoopCallbacks),
      DerivationBuilderParams {
        drv_path,
        drv,
        options,
        input_paths: Default::default(),
        initial_outputs,
        build_mode: BuildMode::Normal,
        build_user: None,
      },
    );
    (dir, builder)
  }

  fn floating_drv() -> Derivation {
    let mut drv = Derivation {
      name: "demo".into(),
      builder: PathBuf::from("/bin/sh"),
      platform: Settings::default().system,
      ..Default::default()
    };
    drv.ty = crate::DerivationType::Floating;
    drv.outputs.insert(
      "out".into(),
      Output::Floating(crate::FileIngestionMethod::Recursive, HashType::SHA256),
    );
    drv
  }

  #[test]
  fn zero_outputs_is_a_config_error() {
    let mut drv = floating_drv();
    drv.outputs.clear();
    let (_dir, mut builder) = test_builder(drv, test_settings());
    let err = builder.prepare_build().unwrap_err();
    assert!(matches!(
      err.downcast_ref::<BuildError>(),
      Some(BuildError::Config(_))
    ));
  }

  #[test]
  fn platform_mismatch_is_a_config_error() {
    let mut drv = floating_drv();
    drv.platform = "vax-ultrix".into();
    let (_dir, mut builder) = test_builder(drv, test_settings());
    let err = builder.prepare_build().unwrap_err();
    assert!(matches!(
      err.downcast_ref::<BuildError>(),
      Some(BuildError::Config(_))
    ));
  }

  #[test]
  fn no_chroot_is_rejected_when_sandboxing_is_enforced() {
    let mut drv = floating_drv();
    drv.env.insert("__noChroot".into(), "1".into());
    let settings = Settings {
      build_users_group: None,
      sandbox_mode: SandboxMode::On,
      ..Default::default()
    };
    let (_dir, mut builder) = test_builder(drv, settings);
    assert!(builder.prepare_build().is_err());
  }

  #[test]
  fn prepare_succeeds_without_build_users() {
    let (_dir, mut builder) = test_builder(floating_drv(), test_settings());
    assert!(builder.prepare_build().unwrap());
    assert!(builder.build_user.is_none());
    assert!(!builder.use_chroot);
  }

  #[test]
  fn floating_outputs_get_fallback_scratch_paths() {
    let (_dir, mut builder) = test_builder(floating_drv(), test_settings());
    builder.prepare_build().unwrap();
    builder.plan_scratch_outputs().unwrap();

    let scratch = &builder.scratch_outputs["out"];
    // the synthetic path keeps the output's name but a made-up hash
    assert_eq!(scratch.name(), "demo");
    assert_eq!(
      *scratch,
      builder.fallback_from_output("out").unwrap(),
      "fallback paths are deterministic"
    );

    // the placeholder now points at the scratch location
    let placeholder = Hash::placeholder("out");
    assert_eq!(
      builder.input_rewrites[&placeholder],
      builder.store.print_store_path(scratch)
    );
  }

  #[test]
  fn fallback_paths_do_not_collide_across_outputs() {
    let (_dir, builder) = test_builder(floating_drv(), test_settings());
    let a = builder.fallback_from_output("out").unwrap();
    let b = builder.fallback_from_output("dev").unwrap();
    assert_ne!(a.hash_part(), b.hash_part());
  }

  #[test]
  fn valid_output_is_redirected_when_rewriting() {
    let final_path = StorePath::from_base_name("31w1qcvb3j8fgjvcqkrpxxwwlfx0ydcg-demo").unwrap();
    let mut drv = floating_drv();
    drv.ty = crate::DerivationType::InputAddressed;
    drv
      .outputs
      .insert("out".into(), Output::InputAddressed(final_path.clone()));

    let (_dir, mut builder) = test_builder(drv, test_settings());
    builder.prepare_build().unwrap();
    builder
      .initial_outputs
      .get_mut("out")
      .unwrap()
      .known
      .as_mut()
      .unwrap()
      .status = PathStatus::Valid;
    builder.plan_scratch_outputs().unwrap();

    let scratch = builder.scratch_outputs["out"].clone();
    assert_ne!(scratch, final_path);
    // both rewrite directions are on file
    assert_eq!(
      builder.input_rewrites[&final_path.hash_part()],
      scratch.hash_part()
    );
    assert_eq!(builder.redirected_outputs[&final_path], scratch);
  }

  #[test]
  fn environment_covers_the_builder_protocol() {
    let mut drv = floating_drv();
    drv.env.insert("myAttr".into(), "value".into());
    let (_dir, mut builder) = test_builder(drv, test_settings());
    builder.prepare_build().unwrap();

    let tmp = tempfile::tempdir().unwrap();
    builder.tmp_dir = Some(tmp.path().to_path_buf());
    builder.top_tmp_dir = Some(tmp.path().to_path_buf());
    builder.tmp_dir_in_sandbox = tmp.path().to_path_buf();
    builder.plan_scratch_outputs().unwrap();
    builder.init_env().unwrap();

    let env = &builder.env;
    assert_eq!(env["PATH"], "/path-not-set");
    assert_eq!(env["HOME"], "/homeless-shelter");
    assert_eq!(env["NIX_LOG_FD"], "2");
    assert_eq!(env["TERM"], "xterm-256color");
    assert_eq!(env["NIX_BUILD_CORES"], builder.settings.build_cores.to_string());
    assert_eq!(env["NIX_STORE"], builder.store.store_path().display().to_string());
    for var in &["NIX_BUILD_TOP", "TMPDIR", "TEMPDIR", "TMP", "TEMP", "PWD"] {
      assert_eq!(env[*var], tmp.path().display().to_string());
    }
    assert_eq!(env["myAttr"], "value");
    // floating is sandboxed, so no output-checked flag
    assert!(!env.contains_key("NIX_OUTPUT_CHECKED"));
  }

  #[test]
  fn fixed_output_recipes_see_the_checked_flag_and_impure_vars() {
    let mut drv = floating_drv();
    drv.ty = crate::DerivationType::Fixed;
    drv.outputs.clear();
    drv.outputs.insert(
      "out".into(),
      Output::Fixed(crate::derivation::FixedOutputHash {
        method: crate::FileIngestionMethod::Flat,
        hash: Hash::hash("x", HashType::SHA256),
      }),
    );
    drv.env.insert("impureEnvVars".into(), "http_proxy".into());

    let mut settings = test_settings();
    settings
      .impure_env
      .insert("http_proxy".into(), "http://proxy.example".into());

    let (_dir, mut builder) = test_builder(drv, settings);
    builder.prepare_build().unwrap();

    let tmp = tempfile::tempdir().unwrap();
    builder.tmp_dir = Some(tmp.path().to_path_buf());
    builder.top_tmp_dir = Some(tmp.path().to_path_buf());
    builder.tmp_dir_in_sandbox = tmp.path().to_path_buf();
    builder.plan_scratch_outputs().unwrap();
    builder.init_env().unwrap();

    assert_eq!(builder.env["NIX_OUTPUT_CHECKED"], "1");
    assert_eq!(builder.env["http_proxy"], "http://proxy.example");
  }

  fn known(status: PathStatus) -> InitialOutputStatus {
    InitialOutputStatus {
      path: StorePath::from_base_name("31w1qcvb3j8fgjvcqkrpxxwwlfx0ydcg-foo").unwrap(),
      status,
    }
  }

  #[test]
  fn scratch_table_prefers_final_path_in_sandbox() {
    // no hash rewriting: always the final path, even when valid
    assert!(use_final_path(false, BuildMode::Normal, &known(PathStatus::Valid)));
    assert!(use_final_path(false, BuildMode::Repair, &known(PathStatus::Valid)));
  }

  #[test]
  fn scratch_table_uses_fallback_for_live_paths() {
    // a valid path can't be overwritten while hash rewriting
    assert!(!use_final_path(true, BuildMode::Normal, &known(PathStatus::Valid)));
    // absent: nothing to protect
    assert!(use_final_path(true, BuildMode::Normal, &known(PathStatus::Absent)));
    // corrupt copies get deleted unless we're repairing
    assert!(use_final_path(true, BuildMode::Normal, &known(PathStatus::Corrupt)));
    assert!(!use_final_path(true, BuildMode::Repair, &known(PathStatus::Corrupt)));
  }

  #[test]
  fn classification_matrix() {
    let rejected: anyhow::Error = BuildError::Rejected("nope".into()).into();
    assert_eq!(classify_failure(&rejected, true, true, false), FailureKind::OutputRejected);

    let failed: anyhow::Error = BuildError::BuilderFailed("boom".into()).into();
    assert_eq!(
      classify_failure(&failed, false, true, false),
      FailureKind::PermanentFailure
    );
    // low disk space makes it transient
    assert_eq!(classify_failure(&failed, false, true, true), FailureKind::TransientFailure);
    // non-sandboxed (network-facing) failures are always worth retrying
    assert_eq!(
      classify_failure(&failed, false, false, false),
      FailureKind::TransientFailure
    );

    let hm: anyhow::Error = BuildError::HashMismatch {
      drv: "d".into(),
      specified: "a".into(),
      got: "b".into(),
    }
    .into();
    assert_eq!(classify_failure(&hm, true, false, false), FailureKind::HashMismatch);

    let cycle: anyhow::Error = BuildError::ReferenceCycle {
      drv: "d".into(),
      output: "out".into(),
      parent: "dev".into(),
    }
    .into();
    assert_eq!(classify_failure(&cycle, true, true, false), FailureKind::ReferenceCycle);

    let nd: anyhow::Error = BuildError::NotDeterministic("differs".into()).into();
    assert_eq!(classify_failure(&nd, true, true, false), FailureKind::NotDeterministic);
  }
}
