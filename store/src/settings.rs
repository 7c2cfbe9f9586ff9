use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SandboxMode {
  On,
  Off,
  Relaxed,
}

impl Default for SandboxMode {
  #[cfg(target_os = "linux")]
  fn default() -> Self {
    Self::On
  }

  #[cfg(not(target_os = "linux"))]
  fn default() -> Self {
    Self::Off
  }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BuildMode {
  Normal,
  Repair,
  Check,
}

impl Default for BuildMode {
  fn default() -> Self {
    Self::Normal
  }
}

/// All host-level knobs the builder consults, passed explicitly to each
/// build rather than read from process-wide state. The only mutable field
/// is the cgroup counter, which disambiguates cgroups of concurrent
/// userless builds in one process.
#[derive(Debug)]
pub struct Settings {
  /// Unix group whose members are handed out as build users. `None`
  /// disables build users entirely (single-user installs).
  pub build_users_group: Option<String>,
  /// Allocate sandbox uids from `start_id..start_id + uid_pool_size`
  /// instead of enumerating the build group. Required for uid ranges.
  pub auto_allocate_uids: bool,
  pub start_id: u32,
  pub uid_pool_size: u32,
  pub sandbox_mode: SandboxMode,
  /// Fall back to unsandboxed builds when the kernel lacks the needed
  /// namespaces.
  pub sandbox_fallback: bool,
  /// Host paths exposed inside every sandbox, `target=source` or `path`,
  /// with a trailing `?` marking optional entries.
  pub sandbox_paths: Vec<String>,
  /// Prefixes a derivation may request via `__impureHostDeps`.
  pub allowed_impure_host_prefixes: Vec<PathBuf>,
  /// Where the temp dir appears inside the sandbox.
  pub sandbox_build_dir: PathBuf,
  pub sandbox_shm_size: String,
  pub build_cores: u32,
  /// Parent for build temp dirs; the system default when `None`.
  pub build_dir: Option<PathBuf>,
  pub keep_failed: bool,
  pub run_diff_hook: bool,
  pub diff_hook: Option<PathBuf>,
  pub diff_hook_timeout: Duration,
  pub filter_syscalls: bool,
  pub allow_new_privileges: bool,
  pub use_cgroups: bool,
  pub require_drop_supplementary_groups: bool,
  /// State directory: user pool locks, cgroup bookkeeping.
  pub state_dir: PathBuf,
  /// This host's platform string, e.g. `x86_64-linux`.
  pub system: String,
  pub system_features: BTreeSet<String>,
  /// Values forwarded for `impureEnvVars` in preference to the real
  /// environment.
  pub impure_env: HashMap<String, String>,
  /// Signing key `name:base64`; paths and realisations are signed only
  /// when present.
  pub secret_key: Option<String>,
  pub(crate) cgroup_counter: AtomicU32,
}

impl Settings {
  #[cfg(target_os = "linux")]
  fn this_system() -> &'static str {
    if cfg!(target_arch = "x86_64") {
      "x86_64-linux"
    } else if cfg!(target_arch = "aarch64") {
      "aarch64-linux"
    } else {
      "unknown-linux"
    }
  }

  #[cfg(target_os = "macos")]
  fn this_system() -> &'static str {
    if cfg!(target_arch = "aarch64") {
      "aarch64-darwin"
    } else {
      "x86_64-darwin"
    }
  }

  #[cfg(not(any(target_os = "linux", target_os = "macos")))]
  fn this_system() -> &'static str {
    "unknown"
  }

  pub fn use_build_users(&self) -> bool {
    self.build_users_group.is_some() || self.auto_allocate_uids
  }
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      build_users_group: Some("silobld".into()),
      auto_allocate_uids: false,
      start_id: 872_415_232,
      uid_pool_size: 8192,
      sandbox_mode: SandboxMode::default(),
      sandbox_fallback: true,
      sandbox_paths: vec!["/bin/sh".into()],
      allowed_impure_host_prefixes: vec![],
      sandbox_build_dir: PathBuf::from("/build"),
      sandbox_shm_size: "50%".into(),
      build_cores: 1,
      build_dir: None,
      keep_failed: false,
      run_diff_hook: false,
      diff_hook: None,
      diff_hook_timeout: Duration::from_secs(60),
      filter_syscalls: true,
      allow_new_privileges: false,
      use_cgroups: false,
      require_drop_supplementary_groups: false,
      state_dir: PathBuf::from("/silo/var/silo"),
      system: Self::this_system().to_string(),
      system_features: ["recursive-silo"].iter().map(|s| s.to_string()).collect(),
      impure_env: Default::default(),
      secret_key: None,
      cgroup_counter: AtomicU32::new(0),
    }
  }
}
