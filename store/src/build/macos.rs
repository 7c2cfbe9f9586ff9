//! Profile-based isolation for Darwin hosts: no chroot, instead a sandbox
//! profile assembled in memory and activated in-process in the child just
//! before exec.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::os::unix::prelude::*;
use std::path::{Path, PathBuf};
use std::process::{exit, Command};

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, close, dup2, fork, setsid, ForkResult};

use super::builtins::{run_builtin, BuiltinContext};
use super::rewrite::rewrite_strings;
use super::{BuildError, ChrootPath, DerivationBuilder};
use crate::prelude::*;

extern "C" {
  // undocumented but relied upon by every major browser
  fn sandbox_init_with_parameters(
    profile: *const libc::c_char,
    flags: u64,
    parameters: *const *const libc::c_char,
    errorbuf: *mut *mut libc::c_char,
  ) -> libc::c_int;
}

const SANDBOX_PROLOGUE: &str = r#"(allow file-read* file-write-data (literal "/dev/null"))
(allow file-read-metadata
  (literal "/var")
  (literal "/tmp")
  (literal "/etc")
  (literal "/etc/resolv.conf")
  (literal "/private/etc/resolv.conf"))
(allow file-read* (subpath "/usr/lib") (subpath "/System/Library"))
(allow file-read* file-write* (literal "/dev/stdin") (literal "/dev/stdout") (literal "/dev/stderr"))
(allow file-read* file-write* (subpath "/private/var/tmp") (subpath "/private/tmp"))
(allow file-read* file-write* (literal "/dev/tty") (regex #"^/dev/tty[a-z]+"))
(allow process-fork)
(allow sysctl-read)
(allow signal (target same-sandbox))
(allow file-ioctl (literal "/dev/dtracehelper"))
(allow mach-lookup (global-name "com.apple.SecurityServer"))
"#;

const SANDBOX_NETWORK: &str = r#"(allow network*)
(allow network-outbound (remote unix-socket))
(allow system-socket)
(allow mach-lookup (global-name "com.apple.system.notification_center"))
"#;

const SANDBOX_MINIMAL: &str = "(allow default)\n";

/// Groups are split before the interpreter's internal limit; half of the
/// observed 1 << 16 ceiling leaves room for long paths.
const PROFILE_BREAK: usize = 1 << 14;

pub(super) fn spawn(builder: &mut DerivationBuilder, builder_write: RawFd) -> Result<()> {
  {
    let mut sb = builder.sandbox.lock();
    sb.use_chroot = builder.use_chroot;
    sb.using_user_namespace = false;
  }

  let profile = if builder.use_chroot {
    // the inputs appear under their own paths; there is no chroot to put
    // them anywhere else
    for p in builder.input_paths.iter() {
      let printed = builder.store.print_store_path(p);
      builder.paths_in_chroot.insert(
        PathBuf::from(&printed),
        ChrootPath {
          path: PathBuf::from(printed),
          optional: false,
        },
      );
    }

    let scratch: Vec<String> = builder
      .scratch_outputs
      .values()
      .map(|p| builder.store.print_store_path(p))
      .collect();
    Some(build_sandbox_profile(
      &builder.paths_in_chroot,
      &scratch,
      builder.store.store_path(),
      builder.drv.is_sandboxed(),
      &builder.options.additional_sandbox_profile,
    )?)
  } else {
    Some(format!("(version 1)\n{}", SANDBOX_MINIMAL))
  };

  let creds = builder
    .build_user
    .as_ref()
    .map(|u| (u.uid(), u.gid(), u.supplementary_gids().to_vec()));
  let allow_local_networking = builder.options.allow_local_networking;
  let tmp_dir_in_sandbox = builder.tmp_dir_in_sandbox.clone();
  let env = builder.env.clone();
  let input_rewrites = builder.input_rewrites.clone();
  let scratch_outputs: HashMap<String, String> = builder
    .scratch_outputs
    .iter()
    .map(|(name, path)| (name.clone(), builder.store.print_store_path(path)))
    .collect();
  let drv = builder.drv.clone();

  match unsafe { fork() }.map_err(|e| BuildError::Spawn(format!("fork failed: {}", e)))? {
    ForkResult::Child => {
      let res = (|| -> Result<()> {
        setsid()?;
        dup2(builder_write, libc::STDERR_FILENO)?;
        dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO)?;
        let fdnull = open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
        dup2(fdnull, libc::STDIN_FILENO)?;
        close(fdnull)?;

        if let Some(profile) = &profile {
          init_sandbox(profile, allow_local_networking)?;
        }

        chdir(&tmp_dir_in_sandbox)?;

        if let Some((uid, gid, supplementary)) = creds {
          // keep the build user's supplementary groups, so admins can
          // grant device access by group; nix doesn't expose setgroups
          // on darwin, where it takes an int count
          let groups: Vec<libc::gid_t> = supplementary.iter().map(|g| g.as_raw()).collect();
          if unsafe { libc::setgroups(groups.len() as libc::c_int, groups.as_ptr()) } == -1 {
            return Err(nix::Error::last().into());
          }
          nix::unistd::setgid(gid)?;
          nix::unistd::setuid(uid)?;
        }

        let _ = nix::unistd::write(libc::STDERR_FILENO, b"\x02\n");

        if let Some(builtin) = drv.as_builtin() {
          let new_env = drv
            .env
            .iter()
            .map(|(k, v)| (k.clone(), rewrite_strings(v, &input_rewrites)))
            .collect::<HashMap<_, _>>();
          run_builtin(
            &builtin,
            &BuiltinContext {
              env: &new_env,
              outputs: &scratch_outputs,
            },
          )?;
          return Ok(());
        }

        let mut command = Command::new(&drv.builder);
        command.env_clear();
        for (var, value) in &env {
          command.env(var, rewrite_strings(value, &input_rewrites));
        }
        for arg in &drv.args {
          command.arg(rewrite_strings(arg, &input_rewrites));
        }
        let err = command.exec();
        Err(anyhow!("executing `{}': {}", drv.builder.display(), err))
      })();
      let code = match res {
        Ok(()) => 0,
        Err(e) => {
          let msg = format!("{:#}", e);
          let frame = format!("\u{1}{}\n{}", msg.len(), msg);
          let _ = nix::unistd::write(libc::STDERR_FILENO, frame.as_bytes());
          1
        }
      };
      exit(code)
    }
    ForkResult::Parent { child } => {
      builder.pid = Some(child);
      Ok(())
    }
  }
}

fn init_sandbox(profile: &str, allow_local_networking: bool) -> Result<()> {
  let global_tmp = std::env::temp_dir();
  let global_tmp = global_tmp
    .to_str()
    .ok_or_else(|| anyhow!("non-utf8 temp dir"))?
    .trim_end_matches('/')
    .to_string();

  let profile_c = std::ffi::CString::new(profile)?;
  let mut params: Vec<std::ffi::CString> = vec![
    std::ffi::CString::new("_GLOBAL_TMP_DIR")?,
    std::ffi::CString::new(global_tmp)?,
  ];
  if allow_local_networking {
    params.push(std::ffi::CString::new("_ALLOW_LOCAL_NETWORKING")?);
    params.push(std::ffi::CString::new("1")?);
  }
  let mut param_ptrs: Vec<*const libc::c_char> = params.iter().map(|c| c.as_ptr()).collect();
  param_ptrs.push(std::ptr::null());

  let mut errorbuf: *mut libc::c_char = std::ptr::null_mut();
  let r = unsafe {
    sandbox_init_with_parameters(profile_c.as_ptr(), 0, param_ptrs.as_ptr(), &mut errorbuf)
  };
  if r != 0 {
    let msg = if errorbuf.is_null() {
      "(null)".to_string()
    } else {
      unsafe { std::ffi::CStr::from_ptr(errorbuf) }
        .to_string_lossy()
        .into_owned()
    };
    bail!("failed to configure sandbox: {}", msg);
  }
  Ok(())
}

/// Assemble the deny-default profile: allow the scratch outputs, every
/// sandbox path (in length-limited groups), the ancestry of each, and
/// whatever the recipe added itself.
fn build_sandbox_profile(
  paths_in_chroot: &HashMap<PathBuf, ChrootPath>,
  scratch_outputs: &[String],
  store_dir: &Path,
  sandboxed: bool,
  additional_profile: &str,
) -> Result<String> {
  let mut profile = String::from("(version 1)\n");
  profile.push_str("(deny default (with no-log))\n");
  profile.push_str(SANDBOX_PROLOGUE);

  if !sandboxed {
    profile.push_str(SANDBOX_NETWORK);
  }

  // every file operation wants to stat its full ancestry
  let mut ancestry = BTreeSet::new();
  for target in paths_in_chroot.keys() {
    let mut cur = target.clone();
    while let Some(parent) = cur.parent() {
      if parent == Path::new("/") {
        break;
      }
      ancestry.insert(parent.to_path_buf());
      cur = parent.to_path_buf();
    }
  }
  let mut cur = store_dir.to_path_buf();
  loop {
    ancestry.insert(cur.clone());
    match cur.parent() {
      Some(p) if p != Path::new("/") => cur = p.to_path_buf(),
      _ => break,
    }
  }

  profile.push_str("(allow file-read* file-write* process-exec\n");
  for path in scratch_outputs {
    profile.push_str(&format!("\t(subpath \"{}\")\n", path));
  }
  profile.push_str(")\n");

  // without file-write* here, access() spuriously reports EPERM
  profile.push_str("(allow file-read* file-write* process-exec\n");
  let breakpoint = profile.len() + PROFILE_BREAK;
  for (target, source) in paths_in_chroot {
    if profile.len() >= breakpoint {
      debug!("sandbox profile break at {}", profile.len());
      profile.push_str(")\n(allow file-read* file-write* process-exec\n");
    }

    if target != &source.path {
      return Err(
        BuildError::Config(format!(
          "can't map '{}' to '{}': mismatched impure paths are not supported on this platform",
          target.display(),
          source.path.display()
        ))
        .into(),
      );
    }

    let st = match fs::symlink_metadata(target) {
      Ok(st) => st,
      Err(_) if source.optional => continue,
      Err(e) => {
        return Err(anyhow::Error::from(e)
          .context(format!("getting attributes of required path '{}'", target.display())))
      }
    };
    if st.file_type().is_dir() {
      profile.push_str(&format!("\t(subpath \"{}\")\n", target.display()));
    } else {
      profile.push_str(&format!("\t(literal \"{}\")\n", target.display()));
    }
  }
  profile.push_str(")\n");

  // allow realpath() on everything leading up to the inputs
  profile.push_str("(allow file-read*\n");
  for p in ancestry {
    profile.push_str(&format!("\t(literal \"{}\")\n", p.display()));
  }
  profile.push_str(")\n");

  profile.push_str(additional_profile);

  debug!("generated sandbox profile:\n{}", profile);

  Ok(profile)
}
