//! Namespace-based isolation: double-fork into a fresh set of namespaces,
//! bring up a private filesystem view, and exec the builder inside it.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::os::unix::prelude::*;
use std::path::{Path, PathBuf};
use std::process::{exit, Command};
use std::slice;

use ipc_channel::ipc::{IpcBytesReceiver, IpcBytesSender};
use libc::SIGCHLD;
use linux_personality::{personality, ADDR_NO_RANDOMIZE};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{
  chdir, chown, chroot, close, dup2, fork, getuid, mkdir, pivot_root, sethostname, setsid,
  ForkResult, Gid, Pid, Uid,
};
use parking_lot::Once;
use rlimit::Resource;

use super::builtins::{run_builtin, BuiltinContext};
use super::rewrite::rewrite_strings;
use super::{chmod_path, BuildError, ChrootPath, DerivationBuilder, SandboxState};
use crate::prelude::*;

mod sys_ext;

const NULL: Option<&'static str> = None;

pub(crate) fn namespaces_supported() -> bool {
  Path::new("/proc/self/ns/mnt").exists() && Path::new("/proc/self/ns/pid").exists()
}

fn user_namespaces_supported() -> bool {
  if !Path::new("/proc/self/ns/user").exists() {
    return false;
  }
  fs::read_to_string("/proc/sys/user/max_user_namespaces")
    .ok()
    .and_then(|x| x.trim().parse::<u64>().ok())
    .map_or(false, |x| x > 0)
}

pub(super) fn spawn(builder: &mut DerivationBuilder, builder_write: RawFd) -> Result<()> {
  // load the resolver libraries before any chroot hides them from a
  // builtin fetcher
  if builder.drv.is_builtin() {
    static NSS_INIT: Once = Once::new();
    NSS_INIT.call_once(|| {
      let res = dns_lookup::getaddrinfo(Some("invalid-domain.invalid"), Some("http"), None);
      assert!(res.is_err());
    });
  }

  if builder.use_chroot {
    spawn_chroot(builder, builder_write)
  } else {
    spawn_plain(builder, builder_write)
  }
}

fn spawn_plain(builder: &mut DerivationBuilder, builder_write: RawFd) -> Result<()> {
  {
    let mut sb = builder.sandbox.lock();
    sb.use_chroot = false;
    sb.using_user_namespace = false;
  }

  let ctx = RunChild::for_builder(builder, builder_write, None)?;

  match unsafe { fork() }.map_err(|e| BuildError::Spawn(format!("fork failed: {}", e)))? {
    ForkResult::Child => {
      let code = match run_child(ctx) {
        Ok(()) => 0,
        Err(e) => {
          send_child_error(&e);
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

fn spawn_chroot(builder: &mut DerivationBuilder, builder_write: RawFd) -> Result<()> {
  let chroot_root = setup_chroot(builder)?;

  let using_user_namespace = user_namespaces_supported();
  {
    let mut sb = builder.sandbox.lock();
    sb.use_chroot = true;
    sb.chroot_root = Some(chroot_root.clone());
    sb.using_user_namespace = using_user_namespace;
  }

  let (user_ns_write, user_ns_read): (IpcBytesSender, IpcBytesReceiver) =
    ipc_channel::ipc::bytes_channel()
      .map_err(|e| BuildError::Spawn(format!("creating sync channel: {}", e)))?;

  let sandboxed = builder.drv.is_sandboxed();
  let require_drop_supplementary_groups = builder.settings.require_drop_supplementary_groups;
  let ctx = RunChild::for_builder(builder, builder_write, Some(user_ns_read))?;

  match unsafe { fork() }.map_err(|e| BuildError::Spawn(format!("fork failed: {}", e)))? {
    ForkResult::Child => {
      // the helper: clone the real builder into fresh namespaces, report
      // its pid, and get out of the way. Its stderr goes to the log pipe
      // so setup failures reach the driver as error frames.
      let _ = dup2(builder_write, libc::STDERR_FILENO);

      // supplementary groups cannot be changed once the new user
      // namespace exists, so they go now; EPERM is tolerable for
      // unprivileged callers unless the host insists otherwise
      if let Err(e) = nix::unistd::setgroups(&[]) {
        if e != Errno::EPERM {
          send_child_error(&anyhow!("setgroups failed: {}", e));
          exit(1);
        }
        if require_drop_supplementary_groups {
          send_child_error(&anyhow!(
            "setgroups failed; disable require-drop-supplementary-groups to skip this step"
          ));
          exit(1);
        }
      }

      let stack_size = 1024 * 1024 * 8;
      let stack = match unsafe {
        mmap(
          std::ptr::null_mut(),
          stack_size,
          ProtFlags::PROT_WRITE | ProtFlags::PROT_READ,
          MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_STACK,
          -1,
          0,
        )
      } {
        Ok(s) => s,
        Err(e) => {
          send_child_error(&anyhow!("cannot allocate clone stack: {}", e));
          exit(1)
        }
      };
      let stack_slice = unsafe { slice::from_raw_parts_mut(stack.cast::<u8>(), stack_size) };

      let mut clone_flags = CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_PARENT;
      if sandboxed {
        clone_flags |= CloneFlags::CLONE_NEWNET;
      }
      if using_user_namespace {
        clone_flags |= CloneFlags::CLONE_NEWUSER;
      }

      let child_pid = sys_ext::clone(
        move || match run_child(ctx) {
          Ok(()) => 0,
          Err(e) => {
            send_child_error(&e);
            1
          }
        },
        stack_slice,
        clone_flags,
        Some(SIGCHLD),
      );

      match child_pid {
        Ok(p) => {
          let _ = nix::unistd::write(builder_write, format!("{}\n", p).as_bytes());
          exit(0)
        }
        Err(e) => {
          send_child_error(&anyhow!("unable to clone build process: {}", e));
          exit(1)
        }
      }
    }
    ForkResult::Parent { child: helper } => {
      match waitpid(helper, None) {
        Ok(WaitStatus::Exited(_, 0)) => {}
        x => {
          return Err(BuildError::Spawn(format!("unable to start build process: {:?}", x)).into());
        }
      }

      let master_fd = builder
        .builder_out
        .as_ref()
        .expect("pty master not open")
        .as_raw_fd();
      let line = read_line_raw(master_fd)?;
      let pid = Pid::from_raw(
        line
          .trim()
          .parse()
          .map_err(|_| BuildError::Spawn(format!("unexpected pid line `{}'", line)))?,
      );
      builder.pid = Some(pid);

      if using_user_namespace {
        // the sandbox uid maps onto the build user (or onto us)
        let host_uid = builder
          .build_user
          .as_ref()
          .map_or_else(getuid, |u| u.uid())
          .as_raw();
        let host_gid = builder
          .build_user
          .as_ref()
          .map_or_else(nix::unistd::getgid, |u| u.gid())
          .as_raw();
        let nr_ids = builder.build_user.as_ref().map_or(1, |u| u.uid_count());

        fs::write(
          format!("/proc/{}/uid_map", pid),
          format!("{} {} {}", builder.sandbox_uid(), host_uid, nr_ids),
        )?;
        if nr_ids == 1 {
          fs::write(format!("/proc/{}/setgroups", pid), b"deny")?;
        }
        fs::write(
          format!("/proc/{}/gid_map", pid),
          format!("{} {} {}", builder.sandbox_gid(), host_gid, nr_ids),
        )?;
      } else {
        debug!("note: not using a user namespace");
        if builder.build_user.is_none() {
          return Err(
            BuildError::Spawn(
              "cannot perform a sandboxed build because user namespaces are not enabled".into(),
            )
            .into(),
          );
        }
      }

      // now that the sandbox uid is final, /etc/passwd can be written
      fs::write(
        chroot_root.join("etc/passwd"),
        format!(
          "root:x:0:0:Build user:{dir}:/noshell\nsilobld:x:{uid}:{gid}:Build \
           user:{dir}:/noshell\nnobody:x:65534:65534:Nobody:/:/noshell\n",
          dir = builder.settings.sandbox_build_dir.display(),
          uid = builder.sandbox_uid(),
          gid = builder.sandbox_gid()
        ),
      )?;

      // saved pre-pivot; add_dependency() re-enters these namespaces
      let mount_ns = open(
        Path::new(&format!("/proc/{}/ns/mnt", pid)),
        OFlag::O_RDONLY,
        Mode::empty(),
      )
      .map_err(|e| BuildError::Spawn(format!("getting sandbox mount namespace: {}", e)))?;
      let user_ns = if using_user_namespace {
        Some(
          open(
            Path::new(&format!("/proc/{}/ns/user", pid)),
            OFlag::O_RDONLY,
            Mode::empty(),
          )
          .map_err(|e| BuildError::Spawn(format!("getting sandbox user namespace: {}", e)))?,
        )
      } else {
        None
      };
      {
        let mut sb = builder.sandbox.lock();
        sb.mount_ns = Some(unsafe { fs::File::from_raw_fd(mount_ns) });
        sb.user_ns = user_ns.map(|fd| unsafe { fs::File::from_raw_fd(fd) });
      }

      #[cfg(target_os = "linux")]
      if let Some(cg) = &builder.cgroup {
        super::cgroup::move_into_cgroup(cg, pid)?;
      }

      // let the child proceed past its sync read
      user_ns_write
        .send(&[1])
        .map_err(|e| BuildError::Spawn(format!("signalling user namespace setup: {}", e)))?;

      Ok(())
    }
  }
}

/// Create the on-disk chroot skeleton: `<drv>.chroot/root` with `/tmp`,
/// `/etc` and an empty store directory, owned so the build user can write
/// where it must.
fn setup_chroot(builder: &mut DerivationBuilder) -> Result<PathBuf> {
  let drv_real = builder.store.to_real_path(&builder.drv_path);
  let chroot_parent = PathBuf::from(format!("{}.chroot", drv_real.display()));
  rm_rf::ensure_removed(&chroot_parent)?;

  debug!("setting up chroot environment in {}", chroot_parent.display());

  let uid_range = builder.options.use_uid_range(&builder.drv);
  if uid_range {
    match &builder.build_user {
      Some(u) if u.uid_count() >= 65536 => {}
      _ => {
        return Err(
          BuildError::Config("feature 'uid-range' requires auto-allocated uids".into()).into(),
        )
      }
    }
  }

  fs::create_dir_all(&chroot_parent)?;
  chmod_path(&chroot_parent, 0o700)?;

  let chroot_root = chroot_parent.join("root");
  mkdir(
    &chroot_root,
    Mode::from_bits_truncate(if uid_range { 0o755 } else { 0o750 }),
  )?;
  if let Some(user) = &builder.build_user {
    let owner = if uid_range { Some(user.uid()) } else { None };
    chown(&chroot_root, owner, Some(user.gid()))?;
  }

  // many builders expect a writable /tmp regardless of $TMPDIR
  let chroot_tmp = chroot_root.join("tmp");
  fs::create_dir_all(&chroot_tmp)?;
  chmod_path(&chroot_tmp, 0o1777)?;

  fs::create_dir_all(chroot_root.join("etc"))?;
  if uid_range {
    builder.chown_to_builder(chroot_root.join("etc"))?;
  }

  fs::write(
    chroot_root.join("etc/group"),
    format!(
      "root:x:0:\nsilobld:!:{}:\nnogroup:x:65534:\n",
      builder.sandbox_gid()
    ),
  )?;

  if builder.drv.is_sandboxed() {
    fs::write(
      chroot_root.join("etc/hosts"),
      "127.0.0.1 localhost\n::1 localhost\n",
    )?;
  }

  let chroot_store_dir = chroot_root.append(builder.store.store_path());
  fs::create_dir_all(&chroot_store_dir)?;
  chmod_path(&chroot_store_dir, 0o1775)?;
  if let Some(user) = &builder.build_user {
    chown(&chroot_store_dir, None, Some(user.gid()))?;
  }

  if let Some(cg) = &builder.cgroup {
    super::cgroup::create_cgroup(cg, builder.build_user.as_ref())?;
  }

  Ok(chroot_root)
}

fn read_line_raw(fd: RawFd) -> Result<String> {
  let mut line = Vec::new();
  let mut byte = [0u8; 1];
  loop {
    match nix::unistd::read(fd, &mut byte) {
      Ok(0) => break,
      Ok(_) => {
        if byte[0] == b'\n' {
          break;
        }
        line.push(byte[0]);
      }
      Err(Errno::EINTR) => continue,
      Err(e) => return Err(e.into()),
    }
  }
  Ok(String::from_utf8_lossy(&line).into_owned())
}

fn send_child_error(e: &anyhow::Error) {
  let msg = format!("{:#}", e);
  let frame = format!("\u{1}{}\n{}", msg.len(), msg);
  let _ = nix::unistd::write(libc::STDERR_FILENO, frame.as_bytes());
}

/// Everything the child needs, gathered before forking. The child must not
/// touch the store or the database.
struct RunChild<'a> {
  builder_write: RawFd,
  user_ns_read: Option<IpcBytesReceiver>,
  use_chroot: bool,
  chroot_root: PathBuf,
  chroot_store_dir: PathBuf,
  paths_in_chroot: HashMap<PathBuf, ChrootPath>,
  tmp_dir_in_sandbox: PathBuf,
  sandboxed: bool,
  uid_range: bool,
  cgrouped: bool,
  sandbox_uid: u32,
  sandbox_gid: u32,
  /// uid/gid/supplementary groups to drop to when not in a user namespace.
  user_creds: Option<(Uid, Gid, Vec<Gid>)>,
  drv: &'a Derivation,
  env: &'a HashMap<String, String>,
  input_rewrites: &'a HashMap<String, String>,
  scratch_outputs: HashMap<String, String>,
  filter_syscalls: bool,
  allow_new_privileges: bool,
  shm_size: String,
}

impl<'a> RunChild<'a> {
  fn for_builder(
    builder: &'a DerivationBuilder,
    builder_write: RawFd,
    user_ns_read: Option<IpcBytesReceiver>,
  ) -> Result<Self> {
    let sb = builder.sandbox.lock();
    let chroot_root = sb.chroot_root.clone().unwrap_or_default();
    drop(sb);
    let chroot_store_dir = chroot_root.append(builder.store.store_path());

    Ok(Self {
      builder_write,
      user_ns_read,
      use_chroot: builder.use_chroot,
      chroot_root,
      chroot_store_dir,
      paths_in_chroot: builder.paths_in_chroot.clone(),
      tmp_dir_in_sandbox: builder.tmp_dir_in_sandbox.clone(),
      sandboxed: builder.drv.is_sandboxed(),
      uid_range: builder.options.use_uid_range(&builder.drv),
      cgrouped: builder.cgroup.is_some(),
      sandbox_uid: builder.sandbox_uid(),
      sandbox_gid: builder.sandbox_gid(),
      user_creds: builder
        .build_user
        .as_ref()
        .map(|u| (u.uid(), u.gid(), u.supplementary_gids().to_vec())),
      drv: &builder.drv,
      env: &builder.env,
      input_rewrites: &builder.input_rewrites,
      scratch_outputs: builder
        .scratch_outputs
        .iter()
        .map(|(name, path)| (name.clone(), builder.store.print_store_path(path)))
        .collect(),
      filter_syscalls: builder.settings.filter_syscalls,
      allow_new_privileges: builder.settings.allow_new_privileges,
      shm_size: builder.settings.sandbox_shm_size.clone(),
    })
  }
}

fn run_child(ctx: RunChild) -> Result<()> {
  let RunChild {
    builder_write,
    user_ns_read,
    use_chroot,
    chroot_root,
    chroot_store_dir,
    mut paths_in_chroot,
    tmp_dir_in_sandbox,
    sandboxed,
    uid_range,
    cgrouped,
    sandbox_uid,
    sandbox_gid,
    user_creds,
    drv,
    env,
    input_rewrites,
    scratch_outputs,
    filter_syscalls,
    allow_new_privileges,
    shm_size,
  } = ctx;

  setsid()?;

  dup2(builder_write, libc::STDERR_FILENO)?;
  dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO)?;
  let fdnull = open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
  dup2(fdnull, libc::STDIN_FILENO)?;
  close(fdnull)?;

  if let Err(e) = init_seccomp(filter_syscalls, allow_new_privileges) {
    // without a build user the filter is best-effort
    if user_creds.is_some() {
      return Err(e);
    }
    eprintln!("warning: cannot install the syscall filter: {:#}", e);
  }

  let mut set_user = true;

  if use_chroot {
    let sync = user_ns_read
      .ok_or_else(|| anyhow!("missing sync channel"))?
      .recv()
      .map_err(|e| anyhow!("user namespace initialisation failed: {:?}", e))?;
    ensure!(sync == [1], "user namespace initialisation failed");

    if sandboxed {
      // bring up the private loopback
      let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::empty(),
        None,
      )?;
      netdevice::set_flags(
        sock,
        "lo",
        &(netdevice::IFF_UP | netdevice::IFF_LOOPBACK | netdevice::IFF_RUNNING),
      )?;
      let _ = close(sock);
    }

    sethostname("localhost")?;
    unsafe {
      // the kernel default; nix has no wrapper for this one
      let name = b"(none)\0";
      if libc::setdomainname(name.as_ptr() as *const libc::c_char, 6) == -1 {
        return Err(nix::Error::last().into());
      }
    }

    // shared subtrees would propagate our mounts back out
    mount(NULL, "/", NULL, MsFlags::MS_PRIVATE | MsFlags::MS_REC, NULL)?;

    mount(
      Some(&chroot_root),
      &chroot_root,
      NULL,
      MsFlags::MS_BIND,
      NULL,
    )?;

    // the store stays shared so add_dependency() can reach in later
    mount(
      Some(&chroot_store_dir),
      &chroot_store_dir,
      NULL,
      MsFlags::MS_BIND,
      NULL,
    )?;
    mount(NULL, &chroot_store_dir, NULL, MsFlags::MS_SHARED, NULL)
      .with_context(|| format!("unable to mount {} as shared", chroot_store_dir.display()))?;

    let mut extra_paths = vec![];
    if !paths_in_chroot.contains_key(Path::new("/dev")) {
      fs::create_dir_all(chroot_root.join("dev/shm"))?;
      fs::create_dir_all(chroot_root.join("dev/pts"))?;
      extra_paths.push("/dev/full");
      if Path::new("/dev/kvm").exists() {
        extra_paths.push("/dev/kvm");
      }
      extra_paths.extend(vec![
        "/dev/null",
        "/dev/random",
        "/dev/tty",
        "/dev/urandom",
        "/dev/zero",
      ]);
      symlink("/proc/self/fd", chroot_root.join("dev/fd"))?;
      symlink("/proc/self/fd/0", chroot_root.join("dev/stdin"))?;
      symlink("/proc/self/fd/1", chroot_root.join("dev/stdout"))?;
      symlink("/proc/self/fd/2", chroot_root.join("dev/stderr"))?;
    }

    // network-facing recipes need the resolver's host files
    if !sandboxed {
      fs::write(
        chroot_root.join("etc/nsswitch.conf"),
        b"hosts: files dns\nservices: files\n",
      )?;
      for path in ["/etc/resolv.conf", "/etc/services", "/etc/hosts"].iter() {
        if Path::new(path).exists() {
          extra_paths.push(*path);
        }
      }
    }

    for path in extra_paths {
      paths_in_chroot.insert(
        PathBuf::from(path),
        ChrootPath {
          path: PathBuf::from(path),
          optional: false,
        },
      );
    }

    let has_pts = paths_in_chroot.contains_key(Path::new("/dev/pts"));

    for (target, source) in paths_in_chroot.drain() {
      if source.path == Path::new("/proc") {
        continue;
      }
      do_bind(&source.path, chroot_root.append(target), source.optional)?;
    }

    let procfs = chroot_root.join("proc");
    fs::create_dir_all(&procfs)?;
    mount(
      Some("none"),
      procfs.as_path(),
      Some("proc"),
      MsFlags::empty(),
      NULL,
    )?;

    if uid_range {
      let sysfs = chroot_root.join("sys");
      fs::create_dir_all(&sysfs)?;
      mount(
        Some("none"),
        sysfs.as_path(),
        Some("sysfs"),
        MsFlags::empty(),
        NULL,
      )?;
    }

    if Path::new("/dev/shm").exists() {
      mount(
        Some("none"),
        chroot_root.join("dev/shm").as_path(),
        Some("tmpfs"),
        MsFlags::empty(),
        Some(format!("size={}", shm_size).as_str()),
      )?;
    }

    // a fresh pty namespace when the kernel supports it
    if Path::new("/dev/pts/ptmx").exists() && !chroot_root.join("dev/ptmx").exists() && !has_pts {
      let res = mount(
        Some("none"),
        chroot_root.join("dev/pts").as_path(),
        Some("devpts"),
        MsFlags::empty(),
        Some("newinstance,mode=0620"),
      );
      match res {
        Ok(_) => {
          symlink("/dev/pts/ptmx", chroot_root.join("dev/ptmx"))?;
          // some kernels create it with mode 0
          chmod_path(&chroot_root.join("dev/pts/ptmx"), 0o666)?;
        }
        Err(e) => {
          if e != Errno::EINVAL {
            return Err(e.into());
          }
          do_bind(Path::new("/dev/pts"), chroot_root.join("dev/pts"), false)?;
          do_bind(Path::new("/dev/ptmx"), chroot_root.join("dev/ptmx"), false)?;
        }
      }
    }

    if !uid_range {
      chmod_path(&chroot_root.join("etc"), 0o555)?;
    }

    // pivot_root changes this namespace's root, so the pre-pivot mount
    // namespace saved by the parent must be split off first
    unshare(CloneFlags::CLONE_NEWNS)?;
    if cgrouped {
      unshare(CloneFlags::CLONE_NEWCGROUP)?;
    }

    chdir(&chroot_root)?;
    mkdir("real-root", Mode::from_bits_truncate(0o500))?;
    pivot_root(".", "real-root")?;
    chroot(".")?;
    umount2("real-root", MntFlags::MNT_DETACH)?;
    fs::remove_dir("real-root")?;

    nix::unistd::setgid(Gid::from_raw(sandbox_gid))?;
    nix::unistd::setuid(Uid::from_raw(sandbox_uid))?;
    set_user = false;
  }

  chdir(&tmp_dir_in_sandbox)
    .with_context(|| format!("changing into `{}'", tmp_dir_in_sandbox.display()))?;

  close_extra_fds();

  personality(ADDR_NO_RANDOMIZE).map_err(|_| anyhow!("couldn't set personality"))?;

  Resource::CORE.set(0, rlimit::INFINITY)?;

  if set_user {
    if let Some((uid, gid, supplementary)) = user_creds {
      nix::unistd::setgroups(&supplementary)?;
      nix::unistd::setgid(gid)?;
      nix::unistd::setuid(uid)?;
    }
  }

  // sandbox setup is done; anything after this point is the builder's
  // own fault
  let _ = nix::unistd::write(libc::STDERR_FILENO, b"\x02\n");

  if let Some(builtin) = drv.as_builtin() {
    let new_env = drv
      .env
      .iter()
      .map(|(k, v)| (k.clone(), rewrite_strings(v, input_rewrites)))
      .collect::<HashMap<_, _>>();
    let outputs = scratch_outputs;
    run_builtin(
      &builtin,
      &BuiltinContext {
        env: &new_env,
        outputs: &outputs,
      },
    )?;
    return Ok(());
  }

  let mut command = Command::new(&drv.builder);
  command.env_clear();
  for (var, value) in env {
    command.env(var, rewrite_strings(value, input_rewrites));
  }
  for arg in &drv.args {
    command.arg(rewrite_strings(arg, input_rewrites));
  }
  if let Some(base) = drv.builder.file_name() {
    command.arg0(base);
  }

  let err = command.exec();
  Err(anyhow!("executing `{}': {}", drv.builder.display(), err))
}

fn close_extra_fds() {
  // stdio stays; everything else must not leak into the builder
  let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
  let max = if max <= 0 { 256 } else { max };
  for fd in 3..max {
    unsafe {
      libc::close(fd as libc::c_int);
    }
  }
}

fn do_bind<P: AsRef<Path>, Q: AsRef<Path>>(source: P, target: Q, optional: bool) -> Result<()> {
  let source = source.as_ref();
  let target = target.as_ref();
  let st = match fs::symlink_metadata(source) {
    Ok(s) => s,
    Err(x) => {
      if x.kind() == std::io::ErrorKind::NotFound && optional {
        return Ok(());
      } else {
        return Err(x.into());
      }
    }
  };
  debug!(
    "bind mounting '{}' to '{}'",
    source.display(),
    target.display()
  );
  if st.file_type().is_dir() {
    fs::create_dir_all(target)?;
    mount(
      Some(source),
      target,
      NULL,
      MsFlags::MS_BIND | MsFlags::MS_REC,
      NULL,
    )?;
  } else if st.file_type().is_symlink() {
    // symlinks cannot be bind-mounted, so replicate it instead
    fs::create_dir_all(target.parent().expect("bind target must have a parent"))?;
    let link = fs::read_link(source)?;
    symlink(link, target)?;
  } else {
    fs::create_dir_all(target.parent().expect("bind target must have a parent"))?;
    fs::write(target, "")?;
    mount(
      Some(source),
      target,
      NULL,
      MsFlags::MS_BIND | MsFlags::MS_REC,
      NULL,
    )?;
  }
  Ok(())
}

/// Bind `source` onto `target` inside the live sandbox by entering its
/// saved namespaces from a single-threaded helper process.
pub(crate) fn bind_into_sandbox(sb: &SandboxState, source: &Path, target: &Path) -> Result<()> {
  match unsafe { fork() }? {
    ForkResult::Child => {
      let ok = (|| -> Result<()> {
        if let Some(user_ns) = &sb.user_ns {
          setns(user_ns.as_raw_fd(), CloneFlags::CLONE_NEWUSER)
            .map_err(|e| anyhow!("entering sandbox user namespace: {}", e))?;
        }
        let mount_ns = sb
          .mount_ns
          .as_ref()
          .ok_or_else(|| anyhow!("sandbox mount namespace is gone"))?;
        setns(mount_ns.as_raw_fd(), CloneFlags::CLONE_NEWNS)
          .map_err(|e| anyhow!("entering sandbox mount namespace: {}", e))?;
        do_bind(source, target, false)
      })();
      exit(if ok.is_ok() { 0 } else { 1 })
    }
    ForkResult::Parent { child } => match waitpid(child, None)? {
      WaitStatus::Exited(_, 0) => Ok(()),
      _ => bail!(
        "could not add path '{}' to sandbox",
        target.display()
      ),
    },
  }
}

fn init_seccomp(filter_syscalls: bool, allow_new_privileges: bool) -> Result<()> {
  use seccomp_sys::*;
  use std::ops::Deref;

  if !filter_syscalls {
    return Ok(());
  }

  struct Dealloc(*mut libc::c_void);

  impl Drop for Dealloc {
    fn drop(&mut self) {
      unsafe { seccomp_release(self.0) }
    }
  }

  impl Deref for Dealloc {
    type Target = *mut libc::c_void;

    fn deref(&self) -> &Self::Target {
      &self.0
    }
  }

  // 32-bit ABI tokens; registering them keeps multi-arch emulation inside
  // the filter
  #[cfg(target_arch = "x86_64")]
  const EXTRA_ARCHES: &[(&str, u32)] = &[("i386", 0x4000_0003), ("x32", 0x4000_003e)];
  #[cfg(target_arch = "aarch64")]
  const EXTRA_ARCHES: &[(&str, u32)] = &[("arm", 0x4000_0028)];
  #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
  const EXTRA_ARCHES: &[(&str, u32)] = &[];

  unsafe {
    let ctx = seccomp_init(SCMP_ACT_ALLOW);
    if ctx.is_null() {
      bail!(Errno::last());
    }

    let ctx = Dealloc(ctx);

    for (name, token) in EXTRA_ARCHES {
      // treated as a capability probe; some kernels reject these
      if seccomp_arch_add(*ctx, *token) != 0 {
        eprintln!("warning: cannot add {} seccomp architecture", name);
      }
    }

    // setuid/setgid bits on outputs would be a privilege handoff
    for perm in &[libc::S_ISUID, libc::S_ISGID] {
      #[cfg(target_arch = "x86_64")]
      Errno::result(seccomp_rule_add(
        *ctx,
        SCMP_ACT_ERRNO(libc::EPERM as _),
        libc::SYS_chmod as _,
        1,
        scmp_arg_cmp {
          arg: 1,
          op: scmp_compare::SCMP_CMP_MASKED_EQ,
          datum_a: *perm as _,
          datum_b: *perm as _,
        },
      ))?;

      Errno::result(seccomp_rule_add(
        *ctx,
        SCMP_ACT_ERRNO(libc::EPERM as _),
        libc::SYS_fchmod as _,
        1,
        scmp_arg_cmp {
          arg: 1,
          op: scmp_compare::SCMP_CMP_MASKED_EQ,
          datum_a: *perm as _,
          datum_b: *perm as _,
        },
      ))?;

      Errno::result(seccomp_rule_add(
        *ctx,
        SCMP_ACT_ERRNO(libc::EPERM as _),
        libc::SYS_fchmodat as _,
        1,
        scmp_arg_cmp {
          arg: 2,
          op: scmp_compare::SCMP_CMP_MASKED_EQ,
          datum_a: *perm as _,
          datum_b: *perm as _,
        },
      ))?;
    }

    // extended attributes are not representable in the archive format
    for call in &[
      libc::SYS_getxattr,
      libc::SYS_lgetxattr,
      libc::SYS_fgetxattr,
      libc::SYS_setxattr,
      libc::SYS_lsetxattr,
      libc::SYS_fsetxattr,
    ] {
      Errno::result(seccomp_rule_add(
        *ctx,
        SCMP_ACT_ERRNO(libc::ENOTSUP as _),
        *call as _,
        0,
      ))?;
    }

    Errno::result(seccomp_attr_set(
      *ctx,
      scmp_filter_attr::SCMP_FLTATR_CTL_NNP,
      if allow_new_privileges { 0 } else { 1 },
    ))?;

    Errno::result(seccomp_load(*ctx))?;
  }

  Ok(())
}
