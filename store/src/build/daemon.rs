//! The recursive-call daemon: a local socket inside the build's temp dir
//! through which the running builder can ask for additional store paths to
//! be materialized in its sandbox.
//!
//! Worker threads never see the full store. They go through a
//! [`RestrictedStore`], which holds the real store plus a pair of
//! capabilities granted by the build driver: an allowlist predicate and the
//! `add_dependency` entry point.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::prelude::*;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::sys::socket::{shutdown, Shutdown};
use parking_lot::Mutex;

use super::{BuildError, DerivationBuilder, SandboxState};
use crate::prelude::*;
use crate::StorePathSet;

pub(crate) struct Daemon {
  listener: UnixListener,
  accept_thread: Option<JoinHandle<()>>,
  workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Capabilities the driver grants to daemon workers; no other edge back
/// into the build exists.
pub struct RestrictedCaps {
  pub is_allowed_path: Box<dyn Fn(&StorePath) -> bool + Send + Sync>,
  pub is_allowed_output: Box<dyn Fn(&DrvOutput) -> bool + Send + Sync>,
  pub add_dependency: Box<dyn Fn(&StorePath) -> Result<()> + Send + Sync>,
}

/// A store view that refuses to answer for paths outside the allowlist.
pub struct RestrictedStore {
  store: Arc<dyn Store>,
  caps: Arc<RestrictedCaps>,
}

impl RestrictedStore {
  pub fn new(store: Arc<dyn Store>, caps: Arc<RestrictedCaps>) -> Self {
    Self { store, caps }
  }

  fn check_allowed(&self, path: &StorePath) -> Result<()> {
    if (self.caps.is_allowed_path)(path) {
      Ok(())
    } else {
      bail!(
        "access to path '{}' is forbidden in restricted mode",
        self.store.print_store_path(path)
      )
    }
  }

  pub fn is_valid_path(&self, path: &StorePath) -> Result<bool> {
    if !(self.caps.is_allowed_path)(path) {
      return Ok(false);
    }
    self.store.is_valid_path(path)
  }

  pub fn query_references(&self, path: &StorePath) -> Result<StorePathSet> {
    self.check_allowed(path)?;
    Ok(self.store.get_path_info(path)?.refs)
  }

  pub fn is_allowed_output(&self, id: &DrvOutput) -> bool {
    (self.caps.is_allowed_output)(id)
  }

  /// Materialize `path` inside the live sandbox.
  pub fn add_dependency(&self, path: &StorePath) -> Result<()> {
    (self.caps.add_dependency)(path)
  }

  fn parse_path(&self, s: &str) -> Result<StorePath> {
    self.store.parse_store_path(Path::new(s))
  }
}

/// Serve one connection. The wire protocol is line-based: `valid <path>`,
/// `refs <path>`, `add <path>`; every reply is a single line, errors are
/// prefixed with `error:`.
pub fn process_connection(store: &RestrictedStore, stream: UnixStream) {
  let reader = match stream.try_clone() {
    Ok(s) => BufReader::new(s),
    Err(_) => return,
  };
  let mut writer = stream;

  for line in reader.lines() {
    let line = match line {
      Ok(l) => l,
      Err(_) => break,
    };
    let reply = handle_command(store, line.trim());
    let out = match reply {
      Ok(r) => r,
      Err(e) => format!("error: {:#}", e),
    };
    if writeln!(writer, "{}", out).is_err() {
      break;
    }
  }
}

fn handle_command(store: &RestrictedStore, line: &str) -> Result<String> {
  let (cmd, arg) = break_str(line, ' ').unwrap_or((line, ""));
  match cmd {
    "valid" => {
      let path = store.parse_path(arg)?;
      Ok(if store.is_valid_path(&path)? { "1" } else { "0" }.to_string())
    }
    "refs" => {
      let path = store.parse_path(arg)?;
      let refs = store.query_references(&path)?;
      Ok(
        refs
          .iter()
          .map(|r| r.to_string())
          .collect::<Vec<_>>()
          .join(" "),
      )
    }
    "add" => {
      let path = store.parse_path(arg)?;
      store.add_dependency(&path)?;
      Ok("ok".to_string())
    }
    "" => bail!("empty command"),
    x => bail!("unknown command `{}'", x),
  }
}

impl DerivationBuilder {
  /// Create the daemon socket in the temp dir, export its in-sandbox
  /// address to the builder, and start accepting connections.
  pub(crate) fn start_daemon(&mut self) -> Result<()> {
    let tmp_dir = self.tmp_dir.clone().expect("temp dir not created yet");

    self.added_paths.lock().clear();
    self.added_drv_outputs.lock().clear();

    let socket_name = ".silo-socket";
    let socket_path = tmp_dir.join(socket_name);
    self.env.insert(
      "NIX_REMOTE".into(),
      format!(
        "unix://{}",
        self.tmp_dir_in_sandbox.join(socket_name).display()
      ),
    );

    let listener = UnixListener::bind(&socket_path)
      .map_err(|e| BuildError::Spawn(format!("creating daemon socket: {}", e)))?;
    super::chmod_path(&socket_path, 0o600)?;
    self.chown_to_builder(&socket_path)?;

    let caps = Arc::new(self.restricted_caps());
    let store = Arc::clone(&self.store);
    let workers: Arc<Mutex<Vec<JoinHandle<()>>>> = Default::default();
    let workers2 = Arc::clone(&workers);
    let listener_handle = listener
      .try_clone()
      .map_err(|e| BuildError::Spawn(format!("cloning daemon socket: {}", e)))?;

    let accept_thread = std::thread::spawn(move || {
      loop {
        match listener.accept() {
          Ok((stream, _)) => {
            debug!("received daemon connection");
            let store = Arc::clone(&store);
            let caps = Arc::clone(&caps);
            let worker = std::thread::spawn(move || {
              let restricted = RestrictedStore::new(store, caps);
              process_connection(&restricted, stream);
              debug!("terminated daemon connection");
            });
            workers2.lock().push(worker);
          }
          Err(e) => match e.raw_os_error() {
            Some(code) if code == Errno::EINTR as i32 || code == Errno::EAGAIN as i32 => continue,
            // the shutdown() from the driver surfaces as one of these
            Some(code) if code == Errno::EINVAL as i32 || code == Errno::ECONNABORTED as i32 => {
              break
            }
            _ => {
              warn!("accepting daemon connection: {}", e);
              break;
            }
          },
        }
      }
      debug!("daemon shutting down");
    });

    self.daemon = Some(Daemon {
      listener: listener_handle,
      accept_thread: Some(accept_thread),
      workers,
    });

    Ok(())
  }

  /// The capability pair handed to the restricted store: queries consult
  /// the allowlist, `add_dependency` mutates the live sandbox.
  fn restricted_caps(&self) -> RestrictedCaps {
    let input_paths = Arc::clone(&self.input_paths);
    let added_paths = Arc::clone(&self.added_paths);
    let added_paths2 = Arc::clone(&self.added_paths);
    let added_outputs = Arc::clone(&self.added_drv_outputs);
    let sandbox = Arc::clone(&self.sandbox);
    let store = Arc::clone(&self.store);
    let input_paths2 = Arc::clone(&self.input_paths);

    RestrictedCaps {
      is_allowed_path: Box::new(move |p| is_allowed(&input_paths, &added_paths.lock(), p)),
      is_allowed_output: Box::new(move |id| added_outputs.lock().contains(id)),
      add_dependency: Box::new(move |p| {
        add_dependency(&*store, &sandbox, &input_paths2, &added_paths2, p)
      }),
    }
  }

  /// Half-close the socket so the accept loop unblocks, then join it and
  /// every worker. The socket itself is released last.
  pub fn stop_daemon(&mut self) {
    let mut daemon = match self.daemon.take() {
      Some(d) => d,
      None => return,
    };

    match shutdown(daemon.listener.as_raw_fd(), Shutdown::Both) {
      Ok(()) => {}
      // an unconnected listener reports ENOTCONN on some hosts; benign
      Err(Errno::ENOTCONN) => {}
      Err(e) => warn!("shutting down daemon socket: {}", e),
    }

    if let Some(t) = daemon.accept_thread.take() {
      let _ = t.join();
    }

    let workers = std::mem::take(&mut *daemon.workers.lock());
    for w in workers {
      let _ = w.join();
    }

    // dropping the handle releases the socket, after everything is joined
    drop(daemon);
  }

  /// Record `id` as materialized mid-build so output scanning accepts it.
  pub fn add_drv_output(&self, id: DrvOutput) {
    self.added_drv_outputs.lock().insert(id);
  }

  /// Materialize `path` in the live sandbox; the entry point the protocol
  /// handler's capability closure delegates to.
  pub fn add_dependency(&self, path: &StorePath) -> Result<()> {
    add_dependency(
      &*self.store,
      &self.sandbox,
      &self.input_paths,
      &self.added_paths,
      path,
    )
  }
}

/// Make `path` visible inside the live sandbox. Inputs that were already
/// listed are a no-op; a path that is already mounted fails.
pub(crate) fn add_dependency(
  store: &dyn Store,
  sandbox: &Mutex<SandboxState>,
  input_paths: &StorePathSet,
  added_paths: &Mutex<StorePathSet>,
  path: &StorePath,
) -> Result<()> {
  if input_paths.contains(path) || added_paths.lock().contains(path) {
    return Ok(());
  }

  added_paths.lock().insert(path.clone());

  let sb = sandbox.lock();
  if !sb.use_chroot {
    return Ok(());
  }

  debug!("materialising '{}' in the sandbox", store.print_store_path(path));

  #[cfg(target_os = "linux")]
  {
    let chroot_root = sb
      .chroot_root
      .clone()
      .ok_or_else(|| BuildError::Internal("chroot build without chroot root".into()))?;
    let source = store.to_real_path(path);
    let target = chroot_root.append(store.print_store_path(path));

    if target.exists() {
      bail!(
        "store path '{}' already exists in the sandbox",
        store.print_store_path(path)
      );
    }

    // entering the child's mount namespace is impossible from a
    // multi-threaded process, so a short-lived helper does the bind mount
    super::linux::bind_into_sandbox(&sb, &source, &target)?;
    Ok(())
  }

  #[cfg(not(target_os = "linux"))]
  {
    bail!(
      "don't know how to make path '{}' appear in the sandbox on this platform",
      store.print_store_path(path)
    )
  }
}

/// The allowlist as a pure predicate, for direct use by the driver.
pub(crate) fn is_allowed(
  input_paths: &StorePathSet,
  added_paths: &StorePathSet,
  path: &StorePath,
) -> bool {
  input_paths.contains(path) || added_paths.contains(path)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::settings::Settings;
  use crate::LocalStore;
  use std::io::{BufRead, BufReader, Write};

  fn test_store() -> (tempfile::TempDir, Arc<LocalStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
      LocalStore::open_at(dir.path().join("silo"), Arc::new(Settings::default())).unwrap(),
    );
    (dir, store)
  }

  fn caps_for(
    input_paths: Arc<StorePathSet>,
    added: Arc<Mutex<StorePathSet>>,
  ) -> Arc<RestrictedCaps> {
    let input2 = Arc::clone(&input_paths);
    let added2 = Arc::clone(&added);
    let added3 = Arc::clone(&added);
    Arc::new(RestrictedCaps {
      is_allowed_path: Box::new(move |p| input_paths.contains(p) || added2.lock().contains(p)),
      is_allowed_output: Box::new(|_| false),
      add_dependency: Box::new(move |p| {
        if input2.contains(p) || added3.lock().contains(p) {
          return Ok(());
        }
        added3.lock().insert(p.clone());
        Ok(())
      }),
    })
  }

  fn register_dummy(store: &LocalStore, name: &str) -> StorePath {
    let path = store
      .make_store_path("text", Hash::hash(name, HashType::SHA256), name)
      .unwrap();
    store
      .register_valid_path(ValidPathInfo::new(path.clone(), Hash::hash(name, HashType::SHA256)))
      .unwrap();
    path
  }

  #[test]
  fn restricted_store_enforces_the_allowlist() {
    let (_d, store) = test_store();
    let visible = register_dummy(&store, "visible");
    let hidden = register_dummy(&store, "hidden");

    let inputs: Arc<StorePathSet> = Arc::new([visible.clone()].iter().cloned().collect());
    let added: Arc<Mutex<StorePathSet>> = Default::default();
    let dyn_store: Arc<dyn Store> = store.clone();
    let rs = RestrictedStore::new(dyn_store, caps_for(inputs, added.clone()));

    assert!(rs.is_valid_path(&visible).unwrap());
    // a perfectly valid path reads as invalid when not allowed
    assert!(!rs.is_valid_path(&hidden).unwrap());
    assert!(rs.query_references(&hidden).is_err());

    // adding it makes it visible
    rs.add_dependency(&hidden).unwrap();
    assert!(rs.is_valid_path(&hidden).unwrap());
  }

  #[test]
  fn duplicate_add_of_an_input_is_a_no_op() {
    let (_d, store) = test_store();
    let input = register_dummy(&store, "input");
    let inputs: Arc<StorePathSet> = Arc::new([input.clone()].iter().cloned().collect());
    let added: Arc<Mutex<StorePathSet>> = Default::default();
    let sandbox: Mutex<SandboxState> = Default::default();

    add_dependency(&*store, &sandbox, &inputs, &added, &input).unwrap();
    assert!(added.lock().is_empty());
    // and twice over
    add_dependency(&*store, &sandbox, &inputs, &added, &input).unwrap();
    assert!(added.lock().is_empty());
  }

  #[test]
  fn non_chroot_add_just_records_the_path() {
    let (_d, store) = test_store();
    let extra = register_dummy(&store, "extra");
    let inputs: Arc<StorePathSet> = Default::default();
    let added: Arc<Mutex<StorePathSet>> = Default::default();
    let sandbox: Mutex<SandboxState> = Default::default();

    add_dependency(&*store, &sandbox, &inputs, &added, &extra).unwrap();
    assert!(added.lock().contains(&extra));
    assert!(is_allowed(&inputs, &added.lock(), &extra));
  }

  #[test]
  fn wire_protocol_round_trip() {
    let (_d, store) = test_store();
    let visible = register_dummy(&store, "visible");
    let inputs: Arc<StorePathSet> = Arc::new([visible.clone()].iter().cloned().collect());
    let added: Arc<Mutex<StorePathSet>> = Default::default();
    let dyn_store: Arc<dyn Store> = store.clone();
    let rs = Arc::new(RestrictedStore::new(dyn_store, caps_for(inputs, added)));

    let (client, server) = UnixStream::pair().unwrap();
    let rs2 = Arc::clone(&rs);
    let handle = std::thread::spawn(move || process_connection(&rs2, server));

    let mut w = client.try_clone().unwrap();
    let mut r = BufReader::new(client);

    writeln!(w, "valid {}", store.print_store_path(&visible)).unwrap();
    let mut line = String::new();
    r.read_line(&mut line).unwrap();
    assert_eq!(line.trim(), "1");

    line.clear();
    writeln!(w, "bogus-command x").unwrap();
    r.read_line(&mut line).unwrap();
    assert!(line.starts_with("error:"));

    drop(w);
    drop(r);
    handle.join().unwrap();
  }
}
