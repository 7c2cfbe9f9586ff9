#[macro_use] extern crate derivative;
#[macro_use] extern crate enum_as_inner;
#[macro_use] extern crate slog_scope;

use anyhow::Result;
use prelude::StorePath;
use silo_util::*;
use std::{
  collections::BTreeSet,
  fmt::Write as _,
  path::{Path, PathBuf},
};

pub mod build;
pub mod canonicalise;
pub mod derivation;
mod local;
pub mod lock;
pub mod path;
pub mod path_info;
mod prelude;
pub mod refs;
pub mod settings;

pub use build::{
  BuildOutcome, DerivationBuilder, DerivationBuilderCallbacks, DerivationBuilderParams,
  FailureKind, InitialOutput, InitialOutputStatus, PathStatus, SingleDrvOutputs,
};
pub use derivation::{Derivation, DerivationOptions, DerivationType, Output};
pub use local::LocalStore;
pub use path_info::{DrvOutput, Realisation, ValidPathInfo};
pub use prelude::FileIngestionMethod;
pub use settings::{BuildMode, SandboxMode, Settings};

pub type PathSet = BTreeSet<String>;
pub type StorePathSet = BTreeSet<StorePath>;

/// The store interface the derivation builder consumes. Path naming and
/// validity registration live here; scheduling and substitution do not.
pub trait Store: Send + Sync {
  /// The logical store directory, as seen by builders.
  fn store_path(&self) -> &Path;

  /// The directory where store paths physically live. Differs from
  /// `store_path` for diverted stores, which forces chroot builds.
  fn real_store_dir(&self) -> &Path {
    self.store_path()
  }

  fn parse_store_path(&self, path: &Path) -> Result<StorePath> {
    if path.parent() != Some(self.store_path()) {
      bail!(
        "path `{}' is not a direct descendant of the store",
        path.display()
      );
    }

    StorePath::from_base_name(
      path
        .file_name()
        .and_then(|x| x.to_str())
        .ok_or_else(|| anyhow!("invalid filepath"))?,
    )
  }

  fn print_store_path(&self, path: &StorePath) -> String {
    self.store_path().join(path.to_string()).display().to_string()
  }

  fn to_real_path(&self, path: &StorePath) -> PathBuf {
    self.real_store_dir().join(path.to_string())
  }

  fn is_in_store(&self, path: &Path) -> bool {
    path.starts_with(self.store_path())
  }

  fn is_valid_path(&self, path: &StorePath) -> Result<bool> {
    self.query_path_info(path).map(|x| x.is_some())
  }

  fn make_store_path(&self, path_type: &str, hash: Hash, name: &str) -> Result<StorePath> {
    let ident = format!(
      "{}:{}:{}:{}",
      path_type,
      hash.encode_with_type(Encoding::Base16),
      self.store_path().display(),
      name
    );
    let hash = Hash::hash(&ident, HashType::SHA256).truncate(20).into_owned();
    StorePath::from_parts(hash.as_bytes(), name)
  }

  fn make_output_path(&self, id: &str, hash: Hash, name: &str) -> Result<StorePath> {
    if id == "out" {
      self.make_store_path(&format!("output:{}", id), hash, name)
    } else {
      self.make_store_path(&format!("output:{}", id), hash, &format!("{}-{}", name, id))
    }
  }

  fn make_fixed_output_path(
    &self,
    method: FileIngestionMethod,
    hash: Hash,
    name: &str,
    refs: &StorePathSet,
    self_referential: bool,
  ) -> Result<StorePath> {
    if hash.ty() == HashType::SHA256 && method == FileIngestionMethod::Recursive {
      self.make_store_path(
        &make_type(self, "source".into(), refs, self_referential),
        hash,
        name,
      )
    } else {
      ensure!(
        refs.is_empty(),
        "fixed-output paths with references may only be recursive SHA256"
      );
      self.make_store_path(
        "output:out",
        Hash::hash(
          format!(
            "fixed:out:{prefix}:{hash}:",
            prefix = method.prefix(),
            hash = hash.encode_with_type(Encoding::Base16)
          ),
          HashType::SHA256,
        ),
        name,
      )
    }
  }

  /// Extend `closure` with the transitive reference closure of `path`.
  fn compute_fs_closure(&self, path: &StorePath, closure: &mut StorePathSet) -> Result<()>;

  fn query_path_info(&self, path: &StorePath) -> Result<Option<ValidPathInfo>>;

  fn get_path_info(&self, path: &StorePath) -> Result<ValidPathInfo> {
    self
      .query_path_info(path)?
      .ok_or_else(|| anyhow!("path {} is not valid", self.print_store_path(path)))
  }

  /// Register the validity of all `infos` in one atomic commit.
  fn register_valid_paths(&self, infos: Vec<ValidPathInfo>) -> Result<()>;

  fn register_valid_path(&self, info: ValidPathInfo) -> Result<()> {
    self.register_valid_paths(vec![info])
  }

  /// Record the mapping from a derivation output to the path that realises
  /// it.
  fn register_realisation(&self, realisation: &Realisation) -> Result<()>;

  fn query_realisation(&self, id: &DrvOutput) -> Result<Option<Realisation>>;

  /// Attach signatures from the configured secret key, if any.
  fn sign_path_info(&self, _info: &mut ValidPathInfo) -> Result<()> {
    Ok(())
  }

  fn sign_realisation(&self, _realisation: &mut Realisation) -> Result<()> {
    Ok(())
  }

  /// Protect `path` from garbage collection for the lifetime of this
  /// process.
  fn add_temp_root(&self, path: &StorePath) -> Result<()>;

  /// The closure of `roots`, restricted to `allowed`; used to serialize
  /// `exportReferencesGraph` data into the build's temp dir.
  fn export_references(&self, roots: &StorePathSet, allowed: &StorePathSet) -> Result<StorePathSet> {
    let mut closure = StorePathSet::new();
    for r in roots {
      self.compute_fs_closure(r, &mut closure)?;
    }
    for p in &closure {
      ensure!(
        allowed.contains(p),
        "cannot export references of path `{}' because it is not in the input closure of the derivation",
        self.print_store_path(p)
      );
    }
    Ok(closure)
  }

  /// The plain-text validity registration format: one stanza per path with
  /// its deriver and references, consumable by tooling inside the sandbox.
  fn make_validity_registration(&self, paths: &StorePathSet) -> Result<String> {
    let mut s = String::new();
    for path in paths {
      let info = self.get_path_info(path)?;
      writeln!(s, "{}", self.print_store_path(path))?;
      match &info.deriver {
        Some(d) => writeln!(s, "{}", self.print_store_path(d))?,
        None => writeln!(s)?,
      }
      writeln!(s, "{}", info.refs.len())?;
      for r in &info.refs {
        writeln!(s, "{}", self.print_store_path(r))?;
      }
    }
    Ok(s)
  }
}

fn make_type<S: Store + ?Sized>(
  store: &S,
  mut ty: String,
  refs: &StorePathSet,
  self_referential: bool,
) -> String {
  for r in refs {
    ty.push(':');
    ty.push_str(&store.print_store_path(r));
  }
  if self_referential {
    ty.push_str(":self");
  }
  ty
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn store_paths_depend_on_type_and_name() {
    let dir = tempfile::tempdir().unwrap();
    let store =
      LocalStore::open_at(dir.path().join("root"), std::sync::Arc::new(Settings::default()))
        .unwrap();
    let zero = Hash::zeroes(HashType::SHA256);
    let a = store.make_store_path("rewrite:x:name:out", zero, "foo").unwrap();
    let b = store.make_store_path("rewrite:x:name:dev", zero, "foo").unwrap();
    let c = store.make_store_path("rewrite:x:name:out", zero, "bar").unwrap();
    assert_ne!(a.hash_part(), b.hash_part());
    assert_ne!(a.hash_part(), c.hash_part());
    assert_eq!(a.name(), "foo");
  }

  #[test]
  fn fixed_output_paths_distinguish_methods() {
    let dir = tempfile::tempdir().unwrap();
    let store =
      LocalStore::open_at(dir.path().join("root"), std::sync::Arc::new(Settings::default()))
        .unwrap();
    let h = Hash::hash("hello", HashType::SHA256);
    let flat = store
      .make_fixed_output_path(FileIngestionMethod::Flat, h, "x", &Default::default(), false)
      .unwrap();
    let rec = store
      .make_fixed_output_path(FileIngestionMethod::Recursive, h, "x", &Default::default(), false)
      .unwrap();
    assert_ne!(flat, rec);
  }
}
