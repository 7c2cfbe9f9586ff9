use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::time::SystemTime;

use crate::{prelude::*, StorePathSet};

#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct ValidPathInfo {
  pub path: StorePath,
  pub deriver: Option<StorePath>,
  pub nar_hash: Hash,
  pub nar_size: Option<usize>,
  pub refs: StorePathSet,
  pub registration_time: Option<SystemTime>,
  pub ultimate: bool,
  pub sigs: BTreeSet<String>,
  /// Content-address descriptor, e.g. `fixed:r:sha256:...`, when the path is
  /// content-addressed.
  pub ca: Option<String>,
  // for sqlite
  #[derivative(Debug = "ignore")]
  pub(crate) id: i64,
}

impl ValidPathInfo {
  pub fn new(path: StorePath, nar_hash: Hash) -> Self {
    Self {
      path,
      nar_hash,
      deriver: None,
      nar_size: None,
      refs: Default::default(),
      registration_time: None,
      ultimate: false,
      sigs: Default::default(),
      ca: None,
      id: 0,
    }
  }

  pub(crate) fn registration_time_sql(&self) -> i64 {
    self
      .registration_time
      .unwrap_or_else(SystemTime::now)
      .duration_since(SystemTime::UNIX_EPOCH)
      .map(|d| d.as_secs() as i64)
      .unwrap_or(0)
  }
}

impl PartialEq for ValidPathInfo {
  fn eq(&self, other: &Self) -> bool {
    self.path == other.path && self.nar_hash == other.nar_hash && self.refs == other.refs
  }
}

impl Eq for ValidPathInfo {}

impl std::hash::Hash for ValidPathInfo {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.nar_hash.hash(state)
  }
}

/// The identity of a single derivation output: the derivation's hash-modulo
/// joined with the output name.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DrvOutput {
  pub drv_hash: Hash,
  pub output_name: String,
}

impl Display for DrvOutput {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}!{}",
      self.drv_hash.encode_with_type(Encoding::Base16),
      self.output_name
    )
  }
}

/// The final mapping from a logical output name to an installed store path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Realisation {
  pub id: DrvOutput,
  pub out_path: StorePath,
  pub signatures: BTreeSet<String>,
}
