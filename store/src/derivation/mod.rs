use crate::{prelude::*, FileIngestionMethod, HashType};
use std::{
  collections::{BTreeMap, BTreeSet},
  path::PathBuf,
};

mod options;

pub use options::{DerivationOptions, OutputChecks, OutputChecksVariant};

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct FixedOutputHash {
  pub method: FileIngestionMethod,
  pub hash: Hash,
}

impl FixedOutputHash {
  pub fn method_algo(&self) -> String {
    format!("{}{}", self.method.prefix(), self.hash.ty())
  }

  pub fn store_path<S: Store + ?Sized>(
    &self,
    store: &S,
    drv_name: &str,
    output_name: &str,
  ) -> Result<StorePath> {
    store.make_fixed_output_path(
      self.method,
      self.hash,
      &output_path_name(drv_name, output_name),
      &Default::default(),
      false,
    )
  }
}

#[derive(Debug, Eq, PartialEq, Clone, EnumAsInner)]
pub enum Output {
  /// Final path fixed by the input closure before the build starts.
  InputAddressed(StorePath),
  /// Final path fixed by a declared content hash; checked afterwards.
  Fixed(FixedOutputHash),
  /// Final path derived from the content hash once it is known.
  Floating(FileIngestionMethod, HashType),
  /// Not resolved yet; must never reach the builder.
  Deferred,
  /// Like floating, but never cached between runs.
  Impure(FileIngestionMethod, HashType),
}

impl Output {
  /// The output's final store path, when it is known a priori.
  pub fn path<S: Store + ?Sized>(
    &self,
    store: &S,
    drv_name: &str,
    output_name: &str,
  ) -> Result<Option<StorePath>> {
    Ok(match self {
      Self::InputAddressed(p) => Some(p.clone()),
      Self::Fixed(f) => Some(f.store_path(store, drv_name, output_name)?),
      Self::Floating(..) | Self::Deferred | Self::Impure(..) => None,
    })
  }
}

pub fn output_path_name(drv_name: impl AsRef<str>, output_name: impl AsRef<str>) -> String {
  let drv_name = drv_name.as_ref();
  let output_name = output_name.as_ref();
  if output_name == "out" {
    drv_name.to_string()
  } else {
    format!("{}-{}", drv_name, output_name)
  }
}

#[derive(Default, Debug, Clone)]
pub struct Derivation {
  pub name: String,
  pub builder: PathBuf,
  pub platform: String,
  pub args: Vec<String>,
  pub ty: DerivationType,
  pub env: BTreeMap<String, String>,
  pub input_sources: BTreeSet<StorePath>,
  pub outputs: BTreeMap<String, Output>,
  pub input_derivations: BTreeMap<StorePath, BTreeSet<String>>,
  /// The parsed `__json` payload, when the derivation uses structured
  /// attributes instead of plain environment bindings.
  pub structured_attrs: Option<serde_json::Value>,
}

pub type OutputsAndPaths = BTreeMap<String, (Output, Option<StorePath>)>;

impl Derivation {
  pub fn is_builtin(&self) -> bool {
    self.builder.to_string_lossy().starts_with("builtin:")
  }

  pub fn as_builtin(&self) -> Option<String> {
    self
      .builder
      .to_string_lossy()
      .strip_prefix("builtin:")
      .map(|x| x.to_string())
  }

  pub fn is_fixed(&self) -> bool {
    self.ty.is_fixed()
  }

  pub fn is_impure(&self) -> bool {
    self.ty.is_impure()
  }

  /// A sandboxed derivation may not observe the network or impure host
  /// state.
  pub fn is_sandboxed(&self) -> bool {
    self.ty.is_sandboxed()
  }

  pub fn outputs_and_opt_paths<S: Store + ?Sized>(&self, store: &S) -> Result<OutputsAndPaths> {
    let mut res = BTreeMap::new();
    for (name, out) in &self.outputs {
      res.insert(
        name.clone(),
        (out.clone(), out.path(store, &self.name, name)?),
      );
    }
    Ok(res)
  }
}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug)]
pub enum DerivationType {
  InputAddressed,
  DeferredInputAddressed,
  Fixed,
  Floating,
  Impure,
}

impl DerivationType {
  pub fn is_fixed(self) -> bool {
    matches!(self, Self::Fixed)
  }

  pub fn is_impure(self) -> bool {
    matches!(self, Self::Impure)
  }

  pub fn is_content_addressed(self) -> bool {
    matches!(self, Self::Fixed | Self::Floating | Self::Impure)
  }

  pub fn is_sandboxed(self) -> bool {
    !matches!(self, Self::Fixed | Self::Impure)
  }
}

impl Default for DerivationType {
  fn default() -> Self {
    Self::InputAddressed
  }
}
