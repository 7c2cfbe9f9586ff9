pub use crate::{
  derivation::{Derivation, DerivationType, Output},
  path::{Hash as StorePathHash, Path as StorePath},
  path_info::{DrvOutput, Realisation, ValidPathInfo},
  Store,
};
pub use anyhow::{Context as _, Result};
pub use silo_util::*;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum FileIngestionMethod {
  Flat,
  Recursive,
}

impl FileIngestionMethod {
  pub fn prefix(&self) -> &'static str {
    match self {
      Self::Flat => "",
      Self::Recursive => "r:",
    }
  }
}
