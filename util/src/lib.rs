#[macro_use] extern crate lazy_static;
#[macro_use] extern crate slog_scope;

#[doc(no_inline)] pub use anyhow::{anyhow, bail, ensure, Context as _, Result};
pub use hash::{Context as HashContext, Encoding, Hash, HashType, Sink as HashSink};
pub use nar::PathFilter;
pub use rusqlite::{named_params, params, OptionalExtension as _};
pub use sqlite::Sqlite;
use std::path::{Path, PathBuf};

pub mod base32;
pub mod hash;
pub mod logger;
pub mod nar;
pub mod pipe;
pub mod sqlite;

/// Split `s` around the first occurrence of `sep`, yielding the pieces on
/// either side. The separator itself is dropped.
pub fn break_str(s: &str, sep: char) -> Option<(&str, &str)> {
  let ix = s.find(sep)?;
  Some((&s[..ix], &s[ix + sep.len_utf8()..]))
}

pub trait PathExt {
  /// Like `join`, but treats absolute `other`s as relative, so that
  /// `"/chroot".append("/bin/sh")` is `/chroot/bin/sh`.
  fn append<P: AsRef<Path>>(&self, other: P) -> PathBuf;
}

impl PathExt for Path {
  fn append<P: AsRef<Path>>(&self, other: P) -> PathBuf {
    let other = other.as_ref();
    self.join(other.strip_prefix("/").unwrap_or(other))
  }
}

pub trait SliceExt<T> {
  fn take(&self, n: usize) -> &Self;
}

impl<T> SliceExt<T> for [T] {
  fn take(&self, n: usize) -> &Self {
    &self[0..std::cmp::min(n, self.len())]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn break_str_splits_once() {
    assert_eq!(break_str("a=b=c", '='), Some(("a", "b=c")));
    assert_eq!(break_str("abc", '='), None);
  }

  #[test]
  fn path_append_strips_leading_slash() {
    assert_eq!(
      Path::new("/chroot").append("/silo/store"),
      PathBuf::from("/chroot/silo/store")
    );
    assert_eq!(Path::new("/chroot").append("etc"), PathBuf::from("/chroot/etc"));
  }
}
