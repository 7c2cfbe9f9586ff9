//! Hash-part rewriting: string substitution over environment values going
//! into the build, and over output bytes coming out of it.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::Path;

use crate::prelude::*;

/// Apply every mapping in `rewrites` to `s`. Mappings are hash parts, all
/// of one fixed length, so the result is independent of application order.
pub fn rewrite_strings(s: &str, rewrites: &HashMap<String, String>) -> String {
  let mut s = Cow::Borrowed(s);
  for (from, to) in rewrites {
    if from == to {
      continue;
    }
    if s.contains(from.as_str()) {
      s = Cow::Owned(s.replace(from.as_str(), to));
    }
  }
  s.into_owned()
}

/// A writer that substitutes fixed-length byte patterns in the stream
/// before forwarding. Holds back a tail of `max_pattern_len - 1` bytes so
/// matches straddling write boundaries are still seen; `flush_tail` must be
/// called once the stream ends.
pub struct RewritingWriter<W> {
  rewrites: Vec<(Vec<u8>, Vec<u8>)>,
  max_len: usize,
  buf: Vec<u8>,
  inner: W,
}

impl<W: Write> RewritingWriter<W> {
  pub fn new(rewrites: &HashMap<String, String>, inner: W) -> Self {
    let rewrites: Vec<(Vec<u8>, Vec<u8>)> = rewrites
      .iter()
      .filter(|(f, t)| f != t)
      .map(|(f, t)| (f.as_bytes().to_vec(), t.as_bytes().to_vec()))
      .collect();
    let max_len = rewrites.iter().map(|(f, _)| f.len()).max().unwrap_or(0);
    Self {
      rewrites,
      max_len,
      buf: vec![],
      inner,
    }
  }

  fn rewrite_buf(&mut self) {
    if self.rewrites.is_empty() {
      return;
    }
    let mut i = 0;
    'outer: while i < self.buf.len() {
      for (from, to) in &self.rewrites {
        if self.buf[i..].starts_with(from) {
          self.buf.splice(i..i + from.len(), to.iter().copied());
          i += to.len();
          continue 'outer;
        }
      }
      i += 1;
    }
  }

  /// Emit everything that can no longer be part of a match.
  fn drain_settled(&mut self) -> io::Result<()> {
    if self.max_len == 0 {
      self.inner.write_all(&self.buf)?;
      self.buf.clear();
      return Ok(());
    }
    if self.buf.len() >= self.max_len {
      let keep = self.max_len - 1;
      let settled = self.buf.len() - keep;
      self.inner.write_all(&self.buf[..settled])?;
      self.buf.drain(..settled);
    }
    Ok(())
  }

  pub fn flush_tail(mut self) -> io::Result<W> {
    self.rewrite_buf();
    self.inner.write_all(&self.buf)?;
    self.inner.flush()?;
    Ok(self.inner)
  }
}

impl<W: Write> Write for RewritingWriter<W> {
  fn write(&mut self, data: &[u8]) -> io::Result<usize> {
    self.buf.extend_from_slice(data);
    self.rewrite_buf();
    self.drain_settled()?;
    Ok(data.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    self.inner.flush()
  }
}

/// Archive `path` and hash the serialisation.
pub fn hash_path(path: &Path, method: crate::FileIngestionMethod) -> Result<(Hash, usize)> {
  let mut sink = HashSink::new(HashType::SHA256, std::io::sink());
  dump_by_method(path, method, &mut sink)?;
  let (_, hash, len) = sink.finish();
  Ok((hash, len))
}

/// Hash `path` with every occurrence of `modulo` (a hash part) replaced by
/// zeroes, so self-references do not influence the content hash.
pub fn hash_path_modulo(
  path: &Path,
  algo: HashType,
  method: crate::FileIngestionMethod,
  modulo: &str,
) -> Result<(Hash, usize)> {
  let mut rewrites = HashMap::new();
  rewrites.insert(modulo.to_string(), "0".repeat(modulo.len()));

  let sink = HashSink::new(algo, std::io::sink());
  let mut rewriter = RewritingWriter::new(&rewrites, sink);
  dump_by_method(path, method, &mut rewriter)?;
  let sink = rewriter.flush_tail()?;
  let (_, hash, _) = sink.finish();

  // the size still reflects the original bytes
  let (_, len) = hash_path(path, method)?;
  Ok((hash, len))
}

fn dump_by_method<W: std::io::Write>(
  path: &Path,
  method: crate::FileIngestionMethod,
  sink: &mut W,
) -> Result<()> {
  match method {
    crate::FileIngestionMethod::Recursive => nar::dump_path(path, sink, &PathFilter::none()),
    crate::FileIngestionMethod::Flat => {
      let mut f = std::fs::File::open(path)?;
      std::io::copy(&mut f, sink)?;
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::FileIngestionMethod;
  use std::fs;

  const H1: &str = "31w1qcvb3j8fgjvcqkrpxxwwlfx0ydcg";
  const H2: &str = "9mdqa9w1p6cmli6976v4wi0sw9r4p5pr";

  fn table(from: &str, to: &str) -> HashMap<String, String> {
    let mut t = HashMap::new();
    t.insert(from.to_string(), to.to_string());
    t
  }

  #[test]
  fn rewrite_strings_replaces_all_occurrences() {
    let t = table(H1, H2);
    let s = format!("/silo/store/{h}-x /silo/store/{h}-y", h = H1);
    let out = rewrite_strings(&s, &t);
    assert!(!out.contains(H1));
    assert_eq!(out.matches(H2).count(), 2);
  }

  #[test]
  fn rewriting_is_self_inverse_over_the_two_tables() {
    // applying outputRewrites to the image of inputRewrites restores the
    // original hash
    let input = table(H1, H2);
    let output = table(H2, H1);
    let s = format!("ref: {}", H1);
    assert_eq!(rewrite_strings(&rewrite_strings(&s, &input), &output), s);
  }

  #[test]
  fn writer_matches_across_chunk_boundaries() {
    let t = table(H1, H2);
    let data = format!("prefix {} suffix", H1).into_bytes();

    let mut w = RewritingWriter::new(&t, Vec::<u8>::new());
    for b in &data {
      w.write_all(std::slice::from_ref(b)).unwrap();
    }
    let out = w.flush_tail().unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), format!("prefix {} suffix", H2));
  }

  #[test]
  fn writer_passes_through_without_rewrites() {
    let t = HashMap::new();
    let mut w = RewritingWriter::new(&t, Vec::<u8>::new());
    w.write_all(b"some bytes").unwrap();
    let out = w.flush_tail().unwrap();
    assert_eq!(out, b"some bytes");
  }

  #[test]
  fn modulo_hash_ignores_self_reference_location() {
    // two files that differ only in their (zeroed-out) self hash part
    // produce the same modulo hash
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    fs::write(&a, format!("link to /silo/store/{}-self", H1)).unwrap();
    fs::write(&b, format!("link to /silo/store/{}-self", H2)).unwrap();

    let (ha, _) = hash_path_modulo(&a, HashType::SHA256, FileIngestionMethod::Flat, H1).unwrap();
    let (hb, _) = hash_path_modulo(&b, HashType::SHA256, FileIngestionMethod::Flat, H2).unwrap();
    assert_eq!(ha, hb);

    // while a reference to something else does change the hash
    let c = dir.path().join("c");
    fs::write(&c, format!("link to /silo/store/{}-other", H2)).unwrap();
    let (hc, _) = hash_path_modulo(&c, HashType::SHA256, FileIngestionMethod::Flat, H1).unwrap();
    assert_ne!(ha, hc);
  }

  #[test]
  fn flat_and_recursive_hashes_differ() {
    let dir = tempfile::tempdir().unwrap();
    let f = dir.path().join("f");
    fs::write(&f, "hello").unwrap();
    let (flat, flat_len) = hash_path(&f, FileIngestionMethod::Flat).unwrap();
    let (rec, _) = hash_path(&f, FileIngestionMethod::Recursive).unwrap();
    assert_eq!(flat_len, 5);
    assert_ne!(flat, rec);
  }
}
