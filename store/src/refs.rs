use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::Path;

use silo_util::base32::IS_BASE32;

use super::prelude::*;

#[derive(Default)]
pub struct RefScanner {
  hashes: HashSet<Vec<u8>>,
  seen: HashSet<Vec<u8>>,
  tail: Vec<u8>,
}

const REF_LEN: usize = 32;

impl RefScanner {
  pub fn new<'a, I: Iterator<Item = &'a str>>(hash_parts: I) -> Self {
    let mut s = Self::default();
    for h in hash_parts {
      s.hashes.insert(h.as_bytes().to_vec());
    }
    s
  }

  pub fn seen(&self) -> &HashSet<Vec<u8>> {
    &self.seen
  }
}

impl Write for RefScanner {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.tail.extend(slice_take(buf, REF_LEN));
    search(&self.tail, &mut self.hashes, &mut self.seen);
    search(buf, &mut self.hashes, &mut self.seen);

    let tail_len = if buf.len() <= REF_LEN { buf.len() } else { REF_LEN };
    let sub_start = if self.tail.len() < REF_LEN - tail_len {
      0
    } else {
      self.tail.len() - (REF_LEN - tail_len)
    };
    self.tail = self.tail.split_off(sub_start);
    self.tail.extend(&buf[buf.len() - tail_len..]);

    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

fn slice_take<T>(s: &[T], take: usize) -> &[T] {
  if take > s.len() {
    s
  } else {
    &s[..take]
  }
}

fn search(data: &[u8], hashes: &mut HashSet<Vec<u8>>, seen: &mut HashSet<Vec<u8>>) {
  let len = data.len();

  let mut i = 0;
  while i + REF_LEN <= len {
    let mut matched = true;
    let mut j = REF_LEN - 1;
    while j > 0 {
      if !IS_BASE32[data[i + j] as usize] {
        i += j + 1;
        matched = false;
        break;
      }
      j -= 1;
    }
    if !matched {
      continue;
    }
    let maybe_ref = &data[i..i + REF_LEN];
    if hashes.remove(maybe_ref) {
      debug!(
        "found reference to {} at {}",
        String::from_utf8_lossy(maybe_ref),
        i
      );
      seen.insert(maybe_ref.to_vec());
    }
    i += 1;
  }
}

/// Serialize `path` as an archive and search the bytes for the hash parts of
/// `refs`, returning the subset that occurs.
pub fn scan_for_references<'a, P: AsRef<Path>, I: Iterator<Item = &'a StorePath>>(
  path: P,
  refs: I,
) -> Result<Vec<&'a StorePath>> {
  let mut s = RefScanner::default();
  let mut back_map = HashMap::new();

  for r in refs {
    s.hashes.insert(r.hash_part().into_bytes());
    back_map.insert(r.hash_part().into_bytes(), r);
  }

  nar::dump_path(path, &mut s, &PathFilter::none())?;

  let mut found = vec![];
  for path in s.seen {
    found.push(back_map.remove(&path).expect("item missing from back map"));
  }

  Ok(found)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;

  fn sample_paths() -> Vec<StorePath> {
    vec![
      StorePath::from_base_name("31w1qcvb3j8fgjvcqkrpxxwwlfx0ydcg-dep-one").unwrap(),
      StorePath::from_base_name("9mdqa9w1p6cmli6976v4wi0sw9r4p5pr-dep-two").unwrap(),
      StorePath::from_base_name("00000000000000000000000000000000-dep-three").unwrap(),
    ]
  }

  #[test]
  fn finds_references_in_file_contents() {
    let paths = sample_paths();
    let dir = tempfile::tempdir().unwrap();
    let f = dir.path().join("out");
    fs::write(
      &f,
      format!(
        "#!/bin/sh\nexec /silo/store/{}-dep-one/bin/tool\n",
        paths[0].hash_part()
      ),
    )
    .unwrap();

    let found = scan_for_references(&f, paths.iter()).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name(), "dep-one");
  }

  #[test]
  fn finds_reference_split_across_chunks() {
    let paths = sample_paths();
    let hash = paths[1].hash_part();
    let mut scanner = RefScanner::new(std::iter::once(hash.as_str()));

    let bytes = format!("prefix {} suffix", hash).into_bytes();
    // feed one byte at a time so the match always straddles a chunk boundary
    for b in &bytes {
      scanner.write_all(std::slice::from_ref(b)).unwrap();
    }
    assert!(scanner.seen().contains(hash.as_bytes()));
  }

  #[test]
  fn ignores_non_matching_hashes() {
    let paths = sample_paths();
    let dir = tempfile::tempdir().unwrap();
    let f = dir.path().join("out");
    fs::write(&f, "no references here, just 32 chars of text padding").unwrap();
    let found = scan_for_references(&f, paths.iter()).unwrap();
    assert!(found.is_empty());
  }
}
