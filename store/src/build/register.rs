//! Post-build output registration: validate what the builder left behind,
//! scan and rewrite references, order the outputs, and install them into
//! the store atomically.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use crate::canonicalise::{canonicalise_path_meta_data, InodesSeen};
use crate::derivation::output_path_name;
use crate::lock::PathLocks;
use crate::prelude::*;
use crate::refs::scan_for_references;
use crate::settings::{BuildMode, Settings};
use crate::{FileIngestionMethod, Output, StorePathSet};

use super::rewrite::{hash_path, hash_path_modulo, RewritingWriter};
use super::{BuildError, DerivationBuilder, SingleDrvOutputs};

const CHECK_SUFFIX: &str = ".check";

enum Disposition {
  /// Valid before the build started; treated as a leaf.
  AlreadyRegistered { path: StorePath },
  NeedsRegister { refs: StorePathSet },
}

struct RewrittenRefs {
  self_ref: bool,
  others: StorePathSet,
}

impl DerivationBuilder {
  pub(crate) fn register_outputs(&mut self) -> Result<SingleDrvOutputs> {
    let mut infos: BTreeMap<String, ValidPathInfo> = BTreeMap::new();
    let mut inodes_seen = InodesSeen::default();
    let mut delayed_error: Option<anyhow::Error> = None;

    // everything an output may legitimately reference
    let mut referenceable = StorePathSet::new();
    referenceable.extend(self.input_paths.iter().cloned());
    referenceable.extend(self.scratch_outputs.values().cloned());
    referenceable.extend(self.added_paths.lock().iter().cloned());

    let mut dispositions: BTreeMap<String, Disposition> = BTreeMap::new();
    let mut output_stats: HashMap<String, fs::Metadata> = HashMap::new();

    for output_name in self.drv.outputs.keys() {
      let scratch = self.scratch_outputs.get(output_name).ok_or_else(|| {
        BuildError::Internal(format!("no scratch output for '{}'", output_name))
      })?;
      let actual_path = self.to_real_path_chroot(scratch);

      let initial = self.initial_outputs.get_mut(output_name).ok_or_else(|| {
        BuildError::Internal(format!("no initial output for '{}'", output_name))
      })?;

      // already-valid outputs are only re-examined in check mode
      initial.wanted = self.build_mode == BuildMode::Check
        || !initial.known.as_ref().map_or(false, |k| k.is_valid());
      if !initial.wanted {
        dispositions.insert(
          output_name.clone(),
          Disposition::AlreadyRegistered {
            path: initial.known.as_ref().expect("unwanted output must be known").path.clone(),
          },
        );
        continue;
      }

      let st = fs::symlink_metadata(&actual_path).map_err(|_| {
        BuildError::Rejected(format!(
          "builder for '{}' failed to produce output path for output '{}' at '{}'",
          self.store.print_store_path(&self.drv_path),
          output_name,
          actual_path.display()
        ))
      })?;

      // group- or world-writable outputs mean someone else may have
      // interfered; symlink modes are meaningless and exempt
      let foreign_owner = self
        .build_user
        .as_ref()
        .map_or(false, |u| st.uid() != u.uid().as_raw());
      if (!st.file_type().is_symlink() && st.mode() & 0o022 != 0) || foreign_owner {
        return Err(
          BuildError::Rejected(format!(
            "suspicious ownership or permission on '{}' for output '{}'; rejecting this build \
             output",
            actual_path.display(),
            output_name
          ))
          .into(),
        );
      }

      // canonicalise before rewriting so we never rewrite through a
      // hard link into something like /etc/shadow
      canonicalise_path_meta_data(&actual_path, self.uid_range(), &mut inodes_seen)?;

      let discard = self
        .options
        .unsafe_discard_references
        .get(output_name)
        .copied()
        .unwrap_or(false);

      let references = if discard {
        debug!("discarding references of output '{}'", output_name);
        StorePathSet::new()
      } else {
        debug!(
          "scanning for references for output '{}' in temp location '{}'",
          output_name,
          actual_path.display()
        );
        scan_for_references(&actual_path, referenceable.iter())?
          .into_iter()
          .cloned()
          .collect()
      };

      dispositions.insert(output_name.clone(), Disposition::NeedsRegister { refs: references });
      output_stats.insert(output_name.clone(), st);
    }

    // edges: output A references the scratch path of output B
    let mut reference_graph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, disp) in &dispositions {
      let referenced = match disp {
        Disposition::AlreadyRegistered { .. } => BTreeSet::new(),
        Disposition::NeedsRegister { refs } => {
          let mut referenced = BTreeSet::new();
          for r in refs {
            for (other, scratch) in &self.scratch_outputs {
              if r == scratch {
                referenced.insert(other.clone());
              }
            }
          }
          referenced
        }
      };
      reference_graph.insert(name.clone(), referenced);
    }

    let sorted_names = finalization_order(&reference_graph).map_err(|(output, parent)| {
      BuildError::ReferenceCycle {
        drv: self.store.print_store_path(&self.drv_path),
        output,
        parent,
      }
    })?;

    for output_name in sorted_names {
      let output = self.drv.outputs.get(&output_name).cloned().ok_or_else(|| {
        BuildError::Internal(format!("unknown output '{}'", output_name))
      })?;
      let scratch_path = self.scratch_outputs[&output_name].clone();
      let mut actual_path = self.to_real_path_chroot(&scratch_path);

      let references = match dispositions.get(&output_name) {
        Some(Disposition::AlreadyRegistered { path }) => {
          let final_path = path.clone();
          self.install_output_rewrite(&scratch_path, &final_path);
          continue;
        }
        Some(Disposition::NeedsRegister { refs }) => refs.clone(),
        None => {
          return Err(
            BuildError::Internal(format!("no output reference entry for '{}'", output_name)).into(),
          )
        }
      };

      let mut new_info = match &output {
        Output::InputAddressed(required_final_path) => {
          // the rewrite rule goes in first so the archival hash reflects
          // normalized self-references
          self.install_output_rewrite(&scratch_path, required_final_path);
          rewrite_output_in_place(&actual_path, &self.output_rewrites, &mut inodes_seen)?;
          let (nar_hash, nar_size) = hash_path(&actual_path, FileIngestionMethod::Recursive)?;
          let rewritten = self.rewrite_refs(&references, &scratch_path);
          let mut info = ValidPathInfo::new(required_final_path.clone(), nar_hash);
          info.nar_size = Some(nar_size);
          info.refs = rewritten.others;
          if rewritten.self_ref {
            info.refs.insert(info.path.clone());
          }
          info
        }

        Output::Fixed(fixed) => {
          let mut info = self.new_info_from_ca(
            &output_name,
            &scratch_path,
            &actual_path,
            &references,
            fixed.method,
            fixed.hash.ty(),
            &output_stats,
            &mut inodes_seen,
          )?;

          let got = info
            .ca_hash
            .expect("content-addressed info must carry its hash");
          if got != fixed.hash {
            // raised only after the path is registered, so the bad
            // output can be inspected and diffed
            self.callbacks.note_hash_mismatch();
            delayed_error = Some(
              BuildError::HashMismatch {
                drv: self.store.print_store_path(&self.drv_path),
                specified: fixed.hash.encode_with_type(Encoding::SRI),
                got: got.encode_with_type(Encoding::SRI),
              }
              .into(),
            );
          }
          if !info.info.refs.is_empty() {
            delayed_error = Some(
              BuildError::Rejected(format!(
                "fixed-output derivations must not reference store paths: '{}' references {} \
                 distinct paths, e.g. '{}'",
                self.store.print_store_path(&self.drv_path),
                info.info.refs.len(),
                self.store.print_store_path(info.info.refs.iter().next().unwrap())
              ))
              .into(),
            );
          }
          info.info
        }

        Output::Floating(method, algo) | Output::Impure(method, algo) => {
          self
            .new_info_from_ca(
              &output_name,
              &scratch_path,
              &actual_path,
              &references,
              *method,
              *algo,
              &output_stats,
              &mut inodes_seen,
            )?
            .info
        }

        Output::Deferred => {
          // resolution happens before a derivation reaches this builder
          return Err(
            BuildError::Internal(format!(
              "deferred output '{}' in build of '{}'",
              output_name,
              self.store.print_store_path(&self.drv_path)
            ))
            .into(),
          );
        }
      };

      canonicalise_path_meta_data(&actual_path, None, &mut inodes_seen)?;

      let final_dest_path = self.store.to_real_path(&new_info.path);

      // floating CA paths (and hash-mismatched fixed ones) were never
      // locked by the scheduler, so lock them here
      let mut dynamic_lock = PathLocks::new();
      dynamic_lock.set_deletion(true);
      let statically_known = output
        .path(&*self.store, &self.drv.name, &output_name)?
        .map_or(false, |p| p == new_info.path);
      if !statically_known {
        dynamic_lock.lock_paths(&[final_dest_path.clone()])?;
      }

      if final_dest_path != actual_path {
        match self.build_mode {
          BuildMode::Repair => {
            replace_valid_path(&final_dest_path, &actual_path)?;
            actual_path = final_dest_path.clone();
          }
          BuildMode::Check => {
            // leave the new tree beside the old one for comparison
          }
          BuildMode::Normal => {
            if self.store.is_valid_path(&new_info.path)? {
              // a content-addressed twin produced by someone else
            } else {
              rm_rf::ensure_removed(&final_dest_path)?;
              move_path(&actual_path, &final_dest_path)?;
              actual_path = final_dest_path.clone();
            }
          }
        }
      }

      if self.build_mode == BuildMode::Check {
        self.check_determinism(&output_name, &new_info, &actual_path, &final_dest_path)?;
        continue;
      }

      for i in self.input_paths.iter() {
        if new_info.refs.contains(i) {
          debug!("referenced input: '{}'", self.store.print_store_path(i));
        } else {
          debug!("unreferenced input: '{}'", self.store.print_store_path(i));
        }
      }

      self.callbacks.mark_contents_good(&new_info.path);

      new_info.deriver = Some(self.drv_path.clone());
      new_info.ultimate = true;
      self.store.sign_path_info(&mut new_info)?;

      self.install_output_rewrite(&scratch_path, &new_info.path);

      // a dynamically-located path must be on record before its lock is
      // dropped at the end of this iteration
      if new_info.ca.is_some() {
        self.store.register_valid_path(new_info.clone())?;
      }

      infos.insert(output_name, new_info);
    }

    if self.build_mode == BuildMode::Check {
      // a fixed-output mismatch on a check build is a non-determinism
      // signal too
      if let Some(e) = delayed_error {
        return Err(e);
      }
      return self.callbacks.assert_path_validity();
    }

    self.check_outputs(&infos)?;

    // one commit covers every output: either all become valid or none
    self
      .store
      .register_valid_paths(infos.values().cloned().collect())?;

    if let Some(e) = delayed_error {
      return Err(e);
    }

    let mut built_outputs = SingleDrvOutputs::new();
    for (output_name, new_info) in infos {
      let initial = self
        .initial_outputs
        .get(&output_name)
        .ok_or_else(|| BuildError::Internal(format!("no initial output for '{}'", output_name)))?;
      let mut realisation = Realisation {
        id: DrvOutput {
          drv_hash: initial.output_hash,
          output_name: output_name.clone(),
        },
        out_path: new_info.path.clone(),
        signatures: Default::default(),
      };
      if !self.drv.is_impure() {
        self.store.sign_realisation(&mut realisation)?;
        self.store.register_realisation(&realisation)?;
      }
      built_outputs.insert(output_name, realisation);
    }

    Ok(built_outputs)
  }

  fn install_output_rewrite(&mut self, scratch: &StorePath, final_path: &StorePath) {
    if scratch != final_path {
      self
        .output_rewrites
        .insert(scratch.hash_part(), final_path.hash_part());
    }
  }

  /// Map scanned references through the rewrites discovered so far. A
  /// self-reference is flagged rather than resolved, since the final path
  /// may not exist yet.
  fn rewrite_refs(&self, references: &StorePathSet, scratch_path: &StorePath) -> RewrittenRefs {
    let mut res = RewrittenRefs {
      self_ref: false,
      others: StorePathSet::new(),
    };
    for r in references {
      if r == scratch_path {
        res.self_ref = true;
      } else if let Some(rewritten) = self.output_rewrites.get(&r.hash_part()) {
        let base_name = format!("{}-{}", rewritten, r.name());
        match StorePath::from_base_name(&base_name) {
          Ok(p) => {
            res.others.insert(p);
          }
          Err(_) => {
            res.others.insert(r.clone());
          }
        }
      } else {
        res.others.insert(r.clone());
      }
    }
    res
  }

  /// Finalize a content-addressed output: rewrite, hash modulo the scratch
  /// self-reference, derive the final path, and rewrite again if the path
  /// moved.
  #[allow(clippy::too_many_arguments)]
  fn new_info_from_ca(
    &mut self,
    output_name: &str,
    scratch_path: &StorePath,
    actual_path: &Path,
    references: &StorePathSet,
    method: FileIngestionMethod,
    algo: HashType,
    output_stats: &HashMap<String, fs::Metadata>,
    inodes_seen: &mut InodesSeen,
  ) -> Result<CaInfo> {
    let st = output_stats
      .get(output_name)
      .ok_or_else(|| BuildError::Internal(format!("output '{}' has no stat info", output_name)))?;

    if method == FileIngestionMethod::Flat
      && (!st.file_type().is_file() || st.mode() & 0o100 != 0)
    {
      return Err(
        BuildError::Rejected(format!(
          "output path '{}' should be a non-executable regular file since recursive hashing is \
           not enabled",
          actual_path.display()
        ))
        .into(),
      );
    }

    rewrite_output_in_place(actual_path, &self.output_rewrites, inodes_seen)?;

    let old_hash_part = scratch_path.hash_part();
    let (got, _) = hash_path_modulo(actual_path, algo, method, &old_hash_part)?;

    let rewritten = self.rewrite_refs(references, scratch_path);

    let final_path = self.store.make_fixed_output_path(
      method,
      got,
      &output_path_name(&self.drv.name, output_name),
      &rewritten.others,
      rewritten.self_ref,
    )?;

    if *scratch_path != final_path {
      // self-references need to point at the path we just derived; the
      // content hash is unaffected since it was computed modulo them
      let mut self_rewrite = HashMap::new();
      self_rewrite.insert(old_hash_part, final_path.hash_part());
      rewrite_output_in_place(actual_path, &self_rewrite, inodes_seen)?;
    }

    let (nar_hash, nar_size) = hash_path(actual_path, FileIngestionMethod::Recursive)?;

    let mut info = ValidPathInfo::new(final_path, nar_hash);
    info.nar_size = Some(nar_size);
    info.refs = rewritten.others.clone();
    if rewritten.self_ref {
      info.refs.insert(info.path.clone());
    }
    info.ca = Some(format!(
      "fixed:{}{}:{}",
      method.prefix(),
      algo,
      got.encode(Encoding::Base32)
    ));

    Ok(CaInfo {
      info,
      ca_hash: Some(got),
    })
  }

  /// Check-mode comparison against the previously registered info.
  fn check_determinism(
    &mut self,
    _output_name: &str,
    new_info: &ValidPathInfo,
    actual_path: &Path,
    final_dest_path: &Path,
  ) -> Result<()> {
    if !self.store.is_valid_path(&new_info.path)? {
      return Ok(());
    }
    let mut old_info = self.store.get_path_info(&new_info.path)?;
    if new_info.nar_hash != old_info.nar_hash {
      self.callbacks.note_check_mismatch();
      if self.settings.run_diff_hook || self.settings.keep_failed {
        let dst = PathBuf::from(format!("{}{}", final_dest_path.display(), CHECK_SUFFIX));
        rm_rf::ensure_removed(&dst)?;
        move_path(actual_path, &dst)?;

        handle_diff_hook(
          &self.settings,
          self.build_user.as_ref().map(|u| (u.uid().as_raw(), u.gid().as_raw())),
          final_dest_path,
          &dst,
          &self.store.print_store_path(&self.drv_path),
          self.tmp_dir.as_deref().unwrap_or_else(|| Path::new("/")),
        );

        return Err(
          BuildError::NotDeterministic(format!(
            "derivation '{}' may not be deterministic: output '{}' differs from '{}'",
            self.store.print_store_path(&self.drv_path),
            final_dest_path.display(),
            dst.display()
          ))
          .into(),
        );
      }
      return Err(
        BuildError::NotDeterministic(format!(
          "derivation '{}' may not be deterministic: output '{}' differs",
          self.store.print_store_path(&self.drv_path),
          final_dest_path.display()
        ))
        .into(),
      );
    }

    // the build verified the path, so it is now ultimately trusted
    if !old_info.ultimate {
      old_info.ultimate = true;
      self.store.sign_path_info(&mut old_info)?;
      self.store.register_valid_path(old_info)?;
    }

    Ok(())
  }

  /// Apply the recipe's per-output restrictions: sizes, closure sizes, and
  /// reference allow/deny lists.
  fn check_outputs(&self, outputs: &BTreeMap<String, ValidPathInfo>) -> Result<()> {
    let outputs_by_path: BTreeMap<String, &ValidPathInfo> = outputs
      .values()
      .map(|info| (self.store.print_store_path(&info.path), info))
      .collect();

    for (output_name, info) in outputs {
      let checks = match self.options.checks_for_output(output_name) {
        Some(c) => c.clone(),
        None => continue,
      };

      // closures may cross between this build's outputs and the live
      // store, so walk both
      let get_closure = |start: &StorePath| -> Result<(StorePathSet, u64)> {
        let mut done = StorePathSet::new();
        let mut size = 0u64;
        let mut left = vec![start.clone()];
        while let Some(path) = left.pop() {
          if !done.insert(path.clone()) {
            continue;
          }
          if let Some(i) = outputs_by_path.get(&self.store.print_store_path(&path)) {
            size += i.nar_size.unwrap_or(0) as u64;
            left.extend(i.refs.iter().cloned());
          } else {
            let i = self.store.get_path_info(&path)?;
            size += i.nar_size.unwrap_or(0) as u64;
            left.extend(i.refs.iter().cloned());
          }
        }
        Ok((done, size))
      };

      if let Some(max) = checks.max_size {
        let size = info.nar_size.unwrap_or(0) as u64;
        if size > max {
          return Err(
            BuildError::Rejected(format!(
              "path '{}' is too large at {} bytes; limit is {} bytes",
              self.store.print_store_path(&info.path),
              size,
              max
            ))
            .into(),
          );
        }
      }

      if let Some(max) = checks.max_closure_size {
        let (_, closure_size) = get_closure(&info.path)?;
        if closure_size > max {
          return Err(
            BuildError::Rejected(format!(
              "closure of path '{}' is too large at {} bytes; limit is {} bytes",
              self.store.print_store_path(&info.path),
              closure_size,
              max
            ))
            .into(),
          );
        }
      }

      let parse_spec = |value: &BTreeSet<String>| -> Result<StorePathSet> {
        let mut spec = StorePathSet::new();
        for i in value {
          let as_path = Path::new(i);
          if self.store.is_in_store(as_path) {
            spec.insert(self.store.parse_store_path(as_path)?);
          } else if let Some(out) = outputs.get(i) {
            spec.insert(out.path.clone());
          } else {
            return Err(
              BuildError::Rejected(format!(
                "derivation '{}' output check for '{}' contains an illegal reference specifier \
                 '{}', expected store path or output name (one of [{}])",
                self.store.print_store_path(&self.drv_path),
                output_name,
                i,
                outputs.keys().cloned().collect::<Vec<_>>().join(", ")
              ))
              .into(),
            );
          }
        }
        Ok(spec)
      };

      let check_refs = |value: &BTreeSet<String>, allowed: bool, recursive: bool| -> Result<()> {
        let spec = parse_spec(value)?;

        let mut used = if recursive {
          get_closure(&info.path)?.0
        } else {
          info.refs.clone()
        };

        if recursive && checks.ignore_self_refs {
          used.remove(&info.path);
        }

        let bad_paths: Vec<_> = used
          .iter()
          .filter(|i| {
            if allowed {
              !spec.contains(*i)
            } else {
              spec.contains(*i)
            }
          })
          .collect();

        if !bad_paths.is_empty() {
          let mut bad = String::new();
          for i in bad_paths {
            bad.push_str("\n  ");
            bad.push_str(&self.store.print_store_path(i));
          }
          return Err(
            BuildError::Rejected(format!(
              "output '{}' is not allowed to refer to the following paths:{}",
              self.store.print_store_path(&info.path),
              bad
            ))
            .into(),
          );
        }
        Ok(())
      };

      // absent and present-but-empty allowlists mean different things
      if let Some(refs) = &checks.allowed_references {
        check_refs(refs, true, false)?;
      }
      if let Some(refs) = &checks.allowed_requisites {
        check_refs(refs, true, true)?;
      }
      if !checks.disallowed_references.is_empty() {
        check_refs(&checks.disallowed_references, false, false)?;
      }
      if !checks.disallowed_requisites.is_empty() {
        check_refs(&checks.disallowed_requisites, false, true)?;
      }
    }

    Ok(())
  }
}

struct CaInfo {
  info: ValidPathInfo,
  ca_hash: Option<Hash>,
}

/// Leaves-first ordering of outputs under "A references B" edges; `Err`
/// carries the two outputs closing a cycle.
pub(crate) fn finalization_order(
  references: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, (String, String)> {
  #[derive(PartialEq)]
  enum Mark {
    Active,
    Done,
  }

  fn visit(
    node: &str,
    references: &BTreeMap<String, BTreeSet<String>>,
    marks: &mut HashMap<String, Mark>,
    out: &mut Vec<String>,
  ) -> Result<(), (String, String)> {
    match marks.get(node) {
      Some(Mark::Done) => return Ok(()),
      Some(Mark::Active) => unreachable!("active nodes are caught at the edge"),
      None => {}
    }
    marks.insert(node.to_string(), Mark::Active);
    if let Some(refs) = references.get(node) {
      for r in refs {
        if r == node {
          continue;
        }
        if matches!(marks.get(r.as_str()), Some(Mark::Active)) {
          return Err((r.clone(), node.to_string()));
        }
        visit(r, references, marks, out)?;
      }
    }
    marks.insert(node.to_string(), Mark::Done);
    out.push(node.to_string());
    Ok(())
  }

  let mut marks = HashMap::new();
  let mut out = vec![];
  for node in references.keys() {
    visit(node, references, &mut marks, &mut out)?;
  }
  Ok(out)
}

/// Stream `path` through the rewriting writer into a fresh tree, then move
/// it back over the original.
pub(crate) fn rewrite_output_in_place(
  path: &Path,
  rewrites: &HashMap<String, String>,
  inodes_seen: &mut InodesSeen,
) -> Result<()> {
  if rewrites.is_empty() {
    return Ok(());
  }
  debug!("rewriting hashes in '{}'", path.display());

  let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));
  rm_rf::ensure_removed(&tmp_path)?;

  crossbeam::scope(|s| -> Result<()> {
    let (read_side, write_side) = pipe::new()?;

    let producer = s.spawn::<_, Result<()>>(move |_| {
      let mut rewriter = RewritingWriter::new(rewrites, write_side);
      nar::dump_path(path, &mut rewriter, &PathFilter::none())?;
      rewriter.flush_tail()?;
      Ok(())
    });

    nar::restore_path(&tmp_path, read_side)?;
    producer.join().unwrap()?;
    Ok(())
  })
  .unwrap()?;

  rm_rf::ensure_removed(path)?;
  move_path(&tmp_path, path)?;

  canonicalise_path_meta_data(path, None, inodes_seen)
}

/// Rename, temporarily making an unwritable directory writable so its `..`
/// entry can be updated.
pub(crate) fn move_path(src: &Path, dst: &Path) -> Result<()> {
  let st = fs::symlink_metadata(src)?;
  let change_perm =
    !nix::unistd::geteuid().is_root() && st.file_type().is_dir() && st.mode() & 0o200 == 0;

  if change_perm {
    super::chmod_path(src, st.mode() & 0o7777 | 0o200)?;
  }

  fs::rename(src, dst).with_context(|| {
    format!("cannot rename `{}' to `{}'", src.display(), dst.display())
  })?;

  if change_perm {
    super::chmod_path(dst, st.mode() & 0o7777)?;
  }

  Ok(())
}

static REPLACE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Replace `store_path` with `tmp_path` as atomically as two renames allow:
/// the original moves aside first, and comes back if the second rename
/// fails. An error while moving it back is fatal since the store is now
/// inconsistent.
pub(crate) fn replace_valid_path(store_path: &Path, tmp_path: &Path) -> Result<()> {
  let old_path = PathBuf::from(format!(
    "{}.old-{}-{}",
    store_path.display(),
    std::process::id(),
    REPLACE_COUNTER.fetch_add(1, Ordering::SeqCst)
  ));

  let had_original = store_path.exists();
  if had_original {
    move_path(store_path, &old_path)?;
  }

  if let Err(e) = move_path(tmp_path, store_path) {
    if had_original {
      move_path(&old_path, store_path)
        .with_context(|| "the store is now inconsistent: cannot restore the original path")?;
    }
    return Err(e);
  }

  if had_original {
    rm_rf::ensure_removed(&old_path)?;
  }
  Ok(())
}

/// Run the configured diff hook over the two differing trees, with a hard
/// deadline so a wedged hook cannot stall the build forever.
fn handle_diff_hook(
  settings: &Settings,
  creds: Option<(u32, u32)>,
  try_a: &Path,
  try_b: &Path,
  drv_path: &str,
  tmp_dir: &Path,
) {
  let hook = match (&settings.diff_hook, settings.run_diff_hook) {
    (Some(h), true) => h.clone(),
    _ => return,
  };

  let mut cmd = Command::new(&hook);
  cmd
    .arg(try_a)
    .arg(try_b)
    .arg(drv_path)
    .arg(tmp_dir)
    .current_dir("/")
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
  if let Some((uid, gid)) = creds {
    use std::os::unix::process::CommandExt;
    cmd.uid(uid).gid(gid);
  }

  let mut child = match cmd.spawn() {
    Ok(c) => c,
    Err(e) => {
      warn!("diff hook execution failed: {}", e);
      return;
    }
  };

  let deadline = Instant::now() + settings.diff_hook_timeout;
  loop {
    match child.try_wait() {
      Ok(Some(status)) => {
        if let Ok(out) = child.wait_with_output() {
          let text = String::from_utf8_lossy(&out.stdout);
          if !text.trim().is_empty() {
            warn!("{}", text.trim_end());
          }
        }
        if !status.success() {
          warn!("diff-hook program '{}' {}", hook.display(), status);
        }
        return;
      }
      Ok(None) => {
        if Instant::now() >= deadline {
          warn!("diff hook timed out; killing it");
          let _ = child.kill();
          let _ = child.wait();
          return;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
      }
      Err(e) => {
        warn!("waiting for diff hook: {}", e);
        let _ = child.kill();
        let _ = child.wait();
        return;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
    edges
      .iter()
      .map(|(k, vs)| {
        (
          k.to_string(),
          vs.iter().map(|v| v.to_string()).collect::<BTreeSet<_>>(),
        )
      })
      .collect()
  }

  #[test]
  fn finalization_is_leaves_first() {
    // out references dev; dev must be finalized before out
    let g = graph(&[("out", &["dev"]), ("dev", &[])]);
    let order = finalization_order(&g).unwrap();
    assert_eq!(order, vec!["dev".to_string(), "out".to_string()]);
  }

  #[test]
  fn self_references_are_not_cycles() {
    let g = graph(&[("out", &["out"])]);
    assert!(finalization_order(&g).is_ok());
  }

  #[test]
  fn two_output_cycle_names_both_outputs() {
    let g = graph(&[("out", &["dev"]), ("dev", &["out"])]);
    let (a, b) = finalization_order(&g).unwrap_err();
    let mut pair = vec![a, b];
    pair.sort();
    assert_eq!(pair, vec!["dev".to_string(), "out".to_string()]);
  }

  #[test]
  fn independent_outputs_keep_a_stable_order() {
    let g = graph(&[("a", &[]), ("b", &[]), ("c", &[])]);
    assert_eq!(finalization_order(&g).unwrap(), vec!["a", "b", "c"]);
  }

  #[test]
  fn replace_valid_path_swaps_trees() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("dest");
    let repl = dir.path().join("replacement");
    fs::write(&dest, "old").unwrap();
    fs::write(&repl, "new").unwrap();

    replace_valid_path(&dest, &repl).unwrap();

    assert_eq!(fs::read(&dest).unwrap(), b"new");
    assert!(!repl.exists());
    // no .old litter left behind
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
  }

  #[test]
  fn replace_valid_path_without_existing_destination() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("dest");
    let repl = dir.path().join("replacement");
    fs::write(&repl, "new").unwrap();

    replace_valid_path(&dest, &repl).unwrap();
    assert_eq!(fs::read(&dest).unwrap(), b"new");
  }

  #[test]
  fn rewrite_output_in_place_rewrites_file_trees() {
    const H1: &str = "31w1qcvb3j8fgjvcqkrpxxwwlfx0ydcg";
    const H2: &str = "9mdqa9w1p6cmli6976v4wi0sw9r4p5pr";

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    fs::create_dir(&out).unwrap();
    fs::write(out.join("script"), format!("exec /silo/store/{}-dep/bin/x", H1)).unwrap();

    let mut rewrites = HashMap::new();
    rewrites.insert(H1.to_string(), H2.to_string());
    let mut seen = InodesSeen::default();
    rewrite_output_in_place(&out, &rewrites, &mut seen).unwrap();

    let contents = fs::read_to_string(out.join("script")).unwrap();
    assert!(contents.contains(H2));
    assert!(!contents.contains(H1));
  }

  #[test]
  fn move_path_handles_readonly_directories() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir(&src).unwrap();
    fs::write(src.join("f"), "x").unwrap();
    super::super::chmod_path(&src, 0o555).unwrap();

    let dst = dir.path().join("dst");
    move_path(&src, &dst).unwrap();
    assert!(dst.join("f").exists());
    assert_eq!(fs::symlink_metadata(&dst).unwrap().mode() & 0o7777, 0o555);
  }
}
