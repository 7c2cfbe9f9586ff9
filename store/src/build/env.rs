//! Environment and scratch-layout construction: what the builder process
//! sees in its environment, its attribute files, and which host paths the
//! sandbox exposes.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use super::rewrite::rewrite_strings;
use super::{BuildError, ChrootPath, DerivationBuilder, HOME_DIR};
use crate::prelude::*;
use crate::StorePathSet;

impl DerivationBuilder {
  fn tmp_dir(&self) -> &PathBuf {
    self.tmp_dir.as_ref().expect("temp dir not created yet")
  }

  /// Build the process environment from scratch. All recipe-supplied
  /// values pass through `input_rewrites` later, just before exec.
  pub(crate) fn init_env(&mut self) -> Result<()> {
    self.env.clear();

    // a sentinel; shells would otherwise fill in an impure default
    self.env.insert("PATH".into(), "/path-not-set".into());

    // point HOME somewhere that cannot exist so tools don't fall back to
    // /etc/passwd to locate it
    self.env.insert("HOME".into(), HOME_DIR.into());

    self.env.insert(
      "NIX_STORE".into(),
      self.store.store_path().display().to_string(),
    );

    self.env.insert(
      "NIX_BUILD_CORES".into(),
      self.settings.build_cores.to_string(),
    );

    self.init_tmp_dir()?;

    // fixed-output recipes may skip their own output check downstream
    if self.drv.is_fixed() {
      self.env.insert("NIX_OUTPUT_CHECKED".into(), "1".into());
    }

    // only recipes that may reach the network get impure variables
    // forwarded, e.g. proxy configuration for fetchers
    if !self.drv.is_sandboxed() {
      for var in &self.options.impure_env_vars {
        let value = self
          .settings
          .impure_env
          .get(var)
          .cloned()
          .or_else(|| std::env::var(var).ok())
          .unwrap_or_default();
        self.env.insert(var.clone(), value);
      }
    }

    self.env.insert("NIX_LOG_FD".into(), "2".into());
    self.env.insert("TERM".into(), "xterm-256color".into());

    Ok(())
  }

  /// Plain-env attribute handling: every binding becomes an environment
  /// variable, or a file in the temp dir for keys listed in `passAsFile`.
  fn init_tmp_dir(&mut self) -> Result<()> {
    let tmp_dir = self.tmp_dir().clone();
    let tmp_dir_in_sandbox = self.tmp_dir_in_sandbox.clone();

    if self.drv.structured_attrs.is_none() {
      for (key, value) in &self.drv.env {
        if self.options.pass_as_file.contains(key) {
          let filename = attr_file_name(key);
          let filepath = tmp_dir.join(&filename);
          fs::write(&filepath, rewrite_strings(value, &self.input_rewrites))?;
          self.chown_to_builder(&filepath)?;
          self.env.insert(
            format!("{}Path", key),
            tmp_dir_in_sandbox.join(filename).display().to_string(),
          );
        } else {
          self.env.insert(key.clone(), value.clone());
        }
      }
    }

    self
      .env
      .insert("NIX_BUILD_TOP".into(), tmp_dir_in_sandbox.display().to_string());
    for tmp in &["TMPDIR", "TEMPDIR", "TMP", "TEMP", "PWD"] {
      self
        .env
        .insert((*tmp).into(), tmp_dir_in_sandbox.display().to_string());
    }

    Ok(())
  }

  /// Structured attributes coexist as a JSON document and a shell-sourceable
  /// rendition. The `outputs` sub-object is rewritten through
  /// `input_rewrites` so placeholders become scratch paths.
  pub(crate) fn write_structured_attrs(&mut self) -> Result<()> {
    let json = match &self.drv.structured_attrs {
      Some(j) => j.clone(),
      None => return Ok(()),
    };
    ensure!(
      json.is_object(),
      "structured attributes must be a JSON object"
    );

    let mut json = json;
    let outputs: serde_json::Map<String, serde_json::Value> = self
      .scratch_outputs
      .keys()
      .map(|name| {
        (
          name.clone(),
          serde_json::Value::String(rewrite_strings(
            &Hash::placeholder(name),
            &self.input_rewrites,
          )),
        )
      })
      .collect();
    json["outputs"] = serde_json::Value::Object(outputs);

    let tmp_dir = self.tmp_dir().clone();

    let json_sh = structured_attrs_shell(&json)?;
    fs::write(
      tmp_dir.join(".attrs.sh"),
      rewrite_strings(&json_sh, &self.input_rewrites),
    )?;
    self.chown_to_builder(tmp_dir.join(".attrs.sh"))?;
    self.env.insert(
      "NIX_ATTRS_SH_FILE".into(),
      self.tmp_dir_in_sandbox.join(".attrs.sh").display().to_string(),
    );

    fs::write(
      tmp_dir.join(".attrs.json"),
      rewrite_strings(&json.to_string(), &self.input_rewrites),
    )?;
    self.chown_to_builder(tmp_dir.join(".attrs.json"))?;
    self.env.insert(
      "NIX_ATTRS_JSON_FILE".into(),
      self
        .tmp_dir_in_sandbox
        .join(".attrs.json")
        .display()
        .to_string(),
    );

    Ok(())
  }

  /// For every file in `exportReferencesGraph`, serialize the transitive
  /// input closure of its roots as a validity-registration blob in the
  /// temp dir.
  pub(crate) fn export_references_graphs(&mut self) -> Result<()> {
    let tmp_dir = self.tmp_dir().clone();

    for (file_name, roots) in &self.options.export_references_graph {
      let mut root_paths = StorePathSet::new();
      for r in roots {
        let p = PathBuf::from(r);
        if !self.store.is_in_store(&p) {
          return Err(
            BuildError::Rejected(format!(
              "'exportReferencesGraph' contains a non-store path '{}'",
              r
            ))
            .into(),
          );
        }
        root_paths.insert(self.store.parse_store_path(&p)?);
      }
      let closure = self.store.export_references(&root_paths, &self.input_paths)?;
      let out = tmp_dir.join(file_name);
      fs::write(&out, self.store.make_validity_registration(&closure)?)?;
      self.chown_to_builder(&out)?;
    }
    Ok(())
  }

  /// Compute the sandbox view: which host path appears at which target
  /// inside the chroot. Closures of store-path entries are pulled in so
  /// nothing dangles, and any pre-existing copies of our own outputs are
  /// thrown back out.
  pub(crate) fn plan_chroot_paths(&mut self) -> Result<()> {
    self.paths_in_chroot.clear();

    for g in &self.settings.sandbox_paths {
      if g.is_empty() {
        continue;
      }
      let mut optional = false;
      let g = match g.strip_suffix('?') {
        Some(g2) => {
          optional = true;
          g2
        }
        None => g.as_str(),
      };
      match break_str(g, '=') {
        Some((target, source)) => {
          self.paths_in_chroot.insert(
            PathBuf::from(target),
            ChrootPath {
              path: PathBuf::from(source),
              optional,
            },
          );
        }
        None => {
          self.paths_in_chroot.insert(
            PathBuf::from(g),
            ChrootPath {
              path: PathBuf::from(g),
              optional,
            },
          );
        }
      }
    }

    if self
      .store
      .store_path()
      .starts_with(&self.tmp_dir_in_sandbox)
    {
      return Err(
        BuildError::Config("the sandbox build directory must not contain the store".into()).into(),
      );
    }
    self.paths_in_chroot.insert(
      self.tmp_dir_in_sandbox.clone(),
      ChrootPath {
        path: self.tmp_dir().clone(),
        optional: false,
      },
    );

    // expose the full closure of anything store-flavored
    let mut closure = StorePathSet::new();
    for dir in self.paths_in_chroot.values() {
      if self.store.is_in_store(&dir.path) {
        if let Ok(sp) = self.store.parse_store_path(&dir.path) {
          self.store.compute_fs_closure(&sp, &mut closure)?;
        }
      }
    }
    for cl in closure {
      let real = self.store.print_store_path(&cl);
      self.paths_in_chroot.insert(
        PathBuf::from(&real),
        ChrootPath {
          path: real.into(),
          optional: false,
        },
      );
    }

    // per-derivation impure host paths, checked against the host allowlist
    for dep in &self.options.impure_host_deps {
      let dep_path = PathBuf::from(dep);
      let allowed = self
        .settings
        .allowed_impure_host_prefixes
        .iter()
        .any(|prefix| dep_path.starts_with(prefix));
      if !allowed {
        return Err(
          BuildError::Config(format!(
            "derivation '{}' requested impure path '{}', but it was not in allowed-impure-host-deps",
            self.store.print_store_path(&self.drv_path),
            dep
          ))
          .into(),
        );
      }
      // these may legitimately be missing on newer hosts
      self.paths_in_chroot.insert(
        dep_path.clone(),
        ChrootPath {
          path: dep_path,
          optional: true,
        },
      );
    }

    // the input closure appears under its own name
    for p in self.input_paths.iter() {
      let printed = self.store.print_store_path(p);
      self.paths_in_chroot.insert(
        PathBuf::from(&printed),
        ChrootPath {
          path: self.store.to_real_path(p),
          optional: false,
        },
      );
    }

    // when repairing or checking, an output that's also a sandbox path
    // (e.g. a dependency of /bin/sh) must not shadow the rebuild
    for (name, out) in &self.drv.outputs {
      if let Some(p) = out.path(&*self.store, &self.drv.name, name)? {
        self.paths_in_chroot.remove(&PathBuf::from(self.store.print_store_path(&p)));
      }
    }

    Ok(())
  }
}

/// Render a structured-attrs document as a shell fragment: scalars become
/// plain variables, arrays and string maps become bash arrays. Keys that
/// aren't valid shell names are skipped.
pub(crate) fn structured_attrs_shell(json: &serde_json::Value) -> Result<String> {
  fn valid_shell_name(s: &str) -> bool {
    !s.is_empty()
      && s
        .chars()
        .enumerate()
        .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
  }

  fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
  }

  fn scalar(v: &serde_json::Value) -> Option<String> {
    match v {
      serde_json::Value::String(s) => Some(shell_quote(s)),
      serde_json::Value::Number(n) => Some(n.to_string()),
      serde_json::Value::Bool(b) => Some(if *b { "1".into() } else { "".into() }),
      serde_json::Value::Null => Some("".into()),
      _ => None,
    }
  }

  let obj = json
    .as_object()
    .ok_or_else(|| anyhow!("structured attributes must be a JSON object"))?;

  let mut out = String::new();
  for (key, value) in obj {
    if !valid_shell_name(key) {
      continue;
    }
    match value {
      serde_json::Value::Array(items) => {
        let mut rendered = Vec::with_capacity(items.len());
        let mut ok = true;
        for i in items {
          match scalar(i) {
            Some(s) => rendered.push(s),
            None => {
              ok = false;
              break;
            }
          }
        }
        if ok {
          writeln!(out, "declare -a {}=({})", key, rendered.join(" "))?;
        }
      }
      serde_json::Value::Object(map) => {
        let mut rendered = Vec::with_capacity(map.len());
        let mut ok = true;
        for (k, v) in map {
          match scalar(v) {
            Some(s) => rendered.push(format!("[{}]={}", shell_quote(k), s)),
            None => {
              ok = false;
              break;
            }
          }
        }
        if ok {
          writeln!(out, "declare -A {}=({})", key, rendered.join(" "))?;
        }
      }
      v => {
        if let Some(s) = scalar(v) {
          writeln!(out, "declare {}={}", key, s)?;
        }
      }
    }
  }
  Ok(out)
}

/// Track where `pass_as_file` attribute files land, for tests and tooling.
pub(crate) fn attr_file_name(key: &str) -> String {
  format!(".attr-{}", Hash::hash(key, HashType::SHA256).encode(Encoding::Base32))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn shell_rendition_covers_scalars_and_arrays() {
    let doc = json!({
      "name": "foo",
      "cores": 4,
      "doCheck": true,
      "outputsList": ["out", "dev"],
      "extra": {"a": "b"},
      "bad-name": "skipped",
      "nested": {"deep": {"x": 1}}
    });
    let sh = structured_attrs_shell(&doc).unwrap();
    assert!(sh.contains("declare name='foo'"));
    assert!(sh.contains("declare cores=4"));
    assert!(sh.contains("declare doCheck=1"));
    assert!(sh.contains("declare -a outputsList=('out' 'dev')"));
    assert!(sh.contains("declare -A extra=(['a']='b')"));
    assert!(!sh.contains("bad-name"));
    // non-scalar nesting is json-only
    assert!(!sh.contains("nested"));
  }

  #[test]
  fn shell_quoting_survives_single_quotes() {
    let doc = json!({"msg": "it's here"});
    let sh = structured_attrs_shell(&doc).unwrap();
    assert!(sh.contains(r"declare msg='it'\''s here'"));
  }

  #[test]
  fn attr_files_have_stable_names() {
    let a = attr_file_name("buildInputs");
    assert!(a.starts_with(".attr-"));
    assert_eq!(a, attr_file_name("buildInputs"));
    assert_ne!(a, attr_file_name("nativeBuildInputs"));
  }
}
