use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::Derivation;

/// Per-output reference and size restrictions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputChecks {
  pub ignore_self_refs: bool,
  pub max_size: Option<u64>,
  pub max_closure_size: Option<u64>,
  /// `None` means unrestricted; `Some(empty)` forbids all references.
  pub allowed_references: Option<BTreeSet<String>>,
  pub allowed_requisites: Option<BTreeSet<String>>,
  pub disallowed_references: BTreeSet<String>,
  pub disallowed_requisites: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChecksVariant {
  ForAllOutputs(OutputChecks),
  PerOutput(BTreeMap<String, OutputChecks>),
}

impl Default for OutputChecksVariant {
  fn default() -> Self {
    Self::ForAllOutputs(OutputChecks {
      ignore_self_refs: true,
      ..Default::default()
    })
  }
}

/// The knobs a recipe may set that affect how it is built, as opposed to
/// what it builds. Parsed out of the derivation environment up front so the
/// builder never string-matches attribute names itself.
#[derive(Debug, Clone, Default)]
pub struct DerivationOptions {
  pub no_chroot: bool,
  pub impure_host_deps: BTreeSet<String>,
  pub impure_env_vars: Vec<String>,
  pub pass_as_file: HashSet<String>,
  /// file name inside the temp dir → roots whose input closure to export
  pub export_references_graph: BTreeMap<String, Vec<String>>,
  pub required_system_features: BTreeSet<String>,
  pub output_checks: OutputChecksVariant,
  pub unsafe_discard_references: HashMap<String, bool>,
  pub additional_sandbox_profile: String,
  pub allow_local_networking: bool,
}

fn words(s: &str) -> impl Iterator<Item = &str> {
  s.split_ascii_whitespace()
}

fn parse_bool(s: &str) -> bool {
  s == "1" || s == "true"
}

impl DerivationOptions {
  /// Read the classic attribute names out of a plain-env derivation.
  /// Structured-attrs derivations carry the same information in their JSON
  /// payload; that translation is the scheduler's job.
  pub fn from_env(drv: &Derivation) -> Self {
    let get = |k: &str| drv.env.get(k).map(|x| x.as_str()).unwrap_or("");

    let mut checks = OutputChecks {
      ignore_self_refs: true,
      max_size: drv.env.get("maxSize").and_then(|x| x.parse().ok()),
      max_closure_size: drv.env.get("maxClosureSize").and_then(|x| x.parse().ok()),
      allowed_references: None,
      allowed_requisites: None,
      disallowed_references: words(get("disallowedReferences"))
        .map(|x| x.to_string())
        .collect(),
      disallowed_requisites: words(get("disallowedRequisites"))
        .map(|x| x.to_string())
        .collect(),
    };
    if drv.env.contains_key("allowedReferences") {
      checks.allowed_references =
        Some(words(get("allowedReferences")).map(|x| x.to_string()).collect());
    }
    if drv.env.contains_key("allowedRequisites") {
      checks.allowed_requisites =
        Some(words(get("allowedRequisites")).map(|x| x.to_string()).collect());
    }

    let mut export_references_graph = BTreeMap::new();
    let mut erg = words(get("exportReferencesGraph"));
    while let (Some(file), Some(path)) = (erg.next(), erg.next()) {
      export_references_graph
        .entry(file.to_string())
        .or_insert_with(Vec::new)
        .push(path.to_string());
    }

    DerivationOptions {
      no_chroot: parse_bool(get("__noChroot")),
      impure_host_deps: words(get("__impureHostDeps")).map(|x| x.to_string()).collect(),
      impure_env_vars: words(get("impureEnvVars")).map(|x| x.to_string()).collect(),
      pass_as_file: words(get("passAsFile")).map(|x| x.to_string()).collect(),
      export_references_graph,
      required_system_features: words(get("requiredSystemFeatures"))
        .map(|x| x.to_string())
        .collect(),
      output_checks: OutputChecksVariant::ForAllOutputs(checks),
      unsafe_discard_references: drv
        .outputs
        .keys()
        .filter(|o| parse_bool(get(&format!("__unsafeDiscardReferences_{}", o))))
        .map(|o| (o.clone(), true))
        .collect(),
      additional_sandbox_profile: get("__sandboxProfile").to_string(),
      allow_local_networking: parse_bool(get("__darwinAllowLocalNetworking")),
    }
  }

  /// uid ranges are an opt-in system feature, not a separate attribute.
  pub fn use_uid_range(&self, _drv: &Derivation) -> bool {
    self.required_system_features.contains("uid-range")
  }

  pub fn wants_recursive_daemon(&self) -> bool {
    self.required_system_features.contains("recursive-silo")
  }

  /// Whether this host can run the recipe at all: platform string plus all
  /// required system features must match.
  pub fn can_build_locally(&self, settings: &crate::settings::Settings, drv: &Derivation) -> bool {
    if drv.platform != settings.system && !drv.is_builtin() {
      return false;
    }
    self
      .required_system_features
      .iter()
      .all(|f| f == "uid-range" || f == "recursive-silo" || settings.system_features.contains(f))
  }

  pub fn checks_for_output(&self, output_name: &str) -> Option<&OutputChecks> {
    match &self.output_checks {
      OutputChecksVariant::ForAllOutputs(c) => Some(c),
      OutputChecksVariant::PerOutput(m) => m.get(output_name),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn drv_with_env(pairs: &[(&str, &str)]) -> Derivation {
    let mut drv = Derivation::default();
    for (k, v) in pairs {
      drv.env.insert(k.to_string(), v.to_string());
    }
    drv.outputs.insert("out".into(), crate::derivation::Output::Deferred);
    drv
  }

  #[test]
  fn parses_reference_checks() {
    let drv = drv_with_env(&[
      ("allowedReferences", ""),
      ("disallowedReferences", "/silo/store/aaa /silo/store/bbb"),
    ]);
    let opts = DerivationOptions::from_env(&drv);
    let checks = opts.checks_for_output("out").unwrap();
    // empty-but-present allowlist forbids everything
    assert_eq!(checks.allowed_references, Some(Default::default()));
    assert_eq!(checks.disallowed_references.len(), 2);
    assert_eq!(checks.allowed_requisites, None);
  }

  #[test]
  fn parses_export_references_graph() {
    let drv = drv_with_env(&[("exportReferencesGraph", "closure /silo/store/x closure2 /silo/store/y")]);
    let opts = DerivationOptions::from_env(&drv);
    assert_eq!(opts.export_references_graph.len(), 2);
    assert_eq!(opts.export_references_graph["closure"], vec!["/silo/store/x"]);
  }

  #[test]
  fn discard_references_is_per_output() {
    let drv = drv_with_env(&[("__unsafeDiscardReferences_out", "1")]);
    let opts = DerivationOptions::from_env(&drv);
    assert_eq!(opts.unsafe_discard_references.get("out"), Some(&true));
    assert_eq!(opts.unsafe_discard_references.get("dev"), None);
  }

  #[test]
  fn uid_range_is_a_system_feature() {
    let drv = drv_with_env(&[("requiredSystemFeatures", "uid-range")]);
    let opts = DerivationOptions::from_env(&drv);
    assert!(opts.use_uid_range(&drv));
    assert!(!opts.wants_recursive_daemon());
  }
}
