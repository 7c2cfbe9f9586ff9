//! Built-in builders: recipes whose `builder` is `builtin:<name>` run
//! in-process (inside the sandboxed child) instead of exec'ing a program.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use curl::easy::Easy;

use crate::prelude::*;

/// Environment handed to a builtin: the recipe's (rewritten) attributes and
/// where each output goes.
pub(crate) struct BuiltinContext<'a> {
  pub env: &'a HashMap<String, String>,
  pub outputs: &'a HashMap<String, String>,
}

pub(crate) fn run_builtin(name: &str, ctx: &BuiltinContext) -> Result<()> {
  match name {
    "fetchurl" => builtin_fetchurl(ctx),
    x => bail!("unsupported builtin builder `{}'", x),
  }
}

/// Download `url` to the sole output. Only fixed-output recipes reach this
/// point, so the network access is harmless: the result is pinned by its
/// declared hash.
fn builtin_fetchurl(ctx: &BuiltinContext) -> Result<()> {
  let url = ctx
    .env
    .get("url")
    .ok_or_else(|| anyhow!("attribute `url' missing"))?;
  let out = ctx
    .outputs
    .get("out")
    .ok_or_else(|| anyhow!("builtin fetchurl requires an output named `out'"))?;

  ensure!(
    ctx.env.get("unpack").map_or(true, |x| x != "1"),
    "builtin fetchurl does not support unpacking"
  );

  debug!("fetching {} into {}", url, out);

  let mut file = File::create(out)?;

  let mut easy = Easy::new();
  easy.url(url)?;
  easy.follow_location(true)?;
  easy.fail_on_error(true)?;
  easy.useragent(&format!("curl/{} silo", curl::Version::get().version()))?;
  {
    let mut transfer = easy.transfer();
    transfer.write_function(|data| {
      file.write_all(data).map_err(|_| curl::easy::WriteError::Pause)?;
      Ok(data.len())
    })?;
    transfer
      .perform()
      .with_context(|| format!("while fetching {}", url))?;
  }

  file.flush()?;
  drop(file);

  if ctx.env.get("executable").map_or(false, |x| x == "1") {
    let mut perms = fs::metadata(Path::new(out))?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    fs::set_permissions(Path::new(out), perms)?;
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_builtins_are_rejected() {
    let env = HashMap::new();
    let outputs = HashMap::new();
    let ctx = BuiltinContext {
      env: &env,
      outputs: &outputs,
    };
    assert!(run_builtin("no-such-builtin", &ctx).is_err());
  }

  #[test]
  fn fetchurl_requires_a_url() {
    let env = HashMap::new();
    let mut outputs = HashMap::new();
    outputs.insert("out".to_string(), "/dev/null".to_string());
    let ctx = BuiltinContext {
      env: &env,
      outputs: &outputs,
    };
    let err = run_builtin("fetchurl", &ctx).unwrap_err();
    assert!(format!("{}", err).contains("url"));
  }
}
