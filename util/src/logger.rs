use std::sync::Mutex;

use anyhow::Result;
use slog::{Drain, FnValue, Record};

/// Install the process-wide logger. Verbosity comes from `filter` when
/// given, otherwise from `SILO_LOG` (with `RUST_LOG` as a fallback), in
/// the usual `module=level` directive syntax.
pub fn init(filter: Option<&str>) -> Result<()> {
  let mut builder = slog_envlogger::LogBuilder::new(slog_term::term_full());
  let env_filter = std::env::var("SILO_LOG").or_else(|_| std::env::var("RUST_LOG"));
  match filter.map(str::to_string).or_else(|| env_filter.ok()) {
    Some(f) => builder = builder.parse(&f),
    None => builder = builder.filter(None, slog::FilterLevel::Info),
  }

  let logger = slog::Logger::root(
    Mutex::new(builder.build().fuse()).fuse(),
    slog::o!("location" => FnValue(move |r: &Record| {
      format!("{}:{}", r.location().file, r.location().line)
    })),
  );

  let log_guard = slog_scope::set_global_logger(logger);
  std::mem::forget(log_guard);

  slog_stdlog::init()?;

  Ok(())
}
