use anyhow::Result;
use log::{LevelFilter, Metadata, Record};
use ringlog::{Drain, File, LogBuilder, MultiLogBuilder, Output, Stderr};
use std::io::Write;
use std::str::FromStr;
use std::sync::Mutex;

use crate::config::Config;

/// Rotate the trace log at 10MB.
const LOG_FILE_MAX_SIZE: u64 = 1024 * 1024 * 10;

/// Per-target level overrides from `log.filter`, e.g. `hyper=warn`.
///
/// The longest matching target prefix decides, so `hyper::proto=debug` beats
/// `hyper=warn` for records from `hyper::proto::h1`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TargetFilters {
    rules: Vec<(String, LevelFilter)>,
}

impl TargetFilters {
    /// Entries without `=` or with an unknown level are ignored.
    pub fn parse(entries: &[String]) -> Self {
        let mut rules: Vec<(String, LevelFilter)> = entries
            .iter()
            .filter_map(|entry| {
                let (target, level) = entry.split_once('=')?;
                let level = LevelFilter::from_str(level.trim()).ok()?;
                Some((target.trim().to_string(), level))
            })
            .collect();
        rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Level override for a record target, if any rule matches.
    pub fn level_for(&self, target: &str) -> Option<LevelFilter> {
        self.rules
            .iter()
            .find(|(prefix, _)| target.starts_with(prefix.as_str()))
            .map(|(_, level)| *level)
    }

    pub fn allows(&self, metadata: &Metadata) -> bool {
        self.level_for(metadata.target())
            .is_none_or(|level| metadata.level() <= level)
    }
}

/// Writes records that pass the target filters to a ringlog output.
struct FilteredLogger {
    output: Mutex<Box<dyn Output>>,
    max_level: LevelFilter,
    filters: TargetFilters,
}

impl log::Log for FilteredLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level && self.filters.allows(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Ok(mut output) = self.output.lock() {
            let _ = writeln!(output, "{}", record.args());
        }
    }

    fn flush(&self) {
        if let Ok(mut output) = self.output.lock() {
            let _ = output.flush();
        }
    }
}

/// Install the global logger.
///
/// Without target filters this is a plain ringlog logger whose drain is
/// returned for the caller to flush periodically. With filters, records are
/// written synchronously and there is no drain.
pub fn init(config: &Config) -> Result<Option<Box<dyn Drain>>> {
    let level = config.log.level.to_level_filter();

    let output: Box<dyn Output> = match &config.output.trace_log {
        Some(path) => Box::new(File::new(
            path.clone(),
            path.with_extension("old"),
            LOG_FILE_MAX_SIZE,
        )?),
        None => Box::new(Stderr::new()),
    };

    let filters = TargetFilters::parse(&config.log.filter);
    if filters.is_empty() {
        let log = LogBuilder::new()
            .output(output)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to initialize logger: {}", e))?;
        let drain = MultiLogBuilder::new()
            .level_filter(level)
            .default(log)
            .build()
            .start();
        return Ok(Some(drain));
    }

    log::set_boxed_logger(Box::new(FilteredLogger {
        output: Mutex::new(output),
        max_level: level,
        filters,
    }))
    .map_err(|e| anyhow::anyhow!("failed to set logger: {}", e))?;
    log::set_max_level(level);
    Ok(None)
}
