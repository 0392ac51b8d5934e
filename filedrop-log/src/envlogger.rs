//! `RUST_LOG`-style record filtering.
//!
//! A filter is a comma-separated list of directives, each either a bare
//! level name (`debug`) or a `module=level` pair where the module is matched
//! as a prefix.  The last matching directive wins.  Invalid directives are
//! skipped silently.

use slog::{Drain, Level, OwnedKVList, Record};
use std::{env, str::FromStr};

#[derive(Debug)]
struct Directive {
    prefix: Option<String>,
    level: Level,
}

impl Directive {
    fn parse(input: &str) -> Option<Self> {
        match input.split_once('=') {
            None => Level::from_str(input).ok().map(|level| Self {
                prefix: None,
                level,
            }),
            Some((module, level)) => {
                let valid_module = !module.is_empty()
                    && module
                        .chars()
                        .all(|c| matches!(c, '0'..='9' | 'a'..='z' | 'A'..='Z' | ':' | '_'));
                if !valid_module {
                    return None;
                }

                Level::from_str(level).ok().map(|level| Self {
                    prefix: Some(module.to_string()),
                    level,
                })
            }
        }
    }

    fn matches(&self, module: &str) -> bool {
        self.prefix
            .as_deref()
            .map_or(true, |prefix| module.starts_with(prefix))
    }
}

/// Drain adapter dropping records below the configured levels.
pub struct Filtered<T: Drain> {
    drain: T,
    directives: Vec<Directive>,
}

impl<T: Drain> Filtered<T> {
    /// Wrap a drain, taking the filter from `RUST_LOG` or the given default.
    pub fn with_default_filter(drain: T, default: &str) -> Self {
        let filter = env::var("RUST_LOG").unwrap_or_else(|_| default.to_string());

        Self {
            drain,
            directives: filter.split(',').filter_map(Directive::parse).collect(),
        }
    }

    fn is_enabled(&self, module: &str, level: Level) -> bool {
        self.directives
            .iter()
            .rev()
            .find(|directive| directive.matches(module))
            .map(|directive| level <= directive.level)
            .unwrap_or_default()
    }
}

impl<T> Drain for Filtered<T>
where
    T: Drain<Ok = ()>,
{
    type Ok = ();
    type Err = T::Err;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<(), T::Err> {
        if !self.is_enabled(record.module(), record.level()) {
            return Ok(());
        }

        self.drain.log(record, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives() {
        let debug = Directive::parse("debug").unwrap();
        assert!(debug.prefix.is_none());
        assert_eq!(debug.level, Level::Debug);

        let scoped = Directive::parse("filedrop::store=trace").unwrap();
        assert_eq!(scoped.prefix.as_deref(), Some("filedrop::store"));
        assert!(scoped.matches("filedrop::store::id"));
        assert!(!scoped.matches("filedrop::web"));

        assert!(Directive::parse("no such level").is_none());
        assert!(Directive::parse("bad module!=info").is_none());
    }
}
