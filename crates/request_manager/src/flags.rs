//! CLI surface: every flag named in the request-lifecycle contract, parsed
//! with `clap`'s derive API. Boolean flags additionally accept the
//! `--noflag` spelling, which clap's derive macros don't support natively --
//! [`normalize_bool_negation`] rewrites it to `--flag=false` before handing
//! argv to `clap::Parser::parse_from`.

use std::time::Duration;

use clap::Parser;

/// Names of every boolean flag on [`RuntimeFlags`], used to recognize a
/// `--noflag` spelling on the command line.
const BOOL_FLAG_NAMES: &[&str] = &["poll_for_network", "disable_api_call_logging"];

#[derive(Parser, Clone, Debug)]
#[command(name = "runtime-core", about = "Application request-serving runtime")]
pub struct RuntimeFlags {
    #[arg(long)]
    pub trusted_host: Option<String>,

    #[arg(long, default_value_t = 10)]
    pub clone_max_outstanding_api_rpcs: usize,

    #[arg(long, default_value_t = 100 * 1024)]
    pub byte_count_before_flushing: usize,

    #[arg(long, default_value_t = 1024)]
    pub max_log_line_size: usize,

    #[arg(long, default_value_t = 1)]
    pub max_log_flush_seconds: u64,

    #[arg(long, default_value_t = 64 * 1024)]
    pub max_runtime_log_per_request: usize,

    #[arg(long, default_value_t = 8080)]
    pub jetty_http_port: u16,

    #[arg(long)]
    pub fixed_application_path: Option<String>,

    #[arg(long, num_args = 0..=1, default_value_t = true, default_missing_value = "true")]
    pub poll_for_network: bool,

    #[arg(long, num_args = 0..=1, default_value_t = false, default_missing_value = "true")]
    pub disable_api_call_logging: bool,

    /// Anything clap didn't recognize: per the external contract, unknown
    /// options are passed through rather than rejected, and logged at
    /// warning by [`RuntimeFlags::parse_args`].
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub unknown: Vec<String>,
}

impl RuntimeFlags {
    pub fn max_log_flush_duration(&self) -> Duration {
        Duration::from_secs(self.max_log_flush_seconds)
    }

    /// Parse `argv` (excluding the program name), first rewriting any
    /// `--noflag` spelling of a known boolean flag into `--flag=false`, then
    /// logging a warning for every argument clap couldn't place.
    pub fn parse_args<I: IntoIterator<Item = String>>(argv: I) -> Self {
        let normalized = normalize_bool_negation(argv);
        let mut program = vec!["runtime-core".to_string()];
        program.extend(normalized);
        let flags = Self::parse_from(program);
        for unknown in &flags.unknown {
            tracing::warn!(flag = %unknown, "unrecognized command-line flag, passing through");
        }
        flags
    }
}

fn normalize_bool_negation<I: IntoIterator<Item = String>>(argv: I) -> Vec<String> {
    argv.into_iter()
        .map(|arg| {
            let Some(rest) = arg.strip_prefix("--no") else {
                return arg;
            };
            if BOOL_FLAG_NAMES.contains(&rest) {
                format!("--{rest}=false")
            } else {
                arg
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &[&str]) -> Vec<String> {
        s.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bare_flag_sets_true() {
        let flags = RuntimeFlags::parse_args(args(&["--disable_api_call_logging"]));
        assert!(flags.disable_api_call_logging);
    }

    #[test]
    fn explicit_equals_value_is_respected() {
        let flags = RuntimeFlags::parse_args(args(&["--disable_api_call_logging=false"]));
        assert!(!flags.disable_api_call_logging);
    }

    #[test]
    fn no_prefixed_spelling_negates_the_flag() {
        let flags = RuntimeFlags::parse_args(args(&["--nopoll_for_network"]));
        assert!(!flags.poll_for_network);
    }

    #[test]
    fn defaults_apply_when_flag_is_absent() {
        let flags = RuntimeFlags::parse_args(args(&[]));
        assert!(flags.poll_for_network);
        assert!(!flags.disable_api_call_logging);
        assert_eq!(flags.jetty_http_port, 8080);
    }
}
