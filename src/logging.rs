use std::io::IsTerminal as _;

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

fn default_directive(verbose: bool, debug: bool) -> &'static str {
    match (verbose, debug) {
        (_, true) => "pakloader=trace",
        (true, false) => "pakloader=debug",
        _ => "pakloader=info",
    }
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// verbosity flags.
pub fn setup_logging(verbose: bool, debug: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_directive(verbose, debug)))?;
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .compact()
        .with_ansi(std::io::stderr().is_terminal())
        .with_level(true)
        .with_target(true)
        .without_time();

    tracing_subscriber::registry().with(filter).with(layer).try_init()?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false, false), "pakloader=info");
        assert_eq!(default_directive(true, false), "pakloader=debug");
        assert_eq!(default_directive(false, true), "pakloader=trace");
        assert!(EnvFilter::try_new(default_directive(true, true)).is_ok());
    }
}
