//! Tracing subscriber setup from CLI flags and the `logging` config section.

use tracing_subscriber::EnvFilter;

use voice_relay_core::config::LoggingConfig;

/// Filter directives: base level first, then per-crate overrides.
fn directives(verbose: bool, config: Option<&LoggingConfig>) -> String {
    let level = if verbose {
        "debug"
    } else {
        config.and_then(|c| c.level.as_deref()).unwrap_or("info")
    };
    std::iter::once(level.to_string())
        .chain(config.into_iter().flat_map(|c| c.filters.iter().cloned()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. `RUST_LOG` wins over config when set.
pub fn init(verbose: bool, config: Option<&LoggingConfig>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(directives(verbose, config)).unwrap_or_else(|_| EnvFilter::new("info"))
    });
    let json = config.is_some_and(|c| c.format == "json");
    let stdout = config.is_some_and(|c| c.output == "stdout");

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}
