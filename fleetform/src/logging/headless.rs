use super::Frontend;
use anyhow::Result;
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt::{format::FmtSpan, Layer as FmtLayer},
    layer::SubscriberExt as _,
    Layer as _, Registry,
};

/// Our own crates. Everything else (reqwest, hyper, rustls) stays at INFO,
/// even with `--verbose`.
const OWN_TARGETS: &[&str] = &[
    "fleetform",
    "fleetform_core",
    "fleetform_resource",
    "fleetform_remote_http",
    "fleetform_resources_memory",
];

/// Log lines on stderr, for terminals and CI logs alike.
pub(crate) struct HeadlessLogger {}

pub(crate) fn targets(verbose: bool) -> Targets {
    let own_level = if verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };
    OWN_TARGETS
        .iter()
        .fold(Targets::new().with_default(LevelFilter::INFO), |t, target| {
            t.with_target(*target, own_level)
        })
}

impl Frontend for HeadlessLogger {
    fn set_up(&mut self, options: &super::Options) -> Result<()> {
        let span_events = if options.verbose {
            FmtSpan::FULL
        } else {
            // one line when a goal or remote operation starts, one when it ends
            FmtSpan::NEW | FmtSpan::CLOSE
        };

        let fmt_layer = FmtLayer::new()
            .with_writer(std::io::stderr)
            .with_target(options.verbose)
            .with_span_events(span_events)
            .with_ansi(options.color)
            .with_filter(targets(options.verbose));
        let subscriber = Registry::default().with(fmt_layer);

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| anyhow::anyhow!("failed to set up tracing: {}", e))?;

        Ok(())
    }

    fn tear_down(&mut self) -> Result<()> {
        Ok(())
    }
}
