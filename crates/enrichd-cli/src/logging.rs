use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

/// Installs the global subscriber and routes `log` records from the library into it.
///
/// `RUST_LOG` overrides the default filter.
pub fn init(verbose: bool, json: bool) -> anyhow::Result<()> {
    let default_filter = if verbose {
        "enrichd=debug,info"
    } else {
        "enrichd=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer));

    tracing_log::LogTracer::init()?;
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
