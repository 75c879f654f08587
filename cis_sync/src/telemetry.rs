use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

/// Install the global JSON subscriber. `RUST_LOG` overrides the default
/// `info` filter. Security events log under the `cis_sync::security` target.
#[tracing::instrument(level = "info", skip_all)]
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer().json().with_target(true);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init()
        .map_err(|e| Error::InvalidInput(format!("tracing already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_an_error() {
        let _ = init_tracing();
        assert!(matches!(init_tracing(), Err(Error::InvalidInput(_))));
    }
}
