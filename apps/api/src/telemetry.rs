use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::topology::ProcessRole;

/// Installs the fmt subscriber for one process of the topology.
/// `RUST_LOG` wins when it parses as a full filter directive.
pub fn init_tracing(config: &Config, role: ProcessRole) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.rust_log, role))),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn default_directives(level: &str, role: ProcessRole) -> String {
    format!(
        "{crate_name}={level},{bin}={level},tower_http={level}",
        crate_name = env!("CARGO_PKG_NAME"),
        bin = role.binary(),
    )
}
