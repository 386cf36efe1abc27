use tracing_core::Level;
use tracing_subscriber::{filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Logging;

pub fn init(config: &Logging) {
    let fmt = fmt::format().with_target(false).compact();

    let target_filters = Targets::new()
        .with_target("hyper", Level::WARN)
        .with_target("reqwest", Level::WARN)
        .with_target("rustls", Level::WARN)
        .with_default(config.level);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).event_format(fmt))
        .with(target_filters)
        .init();
}
