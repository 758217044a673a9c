use tracing::metadata::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// Start logger, should be done inside main
pub fn init(verbose: bool) {
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    EnvFilter::new(level.to_string())
  });

  // webrtc-rs is chatty at debug level
  let env_filter = ["webrtc", "webrtc_ice", "webrtc_dtls", "webrtc_sctp", "webrtc_srtp", "webrtc_mdns"]
    .iter()
    .filter_map(|target| format!("{target}=warn").parse().ok())
    .fold(env_filter, |filter, directive| filter.add_directive(directive));

  let console_layer = fmt::Layer::new()
    .with_writer(std::io::stdout)
    .with_ansi(true)
    .with_target(false)
    .with_thread_ids(false)
    .with_filter(env_filter);

  if tracing_subscriber::registry().with(console_layer).try_init().is_err() {
    tracing::warn!("logger already initialized");
  }
}
