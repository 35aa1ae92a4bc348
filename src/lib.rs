pub mod app_state;
pub mod engine;
pub mod error;
pub mod events;
pub mod local_api;
pub mod model;
pub mod normalize;
pub mod settings;
pub mod transport;

use app_state::{AppPaths, AppState};
use std::{net::SocketAddr, path::Path, sync::Arc};

/// Loads settings, wires the engine to the remote backend and serves the control API
/// until the listener fails.
pub async fn run(settings_path: Option<&Path>) -> anyhow::Result<()> {
  let settings = settings::Settings::load(settings_path)?;

  // Logging + data dirs
  let paths = AppPaths::from_settings(&settings)?;
  error::init_tracing(&paths)?;

  tracing::info!(
    backend = %settings.backend_url,
    download_dir = %paths.download_dir.display(),
    batch_mode = ?settings.batch_mode,
    "starting firedown client"
  );

  let backend = transport::RemoteJobClient::new(&settings)?;
  let sink = engine::save::DirectorySink::new(&paths.download_dir)?;

  // Shared event hub + download engine
  let events = events::EventHub::new();
  let engine = engine::DownloadEngine::new(Arc::new(backend), Arc::new(sink), &settings, events.clone());

  let state = AppState {
    engine: engine.handle(),
    events,
    token: settings.local_api_token.clone().filter(|t| !t.trim().is_empty()),
  };

  let addr = SocketAddr::from(([127, 0, 0, 1], settings.local_api_port));
  local_api::serve(state, addr).await
}
