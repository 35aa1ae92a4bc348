use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let settings_path = std::env::args_os().nth(1).map(PathBuf::from);
  firedown_client::run(settings_path.as_deref()).await
}
