use std::path::Path;

use anyhow::{Context, bail};

use crate::config::config::Config;

pub fn print_banner(config: &Config) {
    let ascii_art = format!(
        r#"
      __          __   __                __
  ___/ /__ ______/ /__/ /  ___ ____  ___/ /
 / _  / -_) __/  '_/ _ \/ _ `/ _ \/ _  /
 \_,_/\__/\__/_/\_\_//_/\_,_/_//_/\_,_/

Deckhand v{}
Listening on {}
"#,
        config.get_version(),
        config.listen_addr()
    );

    println!("{}", ascii_art);
}

/// Makes sure the storage directory exists and is writable before anything
/// opens a database inside it.
pub async fn check_storage(base_path: &str) -> anyhow::Result<()> {
    let path = Path::new(base_path);

    if !path.exists() {
        tracing::info!("Creating storage directory: {}", base_path);
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("failed to create {}", base_path))?;
    }

    if !path.is_dir() {
        bail!("storage path is not a directory: {}", base_path);
    }

    let metadata = tokio::fs::metadata(path).await?;
    if metadata.permissions().readonly() {
        bail!("storage path is not writable: {}", base_path);
    }

    tracing::info!("Storage path ready: {}", base_path);
    Ok(())
}
