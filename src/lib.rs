pub mod cache;
pub mod cli;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod settings;

use std::sync::Arc;

use anyhow::{Context, Result, ensure};

use crate::cache::AssetCache;
use crate::server::content_type::ExtensionContentTypes;
use crate::server::resolver::DirectoryResolver;
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    if let Some(addr) = settings.metrics_listen {
        let path = "/metrics".to_string();
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, path).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let root_meta = std::fs::metadata(&settings.root_dir)
        .with_context(|| format!("cannot access root_dir {}", settings.root_dir.display()))?;
    ensure!(
        root_meta.is_dir(),
        "root_dir {} is not a directory",
        settings.root_dir.display()
    );

    let cache = if settings.cache_enabled {
        Some(Arc::new(AssetCache::new(
            settings.cache_max_entries,
            settings.cache_capacity,
        )?))
    } else {
        None
    };

    let resolver = Arc::new(DirectoryResolver::new(
        settings.root_dir.clone(),
        settings.index_file.clone(),
    ));
    let content_types = Arc::new(ExtensionContentTypes);

    let app = server::AppContext::new(settings, cache, resolver, content_types);
    server::run(app).await
}
