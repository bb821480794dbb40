pub mod codec;
pub mod content_type;
pub mod dispatch;
pub mod listener;
pub mod resolver;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use anyhow::Result;

use crate::cache::AssetCache;
use crate::settings::Settings;

use content_type::ContentTypeResolver;
use resolver::PathResolver;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: Option<Arc<AssetCache>>,
    pub resolver: Arc<dyn PathResolver>,
    pub content_types: Arc<dyn ContentTypeResolver>,
    /// Response bodies currently streaming, across all connections. Feeds
    /// the start-delay computation for new consumers.
    pub pending_streams: Arc<AtomicUsize>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        cache: Option<Arc<AssetCache>>,
        resolver: Arc<dyn PathResolver>,
        content_types: Arc<dyn ContentTypeResolver>,
    ) -> Self {
        Self {
            settings,
            cache,
            resolver,
            content_types,
            pending_streams: Arc::new(AtomicUsize::new(0)),
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
