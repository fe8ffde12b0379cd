use std::sync::Arc;

use anyhow::{Context, Result};

use crate::api;
use crate::config;
use crate::data::{
    self, ApiConversationService, ApiGalleryService, ApiMessageService, ConversationService,
    GalleryService, MessageService,
};
use crate::media;
use crate::storage;
use crate::ui;

pub fn run() -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let config_path = config::default_path();
    let display_path = friendly_path(config_path.as_ref());

    let store =
        Arc::new(storage::Store::open(storage::Options::default()).context("open storage")?);

    let media_cfg = media::Config {
        cache_dir: cfg.media.cache_dir.clone(),
        max_size_bytes: cfg.media.max_size_bytes,
        default_ttl: cfg.media.default_ttl,
        workers: cfg.media.workers,
        http_client: None,
    };
    let media_manager = media::Manager::new(store.clone(), media_cfg).ok();
    let media_handle = media_manager.as_ref().map(|manager| manager.handle());

    type Services = (
        Arc<dyn ConversationService>,
        Arc<dyn MessageService>,
        Arc<dyn GalleryService>,
        String,
    );
    let (conversation_service, message_service, gallery_service, status): Services =
        match api::Client::new(api::ClientConfig {
            user_agent: cfg.server.user_agent.clone(),
            base_url: Some(cfg.server.base_url.clone()),
            http_client: None,
        }) {
            Ok(client) => {
                let client = Arc::new(client);
                (
                    Arc::new(ApiConversationService::new(client.clone())),
                    Arc::new(ApiMessageService::new(client.clone())),
                    Arc::new(ApiGalleryService::new(client)),
                    format!(
                        "Connected to {}. j/k to navigate, Enter to open a conversation, q to quit.",
                        cfg.server.base_url
                    ),
                )
            }
            Err(err) => {
                // Browsing mock data keeps the interface usable while the
                // config is being fixed.
                (
                    Arc::new(data::MockConversationService),
                    Arc::new(data::MockMessageService),
                    Arc::new(data::MockGalleryService),
                    format!(
                        "Archive client unavailable ({err}). Showing sample data; edit {display_path}."
                    ),
                )
            }
        };

    let options = ui::Options {
        status_message: status,
        conversation_service: Some(conversation_service),
        message_service: Some(message_service),
        gallery_service: Some(gallery_service),
        media_handle,
        player: cfg.player.clone(),
        feed: cfg.feed.clone(),
        config_path: display_path,
        fetch_conversations_on_start: true,
    };

    let mut model = ui::Model::new(options);
    model.run()?;

    drop(media_manager);

    Ok(())
}

fn friendly_path(path: Option<&std::path::PathBuf>) -> String {
    if let Some(path) = path {
        if let Some(home) = dirs::home_dir() {
            if let Ok(stripped) = path.strip_prefix(&home) {
                let mut display = String::from("~");
                if !stripped.as_os_str().is_empty() {
                    display.push_str(&format!("/{}", stripped.display()));
                }
                return display;
            }
        }
        path.display().to_string()
    } else {
        "~/.config/msgvault/config.yaml".to_string()
    }
}
