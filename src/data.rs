use anyhow::{Context, Result};
use std::sync::Arc;

use crate::api;

pub trait ConversationService: Send + Sync {
    fn list_conversations(&self) -> Result<Vec<api::Conversation>>;
    fn get_conversation(&self, id: i64) -> Result<api::Conversation>;
}

pub trait MessageService: Send + Sync {
    fn load_page(
        &self,
        conversation_id: i64,
        cursor: Option<api::MessageCursor>,
        limit: u32,
    ) -> Result<api::MessagePage>;
    fn search(&self, conversation_id: i64, query: &str) -> Result<Vec<api::Message>>;
}

pub trait GalleryService: Send + Sync {
    fn load_page(&self, conversation_id: i64, offset: u64, limit: u32) -> Result<api::MediaPage>;
    fn media_url(&self, media_id: i64) -> String;
}

pub struct ApiConversationService {
    client: Arc<api::Client>,
}

impl ApiConversationService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl ConversationService for ApiConversationService {
    fn list_conversations(&self) -> Result<Vec<api::Conversation>> {
        self.client
            .conversations()
            .context("fetch conversation list")
    }

    fn get_conversation(&self, id: i64) -> Result<api::Conversation> {
        self.client
            .conversation(id)
            .with_context(|| format!("fetch conversation {id}"))
    }
}

pub struct ApiMessageService {
    client: Arc<api::Client>,
}

impl ApiMessageService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl MessageService for ApiMessageService {
    fn load_page(
        &self,
        conversation_id: i64,
        cursor: Option<api::MessageCursor>,
        limit: u32,
    ) -> Result<api::MessagePage> {
        self.client
            .messages(conversation_id, cursor, limit)
            .context("fetch message page")
    }

    fn search(&self, conversation_id: i64, query: &str) -> Result<Vec<api::Message>> {
        self.client
            .search(conversation_id, query)
            .context("search messages")
    }
}

pub struct ApiGalleryService {
    client: Arc<api::Client>,
}

impl ApiGalleryService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl GalleryService for ApiGalleryService {
    fn load_page(&self, conversation_id: i64, offset: u64, limit: u32) -> Result<api::MediaPage> {
        self.client
            .conversation_media(conversation_id, offset, limit)
            .context("fetch media page")
    }

    fn media_url(&self, media_id: i64) -> String {
        self.client.media_cache_url(media_id).to_string()
    }
}

#[derive(Default)]
pub struct MockConversationService;

impl ConversationService for MockConversationService {
    fn list_conversations(&self) -> Result<Vec<api::Conversation>> {
        Ok(vec![
            mock_conversation(1, Some("Family"), "+15550101"),
            mock_conversation(2, None, "+15550102"),
        ])
    }

    fn get_conversation(&self, id: i64) -> Result<api::Conversation> {
        Ok(mock_conversation(id, Some("Family"), "+15550101"))
    }
}

#[derive(Default)]
pub struct MockMessageService;

impl MessageService for MockMessageService {
    fn load_page(
        &self,
        _conversation_id: i64,
        cursor: Option<api::MessageCursor>,
        limit: u32,
    ) -> Result<api::MessagePage> {
        // Ids 1..=200, newest-first pages the way the live server responds.
        let limit = i64::from(limit);
        let (oldest, newest) = match cursor {
            Some(api::MessageCursor::Before(id)) => {
                let newest = (id - 1).min(200);
                ((newest - limit + 1).max(1), newest)
            }
            Some(api::MessageCursor::After(id)) => {
                let oldest = (id + 1).max(1);
                ((oldest), (oldest + limit - 1).min(200))
            }
            None => ((200 - limit + 1).max(1), 200),
        };
        let messages: Vec<api::Message> = if newest < oldest {
            Vec::new()
        } else {
            (oldest..=newest).rev().map(mock_message).collect()
        };
        let has_more = messages.last().map(|m| m.id > 1).unwrap_or(false);
        let has_newer = messages.first().map(|m| m.id < 200).unwrap_or(false);
        Ok(api::MessagePage {
            messages,
            has_more,
            has_newer,
            total: 200,
        })
    }

    fn search(&self, _conversation_id: i64, query: &str) -> Result<Vec<api::Message>> {
        let mut hits: Vec<api::Message> = [40, 80, 120]
            .into_iter()
            .map(mock_message)
            .collect();
        for hit in &mut hits {
            hit.text = format!("about {query}");
        }
        Ok(hits)
    }
}

#[derive(Default)]
pub struct MockGalleryService;

impl GalleryService for MockGalleryService {
    fn load_page(&self, _conversation_id: i64, offset: u64, limit: u32) -> Result<api::MediaPage> {
        let total = 45u64;
        let end = (offset + u64::from(limit)).min(total);
        let media = (offset..end)
            .map(|n| {
                let id = (total - n) as i64;
                api::ConversationMedia {
                    id,
                    content_type: if id % 5 == 0 {
                        "video/mp4".into()
                    } else {
                        "image/jpeg".into()
                    },
                    filename: format!("media-{id:03}.bin"),
                    message_id: id * 4,
                    date: mock_date(id * 4),
                    contact_id: Some(1),
                    contact_name: Some("Ada".into()),
                    contact_address: Some("+15550101".into()),
                }
            })
            .collect();
        Ok(api::MediaPage {
            media,
            has_more: end < total,
            total,
        })
    }

    fn media_url(&self, media_id: i64) -> String {
        format!("http://archive.invalid/api/media/{media_id}/cache")
    }
}

fn mock_conversation(id: i64, name: Option<&str>, address: &str) -> api::Conversation {
    api::Conversation {
        id,
        name: name.map(str::to_string),
        contacts: vec![api::Contact {
            id,
            name: name.map(str::to_string),
            address: address.to_string(),
        }],
    }
}

fn mock_message(id: i64) -> api::Message {
    api::Message {
        id,
        direction: if id % 2 == 0 {
            api::Direction::Sent
        } else {
            api::Direction::Inbox
        },
        contact: Some("Ada".into()),
        text: format!("message {id}"),
        date: mock_date(id),
        media: Vec::new(),
    }
}

fn mock_date(id: i64) -> chrono::NaiveDateTime {
    chrono::DateTime::from_timestamp(1_680_000_000 + id * 60, 0)
        .expect("mock timestamp in range")
        .naive_utc()
}
