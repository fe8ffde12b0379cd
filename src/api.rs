use std::time::Duration;

use anyhow::{bail, Result};
use chrono::NaiveDateTime;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::USER_AGENT;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// Failures surfaced by the archive gateway, split the way callers need
/// to report them: transport, non-success status, bad response shape.
#[derive(Debug, Error)]
pub enum Error {
    #[error("archive: request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("archive: server returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("archive: unexpected response shape: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("archive: invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub http_client: Option<HttpClient>,
}

/// Pagination cursor for the message endpoint. The wire protocol accepts
/// at most one of the two ids per request; callers pass
/// `Option<MessageCursor>`, which makes that rule unrepresentable to break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCursor {
    Before(i64),
    After(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbox,
    Sent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
}

impl Contact {
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => self.address.as_str(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
}

impl Conversation {
    pub fn display_name(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => self
                .contacts
                .iter()
                .map(Contact::display_name)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Media {
    pub id: i64,
    pub content_type: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub direction: Direction,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub text: String,
    pub date: NaiveDateTime,
    #[serde(default)]
    pub media: Vec<Media>,
}

/// Gallery record: one media item joined with its owning message and the
/// sending contact. The server emits the contact fields as bare
/// `name`/`address`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMedia {
    pub id: i64,
    pub content_type: String,
    pub filename: String,
    pub message_id: i64,
    pub date: NaiveDateTime,
    #[serde(default)]
    pub contact_id: Option<i64>,
    #[serde(default, rename = "name")]
    pub contact_name: Option<String>,
    #[serde(default, rename = "address")]
    pub contact_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub has_newer: bool,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPage {
    pub media: Vec<ConversationMedia>,
    pub has_more: bool,
    pub total: u64,
}

#[derive(Debug)]
pub struct Client {
    http: HttpClient,
    user_agent: String,
    base_url: Url,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("archive client user agent required");
        }
        let base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = parse_base_url(&base)?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    pub fn conversations(&self) -> Result<Vec<Conversation>, Error> {
        self.get_json("api/conversations", &[])
    }

    /// Server-side substring filter on the conversation name.
    pub fn conversations_matching(&self, search: &str) -> Result<Vec<Conversation>, Error> {
        self.get_json("api/conversations", &[("search".into(), search.into())])
    }

    pub fn conversation(&self, id: i64) -> Result<Conversation, Error> {
        self.get_json(&format!("api/conversation/{id}"), &[])
    }

    pub fn contacts(&self) -> Result<Vec<Contact>, Error> {
        self.get_json("api/contacts", &[])
    }

    pub fn messages(
        &self,
        conversation_id: i64,
        cursor: Option<MessageCursor>,
        limit: u32,
    ) -> Result<MessagePage, Error> {
        let params = message_params(cursor, limit);
        self.get_json(&format!("api/conversation/{conversation_id}/messages"), &params)
    }

    pub fn search(&self, conversation_id: i64, query: &str) -> Result<Vec<Message>, Error> {
        self.get_json(
            &format!("api/conversation/{conversation_id}/search"),
            &[("query".into(), query.into())],
        )
    }

    pub fn conversation_media(
        &self,
        conversation_id: i64,
        offset: u64,
        limit: u32,
    ) -> Result<MediaPage, Error> {
        self.get_json(
            &format!("api/conversation/{conversation_id}/media"),
            &[
                ("offset".into(), offset.to_string()),
                ("limit".into(), limit.to_string()),
            ],
        )
    }

    /// Absolute URL serving the raw bytes for a media record. Downloads go
    /// through the media cache, which fetches by URL.
    pub fn media_cache_url(&self, media_id: i64) -> Url {
        self.base_url
            .join(&format!("api/media/{media_id}/cache"))
            .expect("media cache path is always a valid url segment")
    }

    fn get_json<T>(&self, path: &str, params: &[(String, String)]) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let mut url = self.base_url.join(path)?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }

        let resp = self
            .http
            .get(url)
            .header(USER_AGENT, self.user_agent.clone())
            .send()?;

        let status = resp.status();
        let body = resp.text()?;
        if !status.is_success() {
            return Err(Error::Status { status, body });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

fn parse_base_url(raw: &str) -> Result<Url, url::ParseError> {
    // A trailing slash is required for Url::join to treat the last path
    // segment as a directory.
    let trimmed = raw.trim();
    if trimmed.ends_with('/') {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("{trimmed}/"))
    }
}

fn message_params(cursor: Option<MessageCursor>, limit: u32) -> Vec<(String, String)> {
    let mut params = vec![("limit".to_string(), limit.to_string())];
    match cursor {
        Some(MessageCursor::Before(id)) => {
            params.push(("start_before_message_id".into(), id.to_string()));
        }
        Some(MessageCursor::After(id)) => {
            params.push(("start_after_message_id".into(), id.to_string()));
        }
        None => {}
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::new(ClientConfig {
            user_agent: "msgvault-tui-test/0.0".into(),
            base_url: Some("http://archive.test:8000".into()),
            http_client: None,
        })
        .unwrap()
    }

    #[test]
    fn rejects_empty_user_agent() {
        let err = Client::new(ClientConfig::default()).unwrap_err();
        assert!(err.to_string().contains("user agent"));
    }

    #[test]
    fn base_url_gains_trailing_slash() {
        let url = parse_base_url("http://archive.test:8000").unwrap();
        assert_eq!(url.as_str(), "http://archive.test:8000/");
        let url = parse_base_url("http://archive.test:8000/vault/").unwrap();
        assert_eq!(url.join("api/contacts").unwrap().path(), "/vault/api/contacts");
    }

    #[test]
    fn message_params_without_cursor() {
        let params = message_params(None, 50);
        assert_eq!(params, vec![("limit".to_string(), "50".to_string())]);
    }

    #[test]
    fn message_params_before_cursor() {
        let params = message_params(Some(MessageCursor::Before(1047)), 50);
        assert!(params.contains(&("start_before_message_id".to_string(), "1047".to_string())));
        assert!(!params
            .iter()
            .any(|(key, _)| key == "start_after_message_id"));
    }

    #[test]
    fn message_params_after_cursor() {
        let params = message_params(Some(MessageCursor::After(88)), 25);
        assert!(params.contains(&("start_after_message_id".to_string(), "88".to_string())));
        assert!(params.contains(&("limit".to_string(), "25".to_string())));
    }

    #[test]
    fn media_cache_url_shape() {
        let url = client().media_cache_url(42);
        assert_eq!(url.as_str(), "http://archive.test:8000/api/media/42/cache");
    }

    #[test]
    fn decodes_message_page() {
        let body = r#"{
            "messages": [
                {
                    "id": 12,
                    "direction": "inbox",
                    "contact": "Ada",
                    "text": "hello",
                    "date": "2023-04-01T12:30:00",
                    "media": [
                        {"id": 3, "content_type": "image/jpeg", "filename": "cat.jpg"}
                    ]
                },
                {
                    "id": 11,
                    "direction": "sent",
                    "contact": null,
                    "text": "hi",
                    "date": "2023-04-01T12:29:00",
                    "media": []
                }
            ],
            "has_more": true,
            "has_newer": false,
            "total": 240
        }"#;
        let page: MessagePage = serde_json::from_str(body).unwrap();
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.messages[0].direction, Direction::Inbox);
        assert_eq!(page.messages[0].media[0].filename, "cat.jpg");
        assert!(page.has_more);
        assert!(!page.has_newer);
        assert_eq!(page.total, 240);
    }

    #[test]
    fn decodes_gallery_record_with_bare_contact_keys() {
        let body = r#"{
            "media": [
                {
                    "id": 9,
                    "content_type": "video/mp4",
                    "filename": "clip.mp4",
                    "message_id": 101,
                    "date": "2022-12-24T18:00:00",
                    "contact_id": 4,
                    "name": "Grace",
                    "address": "+15550100"
                }
            ],
            "has_more": false,
            "total": 1
        }"#;
        let page: MediaPage = serde_json::from_str(body).unwrap();
        assert_eq!(page.media[0].contact_name.as_deref(), Some("Grace"));
        assert_eq!(page.media[0].contact_address.as_deref(), Some("+15550100"));
        assert_eq!(page.media[0].message_id, 101);
    }

    #[test]
    fn conversation_display_name_falls_back_to_contacts() {
        let convo = Conversation {
            id: 1,
            name: None,
            contacts: vec![
                Contact {
                    id: 1,
                    name: Some("Ada".into()),
                    address: "+15550101".into(),
                },
                Contact {
                    id: 2,
                    name: None,
                    address: "+15550102".into(),
                },
            ],
        };
        assert_eq!(convo.display_name(), "Ada, +15550102");
    }
}
