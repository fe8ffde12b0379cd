use std::io::{self, Stdout};
use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, MouseEvent, MouseEventKind};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Padding, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use regex::RegexBuilder;
use textwrap::wrap;
use unicode_width::UnicodeWidthStr;

use crate::api;
use crate::config;
use crate::data::{ConversationService, GalleryService, MessageService};
use crate::feed::{anchor_cursor, Debouncer, FeedLayout, GalleryFeed, MessageFeed, SettleWindow};
use crate::media;

const COLOR_BG: Color = Color::Rgb(30, 30, 46);
const COLOR_PANEL_BG: Color = Color::Rgb(24, 24, 36);
const COLOR_BORDER_IDLE: Color = Color::Rgb(49, 50, 68);
const COLOR_BORDER_FOCUSED: Color = Color::Rgb(137, 180, 250);
const COLOR_TEXT_PRIMARY: Color = Color::Rgb(205, 214, 244);
const COLOR_TEXT_SECONDARY: Color = Color::Rgb(166, 173, 200);
const COLOR_ACCENT: Color = Color::Rgb(137, 180, 250);
const COLOR_SENT: Color = Color::Rgb(137, 180, 250);
const COLOR_INBOX_LABEL: Color = Color::Rgb(243, 139, 168);
const COLOR_SELECTED_BG: Color = Color::Rgb(69, 71, 90);

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const SIDEBAR_WIDTH: u16 = 32;
const DETAILS_WIDTH: u16 = 32;
const MOUSE_SCROLL_LINES: usize = 3;

struct Spinner {
    index: usize,
    last_tick: Instant,
}

impl Spinner {
    fn new() -> Self {
        Self {
            index: 0,
            last_tick: Instant::now(),
        }
    }

    fn frame(&self) -> &'static str {
        SPINNER_FRAMES[self.index % SPINNER_FRAMES.len()]
    }

    fn advance(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_tick) >= Duration::from_millis(120) {
            self.index = self.index.wrapping_add(1);
            self.last_tick = now;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.index = 0;
        self.last_tick = Instant::now();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pane {
    Sidebar,
    Main,
    Details,
}

impl Pane {
    fn title(self) -> &'static str {
        match self {
            Pane::Sidebar => "Conversations",
            Pane::Main => "Messages",
            Pane::Details => "Details",
        }
    }

    fn next(self, details_visible: bool) -> Self {
        match self {
            Pane::Sidebar => Pane::Main,
            Pane::Main if details_visible => Pane::Details,
            Pane::Main => Pane::Main,
            Pane::Details => Pane::Details,
        }
    }

    fn previous(self) -> Self {
        match self {
            Pane::Sidebar => Pane::Sidebar,
            Pane::Main => Pane::Sidebar,
            Pane::Details => Pane::Main,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum View {
    Timeline,
    Gallery,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum InputMode {
    Normal,
    Filter,
    Search,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum MessageLoadKind {
    Initial { anchor: Option<i64> },
    Older,
    Newer,
    Search,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ScrollTarget {
    Bottom,
    Message(i64),
    Top,
}

struct PendingConversations {
    request_id: u64,
}

struct PendingMessages {
    request_id: u64,
    conversation_id: i64,
    kind: MessageLoadKind,
    cancel_flag: Arc<AtomicBool>,
}

struct PendingGallery {
    request_id: u64,
    conversation_id: i64,
    cancel_flag: Arc<AtomicBool>,
}

struct PendingMediaOpen {
    media_id: i64,
}

enum AsyncResponse {
    Conversations {
        request_id: u64,
        result: Result<Vec<api::Conversation>>,
    },
    Messages {
        request_id: u64,
        conversation_id: i64,
        kind: MessageLoadKind,
        result: Result<api::MessagePage>,
    },
    SearchResults {
        request_id: u64,
        conversation_id: i64,
        result: Result<Vec<api::Message>>,
    },
    Gallery {
        request_id: u64,
        conversation_id: i64,
        result: Result<api::MediaPage>,
    },
    MediaOpened {
        media_id: i64,
        result: Result<String>,
    },
}

pub struct Options {
    pub status_message: String,
    pub conversation_service: Option<Arc<dyn ConversationService>>,
    pub message_service: Option<Arc<dyn MessageService>>,
    pub gallery_service: Option<Arc<dyn GalleryService>>,
    pub media_handle: Option<media::Handle>,
    pub player: config::PlayerConfig,
    pub feed: config::FeedConfig,
    pub config_path: String,
    pub fetch_conversations_on_start: bool,
}

pub struct Model {
    status_message: String,
    config_path: String,

    conversations: Vec<api::Conversation>,
    filtered: Vec<usize>,
    filter: String,
    selected_row: usize,
    sidebar_state: ListState,
    active_conversation: Option<i64>,
    details_visible: bool,

    view: View,
    focused_pane: Pane,
    input_mode: InputMode,

    feed: MessageFeed,
    feed_layout: FeedLayout,
    feed_scroll: usize,
    selected_message: usize,
    pending_prepend: Option<usize>,
    scroll_target: Option<ScrollTarget>,
    search: String,
    search_debounce: Debouncer,
    settle: SettleWindow,

    gallery: GalleryFeed,
    gallery_layout: FeedLayout,
    gallery_scroll: usize,
    selected_gallery: usize,

    main_view_height: usize,
    main_view_width: usize,

    conversation_service: Option<Arc<dyn ConversationService>>,
    message_service: Option<Arc<dyn MessageService>>,
    gallery_service: Option<Arc<dyn GalleryService>>,
    media_handle: Option<media::Handle>,
    player: config::PlayerConfig,
    feed_cfg: config::FeedConfig,

    spinner: Spinner,
    needs_redraw: bool,
    fetch_conversations_on_start: bool,

    response_tx: Sender<AsyncResponse>,
    response_rx: Receiver<AsyncResponse>,
    next_request_id: u64,
    pending_conversations: Option<PendingConversations>,
    pending_messages: Option<PendingMessages>,
    pending_gallery: Option<PendingGallery>,
    pending_media_open: Option<PendingMediaOpen>,
}

impl Model {
    pub fn new(options: Options) -> Self {
        let (response_tx, response_rx) = unbounded();
        let debounce = Debouncer::new(options.feed.debounce);
        let settle = SettleWindow::new(options.feed.scroll_settle);
        Self {
            status_message: options.status_message,
            config_path: options.config_path,
            conversations: Vec::new(),
            filtered: Vec::new(),
            filter: String::new(),
            selected_row: 0,
            sidebar_state: ListState::default(),
            active_conversation: None,
            details_visible: false,
            view: View::Timeline,
            focused_pane: Pane::Sidebar,
            input_mode: InputMode::Normal,
            feed: MessageFeed::new(),
            feed_layout: FeedLayout::default(),
            feed_scroll: 0,
            selected_message: 0,
            pending_prepend: None,
            scroll_target: None,
            search: String::new(),
            search_debounce: debounce,
            settle,
            gallery: GalleryFeed::new(),
            gallery_layout: FeedLayout::default(),
            gallery_scroll: 0,
            selected_gallery: 0,
            main_view_height: 0,
            main_view_width: 0,
            conversation_service: options.conversation_service,
            message_service: options.message_service,
            gallery_service: options.gallery_service,
            media_handle: options.media_handle,
            player: options.player,
            feed_cfg: options.feed,
            spinner: Spinner::new(),
            needs_redraw: true,
            fetch_conversations_on_start: options.fetch_conversations_on_start,
            response_tx,
            response_rx,
            next_request_id: 0,
            pending_conversations: None,
            pending_messages: None,
            pending_gallery: None,
            pending_media_open: None,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode()?;
        stdout.execute(EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        if self.fetch_conversations_on_start {
            self.reload_conversations();
        }

        let result = self.event_loop(&mut terminal);

        disable_raw_mode()?;
        terminal.backend_mut().execute(LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let mut last_tick = Instant::now();
        let tick_rate = Duration::from_millis(120);

        loop {
            if self.poll_async() {
                self.mark_dirty();
            }

            if self.search_debounce.fire(Instant::now()) {
                self.commit_search();
            }

            if self.needs_redraw {
                terminal.draw(|frame| self.draw(frame))?;
                self.needs_redraw = false;
            }

            let timeout = tick_rate
                .checked_sub(last_tick.elapsed())
                .unwrap_or_else(|| Duration::from_millis(16));

            if event::poll(timeout)? {
                match event::read()? {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        match self.handle_key(key.code) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(err) => {
                                self.status_message = format!("Error: {}", err);
                                self.mark_dirty();
                            }
                        }
                    }
                    Event::Mouse(mouse) => self.handle_mouse(mouse),
                    Event::Resize(_, _) => self.mark_dirty(),
                    _ => {}
                }
            }

            if self.poll_async() {
                self.mark_dirty();
            }

            if last_tick.elapsed() >= tick_rate {
                last_tick = Instant::now();
                if self.is_loading() && self.spinner.advance() {
                    self.mark_dirty();
                } else if !self.is_loading() {
                    self.spinner.reset();
                }
            }
        }

        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.needs_redraw = true;
    }

    fn is_loading(&self) -> bool {
        self.feed.status().is_loading()
            || self.gallery.is_loading()
            || self.pending_conversations.is_some()
            || self.pending_media_open.is_some()
    }

    fn poll_async(&mut self) -> bool {
        let mut handled = false;
        while let Ok(message) = self.response_rx.try_recv() {
            self.handle_async_response(message);
            handled = true;
        }
        handled
    }

    fn take_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    // ---- conversations -------------------------------------------------

    fn reload_conversations(&mut self) {
        let Some(service) = self.conversation_service.clone() else {
            self.status_message = format!(
                "Conversation list unavailable. Check server.base_url in {}.",
                self.config_path
            );
            return;
        };

        let request_id = self.take_request_id();
        self.pending_conversations = Some(PendingConversations { request_id });
        self.status_message = "Loading conversations...".to_string();
        self.spinner.reset();

        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = service.list_conversations();
            let _ = tx.send(AsyncResponse::Conversations { request_id, result });
        });
    }

    fn apply_filter(&mut self) {
        self.filtered = filter_conversations(&self.conversations, &self.filter);
        if self.filtered.is_empty() {
            self.selected_row = 0;
        } else {
            self.selected_row = self.selected_row.min(self.filtered.len() - 1);
        }
    }

    fn selected_conversation(&self) -> Option<&api::Conversation> {
        let index = *self.filtered.get(self.selected_row)?;
        self.conversations.get(index)
    }

    fn active_conversation_entry(&self) -> Option<&api::Conversation> {
        let id = self.active_conversation?;
        self.conversations.iter().find(|c| c.id == id)
    }

    fn select_conversation(&mut self) {
        let Some(conversation) = self.selected_conversation() else {
            return;
        };
        let id = conversation.id;
        let name = conversation.display_name();
        if self.active_conversation == Some(id) && !self.feed.is_empty() {
            self.status_message = format!("{} is already open.", name);
            self.focused_pane = Pane::Main;
            return;
        }

        self.active_conversation = Some(id);
        self.view = View::Timeline;
        self.focused_pane = Pane::Main;
        self.search.clear();
        self.search_debounce.cancel();
        self.feed.clear();
        self.feed_scroll = 0;
        self.selected_message = 0;
        self.gallery.clear();
        self.gallery_scroll = 0;
        self.selected_gallery = 0;
        self.cancel_pending_feed_loads();
        self.status_message = format!("Loading {}...", name);
        self.start_initial_load(None);
    }

    fn cancel_pending_feed_loads(&mut self) {
        if let Some(pending) = self.pending_messages.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }
        if let Some(pending) = self.pending_gallery.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }
    }

    // ---- message feed --------------------------------------------------

    fn start_initial_load(&mut self, anchor: Option<i64>) {
        let Some(conversation_id) = self.active_conversation else {
            return;
        };
        let Some(service) = self.message_service.clone() else {
            self.status_message = "Message service unavailable.".to_string();
            return;
        };

        // An initial load supersedes whatever is in flight.
        if let Some(pending) = self.pending_messages.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }

        self.feed.begin_initial();
        let request_id = self.take_request_id();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let kind = MessageLoadKind::Initial { anchor };
        self.pending_messages = Some(PendingMessages {
            request_id,
            conversation_id,
            kind,
            cancel_flag: cancel_flag.clone(),
        });
        self.spinner.reset();

        let limit = self.feed_cfg.page_size;
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let cursor = anchor.map(anchor_cursor);
            let result = service.load_page(conversation_id, cursor, limit);
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(AsyncResponse::Messages {
                request_id,
                conversation_id,
                kind,
                result,
            });
        });
    }

    fn start_older_load(&mut self) {
        let Some(conversation_id) = self.active_conversation else {
            return;
        };
        let Some(service) = self.message_service.clone() else {
            return;
        };
        let Some(oldest) = self.feed.oldest_id() else {
            return;
        };
        if !self.feed.begin_older() {
            return;
        }

        let request_id = self.take_request_id();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending_messages = Some(PendingMessages {
            request_id,
            conversation_id,
            kind: MessageLoadKind::Older,
            cancel_flag: cancel_flag.clone(),
        });
        self.status_message = "Loading older messages...".to_string();
        self.spinner.reset();

        let limit = self.feed_cfg.page_size;
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result =
                service.load_page(conversation_id, Some(api::MessageCursor::Before(oldest)), limit);
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(AsyncResponse::Messages {
                request_id,
                conversation_id,
                kind: MessageLoadKind::Older,
                result,
            });
        });
    }

    fn start_newer_load(&mut self) {
        let Some(conversation_id) = self.active_conversation else {
            return;
        };
        let Some(service) = self.message_service.clone() else {
            return;
        };
        let Some(newest) = self.feed.newest_id() else {
            return;
        };
        if !self.feed.begin_newer() {
            return;
        }

        let request_id = self.take_request_id();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending_messages = Some(PendingMessages {
            request_id,
            conversation_id,
            kind: MessageLoadKind::Newer,
            cancel_flag: cancel_flag.clone(),
        });
        self.status_message = "Loading newer messages...".to_string();
        self.spinner.reset();

        let limit = self.feed_cfg.page_size;
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result =
                service.load_page(conversation_id, Some(api::MessageCursor::After(newest)), limit);
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(AsyncResponse::Messages {
                request_id,
                conversation_id,
                kind: MessageLoadKind::Newer,
                result,
            });
        });
    }

    fn commit_search(&mut self) {
        let query = self.search.trim().to_string();
        if query.is_empty() {
            // Clearing the field returns the feed to the live head.
            if self.feed.is_search_results() {
                self.start_initial_load(None);
            }
            return;
        }

        let Some(conversation_id) = self.active_conversation else {
            return;
        };
        let Some(service) = self.message_service.clone() else {
            return;
        };

        if let Some(pending) = self.pending_messages.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }
        self.feed.begin_search();
        let request_id = self.take_request_id();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending_messages = Some(PendingMessages {
            request_id,
            conversation_id,
            kind: MessageLoadKind::Search,
            cancel_flag: cancel_flag.clone(),
        });
        self.status_message = format!("Searching for \"{}\"...", query);
        self.spinner.reset();

        let tx = self.response_tx.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = service.search(conversation_id, &query);
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(AsyncResponse::SearchResults {
                request_id,
                conversation_id,
                result,
            });
        });
    }

    fn clear_search(&mut self) {
        self.search.clear();
        self.search_debounce.cancel();
        if self.feed.is_search_results() {
            self.status_message = "Search cleared.".to_string();
            self.start_initial_load(None);
        }
    }

    /// Enter on a message: from a search result set this jumps back into
    /// the surrounding history; otherwise it opens the first attachment.
    fn activate_selected_message(&mut self) {
        let Some(message) = self.feed.messages().get(self.selected_message) else {
            return;
        };
        if self.feed.is_search_results() {
            let anchor = message.id;
            self.search.clear();
            self.search_debounce.cancel();
            self.status_message = format!("Jumping to message {}...", anchor);
            self.start_initial_load(Some(anchor));
            return;
        }
        if let Some(media) = message.media.first().cloned() {
            self.open_media(media.id, media.content_type, media.filename);
        }
    }

    fn open_selected_attachment(&mut self) {
        match self.view {
            View::Timeline => {
                let Some(message) = self.feed.messages().get(self.selected_message) else {
                    return;
                };
                let Some(media) = message.media.first().cloned() else {
                    self.status_message = "No attachment on this message.".to_string();
                    return;
                };
                self.open_media(media.id, media.content_type, media.filename);
            }
            View::Gallery => {
                let Some(item) = self.gallery.items().get(self.selected_gallery).cloned() else {
                    return;
                };
                self.open_media(item.id, item.content_type, item.filename);
            }
        }
    }

    // ---- gallery -------------------------------------------------------

    fn toggle_view(&mut self) {
        match self.view {
            View::Timeline => {
                if self.active_conversation.is_none() {
                    self.status_message = "Select a conversation first.".to_string();
                    return;
                }
                self.view = View::Gallery;
                self.focused_pane = Pane::Main;
                if self.gallery.is_empty() {
                    self.start_gallery_load();
                }
            }
            View::Gallery => {
                self.view = View::Timeline;
            }
        }
    }

    fn start_gallery_load(&mut self) {
        let Some(conversation_id) = self.active_conversation else {
            return;
        };
        let Some(service) = self.gallery_service.clone() else {
            self.status_message = "Media gallery unavailable.".to_string();
            return;
        };
        if !self.gallery.begin_load() {
            return;
        }

        let request_id = self.take_request_id();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending_gallery = Some(PendingGallery {
            request_id,
            conversation_id,
            cancel_flag: cancel_flag.clone(),
        });
        self.status_message = "Loading media...".to_string();
        self.spinner.reset();

        let offset = self.gallery.offset();
        let limit = self.feed_cfg.gallery_page_size;
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = service.load_page(conversation_id, offset, limit);
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(AsyncResponse::Gallery {
                request_id,
                conversation_id,
                result,
            });
        });
    }

    /// Jump from a gallery item back to its message in the timeline.
    fn jump_to_gallery_message(&mut self) {
        let Some(item) = self.gallery.items().get(self.selected_gallery) else {
            return;
        };
        let message_id = item.message_id;
        self.view = View::Timeline;
        self.search.clear();
        self.search_debounce.cancel();
        self.status_message = format!("Jumping to message {}...", message_id);
        self.start_initial_load(Some(message_id));
    }

    // ---- media open ----------------------------------------------------

    fn open_media(&mut self, media_id: i64, content_type: String, filename: String) {
        if self.pending_media_open.is_some() {
            self.status_message = "Another attachment is already opening...".to_string();
            return;
        }
        let Some(service) = self.gallery_service.clone() else {
            self.status_message = "Media service unavailable.".to_string();
            return;
        };

        let url = service.media_url(media_id);
        let kind = media::media_kind(&content_type);
        let handle = self.media_handle.clone();
        let player = self.player.clone();
        self.pending_media_open = Some(PendingMediaOpen { media_id });
        self.status_message = format!("Fetching {}...", filename);
        self.spinner.reset();

        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = (|| -> Result<String> {
                if let Some(handle) = handle {
                    let rx = handle.fetch(media::Request {
                        url: url.clone(),
                        media_type: Some(content_type.clone()),
                        ttl: None,
                        force: false,
                    });
                    let outcome = rx.recv().context("media worker stopped")?;
                    if let Some(err) = outcome.error {
                        return Err(err);
                    }
                    let entry = outcome.entry.context("media: empty download result")?;
                    if media::open_with_player(&player, kind, Path::new(&entry.file_path))? {
                        return Ok(format!("Opened {}.", filename));
                    }
                }
                media::open_in_browser(&url)?;
                Ok(format!("Opened {} in browser.", filename))
            })();
            let _ = tx.send(AsyncResponse::MediaOpened { media_id, result });
        });
    }

    // ---- async responses -----------------------------------------------

    fn handle_async_response(&mut self, message: AsyncResponse) {
        match message {
            AsyncResponse::Conversations { request_id, result } => {
                let Some(pending) = &self.pending_conversations else {
                    return;
                };
                if pending.request_id != request_id {
                    return;
                }
                self.pending_conversations = None;
                match result {
                    Ok(conversations) => {
                        self.conversations = conversations;
                        self.apply_filter();
                        self.status_message = format!(
                            "Loaded {} conversations. Press Enter to open one.",
                            self.conversations.len()
                        );
                    }
                    Err(err) => {
                        self.status_message = format!("Failed to load conversations: {err:#}");
                    }
                }
                self.mark_dirty();
            }
            AsyncResponse::Messages {
                request_id,
                conversation_id,
                kind,
                result,
            } => {
                let Some(pending) = &self.pending_messages else {
                    return;
                };
                if pending.cancel_flag.load(Ordering::SeqCst)
                    || pending.request_id != request_id
                    || pending.conversation_id != conversation_id
                {
                    return;
                }
                if self.active_conversation != Some(conversation_id) {
                    return;
                }
                self.pending_messages = None;

                match result {
                    Ok(page) => self.apply_message_page(kind, page),
                    Err(err) => {
                        self.feed.fail();
                        self.status_message = format!("Failed to load messages: {err:#}");
                    }
                }
                self.mark_dirty();
            }
            AsyncResponse::SearchResults {
                request_id,
                conversation_id,
                result,
            } => {
                let Some(pending) = &self.pending_messages else {
                    return;
                };
                if pending.cancel_flag.load(Ordering::SeqCst)
                    || pending.request_id != request_id
                    || pending.conversation_id != conversation_id
                {
                    return;
                }
                if self.active_conversation != Some(conversation_id) {
                    return;
                }
                self.pending_messages = None;

                match result {
                    Ok(results) => {
                        let count = results.len();
                        self.feed.apply_search(results);
                        self.selected_message = 0;
                        self.scroll_target = Some(ScrollTarget::Top);
                        self.status_message = format!(
                            "{} result{} for \"{}\". Enter jumps into context.",
                            count,
                            if count == 1 { "" } else { "s" },
                            self.search.trim()
                        );
                    }
                    Err(err) => {
                        self.feed.fail();
                        self.status_message = format!("Search failed: {err:#}");
                    }
                }
                self.mark_dirty();
            }
            AsyncResponse::Gallery {
                request_id,
                conversation_id,
                result,
            } => {
                let Some(pending) = &self.pending_gallery else {
                    return;
                };
                if pending.cancel_flag.load(Ordering::SeqCst)
                    || pending.request_id != request_id
                    || pending.conversation_id != conversation_id
                {
                    return;
                }
                if self.active_conversation != Some(conversation_id) {
                    return;
                }
                self.pending_gallery = None;

                match result {
                    Ok(page) => {
                        let added = self.gallery.apply(page);
                        // Appends extend below the viewport; existing item
                        // offsets are untouched, so the scroll holds.
                        self.status_message = format!(
                            "Loaded {} media item{} ({} of {}).",
                            added,
                            if added == 1 { "" } else { "s" },
                            self.gallery.len(),
                            self.gallery.total()
                        );
                        self.settle.arm(Instant::now());
                    }
                    Err(err) => {
                        self.gallery.fail();
                        self.status_message = format!("Failed to load media: {err:#}");
                    }
                }
                self.mark_dirty();
            }
            AsyncResponse::MediaOpened { media_id, result } => {
                let Some(pending) = &self.pending_media_open else {
                    return;
                };
                if pending.media_id != media_id {
                    return;
                }
                self.pending_media_open = None;
                match result {
                    Ok(message) => self.status_message = message,
                    Err(err) => {
                        self.status_message = format!("Failed to open attachment: {err:#}");
                    }
                }
                self.mark_dirty();
            }
        }
    }

    fn apply_message_page(&mut self, kind: MessageLoadKind, page: api::MessagePage) {
        match kind {
            MessageLoadKind::Initial { anchor } => {
                self.feed.apply_initial(page);
                let target = anchor
                    .and_then(|id| self.feed.index_of(id).map(|_| ScrollTarget::Message(id)))
                    .unwrap_or(ScrollTarget::Bottom);
                self.selected_message = match anchor.and_then(|id| self.feed.index_of(id)) {
                    Some(index) => index,
                    None => self.feed.len().saturating_sub(1),
                };
                self.scroll_target = Some(target);
                self.status_message = format!(
                    "Loaded {} of {} messages.",
                    self.feed.len(),
                    self.feed.total()
                );
            }
            MessageLoadKind::Older => {
                let inserted = self.feed.apply_older(page);
                self.selected_message = self.selected_message.saturating_add(inserted);
                self.pending_prepend = Some(inserted);
                self.status_message = if inserted == 0 {
                    "No older messages.".to_string()
                } else {
                    format!("Loaded {} older messages.", inserted)
                };
            }
            MessageLoadKind::Newer => {
                let previous_newest = self.feed.newest_id();
                let appended = self.feed.apply_newer(page);
                self.scroll_target = Some(match previous_newest {
                    Some(id) if appended > 0 => ScrollTarget::Message(id),
                    _ => ScrollTarget::Bottom,
                });
                self.status_message = if appended == 0 {
                    "No newer messages.".to_string()
                } else {
                    format!("Loaded {} newer messages.", appended)
                };
            }
            MessageLoadKind::Search => {
                // Search results arrive through SearchResults.
                debug_assert!(false, "search pages use the SearchResults response");
            }
        }
    }

    // ---- input ---------------------------------------------------------

    fn handle_key(&mut self, code: KeyCode) -> Result<bool> {
        match self.input_mode {
            InputMode::Filter => {
                self.handle_filter_key(code);
                return Ok(false);
            }
            InputMode::Search => {
                self.handle_search_key(code);
                return Ok(false);
            }
            InputMode::Normal => {}
        }

        match code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Tab | KeyCode::Char('l') => {
                self.focused_pane = self.focused_pane.next(self.details_visible);
                self.mark_dirty();
            }
            KeyCode::BackTab | KeyCode::Char('h') => {
                self.focused_pane = self.focused_pane.previous();
                self.mark_dirty();
            }
            KeyCode::Char('d') => {
                self.details_visible = !self.details_visible;
                if !self.details_visible && self.focused_pane == Pane::Details {
                    self.focused_pane = Pane::Main;
                }
                self.mark_dirty();
            }
            KeyCode::Char('m') => {
                self.toggle_view();
                self.mark_dirty();
            }
            KeyCode::Char('r') => {
                self.reload_conversations();
                if self.active_conversation.is_some() {
                    match self.view {
                        View::Timeline => self.start_initial_load(None),
                        View::Gallery => {
                            self.gallery.clear();
                            self.start_gallery_load();
                        }
                    }
                }
                self.mark_dirty();
            }
            KeyCode::Char('/') => {
                match self.focused_pane {
                    Pane::Sidebar => self.input_mode = InputMode::Filter,
                    Pane::Main if self.view == View::Timeline => {
                        if self.active_conversation.is_some() {
                            self.input_mode = InputMode::Search;
                        }
                    }
                    _ => {}
                }
                self.mark_dirty();
            }
            KeyCode::Esc => {
                match self.focused_pane {
                    Pane::Sidebar => {
                        self.filter.clear();
                        self.apply_filter();
                    }
                    Pane::Main => self.clear_search(),
                    Pane::Details => {}
                }
                self.mark_dirty();
            }
            _ => match self.focused_pane {
                Pane::Sidebar => self.handle_sidebar_key(code),
                Pane::Main => self.handle_main_key(code),
                Pane::Details => {}
            },
        }

        Ok(false)
    }

    fn handle_filter_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Enter | KeyCode::Esc => {
                if code == KeyCode::Esc {
                    self.filter.clear();
                }
                self.input_mode = InputMode::Normal;
                self.apply_filter();
            }
            KeyCode::Backspace => {
                self.filter.pop();
                self.apply_filter();
            }
            KeyCode::Char(c) => {
                self.filter.push(c);
                self.apply_filter();
            }
            _ => {}
        }
        self.mark_dirty();
    }

    fn handle_search_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Enter => {
                self.input_mode = InputMode::Normal;
                // Skip the remaining debounce delay.
                if !self.search.trim().is_empty() {
                    self.search_debounce.cancel();
                    self.commit_search();
                }
            }
            KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
                self.clear_search();
            }
            KeyCode::Backspace => {
                self.search.pop();
                self.search_debounce.schedule(Instant::now());
            }
            KeyCode::Char(c) => {
                self.search.push(c);
                self.search_debounce.schedule(Instant::now());
            }
            _ => {}
        }
        self.mark_dirty();
    }

    fn handle_sidebar_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Char('j') | KeyCode::Down => {
                if !self.filtered.is_empty() {
                    self.selected_row = (self.selected_row + 1).min(self.filtered.len() - 1);
                }
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.selected_row = self.selected_row.saturating_sub(1);
            }
            KeyCode::Char('g') => self.selected_row = 0,
            KeyCode::Char('G') => {
                self.selected_row = self.filtered.len().saturating_sub(1);
            }
            KeyCode::Enter => self.select_conversation(),
            _ => return,
        }
        self.mark_dirty();
    }

    fn handle_main_key(&mut self, code: KeyCode) {
        match self.view {
            View::Timeline => self.handle_timeline_key(code),
            View::Gallery => self.handle_gallery_key(code),
        }
    }

    fn handle_timeline_key(&mut self, code: KeyCode) {
        let viewport = self.main_view_height;
        match code {
            KeyCode::Char('j') => {
                if !self.feed.is_empty() {
                    self.selected_message =
                        (self.selected_message + 1).min(self.feed.len() - 1);
                    self.ensure_message_visible();
                }
            }
            KeyCode::Char('k') => {
                self.selected_message = self.selected_message.saturating_sub(1);
                self.ensure_message_visible();
            }
            KeyCode::Down => self.scroll_timeline_by(1),
            KeyCode::Up => self.scroll_timeline_by(-1),
            KeyCode::PageDown | KeyCode::Char(' ') => {
                self.scroll_timeline_by(viewport as isize);
            }
            KeyCode::PageUp => self.scroll_timeline_by(-(viewport as isize)),
            KeyCode::Char('g') => {
                self.feed_scroll = 0;
                self.selected_message = 0;
            }
            KeyCode::Char('G') => {
                self.feed_scroll = self.max_feed_scroll();
                self.selected_message = self.feed.len().saturating_sub(1);
            }
            KeyCode::Enter => self.activate_selected_message(),
            KeyCode::Char('o') => self.open_selected_attachment(),
            _ => return,
        }
        self.maybe_autoload();
        self.mark_dirty();
    }

    fn handle_gallery_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Char('j') | KeyCode::Down => {
                if !self.gallery.is_empty() {
                    self.selected_gallery =
                        (self.selected_gallery + 1).min(self.gallery.len() - 1);
                    self.ensure_gallery_visible();
                }
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.selected_gallery = self.selected_gallery.saturating_sub(1);
                self.ensure_gallery_visible();
            }
            KeyCode::PageDown | KeyCode::Char(' ') => {
                self.gallery_scroll = self
                    .gallery_scroll
                    .saturating_add(self.main_view_height)
                    .min(self.max_gallery_scroll());
            }
            KeyCode::PageUp => {
                self.gallery_scroll = self.gallery_scroll.saturating_sub(self.main_view_height);
            }
            KeyCode::Char('g') => {
                self.gallery_scroll = 0;
                self.selected_gallery = 0;
            }
            KeyCode::Char('G') => {
                self.gallery_scroll = self.max_gallery_scroll();
                self.selected_gallery = self.gallery.len().saturating_sub(1);
            }
            KeyCode::Enter => self.jump_to_gallery_message(),
            KeyCode::Char('o') => self.open_selected_attachment(),
            _ => return,
        }
        self.maybe_autoload();
        self.mark_dirty();
    }

    fn handle_mouse(&mut self, event: MouseEvent) {
        let delta: isize = match event.kind {
            MouseEventKind::ScrollUp => -(MOUSE_SCROLL_LINES as isize),
            MouseEventKind::ScrollDown => MOUSE_SCROLL_LINES as isize,
            _ => return,
        };
        match self.view {
            View::Timeline => self.scroll_timeline_by(delta),
            View::Gallery => {
                if delta < 0 {
                    self.gallery_scroll = self.gallery_scroll.saturating_sub(delta.unsigned_abs());
                } else {
                    self.gallery_scroll = self
                        .gallery_scroll
                        .saturating_add(delta as usize)
                        .min(self.max_gallery_scroll());
                }
            }
        }
        self.maybe_autoload();
        self.mark_dirty();
    }

    // ---- scrolling -----------------------------------------------------

    fn max_feed_scroll(&self) -> usize {
        self.feed_layout
            .total_height()
            .saturating_sub(self.main_view_height)
    }

    fn max_gallery_scroll(&self) -> usize {
        self.gallery_layout
            .total_height()
            .saturating_sub(self.main_view_height)
    }

    fn scroll_timeline_by(&mut self, delta: isize) {
        if delta < 0 {
            self.feed_scroll = self.feed_scroll.saturating_sub(delta.unsigned_abs());
        } else {
            self.feed_scroll = self
                .feed_scroll
                .saturating_add(delta as usize)
                .min(self.max_feed_scroll());
        }
    }

    fn ensure_message_visible(&mut self) {
        let offset = self.feed_layout.offset_of(self.selected_message);
        let viewport = self.main_view_height.max(1);
        if offset < self.feed_scroll {
            self.feed_scroll = offset;
        } else {
            let bottom = self.feed_layout.offset_of(self.selected_message + 1);
            if bottom > self.feed_scroll + viewport {
                self.feed_scroll = bottom.saturating_sub(viewport);
            }
        }
    }

    fn ensure_gallery_visible(&mut self) {
        let offset = self.gallery_layout.offset_of(self.selected_gallery);
        let viewport = self.main_view_height.max(1);
        if offset < self.gallery_scroll {
            self.gallery_scroll = offset;
        } else {
            let bottom = self.gallery_layout.offset_of(self.selected_gallery + 1);
            if bottom > self.gallery_scroll + viewport {
                self.gallery_scroll = bottom.saturating_sub(viewport);
            }
        }
    }

    /// Edge-proximity check after user-driven scrolling. Suppressed inside
    /// the settle window so programmatic adjustments cannot cascade.
    fn maybe_autoload(&mut self) {
        if self.settle.active(Instant::now()) {
            return;
        }
        match self.view {
            View::Timeline => {
                if self.feed.is_empty() || self.feed.status().is_loading() {
                    return;
                }
                let threshold = self.feed_cfg.edge_threshold;
                if self.feed_scroll <= threshold && self.feed.has_more() {
                    self.start_older_load();
                } else if self.max_feed_scroll().saturating_sub(self.feed_scroll) <= threshold
                    && self.feed.has_newer()
                {
                    self.start_newer_load();
                }
            }
            View::Gallery => {
                if self.gallery.is_empty() || self.gallery.is_loading() {
                    return;
                }
                let threshold = self.feed_cfg.edge_threshold;
                if self.max_gallery_scroll().saturating_sub(self.gallery_scroll) <= threshold
                    && self.gallery.has_more()
                {
                    self.start_gallery_load();
                }
            }
        }
    }

    // ---- drawing -------------------------------------------------------

    fn draw(&mut self, frame: &mut Frame<'_>) {
        let area = frame.size();
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(3),
                Constraint::Length(1),
            ])
            .split(area);

        let mut columns = vec![Constraint::Length(SIDEBAR_WIDTH), Constraint::Min(20)];
        if self.details_visible {
            columns.push(Constraint::Length(DETAILS_WIDTH));
        }
        let body = Layout::default()
            .direction(Direction::Horizontal)
            .constraints(columns)
            .split(rows[1]);

        let main_area = body[1];
        self.main_view_height = main_area.height.saturating_sub(2) as usize;
        self.main_view_width = main_area.width.saturating_sub(4) as usize;

        self.rebuild_layouts();
        self.resolve_scroll();

        self.draw_header(frame, rows[0]);
        self.draw_sidebar(frame, body[0]);
        match self.view {
            View::Timeline => self.draw_timeline(frame, main_area),
            View::Gallery => self.draw_gallery(frame, main_area),
        }
        if self.details_visible {
            if let Some(details_area) = body.get(2) {
                self.draw_details(frame, *details_area);
            }
        }
        self.draw_status(frame, rows[2]);
    }

    fn rebuild_layouts(&mut self) {
        let width = self.main_view_width.max(8);
        let heights: Vec<usize> = self
            .feed
            .messages()
            .iter()
            .map(|message| message_height(message, width))
            .collect();
        self.feed_layout = FeedLayout::from_heights(&heights);

        let gallery_heights = vec![GALLERY_ITEM_HEIGHT; self.gallery.len()];
        self.gallery_layout = FeedLayout::from_heights(&gallery_heights);
    }

    /// Apply deferred scroll work against the freshly rebuilt layout: the
    /// prepend compensation and any one-shot scroll target.
    fn resolve_scroll(&mut self) {
        if let Some(inserted) = self.pending_prepend.take() {
            self.feed_scroll = self
                .feed_scroll
                .saturating_add(self.feed_layout.prepend_delta(inserted));
            self.settle.arm(Instant::now());
        }

        if let Some(target) = self.scroll_target.take() {
            self.feed_scroll = match target {
                ScrollTarget::Top => 0,
                ScrollTarget::Bottom => self.max_feed_scroll(),
                ScrollTarget::Message(id) => match self.feed.index_of(id) {
                    Some(index) => self.feed_layout.offset_of(index),
                    None => self.max_feed_scroll(),
                },
            };
            self.settle.arm(Instant::now());
        }

        self.feed_scroll = self.feed_scroll.min(self.max_feed_scroll());
        self.gallery_scroll = self.gallery_scroll.min(self.max_gallery_scroll());
    }

    fn draw_header(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let title = match self.active_conversation_entry() {
            Some(conversation) => conversation.display_name(),
            None => "Messages".to_string(),
        };
        let available = area.width.saturating_sub(14) as usize;
        let truncated = truncate_with_ellipsis(&title, available);
        let view_label = match self.view {
            View::Timeline => " timeline ",
            View::Gallery => " gallery ",
        };
        let header = Paragraph::new(Line::from(vec![
            Span::styled(
                truncated,
                Style::default()
                    .fg(COLOR_TEXT_PRIMARY)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(view_label, Style::default().fg(COLOR_ACCENT)),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(COLOR_BORDER_IDLE))
                .style(Style::default().bg(COLOR_BG)),
        );
        frame.render_widget(header, area);
    }

    fn draw_sidebar(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let focused = self.focused_pane == Pane::Sidebar;
        let title = if self.filter.is_empty() && self.input_mode != InputMode::Filter {
            Pane::Sidebar.title().to_string()
        } else {
            format!("Conversations /{}", self.filter)
        };
        let border = if focused {
            COLOR_BORDER_FOCUSED
        } else {
            COLOR_BORDER_IDLE
        };

        let items: Vec<ListItem> = self
            .filtered
            .iter()
            .map(|&index| {
                let conversation = &self.conversations[index];
                let active = self.active_conversation == Some(conversation.id);
                let style = if active {
                    Style::default()
                        .fg(COLOR_ACCENT)
                        .add_modifier(Modifier::BOLD)
                } else {
                    Style::default().fg(COLOR_TEXT_PRIMARY)
                };
                ListItem::new(Line::from(Span::styled(
                    truncate_with_ellipsis(
                        &conversation.display_name(),
                        area.width.saturating_sub(4) as usize,
                    ),
                    style,
                )))
            })
            .collect();

        let list = List::new(items)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(border))
                    .style(Style::default().bg(COLOR_PANEL_BG)),
            )
            .highlight_style(Style::default().bg(COLOR_SELECTED_BG));
        if self.filtered.is_empty() {
            self.sidebar_state.select(None);
        } else {
            self.sidebar_state
                .select(Some(self.selected_row.min(self.filtered.len() - 1)));
        }
        frame.render_stateful_widget(list, area, &mut self.sidebar_state);
    }

    fn draw_timeline(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let focused = self.focused_pane == Pane::Main;
        let border = if focused {
            COLOR_BORDER_FOCUSED
        } else {
            COLOR_BORDER_IDLE
        };
        let title = if self.input_mode == InputMode::Search || !self.search.is_empty() {
            format!("Messages /{}", self.search)
        } else if self.feed.is_search_results() {
            "Search results".to_string()
        } else {
            Pane::Main.title().to_string()
        };

        let width = self.main_view_width.max(8);
        let mut lines: Vec<Line<'static>> = Vec::new();
        if self.feed.is_empty() {
            let placeholder = if self.active_conversation.is_none() {
                "Select a conversation on the left and press Enter."
            } else if self.feed.status().is_loading() {
                "Loading messages..."
            } else {
                "No messages."
            };
            lines.push(Line::from(Span::styled(
                placeholder.to_string(),
                Style::default().fg(COLOR_TEXT_SECONDARY),
            )));
        } else {
            for (index, message) in self.feed.messages().iter().enumerate() {
                lines.extend(message_lines(message, width, index == self.selected_message));
            }
        }

        let paragraph = Paragraph::new(Text::from(lines))
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(border))
                    .style(Style::default().bg(COLOR_PANEL_BG))
                    .padding(Padding::horizontal(1)),
            )
            .scroll((self.feed_scroll.min(u16::MAX as usize) as u16, 0));
        frame.render_widget(paragraph, area);
    }

    fn draw_gallery(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let focused = self.focused_pane == Pane::Main;
        let border = if focused {
            COLOR_BORDER_FOCUSED
        } else {
            COLOR_BORDER_IDLE
        };
        let title = format!(
            "Media ({} of {})",
            self.gallery.len(),
            self.gallery.total()
        );

        let width = self.main_view_width.max(8);
        let mut lines: Vec<Line<'static>> = Vec::new();
        if self.gallery.is_empty() {
            let placeholder = if self.gallery.is_loading() {
                "Loading media..."
            } else {
                "No media in this conversation."
            };
            lines.push(Line::from(Span::styled(
                placeholder.to_string(),
                Style::default().fg(COLOR_TEXT_SECONDARY),
            )));
        } else {
            for (index, item) in self.gallery.items().iter().enumerate() {
                lines.extend(gallery_lines(item, width, index == self.selected_gallery));
            }
        }

        let paragraph = Paragraph::new(Text::from(lines))
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(border))
                    .style(Style::default().bg(COLOR_PANEL_BG))
                    .padding(Padding::horizontal(1)),
            )
            .scroll((self.gallery_scroll.min(u16::MAX as usize) as u16, 0));
        frame.render_widget(paragraph, area);
    }

    fn draw_details(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let focused = self.focused_pane == Pane::Details;
        let border = if focused {
            COLOR_BORDER_FOCUSED
        } else {
            COLOR_BORDER_IDLE
        };

        let mut lines: Vec<Line<'static>> = Vec::new();
        match self.active_conversation_entry() {
            Some(conversation) => {
                // Full title, untruncated; the header clips long names.
                lines.push(Line::from(Span::styled(
                    conversation.display_name(),
                    Style::default()
                        .fg(COLOR_ACCENT)
                        .add_modifier(Modifier::BOLD),
                )));
                lines.push(Line::default());
                for contact in &conversation.contacts {
                    lines.push(Line::from(Span::styled(
                        contact.display_name().to_string(),
                        Style::default()
                            .fg(COLOR_TEXT_PRIMARY)
                            .add_modifier(Modifier::BOLD),
                    )));
                    lines.push(Line::from(Span::styled(
                        contact.address.clone(),
                        Style::default().fg(COLOR_TEXT_SECONDARY),
                    )));
                    lines.push(Line::default());
                }
            }
            None => {
                lines.push(Line::from(Span::styled(
                    "No conversation selected.".to_string(),
                    Style::default().fg(COLOR_TEXT_SECONDARY),
                )));
            }
        }

        let paragraph = Paragraph::new(Text::from(lines))
            .wrap(Wrap { trim: false })
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(Pane::Details.title())
                    .border_style(Style::default().fg(border))
                    .style(Style::default().bg(COLOR_PANEL_BG))
                    .padding(Padding::horizontal(1)),
            );
        frame.render_widget(paragraph, area);
    }

    fn draw_status(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let mut spans = Vec::new();
        if self.is_loading() {
            spans.push(Span::styled(
                format!("{} ", self.spinner.frame()),
                Style::default().fg(COLOR_ACCENT),
            ));
        }
        spans.push(Span::styled(
            self.status_message.clone(),
            Style::default().fg(COLOR_TEXT_SECONDARY),
        ));

        let mut hints = vec!["q quit", "Enter open", "/ search", "m media", "d details"];
        if self.feed.has_more() && self.view == View::Timeline {
            hints.push("older above");
        }
        if self.feed.has_newer() && self.view == View::Timeline {
            hints.push("newer below");
        }
        let right = hints.join(" · ");
        let pad = (area.width as usize)
            .saturating_sub(spans.iter().map(|s| s.content.width()).sum::<usize>())
            .saturating_sub(right.width() + 1);
        spans.push(Span::raw(" ".repeat(pad)));
        spans.push(Span::styled(right, Style::default().fg(COLOR_TEXT_SECONDARY)));

        let status =
            Paragraph::new(Line::from(spans)).style(Style::default().bg(COLOR_BG));
        frame.render_widget(status, area);
    }
}

const GALLERY_ITEM_HEIGHT: usize = 3;

/// Render one timeline message. The same lines feed both drawing and the
/// layout heights, so the scroll math always matches what is on screen.
fn message_lines(message: &api::Message, width: usize, selected: bool) -> Vec<Line<'static>> {
    let width = width.max(8);
    let mut lines = Vec::new();
    let sent = message.direction == api::Direction::Sent;
    let indent = if sent { width / 4 } else { 0 };
    let wrap_width = width.saturating_sub(indent + 2).max(4);
    let prefix = " ".repeat(indent);

    let marker_style = if selected {
        Style::default()
            .fg(COLOR_ACCENT)
            .add_modifier(Modifier::BOLD)
    } else if sent {
        Style::default().fg(COLOR_SENT)
    } else {
        Style::default().fg(COLOR_TEXT_SECONDARY)
    };
    let body_style = if selected {
        Style::default()
            .fg(COLOR_TEXT_PRIMARY)
            .bg(COLOR_SELECTED_BG)
    } else {
        Style::default().fg(COLOR_TEXT_PRIMARY)
    };

    if !sent {
        if let Some(contact) = message.contact.as_deref() {
            if !contact.trim().is_empty() {
                lines.push(Line::from(Span::styled(
                    contact.trim().to_string(),
                    Style::default()
                        .fg(COLOR_INBOX_LABEL)
                        .add_modifier(Modifier::BOLD),
                )));
            }
        }
    }

    if message.text.trim().is_empty() {
        lines.push(Line::from(vec![
            Span::raw(prefix.clone()),
            Span::styled("▎ ".to_string(), marker_style),
            Span::styled("(no text)".to_string(), Style::default().fg(COLOR_TEXT_SECONDARY)),
        ]));
    } else {
        for wrapped in wrap(message.text.trim(), wrap_width) {
            lines.push(Line::from(vec![
                Span::raw(prefix.clone()),
                Span::styled("▎ ".to_string(), marker_style),
                Span::styled(wrapped.into_owned(), body_style),
            ]));
        }
    }

    for media in &message.media {
        let kind = match crate::media::media_kind(&media.content_type) {
            crate::media::MediaKind::Image => "image",
            crate::media::MediaKind::Video => "video",
            crate::media::MediaKind::Other => "file",
        };
        lines.push(Line::from(vec![
            Span::raw(prefix.clone()),
            Span::styled(
                format!("▎ [{}] {}", kind, media.filename),
                Style::default().fg(COLOR_ACCENT),
            ),
        ]));
    }

    lines.push(Line::from(vec![
        Span::raw(prefix),
        Span::styled(
            message.date.format("%Y-%m-%d %H:%M").to_string(),
            Style::default().fg(COLOR_TEXT_SECONDARY),
        ),
    ]));
    lines.push(Line::default());

    lines
}

fn message_height(message: &api::Message, width: usize) -> usize {
    message_lines(message, width, false).len()
}

fn gallery_lines(item: &api::ConversationMedia, width: usize, selected: bool) -> Vec<Line<'static>> {
    let kind = match crate::media::media_kind(&item.content_type) {
        crate::media::MediaKind::Image => "image",
        crate::media::MediaKind::Video => "video",
        crate::media::MediaKind::Other => "file",
    };
    let title_style = if selected {
        Style::default()
            .fg(COLOR_ACCENT)
            .bg(COLOR_SELECTED_BG)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(COLOR_TEXT_PRIMARY)
    };
    let sender = item
        .contact_name
        .clone()
        .or_else(|| item.contact_address.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let meta = format!(
        "{} · {} · message {}",
        sender,
        item.date.format("%Y-%m-%d %H:%M"),
        item.message_id
    );

    vec![
        Line::from(Span::styled(
            truncate_with_ellipsis(&format!("[{}] {}", kind, item.filename), width),
            title_style,
        )),
        Line::from(Span::styled(
            truncate_with_ellipsis(&meta, width),
            Style::default().fg(COLOR_TEXT_SECONDARY),
        )),
        Line::default(),
    ]
}

/// Case-insensitive regex filter over conversation names; an invalid
/// pattern degrades to a literal substring match.
fn filter_conversations(conversations: &[api::Conversation], filter: &str) -> Vec<usize> {
    let trimmed = filter.trim();
    if trimmed.is_empty() {
        return (0..conversations.len()).collect();
    }

    let regex = RegexBuilder::new(trimmed)
        .case_insensitive(true)
        .build()
        .ok();
    let needle = trimmed.to_lowercase();

    conversations
        .iter()
        .enumerate()
        .filter(|(_, conversation)| {
            let name = conversation.display_name();
            match &regex {
                Some(regex) => regex.is_match(&name),
                None => name.to_lowercase().contains(&needle),
            }
        })
        .map(|(index, _)| index)
        .collect()
}

fn truncate_with_ellipsis(text: &str, max_width: usize) -> String {
    if max_width == 0 {
        return String::new();
    }
    if text.width() <= max_width {
        return text.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for c in text.chars() {
        let w = UnicodeWidthStr::width(c.to_string().as_str());
        if used + w > max_width.saturating_sub(1) {
            break;
        }
        out.push(c);
        used += w;
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MockConversationService, MockGalleryService, MockMessageService};
    use crate::feed::FeedStatus;

    fn test_options() -> Options {
        Options {
            status_message: "ready".into(),
            conversation_service: Some(Arc::new(MockConversationService)),
            message_service: Some(Arc::new(MockMessageService)),
            gallery_service: Some(Arc::new(MockGalleryService)),
            media_handle: None,
            player: config::PlayerConfig::default(),
            feed: config::FeedConfig::default(),
            config_path: "~/.config/msgvault/config.yaml".into(),
            fetch_conversations_on_start: false,
        }
    }

    fn sample_message(id: i64, text: &str) -> api::Message {
        api::Message {
            id,
            direction: api::Direction::Inbox,
            contact: Some("Ada".into()),
            text: text.to_string(),
            date: chrono::DateTime::from_timestamp(1_680_000_000 + id, 0)
                .unwrap()
                .naive_utc(),
            media: Vec::new(),
        }
    }

    fn sample_page(ids_newest_first: &[i64]) -> api::MessagePage {
        api::MessagePage {
            messages: ids_newest_first
                .iter()
                .map(|&id| sample_message(id, "hello there"))
                .collect(),
            has_more: true,
            has_newer: false,
            total: 100,
        }
    }

    #[test]
    fn truncate_keeps_short_titles() {
        assert_eq!(truncate_with_ellipsis("Family", 10), "Family");
    }

    #[test]
    fn truncate_appends_ellipsis() {
        let out = truncate_with_ellipsis("A very long conversation title", 12);
        assert!(out.ends_with('…'));
        assert!(out.width() <= 12);
    }

    #[test]
    fn filter_matches_case_insensitive_regex() {
        let conversations = vec![
            api::Conversation {
                id: 1,
                name: Some("Family group".into()),
                contacts: vec![],
            },
            api::Conversation {
                id: 2,
                name: Some("Work".into()),
                contacts: vec![],
            },
        ];
        assert_eq!(filter_conversations(&conversations, "fam.*group"), vec![0]);
        assert_eq!(filter_conversations(&conversations, "WORK"), vec![1]);
        assert_eq!(filter_conversations(&conversations, ""), vec![0, 1]);
    }

    #[test]
    fn filter_falls_back_to_substring_on_invalid_regex() {
        let conversations = vec![api::Conversation {
            id: 1,
            name: Some("C++ study (old".into()),
            contacts: vec![],
        }];
        // "(old" is not a valid regex; the literal text still matches.
        assert_eq!(filter_conversations(&conversations, "(old"), vec![0]);
    }

    #[test]
    fn message_lines_account_for_media_and_timestamp() {
        let mut message = sample_message(7, "short");
        message.media.push(api::Media {
            id: 1,
            content_type: "image/png".into(),
            filename: "pic.png".into(),
        });
        let lines = message_lines(&message, 40, false);
        // contact label + text + media + timestamp + separator
        assert_eq!(lines.len(), 5);
        assert_eq!(message_height(&message, 40), 5);
    }

    #[test]
    fn message_lines_wrap_long_text() {
        let message = sample_message(7, &"word ".repeat(50));
        let narrow = message_height(&message, 20);
        let wide = message_height(&message, 120);
        assert!(narrow > wide);
    }

    #[test]
    fn initial_response_applies_feed_and_targets_bottom() {
        let mut model = Model::new(test_options());
        model.active_conversation = Some(1);
        model.feed.begin_initial();
        let kind = MessageLoadKind::Initial { anchor: None };
        model.pending_messages = Some(PendingMessages {
            request_id: 9,
            conversation_id: 1,
            kind,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        });

        model.handle_async_response(AsyncResponse::Messages {
            request_id: 9,
            conversation_id: 1,
            kind,
            result: Ok(sample_page(&[30, 29, 28])),
        });

        assert_eq!(model.feed.len(), 3);
        assert_eq!(model.feed.status(), FeedStatus::Idle);
        assert_eq!(model.scroll_target, Some(ScrollTarget::Bottom));
        assert_eq!(model.selected_message, 2);
        assert!(model.pending_messages.is_none());
    }

    #[test]
    fn anchored_initial_response_targets_anchor_message() {
        let mut model = Model::new(test_options());
        model.active_conversation = Some(1);
        model.feed.begin_initial();
        let kind = MessageLoadKind::Initial { anchor: Some(29) };
        model.pending_messages = Some(PendingMessages {
            request_id: 4,
            conversation_id: 1,
            kind,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        });

        model.handle_async_response(AsyncResponse::Messages {
            request_id: 4,
            conversation_id: 1,
            kind,
            result: Ok(sample_page(&[30, 29, 28])),
        });

        assert_eq!(model.scroll_target, Some(ScrollTarget::Message(29)));
        assert_eq!(model.selected_message, 1);
    }

    #[test]
    fn stale_message_response_is_dropped() {
        let mut model = Model::new(test_options());
        model.active_conversation = Some(1);
        model.feed.begin_initial();
        let kind = MessageLoadKind::Initial { anchor: None };
        model.pending_messages = Some(PendingMessages {
            request_id: 12,
            conversation_id: 1,
            kind,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        });

        // A response from an earlier, superseded request id.
        model.handle_async_response(AsyncResponse::Messages {
            request_id: 11,
            conversation_id: 1,
            kind,
            result: Ok(sample_page(&[3, 2, 1])),
        });

        assert!(model.feed.is_empty());
        assert!(model.pending_messages.is_some());
    }

    #[test]
    fn response_for_other_conversation_is_dropped() {
        let mut model = Model::new(test_options());
        model.active_conversation = Some(2);
        model.feed.begin_initial();
        let kind = MessageLoadKind::Initial { anchor: None };
        model.pending_messages = Some(PendingMessages {
            request_id: 5,
            conversation_id: 1,
            kind,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        });

        model.handle_async_response(AsyncResponse::Messages {
            request_id: 5,
            conversation_id: 1,
            kind,
            result: Ok(sample_page(&[3, 2, 1])),
        });

        // Navigated away before the response landed: state untouched.
        assert!(model.feed.is_empty());
    }

    #[test]
    fn older_response_schedules_exact_prepend_compensation() {
        let mut model = Model::new(test_options());
        model.active_conversation = Some(1);
        model.feed.apply_initial(sample_page(&[30, 29, 28]));
        model.selected_message = 0;
        assert!(model.feed.begin_older());
        model.pending_messages = Some(PendingMessages {
            request_id: 2,
            conversation_id: 1,
            kind: MessageLoadKind::Older,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        });

        model.handle_async_response(AsyncResponse::Messages {
            request_id: 2,
            conversation_id: 1,
            kind: MessageLoadKind::Older,
            result: Ok(sample_page(&[27, 26])),
        });

        assert_eq!(model.pending_prepend, Some(2));
        // Selection follows the same message across the prepend.
        assert_eq!(model.selected_message, 2);

        // The draw pass applies the compensation from the new layout.
        model.main_view_width = 40;
        model.feed_scroll = 0;
        model.rebuild_layouts();
        model.resolve_scroll();
        assert_eq!(
            model.feed_scroll,
            model.feed_layout.prepend_delta(2)
        );
    }

    #[test]
    fn failed_load_leaves_feed_untouched_and_reports() {
        let mut model = Model::new(test_options());
        model.active_conversation = Some(1);
        model.feed.apply_initial(sample_page(&[30, 29, 28]));
        assert!(model.feed.begin_older());
        model.pending_messages = Some(PendingMessages {
            request_id: 3,
            conversation_id: 1,
            kind: MessageLoadKind::Older,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        });

        model.handle_async_response(AsyncResponse::Messages {
            request_id: 3,
            conversation_id: 1,
            kind: MessageLoadKind::Older,
            result: Err(anyhow::anyhow!("connection refused")),
        });

        assert_eq!(model.feed.len(), 3);
        assert_eq!(model.feed.status(), FeedStatus::Idle);
        assert!(model.status_message.contains("Failed to load messages"));
    }

    #[test]
    fn gallery_response_appends_without_moving_scroll() {
        let mut model = Model::new(test_options());
        model.active_conversation = Some(1);
        model.main_view_width = 40;

        assert!(model.gallery.begin_load());
        model.pending_gallery = Some(PendingGallery {
            request_id: 1,
            conversation_id: 1,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        });
        let first = MockGalleryService.load_page(1, 0, 30).unwrap();
        model.handle_async_response(AsyncResponse::Gallery {
            request_id: 1,
            conversation_id: 1,
            result: Ok(first),
        });
        model.rebuild_layouts();
        model.gallery_scroll = 12;
        let offset_before = model.gallery_layout.offset_of(10);

        assert!(model.gallery.begin_load());
        model.pending_gallery = Some(PendingGallery {
            request_id: 2,
            conversation_id: 1,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        });
        let second = MockGalleryService.load_page(1, 30, 30).unwrap();
        model.handle_async_response(AsyncResponse::Gallery {
            request_id: 2,
            conversation_id: 1,
            result: Ok(second),
        });
        model.rebuild_layouts();

        assert_eq!(model.gallery.len(), 45);
        assert_eq!(model.gallery_scroll, 12);
        assert_eq!(model.gallery_layout.offset_of(10), offset_before);
    }
}
