use std::time::{Duration, Instant};

use crate::api::{ConversationMedia, MediaPage, Message, MessageCursor, MessagePage};

/// Forward padding added to an anchored load so the target message is not
/// the very first row of the fetched page.
pub const ANCHOR_PADDING: i64 = 5;

/// Cursor for an initial load anchored at a specific message.
pub fn anchor_cursor(anchor_id: i64) -> MessageCursor {
    MessageCursor::Before(anchor_id + ANCHOR_PADDING)
}

/// One status field instead of independent booleans: a feed is in at most
/// one load at a time, and the compiler now knows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedStatus {
    #[default]
    Idle,
    LoadingInitial,
    LoadingOlder,
    LoadingNewer,
    Searching,
}

impl FeedStatus {
    pub fn is_loading(self) -> bool {
        self != FeedStatus::Idle
    }
}

/// In-memory message timeline for one conversation.
///
/// Invariant: `messages` is sorted ascending by id whenever the feed holds
/// paginated history. Pages arrive from the server newest-first and are
/// reversed on apply; prepend and append keep the order. An out-of-order
/// page is a contract violation of the archive server, not something the
/// feed defends against.
#[derive(Debug, Default)]
pub struct MessageFeed {
    messages: Vec<Message>,
    status: FeedStatus,
    has_more: bool,
    has_newer: bool,
    total: u64,
    search_results: bool,
}

impl MessageFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn status(&self) -> FeedStatus {
        self.status
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn has_newer(&self) -> bool {
        self.has_newer
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// True while the feed holds a flat search result set instead of
    /// paginated history.
    pub fn is_search_results(&self) -> bool {
        self.search_results
    }

    pub fn oldest_id(&self) -> Option<i64> {
        self.messages.first().map(|m| m.id)
    }

    pub fn newest_id(&self) -> Option<i64> {
        self.messages.last().map(|m| m.id)
    }

    pub fn index_of(&self, id: i64) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Initial loads supersede whatever is in flight; the caller cancels
    /// the superseded request.
    pub fn begin_initial(&mut self) {
        self.status = FeedStatus::LoadingInitial;
    }

    /// Scroll-triggered older load. Refused unless the feed is idle with
    /// older history remaining.
    pub fn begin_older(&mut self) -> bool {
        if self.status.is_loading() || !self.has_more || self.search_results {
            return false;
        }
        self.status = FeedStatus::LoadingOlder;
        true
    }

    /// Scroll-triggered newer load, same guard as [`begin_older`].
    pub fn begin_newer(&mut self) -> bool {
        if self.status.is_loading() || !self.has_newer || self.search_results {
            return false;
        }
        self.status = FeedStatus::LoadingNewer;
        true
    }

    pub fn begin_search(&mut self) {
        self.status = FeedStatus::Searching;
    }

    pub fn apply_initial(&mut self, page: MessagePage) {
        let mut messages = page.messages;
        messages.reverse();
        self.messages = messages;
        self.has_more = page.has_more;
        self.has_newer = page.has_newer;
        self.total = page.total;
        self.search_results = false;
        self.status = FeedStatus::Idle;
        debug_assert!(self.is_sorted_ascending());
    }

    /// Prepend a strictly-older page. Returns how many messages were
    /// inserted so the caller can compensate its scroll offset.
    pub fn apply_older(&mut self, page: MessagePage) -> usize {
        let mut older = page.messages;
        older.reverse();
        let inserted = older.len();
        older.append(&mut self.messages);
        self.messages = older;
        self.has_more = page.has_more;
        self.status = FeedStatus::Idle;
        debug_assert!(self.is_sorted_ascending());
        inserted
    }

    /// Append a strictly-newer page. Returns how many messages were added.
    pub fn apply_newer(&mut self, page: MessagePage) -> usize {
        let mut newer = page.messages;
        newer.reverse();
        let appended = newer.len();
        self.messages.extend(newer);
        self.has_newer = page.has_newer;
        self.status = FeedStatus::Idle;
        debug_assert!(self.is_sorted_ascending());
        appended
    }

    /// Replace the feed with a flat search result set. Search results are
    /// not paginated, so both continuation flags go dark.
    pub fn apply_search(&mut self, mut results: Vec<Message>) {
        results.reverse();
        self.messages = results;
        self.has_more = false;
        self.has_newer = false;
        self.search_results = true;
        self.status = FeedStatus::Idle;
    }

    /// A failed load clears the status and nothing else.
    pub fn fail(&mut self) {
        self.status = FeedStatus::Idle;
    }

    fn is_sorted_ascending(&self) -> bool {
        self.messages.windows(2).all(|pair| pair[0].id < pair[1].id)
    }
}

/// Line-based layout of a rendered feed: per-item heights plus prefix
/// offsets. The scroll anchor maps item indices to line offsets, and the
/// prepend compensation reads the exact height introduced above the
/// previously-topmost item.
#[derive(Debug, Clone, Default)]
pub struct FeedLayout {
    offsets: Vec<usize>,
    total: usize,
}

impl FeedLayout {
    pub fn from_heights(heights: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(heights.len());
        let mut total = 0;
        for height in heights {
            offsets.push(total);
            total += (*height).max(1);
        }
        Self { offsets, total }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Line offset of the top of item `index`.
    pub fn offset_of(&self, index: usize) -> usize {
        match self.offsets.get(index) {
            Some(offset) => *offset,
            None => self.total,
        }
    }

    pub fn total_height(&self) -> usize {
        self.total
    }

    /// Height introduced by the first `count` items; the exact scroll
    /// delta after a prepend of `count` items.
    pub fn prepend_delta(&self, count: usize) -> usize {
        self.offset_of(count)
    }

    /// Index of the item covering `line`, if any.
    pub fn index_at(&self, line: usize) -> Option<usize> {
        if line >= self.total {
            return None;
        }
        match self.offsets.binary_search(&line) {
            Ok(index) => Some(index),
            Err(insert) => Some(insert - 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GalleryStatus {
    #[default]
    Idle,
    Loading,
}

/// Offset-paginated media gallery feed: unidirectional, append-only.
#[derive(Debug, Default)]
pub struct GalleryFeed {
    items: Vec<ConversationMedia>,
    offset: u64,
    has_more: bool,
    total: u64,
    status: GalleryStatus,
}

impl GalleryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[ConversationMedia] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn status(&self) -> GalleryStatus {
        self.status
    }

    pub fn is_loading(&self) -> bool {
        self.status == GalleryStatus::Loading
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Start a page load. The first page is always allowed; later pages
    /// only while idle with more data remaining.
    pub fn begin_load(&mut self) -> bool {
        if self.status == GalleryStatus::Loading {
            return false;
        }
        if self.offset > 0 && !self.has_more {
            return false;
        }
        self.status = GalleryStatus::Loading;
        true
    }

    /// Apply a fetched page: replace on the first page, append afterwards.
    /// Items are kept date-descending. Returns how many items arrived.
    pub fn apply(&mut self, page: MediaPage) -> usize {
        let mut incoming = page.media;
        incoming.sort_by(|a, b| b.date.cmp(&a.date));
        let count = incoming.len();
        if self.offset == 0 {
            self.items = incoming;
        } else {
            self.items.extend(incoming);
        }
        self.offset += count as u64;
        self.has_more = page.has_more;
        self.total = page.total;
        self.status = GalleryStatus::Idle;
        count
    }

    pub fn fail(&mut self) {
        self.status = GalleryStatus::Idle;
    }
}

/// Explicit cancellable delay: each trigger supersedes the previous
/// deadline, and `fire` reports readiness exactly once.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn schedule(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Suppression window after a programmatic scroll, so the adjustment
/// itself cannot re-trigger edge pagination.
#[derive(Debug)]
pub struct SettleWindow {
    duration: Duration,
    until: Option<Instant>,
}

impl SettleWindow {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            until: None,
        }
    }

    pub fn arm(&mut self, now: Instant) {
        self.until = Some(now + self.duration);
    }

    pub fn active(&self, now: Instant) -> bool {
        matches!(self.until, Some(until) if now < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Direction;

    fn msg(id: i64) -> Message {
        Message {
            id,
            direction: if id % 2 == 0 {
                Direction::Sent
            } else {
                Direction::Inbox
            },
            contact: None,
            text: format!("message {id}"),
            date: chrono::DateTime::from_timestamp(1_680_000_000 + id * 60, 0)
                .unwrap()
                .naive_utc(),
            media: Vec::new(),
        }
    }

    fn page(ids_newest_first: &[i64], has_more: bool, has_newer: bool) -> MessagePage {
        MessagePage {
            messages: ids_newest_first.iter().copied().map(msg).collect(),
            has_more,
            has_newer,
            total: 200,
        }
    }

    fn media_item(id: i64, ts: i64) -> ConversationMedia {
        ConversationMedia {
            id,
            content_type: "image/jpeg".into(),
            filename: format!("media-{id}.jpg"),
            message_id: id * 3,
            date: chrono::DateTime::from_timestamp(ts, 0).unwrap().naive_utc(),
            contact_id: None,
            contact_name: None,
            contact_address: None,
        }
    }

    #[test]
    fn initial_page_is_reversed_to_ascending() {
        let mut feed = MessageFeed::new();
        feed.begin_initial();
        feed.apply_initial(page(&[100, 99, 98], true, false));
        let ids: Vec<i64> = feed.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![98, 99, 100]);
        assert!(feed.has_more());
        assert!(!feed.has_newer());
        assert_eq!(feed.status(), FeedStatus::Idle);
    }

    #[test]
    fn older_pages_keep_feed_sorted_across_repeated_loads() {
        let mut feed = MessageFeed::new();
        feed.apply_initial(page(&[100, 99, 98], true, false));
        for window in [[97i64, 96, 95], [94, 93, 92], [91, 90, 89]] {
            assert!(feed.begin_older());
            feed.apply_older(page(&window, window[2] > 89, false));
            let ids: Vec<i64> = feed.messages().iter().map(|m| m.id).collect();
            let mut sorted = ids.clone();
            sorted.sort_unstable();
            assert_eq!(ids, sorted);
        }
        assert_eq!(feed.oldest_id(), Some(89));
        assert!(!feed.has_more());
    }

    #[test]
    fn older_load_refused_while_loading_or_exhausted() {
        let mut feed = MessageFeed::new();
        feed.apply_initial(page(&[10, 9, 8], true, false));
        assert!(feed.begin_older());
        // Second trigger while the first is still in flight: no-op.
        assert!(!feed.begin_older());
        feed.apply_older(page(&[7, 6], false, false));
        // Exhausted history: refused.
        assert!(!feed.begin_older());
    }

    #[test]
    fn newer_load_guard_and_append() {
        let mut feed = MessageFeed::new();
        feed.apply_initial(page(&[50, 49, 48], true, true));
        assert!(feed.begin_newer());
        assert!(!feed.begin_newer());
        let appended = feed.apply_newer(page(&[52, 51], false, false));
        assert_eq!(appended, 2);
        assert_eq!(feed.newest_id(), Some(52));
        assert!(!feed.has_newer());
        // The older-direction flag is untouched by a newer load.
        assert!(feed.has_more());
    }

    #[test]
    fn failed_load_only_clears_status() {
        let mut feed = MessageFeed::new();
        feed.apply_initial(page(&[10, 9, 8], true, true));
        assert!(feed.begin_older());
        feed.fail();
        assert_eq!(feed.status(), FeedStatus::Idle);
        assert_eq!(feed.len(), 3);
        assert!(feed.has_more());
        assert!(feed.has_newer());
    }

    #[test]
    fn search_then_clear_round_trip_restores_feed() {
        let initial = page(&[100, 99, 98], true, false);
        let mut feed = MessageFeed::new();
        feed.apply_initial(initial.clone());
        let before: Vec<i64> = feed.messages().iter().map(|m| m.id).collect();

        feed.begin_search();
        feed.apply_search(vec![msg(40), msg(10)]);
        assert!(feed.is_search_results());
        assert!(!feed.has_more());
        assert!(!feed.has_newer());
        // Scroll pagination is disabled on a result set.
        assert!(!feed.begin_older());
        assert!(!feed.begin_newer());

        // Clearing the query re-runs the initial load against the head.
        feed.begin_initial();
        feed.apply_initial(initial);
        let after: Vec<i64> = feed.messages().iter().map(|m| m.id).collect();
        assert_eq!(before, after);
        assert!(feed.has_more());
        assert!(!feed.has_newer());
        assert!(!feed.is_search_results());
    }

    #[test]
    fn anchor_cursor_adds_padding() {
        assert_eq!(anchor_cursor(1042), MessageCursor::Before(1047));
    }

    #[test]
    fn layout_prepend_compensation_is_exact() {
        // Viewport top sits on the item with 4 lines.
        let old = FeedLayout::from_heights(&[2, 3, 4, 1]);
        let top_index = 2;
        let scroll_top = old.offset_of(top_index);
        assert_eq!(scroll_top, 5);

        // Two items of heights 1 and 6 are prepended.
        let new = FeedLayout::from_heights(&[1, 6, 2, 3, 4, 1]);
        let compensated = scroll_top + new.prepend_delta(2);
        assert_eq!(compensated, new.offset_of(top_index + 2));
    }

    #[test]
    fn layout_index_at_maps_lines_to_items() {
        let layout = FeedLayout::from_heights(&[2, 3, 4]);
        assert_eq!(layout.index_at(0), Some(0));
        assert_eq!(layout.index_at(1), Some(0));
        assert_eq!(layout.index_at(2), Some(1));
        assert_eq!(layout.index_at(4), Some(1));
        assert_eq!(layout.index_at(5), Some(2));
        assert_eq!(layout.index_at(8), Some(2));
        assert_eq!(layout.index_at(9), None);
    }

    #[test]
    fn layout_treats_zero_height_items_as_one_line() {
        let layout = FeedLayout::from_heights(&[0, 2]);
        assert_eq!(layout.offset_of(1), 1);
        assert_eq!(layout.total_height(), 3);
    }

    #[test]
    fn gallery_appends_and_tracks_offset() {
        let mut gallery = GalleryFeed::new();
        assert!(gallery.begin_load());
        let first: Vec<ConversationMedia> =
            (0..30).map(|n| media_item(100 - n, 2_000_000 - n)).collect();
        gallery.apply(MediaPage {
            media: first,
            has_more: true,
            total: 45,
        });
        assert_eq!(gallery.len(), 30);
        assert_eq!(gallery.offset(), 30);

        assert!(gallery.begin_load());
        assert!(!gallery.is_empty());
        let second: Vec<ConversationMedia> =
            (30..45).map(|n| media_item(100 - n, 2_000_000 - n)).collect();
        gallery.apply(MediaPage {
            media: second,
            has_more: false,
            total: 45,
        });
        assert_eq!(gallery.len(), 45);
        assert_eq!(gallery.offset(), 45);
        assert!(!gallery.has_more());
        // Exhausted: further loads refused.
        assert!(!gallery.begin_load());
    }

    #[test]
    fn gallery_sorts_each_page_date_descending() {
        let mut gallery = GalleryFeed::new();
        gallery.begin_load();
        gallery.apply(MediaPage {
            media: vec![media_item(1, 100), media_item(2, 300), media_item(3, 200)],
            has_more: false,
            total: 3,
        });
        let ids: Vec<i64> = gallery.items().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn gallery_load_guard_while_in_flight() {
        let mut gallery = GalleryFeed::new();
        assert!(gallery.begin_load());
        assert!(!gallery.begin_load());
        gallery.fail();
        assert!(gallery.begin_load());
    }

    #[test]
    fn debouncer_supersedes_and_fires_once() {
        let start = Instant::now();
        let mut debounce = Debouncer::new(Duration::from_millis(500));
        debounce.schedule(start);
        // A keystroke 300ms in pushes the deadline out.
        debounce.schedule(start + Duration::from_millis(300));
        assert!(!debounce.fire(start + Duration::from_millis(600)));
        assert!(debounce.fire(start + Duration::from_millis(800)));
        // Fired once; stays quiet until rescheduled.
        assert!(!debounce.fire(start + Duration::from_millis(900)));
    }

    #[test]
    fn debouncer_cancel_is_a_cancellation_point() {
        let start = Instant::now();
        let mut debounce = Debouncer::new(Duration::from_millis(500));
        debounce.schedule(start);
        debounce.cancel();
        assert!(!debounce.is_pending());
        assert!(!debounce.fire(start + Duration::from_secs(5)));
    }

    #[test]
    fn settle_window_expires() {
        let start = Instant::now();
        let mut settle = SettleWindow::new(Duration::from_millis(500));
        assert!(!settle.active(start));
        settle.arm(start);
        assert!(settle.active(start + Duration::from_millis(499)));
        assert!(!settle.active(start + Duration::from_millis(500)));
    }
}
