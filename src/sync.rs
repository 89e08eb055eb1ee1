//! Timeline synchronization loop.
//!
//! The synchronizer polls the feed on a fixed cadence, renders anything
//! it has not delivered before, and fans the lines out to every joined
//! session. It is the only writer of the replay ring.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tracing::{debug, warn};

use crate::feed::{FeedClient, FeedItem, FetchError};
use crate::irc::message::Message;
use crate::irc::server::{broadcast, SharedState, CHANNEL};
use crate::render::{render, RenderedItem};

/// How often the timeline is polled.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// How many delivered item ids are remembered for deduplication.
/// Old ids age out; the feed head moves far faster than this window.
const EMITTED_CAP: usize = 4096;

/// Polls the feed and pushes new items into the channel.
pub struct Synchronizer<C> {
    client: C,
    state: SharedState,
    interval: Duration,
    /// Last cursor the feed acknowledged. Never advanced on a failed
    /// fetch, so a flaky service cannot skip items.
    cursor: Option<String>,
    emitted: HashSet<String>,
    emitted_order: VecDeque<String>,
}

impl<C: FeedClient> Synchronizer<C> {
    pub fn new(client: C, state: SharedState) -> Self {
        Self {
            client,
            state,
            interval: SYNC_INTERVAL,
            cursor: None,
            emitted: HashSet::new(),
            emitted_order: VecDeque::new(),
        }
    }

    #[cfg(test)]
    fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll forever. Fetch failures are logged and retried next cycle.
    pub async fn run(mut self) {
        loop {
            if let Err(e) = self.run_cycle().await {
                warn!("sync cycle failed: {e}");
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One fetch-render-broadcast pass.
    pub async fn run_cycle(&mut self) -> Result<(), FetchError> {
        let page = self.client.fetch_timeline(self.cursor.as_deref()).await?;
        debug!(items = page.items.len(), "fetched timeline page");

        for item in &page.items {
            if self.emitted.contains(&item.id) {
                continue;
            }
            let item = self.hydrate_author(item).await;
            self.emit(&item).await;
            if !item.id.is_empty() {
                self.mark_emitted(item.id.clone());
            }
        }

        // Commit only after the whole page was processed, so a
        // mid-page failure replays the page instead of skipping it.
        if page.cursor.is_some() {
            self.cursor = page.cursor;
        }
        Ok(())
    }

    /// Fill in a missing author profile. Some feed views arrive with a
    /// bare did; a failed profile lookup falls back to a placeholder
    /// nick so the item still renders.
    async fn hydrate_author(&self, item: &FeedItem) -> FeedItem {
        if !item.author.handle.is_empty() || item.author.did.is_empty() {
            return item.clone();
        }
        let mut item = item.clone();
        match self.client.resolve_actor(&item.author.did).await {
            Ok(info) => item.author = info,
            Err(e) => {
                warn!(did = %item.author.did, "profile lookup failed, using placeholder: {e}");
                let mut st = self.state.write().await;
                st.mapper.placeholder(&item.author.did);
                if let Some(actor) = st.mapper.get(&item.author.did) {
                    item.author = actor.info.clone();
                }
            }
        }
        item
    }

    /// Render one item and broadcast its lines, newest state of the
    /// identity mapper included. Unrenderable items are logged and
    /// skipped; [`run_cycle`] still marks them emitted so a single bad
    /// item cannot wedge the loop.
    async fn emit(&self, item: &FeedItem) {
        let mut st = self.state.write().await;

        let rendered = match render(item, &mut st.mapper) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(id = %item.id, "skipping unrenderable item: {e}");
                return;
            }
        };

        let msgs = channel_messages(&rendered, &item.created_at);
        for msg in &msgs {
            broadcast(&mut st, None, msg);
        }
        st.push_history(msgs);
    }

    fn mark_emitted(&mut self, id: String) {
        if self.emitted.insert(id.clone()) {
            self.emitted_order.push_back(id);
        }
        while self.emitted_order.len() > EMITTED_CAP {
            if let Some(old) = self.emitted_order.pop_front() {
                self.emitted.remove(&old);
            }
        }
    }
}

/// Wrap rendered lines as channel PRIVMSGs from the synthetic member.
///
/// The hostmask carries the actor's real handle so clients show where
/// the message came from. The original timestamp travels in an IRCv3
/// `time` tag; sessions that did not negotiate `message-tags` have the
/// tag stripped on send.
fn channel_messages(rendered: &RenderedItem, created_at: &str) -> Vec<Message> {
    rendered
        .lines
        .iter()
        .map(|line| {
            let msg = Message::new(
                Some(format!("{}!@{}", rendered.nick, rendered.handle)),
                "PRIVMSG",
                vec![CHANNEL.into(), line.clone()],
            );
            if created_at.is_empty() {
                msg
            } else {
                msg.tagged("time", created_at)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::{mpsc, RwLock};

    use crate::feed::{ActorInfo, TimelinePage};
    use crate::irc::server::{ClientHandle, ServerState};

    /// Feed client fed from a script of pages, recording the cursors it
    /// was asked for.
    struct ScriptedFeed {
        pages: Mutex<VecDeque<Result<TimelinePage, FetchError>>>,
        cursors_seen: Arc<Mutex<Vec<Option<String>>>>,
        profile: Option<ActorInfo>,
    }

    impl ScriptedFeed {
        fn new(pages: Vec<Result<TimelinePage, FetchError>>) -> (Self, Arc<Mutex<Vec<Option<String>>>>) {
            let cursors = Arc::new(Mutex::new(Vec::new()));
            let feed = Self {
                pages: Mutex::new(pages.into()),
                cursors_seen: Arc::clone(&cursors),
                profile: None,
            };
            (feed, cursors)
        }

        fn with_profile(mut self, profile: ActorInfo) -> Self {
            self.profile = Some(profile);
            self
        }
    }

    #[async_trait]
    impl FeedClient for ScriptedFeed {
        async fn fetch_timeline(
            &self,
            cursor: Option<&str>,
        ) -> Result<TimelinePage, FetchError> {
            self.cursors_seen
                .lock()
                .unwrap()
                .push(cursor.map(str::to_owned));
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(TimelinePage::default()))
        }

        async fn resolve_actor(&self, did: &str) -> Result<ActorInfo, FetchError> {
            self.profile
                .clone()
                .ok_or_else(|| FetchError::Unavailable(did.to_owned()))
        }
    }

    fn actor(did: &str, handle: &str) -> ActorInfo {
        ActorInfo {
            did: did.to_owned(),
            handle: handle.to_owned(),
            display_name: None,
            description: None,
        }
    }

    fn shared_state_with_client(nick: &str) -> (SharedState, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        let mut st = ServerState::new();
        st.clients.insert(
            nick.into(),
            ClientHandle {
                nick: nick.into(),
                user: None,
                realname: None,
                addr: ([127, 0, 0, 1], 0u16).into(),
                joined: true,
                tx,
            },
        );
        (Arc::new(RwLock::new(st)), rx)
    }

    fn page(items: Vec<FeedItem>, cursor: Option<&str>) -> Result<TimelinePage, FetchError> {
        Ok(TimelinePage {
            items,
            cursor: cursor.map(str::to_owned),
        })
    }

    #[tokio::test]
    async fn cycle_broadcasts_new_items() {
        let item = FeedItem::post("cid1", actor("did:a", "alice.example"), "hello world");
        let (feed, _) = ScriptedFeed::new(vec![page(vec![item], None)]);
        let (state, mut rx) = shared_state_with_client("wings");

        let mut sync = Synchronizer::new(feed, Arc::clone(&state));
        sync.run_cycle().await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec![CHANNEL.to_owned(), "hello world".to_owned()]);
        assert_eq!(msg.prefix.as_deref(), Some("alice_example!@alice.example"));

        // The item also landed in the replay ring.
        let st = state.read().await;
        assert_eq!(st.history().count(), 1);
    }

    #[tokio::test]
    async fn items_are_delivered_once() {
        let item = FeedItem::post("cid1", actor("did:a", "alice.example"), "hello");
        let (feed, _) = ScriptedFeed::new(vec![
            page(vec![item.clone()], None),
            page(vec![item], None),
        ]);
        let (state, mut rx) = shared_state_with_client("wings");

        let mut sync = Synchronizer::new(feed, state);
        sync.run_cycle().await.unwrap();
        sync.run_cycle().await.unwrap();

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cursor_advances_only_on_success() {
        let item = FeedItem::post("cid1", actor("did:a", "alice.example"), "hello");
        let (feed, cursors) = ScriptedFeed::new(vec![
            page(vec![item], Some("page-1")),
            Err(FetchError::Unavailable("down".into())),
            page(vec![], Some("page-2")),
        ]);
        let (state, _rx) = shared_state_with_client("wings");

        let mut sync = Synchronizer::new(feed, state);
        sync.run_cycle().await.unwrap();
        assert!(sync.run_cycle().await.is_err());
        sync.run_cycle().await.unwrap();

        let seen = cursors.lock().unwrap();
        // The failed fetch did not move the cursor; the retry reuses it.
        assert_eq!(
            *seen,
            vec![None, Some("page-1".to_owned()), Some("page-1".to_owned())]
        );
        assert_eq!(sync.cursor.as_deref(), Some("page-2"));
    }

    #[tokio::test]
    async fn bare_did_author_is_resolved() {
        let item = FeedItem::post("cid1", actor("did:plc:a", ""), "hello");
        let (feed, _) = ScriptedFeed::new(vec![page(vec![item], None)]);
        let feed = feed.with_profile(actor("did:plc:a", "alice.example"));
        let (state, mut rx) = shared_state_with_client("wings");

        let mut sync = Synchronizer::new(feed, state);
        sync.run_cycle().await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("alice_example!@alice.example"));
    }

    #[tokio::test]
    async fn failed_profile_lookup_uses_placeholder() {
        let item = FeedItem::post("cid1", actor("did:plc:xyz789", ""), "hello");
        let (feed, _) = ScriptedFeed::new(vec![page(vec![item], None)]);
        let (state, mut rx) = shared_state_with_client("wings");

        let mut sync = Synchronizer::new(feed, Arc::clone(&state));
        sync.run_cycle().await.unwrap();

        // Attribution falls back to a nick derived from the did tail.
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("xyz789!@did:plc:xyz789"));
        assert!(state.read().await.mapper.lookup_by_nick("xyz789").is_some());
    }

    #[tokio::test]
    async fn poison_item_does_not_wedge_the_cycle() {
        let poison = FeedItem::post("cid-bad", actor("", ""), "unrenderable");
        let good = FeedItem::post("cid-good", actor("did:b", "bob.example"), "fine");
        let (feed, _) = ScriptedFeed::new(vec![
            page(vec![poison.clone(), good], None),
            page(vec![poison], None),
        ]);
        let (state, mut rx) = shared_state_with_client("wings");

        let mut sync = Synchronizer::new(feed, state);
        sync.run_cycle().await.unwrap();

        // Only the good item came through.
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.params[1], "fine");
        assert!(rx.try_recv().is_err());

        // The poison item is remembered and skipped next cycle.
        assert!(sync.emitted.contains("cid-bad"));
        sync.run_cycle().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn emitted_set_is_bounded() {
        let (feed, _) = ScriptedFeed::new(vec![]);
        let (state, _rx) = shared_state_with_client("wings");
        let mut sync = Synchronizer::new(feed, state).with_interval(Duration::from_millis(1));

        for i in 0..(EMITTED_CAP + 100) {
            sync.mark_emitted(format!("cid{i}"));
        }
        assert_eq!(sync.emitted.len(), EMITTED_CAP);
        assert!(!sync.emitted.contains("cid0"));
        assert!(sync.emitted.contains(&format!("cid{}", EMITTED_CAP + 99)));
    }

    #[tokio::test]
    async fn timestamp_travels_as_time_tag() {
        let mut item = FeedItem::post("cid1", actor("did:a", "alice.example"), "hello");
        item.created_at = "2024-01-15T10:00:00.000Z".into();
        let (feed, _) = ScriptedFeed::new(vec![page(vec![item], None)]);
        let (state, mut rx) = shared_state_with_client("wings");

        let mut sync = Synchronizer::new(feed, state);
        sync.run_cycle().await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(
            msg.tags,
            vec![("time".to_owned(), "2024-01-15T10:00:00.000Z".to_owned())]
        );
    }
}
