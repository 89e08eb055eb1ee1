//! Feed data model and the client interface the bridge consumes.
//!
//! The bridge only ever talks to the remote feed through [`FeedClient`];
//! the concrete AT Protocol transport lives in [`atproto`] and tests use
//! in-memory implementations.

pub mod atproto;

use async_trait::async_trait;

/// Snapshot of a remote actor as supplied by the feed service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActorInfo {
    /// Stable decentralized identifier (e.g. `did:plc:abc...`).
    pub did: String,
    /// Current handle (e.g. `alice.bsky.social`).
    pub handle: String,
    pub display_name: Option<String>,
    /// Profile bio, shown in WHOIS.
    pub description: Option<String>,
}

/// An embedded media or link attachment on a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Embed {
    Image { url: String, alt: String },
    Video { url: String, alt: String },
    External { url: String },
}

/// A post quoted inside another post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotedPost {
    pub author: ActorInfo,
    pub text: String,
    pub embeds: Vec<Embed>,
    /// A quote inside the quoted post. Rendering caps nesting at one
    /// level, so anything deeper collapses to a marker.
    pub nested: Option<Box<QuotedPost>>,
}

/// What kind of timeline entry this is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKind {
    Post,
    /// `author` on the item is the reposting actor; `original` is the
    /// author of the post being reposted.
    Repost { original: ActorInfo },
    /// `parent` is the author of the post being replied to, when the
    /// feed could resolve it (deleted parents come back as `None`).
    Reply { parent: Option<ActorInfo> },
    Quote { quoted: Option<Box<QuotedPost>> },
}

/// One unit of timeline content. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    /// Unique, stable id (the post CID).
    pub id: String,
    pub author: ActorInfo,
    pub kind: ItemKind,
    pub text: String,
    /// Facet links extracted from rich text; rendered verbatim.
    pub links: Vec<String>,
    pub embeds: Vec<Embed>,
    /// ISO-8601 creation timestamp, passed through to the `time` tag.
    pub created_at: String,
}

impl FeedItem {
    /// A plain text post — the common case, handy in tests.
    pub fn post(id: &str, author: ActorInfo, text: &str) -> Self {
        Self {
            id: id.to_owned(),
            author,
            kind: ItemKind::Post,
            text: text.to_owned(),
            links: Vec::new(),
            embeds: Vec::new(),
            created_at: String::new(),
        }
    }
}

/// One page of timeline results.
///
/// `items` are ordered oldest-first so they can be broadcast in the
/// order a channel reader expects. `cursor` is an opaque progress
/// token; `None` means the service does not page this feed and the
/// caller should rely on item-id deduplication alone.
#[derive(Debug, Clone, Default)]
pub struct TimelinePage {
    pub items: Vec<FeedItem>,
    pub cursor: Option<String>,
}

/// Errors from the remote feed service.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("unexpected payload: {0}")]
    BadPayload(String),
    #[error("feed unavailable: {0}")]
    Unavailable(String),
}

/// The remote feed service, as consumed by the synchronizer and the
/// identity mapper's fallback path.
#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Fetch timeline items newer than the given cursor position.
    async fn fetch_timeline(&self, cursor: Option<&str>) -> Result<TimelinePage, FetchError>;

    /// Resolve a single actor's profile by did.
    async fn resolve_actor(&self, did: &str) -> Result<ActorInfo, FetchError>;
}
