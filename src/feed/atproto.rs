//! AT Protocol (Bluesky) feed client.
//!
//! Speaks XRPC over HTTPS: `createSession` for app-password login, then
//! authenticated `getTimeline` and `getProfile` calls. Timeline feed
//! views are deeply polymorphic, so they are mapped out of
//! `serde_json::Value` rather than a rigid DTO tree; unknown embed and
//! reason types degrade to plain posts instead of failing the page.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{ActorInfo, Embed, FeedClient, FeedItem, FetchError, ItemKind, QuotedPost, TimelinePage};

const DEFAULT_SERVICE: &str = "https://bsky.social";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    access_jwt: String,
    did: String,
    handle: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileView {
    did: String,
    handle: String,
    display_name: Option<String>,
    description: Option<String>,
}

/// Authenticated Bluesky client.
pub struct AtClient {
    http: reqwest::Client,
    service: String,
    access_jwt: String,
    /// The logged-in account, for logging and the WHOIS of the bridge
    /// operator's own posts.
    pub session: ActorInfo,
}

impl AtClient {
    /// Create a session against the default service.
    pub async fn login(handle: &str, app_password: &str) -> Result<Self, FetchError> {
        Self::login_at(DEFAULT_SERVICE, handle, app_password).await
    }

    /// Create a session against a specific PDS endpoint.
    pub async fn login_at(
        service: &str,
        handle: &str,
        app_password: &str,
    ) -> Result<Self, FetchError> {
        let http = reqwest::Client::new();
        let resp = http
            .post(format!("{service}/xrpc/com.atproto.server.createSession"))
            .json(&serde_json::json!({
                "identifier": handle,
                "password": app_password,
            }))
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(FetchError::Unauthorized(format!(
                "login rejected for {handle}"
            )));
        }
        let resp = resp.error_for_status()?;
        let session: Session = resp.json().await?;
        debug!(did = %session.did, "logged in");

        Ok(Self {
            http,
            service: service.to_owned(),
            access_jwt: session.access_jwt,
            session: ActorInfo {
                did: session.did,
                handle: session.handle,
                display_name: None,
                description: None,
            },
        })
    }

    async fn get(&self, method: &str, query: &[(&str, &str)]) -> Result<Value, FetchError> {
        let resp = self
            .http
            .get(format!("{}/xrpc/{method}", self.service))
            .bearer_auth(&self.access_jwt)
            .query(query)
            .send()
            .await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => {
                Err(FetchError::Unauthorized("session expired".into()))
            }
            status if status.is_server_error() => {
                Err(FetchError::Unavailable(format!("{method}: {status}")))
            }
            _ => Ok(resp.error_for_status()?.json().await?),
        }
    }
}

#[async_trait]
impl FeedClient for AtClient {
    async fn fetch_timeline(&self, cursor: Option<&str>) -> Result<TimelinePage, FetchError> {
        let mut query = vec![("algorithm", "reverse-chronological")];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        let body = self.get("app.bsky.feed.getTimeline", &query).await?;

        let feed = body
            .get("feed")
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::BadPayload("timeline without feed array".into()))?;

        // The service returns newest-first; the channel wants oldest-first.
        let mut items: Vec<FeedItem> = feed.iter().filter_map(map_feed_view).collect();
        items.reverse();

        // getTimeline cursors page backward through history. Head
        // polling relies on item-id deduplication instead.
        Ok(TimelinePage {
            items,
            cursor: None,
        })
    }

    async fn resolve_actor(&self, did: &str) -> Result<ActorInfo, FetchError> {
        let body = self
            .get("app.bsky.actor.getProfile", &[("actor", did)])
            .await?;
        let profile: ProfileView = serde_json::from_value(body)
            .map_err(|e| FetchError::BadPayload(format!("profile: {e}")))?;
        Ok(ActorInfo {
            did: profile.did,
            handle: profile.handle,
            display_name: profile.display_name.filter(|name| !name.is_empty()),
            description: profile.description,
        })
    }
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn actor_info(v: &Value) -> Option<ActorInfo> {
    Some(ActorInfo {
        did: str_field(v, "did")?,
        handle: str_field(v, "handle")?,
        display_name: str_field(v, "displayName").filter(|name| !name.is_empty()),
        description: str_field(v, "description"),
    })
}

/// Map one timeline feed view into a [`FeedItem`].
///
/// Returns `None` only when the view is missing its post entirely;
/// partial views (no cid, no author) still map so the renderer can
/// report them.
fn map_feed_view(fv: &Value) -> Option<FeedItem> {
    let post = fv.get("post")?;
    let record = post.get("record").cloned().unwrap_or(Value::Null);
    let post_author = actor_info(post.get("author").unwrap_or(&Value::Null))
        .unwrap_or_default();

    // Kind precedence: repost > reply > quote > post.
    let (author, kind) = if let Some(by) = repost_reason(fv) {
        (by, ItemKind::Repost { original: post_author })
    } else if is_reply(fv, &record) {
        (post_author, ItemKind::Reply { parent: reply_parent(fv) })
    } else if let Some(quoted) = quote_embed(post.get("embed")) {
        (post_author, ItemKind::Quote { quoted })
    } else {
        (post_author, ItemKind::Post)
    };

    Some(FeedItem {
        id: str_field(post, "cid").unwrap_or_default(),
        author,
        kind,
        text: str_field(&record, "text").unwrap_or_default(),
        links: facet_links(&record),
        embeds: map_embeds(post.get("embed"), str_field(post, "uri").as_deref()),
        created_at: str_field(&record, "createdAt").unwrap_or_default(),
    })
}

/// The reposting actor, if this view carries a repost reason.
fn repost_reason(fv: &Value) -> Option<ActorInfo> {
    let reason = fv.get("reason")?;
    if str_field(reason, "$type")? != "app.bsky.feed.defs#reasonRepost" {
        return None;
    }
    actor_info(reason.get("by")?)
}

fn is_reply(fv: &Value, record: &Value) -> bool {
    fv.get("reply").is_some() || record.get("reply").is_some()
}

/// Author of the replied-to post. Deleted or blocked parents come back
/// as `notFoundPost`/`blockedPost` views without an author.
fn reply_parent(fv: &Value) -> Option<ActorInfo> {
    let parent = fv.get("reply")?.get("parent")?;
    actor_info(parent.get("author")?)
}

/// Quoted record from a `record#view` or `recordWithMedia#view` embed.
/// The outer `Option` is whether this is a quote at all; the inner one
/// is whether the quoted post is still available.
fn quote_embed(embed: Option<&Value>) -> Option<Option<Box<QuotedPost>>> {
    let embed = embed?;
    let embed_type = str_field(embed, "$type")?;
    let record = match embed_type.as_str() {
        "app.bsky.embed.record#view" => embed.get("record")?,
        "app.bsky.embed.recordWithMedia#view" => embed.get("record")?.get("record")?,
        _ => return None,
    };
    Some(map_quoted(record).map(Box::new))
}

fn map_quoted(record: &Value) -> Option<QuotedPost> {
    // A taken-down or blocked quote has no `value`.
    let value = record.get("value")?;
    let author = actor_info(record.get("author")?)?;

    // Embeds on the quoted post live in `embeds`, already hydrated.
    let mut embeds = Vec::new();
    let mut nested = None;
    if let Some(hydrated) = record.get("embeds").and_then(Value::as_array) {
        for e in hydrated {
            if let Some(inner) = quote_embed(Some(e)) {
                nested = inner;
            } else {
                embeds.extend(map_embeds(Some(e), str_field(record, "uri").as_deref()));
            }
        }
    }

    Some(QuotedPost {
        author,
        text: str_field(value, "text").unwrap_or_default(),
        embeds,
        nested,
    })
}

/// Media embeds from a hydrated embed view.
fn map_embeds(embed: Option<&Value>, post_uri: Option<&str>) -> Vec<Embed> {
    let Some(embed) = embed else { return Vec::new() };
    let Some(embed_type) = str_field(embed, "$type") else {
        return Vec::new();
    };

    match embed_type.as_str() {
        "app.bsky.embed.images#view" => embed
            .get("images")
            .and_then(Value::as_array)
            .map(|images| {
                images
                    .iter()
                    .filter_map(|img| {
                        let url =
                            str_field(img, "fullsize").or_else(|| str_field(img, "thumb"))?;
                        Some(Embed::Image {
                            url,
                            alt: str_field(img, "alt").unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),

        "app.bsky.embed.video#view" => {
            // No direct playback URL in the view; link the blob through
            // the atproto browser instead.
            match (str_field(embed, "cid"), post_uri.and_then(did_of_uri)) {
                (Some(cid), Some(did)) => vec![Embed::Video {
                    url: format!("https://atproto-browser.vercel.app/blob/{did}/{cid}"),
                    alt: str_field(embed, "alt").unwrap_or_default(),
                }],
                _ => Vec::new(),
            }
        }

        "app.bsky.embed.external#view" => embed
            .get("external")
            .and_then(|ext| str_field(ext, "uri"))
            .map(|url| vec![Embed::External { url }])
            .unwrap_or_default(),

        // The media half of a quote-with-media.
        "app.bsky.embed.recordWithMedia#view" => {
            map_embeds(embed.get("media"), post_uri)
        }

        _ => Vec::new(),
    }
}

/// Extract the author did from an `at://did:plc:.../...` uri.
fn did_of_uri(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("at://")?;
    let did = rest.split('/').next()?;
    did.starts_with("did:").then(|| did.to_owned())
}

/// Link facets from rich text, in document order.
fn facet_links(record: &Value) -> Vec<String> {
    let Some(facets) = record.get("facets").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut links = Vec::new();
    for facet in facets {
        let Some(features) = facet.get("features").and_then(Value::as_array) else {
            continue;
        };
        for feature in features {
            if str_field(feature, "$type").as_deref() == Some("app.bsky.richtext.facet#link") {
                if let Some(uri) = str_field(feature, "uri") {
                    links.push(uri);
                }
            }
        }
    }
    links
}
