//! Rendering feed items into IRC channel lines.
//!
//! `render` is a pure function of the item plus identity-mapper lookups.
//! Output order is fixed — attribution, body, embeds, links — so the
//! same item always renders to the same line sequence.

use crate::feed::{Embed, FeedItem, ItemKind, QuotedPost};
use crate::nicks::IdentityMapper;

/// Per-line byte budget for post bodies, leaving headroom for the
/// `:nick!@server PRIVMSG #timeline :` framing within 512 bytes.
pub const MAX_BODY_BYTES: usize = 400;

/// Quote posts nest at most this deep; anything further collapses.
const MAX_QUOTE_DEPTH: usize = 1;

/// A feed item rendered to channel lines, attributed to one nick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedItem {
    pub nick: String,
    pub handle: String,
    pub lines: Vec<String>,
}

/// A feed item that cannot be rendered at all. The synchronizer skips
/// these but still marks them emitted so a poison item cannot wedge the
/// sync loop.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("feed item has no id")]
    MissingId,
    #[error("feed item has no author handle")]
    MissingAuthor,
}

/// Render one feed item into an ordered sequence of channel lines.
pub fn render(item: &FeedItem, mapper: &mut IdentityMapper) -> Result<RenderedItem, RenderError> {
    if item.id.is_empty() {
        return Err(RenderError::MissingId);
    }
    if item.author.handle.is_empty() {
        return Err(RenderError::MissingAuthor);
    }

    let nick = mapper.assign(&item.author);
    let mut lines = Vec::new();

    match &item.kind {
        ItemKind::Post => {
            lines.extend(body_lines(&item.text));
        }
        ItemKind::Repost { original } => {
            // Attribution names the reposter; the original post nests
            // under it, marked with the original author's handle.
            lines.push(format!("↻ @{}:", item.author.handle));
            let mut inner = body_lines(&item.text);
            if let Some(first) = inner.first_mut() {
                *first = format!("@{}: {first}", original.handle);
            }
            lines.extend(inner.into_iter().map(|line| format!(" | {line}")));
        }
        ItemKind::Reply { parent } => {
            match parent {
                Some(parent) => {
                    mapper.assign(parent);
                    lines.push(format!("↪ replying to @{}", parent.handle));
                }
                // Parent deleted or unresolvable — degrade without a
                // broken reference.
                None => lines.push("↪ in reply to an earlier post".to_owned()),
            }
            lines.extend(body_lines(&item.text));
        }
        ItemKind::Quote { quoted } => {
            lines.extend(body_lines(&item.text));
            match quoted {
                Some(quoted) => lines.extend(quote_lines(quoted, 0)),
                None => lines.push("💬 (quote unavailable)".to_owned()),
            }
        }
    }

    for embed in &item.embeds {
        lines.push(embed_line(embed));
    }

    if !item.links.is_empty() {
        lines.push(item.links.join(" "));
    }

    Ok(RenderedItem {
        nick,
        handle: item.author.handle.clone(),
        lines,
    })
}

/// Render a quoted post, indented under a 💬 attribution line.
fn quote_lines(quoted: &QuotedPost, depth: usize) -> Vec<String> {
    let mut inner = body_lines(&quoted.text);
    for embed in &quoted.embeds {
        inner.push(embed_line(embed));
    }
    if let Some(nested) = &quoted.nested {
        if depth + 1 < MAX_QUOTE_DEPTH {
            inner.extend(quote_lines(nested, depth + 1));
        } else {
            inner.push("💬 (nested quote)".to_owned());
        }
    }

    let mut out = vec![format!("💬 @{}:", quoted.author.handle)];
    out.extend(inner.into_iter().map(|line| format!(" | {line}")));
    out
}

fn embed_line(embed: &Embed) -> String {
    match embed {
        Embed::Image { url, alt } => marker_line("📷", alt, url),
        Embed::Video { url, alt } => marker_line("🎥", alt, url),
        Embed::External { url } => format!("🔗 {url}"),
    }
}

fn marker_line(marker: &str, alt: &str, url: &str) -> String {
    let alt = alt.replace(['\r', '\n'], " ");
    let alt = alt.trim();
    if alt.is_empty() {
        format!("{marker} {url}")
    } else {
        format!("{marker} {alt} {url}")
    }
}

/// Split post text into non-blank lines, word-wrapped to the per-line
/// budget. Empty text renders as a placeholder.
fn body_lines(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        out.extend(wrap(line, MAX_BODY_BYTES));
    }
    if out.is_empty() {
        out.push("(no text)".to_owned());
    }
    out
}

/// Word-wrap a single line to at most `max` bytes per output line.
/// Splits mid-word only when a single word exceeds the budget.
fn wrap(line: &str, max: usize) -> Vec<String> {
    if line.len() <= max {
        return vec![line.to_owned()];
    }

    let mut out = Vec::new();
    let mut current = String::new();
    for word in line.split_whitespace() {
        if word.len() > max {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            let mut rest = word;
            while rest.len() > max {
                let mut split = max;
                while !rest.is_char_boundary(split) {
                    split -= 1;
                }
                out.push(rest[..split].to_owned());
                rest = &rest[split..];
            }
            current = rest.to_owned();
        } else if current.is_empty() {
            current = word.to_owned();
        } else if current.len() + 1 + word.len() > max {
            out.push(std::mem::take(&mut current));
            current = word.to_owned();
        } else {
            current.push(' ');
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ActorInfo;
    use pretty_assertions::assert_eq;

    fn actor(did: &str, handle: &str) -> ActorInfo {
        ActorInfo {
            did: did.to_owned(),
            handle: handle.to_owned(),
            display_name: None,
            description: None,
        }
    }

    #[test]
    fn plain_post_single_line() {
        let mut mapper = IdentityMapper::new();
        let item = FeedItem::post("cid1", actor("did:abc", "alice.example"), "hello world");
        let rendered = render(&item, &mut mapper).unwrap();
        assert_eq!(rendered.nick, "alice_example");
        assert_eq!(rendered.lines, vec!["hello world"]);
    }

    #[test]
    fn rendering_is_deterministic() {
        let mut mapper = IdentityMapper::new();
        let mut item = FeedItem::post("cid1", actor("did:abc", "alice.example"), "hello\nworld");
        item.embeds.push(Embed::External {
            url: "https://example.com".into(),
        });
        item.links.push("https://a.example".into());
        let first = render(&item, &mut mapper).unwrap();
        let second = render(&item, &mut mapper).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_text_renders_placeholder() {
        let mut mapper = IdentityMapper::new();
        let item = FeedItem::post("cid1", actor("did:abc", "alice.example"), "  \n ");
        let rendered = render(&item, &mut mapper).unwrap();
        assert_eq!(rendered.lines, vec!["(no text)"]);
    }

    #[test]
    fn repost_nests_original_under_attribution() {
        let mut mapper = IdentityMapper::new();
        let mut item = FeedItem::post("cid1", actor("did:bob", "bob.example"), "hello world");
        item.kind = ItemKind::Repost {
            original: actor("did:alice", "alice.example"),
        };
        let rendered = render(&item, &mut mapper).unwrap();
        // Attributed to the reposter, original nested and marked.
        assert_eq!(rendered.nick, "bob_example");
        assert_eq!(
            rendered.lines,
            vec!["↻ @bob.example:", " | @alice.example: hello world"]
        );
    }

    #[test]
    fn reply_references_parent_author() {
        let mut mapper = IdentityMapper::new();
        let mut item = FeedItem::post("cid1", actor("did:bob", "bob.example"), "agreed!");
        item.kind = ItemKind::Reply {
            parent: Some(actor("did:alice", "alice.example")),
        };
        let rendered = render(&item, &mut mapper).unwrap();
        assert_eq!(
            rendered.lines,
            vec!["↪ replying to @alice.example", "agreed!"]
        );
        // The parent becomes a known channel member.
        assert!(mapper.lookup_by_nick("alice_example").is_some());
    }

    #[test]
    fn reply_with_unresolvable_parent_degrades() {
        let mut mapper = IdentityMapper::new();
        let mut item = FeedItem::post("cid1", actor("did:bob", "bob.example"), "agreed!");
        item.kind = ItemKind::Reply { parent: None };
        let rendered = render(&item, &mut mapper).unwrap();
        assert_eq!(
            rendered.lines,
            vec!["↪ in reply to an earlier post", "agreed!"]
        );
    }

    #[test]
    fn quote_nests_one_level_only() {
        let mut mapper = IdentityMapper::new();
        let deep = QuotedPost {
            author: actor("did:carol", "carol.example"),
            text: "the original".into(),
            embeds: vec![],
            nested: None,
        };
        let quoted = QuotedPost {
            author: actor("did:alice", "alice.example"),
            text: "interesting".into(),
            embeds: vec![],
            nested: Some(Box::new(deep)),
        };
        let mut item = FeedItem::post("cid1", actor("did:bob", "bob.example"), "look at this");
        item.kind = ItemKind::Quote {
            quoted: Some(Box::new(quoted)),
        };
        let rendered = render(&item, &mut mapper).unwrap();
        assert_eq!(
            rendered.lines,
            vec![
                "look at this",
                "💬 @alice.example:",
                " | interesting",
                " | 💬 (nested quote)",
            ]
        );
    }

    #[test]
    fn unavailable_quote_degrades() {
        let mut mapper = IdentityMapper::new();
        let mut item = FeedItem::post("cid1", actor("did:bob", "bob.example"), "look at this");
        item.kind = ItemKind::Quote { quoted: None };
        let rendered = render(&item, &mut mapper).unwrap();
        assert_eq!(rendered.lines, vec!["look at this", "💬 (quote unavailable)"]);
    }

    #[test]
    fn embeds_and_links_in_fixed_order() {
        let mut mapper = IdentityMapper::new();
        let mut item = FeedItem::post("cid1", actor("did:abc", "alice.example"), "caption");
        item.embeds = vec![
            Embed::Image {
                url: "https://cdn.example/a.jpg".into(),
                alt: "a cat\nsleeping".into(),
            },
            Embed::Video {
                url: "https://cdn.example/v".into(),
                alt: String::new(),
            },
            Embed::External {
                url: "https://blog.example/post".into(),
            },
        ];
        item.links = vec!["https://a.example".into(), "https://b.example".into()];
        let rendered = render(&item, &mut mapper).unwrap();
        assert_eq!(
            rendered.lines,
            vec![
                "caption",
                "📷 a cat sleeping https://cdn.example/a.jpg",
                "🎥 https://cdn.example/v",
                "🔗 https://blog.example/post",
                "https://a.example https://b.example",
            ]
        );
    }

    #[test]
    fn long_post_wraps_at_word_boundaries() {
        let mut mapper = IdentityMapper::new();
        let text = "word ".repeat(120); // 600 bytes
        let item = FeedItem::post("cid1", actor("did:abc", "alice.example"), &text);
        let rendered = render(&item, &mut mapper).unwrap();
        assert!(rendered.lines.len() > 1);
        for line in &rendered.lines {
            assert!(line.len() <= MAX_BODY_BYTES);
            // No mid-word splits: every chunk is whole words.
            assert!(line.split_whitespace().all(|w| w == "word"));
        }
    }

    #[test]
    fn oversized_word_is_hard_split() {
        let word = "x".repeat(MAX_BODY_BYTES + 50);
        let parts = wrap(&word, MAX_BODY_BYTES);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), MAX_BODY_BYTES);
        assert_eq!(parts[1].len(), 50);
    }

    #[test]
    fn missing_fields_are_render_errors() {
        let mut mapper = IdentityMapper::new();
        let no_id = FeedItem::post("", actor("did:abc", "alice.example"), "hi");
        assert!(matches!(render(&no_id, &mut mapper), Err(RenderError::MissingId)));

        let no_author = FeedItem::post("cid1", actor("did:abc", ""), "hi");
        assert!(matches!(
            render(&no_author, &mut mapper),
            Err(RenderError::MissingAuthor)
        ));
    }
}
