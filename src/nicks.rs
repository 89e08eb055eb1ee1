//! Identity mapping between remote actors and IRC nicknames.
//!
//! Every Bluesky actor seen in the timeline becomes a synthetic channel
//! member. The mapper owns the did → actor cache and the nick → did
//! registry, and guarantees that a did keeps the same nick for the life
//! of the process so WHOIS and message attribution stay consistent
//! across polling cycles.

use std::collections::HashMap;

use crate::feed::ActorInfo;

/// Maximum nickname length, matching classic IRC server limits.
pub const MAX_NICK_LEN: usize = 16;

/// A cached actor with its assigned nickname.
#[derive(Debug, Clone)]
pub struct Actor {
    pub info: ActorInfo,
    /// Fixed at first assignment, never reassigned.
    pub nick: String,
}

#[derive(Debug, Default)]
pub struct IdentityMapper {
    /// did → actor.
    actors: HashMap<String, Actor>,
    /// nick → did. No two dids ever share a live nick.
    registry: HashMap<String, String>,
}

impl IdentityMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the nick for this actor, assigning one on first sight.
    ///
    /// The candidate is derived from the display name or handle; on a
    /// collision with a different did, numeric suffixes (`-2`, `-3`, …)
    /// are tried until the nick is unique.
    pub fn assign(&mut self, info: &ActorInfo) -> String {
        if let Some(actor) = self.actors.get(&info.did) {
            return actor.nick.clone();
        }

        let source = info
            .display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&info.handle);
        let base = sanitize(source);
        let nick = self.unique_nick(&base);

        self.registry.insert(nick.clone(), info.did.clone());
        self.actors.insert(
            info.did.clone(),
            Actor {
                info: info.clone(),
                nick: nick.clone(),
            },
        );
        nick
    }

    /// Fallback nick for a did whose profile could not be fetched.
    /// Derived from the did tail; never blocks rendering.
    pub fn placeholder(&mut self, did: &str) -> String {
        if let Some(actor) = self.actors.get(did) {
            return actor.nick.clone();
        }
        let tail = did.rsplit(':').next().unwrap_or(did);
        let info = ActorInfo {
            did: did.to_owned(),
            handle: did.to_owned(),
            display_name: None,
            description: None,
        };
        let base = sanitize(tail);
        let nick = self.unique_nick(&base);
        self.registry.insert(nick.clone(), did.to_owned());
        self.actors.insert(did.to_owned(), Actor { info, nick: nick.clone() });
        nick
    }

    pub fn lookup_by_nick(&self, nick: &str) -> Option<&Actor> {
        let did = self.registry.get(nick)?;
        self.actors.get(did)
    }

    pub fn get(&self, did: &str) -> Option<&Actor> {
        self.actors.get(did)
    }

    /// Whether a nick is reserved by a synthetic actor. Connecting
    /// humans cannot claim these.
    pub fn is_reserved(&self, nick: &str) -> bool {
        self.registry.contains_key(nick)
    }

    /// All actors seen so far, for WHO/NAMES listings.
    pub fn actors(&self) -> impl Iterator<Item = &Actor> {
        self.actors.values()
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    fn unique_nick(&self, base: &str) -> String {
        if !self.registry.contains_key(base) {
            return base.to_owned();
        }
        for n in 2u32.. {
            let suffix = format!("-{n}");
            let keep = MAX_NICK_LEN.saturating_sub(suffix.len()).min(base.len());
            let candidate = format!("{}{suffix}", &base[..keep]);
            if !self.registry.contains_key(&candidate) {
                return candidate;
            }
        }
        unreachable!("u32 suffix space exhausted");
    }
}

/// Reduce a handle or display name to the IRC nickname charset.
///
/// Strips the `.bsky.social` suffix, lowercases, maps dots and spaces to
/// underscores, drops anything else outside `[a-z0-9_-]`, guards against
/// a leading digit, and truncates.
pub fn sanitize(field: &str) -> String {
    let field = field.strip_suffix(".bsky.social").unwrap_or(field);

    let mut base = String::new();
    for ch in field.to_lowercase().chars() {
        match ch {
            '.' | ' ' => base.push('_'),
            'a'..='z' | '0'..='9' | '_' | '-' => base.push(ch),
            _ => {}
        }
    }

    if base.is_empty() {
        base.push_str("_nohandle");
    }
    if base.as_bytes()[0].is_ascii_digit() {
        base.insert(0, '_');
    }
    base.truncate(MAX_NICK_LEN);
    base
}
