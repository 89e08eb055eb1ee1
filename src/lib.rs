//! Bluesky timeline to IRC bridge.
//!
//! Connect any IRC client, get auto-joined to `#timeline`, and read
//! your home feed as channel messages from synthetic members. Actors
//! from the feed answer WHO/WHOIS/NAMES like regular channel users.

pub mod config;
pub mod feed;
pub mod irc;
pub mod nicks;
pub mod render;
pub mod sync;
