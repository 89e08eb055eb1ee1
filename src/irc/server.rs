/// IRC session core — registration, channel membership, command dispatch.
///
/// The bridge exposes exactly one channel, `#timeline`. Registered
/// sessions are auto-joined to it and receive every synchronized feed
/// item as channel messages from synthetic members. Feed actors appear
/// in WHO/WHOIS/NAMES alongside live human sessions.
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use super::codec::{CodecError, IrcCodec};
use super::message::Message;
use crate::nicks::IdentityMapper;

/// The single channel the bridge serves.
pub const CHANNEL: &str = "#timeline";

/// Per-connection outbound queue bound. A session that falls this far
/// behind is dropped rather than allowed to stall the broadcaster.
const OUTBOUND_QUEUE: usize = 64;

/// How many rendered items the replay ring retains for late joiners.
const REPLAY_ITEMS: usize = 50;

/// Nicks per 353 reply line.
const NAMES_CHUNK: usize = 20;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server identity — `BRIDGE_SERVER_NAME`, or the host's FQDN, or a
/// local default.
pub static SERVER_NAME: LazyLock<String> = LazyLock::new(|| {
    std::env::var("BRIDGE_SERVER_NAME")
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .filter(|h| h.contains('.'))
        })
        .unwrap_or_else(|| "bridge.local".into())
});

/// Handle to send messages to a connected client.
#[derive(Debug)]
pub struct ClientHandle {
    pub nick: String,
    pub user: Option<String>,
    pub realname: Option<String>,
    pub addr: SocketAddr,
    /// Whether the session is currently joined to the timeline channel.
    /// Registration auto-joins; PART clears it.
    pub joined: bool,
    pub tx: mpsc::Sender<Message>,
}

/// Shared server state — the single serialization point for sessions,
/// synthetic actors, and the replay ring.
#[derive(Debug)]
pub struct ServerState {
    /// Registered clients: nick → sender handle.
    pub clients: HashMap<String, ClientHandle>,
    /// Synthetic channel members (feed actors) and the nick registry.
    pub mapper: IdentityMapper,
    /// Channel topic, shown on join and TOPIC queries.
    pub topic: String,
    /// Rendered lines of the last few items, grouped per item. Written
    /// only by the synchronizer; replayed to newly registered sessions.
    history: VecDeque<Vec<Message>>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            mapper: IdentityMapper::new(),
            topic: "Bluesky AT Bridge".into(),
            history: VecDeque::new(),
        }
    }

    /// Append one item's rendered messages to the replay ring.
    pub fn push_history(&mut self, msgs: Vec<Message>) {
        self.history.push_back(msgs);
        while self.history.len() > REPLAY_ITEMS {
            self.history.pop_front();
        }
    }

    /// Replay buffer contents, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Message> {
        self.history.iter().flatten()
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, thread-safe server state.
pub type SharedState = Arc<RwLock<ServerState>>;

/// A numeric or named reply from the server.
fn server_reply(command: &str, params: Vec<String>) -> Message {
    Message::new(Some(SERVER_NAME.clone()), command, params)
}

/// `nick!nick@server` hostmask for a human session.
fn hostmask(nick: &str) -> String {
    format!("{nick}!{nick}@{}", *SERVER_NAME)
}

/// Fan a message out to every joined session, except `except`.
///
/// Sends are non-blocking: a session whose outbound queue is full (or
/// whose connection already died) is removed from the map, which closes
/// its channel and wakes its connection task to exit. Slow consumers
/// never delay the rest.
pub fn broadcast(state: &mut ServerState, except: Option<&str>, msg: &Message) {
    let mut dropped = Vec::new();
    for (nick, handle) in &state.clients {
        if !handle.joined || Some(nick.as_str()) == except {
            continue;
        }
        if handle.tx.try_send(msg.clone()).is_err() {
            warn!(%nick, "outbound queue overflow, dropping session");
            dropped.push(nick.clone());
        }
    }
    for nick in dropped {
        state.clients.remove(&nick);
    }
}

/// Deliver a message to a single client, with the same overflow policy
/// as [`broadcast`]. Returns false when the target is not connected.
pub fn send_to(state: &mut ServerState, target: &str, msg: &Message) -> bool {
    let Some(handle) = state.clients.get(target) else {
        return false;
    };
    if handle.tx.try_send(msg.clone()).is_err() {
        warn!(nick = %target, "outbound queue overflow, dropping session");
        state.clients.remove(target);
    }
    true
}

/// Run the bridge's IRC listener on the given address.
pub async fn run(
    addr: &str,
    state: SharedState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!("bridge listening on {addr}");
    serve(listener, state).await
}

/// Accept loop over an already-bound listener. Split out so tests can
/// bind to an ephemeral port first.
pub async fn serve(
    listener: TcpListener,
    state: SharedState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        let (socket, addr) = listener.accept().await?;
        info!(%addr, "new connection");
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, addr, state).await {
                warn!(%addr, "client error: {e}");
            }
            info!(%addr, "disconnected");
        });
    }
}

/// Per-connection state during registration.
struct PendingRegistration {
    nick: Option<String>,
    user: Option<(String, String)>, // (username, realname)
    /// An opened CAP negotiation holds registration until CAP END, so
    /// the welcome burst and replay go out with negotiated caps active.
    cap_open: bool,
}

/// Result of handling a command.
enum CommandResult {
    Ok,
    Quit,
    NickChanged(String),
}

/// Handle a single client connection.
async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    state: SharedState,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut framed = Framed::new(socket, IrcCodec);
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    // Held only until registration; afterwards the clients map owns the
    // sole sender, so removal from the map closes the channel.
    let mut tx = Some(tx);

    let mut pending = PendingRegistration {
        nick: None,
        user: None,
        cap_open: false,
    };
    let mut registered_nick: Option<String> = None;
    let mut tags_enabled = false;

    framed
        .send(Message::new(
            None,
            "NOTICE",
            vec![
                "*".into(),
                format!("Welcome to the Bluesky IRC Bridge, JOIN {CHANNEL}"),
            ],
        ))
        .await?;

    loop {
        tokio::select! {
            // Incoming message from the client's TCP stream.
            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(CodecError::Parse(e))) => {
                        // Malformed but well-framed; tell the client and
                        // keep the connection.
                        warn!(%addr, "malformed line: {e}");
                        framed
                            .send(Message::new(
                                None,
                                "NOTICE",
                                vec!["*".into(), "Malformed message ignored".into()],
                            ))
                            .await?;
                        continue;
                    }
                    Some(Err(e)) => {
                        // Framing-level violation — close the connection.
                        warn!(%addr, "protocol error: {e}");
                        break;
                    }
                    None => break, // Connection closed.
                };

                match registered_nick {
                    None => {
                        handle_registration(&mut framed, &mut pending, &mut tags_enabled, &msg)
                            .await?;

                        // Check if registration is now complete. An open
                        // CAP negotiation defers it until CAP END.
                        if pending.cap_open {
                            continue;
                        }
                        if let (Some(nick), Some((user, realname))) = (&pending.nick, &pending.user) {
                            let nick = nick.clone();
                            let user = user.clone();
                            let realname = realname.clone();

                            let Some(tx_handle) = tx.take() else { break };

                            // Conflict check and insert under one write
                            // lock, so two racing registrations can never
                            // both claim the nick. Live sessions and
                            // synthetic actor nicks are both off limits.
                            let inserted = {
                                let mut st = state.write().await;
                                if st.clients.contains_key(&nick) || st.mapper.is_reserved(&nick) {
                                    false
                                } else {
                                    st.clients.insert(nick.clone(), ClientHandle {
                                        nick: nick.clone(),
                                        user: Some(user.clone()),
                                        realname: Some(realname.clone()),
                                        addr,
                                        joined: true,
                                        tx: tx_handle.clone(),
                                    });
                                    true
                                }
                            };

                            if !inserted {
                                tx = Some(tx_handle);
                                let err = server_reply("433", vec![
                                    "*".into(),
                                    nick.clone(),
                                    "Nickname is already in use".into(),
                                ]);
                                framed.send(err).await?;
                                pending.nick = None;
                                continue;
                            }

                            send_welcome(&mut framed, &nick, &state, tags_enabled).await?;
                            registered_nick = Some(nick);
                        }
                    }
                    Some(ref nick) => {
                        match handle_command(&mut framed, nick, &msg, &state, &mut tags_enabled).await? {
                            CommandResult::Ok => {}
                            CommandResult::Quit => break,
                            CommandResult::NickChanged(new_nick) => {
                                registered_nick = Some(new_nick);
                            }
                        }
                    }
                }
            }

            // Outgoing message from other tasks (broadcasts, replay).
            outbound = rx.recv() => {
                match outbound {
                    Some(mut msg) => {
                        if !tags_enabled {
                            msg.tags.clear();
                        }
                        framed.send(msg).await?;
                    }
                    // Channel closed: the broadcaster dropped us.
                    None => break,
                }
            }
        }
    }

    // Clean up on disconnect.
    if let Some(nick) = registered_nick {
        cleanup_client(&nick, &state).await;
    }

    Ok(())
}

/// Handle CAP, NICK, USER and PING during pre-registration.
async fn handle_registration(
    framed: &mut Framed<TcpStream, IrcCodec>,
    pending: &mut PendingRegistration,
    tags_enabled: &mut bool,
    msg: &Message,
) -> Result<(), Box<dyn std::error::Error>> {
    match msg.command.to_uppercase().as_str() {
        "CAP" => {
            match msg.params.first().map(String::as_str) {
                Some("LS") | Some("REQ") => pending.cap_open = true,
                Some("END") => pending.cap_open = false,
                _ => {}
            }
            handle_cap(framed, "*", msg, tags_enabled).await?;
        }
        "NICK" => {
            match msg.params.first() {
                Some(nick) if !nick.is_empty() => pending.nick = Some(nick.clone()),
                _ => {
                    let err =
                        server_reply("431", vec!["*".into(), "No nickname given".into()]);
                    framed.send(err).await?;
                }
            }
        }
        "USER" => {
            if msg.params.len() >= 4 {
                let username = msg.params[0].clone();
                let realname = msg.params[3].clone();
                pending.user = Some((username, realname));
            }
        }
        "PING" => {
            let token = msg.params.first().cloned().unwrap_or_default();
            let pong = server_reply("PONG", vec![SERVER_NAME.clone(), token]);
            framed.send(pong).await?;
        }
        _ => {
            // During registration, ignore unknown commands.
        }
    }
    Ok(())
}

/// CAP negotiation — the bridge advertises exactly `message-tags`.
async fn handle_cap(
    framed: &mut Framed<TcpStream, IrcCodec>,
    target: &str,
    msg: &Message,
    tags_enabled: &mut bool,
) -> Result<(), Box<dyn std::error::Error>> {
    match msg.params.first().map(String::as_str) {
        Some("LS") => {
            let reply = server_reply(
                "CAP",
                vec![target.into(), "LS".into(), "message-tags".into()],
            );
            framed.send(reply).await?;
        }
        Some("REQ") => {
            let requested = msg.params.get(1).cloned().unwrap_or_default();
            if requested.split_whitespace().any(|cap| cap == "message-tags") {
                *tags_enabled = true;
                let reply = server_reply(
                    "CAP",
                    vec![target.into(), "ACK".into(), "message-tags".into()],
                );
                framed.send(reply).await?;
            } else {
                let reply =
                    server_reply("CAP", vec![target.into(), "NAK".into(), requested]);
                framed.send(reply).await?;
            }
        }
        // CAP END and anything else — silently accept.
        _ => {}
    }
    Ok(())
}

/// Welcome sequence: 001-005, MOTD, forced join, topic, names, replay.
async fn send_welcome(
    framed: &mut Framed<TcpStream, IrcCodec>,
    nick: &str,
    state: &SharedState,
    tags_enabled: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let welcome_msgs = [
        server_reply(
            "001",
            vec![
                nick.into(),
                format!("Welcome to the Bluesky IRC Bridge, {nick}"),
            ],
        ),
        server_reply(
            "002",
            vec![
                nick.into(),
                format!("Your host is {}, running skybridge-{VERSION}", *SERVER_NAME),
            ],
        ),
        server_reply(
            "003",
            vec![nick.into(), "This server was created just now".into()],
        ),
        server_reply(
            "004",
            vec![
                nick.into(),
                SERVER_NAME.clone(),
                format!("skybridge-{VERSION}"),
                "o".into(),
                "o".into(),
            ],
        ),
        server_reply(
            "005",
            vec![
                nick.into(),
                "CHANTYPES=#".into(),
                "NETWORK=Bluesky".into(),
                format!("NICKLEN={}", crate::nicks::MAX_NICK_LEN),
                "are supported by this server".into(),
            ],
        ),
    ];
    for msg in welcome_msgs {
        framed.send(msg).await?;
    }

    // MOTD (375/372/376).
    let motd_lines = [
        "Welcome to the Bluesky IRC Bridge.",
        "Your home timeline is replayed into #timeline.",
    ];
    framed
        .send(server_reply(
            "375",
            vec![nick.into(), format!("- {} Message of the Day -", *SERVER_NAME)],
        ))
        .await?;
    for line in motd_lines {
        framed
            .send(server_reply("372", vec![nick.into(), format!("- {line}")]))
            .await?;
    }
    framed
        .send(server_reply(
            "376",
            vec![nick.into(), "End of /MOTD command".into()],
        ))
        .await?;

    // Forced join of the timeline channel.
    let join = Message::new(Some(hostmask(nick)), "JOIN", vec![CHANNEL.into()]);
    framed.send(join).await?;

    let (topic, names, replay) = {
        let st = state.read().await;
        let replay: Vec<Message> = st.history().cloned().collect();
        (st.topic.clone(), channel_names(&st), replay)
    };

    framed
        .send(server_reply(
            "332",
            vec![nick.into(), CHANNEL.into(), topic],
        ))
        .await?;
    send_names(framed, nick, &names).await?;

    // Bounded backlog replay — the only history a late joiner gets.
    for mut msg in replay {
        if !tags_enabled {
            msg.tags.clear();
        }
        framed.send(msg).await?;
    }

    Ok(())
}

/// Snapshot of channel member nicks: joined humans plus every synthetic
/// actor seen so far.
fn channel_names(state: &ServerState) -> Vec<String> {
    let mut names: Vec<String> = state
        .clients
        .values()
        .filter(|handle| handle.joined)
        .map(|handle| handle.nick.clone())
        .collect();
    names.extend(state.mapper.actors().map(|actor| actor.nick.clone()));
    names.sort();
    names
}

/// 353 name lists in chunks, then 366.
async fn send_names(
    framed: &mut Framed<TcpStream, IrcCodec>,
    nick: &str,
    names: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    for chunk in names.chunks(NAMES_CHUNK) {
        let reply = server_reply(
            "353",
            vec![nick.into(), "=".into(), CHANNEL.into(), chunk.join(" ")],
        );
        framed.send(reply).await?;
    }
    framed
        .send(server_reply(
            "366",
            vec![nick.into(), CHANNEL.into(), "End of /NAMES list".into()],
        ))
        .await?;
    Ok(())
}

/// Handle commands from a registered client.
async fn handle_command(
    framed: &mut Framed<TcpStream, IrcCodec>,
    nick: &str,
    msg: &Message,
    state: &SharedState,
    tags_enabled: &mut bool,
) -> Result<CommandResult, Box<dyn std::error::Error>> {
    match msg.command.to_uppercase().as_str() {
        "CAP" => {
            handle_cap(framed, nick, msg, tags_enabled).await?;
        }

        "PING" => {
            let token = msg.params.first().cloned().unwrap_or_default();
            let pong = server_reply("PONG", vec![SERVER_NAME.clone(), token]);
            framed.send(pong).await?;
        }

        "NICK" => {
            match msg.params.first() {
                None => {
                    let err =
                        server_reply("431", vec![nick.into(), "No nickname given".into()]);
                    framed.send(err).await?;
                }
                Some(new_nick) if new_nick.is_empty() => {
                    let err =
                        server_reply("431", vec![nick.into(), "No nickname given".into()]);
                    framed.send(err).await?;
                }
                Some(new_nick) if new_nick == nick => {
                    // Same nick — no-op.
                }
                Some(new_nick) => {
                    let mut st = state.write().await;
                    if st.clients.contains_key(new_nick) || st.mapper.is_reserved(new_nick) {
                        let err = server_reply("433", vec![
                            nick.into(),
                            new_nick.clone(),
                            "Nickname is already in use".into(),
                        ]);
                        drop(st);
                        framed.send(err).await?;
                    } else {
                        let nick_msg =
                            Message::new(Some(hostmask(nick)), "NICK", vec![new_nick.clone()]);
                        broadcast(&mut st, Some(nick), &nick_msg);
                        if let Some(mut handle) = st.clients.remove(nick) {
                            handle.nick = new_nick.clone();
                            st.clients.insert(new_nick.clone(), handle);
                        }
                        drop(st);
                        framed.send(nick_msg).await?;
                        return Ok(CommandResult::NickChanged(new_nick.clone()));
                    }
                }
            }
        }

        "JOIN" => {
            if let Some(channel) = msg.params.first() {
                if channel == CHANNEL {
                    let (topic, names) = {
                        let mut st = state.write().await;
                        let was_joined = st
                            .clients
                            .get(nick)
                            .is_some_and(|handle| handle.joined);
                        if let Some(handle) = st.clients.get_mut(nick) {
                            handle.joined = true;
                        }
                        if !was_joined {
                            let join =
                                Message::new(Some(hostmask(nick)), "JOIN", vec![CHANNEL.into()]);
                            broadcast(&mut st, Some(nick), &join);
                        }
                        (st.topic.clone(), channel_names(&st))
                    };
                    let join = Message::new(Some(hostmask(nick)), "JOIN", vec![CHANNEL.into()]);
                    framed.send(join).await?;
                    framed
                        .send(server_reply("332", vec![nick.into(), CHANNEL.into(), topic]))
                        .await?;
                    send_names(framed, nick, &names).await?;
                } else {
                    let err = server_reply("403", vec![
                        nick.into(),
                        channel.clone(),
                        "No such channel".into(),
                    ]);
                    framed.send(err).await?;
                }
            }
        }

        "PART" => {
            if let Some(channel) = msg.params.first() {
                if channel == CHANNEL {
                    let reason = msg.params.get(1).cloned().unwrap_or_default();
                    let part = Message::new(
                        Some(hostmask(nick)),
                        "PART",
                        vec![CHANNEL.into(), reason],
                    );
                    {
                        let mut st = state.write().await;
                        broadcast(&mut st, Some(nick), &part);
                        if let Some(handle) = st.clients.get_mut(nick) {
                            handle.joined = false;
                        }
                    }
                    framed.send(part).await?;
                } else {
                    let err = server_reply("403", vec![
                        nick.into(),
                        channel.clone(),
                        "No such channel".into(),
                    ]);
                    framed.send(err).await?;
                }
            }
        }

        "PRIVMSG" | "NOTICE" => {
            if msg.params.len() >= 2 {
                let target = &msg.params[0];
                let text = &msg.params[1];
                let relay = Message::new(
                    Some(hostmask(nick)),
                    msg.command.to_uppercase(),
                    vec![target.clone(), text.clone()],
                );

                if target == CHANNEL {
                    let mut st = state.write().await;
                    let joined = st.clients.get(nick).is_some_and(|handle| handle.joined);
                    if joined {
                        broadcast(&mut st, Some(nick), &relay);
                    } else {
                        drop(st);
                        let err = server_reply("404", vec![
                            nick.into(),
                            CHANNEL.into(),
                            "Cannot send to channel".into(),
                        ]);
                        framed.send(err).await?;
                    }
                } else {
                    let mut st = state.write().await;
                    if send_to(&mut st, target, &relay) {
                        // Delivered, or the target overflowed and was
                        // dropped; either way nothing to report back.
                    } else if st.mapper.is_reserved(target) {
                        // Posting back to the feed is out of scope.
                        drop(st);
                        let err = server_reply("401", vec![
                            nick.into(),
                            target.clone(),
                            "Cannot message a timeline member".into(),
                        ]);
                        framed.send(err).await?;
                    } else {
                        drop(st);
                        let err = server_reply("401", vec![
                            nick.into(),
                            target.clone(),
                            "No such nick/channel".into(),
                        ]);
                        framed.send(err).await?;
                    }
                }
            }
        }

        "WHO" => {
            if let Some(target) = msg.params.first() {
                if target == CHANNEL {
                    let st = state.read().await;
                    for handle in st.clients.values().filter(|handle| handle.joined) {
                        let reply = server_reply("352", vec![
                            nick.into(),
                            CHANNEL.into(),
                            handle.user.clone().unwrap_or_else(|| handle.nick.clone()),
                            SERVER_NAME.clone(),
                            SERVER_NAME.clone(),
                            handle.nick.clone(),
                            "H".into(),
                            format!(
                                "0 {}",
                                handle.realname.as_deref().unwrap_or(&handle.nick)
                            ),
                        ]);
                        framed.send(reply).await?;
                    }
                    for actor in st.mapper.actors() {
                        let realname = actor
                            .info
                            .display_name
                            .as_deref()
                            .unwrap_or(&actor.info.handle);
                        let reply = server_reply("352", vec![
                            nick.into(),
                            CHANNEL.into(),
                            actor.info.handle.clone(),
                            "bluesky".into(),
                            SERVER_NAME.clone(),
                            actor.nick.clone(),
                            "H".into(),
                            format!("0 {realname}"),
                        ]);
                        framed.send(reply).await?;
                    }
                }
                let end = server_reply(
                    "315",
                    vec![nick.into(), target.clone(), "End of /WHO list".into()],
                );
                framed.send(end).await?;
            }
        }

        "WHOIS" => {
            if msg.params.is_empty() {
                let err = server_reply("431", vec![nick.into(), "No nickname given".into()]);
                framed.send(err).await?;
            } else if let Some(target) = msg.params.last() {
                let st = state.read().await;
                if let Some(actor) = st.mapper.lookup_by_nick(target) {
                    // Synthetic actor — profile summary from the feed.
                    let realname = actor
                        .info
                        .display_name
                        .as_deref()
                        .unwrap_or(&actor.info.handle);
                    framed
                        .send(server_reply("311", vec![
                            nick.into(),
                            target.clone(),
                            actor.info.handle.clone(),
                            "bluesky".into(),
                            "*".into(),
                            realname.into(),
                        ]))
                        .await?;
                    framed
                        .send(server_reply("319", vec![
                            nick.into(),
                            target.clone(),
                            CHANNEL.into(),
                        ]))
                        .await?;
                    let mut profile = vec![
                        format!("Bluesky ID: {}", actor.info.did),
                        format!("Handle: @{}", actor.info.handle),
                    ];
                    if let Some(name) = &actor.info.display_name {
                        profile.push(format!("Display Name: {name}"));
                    }
                    if let Some(bio) = &actor.info.description {
                        let bio = bio.replace(['\r', '\n'], " ");
                        profile.push(format!("Bio: {bio}"));
                    }
                    for line in profile {
                        framed
                            .send(server_reply("320", vec![
                                nick.into(),
                                target.clone(),
                                line,
                            ]))
                            .await?;
                    }
                } else if let Some(handle) = st.clients.get(target) {
                    // Live human session.
                    let user = handle.user.as_deref().unwrap_or(target);
                    let realname = handle.realname.as_deref().unwrap_or("");
                    framed
                        .send(server_reply("311", vec![
                            nick.into(),
                            target.clone(),
                            user.into(),
                            SERVER_NAME.clone(),
                            "*".into(),
                            realname.into(),
                        ]))
                        .await?;
                    framed
                        .send(server_reply("312", vec![
                            nick.into(),
                            target.clone(),
                            SERVER_NAME.clone(),
                            "Bluesky IRC Bridge".into(),
                        ]))
                        .await?;
                    if handle.joined {
                        framed
                            .send(server_reply("319", vec![
                                nick.into(),
                                target.clone(),
                                CHANNEL.into(),
                            ]))
                            .await?;
                    }
                } else {
                    let err = server_reply("401", vec![
                        nick.into(),
                        target.clone(),
                        "No such nick".into(),
                    ]);
                    framed.send(err).await?;
                }
                drop(st);
                // 318 is always sent.
                let end = server_reply(
                    "318",
                    vec![nick.into(), target.clone(), "End of /WHOIS list".into()],
                );
                framed.send(end).await?;
            }
        }

        "NAMES" => {
            if msg.params.first().map(String::as_str) == Some(CHANNEL) {
                let names = {
                    let st = state.read().await;
                    channel_names(&st)
                };
                send_names(framed, nick, &names).await?;
            }
        }

        "MODE" => {
            if let Some(target) = msg.params.first() {
                if target == CHANNEL {
                    // No moderation model — fixed channel modes.
                    let reply = server_reply(
                        "324",
                        vec![nick.into(), CHANNEL.into(), "+nt".into()],
                    );
                    framed.send(reply).await?;
                } else if target == nick {
                    let reply = server_reply("221", vec![nick.into(), "+".into()]);
                    framed.send(reply).await?;
                } else {
                    let err = server_reply("401", vec![
                        nick.into(),
                        target.clone(),
                        "No such nick/channel".into(),
                    ]);
                    framed.send(err).await?;
                }
            }
        }

        "TOPIC" => {
            if msg.params.first().map(String::as_str) == Some(CHANNEL) {
                if msg.params.len() >= 2 {
                    // Topic is fixed by the bridge.
                    let err = server_reply("482", vec![
                        nick.into(),
                        CHANNEL.into(),
                        "You're not channel operator".into(),
                    ]);
                    framed.send(err).await?;
                } else {
                    let topic = state.read().await.topic.clone();
                    let reply =
                        server_reply("332", vec![nick.into(), CHANNEL.into(), topic]);
                    framed.send(reply).await?;
                }
            }
        }

        "LIST" => {
            let (count, topic) = {
                let st = state.read().await;
                let humans = st.clients.values().filter(|handle| handle.joined).count();
                (humans + st.mapper.len(), st.topic.clone())
            };
            framed
                .send(server_reply(
                    "321",
                    vec![nick.into(), "Channel".into(), "Users  Name".into()],
                ))
                .await?;
            framed
                .send(server_reply(
                    "322",
                    vec![nick.into(), CHANNEL.into(), count.to_string(), topic],
                ))
                .await?;
            framed
                .send(server_reply("323", vec![nick.into(), "End of /LIST".into()]))
                .await?;
        }

        "QUIT" => {
            return Ok(CommandResult::Quit);
        }

        other => {
            warn!(nick, command = other, "unknown command");
            let err = server_reply(
                "421",
                vec![nick.into(), other.into(), "Unknown command".into()],
            );
            framed.send(err).await?;
        }
    }

    Ok(CommandResult::Ok)
}

/// Clean up when a client disconnects.
async fn cleanup_client(nick: &str, state: &SharedState) {
    let mut st = state.write().await;
    st.clients.remove(nick);
    let quit = Message::new(
        Some(hostmask(nick)),
        "QUIT",
        vec!["Connection closed".into()],
    );
    broadcast(&mut st, None, &quit);
    info!(nick, "cleaned up");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(nick: &str, tx: mpsc::Sender<Message>) -> ClientHandle {
        ClientHandle {
            nick: nick.into(),
            user: None,
            realname: None,
            addr: ([127, 0, 0, 1], 0u16).into(),
            joined: true,
            tx,
        }
    }

    #[test]
    fn history_ring_is_bounded() {
        let mut st = ServerState::new();
        for i in 0..(REPLAY_ITEMS + 10) {
            st.push_history(vec![Message::new(None, "PRIVMSG", vec![
                CHANNEL.into(),
                format!("post {i}"),
            ])]);
        }
        assert_eq!(st.history.len(), REPLAY_ITEMS);
        // Oldest entries were trimmed.
        let first = st.history().next().unwrap();
        assert_eq!(first.params[1], "post 10");
    }

    #[tokio::test]
    async fn broadcast_drops_overflowing_session() {
        let mut st = ServerState::new();
        let (full_tx, _full_rx) = mpsc::channel(1);
        let (ok_tx, mut ok_rx) = mpsc::channel(8);
        st.clients.insert("slow".into(), handle("slow", full_tx));
        st.clients.insert("fast".into(), handle("fast", ok_tx));

        let msg = Message::new(None, "PRIVMSG", vec![CHANNEL.into(), "one".into()]);
        broadcast(&mut st, None, &msg);
        // Second send overflows the slow client's single-slot queue.
        broadcast(&mut st, None, &msg);

        assert!(!st.clients.contains_key("slow"));
        assert!(st.clients.contains_key("fast"));
        assert_eq!(ok_rx.recv().await.unwrap().params[1], "one");
    }

    #[tokio::test]
    async fn direct_send_drops_overflowing_target() {
        let mut st = ServerState::new();
        let (full_tx, _full_rx) = mpsc::channel(1);
        st.clients.insert("slow".into(), handle("slow", full_tx));

        let msg = Message::new(None, "PRIVMSG", vec!["slow".into(), "hi".into()]);
        assert!(send_to(&mut st, "slow", &msg));
        // Second send overflows the single-slot queue; same policy as
        // broadcast: the session is dropped, not the message silently.
        assert!(send_to(&mut st, "slow", &msg));
        assert!(!st.clients.contains_key("slow"));
        assert!(!send_to(&mut st, "slow", &msg));
    }

    #[tokio::test]
    async fn broadcast_skips_parted_sessions() {
        let mut st = ServerState::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut parted = handle("parted", tx);
        parted.joined = false;
        st.clients.insert("parted".into(), parted);

        let msg = Message::new(None, "PRIVMSG", vec![CHANNEL.into(), "hi".into()]);
        broadcast(&mut st, None, &msg);
        assert!(rx.try_recv().is_err());
        assert!(st.clients.contains_key("parted"));
    }
}
