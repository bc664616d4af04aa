//! Conversations: per-protocol state machines multiplexed over one peer link.
//!
//! Each side registers a [`HandlerFactory`] per protocol name. A
//! [`ConversationMux`] (one per connected peer) owns the live conversations,
//! routes frames to them and turns their output into [`MuxAction`]s for the
//! host. No I/O happens here; time is passed in as `now`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::identity::PeerId;
use crate::protocol::{ChannelId, CloseCode, Frame, OpenOutcome};
use crate::relationship::{RelationshipStatus, Relationships};

/// Default limit of concurrent conversations per peer.
pub const DEFAULT_MAX_CHANNELS: usize = 16;

/// What a handler wants after processing an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Terminal success.
    Done,
    /// Terminal failure.
    Fail(String),
}

/// Why a conversation ended without its handler choosing to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// The remote refused the open.
    Refused(OpenOutcome),
    /// The remote closed the channel.
    Remote(CloseCode),
    TimedOut,
    Cancelled,
    Disconnected,
}

/// Final result of a conversation, reported once per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationOutcome {
    Completed,
    Failed(String),
    Interrupted(Interruption),
}

/// Handed to a handler on every call.
pub struct Ctx<E> {
    peer: PeerId,
    channel: ChannelId,
    now: Instant,
    deadline: Option<Instant>,
    sends: Vec<Vec<u8>>,
    events: Vec<E>,
}

impl<E> Ctx<E> {
    fn new(peer: PeerId, channel: ChannelId, now: Instant, deadline: Option<Instant>) -> Self {
        Self {
            peer,
            channel,
            now,
            deadline,
            sends: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Queue a payload for the remote side of this conversation.
    pub fn send(&mut self, payload: Vec<u8>) {
        self.sends.push(payload);
    }

    /// Report an application event to the host.
    pub fn emit(&mut self, event: E) {
        self.events.push(event);
    }

    /// Re-arm the conversation timer to fire `after` from now.
    pub fn set_timeout(&mut self, after: Duration) {
        self.deadline = Some(self.now + after);
    }

    pub fn clear_timeout(&mut self) {
        self.deadline = None;
    }
}

/// One side of a conversation. `E` is the event type reported to the host,
/// `S` the type of local signals fed in by the host.
pub trait Handler<E, S>: Send {
    /// Initiator only: the remote granted the open.
    fn on_open(&mut self, _ctx: &mut Ctx<E>) -> Step {
        Step::Continue
    }

    fn on_message(&mut self, ctx: &mut Ctx<E>, payload: &[u8]) -> Step;

    fn on_signal(&mut self, _ctx: &mut Ctx<E>, _signal: S) -> Step {
        Step::Continue
    }

    /// The conversation ended for a reason outside the handler's control.
    fn on_interrupted(&mut self, _ctx: &mut Ctx<E>, _why: Interruption) {}

    /// Short label of the current state, for logs.
    fn state(&self) -> &'static str;
}

/// Builds responder handlers for one protocol.
pub trait HandlerFactory<E, S>: Send + Sync {
    /// `None` refuses the conversation (`RequestDenied`).
    fn build(&self, peer: PeerId, status: RelationshipStatus) -> Option<Box<dyn Handler<E, S>>>;

    /// Inactivity timeout armed when a responder conversation is created.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("protocol {0} already registered")]
    Duplicate(String),
}

/// Protocol name → responder factory.
pub struct ProtocolRegistry<E, S> {
    factories: HashMap<String, Arc<dyn HandlerFactory<E, S>>>,
}

impl<E, S> Default for ProtocolRegistry<E, S> {
    fn default() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }
}

impl<E, S> ProtocolRegistry<E, S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn HandlerFactory<E, S>>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn HandlerFactory<E, S>>> {
        self.factories.get(name)
    }

    pub fn protocols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Output of the mux for the host to carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum MuxAction<E> {
    /// Write this frame to the peer link.
    Send(Frame),
    Event(E),
    /// A conversation ended and its slot is free.
    Closed {
        channel: ChannelId,
        protocol: String,
        outcome: ConversationOutcome,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OpenError {
    #[error("all {0} channel slots in use")]
    NoFreeChannel(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingReply,
    Open,
}

struct Conversation<E, S> {
    protocol: String,
    handler: Box<dyn Handler<E, S>>,
    phase: Phase,
    deadline: Option<Instant>,
}

/// Live conversations with one peer.
pub struct ConversationMux<E, S> {
    peer: PeerId,
    registry: Arc<ProtocolRegistry<E, S>>,
    relationships: Arc<Relationships>,
    max_channels: usize,
    next_channel: ChannelId,
    conversations: BTreeMap<ChannelId, Conversation<E, S>>,
}

impl<E, S> ConversationMux<E, S> {
    pub fn new(
        local: PeerId,
        peer: PeerId,
        registry: Arc<ProtocolRegistry<E, S>>,
        relationships: Arc<Relationships>,
        max_channels: usize,
    ) -> Self {
        // The lower id opens even channels, the higher odd ones.
        let first = if local < peer { 0 } else { 1 };
        Self {
            peer,
            registry,
            relationships,
            max_channels,
            next_channel: first,
            conversations: BTreeMap::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn active_channels(&self) -> usize {
        self.conversations.len()
    }

    /// State label of a live conversation.
    pub fn state_of(&self, channel: ChannelId) -> Option<&'static str> {
        self.conversations.get(&channel).map(|c| c.handler.state())
    }

    /// Start a conversation as initiator. The handler sees `on_open` once the
    /// remote grants it.
    pub fn open(
        &mut self,
        protocol: &str,
        handler: Box<dyn Handler<E, S>>,
        timeout: Option<Duration>,
        now: Instant,
    ) -> Result<(ChannelId, Vec<MuxAction<E>>), OpenError> {
        if self.conversations.len() >= self.max_channels {
            return Err(OpenError::NoFreeChannel(self.max_channels));
        }
        let channel = self.allocate_channel();
        self.conversations.insert(
            channel,
            Conversation {
                protocol: protocol.to_string(),
                handler,
                phase: Phase::AwaitingReply,
                deadline: timeout.map(|t| now + t),
            },
        );
        tracing::trace!(peer = %self.peer.short(), channel, protocol, "open");
        let frame = Frame::Open {
            channel,
            protocol: protocol.to_string(),
        };
        Ok((channel, vec![MuxAction::Send(frame)]))
    }

    pub fn on_frame(&mut self, frame: Frame, now: Instant) -> Vec<MuxAction<E>> {
        match frame {
            Frame::Open { channel, protocol } => self.on_remote_open(channel, protocol, now),
            Frame::OpenReply { channel, outcome } => self.on_open_reply(channel, outcome, now),
            Frame::Data { channel, payload } => self.on_data(channel, &payload, now),
            Frame::Close { channel, code } => {
                // Never answer a Close: the channel may simply be gone already.
                match self.conversations.remove(&channel) {
                    Some(conv) => self.interrupt(channel, conv, Interruption::Remote(code), now),
                    None => Vec::new(),
                }
            }
        }
    }

    /// Feed a local signal to a live conversation. Unknown channels are ignored.
    pub fn signal(&mut self, channel: ChannelId, signal: S, now: Instant) -> Vec<MuxAction<E>> {
        match self.conversations.get(&channel).map(|c| c.phase) {
            Some(Phase::Open) => self.drive(channel, now, |h, ctx| h.on_signal(ctx, signal)),
            Some(Phase::AwaitingReply) => {
                tracing::debug!(peer = %self.peer.short(), channel, "signal before open granted dropped");
                Vec::new()
            }
            None => {
                tracing::trace!(peer = %self.peer.short(), channel, "signal for closed channel");
                Vec::new()
            }
        }
    }

    pub fn cancel(&mut self, channel: ChannelId, now: Instant) -> Vec<MuxAction<E>> {
        let Some(conv) = self.conversations.remove(&channel) else {
            return Vec::new();
        };
        let mut actions = vec![MuxAction::Send(Frame::Close {
            channel,
            code: CloseCode::Cancelled,
        })];
        actions.extend(self.interrupt(channel, conv, Interruption::Cancelled, now));
        actions
    }

    /// Close every conversation whose timer expired at or before `now`.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<MuxAction<E>> {
        let expired: Vec<ChannelId> = self
            .conversations
            .iter()
            .filter(|(_, c)| c.deadline.is_some_and(|d| d <= now))
            .map(|(&ch, _)| ch)
            .collect();
        let mut actions = Vec::new();
        for channel in expired {
            let Some(conv) = self.conversations.remove(&channel) else {
                continue;
            };
            tracing::debug!(peer = %self.peer.short(), channel, protocol = %conv.protocol, state = conv.handler.state(), "conversation timed out");
            actions.push(MuxAction::Send(Frame::Close {
                channel,
                code: CloseCode::TimedOut,
            }));
            actions.extend(self.interrupt(channel, conv, Interruption::TimedOut, now));
        }
        actions
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.conversations.values().filter_map(|c| c.deadline).min()
    }

    /// The link is gone: end everything without sending frames.
    pub fn close_all(&mut self, now: Instant) -> Vec<MuxAction<E>> {
        let conversations = std::mem::take(&mut self.conversations);
        let mut actions = Vec::new();
        for (channel, conv) in conversations {
            actions.extend(self.interrupt(channel, conv, Interruption::Disconnected, now));
        }
        actions
    }

    fn allocate_channel(&mut self) -> ChannelId {
        loop {
            let id = self.next_channel;
            self.next_channel = self.next_channel.wrapping_add(2);
            if !self.conversations.contains_key(&id) {
                return id;
            }
        }
    }

    fn is_remote_channel(&self, channel: ChannelId) -> bool {
        channel % 2 != self.next_channel % 2
    }

    fn on_remote_open(&mut self, channel: ChannelId, protocol: String, now: Instant) -> Vec<MuxAction<E>> {
        let reply = |outcome| {
            vec![MuxAction::Send(Frame::OpenReply { channel, outcome })]
        };
        if !self.is_remote_channel(channel) || self.conversations.contains_key(&channel) {
            tracing::debug!(peer = %self.peer.short(), channel, "open on invalid channel");
            return reply(OpenOutcome::UnexpectedResponse);
        }
        let Some(factory) = self.registry.get(&protocol).cloned() else {
            tracing::debug!(peer = %self.peer.short(), %protocol, "unrecognized protocol");
            return reply(OpenOutcome::UnrecognizedProtocol);
        };
        if self.conversations.len() >= self.max_channels {
            return reply(OpenOutcome::UnavailableChannel);
        }
        let status = self.relationships.status(&self.peer);
        let Some(handler) = factory.build(self.peer, status) else {
            tracing::debug!(peer = %self.peer.short(), %protocol, ?status, "open denied");
            return reply(OpenOutcome::RequestDenied);
        };
        self.conversations.insert(
            channel,
            Conversation {
                protocol,
                handler,
                phase: Phase::Open,
                deadline: factory.timeout().map(|t| now + t),
            },
        );
        reply(OpenOutcome::Granted)
    }

    fn on_open_reply(&mut self, channel: ChannelId, outcome: OpenOutcome, now: Instant) -> Vec<MuxAction<E>> {
        let phase = self.conversations.get(&channel).map(|c| c.phase);
        if phase != Some(Phase::AwaitingReply) {
            return self.unexpected(channel, now);
        }
        if outcome == OpenOutcome::Granted {
            if let Some(conv) = self.conversations.get_mut(&channel) {
                conv.phase = Phase::Open;
            }
            return self.drive(channel, now, |h, ctx| h.on_open(ctx));
        }
        match self.conversations.remove(&channel) {
            Some(conv) => self.interrupt(channel, conv, Interruption::Refused(outcome), now),
            None => Vec::new(),
        }
    }

    fn on_data(&mut self, channel: ChannelId, payload: &[u8], now: Instant) -> Vec<MuxAction<E>> {
        match self.conversations.get(&channel).map(|c| c.phase) {
            Some(Phase::Open) => self.drive(channel, now, |h, ctx| h.on_message(ctx, payload)),
            _ => self.unexpected(channel, now),
        }
    }

    /// Answer a frame that makes no sense for `channel`; ends the
    /// conversation if one exists.
    fn unexpected(&mut self, channel: ChannelId, now: Instant) -> Vec<MuxAction<E>> {
        tracing::debug!(peer = %self.peer.short(), channel, "unexpected frame");
        let mut actions = vec![MuxAction::Send(Frame::Close {
            channel,
            code: CloseCode::UnexpectedResponse,
        })];
        if let Some(conv) = self.conversations.remove(&channel) {
            actions.extend(self.interrupt(
                channel,
                conv,
                Interruption::Remote(CloseCode::UnexpectedResponse),
                now,
            ));
        }
        actions
    }

    /// Run one handler callback and translate its output.
    fn drive<F>(&mut self, channel: ChannelId, now: Instant, f: F) -> Vec<MuxAction<E>>
    where
        F: FnOnce(&mut dyn Handler<E, S>, &mut Ctx<E>) -> Step,
    {
        let peer = self.peer;
        let Some(conv) = self.conversations.get_mut(&channel) else {
            return Vec::new();
        };
        let mut ctx = Ctx::new(peer, channel, now, conv.deadline);
        let step = f(conv.handler.as_mut(), &mut ctx);
        conv.deadline = ctx.deadline;

        let mut actions = flush(channel, ctx);
        let (code, outcome) = match step {
            Step::Continue => return actions,
            Step::Done => (CloseCode::Done, ConversationOutcome::Completed),
            Step::Fail(reason) => {
                tracing::debug!(peer = %peer.short(), channel, %reason, "conversation failed");
                (CloseCode::Failed, ConversationOutcome::Failed(reason))
            }
        };
        let protocol = match self.conversations.remove(&channel) {
            Some(conv) => conv.protocol,
            None => String::new(),
        };
        actions.push(MuxAction::Send(Frame::Close { channel, code }));
        actions.push(MuxAction::Closed {
            channel,
            protocol,
            outcome,
        });
        actions
    }

    fn interrupt(
        &self,
        channel: ChannelId,
        mut conv: Conversation<E, S>,
        why: Interruption,
        now: Instant,
    ) -> Vec<MuxAction<E>> {
        let mut ctx = Ctx::new(self.peer, channel, now, None);
        conv.handler.on_interrupted(&mut ctx, why);
        // Sends are meaningless once the channel is gone; keep only events.
        let mut actions: Vec<MuxAction<E>> = ctx.events.into_iter().map(MuxAction::Event).collect();
        actions.push(MuxAction::Closed {
            channel,
            protocol: conv.protocol,
            outcome: ConversationOutcome::Interrupted(why),
        });
        actions
    }
}

fn flush<E>(channel: ChannelId, ctx: Ctx<E>) -> Vec<MuxAction<E>> {
    let mut actions: Vec<MuxAction<E>> = ctx
        .sends
        .into_iter()
        .map(|payload| MuxAction::Send(Frame::Data { channel, payload }))
        .collect();
    actions.extend(ctx.events.into_iter().map(MuxAction::Event));
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    /// Echo protocol: responder echoes each payload; the initiator sends
    /// "ping" on open and finishes on the echo.
    struct Pinger;
    struct Echo;

    impl Handler<String, ()> for Pinger {
        fn on_open(&mut self, ctx: &mut Ctx<String>) -> Step {
            ctx.send(b"ping".to_vec());
            Step::Continue
        }
        fn on_message(&mut self, ctx: &mut Ctx<String>, payload: &[u8]) -> Step {
            ctx.emit(String::from_utf8_lossy(payload).into_owned());
            Step::Done
        }
        fn on_interrupted(&mut self, ctx: &mut Ctx<String>, why: Interruption) {
            ctx.emit(format!("interrupted: {why:?}"));
        }
        fn state(&self) -> &'static str {
            "pinging"
        }
    }

    impl Handler<String, ()> for Echo {
        fn on_message(&mut self, ctx: &mut Ctx<String>, payload: &[u8]) -> Step {
            ctx.send(payload.to_vec());
            Step::Continue
        }
        fn state(&self) -> &'static str {
            "echoing"
        }
    }

    struct EchoFactory {
        timeout: Option<Duration>,
    }

    impl HandlerFactory<String, ()> for EchoFactory {
        fn build(&self, _peer: PeerId, status: RelationshipStatus) -> Option<Box<dyn Handler<String, ()>>> {
            if status.is_blocked() {
                return None;
            }
            Some(Box::new(Echo))
        }
        fn timeout(&self) -> Option<Duration> {
            self.timeout
        }
    }

    struct Pair {
        a: ConversationMux<String, ()>,
        b: ConversationMux<String, ()>,
        b_relationships: Arc<Relationships>,
    }

    fn pair(max_channels: usize) -> Pair {
        let ka = Keypair::generate();
        let kb = Keypair::generate();
        let mut registry: ProtocolRegistry<String, ()> = ProtocolRegistry::new();
        registry
            .register("echo", Arc::new(EchoFactory { timeout: None }))
            .unwrap();
        let registry = Arc::new(registry);
        let b_relationships = Arc::new(Relationships::new());
        Pair {
            a: ConversationMux::new(
                ka.peer_id(),
                kb.peer_id(),
                registry.clone(),
                Arc::new(Relationships::new()),
                max_channels,
            ),
            b: ConversationMux::new(
                kb.peer_id(),
                ka.peer_id(),
                registry,
                b_relationships.clone(),
                max_channels,
            ),
            b_relationships,
        }
    }

    /// Deliver frames back and forth until quiet; returns non-send actions
    /// seen on side a and side b.
    fn pump(
        pair: &mut Pair,
        initial: Vec<MuxAction<String>>,
        now: Instant,
    ) -> (Vec<MuxAction<String>>, Vec<MuxAction<String>>) {
        let mut to_b: Vec<Frame> = Vec::new();
        let mut to_a: Vec<Frame> = Vec::new();
        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        let split = |actions: Vec<MuxAction<String>>, out: &mut Vec<Frame>, seen: &mut Vec<MuxAction<String>>| {
            for a in actions {
                match a {
                    MuxAction::Send(f) => out.push(f),
                    other => seen.push(other),
                }
            }
        };
        split(initial, &mut to_b, &mut seen_a);
        while !to_a.is_empty() || !to_b.is_empty() {
            for f in std::mem::take(&mut to_b) {
                let out = pair.b.on_frame(f, now);
                split(out, &mut to_a, &mut seen_b);
            }
            for f in std::mem::take(&mut to_a) {
                let out = pair.a.on_frame(f, now);
                split(out, &mut to_b, &mut seen_a);
            }
        }
        (seen_a, seen_b)
    }

    #[test]
    fn ping_echo_completes() {
        let mut p = pair(4);
        let now = Instant::now();
        let (ch, actions) = p.a.open("echo", Box::new(Pinger), None, now).unwrap();
        let (seen_a, _) = pump(&mut p, actions, now);
        assert_eq!(
            seen_a,
            vec![
                MuxAction::Event("ping".to_string()),
                MuxAction::Closed {
                    channel: ch,
                    protocol: "echo".to_string(),
                    outcome: ConversationOutcome::Completed
                }
            ]
        );
        assert_eq!(p.a.active_channels(), 0);
        // b saw Close{Done} and released its slot too.
        assert_eq!(p.b.active_channels(), 0);
    }

    #[test]
    fn channel_parity_differs_between_sides() {
        let mut p = pair(4);
        let now = Instant::now();
        let (ca, _) = p.a.open("echo", Box::new(Pinger), None, now).unwrap();
        let (cb, _) = p.b.open("echo", Box::new(Pinger), None, now).unwrap();
        assert_ne!(ca % 2, cb % 2);
    }

    #[test]
    fn unknown_protocol_refused() {
        let mut p = pair(4);
        let now = Instant::now();
        let (_, actions) = p.a.open("nope", Box::new(Pinger), None, now).unwrap();
        let (seen_a, _) = pump(&mut p, actions, now);
        assert!(seen_a.iter().any(|a| matches!(
            a,
            MuxAction::Closed {
                outcome: ConversationOutcome::Interrupted(Interruption::Refused(
                    OpenOutcome::UnrecognizedProtocol
                )),
                ..
            }
        )));
    }

    #[test]
    fn blocked_peer_denied() {
        let mut p = pair(4);
        let now = Instant::now();
        p.b_relationships
            .set(p.peer_of_a(), RelationshipStatus::Blocked);
        let (_, actions) = p.a.open("echo", Box::new(Pinger), None, now).unwrap();
        let (seen_a, _) = pump(&mut p, actions, now);
        assert!(seen_a.iter().any(|a| matches!(
            a,
            MuxAction::Closed {
                outcome: ConversationOutcome::Interrupted(Interruption::Refused(
                    OpenOutcome::RequestDenied
                )),
                ..
            }
        )));
        assert_eq!(p.b.active_channels(), 0);
    }

    impl Pair {
        fn peer_of_a(&self) -> PeerId {
            self.b.peer()
        }
    }

    #[test]
    fn slot_limit_enforced_both_ways() {
        let mut p = pair(1);
        let now = Instant::now();
        let (_, first) = p.a.open("echo", Box::new(Pinger), None, now).unwrap();
        assert_eq!(
            p.a.open("echo", Box::new(Pinger), None, now).unwrap_err(),
            OpenError::NoFreeChannel(1)
        );
        // Deliver the first open to b, which takes b's only slot.
        for a in first {
            if let MuxAction::Send(f) = a {
                p.b.on_frame(f, now);
            }
        }
        assert_eq!(p.b.active_channels(), 1);
        let second = p.a_second_open(now);
        let replies = p.b.on_frame(second, now);
        assert!(matches!(
            replies.as_slice(),
            [MuxAction::Send(Frame::OpenReply {
                outcome: OpenOutcome::UnavailableChannel,
                ..
            })]
        ));
    }

    impl Pair {
        /// Open frame a would send for its next channel, bypassing a's own limit.
        fn a_second_open(&mut self, _now: Instant) -> Frame {
            let channel = self.a.allocate_channel();
            Frame::Open {
                channel,
                protocol: "echo".to_string(),
            }
        }
    }

    #[test]
    fn silent_remote_times_out_after_5000ms() {
        let mut p = pair(4);
        let t0 = Instant::now();
        let timeout = Duration::from_millis(5000);
        let (ch, _) = p.a.open("echo", Box::new(Pinger), Some(timeout), t0).unwrap();
        assert_eq!(p.a.next_deadline(), Some(t0 + timeout));
        assert!(p.a.poll_timeouts(t0 + Duration::from_millis(4999)).is_empty());

        let actions = p.a.poll_timeouts(t0 + timeout);
        assert_eq!(
            actions,
            vec![
                MuxAction::Send(Frame::Close {
                    channel: ch,
                    code: CloseCode::TimedOut
                }),
                MuxAction::Event("interrupted: TimedOut".to_string()),
                MuxAction::Closed {
                    channel: ch,
                    protocol: "echo".to_string(),
                    outcome: ConversationOutcome::Interrupted(Interruption::TimedOut)
                },
            ]
        );
        assert_eq!(p.a.active_channels(), 0);
        assert_eq!(p.a.next_deadline(), None);
    }

    #[test]
    fn data_on_unknown_channel_answered_with_unexpected() {
        let mut p = pair(4);
        let now = Instant::now();
        let actions = p.b.on_frame(
            Frame::Data {
                channel: 99,
                payload: vec![1],
            },
            now,
        );
        assert_eq!(
            actions,
            vec![MuxAction::Send(Frame::Close {
                channel: 99,
                code: CloseCode::UnexpectedResponse
            })]
        );
        // A close for an unknown channel is dropped silently.
        assert!(p
            .b
            .on_frame(
                Frame::Close {
                    channel: 99,
                    code: CloseCode::Done
                },
                now
            )
            .is_empty());
    }

    #[test]
    fn close_all_interrupts_everything_without_frames() {
        let mut p = pair(4);
        let now = Instant::now();
        p.a.open("echo", Box::new(Pinger), None, now).unwrap();
        p.a.open("echo", Box::new(Pinger), None, now).unwrap();
        let actions = p.a.close_all(now);
        assert!(actions.iter().all(|a| !matches!(a, MuxAction::Send(_))));
        assert_eq!(
            actions
                .iter()
                .filter(|a| matches!(a, MuxAction::Closed { .. }))
                .count(),
            2
        );
        assert_eq!(p.a.active_channels(), 0);
    }

    #[test]
    fn cancel_sends_close_and_frees_slot() {
        let mut p = pair(4);
        let now = Instant::now();
        let (ch, _) = p.a.open("echo", Box::new(Pinger), None, now).unwrap();
        let actions = p.a.cancel(ch, now);
        assert_eq!(
            actions[0],
            MuxAction::Send(Frame::Close {
                channel: ch,
                code: CloseCode::Cancelled
            })
        );
        assert_eq!(p.a.active_channels(), 0);
        assert!(p.a.cancel(ch, now).is_empty());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry: ProtocolRegistry<String, ()> = ProtocolRegistry::new();
        registry
            .register("echo", Arc::new(EchoFactory { timeout: None }))
            .unwrap();
        assert!(registry
            .register("echo", Arc::new(EchoFactory { timeout: None }))
            .is_err());
        assert_eq!(registry.protocols(), vec!["echo"]);
    }

    #[test]
    fn responder_timeout_comes_from_factory() {
        let ka = Keypair::generate();
        let kb = Keypair::generate();
        let mut registry: ProtocolRegistry<String, ()> = ProtocolRegistry::new();
        registry
            .register(
                "echo",
                Arc::new(EchoFactory {
                    timeout: Some(Duration::from_secs(1)),
                }),
            )
            .unwrap();
        let mut b: ConversationMux<String, ()> = ConversationMux::new(
            kb.peer_id(),
            ka.peer_id(),
            Arc::new(registry),
            Arc::new(Relationships::new()),
            4,
        );
        let now = Instant::now();
        let channel = if ka.peer_id() < kb.peer_id() { 0 } else { 1 };
        b.on_frame(
            Frame::Open {
                channel,
                protocol: "echo".to_string(),
            },
            now,
        );
        assert_eq!(b.state_of(channel), Some("echoing"));
        assert_eq!(b.next_deadline(), Some(now + Duration::from_secs(1)));
    }
}
