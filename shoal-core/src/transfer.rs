//! Resource transfer and inventory protocols, built on the conversation mux.
//!
//! A downloader opens one probe per provider (`Query` → `Have`/`NotFound`)
//! and then fetch conversations for concrete ranges. The uploader side
//! answers with a [`ServeHandler`], which waits for the upload coordinator's
//! grant and streams chunks one at a time as the host paces it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conversation::{Ctx, Handler, HandlerFactory, Interruption, Step};
use crate::identity::PeerId;
use crate::integrity::{hash_chunk, verify_chunk};
use crate::interval::{Interval, IntervalSet};
use crate::protocol::ChannelId;
use crate::relationship::RelationshipStatus;
use crate::resource::{ResourceKey, ResourceStore};
use crate::wire;

pub const TRANSFER_PROTOCOL: &str = "shoal/transfer/1";
pub const INVENTORY_PROTOCOL: &str = "shoal/inventory/1";

/// Default bytes per `Chunk` message.
pub const DEFAULT_CHUNK_LEN: u64 = 64 * 1024;

/// Identifies one range request of a download session.
pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMessage {
    Query {
        resource: ResourceKey,
    },
    Have {
        total_size: u64,
        available: IntervalSet,
    },
    NotFound,
    Request {
        resource: ResourceKey,
        range: Interval,
    },
    /// Append a range that starts right after the last requested byte.
    Extend {
        range: Interval,
    },
    /// The request waits for an upload slot.
    Queued,
    Chunk {
        offset: u64,
        hash: [u8; 32],
        data: Vec<u8>,
    },
    Unavailable {
        range: Interval,
    },
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryMessage {
    Announce { resources: Vec<ResourceKey> },
    Withdraw { resources: Vec<ResourceKey> },
}

/// Why a fetch ended early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// The provider does not hold the range (any more).
    Unavailable(Interval),
    /// A chunk failed its hash check.
    Integrity { offset: u64 },
    Protocol(String),
    Interrupted(Interruption),
}

/// Events reported to the host by transfer and inventory conversations.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Availability {
        peer: PeerId,
        resource: ResourceKey,
        total_size: u64,
        available: IntervalSet,
    },
    ProbeFailed {
        peer: PeerId,
        resource: ResourceKey,
        reason: String,
    },
    Chunk {
        peer: PeerId,
        resource: ResourceKey,
        request: RequestId,
        offset: u64,
        data: Vec<u8>,
    },
    RequestDone {
        peer: PeerId,
        resource: ResourceKey,
        request: RequestId,
    },
    RequestFailed {
        peer: PeerId,
        resource: ResourceKey,
        request: RequestId,
        reason: FetchFailure,
    },
    /// A remote asks us for bytes; the host must admit it with the upload coordinator.
    UploadRequested {
        peer: PeerId,
        channel: ChannelId,
        resource: ResourceKey,
        range: Interval,
    },
    /// A granted upload sent a chunk and has `next_len` more bytes ready.
    UploadReady {
        peer: PeerId,
        channel: ChannelId,
        next_len: u64,
    },
    Inventory {
        peer: PeerId,
        added: Vec<ResourceKey>,
        removed: Vec<ResourceKey>,
    },
}

/// Local inputs to transfer conversations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferSignal {
    /// Fetch: ask for a further contiguous range on the same conversation.
    Extend(Interval),
    /// Serve: the request was queued behind other uploads.
    Queued,
    /// Serve: an upload slot was granted.
    Grant,
    /// Serve: bandwidth allows the next chunk.
    SendNext,
}

fn send<T: Serialize, E>(ctx: &mut Ctx<E>, msg: &T) -> Result<(), String> {
    let payload = wire::encode_payload(msg).map_err(|e| e.to_string())?;
    ctx.send(payload);
    Ok(())
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, String> {
    wire::decode_payload(payload).map_err(|e| format!("malformed message: {e}"))
}

/// Initiator: asks one provider for the size and held ranges of a resource.
pub struct ProbeHandler {
    resource: ResourceKey,
    answered: bool,
}

impl ProbeHandler {
    pub fn new(resource: ResourceKey) -> Self {
        Self {
            resource,
            answered: false,
        }
    }

    fn failed(&self, ctx: &mut Ctx<TransferEvent>, reason: String) {
        let event = TransferEvent::ProbeFailed {
            peer: ctx.peer(),
            resource: self.resource.clone(),
            reason,
        };
        ctx.emit(event);
    }
}

impl Handler<TransferEvent, TransferSignal> for ProbeHandler {
    fn on_open(&mut self, ctx: &mut Ctx<TransferEvent>) -> Step {
        let query = TransferMessage::Query {
            resource: self.resource.clone(),
        };
        match send(ctx, &query) {
            Ok(()) => Step::Continue,
            Err(e) => Step::Fail(e),
        }
    }

    fn on_message(&mut self, ctx: &mut Ctx<TransferEvent>, payload: &[u8]) -> Step {
        self.answered = true;
        match decode::<TransferMessage>(payload) {
            Ok(TransferMessage::Have {
                total_size,
                available,
            }) => {
                let event = TransferEvent::Availability {
                    peer: ctx.peer(),
                    resource: self.resource.clone(),
                    total_size,
                    available,
                };
                ctx.emit(event);
                Step::Done
            }
            Ok(TransferMessage::NotFound) => {
                self.failed(ctx, "not found".to_string());
                Step::Done
            }
            Ok(other) => {
                let reason = format!("unexpected probe answer {other:?}");
                self.failed(ctx, reason.clone());
                Step::Fail(reason)
            }
            Err(e) => {
                self.failed(ctx, e.clone());
                Step::Fail(e)
            }
        }
    }

    fn on_interrupted(&mut self, ctx: &mut Ctx<TransferEvent>, why: Interruption) {
        if !self.answered {
            self.failed(ctx, format!("{why:?}"));
        }
    }

    fn state(&self) -> &'static str {
        if self.answered {
            "answered"
        } else {
            "querying"
        }
    }
}

/// Initiator: receives the bytes of one or more contiguous ranges.
pub struct FetchHandler {
    resource: ResourceKey,
    request: RequestId,
    /// Ranges still expected, in order. The front one is being received.
    pending: VecDeque<Interval>,
    next_offset: u64,
    idle_timeout: Option<Duration>,
    finished: bool,
}

impl FetchHandler {
    pub fn new(resource: ResourceKey, request: RequestId, range: Interval) -> Self {
        Self {
            resource,
            request,
            next_offset: range.min(),
            pending: VecDeque::from([range]),
            idle_timeout: None,
            finished: false,
        }
    }

    /// Re-arm the timer with `timeout` whenever data arrives.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    fn end(&self) -> Option<u64> {
        self.pending.back().map(|r| r.max())
    }

    fn fail(&mut self, ctx: &mut Ctx<TransferEvent>, reason: FetchFailure) -> Step {
        self.finished = true;
        let step = Step::Fail(format!("{reason:?}"));
        ctx.emit(TransferEvent::RequestFailed {
            peer: ctx.peer(),
            resource: self.resource.clone(),
            request: self.request,
            reason,
        });
        step
    }

    fn on_chunk(&mut self, ctx: &mut Ctx<TransferEvent>, offset: u64, hash: [u8; 32], data: Vec<u8>) -> Step {
        let Some(current) = self.pending.front().copied() else {
            return self.fail(ctx, FetchFailure::Protocol("chunk after last range".into()));
        };
        if data.is_empty() || offset != self.next_offset {
            return self.fail(ctx, FetchFailure::Protocol(format!("chunk at {offset}, expected {}", self.next_offset)));
        }
        let last = offset + data.len() as u64 - 1;
        if last > current.max() {
            return self.fail(ctx, FetchFailure::Protocol(format!("chunk past {}", current.max())));
        }
        if !verify_chunk(&data, &hash) {
            return self.fail(ctx, FetchFailure::Integrity { offset });
        }
        if last == current.max() {
            self.pending.pop_front();
            self.next_offset = self.pending.front().map_or(last + 1, |r| r.min());
        } else {
            self.next_offset = last + 1;
        }
        if let Some(t) = self.idle_timeout {
            ctx.set_timeout(t);
        }
        ctx.emit(TransferEvent::Chunk {
            peer: ctx.peer(),
            resource: self.resource.clone(),
            request: self.request,
            offset,
            data,
        });
        Step::Continue
    }
}

impl Handler<TransferEvent, TransferSignal> for FetchHandler {
    fn on_open(&mut self, ctx: &mut Ctx<TransferEvent>) -> Step {
        let Some(&range) = self.pending.front() else {
            return Step::Done;
        };
        let msg = TransferMessage::Request {
            resource: self.resource.clone(),
            range,
        };
        match send(ctx, &msg) {
            Ok(()) => Step::Continue,
            Err(e) => self.fail(ctx, FetchFailure::Protocol(e)),
        }
    }

    fn on_message(&mut self, ctx: &mut Ctx<TransferEvent>, payload: &[u8]) -> Step {
        match decode::<TransferMessage>(payload) {
            Ok(TransferMessage::Chunk { offset, hash, data }) => self.on_chunk(ctx, offset, hash, data),
            Ok(TransferMessage::Queued) => {
                ctx.clear_timeout();
                Step::Continue
            }
            Ok(TransferMessage::Done) => {
                // The server may drain before an extension reaches it; whatever is
                // still pending goes back to the caller as unserved.
                if !self.pending.is_empty() {
                    tracing::debug!(request = self.request, from = self.next_offset, "served short");
                }
                self.finished = true;
                ctx.emit(TransferEvent::RequestDone {
                    peer: ctx.peer(),
                    resource: self.resource.clone(),
                    request: self.request,
                });
                Step::Done
            }
            Ok(TransferMessage::Unavailable { range }) => self.fail(ctx, FetchFailure::Unavailable(range)),
            Ok(other) => self.fail(ctx, FetchFailure::Protocol(format!("unexpected {other:?}"))),
            Err(e) => self.fail(ctx, FetchFailure::Protocol(e)),
        }
    }

    fn on_signal(&mut self, ctx: &mut Ctx<TransferEvent>, signal: TransferSignal) -> Step {
        let TransferSignal::Extend(range) = signal else {
            return Step::Continue;
        };
        let contiguous = match self.end() {
            Some(end) => range.min() == end + 1,
            // Everything requested so far has arrived.
            None => range.min() == self.next_offset,
        };
        if !contiguous {
            tracing::warn!(request = self.request, %range, "non-contiguous extension ignored");
            return Step::Continue;
        }
        if self.pending.is_empty() {
            self.next_offset = range.min();
        }
        self.pending.push_back(range);
        match send(ctx, &TransferMessage::Extend { range }) {
            Ok(()) => Step::Continue,
            Err(e) => self.fail(ctx, FetchFailure::Protocol(e)),
        }
    }

    fn on_interrupted(&mut self, ctx: &mut Ctx<TransferEvent>, why: Interruption) {
        if !self.finished {
            self.fail(ctx, FetchFailure::Interrupted(why));
        }
    }

    fn state(&self) -> &'static str {
        if self.finished {
            "finished"
        } else if self.pending.is_empty() {
            "draining"
        } else {
            "receiving"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServeState {
    Idle,
    AwaitingGrant,
    Streaming,
}

/// Responder: answers probes and streams granted ranges from a [`ResourceStore`].
pub struct ServeHandler {
    store: Arc<dyn ResourceStore>,
    chunk_len: u64,
    idle_timeout: Option<Duration>,
    state: ServeState,
    resource: Option<ResourceKey>,
    queue: VecDeque<Interval>,
}

impl ServeHandler {
    pub fn new(store: Arc<dyn ResourceStore>, chunk_len: u64, idle_timeout: Option<Duration>) -> Self {
        Self {
            store,
            chunk_len: chunk_len.max(1),
            idle_timeout,
            state: ServeState::Idle,
            resource: None,
            queue: VecDeque::new(),
        }
    }

    fn servable(&self, resource: &ResourceKey, range: Interval) -> bool {
        match self.store.total_size(resource) {
            Some(total) => range.max() < total && self.store.available(resource).covers(&range),
            None => false,
        }
    }

    fn refuse(&mut self, ctx: &mut Ctx<TransferEvent>, range: Interval) -> Step {
        if let Err(e) = send(ctx, &TransferMessage::Unavailable { range }) {
            return Step::Fail(e);
        }
        Step::Fail(format!("range {range} unavailable"))
    }

    fn on_query(&mut self, ctx: &mut Ctx<TransferEvent>, resource: ResourceKey) -> Step {
        let answer = match self.store.total_size(&resource) {
            Some(total_size) => TransferMessage::Have {
                total_size,
                available: self.store.available(&resource),
            },
            None => TransferMessage::NotFound,
        };
        match send(ctx, &answer) {
            Ok(()) => Step::Done,
            Err(e) => Step::Fail(e),
        }
    }

    fn on_request(&mut self, ctx: &mut Ctx<TransferEvent>, resource: ResourceKey, range: Interval) -> Step {
        if !self.servable(&resource, range) {
            tracing::debug!(peer = %ctx.peer().short(), %resource, %range, "requested range unavailable");
            return self.refuse(ctx, range);
        }
        self.state = ServeState::AwaitingGrant;
        self.queue.push_back(range);
        self.resource = Some(resource.clone());
        // Waiting for a slot has no deadline; the link going away ends it.
        ctx.clear_timeout();
        ctx.emit(TransferEvent::UploadRequested {
            peer: ctx.peer(),
            channel: ctx.channel(),
            resource,
            range,
        });
        Step::Continue
    }

    fn on_extend(&mut self, ctx: &mut Ctx<TransferEvent>, range: Interval) -> Step {
        let Some(resource) = self.resource.clone() else {
            return Step::Fail("extend without request".into());
        };
        if !self.servable(&resource, range) {
            return self.refuse(ctx, range);
        }
        self.queue.push_back(range);
        Step::Continue
    }

    /// Send the next chunk, or `Done` once the queue is empty.
    fn send_next(&mut self, ctx: &mut Ctx<TransferEvent>) -> Step {
        let Some(resource) = self.resource.clone() else {
            return Step::Fail("no resource".into());
        };
        let Some(current) = self.queue.pop_front() else {
            return match send(ctx, &TransferMessage::Done) {
                Ok(()) => Step::Done,
                Err(e) => Step::Fail(e),
            };
        };
        let len = current.len().min(self.chunk_len);
        let (chunk, rest) = match Interval::with_len(current.min(), len) {
            Ok(chunk) if chunk.max() < current.max() => (chunk, Interval::new(chunk.max() + 1, current.max()).ok()),
            Ok(chunk) => (chunk, None),
            Err(e) => return Step::Fail(e.to_string()),
        };
        if let Some(rest) = rest {
            self.queue.push_front(rest);
        }
        let data = match self.store.read(&resource, chunk) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(%resource, range = %chunk, error = %e, "read failed while serving");
                return Step::Fail(format!("read {chunk}: {e}"));
            }
        };
        let msg = TransferMessage::Chunk {
            offset: chunk.min(),
            hash: hash_chunk(&data),
            data,
        };
        if let Err(e) = send(ctx, &msg) {
            return Step::Fail(e);
        }
        if let Some(t) = self.idle_timeout {
            ctx.set_timeout(t);
        }
        match self.queue.front() {
            Some(next) => {
                ctx.emit(TransferEvent::UploadReady {
                    peer: ctx.peer(),
                    channel: ctx.channel(),
                    next_len: next.len().min(self.chunk_len),
                });
                Step::Continue
            }
            None => match send(ctx, &TransferMessage::Done) {
                Ok(()) => Step::Done,
                Err(e) => Step::Fail(e),
            },
        }
    }
}

impl Handler<TransferEvent, TransferSignal> for ServeHandler {
    fn on_message(&mut self, ctx: &mut Ctx<TransferEvent>, payload: &[u8]) -> Step {
        let msg = match decode::<TransferMessage>(payload) {
            Ok(msg) => msg,
            Err(e) => return Step::Fail(e),
        };
        match (self.state, msg) {
            (ServeState::Idle, TransferMessage::Query { resource }) => self.on_query(ctx, resource),
            (ServeState::Idle, TransferMessage::Request { resource, range }) => {
                self.on_request(ctx, resource, range)
            }
            (ServeState::AwaitingGrant | ServeState::Streaming, TransferMessage::Extend { range }) => {
                self.on_extend(ctx, range)
            }
            (state, other) => Step::Fail(format!("unexpected {other:?} while {state:?}")),
        }
    }

    fn on_signal(&mut self, ctx: &mut Ctx<TransferEvent>, signal: TransferSignal) -> Step {
        match (self.state, signal) {
            (ServeState::AwaitingGrant, TransferSignal::Queued) => match send(ctx, &TransferMessage::Queued) {
                Ok(()) => Step::Continue,
                Err(e) => Step::Fail(e),
            },
            (ServeState::AwaitingGrant, TransferSignal::Grant) => {
                self.state = ServeState::Streaming;
                self.send_next(ctx)
            }
            (ServeState::Streaming, TransferSignal::SendNext) => self.send_next(ctx),
            (state, signal) => {
                tracing::debug!(?state, ?signal, "signal ignored");
                Step::Continue
            }
        }
    }

    fn state(&self) -> &'static str {
        match self.state {
            ServeState::Idle => "idle",
            ServeState::AwaitingGrant => "awaiting-grant",
            ServeState::Streaming => "streaming",
        }
    }
}

/// Builds [`ServeHandler`]s; refuses blocked peers.
pub struct TransferFactory {
    store: Arc<dyn ResourceStore>,
    chunk_len: u64,
    timeout: Option<Duration>,
}

impl TransferFactory {
    pub fn new(store: Arc<dyn ResourceStore>, chunk_len: u64, timeout: Option<Duration>) -> Self {
        Self {
            store,
            chunk_len,
            timeout,
        }
    }
}

impl HandlerFactory<TransferEvent, TransferSignal> for TransferFactory {
    fn build(
        &self,
        peer: PeerId,
        status: RelationshipStatus,
    ) -> Option<Box<dyn Handler<TransferEvent, TransferSignal>>> {
        if status.is_blocked() {
            tracing::debug!(peer = %peer.short(), "transfer refused for blocked peer");
            return None;
        }
        Some(Box::new(ServeHandler::new(
            self.store.clone(),
            self.chunk_len,
            self.timeout,
        )))
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Initiator: sends one inventory message and finishes.
pub struct AnnounceHandler {
    message: Option<InventoryMessage>,
}

impl AnnounceHandler {
    pub fn announce(resources: Vec<ResourceKey>) -> Self {
        Self {
            message: Some(InventoryMessage::Announce { resources }),
        }
    }

    pub fn withdraw(resources: Vec<ResourceKey>) -> Self {
        Self {
            message: Some(InventoryMessage::Withdraw { resources }),
        }
    }
}

impl Handler<TransferEvent, TransferSignal> for AnnounceHandler {
    fn on_open(&mut self, ctx: &mut Ctx<TransferEvent>) -> Step {
        let Some(msg) = self.message.take() else {
            return Step::Done;
        };
        match send(ctx, &msg) {
            Ok(()) => Step::Done,
            Err(e) => Step::Fail(e),
        }
    }

    fn on_message(&mut self, _ctx: &mut Ctx<TransferEvent>, _payload: &[u8]) -> Step {
        Step::Fail("announcer expects no messages".into())
    }

    fn state(&self) -> &'static str {
        if self.message.is_some() {
            "pending"
        } else {
            "sent"
        }
    }
}

/// Responder: turns a received inventory message into an event.
pub struct InventoryHandler;

impl Handler<TransferEvent, TransferSignal> for InventoryHandler {
    fn on_message(&mut self, ctx: &mut Ctx<TransferEvent>, payload: &[u8]) -> Step {
        let (added, removed) = match decode::<InventoryMessage>(payload) {
            Ok(InventoryMessage::Announce { resources }) => (resources, Vec::new()),
            Ok(InventoryMessage::Withdraw { resources }) => (Vec::new(), resources),
            Err(e) => return Step::Fail(e),
        };
        ctx.emit(TransferEvent::Inventory {
            peer: ctx.peer(),
            added,
            removed,
        });
        Step::Done
    }

    fn state(&self) -> &'static str {
        "listening"
    }
}

pub struct InventoryFactory {
    timeout: Option<Duration>,
}

impl InventoryFactory {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl HandlerFactory<TransferEvent, TransferSignal> for InventoryFactory {
    fn build(
        &self,
        _peer: PeerId,
        status: RelationshipStatus,
    ) -> Option<Box<dyn Handler<TransferEvent, TransferSignal>>> {
        if status.is_blocked() {
            return None;
        }
        Some(Box::new(InventoryHandler))
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
