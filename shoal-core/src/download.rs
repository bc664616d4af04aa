//! Download coordinator: fetches one resource from whichever providers hold
//! its pieces.
//!
//! Host-driven like the rest of the core. The host feeds provider-directory
//! changes, transfer events and persistence results in; the session answers
//! with [`DownloadAction`]s (probe, request, persist, ...). The session only
//! mirrors the persisted index; the host owns the index itself.
//!
//! Lifecycle: `Discovering` until a provider reports the total size, then
//! `Transferring` until every byte is persisted (`Completed`), no provider is
//! left (`Failed`) or the user cancels (`Cancelled`).

use std::collections::{BTreeMap, BTreeSet};

use crate::conversation::Interruption;
use crate::identity::PeerId;
use crate::index::PartialIndex;
use crate::integrity::{PeerTrustTracker, DEFAULT_MAX_INTEGRITY_FAILURES};
use crate::interval::{Interval, IntervalSet};
use crate::protocol::OpenOutcome;
use crate::resource::ResourceKey;
use crate::transfer::{FetchFailure, RequestId};

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Upper bound on the bytes of one request or extension.
    pub request_len: u64,
    /// Open requests allowed per provider.
    pub max_requests_per_peer: usize,
    pub max_integrity_failures: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            request_len: 1024 * 1024,
            max_requests_per_peer: 2,
            max_integrity_failures: DEFAULT_MAX_INTEGRITY_FAILURES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Discovering,
    Transferring,
    Completed,
    Failed(String),
    Cancelled,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Failed(_) | DownloadState::Cancelled
        )
    }
}

/// Work for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadAction {
    /// Open a probe conversation with `peer`.
    Probe { peer: PeerId },
    /// Open a fetch conversation for `range`.
    Request { peer: PeerId, id: RequestId, range: Interval },
    /// Append `range` to the open fetch `id`.
    Extend { peer: PeerId, id: RequestId, range: Interval },
    /// Write received bytes through the index; report back with
    /// `on_persisted` or `on_persist_failed`.
    Persist { offset: u64, data: Vec<u8> },
    /// Fix the total size in the index.
    SetTotalSize { size: u64 },
    /// Cancel the fetch conversation `id`.
    Abort { peer: PeerId, id: RequestId },
    Completed,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Provider {
    Probing,
    Available(IntervalSet),
    /// Refused, answered nonsense, or sent corrupt data.
    Unusable,
}

#[derive(Debug)]
struct OpenRequest {
    peer: PeerId,
    /// Requested bytes not received yet.
    outstanding: IntervalSet,
    /// Last byte requested so far (extensions move it).
    end: u64,
}

pub struct DownloadSession {
    resource: ResourceKey,
    cfg: DownloadConfig,
    state: DownloadState,
    total_size: Option<u64>,
    /// Persisted bytes, mirrored from the index.
    local: IntervalSet,
    /// Received bytes handed to the host for persistence.
    persisting: IntervalSet,
    providers: BTreeMap<PeerId, Provider>,
    requests: BTreeMap<RequestId, OpenRequest>,
    next_request: RequestId,
    trust: PeerTrustTracker,
}

impl DownloadSession {
    pub fn new(resource: ResourceKey, cfg: DownloadConfig) -> Self {
        let trust = PeerTrustTracker::new(cfg.max_integrity_failures);
        Self {
            resource,
            cfg,
            state: DownloadState::Discovering,
            total_size: None,
            local: IntervalSet::new(),
            persisting: IntervalSet::new(),
            providers: BTreeMap::new(),
            requests: BTreeMap::new(),
            next_request: 1,
            trust,
        }
    }

    /// Continue from what an existing index already holds.
    pub fn resume(resource: ResourceKey, cfg: DownloadConfig, index: &PartialIndex) -> Self {
        let mut session = Self::new(resource, cfg);
        session.total_size = index.total_size();
        session.local = index.written();
        session
    }

    pub fn resource(&self) -> &ResourceKey {
        &self.resource
    }

    pub fn state(&self) -> &DownloadState {
        &self.state
    }

    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    pub fn local(&self) -> &IntervalSet {
        &self.local
    }

    /// Bytes requested and not yet received.
    pub fn in_flight(&self) -> IntervalSet {
        let mut all = IntervalSet::new();
        for req in self.requests.values() {
            all = all.union(&req.outstanding);
        }
        all
    }

    /// Bytes neither persisted, persisting nor in flight. Empty while the size is unknown.
    pub fn missing(&self) -> IntervalSet {
        match self.total_size {
            Some(total) => self
                .local
                .union(&self.persisting)
                .union(&self.in_flight())
                .complement_within(total),
            None => IntervalSet::new(),
        }
    }

    pub fn open_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn start(&mut self, providers: &BTreeSet<PeerId>) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        if self.total_size.is_some() {
            self.state = DownloadState::Transferring;
            if self.finish_if_complete(&mut actions) {
                return actions;
            }
        }
        tracing::info!(resource = %self.resource, providers = providers.len(), state = ?self.state, "download started");
        for &peer in providers {
            self.add_provider(peer, &mut actions);
        }
        actions
    }

    /// The provider directory's set for this resource changed.
    pub fn on_providers_changed(&mut self, providers: &BTreeSet<PeerId>) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        if self.state.is_terminal() {
            return actions;
        }
        let gone: Vec<PeerId> = self
            .providers
            .keys()
            .filter(|p| !providers.contains(p))
            .copied()
            .collect();
        for peer in gone {
            self.providers.remove(&peer);
            self.abort_requests_of(peer, &mut actions);
        }
        for &peer in providers {
            self.add_provider(peer, &mut actions);
        }
        self.assign(&mut actions);
        self.fail_if_exhausted(&mut actions);
        actions
    }

    pub fn on_availability(&mut self, peer: PeerId, total_size: u64, available: IntervalSet) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        if self.state.is_terminal() || !self.providers.contains_key(&peer) {
            return actions;
        }
        match self.total_size {
            None => {
                tracing::info!(resource = %self.resource, size = total_size, peer = %peer.short(), "total size known");
                self.total_size = Some(total_size);
                self.state = DownloadState::Transferring;
                actions.push(DownloadAction::SetTotalSize { size: total_size });
            }
            Some(known) if known != total_size => {
                tracing::warn!(resource = %self.resource, peer = %peer.short(), known, reported = total_size, "provider disagrees on size, ignoring it");
                self.providers.insert(peer, Provider::Unusable);
                self.fail_if_exhausted(&mut actions);
                return actions;
            }
            Some(_) => self.state = DownloadState::Transferring,
        }
        let available = match Interval::with_len(0, total_size) {
            Ok(whole) => available.intersection(&IntervalSet::from_interval(whole)),
            Err(_) => IntervalSet::new(),
        };
        self.providers.insert(peer, Provider::Available(available));
        if self.finish_if_complete(&mut actions) {
            return actions;
        }
        self.assign(&mut actions);
        actions
    }

    pub fn on_probe_failed(&mut self, peer: PeerId, reason: &str) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        if self.state.is_terminal() {
            return actions;
        }
        if let Some(p) = self.providers.get_mut(&peer) {
            tracing::debug!(resource = %self.resource, peer = %peer.short(), reason, "probe failed");
            *p = Provider::Unusable;
        }
        self.fail_if_exhausted(&mut actions);
        actions
    }

    pub fn on_chunk(&mut self, peer: PeerId, id: RequestId, offset: u64, data: Vec<u8>) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        if self.state.is_terminal() {
            return actions;
        }
        let Ok(range) = Interval::with_len(offset, data.len() as u64) else {
            return actions;
        };
        let Some(req) = self.requests.get_mut(&id) else {
            tracing::debug!(resource = %self.resource, id, "chunk for unknown request dropped");
            return actions;
        };
        if req.peer != peer || !req.outstanding.covers(&range) {
            tracing::warn!(resource = %self.resource, id, peer = %peer.short(), %range, "chunk outside its request dropped");
            return actions;
        }
        req.outstanding.remove(range);
        self.persisting.add(range);
        actions.push(DownloadAction::Persist { offset, data });
        self.assign(&mut actions);
        actions
    }

    pub fn on_persisted(&mut self, range: Interval) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        self.persisting.remove(range);
        self.local.add(range);
        if self.state.is_terminal() {
            return actions;
        }
        self.finish_if_complete(&mut actions);
        actions
    }

    /// The index gave up on a write (after its own retries).
    pub fn on_persist_failed(&mut self, range: Interval, reason: &str) -> Vec<DownloadAction> {
        self.persisting.remove(range);
        self.on_index_failed(&format!("persisting {range}: {reason}"))
    }

    /// Any other index operation failed (e.g. fixing the total size).
    pub fn on_index_failed(&mut self, reason: &str) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        if self.state.is_terminal() {
            return actions;
        }
        self.fail(reason.to_string(), &mut actions);
        actions
    }

    pub fn on_request_done(&mut self, peer: PeerId, id: RequestId) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        if let Some(req) = self.requests.remove(&id) {
            if !req.outstanding.is_empty() {
                tracing::debug!(resource = %self.resource, id, peer = %peer.short(), missing = %req.outstanding, "request ended short");
            }
        }
        if self.state.is_terminal() {
            return actions;
        }
        self.assign(&mut actions);
        actions
    }

    pub fn on_request_failed(&mut self, peer: PeerId, id: RequestId, reason: &FetchFailure) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        // Outstanding bytes of the request become missing again.
        self.requests.remove(&id);
        if self.state.is_terminal() {
            return actions;
        }
        tracing::debug!(resource = %self.resource, id, peer = %peer.short(), ?reason, "request failed");
        match reason {
            FetchFailure::Unavailable(range) => {
                if let Some(Provider::Available(set)) = self.providers.get_mut(&peer) {
                    set.remove(*range);
                }
            }
            FetchFailure::Integrity { offset } => {
                if self.trust.record_failure(peer) {
                    tracing::warn!(resource = %self.resource, peer = %peer.short(), offset, "provider isolated after repeated corrupt chunks");
                    self.mark_unusable(peer, &mut actions);
                }
            }
            FetchFailure::Interrupted(Interruption::Refused(
                OpenOutcome::RequestDenied | OpenOutcome::UnrecognizedProtocol,
            ))
            | FetchFailure::Protocol(_) => self.mark_unusable(peer, &mut actions),
            FetchFailure::Interrupted(_) => {}
        }
        self.assign(&mut actions);
        self.fail_if_exhausted(&mut actions);
        actions
    }

    pub fn on_peer_disconnected(&mut self, peer: PeerId) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        if self.providers.remove(&peer).is_none() {
            return actions;
        }
        // The link is gone; its conversations are closed without an abort.
        self.requests.retain(|_, r| r.peer != peer);
        if self.state.is_terminal() {
            return actions;
        }
        self.assign(&mut actions);
        self.fail_if_exhausted(&mut actions);
        actions
    }

    /// Stop assigning at once and abort every open request. The index is left as is.
    pub fn cancel(&mut self) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        if self.state.is_terminal() {
            return actions;
        }
        self.state = DownloadState::Cancelled;
        for (id, req) in std::mem::take(&mut self.requests) {
            actions.push(DownloadAction::Abort { peer: req.peer, id });
        }
        tracing::info!(resource = %self.resource, persisted = self.local.len(), "download cancelled");
        actions
    }

    fn add_provider(&mut self, peer: PeerId, actions: &mut Vec<DownloadAction>) {
        if self.providers.contains_key(&peer) || self.trust.is_isolated(&peer) {
            return;
        }
        self.providers.insert(peer, Provider::Probing);
        actions.push(DownloadAction::Probe { peer });
    }

    fn mark_unusable(&mut self, peer: PeerId, actions: &mut Vec<DownloadAction>) {
        if let Some(p) = self.providers.get_mut(&peer) {
            *p = Provider::Unusable;
        }
        self.abort_requests_of(peer, actions);
    }

    fn abort_requests_of(&mut self, peer: PeerId, actions: &mut Vec<DownloadAction>) {
        let ids: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, r)| r.peer == peer)
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            self.requests.remove(&id);
            actions.push(DownloadAction::Abort { peer, id });
        }
    }

    fn available_of(&self, peer: &PeerId) -> Option<&IntervalSet> {
        match self.providers.get(peer) {
            Some(Provider::Available(set)) => Some(set),
            _ => None,
        }
    }

    /// Hand missing ranges to providers: extend nearly drained requests
    /// first, then open new ones greedily by largest span.
    fn assign(&mut self, actions: &mut Vec<DownloadAction>) {
        if self.state != DownloadState::Transferring {
            return;
        }
        let mut missing = self.missing();
        if missing.is_empty() {
            return;
        }
        let request_len = self.cfg.request_len.max(1);

        let ids: Vec<RequestId> = self.requests.keys().copied().collect();
        for id in ids {
            let Some(req) = self.requests.get(&id) else {
                continue;
            };
            if req.outstanding.len() > request_len / 2 {
                continue;
            }
            let Some(next) = req.end.checked_add(1) else {
                continue;
            };
            let peer = req.peer;
            let (Some(gap), Some(held)) = (
                missing.interval_containing(next),
                self.available_of(&peer).and_then(|a| a.interval_containing(next)),
            ) else {
                continue;
            };
            let max = gap.max().min(held.max());
            let Ok(span) = Interval::new(next, max) else {
                continue;
            };
            let range = span.truncate(request_len);
            missing.remove(range);
            if let Some(req) = self.requests.get_mut(&id) {
                req.outstanding.add(range);
                req.end = range.max();
            }
            tracing::debug!(resource = %self.resource, id, peer = %peer.short(), %range, "extending request");
            actions.push(DownloadAction::Extend { peer, id, range });
        }

        loop {
            let mut best: Option<(PeerId, Interval)> = None;
            for (peer, provider) in &self.providers {
                let Provider::Available(held) = provider else {
                    continue;
                };
                let open = self.requests.values().filter(|r| r.peer == *peer).count();
                if open >= self.cfg.max_requests_per_peer || self.trust.is_isolated(peer) {
                    continue;
                }
                let Some(span) = held.intersection(&missing).largest_interval() else {
                    continue;
                };
                // Providers iterate in ascending id order: only a strictly
                // larger span displaces the current pick.
                if best.map_or(true, |(_, b)| span.len() > b.len()) {
                    best = Some((*peer, span));
                }
            }
            let Some((peer, span)) = best else {
                break;
            };
            let range = span.truncate(request_len);
            missing.remove(range);
            let id = self.next_request;
            self.next_request += 1;
            self.requests.insert(
                id,
                OpenRequest {
                    peer,
                    outstanding: IntervalSet::from_interval(range),
                    end: range.max(),
                },
            );
            tracing::debug!(resource = %self.resource, id, peer = %peer.short(), %range, "requesting range");
            actions.push(DownloadAction::Request { peer, id, range });
        }
    }

    fn finish_if_complete(&mut self, actions: &mut Vec<DownloadAction>) -> bool {
        let Some(total) = self.total_size else {
            return false;
        };
        if !self.local.complement_within(total).is_empty() {
            return false;
        }
        // Any fetch still open only waits for its closing `Done`.
        self.requests.clear();
        self.state = DownloadState::Completed;
        tracing::info!(resource = %self.resource, size = total, "download completed");
        actions.push(DownloadAction::Completed);
        true
    }

    fn fail_if_exhausted(&mut self, actions: &mut Vec<DownloadAction>) {
        if self.state != DownloadState::Transferring || !self.requests.is_empty() || !self.persisting.is_empty() {
            return;
        }
        let usable = self
            .providers
            .values()
            .any(|p| !matches!(p, Provider::Unusable));
        if !usable {
            self.fail("no provider left".to_string(), actions);
        }
    }

    fn fail(&mut self, reason: String, actions: &mut Vec<DownloadAction>) {
        for (id, req) in std::mem::take(&mut self.requests) {
            actions.push(DownloadAction::Abort { peer: req.peer, id });
        }
        tracing::warn!(resource = %self.resource, %reason, "download failed");
        self.state = DownloadState::Failed(reason.clone());
        actions.push(DownloadAction::Failed { reason });
    }
}
