//! Provider directory: which peers currently offer which resources, per store.
//!
//! Safe to share between connection callbacks and download sessions; every
//! read returns a snapshot. Mutations publish `ProvidersChanged` through a
//! [`Notifier`] so subscribers can batch bursts of announcements.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use parking_lot::RwLock;

use crate::identity::PeerId;
use crate::notify::{Batch, BatchPolicy, Notifier, SubscriptionId};
use crate::resource::ResourceKey;

/// Provider set of one resource after a change.
pub type ProvidersChanged = BTreeSet<PeerId>;

struct Inner {
    providers: HashMap<ResourceKey, BTreeSet<PeerId>>,
    notifier: Notifier<ResourceKey, ProvidersChanged>,
}

pub struct ProviderDirectory {
    store: String,
    inner: RwLock<Inner>,
}

impl ProviderDirectory {
    pub fn new(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            inner: RwLock::new(Inner {
                providers: HashMap::new(),
                notifier: Notifier::new(),
            }),
        }
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    /// Returns true if `peer` was not already listed for `resource`.
    pub fn add_provider(&self, resource: &ResourceKey, peer: PeerId, now: Instant) -> bool {
        let mut inner = self.inner.write();
        let set = inner.providers.entry(resource.clone()).or_default();
        if !set.insert(peer) {
            return false;
        }
        let snapshot = set.clone();
        inner.notifier.publish(resource.clone(), snapshot, now);
        tracing::debug!(store = %self.store, %resource, peer = %peer.short(), "provider added");
        true
    }

    /// Returns true if `peer` was listed. An emptied resource is pruned.
    pub fn remove_provider(&self, resource: &ResourceKey, peer: PeerId, now: Instant) -> bool {
        let mut inner = self.inner.write();
        let Some(set) = inner.providers.get_mut(resource) else {
            return false;
        };
        if !set.remove(&peer) {
            return false;
        }
        let snapshot = set.clone();
        if snapshot.is_empty() {
            inner.providers.remove(resource);
        }
        inner.notifier.publish(resource.clone(), snapshot, now);
        tracing::debug!(store = %self.store, %resource, peer = %peer.short(), "provider removed");
        true
    }

    /// Drop `peer` from every resource (on disconnect). Returns the affected resources.
    pub fn remove_all_providers_for_peer(&self, peer: PeerId, now: Instant) -> Vec<ResourceKey> {
        let mut inner = self.inner.write();
        let mut affected: Vec<ResourceKey> = inner
            .providers
            .iter()
            .filter(|(_, set)| set.contains(&peer))
            .map(|(k, _)| k.clone())
            .collect();
        affected.sort();
        for resource in &affected {
            let snapshot = match inner.providers.get_mut(resource) {
                Some(set) => {
                    set.remove(&peer);
                    set.clone()
                }
                None => continue,
            };
            if snapshot.is_empty() {
                inner.providers.remove(resource);
            }
            inner.notifier.publish(resource.clone(), snapshot, now);
        }
        if !affected.is_empty() {
            tracing::debug!(store = %self.store, peer = %peer.short(), resources = affected.len(), "peer removed from directory");
        }
        affected
    }

    /// Snapshot of the peers offering `resource`; empty if none.
    pub fn providers(&self, resource: &ResourceKey) -> BTreeSet<PeerId> {
        self.inner
            .read()
            .providers
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    pub fn resources(&self) -> Vec<ResourceKey> {
        let mut out: Vec<ResourceKey> = self.inner.read().providers.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn resources_for_peer(&self, peer: PeerId) -> Vec<ResourceKey> {
        let mut out: Vec<ResourceKey> = self
            .inner
            .read()
            .providers
            .iter()
            .filter(|(_, set)| set.contains(&peer))
            .map(|(k, _)| k.clone())
            .collect();
        out.sort();
        out
    }

    /// Number of resources with at least one provider.
    pub fn len(&self) -> usize {
        self.inner.read().providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self, filter: Option<ResourceKey>, policy: BatchPolicy) -> SubscriptionId {
        self.inner.write().notifier.subscribe(filter, policy)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.write().notifier.unsubscribe(id)
    }

    pub fn drain_notifications(&self, now: Instant) -> Vec<Batch<ResourceKey, ProvidersChanged>> {
        self.inner.write().notifier.drain(now)
    }

    pub fn next_notification_due(&self) -> Option<Instant> {
        self.inner.read().notifier.next_due()
    }
}
