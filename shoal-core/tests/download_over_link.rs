//! End-to-end: a downloader fetches one resource over in-memory provider links,
//! persisting through a real index.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shoal_core::conversation::{ConversationMux, MuxAction, ProtocolRegistry};
use shoal_core::download::{DownloadAction, DownloadConfig, DownloadSession, DownloadState};
use shoal_core::identity::{Keypair, PeerId};
use shoal_core::index::{IndexHandle, IndexRegistry};
use shoal_core::interval::{Interval, IntervalSet};
use shoal_core::protocol::{ChannelId, Frame};
use shoal_core::relationship::Relationships;
use shoal_core::resource::{ResourceKey, ResourceStore};
use shoal_core::transfer::{
    FetchHandler, InventoryFactory, ProbeHandler, TransferEvent, TransferFactory, TransferSignal,
    INVENTORY_PROTOCOL, TRANSFER_PROTOCOL,
};
use shoal_core::upload::{Admission, UploadCoordinator};

type Mux = ConversationMux<TransferEvent, TransferSignal>;

struct HalfStore {
    key: ResourceKey,
    data: Vec<u8>,
    held: IntervalSet,
}

impl ResourceStore for HalfStore {
    fn total_size(&self, resource: &ResourceKey) -> Option<u64> {
        (*resource == self.key).then_some(self.data.len() as u64)
    }

    fn available(&self, resource: &ResourceKey) -> IntervalSet {
        if *resource == self.key {
            self.held.clone()
        } else {
            IntervalSet::new()
        }
    }

    fn read(&self, _resource: &ResourceKey, range: Interval) -> std::io::Result<Vec<u8>> {
        Ok(self.data[range.min() as usize..=range.max() as usize].to_vec())
    }
}

/// The downloader's view of one provider link.
struct Link {
    provider: PeerId,
    client: Mux,
    server: Mux,
    uploads: UploadCoordinator<ChannelId>,
    to_server: VecDeque<Frame>,
    to_client: VecDeque<Frame>,
}

fn iv(a: u64, b: u64) -> Interval {
    Interval::new(a, b).unwrap()
}

fn make_link(me: &Keypair, provider: &Keypair, store: Arc<dyn ResourceStore>) -> Link {
    let mut client_reg: ProtocolRegistry<TransferEvent, TransferSignal> = ProtocolRegistry::new();
    client_reg
        .register(INVENTORY_PROTOCOL, Arc::new(InventoryFactory::new(None)))
        .unwrap();
    let mut server_reg: ProtocolRegistry<TransferEvent, TransferSignal> = ProtocolRegistry::new();
    server_reg
        .register(TRANSFER_PROTOCOL, Arc::new(TransferFactory::new(store, 16, None)))
        .unwrap();
    Link {
        provider: provider.peer_id(),
        client: Mux::new(me.peer_id(), provider.peer_id(), Arc::new(client_reg), Arc::new(Relationships::new()), 8),
        server: Mux::new(provider.peer_id(), me.peer_id(), Arc::new(server_reg), Arc::new(Relationships::new()), 8),
        uploads: UploadCoordinator::new(1),
        to_server: VecDeque::new(),
        to_client: VecDeque::new(),
    }
}

/// Run the provider side of a link until it has nothing more to say.
fn serve(link: &mut Link, downloader: PeerId, now: Instant) {
    while let Some(frame) = link.to_server.pop_front() {
        let mut pending: VecDeque<MuxAction<TransferEvent>> = link.server.on_frame(frame, now).into();
        while let Some(action) = pending.pop_front() {
            match action {
                MuxAction::Send(f) => link.to_client.push_back(f),
                MuxAction::Event(TransferEvent::UploadRequested { channel, .. }) => {
                    let signal = match link.uploads.submit(downloader, channel) {
                        Admission::Start => TransferSignal::Grant,
                        Admission::Queued { .. } => TransferSignal::Queued,
                    };
                    pending.extend(link.server.signal(channel, signal, now));
                }
                MuxAction::Event(TransferEvent::UploadReady { channel, .. }) => {
                    pending.extend(link.server.signal(channel, TransferSignal::SendNext, now));
                }
                MuxAction::Closed { channel, .. } => {
                    if let Some(next) = link.uploads.finish(downloader, &channel) {
                        pending.extend(link.server.signal(next, TransferSignal::Grant, now));
                    }
                }
                MuxAction::Event(_) => {}
            }
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    completed: bool,
    requests: usize,
    extends: usize,
}

fn frames(actions: Vec<MuxAction<TransferEvent>>) -> impl Iterator<Item = Frame> {
    actions.into_iter().filter_map(|a| match a {
        MuxAction::Send(f) => Some(f),
        _ => None,
    })
}

fn config(request_len: u64, per_peer: usize) -> DownloadConfig {
    DownloadConfig {
        request_len,
        max_requests_per_peer: per_peer,
        max_integrity_failures: 3,
    }
}

/// Drive `session` against `links` until it finishes or stalls. With
/// `frame_at_a_time`, the downloader handles one incoming frame per link
/// between rounds of its own actions, so its extensions can trail the
/// provider's final message.
async fn run_download(
    key: &ResourceKey,
    me: PeerId,
    links: &mut [Link],
    session: &mut DownloadSession,
    index: &IndexHandle,
    frame_at_a_time: bool,
) -> Tally {
    let providers: BTreeSet<PeerId> = links.iter().map(|l| l.provider).collect();
    let mut actions: VecDeque<DownloadAction> = session.start(&providers).into();
    let mut channels: HashMap<u64, (usize, ChannelId)> = HashMap::new();
    let now = Instant::now();
    let timeout = Some(Duration::from_secs(5));
    let mut tally = Tally::default();

    for _round in 0..1000 {
        while let Some(action) = actions.pop_front() {
            match action {
                DownloadAction::Probe { peer } => {
                    let i = links.iter().position(|l| l.provider == peer).unwrap();
                    let (_, out) = links[i]
                        .client
                        .open(TRANSFER_PROTOCOL, Box::new(ProbeHandler::new(key.clone())), timeout, now)
                        .unwrap();
                    links[i].to_server.extend(frames(out));
                }
                DownloadAction::Request { peer, id, range } => {
                    tally.requests += 1;
                    let i = links.iter().position(|l| l.provider == peer).unwrap();
                    let (ch, out) = links[i]
                        .client
                        .open(TRANSFER_PROTOCOL, Box::new(FetchHandler::new(key.clone(), id, range)), timeout, now)
                        .unwrap();
                    channels.insert(id, (i, ch));
                    links[i].to_server.extend(frames(out));
                }
                DownloadAction::Extend { id, range, .. } => {
                    tally.extends += 1;
                    let (i, ch) = channels[&id];
                    let out = links[i].client.signal(ch, TransferSignal::Extend(range), now);
                    links[i].to_server.extend(frames(out));
                }
                DownloadAction::Persist { offset, data } => {
                    let range = Interval::with_len(offset, data.len() as u64).unwrap();
                    index.write(offset, data).await.unwrap();
                    actions.extend(session.on_persisted(range));
                }
                DownloadAction::SetTotalSize { size } => index.set_total_size(size).await.unwrap(),
                DownloadAction::Abort { id, .. } => {
                    let (i, ch) = channels[&id];
                    links[i].client.cancel(ch, now);
                }
                DownloadAction::Completed => tally.completed = true,
                DownloadAction::Failed { reason } => panic!("download failed: {reason}"),
            }
        }
        if tally.completed {
            break;
        }

        let mut progressed = false;
        for link in links.iter_mut() {
            serve(link, me, now);
            let take = if frame_at_a_time { 1 } else { link.to_client.len() };
            for _ in 0..take {
                let Some(frame) = link.to_client.pop_front() else {
                    break;
                };
                progressed = true;
                for out in link.client.on_frame(frame, now) {
                    match out {
                        MuxAction::Send(f) => link.to_server.push_back(f),
                        MuxAction::Event(event) => actions.extend(match event {
                            TransferEvent::Availability { peer, total_size, available, .. } => {
                                session.on_availability(peer, total_size, available)
                            }
                            TransferEvent::ProbeFailed { peer, reason, .. } => session.on_probe_failed(peer, &reason),
                            TransferEvent::Chunk { peer, request, offset, data, .. } => {
                                session.on_chunk(peer, request, offset, data)
                            }
                            TransferEvent::RequestDone { peer, request, .. } => session.on_request_done(peer, request),
                            TransferEvent::RequestFailed { peer, request, reason, .. } => {
                                session.on_request_failed(peer, request, &reason)
                            }
                            _ => Vec::new(),
                        }),
                        MuxAction::Closed { .. } => {}
                    }
                }
            }
        }
        if !progressed && actions.is_empty() {
            break;
        }
    }
    tally
}

async fn assert_written(index: IndexHandle, dir: &std::path::Path, data: &[u8]) {
    let snapshot = index.snapshot().await.unwrap();
    assert!(snapshot.is_complete());
    assert_eq!(snapshot.total_size(), Some(data.len() as u64));
    index.destroy(Some(dir.join("blob"))).await.unwrap();
    let written = tokio::fs::read(dir.join("blob")).await.unwrap();
    assert_eq!(written, data);
}

fn sample() -> Vec<u8> {
    (0..100u8).map(|b| b.wrapping_mul(7)).collect()
}

fn store(key: &ResourceKey, data: &[u8], held: Interval) -> Arc<dyn ResourceStore> {
    Arc::new(HalfStore {
        key: key.clone(),
        data: data.to_vec(),
        held: IntervalSet::from_interval(held),
    })
}

#[tokio::test]
async fn download_from_two_half_providers() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample();
    let key = ResourceKey::new("blob");

    let me = Keypair::generate();
    let mut links = vec![
        make_link(&me, &Keypair::generate(), store(&key, &data, iv(0, 49))),
        make_link(&me, &Keypair::generate(), store(&key, &data, iv(50, 99))),
    ];
    let registry = IndexRegistry::default();
    let index = registry.open(&dir.path().join("blob.part.idx")).await.unwrap();
    let mut session = DownloadSession::new(key.clone(), config(32, 2));

    let tally = run_download(&key, me.peer_id(), &mut links, &mut session, &index, false).await;
    assert!(tally.completed, "download stalled in {:?}", session.state());
    assert_eq!(session.state(), &DownloadState::Completed);
    assert_written(index, dir.path(), &data).await;
}

#[tokio::test]
async fn single_provider_serves_more_than_one_request() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample();
    let key = ResourceKey::new("blob");

    let me = Keypair::generate();
    let mut links = vec![make_link(&me, &Keypair::generate(), store(&key, &data, iv(0, 99)))];
    let registry = IndexRegistry::default();
    let index = registry.open(&dir.path().join("blob.part.idx")).await.unwrap();
    let mut session = DownloadSession::new(key.clone(), config(32, 1));

    let tally = run_download(&key, me.peer_id(), &mut links, &mut session, &index, false).await;
    assert!(tally.completed, "download stalled in {:?} with {}", session.state(), session.local());
    assert!(tally.requests > 1);
    assert_written(index, dir.path(), &data).await;
}

#[tokio::test]
async fn extension_reaching_a_finished_provider_is_requested_again() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample();
    let key = ResourceKey::new("blob");

    let me = Keypair::generate();
    let mut links = vec![make_link(&me, &Keypair::generate(), store(&key, &data, iv(0, 99)))];
    let registry = IndexRegistry::default();
    let index = registry.open(&dir.path().join("blob.part.idx")).await.unwrap();
    let mut session = DownloadSession::new(key.clone(), config(32, 1));

    let tally = run_download(&key, me.peer_id(), &mut links, &mut session, &index, true).await;
    assert!(tally.completed, "download stalled in {:?} with {}", session.state(), session.local());
    assert!(tally.extends > 0);
    assert!(tally.requests > 1);
    assert_written(index, dir.path(), &data).await;
}
