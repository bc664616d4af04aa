//! Wires the core coordinators to live peer links.
//!
//! Every link gets one task that owns its `ConversationMux`. Shared state
//! (download sessions, upload slots, bandwidth bucket) sits behind one lock
//! that is never held across disk or network waits.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use shoal_core::conversation::ConversationMux;
use shoal_core::download::{DownloadAction, DownloadConfig, DownloadSession};
use shoal_core::index::{allocate_paths, scan_indexes, IndexHandle, IndexRegistry};
use shoal_core::transfer::{
    AnnounceHandler, FetchFailure, FetchHandler, InventoryFactory, ProbeHandler, RequestId, TransferFactory,
    INVENTORY_PROTOCOL, TRANSFER_PROTOCOL,
};
use shoal_core::upload::{Admission, TokenBucket, UploadCoordinator};
use shoal_core::{
    BatchPolicy, ChannelId, Frame, Interruption, Interval, Keypair, MuxAction, OpenOutcome, PeerId,
    ProtocolRegistry, ProviderDirectory, RelationshipStatus, Relationships, ResourceKey, ResourceStore,
    TransferEvent, TransferSignal,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::config::Config;
use crate::store::{valid_key, ShareStore};
use crate::transport::{self, Link};

type Mux = ConversationMux<TransferEvent, TransferSignal>;

/// Coalescing window for provider changes handed to download sessions.
const PROVIDER_BATCH_INTERVAL: Duration = Duration::from_millis(250);
const FRAME_QUEUE: usize = 64;
const REDIAL_MIN: Duration = Duration::from_secs(5);
const REDIAL_MAX: Duration = Duration::from_secs(60);

/// Requests from the engine to the task owning a peer's mux.
#[derive(Debug)]
enum PeerCommand {
    Probe(ResourceKey),
    Fetch {
        resource: ResourceKey,
        request: RequestId,
        range: Interval,
    },
    Extend {
        resource: ResourceKey,
        request: RequestId,
        range: Interval,
    },
    Abort {
        resource: ResourceKey,
        request: RequestId,
    },
    Announce(Vec<ResourceKey>),
    Signal {
        channel: ChannelId,
        signal: TransferSignal,
    },
}

struct ActiveDownload {
    session: DownloadSession,
    index: IndexHandle,
}

struct State {
    downloads: HashMap<ResourceKey, ActiveDownload>,
    uploads: UploadCoordinator<ChannelId>,
    bucket: Option<TokenBucket>,
}

pub struct Engine {
    keypair: Arc<Keypair>,
    timeout: Duration,
    max_channels: usize,
    download_cfg: DownloadConfig,
    index_dir: PathBuf,
    downloads_dir: PathBuf,
    registry: Arc<ProtocolRegistry<TransferEvent, TransferSignal>>,
    relationships: Arc<Relationships>,
    directory: ProviderDirectory,
    store: Arc<ShareStore>,
    indexes: IndexRegistry,
    state: Mutex<State>,
    peers: Mutex<HashMap<PeerId, mpsc::UnboundedSender<PeerCommand>>>,
    directory_changed: Notify,
}

/// Per-link state owned by the connection task.
struct Conn {
    peer: PeerId,
    mux: Mux,
    out: mpsc::UnboundedSender<Frame>,
    fetches: HashMap<(ResourceKey, RequestId), ChannelId>,
    tags: HashMap<ChannelId, (ResourceKey, RequestId)>,
}

impl Engine {
    pub fn new(cfg: &Config, keypair: Arc<Keypair>) -> anyhow::Result<Arc<Self>> {
        let timeout = cfg.conversation_timeout();
        let store = Arc::new(ShareStore::new(cfg.share_dir.clone()));
        let serving: Arc<dyn ResourceStore> = store.clone();

        let mut registry: ProtocolRegistry<TransferEvent, TransferSignal> = ProtocolRegistry::new();
        registry.register(
            TRANSFER_PROTOCOL,
            Arc::new(TransferFactory::new(serving, cfg.chunk_len, Some(timeout))),
        )?;
        registry.register(INVENTORY_PROTOCOL, Arc::new(InventoryFactory::new(Some(timeout))))?;

        let relationships = Arc::new(Relationships::new());
        for id in cfg.favorite_ids() {
            relationships.set(id, RelationshipStatus::Favorite);
        }
        for id in cfg.blocked_ids() {
            relationships.set(id, RelationshipStatus::Blocked);
        }

        let bucket = match cfg.upload_rate_bps {
            0 => None,
            rate => Some(TokenBucket::new(rate, 0, Instant::now())?),
        };

        let directory = ProviderDirectory::new("shoal");
        directory.subscribe(None, BatchPolicy::grouped(PROVIDER_BATCH_INTERVAL));

        Ok(Arc::new(Self {
            keypair,
            timeout,
            max_channels: cfg.max_channels,
            download_cfg: cfg.download(),
            index_dir: cfg.index_dir(),
            downloads_dir: cfg.downloads_dir(),
            registry: Arc::new(registry),
            relationships,
            directory,
            store,
            indexes: IndexRegistry::default(),
            state: Mutex::new(State {
                downloads: HashMap::new(),
                uploads: UploadCoordinator::new(cfg.upload_slots),
                bucket,
            }),
            peers: Mutex::new(HashMap::new()),
            directory_changed: Notify::new(),
        }))
    }

    pub fn local_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn store(&self) -> &ShareStore {
        &self.store
    }

    /// Prepare directories, resume interrupted downloads and start the
    /// provider notification task.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        for dir in [self.index_dir.as_path(), self.downloads_dir.as_path(), self.store.share_dir()] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        tokio::spawn(self.clone().run_notifications());
        self.resume_downloads().await?;
        Ok(())
    }

    async fn resume_downloads(self: &Arc<Self>) -> anyhow::Result<()> {
        for (path, index) in scan_indexes(&self.index_dir).await? {
            let key = match index.metadata::<ResourceKey>("download", "resource") {
                Ok(Some(key)) => key,
                Ok(None) => {
                    tracing::warn!(path = %path.display(), "index without resource key, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable download metadata, skipping");
                    continue;
                }
            };
            let handle = self.indexes.open(&path).await?;
            let mut session = DownloadSession::resume(key.clone(), self.download_cfg.clone(), &index);
            let actions = session.start(&self.directory.providers(&key));
            tracing::info!(resource = %key, persisted = index.written().len(), "resuming download");
            self.state
                .lock()
                .await
                .downloads
                .insert(key.clone(), ActiveDownload { session, index: handle });
            self.run_actions(&key, actions).await;
        }
        Ok(())
    }

    /// Start downloading `key` unless it is already local or in progress.
    pub async fn fetch(self: &Arc<Self>, key: ResourceKey) -> anyhow::Result<()> {
        anyhow::ensure!(valid_key(&key), "resource key {key:?} cannot name a file");
        if self.store.total_size(&key).is_some() {
            tracing::info!(resource = %key, "already shared locally");
            return Ok(());
        }
        if self.state.lock().await.downloads.contains_key(&key) {
            return Ok(());
        }
        let (index, mut session) = match self.partial_index_of(&key).await? {
            Some(path) => {
                let index = self.indexes.open(&path).await?;
                let partial = index.snapshot().await?;
                tracing::info!(resource = %key, persisted = partial.written().len(), "continuing partial download");
                let session = DownloadSession::resume(key.clone(), self.download_cfg.clone(), &partial);
                (index, session)
            }
            None => {
                let (index_path, _) = allocate_paths(&self.index_dir);
                let index = self.indexes.open(&index_path).await?;
                index.set_metadata("download", "resource", &key).await?;
                (index, DownloadSession::new(key.clone(), self.download_cfg.clone()))
            }
        };
        let actions = session.start(&self.directory.providers(&key));
        self.state
            .lock()
            .await
            .downloads
            .insert(key.clone(), ActiveDownload { session, index });
        self.run_actions(&key, actions).await;
        Ok(())
    }

    /// Index file left behind by an earlier download of `key`.
    async fn partial_index_of(&self, key: &ResourceKey) -> anyhow::Result<Option<PathBuf>> {
        let found = scan_indexes(&self.index_dir)
            .await?
            .into_iter()
            .find(|(_, index)| matches!(index.metadata::<ResourceKey>("download", "resource"), Ok(Some(k)) if k == *key));
        Ok(found.map(|(path, _)| path))
    }

    /// Stop a running download; its partial index stays on disk.
    pub async fn cancel(self: &Arc<Self>, key: &ResourceKey) -> bool {
        let actions = {
            let mut state = self.state.lock().await;
            match state.downloads.get_mut(key) {
                Some(d) => d.session.cancel(),
                None => return false,
            }
        };
        self.run_actions(key, actions).await;
        self.state.lock().await.downloads.remove(key);
        true
    }

    /// Cancel every running download so providers see aborts before the links drop.
    pub async fn shutdown(self: &Arc<Self>) {
        let keys: Vec<ResourceKey> = self.state.lock().await.downloads.keys().cloned().collect();
        for key in &keys {
            self.cancel(key).await;
        }
        tracing::info!(cancelled = keys.len(), "engine stopped");
    }

    async fn run_notifications(self: Arc<Self>) {
        loop {
            let due = self.directory.next_notification_due();
            match due {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                        _ = self.directory_changed.notified() => continue,
                    }
                }
                None => {
                    self.directory_changed.notified().await;
                    continue;
                }
            }
            for batch in self.directory.drain_notifications(Instant::now()) {
                for (key, providers) in batch.events {
                    let actions = {
                        let mut state = self.state.lock().await;
                        match state.downloads.get_mut(&key) {
                            Some(d) => d.session.on_providers_changed(&providers),
                            None => continue,
                        }
                    };
                    self.run_actions(&key, actions).await;
                }
            }
        }
    }

    /// Apply one session input and carry out what it asks for.
    async fn step(
        self: &Arc<Self>,
        key: &ResourceKey,
        input: impl FnOnce(&mut DownloadSession) -> Vec<DownloadAction>,
    ) {
        let actions = {
            let mut state = self.state.lock().await;
            match state.downloads.get_mut(key) {
                Some(d) => input(&mut d.session),
                None => return,
            }
        };
        self.run_actions(key, actions).await;
    }

    async fn index_of(&self, key: &ResourceKey) -> Option<IndexHandle> {
        self.state.lock().await.downloads.get(key).map(|d| d.index.clone())
    }

    async fn run_actions(self: &Arc<Self>, key: &ResourceKey, actions: Vec<DownloadAction>) {
        let mut queue: VecDeque<DownloadAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            let more = match action {
                DownloadAction::Probe { peer } => {
                    if self.send_to(peer, PeerCommand::Probe(key.clone())).await {
                        continue;
                    }
                    self.session_input(key, |s| s.on_peer_disconnected(peer)).await
                }
                DownloadAction::Request { peer, id, range } => {
                    let cmd = PeerCommand::Fetch {
                        resource: key.clone(),
                        request: id,
                        range,
                    };
                    if self.send_to(peer, cmd).await {
                        continue;
                    }
                    self.session_input(key, |s| s.on_peer_disconnected(peer)).await
                }
                DownloadAction::Extend { peer, id, range } => {
                    let cmd = PeerCommand::Extend {
                        resource: key.clone(),
                        request: id,
                        range,
                    };
                    self.send_to(peer, cmd).await;
                    continue;
                }
                DownloadAction::Abort { peer, id } => {
                    let cmd = PeerCommand::Abort {
                        resource: key.clone(),
                        request: id,
                    };
                    self.send_to(peer, cmd).await;
                    continue;
                }
                DownloadAction::Persist { offset, data } => {
                    let (Some(index), Ok(range)) =
                        (self.index_of(key).await, Interval::with_len(offset, data.len() as u64))
                    else {
                        continue;
                    };
                    match index.write(offset, data).await {
                        Ok(_) => self.session_input(key, |s| s.on_persisted(range)).await,
                        Err(e) => {
                            let reason = e.to_string();
                            self.session_input(key, |s| s.on_persist_failed(range, &reason)).await
                        }
                    }
                }
                DownloadAction::SetTotalSize { size } => {
                    let Some(index) = self.index_of(key).await else {
                        continue;
                    };
                    match index.set_total_size(size).await {
                        Ok(()) => continue,
                        Err(e) => {
                            let reason = e.to_string();
                            self.session_input(key, |s| s.on_index_failed(&reason)).await
                        }
                    }
                }
                DownloadAction::Completed => {
                    if let Err(e) = self.finish_download(key).await {
                        tracing::error!(resource = %key, error = %e, "could not finalize download");
                    }
                    continue;
                }
                DownloadAction::Failed { reason } => {
                    tracing::warn!(resource = %key, %reason, "download failed, partial data kept");
                    self.state.lock().await.downloads.remove(key);
                    continue;
                }
            };
            queue.extend(more);
        }
    }

    async fn session_input(
        &self,
        key: &ResourceKey,
        input: impl FnOnce(&mut DownloadSession) -> Vec<DownloadAction>,
    ) -> Vec<DownloadAction> {
        let mut state = self.state.lock().await;
        match state.downloads.get_mut(key) {
            Some(d) => input(&mut d.session),
            None => Vec::new(),
        }
    }

    /// Move the finished data file into place, drop the index and start sharing it.
    async fn finish_download(self: &Arc<Self>, key: &ResourceKey) -> anyhow::Result<()> {
        let Some(done) = self.state.lock().await.downloads.remove(key) else {
            return Ok(());
        };
        let target = self.downloads_dir.join(key.as_str());
        let index_path = done.index.path().to_path_buf();
        done.index.destroy(Some(target.clone())).await?;
        self.indexes.release(&index_path).await;
        tracing::info!(resource = %key, path = %target.display(), "download completed");
        self.store.add_completed(key.clone(), target);

        let peers: Vec<PeerId> = self.peers.lock().await.keys().copied().collect();
        for peer in peers {
            self.send_to(peer, PeerCommand::Announce(vec![key.clone()])).await;
        }
        Ok(())
    }

    async fn send_to(&self, peer: PeerId, cmd: PeerCommand) -> bool {
        match self.peers.lock().await.get(&peer) {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        }
    }

    /// Handle a conversation event. Returns signals for the same link's mux.
    async fn on_event(self: &Arc<Self>, event: TransferEvent) -> Vec<(ChannelId, TransferSignal)> {
        match event {
            TransferEvent::Availability {
                peer,
                resource,
                total_size,
                available,
            } => {
                self.step(&resource, |s| s.on_availability(peer, total_size, available))
                    .await
            }
            TransferEvent::ProbeFailed { peer, resource, reason } => {
                self.step(&resource, |s| s.on_probe_failed(peer, &reason)).await
            }
            TransferEvent::Chunk {
                peer,
                resource,
                request,
                offset,
                data,
            } => {
                self.step(&resource, |s| s.on_chunk(peer, request, offset, data))
                    .await
            }
            TransferEvent::RequestDone { peer, resource, request } => {
                self.step(&resource, |s| s.on_request_done(peer, request)).await
            }
            TransferEvent::RequestFailed {
                peer,
                resource,
                request,
                reason,
            } => {
                self.step(&resource, |s| s.on_request_failed(peer, request, &reason))
                    .await
            }
            TransferEvent::UploadRequested {
                peer,
                channel,
                resource,
                range,
            } => {
                let admission = self.state.lock().await.uploads.submit(peer, channel);
                tracing::debug!(peer = %peer.short(), channel, resource = %resource, %range, ?admission, "upload requested");
                let signal = match admission {
                    Admission::Start => TransferSignal::Grant,
                    Admission::Queued { .. } => TransferSignal::Queued,
                };
                return vec![(channel, signal)];
            }
            TransferEvent::UploadReady { peer, channel, next_len } => {
                let wait = match self.state.lock().await.bucket.as_mut() {
                    Some(bucket) => bucket.reserve(next_len, Instant::now()),
                    None => Duration::ZERO,
                };
                if wait.is_zero() {
                    return vec![(channel, TransferSignal::SendNext)];
                }
                let engine = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    let cmd = PeerCommand::Signal {
                        channel,
                        signal: TransferSignal::SendNext,
                    };
                    engine.send_to(peer, cmd).await;
                });
            }
            TransferEvent::Inventory { peer, added, removed } => {
                let now = Instant::now();
                let mut changed = false;
                for key in &added {
                    changed |= self.directory.add_provider(key, peer, now);
                }
                for key in &removed {
                    changed |= self.directory.remove_provider(key, peer, now);
                }
                tracing::debug!(peer = %peer.short(), added = added.len(), removed = removed.len(), "inventory update");
                if changed {
                    self.directory_changed.notify_one();
                }
            }
        }
        Vec::new()
    }

    /// Accept links on `port` until the listener fails.
    pub async fn listen(self: Arc<Self>, port: u16) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding port {port}"))?;
        tracing::info!(port, peer_id = %self.local_id(), "listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let engine = self.clone();
            tokio::spawn(async move {
                match transport::establish(stream, &engine.keypair, false).await {
                    Ok(link) => engine.run_connection(link).await,
                    Err(e) => tracing::warn!(%addr, error = %e, "inbound handshake failed"),
                }
            });
        }
    }

    /// Keep a link to `addr` up, redialing with backoff.
    pub fn dial(self: &Arc<Self>, addr: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut delay = REDIAL_MIN;
            loop {
                match TcpStream::connect(&addr).await {
                    Ok(stream) => match transport::establish(stream, &engine.keypair, true).await {
                        Ok(link) => {
                            delay = REDIAL_MIN;
                            engine.clone().run_connection(link).await;
                        }
                        Err(e) => tracing::warn!(%addr, error = %e, "outbound handshake failed"),
                    },
                    Err(e) => tracing::debug!(%addr, error = %e, "dial failed"),
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(REDIAL_MAX);
            }
        });
    }

    /// Drive one authenticated link until either side drops it.
    pub async fn run_connection<S>(self: Arc<Self>, link: Link<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Link {
            peer,
            mut reader,
            mut writer,
        } = link;
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        {
            let mut peers = self.peers.lock().await;
            if peers.contains_key(&peer) {
                tracing::info!(peer = %peer.short(), "already linked, dropping duplicate");
                return;
            }
            peers.insert(peer, cmd_tx.clone());
        }
        tracing::info!(peer = %peer.short(), status = ?self.relationships.status(&peer), "peer connected");

        let (out, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = writer.send(&frame).await {
                    tracing::debug!(peer = %peer.short(), error = %e, "write failed");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });
        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(FRAME_QUEUE);
        let read_task = tokio::spawn(async move {
            loop {
                match reader.next_frame().await {
                    Ok(Some(frame)) => {
                        if frame_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(peer = %peer.short(), error = %e, "link read failed");
                        break;
                    }
                }
            }
        });

        let mut conn = Conn {
            peer,
            mux: Mux::new(
                self.local_id(),
                peer,
                self.registry.clone(),
                self.relationships.clone(),
                self.max_channels,
            ),
            out,
            fetches: HashMap::new(),
            tags: HashMap::new(),
        };

        let shared = self.store.keys();
        if !shared.is_empty() {
            let actions = self.command(&mut conn, PeerCommand::Announce(shared));
            self.dispatch(&mut conn, actions).await;
        }

        loop {
            let idle = Instant::now() + Duration::from_secs(3600);
            let deadline = conn.mux.next_deadline().unwrap_or(idle);
            let actions = tokio::select! {
                frame = frame_rx.recv() => match frame {
                    Some(frame) => conn.mux.on_frame(frame, Instant::now()),
                    None => break,
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.command(&mut conn, cmd),
                    None => break,
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    conn.mux.poll_timeouts(Instant::now())
                }
            };
            self.dispatch(&mut conn, actions).await;
        }

        read_task.abort();
        self.disconnected(&mut conn, &cmd_tx).await;
    }

    async fn disconnected(self: &Arc<Self>, conn: &mut Conn, cmd_tx: &mpsc::UnboundedSender<PeerCommand>) {
        let peer = conn.peer;
        {
            let mut peers = self.peers.lock().await;
            if peers.get(&peer).is_some_and(|tx| tx.same_channel(cmd_tx)) {
                peers.remove(&peer);
            }
        }
        let now = Instant::now();
        let gone = self.directory.remove_all_providers_for_peer(peer, now);
        if !gone.is_empty() {
            self.directory_changed.notify_one();
        }
        let dropped = self.state.lock().await.uploads.disconnect(peer);
        let keys: Vec<ResourceKey> = self.state.lock().await.downloads.keys().cloned().collect();
        for key in keys {
            self.step(&key, |s| s.on_peer_disconnected(peer)).await;
        }
        let actions = conn.mux.close_all(now);
        self.dispatch(conn, actions).await;
        tracing::info!(peer = %peer.short(), resources = gone.len(), uploads = dropped, "peer disconnected");
    }

    /// Turn a command into mux actions. Local failures come back as events.
    fn command(&self, conn: &mut Conn, cmd: PeerCommand) -> Vec<MuxAction<TransferEvent>> {
        let now = Instant::now();
        let peer = conn.peer;
        match cmd {
            PeerCommand::Probe(resource) => {
                let handler = Box::new(ProbeHandler::new(resource.clone()));
                match conn.mux.open(TRANSFER_PROTOCOL, handler, Some(self.timeout), now) {
                    Ok((_, actions)) => actions,
                    Err(e) => vec![MuxAction::Event(TransferEvent::ProbeFailed {
                        peer,
                        resource,
                        reason: e.to_string(),
                    })],
                }
            }
            PeerCommand::Fetch {
                resource,
                request,
                range,
            } => {
                let handler =
                    Box::new(FetchHandler::new(resource.clone(), request, range).with_idle_timeout(self.timeout));
                match conn.mux.open(TRANSFER_PROTOCOL, handler, Some(self.timeout), now) {
                    Ok((channel, actions)) => {
                        conn.fetches.insert((resource.clone(), request), channel);
                        conn.tags.insert(channel, (resource, request));
                        actions
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer.short(), resource = %resource, request, error = %e, "fetch not opened");
                        vec![MuxAction::Event(TransferEvent::RequestFailed {
                            peer,
                            resource,
                            request,
                            reason: FetchFailure::Interrupted(Interruption::Refused(OpenOutcome::UnavailableChannel)),
                        })]
                    }
                }
            }
            PeerCommand::Extend {
                resource,
                request,
                range,
            } => match conn.fetches.get(&(resource, request)) {
                Some(&channel) => conn.mux.signal(channel, TransferSignal::Extend(range), now),
                None => Vec::new(),
            },
            PeerCommand::Abort { resource, request } => match conn.fetches.get(&(resource, request)) {
                Some(&channel) => conn.mux.cancel(channel, now),
                None => Vec::new(),
            },
            PeerCommand::Announce(resources) => {
                let count = resources.len();
                let handler = Box::new(AnnounceHandler::announce(resources));
                match conn.mux.open(INVENTORY_PROTOCOL, handler, Some(self.timeout), now) {
                    Ok((_, actions)) => actions,
                    Err(e) => {
                        tracing::warn!(peer = %peer.short(), count, error = %e, "announce not sent");
                        Vec::new()
                    }
                }
            }
            PeerCommand::Signal { channel, signal } => conn.mux.signal(channel, signal, now),
        }
    }

    async fn dispatch(self: &Arc<Self>, conn: &mut Conn, actions: Vec<MuxAction<TransferEvent>>) {
        let mut queue: VecDeque<MuxAction<TransferEvent>> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                MuxAction::Send(frame) => {
                    // A closed writer ends the read side too.
                    let _ = conn.out.send(frame);
                }
                MuxAction::Event(event) => {
                    for (channel, signal) in self.on_event(event).await {
                        queue.extend(conn.mux.signal(channel, signal, Instant::now()));
                    }
                }
                MuxAction::Closed {
                    channel,
                    protocol,
                    outcome,
                } => {
                    tracing::debug!(peer = %conn.peer.short(), channel, %protocol, ?outcome, "conversation closed");
                    if let Some(tag) = conn.tags.remove(&channel) {
                        conn.fetches.remove(&tag);
                        continue;
                    }
                    let next = self.state.lock().await.uploads.finish(conn.peer, &channel);
                    if let Some(next) = next {
                        queue.extend(conn.mux.signal(next, TransferSignal::Grant, Instant::now()));
                    }
                }
            }
        }
    }
}
