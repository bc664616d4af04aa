//! Shoal overlay engine.
//! Host-driven: no network I/O; the host feeds frames, events and time in and
//! carries out the returned actions. The partial-file index is the one part
//! that touches the disk.

pub mod conversation;
pub mod directory;
pub mod download;
pub mod identity;
pub mod index;
pub mod integrity;
pub mod interval;
pub mod notify;
pub mod protocol;
pub mod relationship;
pub mod resource;
pub mod transfer;
pub mod upload;
pub mod wire;

pub use conversation::{
    ConversationMux, ConversationOutcome, Ctx, Handler, HandlerFactory, Interruption, MuxAction,
    ProtocolRegistry, Step,
};
pub use directory::ProviderDirectory;
pub use download::{DownloadAction, DownloadConfig, DownloadSession, DownloadState};
pub use identity::{Keypair, PeerId, PublicKey};
pub use index::{IndexConfig, IndexError, IndexHandle, IndexRegistry, PartialIndex};
pub use interval::{Interval, IntervalSet};
pub use notify::BatchPolicy;
pub use protocol::{ChannelId, CloseCode, Frame, OpenOutcome, PROTOCOL_VERSION};
pub use relationship::{RelationshipStatus, Relationships};
pub use resource::{ResourceKey, ResourceStore};
pub use transfer::{TransferEvent, TransferSignal};
pub use upload::{Admission, TokenBucket, UploadCoordinator};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
