//! Link protocol: frames multiplexing conversations over one peer connection.

use serde::{Deserialize, Serialize};

/// Current link protocol version. Sent first in the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Channel number, allocated by the side that opens the conversation.
pub type ChannelId = u32;

/// Answer to an `Open` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenOutcome {
    Granted,
    /// No factory registered under the requested protocol name.
    UnrecognizedProtocol,
    /// The factory refused this peer.
    RequestDenied,
    /// No free channel slot on the remote side.
    UnavailableChannel,
    /// The remote answered something that makes no sense for this channel.
    UnexpectedResponse,
}

/// Why a channel was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseCode {
    /// Conversation reached its terminal state normally.
    Done,
    Failed,
    Cancelled,
    TimedOut,
    /// Frame referenced a channel the receiver does not know.
    UnexpectedResponse,
}

/// All link frames. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Ask the remote to start a conversation for `protocol` on `channel`.
    Open { channel: ChannelId, protocol: String },
    OpenReply {
        channel: ChannelId,
        outcome: OpenOutcome,
    },
    /// Protocol payload for one conversation.
    Data {
        channel: ChannelId,
        payload: Vec<u8>,
    },
    Close { channel: ChannelId, code: CloseCode },
}

impl Frame {
    pub fn channel(&self) -> ChannelId {
        match self {
            Frame::Open { channel, .. }
            | Frame::OpenReply { channel, .. }
            | Frame::Data { channel, .. }
            | Frame::Close { channel, .. } => *channel,
        }
    }
}
