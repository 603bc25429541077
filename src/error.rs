// Lrthrome - Fast and light TCP-server based IPv4 CIDR filter lookup server over minimal binary protocol, and memory footprint
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use thiserror::Error;

/// Errors from [`crate::wire`] decoding.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed record, unrecognized kind {0}")]
    Malformed(u8),

    #[error("record addresses invalid peer {0}")]
    InvalidPeer(i32),

    #[error("truncated record, expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
}

/// Errors from [`crate::transport`] send/recv.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("recv failed: {0}")]
    Recv(#[source] std::io::Error),

    #[error("received record: {0}")]
    Wire(#[from] WireError),
}

/// Errors from the coordinator broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("exhausted {0} bind attempts in port range [{1}, {2}]")]
    BindExhausted(u32, u16, u16),

    #[error("handshake carried invalid peer id {0}")]
    InvalidHandshake(i32),

    #[error("record addressed an unroutable destination {0}")]
    InvalidRoute(i32),

    #[error("child for peer {0} exited before the run completed")]
    ChildDied(i32),
}

/// Errors from a peer process.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("failed to reconnect to coordinator after {0} attempts")]
    ReconnectExhausted(u32),
}

/// Errors from process spawn/join in the lifecycle controller.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to spawn child for peer {peer}: {source}")]
    Spawn {
        peer: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to locate current executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    #[error("failed to connect to coordinator after {0} attempts")]
    ConnectExhausted(u32),
}

/// Top-level error aggregating every subsystem, surfaced at the process
/// boundary with a stable (within this crate) non-zero exit code.
#[derive(Debug, Error)]
pub enum LamutexError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl LamutexError {
    /// Stable exit code for this build. `0` is reserved for success and is
    /// never returned here.
    pub fn exit_code(&self) -> i32 {
        match self {
            LamutexError::Usage(_) => 1,
            LamutexError::Broker(BrokerError::BindExhausted(..)) => 2,
            LamutexError::Lifecycle(LifecycleError::Spawn { .. }) => 3,
            LamutexError::Lifecycle(LifecycleError::CurrentExe(_)) => 3,
            LamutexError::Lifecycle(LifecycleError::ConnectExhausted(_)) => 4,
            LamutexError::Broker(BrokerError::InvalidHandshake(_)) => 5,
            LamutexError::Broker(BrokerError::ChildDied(_)) => 6,
            LamutexError::Peer(PeerError::ReconnectExhausted(_)) => 7,
            LamutexError::Broker(_) => 8,
            LamutexError::Peer(_) => 9,
        }
    }
}

pub type WireResult<T> = std::result::Result<T, WireError>;
pub type TransportResult<T> = std::result::Result<T, TransportError>;
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
pub type PeerResult<T> = std::result::Result<T, PeerError>;
pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;
