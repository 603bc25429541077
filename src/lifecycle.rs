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

//! Process spawning and connection establishment.
//!
//! The original benchmark forks children before its listening socket is
//! ready and uses a `SIGUSR1` + `sigsuspend` barrier so children don't race
//! the coordinator's `listen()`. Rust has no safe `fork()` that children
//! could run arbitrary code after (see DESIGN.md), so this crate re-execs
//! its own binary per peer instead, and binds the listener *before*
//! spawning any child — removing the race, and the barrier, entirely.

use std::net::{SocketAddr, TcpStream};
use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

use crate::error::LifecycleError;
use crate::wire::Message;

pub const PEER_ROLE_FLAG: &str = "--peer-role";

const CONNECT_RETRIES: u32 = 100;
const CONNECT_BACKOFF: Duration = Duration::from_millis(20);

/// Re-exec the current binary in the hidden peer role, passing `id`,
/// `npeers`, `nrounds`, and the coordinator's bound `port` as arguments.
pub fn spawn_peer(
    id: i32,
    npeers: i32,
    nrounds: u32,
    port: u16,
) -> Result<Child, LifecycleError> {
    let exe = std::env::current_exe().map_err(LifecycleError::CurrentExe)?;

    log::info!("Forking child {}.", id);

    Command::new(exe)
        .arg(PEER_ROLE_FLAG)
        .arg(id.to_string())
        .arg(npeers.to_string())
        .arg(nrounds.to_string())
        .arg(port.to_string())
        .spawn()
        .map_err(|source| LifecycleError::Spawn { peer: id, source })
}

/// Connect to the coordinator on `127.0.0.1:port`, retrying with a short
/// backoff. This is a structured-loop replacement for the original's
/// `goto`-based reconnect.
pub fn connect_to_coordinator(id: i32, port: u16) -> Result<TcpStream, LifecycleError> {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    log::info!("{} unfrozen.", id);

    connect_with_retry(addr, id).map_err(|_| LifecycleError::ConnectExhausted(CONNECT_RETRIES))
}

/// Retry loop shared by initial connect and post-`PeerGone` reconnect.
pub fn connect_with_retry(addr: SocketAddr, id: i32) -> Result<TcpStream, std::io::Error> {
    let mut last_err = None;

    for attempt in 0..CONNECT_RETRIES {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                log::debug!(
                    "peer {}: connect attempt {} failed: {}",
                    id,
                    attempt,
                    e
                );
                last_err = Some(e);
                thread::sleep(CONNECT_BACKOFF);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::TimedOut, "connect retries exhausted")
    }))
}

/// Send the handshake record identifying this connection as belonging to
/// peer `id`.
pub fn send_handshake(stream: &mut TcpStream, id: i32) -> Result<(), std::io::Error> {
    crate::transport::send_message(stream, &Message::handshake(id))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

/// Terminate every still-running child. Best-effort: failures to kill an
/// already-exited child are ignored.
pub fn kill_children(children: &mut [Child]) {
    for child in children.iter_mut() {
        let _ = child.kill();
        let _ = child.wait();
    }
}
