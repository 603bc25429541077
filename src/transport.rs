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

//! Reliable send/receive of whole [`Message`] records over a `TcpStream`.
//!
//! There is no async runtime here by design: a peer is one cooperative
//! thread of control that alternates between user code and a yield, so
//! plain blocking/non-blocking reads on `std::net::TcpStream` express the
//! model directly (see DESIGN.md).

use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;

use crate::error::TransportError;
use crate::wire::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Blocking,
    NonBlocking,
}

/// Outcome of a single [`recv_message`] call.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A full record was read and decoded.
    Message(Message),

    /// `NonBlocking` mode and no data was immediately available.
    Empty,

    /// The peer closed its write half before a full record arrived.
    PeerGone,
}

/// Write one encoded record in full, retrying on `Interrupted`.
pub fn send_message(stream: &mut TcpStream, message: &Message) -> Result<(), TransportError> {
    let bytes = message.encode();
    let mut remaining = &bytes[..];

    while !remaining.is_empty() {
        match stream.write(remaining) {
            Ok(0) => {
                return Err(TransportError::Send(io::Error::new(
                    ErrorKind::WriteZero,
                    "connection closed mid-write",
                )))
            }
            Ok(n) => remaining = &remaining[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Send(e)),
        }
    }

    Ok(())
}

/// Read exactly one record, in `mode`, validating addressed peers against
/// `npeers`.
pub fn recv_message(
    stream: &mut TcpStream,
    mode: Mode,
    npeers: i32,
) -> Result<RecvOutcome, TransportError> {
    stream
        .set_nonblocking(mode == Mode::NonBlocking)
        .map_err(TransportError::Recv)?;

    let mut buf = [0u8; Message::WIRE_LEN];
    let mut filled = 0;

    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    Ok(RecvOutcome::PeerGone)
                } else {
                    Err(TransportError::Recv(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "peer closed mid-record",
                    )))
                }
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if filled == 0 && mode == Mode::NonBlocking {
                    return Ok(RecvOutcome::Empty);
                }
                continue;
            }
            Err(e) => return Err(TransportError::Recv(e)),
        }
    }

    let message = Message::decode(&buf, npeers)?;

    Ok(RecvOutcome::Message(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::BROADCAST;
    use std::net::TcpListener;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        (client, server)
    }

    #[test]
    fn sends_and_receives_blocking() {
        let (mut a, mut b) = connected_pair();

        let msg = Message::request(1, BROADCAST, 42);
        send_message(&mut a, &msg).unwrap();

        match recv_message(&mut b, Mode::Blocking, 10).unwrap() {
            RecvOutcome::Message(m) => assert_eq!(m, msg),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn non_blocking_recv_is_empty_without_data() {
        let (_a, mut b) = connected_pair();

        match recv_message(&mut b, Mode::NonBlocking, 10).unwrap() {
            RecvOutcome::Empty => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn peer_gone_on_close() {
        let (a, mut b) = connected_pair();
        drop(a);

        match recv_message(&mut b, Mode::Blocking, 10).unwrap() {
            RecvOutcome::PeerGone => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
