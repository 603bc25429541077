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

//! The per-peer mutual-exclusion state machine: Lamport clock, per-peer
//! request table, and ACK set.

use std::collections::HashSet;
use std::net::TcpStream;

use crate::error::PeerError;
use crate::transport::{self, Mode, RecvOutcome};
use crate::wire::{Kind, Message, BROADCAST, COORDINATOR_ID};

/// What a peer knows about another peer's (or its own) request state.
#[derive(Debug, Clone, Copy)]
pub struct PeerRecord {
    pub id: i32,
    pub clock: i64,
    pub requesting: bool,
}

impl PeerRecord {
    fn new(id: i32) -> Self {
        Self {
            id,
            clock: 0,
            requesting: false,
        }
    }
}

/// Owns the one connection to the coordinator and all local protocol state
/// for a single peer process.
pub struct Peer {
    pub id: i32,
    npeers: i32,
    stream: TcpStream,

    clock: i64,
    peer_table: Vec<PeerRecord>,
    ack_set: HashSet<i32>,
    started: bool,
    shutdown: bool,
}

impl Peer {
    pub fn new(id: i32, npeers: i32, stream: TcpStream) -> Self {
        Self {
            id,
            npeers,
            stream,
            clock: 0,
            peer_table: (0..npeers).map(PeerRecord::new).collect(),
            ack_set: HashSet::with_capacity(npeers as usize),
            started: false,
            shutdown: false,
        }
    }

    pub fn clock(&self) -> i64 {
        self.clock
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn ack_count(&self) -> usize {
        self.ack_set.len()
    }

    pub fn peer_record(&self, id: i32) -> &PeerRecord {
        &self.peer_table[id as usize]
    }

    /// Drain and process every record currently available without blocking.
    pub fn yield_non_blocking(&mut self) -> Result<(), PeerError> {
        loop {
            match transport::recv_message(&mut self.stream, Mode::NonBlocking, self.npeers)? {
                RecvOutcome::Empty => return Ok(()),
                RecvOutcome::Message(msg) => self.handle_message(msg),
                RecvOutcome::PeerGone => return self.reconnect(),
            }
        }
    }

    /// Block until at least one record has been processed.
    pub fn yield_blocking(&mut self) -> Result<(), PeerError> {
        match transport::recv_message(&mut self.stream, Mode::Blocking, self.npeers)? {
            RecvOutcome::Message(msg) => {
                self.handle_message(msg);
                Ok(())
            }
            RecvOutcome::Empty => unreachable!("blocking recv never returns Empty"),
            RecvOutcome::PeerGone => self.reconnect(),
        }
    }

    fn reconnect(&mut self) -> Result<(), PeerError> {
        let addr = self.stream.peer_addr()?;
        let mut stream = crate::lifecycle::connect_with_retry(addr, self.id)
            .map_err(|_| PeerError::ReconnectExhausted(0))?;
        crate::lifecycle::send_handshake(&mut stream, self.id)?;
        self.stream = stream;
        Ok(())
    }

    /// Apply one received record to local state. Every [`Kind`] arm is
    /// terminal; there is no silent default fallthrough.
    fn handle_message(&mut self, message: Message) {
        let from = message.src;

        // A peer only ever observes records whose `src` is another peer
        // (`0..npeers`) or the coordinator itself (`-1`); `-2` is a `dest`-only
        // address and never appears as a sender.
        if from < BROADCAST || from >= self.npeers {
            log::warn!("peer {}: dropping record from invalid peer {}", self.id, from);
            return;
        }

        match message.kind {
            Kind::Request => {
                let c = message.clock();
                if from >= 0 {
                    let record = &mut self.peer_table[from as usize];
                    record.requesting = true;
                    record.clock = c;
                }
                self.clock = self.clock.max(c) + 1;

                if let Err(e) = transport::send_message(
                    &mut self.stream,
                    &Message::ack(self.id, from, self.clock),
                ) {
                    log::error!("peer {}: failed to send ACK to {}: {}", self.id, from, e);
                }
            }
            Kind::Ack => {
                self.ack_set.insert(from);
            }
            Kind::Release => {
                if from >= 0 {
                    self.peer_table[from as usize].requesting = false;
                }
            }
            Kind::Start => {
                self.started = true;
            }
            Kind::Done => {
                self.shutdown = true;
            }
            Kind::Handshake => {
                log::warn!("peer {}: received stray handshake record from {}", self.id, from);
            }
        }
    }

    /// The peer, among those currently requesting, with the smallest
    /// `(clock, id)` pair. `None` if nobody is requesting.
    fn min_requesting_peer(&self) -> Option<i32> {
        self.peer_table
            .iter()
            .filter(|p| p.requesting)
            .min_by_key(|p| (p.clock, p.id))
            .map(|p| p.id)
    }

    fn predicate_holds(&self) -> bool {
        self.ack_count() == self.npeers as usize
            && self.min_requesting_peer() == Some(self.id)
    }

    /// Clear the ACK set, broadcast a `Request`, and block until this peer
    /// has collected an ACK from every peer and wins the `(clock, id)`
    /// comparison among all currently-requesting peers.
    pub fn enter_critical_section(&mut self) -> Result<(), PeerError> {
        self.ack_set.clear();

        transport::send_message(
            &mut self.stream,
            &Message::request(self.id, BROADCAST, self.clock),
        )?;

        while !self.predicate_holds() {
            self.yield_blocking()?;
        }

        Ok(())
    }

    /// Broadcast `Release`. The coordinator's broadcast self-delivery will
    /// echo this back and clear our own `requesting` flag through the
    /// normal `Release` handler.
    pub fn leave_critical_section(&mut self) -> Result<(), PeerError> {
        transport::send_message(
            &mut self.stream,
            &Message::release(self.id, BROADCAST, self.clock),
        )?;

        Ok(())
    }

    pub fn send_done(
        &mut self,
        user_time: crate::wire::TimeVal,
        sys_time: crate::wire::TimeVal,
        max_rss: i64,
    ) -> Result<(), PeerError> {
        transport::send_message(
            &mut self.stream,
            &Message::done(self.id, user_time, sys_time, max_rss),
        )?;

        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn make_peer(id: i32, npeers: i32) -> (Peer, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        (Peer::new(id, npeers, client), server)
    }

    #[test]
    fn request_bumps_clock_and_marks_requesting() {
        let (mut peer, _server) = make_peer(0, 3);

        peer.handle_message(Message::request(1, 0, 5));

        assert_eq!(peer.clock(), 6);
        assert!(peer.peer_record(1).requesting);
        assert_eq!(peer.peer_record(1).clock, 5);
    }

    #[test]
    fn duplicate_acks_are_idempotent() {
        let (mut peer, _server) = make_peer(0, 3);

        peer.handle_message(Message::ack(1, 0, 1));
        peer.handle_message(Message::ack(1, 0, 1));

        assert_eq!(peer.ack_count(), 1);
    }

    #[test]
    fn release_clears_requesting() {
        let (mut peer, _server) = make_peer(0, 3);

        peer.handle_message(Message::request(1, 0, 5));
        assert!(peer.peer_record(1).requesting);

        peer.handle_message(Message::release(1, 0, 5));
        assert!(!peer.peer_record(1).requesting);
    }

    #[test]
    fn start_sets_started_flag() {
        let (mut peer, _server) = make_peer(0, 3);

        assert!(!peer.started());
        peer.handle_message(Message::start(COORDINATOR_ID, 0));
        assert!(peer.started());
    }

    #[test]
    fn predicate_requires_full_ack_set_and_minimum_clock() {
        let (mut peer, _server) = make_peer(1, 3);

        // Peer 1 has ACKs from everyone but peer 0 is requesting with a
        // smaller clock, so peer 1 must not win.
        peer.handle_message(Message::ack(0, 1, 0));
        peer.handle_message(Message::ack(1, 1, 0));
        peer.handle_message(Message::ack(2, 1, 0));
        peer.handle_message(Message::request(0, 1, 1));
        peer.peer_table[1].requesting = true;
        peer.peer_table[1].clock = 5;

        assert_eq!(peer.ack_count(), 3);
        assert!(!peer.predicate_holds());

        peer.peer_table[0].requesting = false;
        assert!(peer.predicate_holds());
    }
}
