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

//! The coordinator broker: accepts peer connections, routes
//! unicast/broadcast records, and aggregates `Done` statistics. The broker
//! never inspects `Request`/`Release`/`Ack`/`Start` semantics — it is a
//! pure switch, keeping protocol logic centralized in [`crate::peer`].

use std::net::{TcpListener, TcpStream};
use std::process::Child;
use std::time::Duration;

use crate::error::BrokerError;
use crate::lifecycle;
use crate::stats::RunStats;
use crate::transport::{self, Mode, RecvOutcome};
use crate::wire::{Kind, Message, Payload, TimeVal, BROADCAST, COORDINATOR, COORDINATOR_ID};

pub const SERVER_PORT_MIN: u16 = 19999;
pub const SERVER_PORT_MAX: u16 = 29999;
pub const BIND_RETRIES: u32 = 10;

/// Running totals the coordinator accumulates from `Done` records.
#[derive(Debug, Default)]
struct Totals {
    num_done: u32,
    user_time: TimeVal,
    sys_time: TimeVal,
    max_rss: i64,
}

fn timeval_add(a: TimeVal, b: TimeVal) -> TimeVal {
    let mut secs = a.secs + b.secs;
    let mut micros = a.micros + b.micros;

    if micros >= 1_000_000 {
        micros -= 1_000_000;
        secs += 1;
    }

    TimeVal { secs, micros }
}

/// Bind a listener on an ephemeral port drawn from
/// `[SERVER_PORT_MIN, SERVER_PORT_MAX]`, retrying on failure.
pub fn bind_listener() -> Result<(TcpListener, u16), BrokerError> {
    for _ in 0..BIND_RETRIES {
        let port = SERVER_PORT_MIN
            + (rand_u16() % (SERVER_PORT_MAX - SERVER_PORT_MIN));

        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)) {
            return Ok((listener, port));
        }
    }

    Err(BrokerError::BindExhausted(
        BIND_RETRIES,
        SERVER_PORT_MIN,
        SERVER_PORT_MAX,
    ))
}

/// A small, dependency-free source of port jitter; the exact port chosen is
/// not a protocol concern (it is communicated to children out-of-band via
/// their spawn arguments), so this need not be cryptographically random.
fn rand_u16() -> u16 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    (nanos ^ (std::process::id())) as u16
}

/// Accept exactly `npeers` connections, reading the handshake record off
/// each to learn which peer id it belongs to.
pub fn accept_peers(
    listener: &TcpListener,
    npeers: i32,
) -> Result<Vec<TcpStream>, BrokerError> {
    let mut slots: Vec<Option<TcpStream>> = (0..npeers).map(|_| None).collect();
    let mut connected = 0;

    while connected < npeers {
        let (mut stream, addr) = listener.accept()?;
        log::debug!("coordinator: peer connected ({})", addr);

        match transport::recv_message(&mut stream, Mode::Blocking, npeers)? {
            RecvOutcome::Message(msg) if msg.kind == Kind::Handshake => {
                if msg.src < 0 || msg.src >= npeers {
                    return Err(BrokerError::InvalidHandshake(msg.src));
                }

                slots[msg.src as usize] = Some(stream);
                connected += 1;
            }
            RecvOutcome::Message(msg) => {
                return Err(BrokerError::InvalidHandshake(msg.src));
            }
            RecvOutcome::PeerGone => {
                log::warn!("coordinator: peer disconnected before handshake");
            }
            RecvOutcome::Empty => unreachable!("blocking recv never returns Empty"),
        }
    }

    log::info!("All peers connected.");

    Ok(slots.into_iter().map(|s| s.unwrap()).collect())
}

/// Broadcast `Start`, run the routing loop until every peer is `Done`, then
/// broadcast the terminating `Done` and close every connection.
///
/// On any error, every still-running child is killed before the error is
/// returned — a child's unexpected exit or a transport failure partway
/// through the run is fatal to the coordinator (§7), and this is the one
/// place that owns the children to act on that.
pub fn run(
    mut connections: Vec<TcpStream>,
    mut children: Vec<Child>,
) -> Result<RunStats, BrokerError> {
    match route_until_done(&mut connections, &mut children) {
        Ok((totals, wallclock)) => {
            let _ = broadcast(&mut connections, &Message::shutdown_done(COORDINATOR_ID));

            for conn in &connections {
                let _ = conn.shutdown(std::net::Shutdown::Both);
            }

            for child in &mut children {
                let _ = child.wait();
            }

            Ok(RunStats {
                total_memory_kb: totals.max_rss,
                wallclock_secs: wallclock,
                total_processes: connections.len() as u32,
                total_process_time: timeval_add(totals.user_time, totals.sys_time),
                total_user_time: totals.user_time,
            })
        }
        Err(e) => {
            lifecycle::kill_children(&mut children);
            Err(e)
        }
    }
}

fn route_until_done(
    connections: &mut Vec<TcpStream>,
    children: &mut [Child],
) -> Result<(Totals, f64), BrokerError> {
    let npeers = connections.len() as i32;
    let wallclock_start = std::time::Instant::now();

    broadcast(connections, &Message::start(COORDINATOR_ID, 0))?;

    let mut totals = Totals::default();

    while totals.num_done < npeers as u32 {
        for i in 0..connections.len() {
            let outcome = transport::recv_message(&mut connections[i], Mode::NonBlocking, npeers)?;

            match outcome {
                RecvOutcome::Empty => continue,
                RecvOutcome::PeerGone => {
                    return Err(BrokerError::ChildDied(i as i32));
                }
                RecvOutcome::Message(msg) => route(connections, &mut totals, msg)?,
            }
        }

        for (i, child) in children.iter_mut().enumerate() {
            if totals.num_done >= npeers as u32 {
                break;
            }

            if let Some(_status) = child.try_wait()? {
                return Err(BrokerError::ChildDied(i as i32));
            }
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    Ok((totals, wallclock_start.elapsed().as_secs_f64()))
}

fn route(
    connections: &mut [TcpStream],
    totals: &mut Totals,
    msg: Message,
) -> Result<(), BrokerError> {
    match msg.dest {
        BROADCAST => broadcast(connections, &msg),
        COORDINATOR => {
            handle_coordinator_message(totals, msg);
            Ok(())
        }
        dest if dest >= 0 && (dest as usize) < connections.len() => {
            transport::send_message(&mut connections[dest as usize], &msg)?;
            Ok(())
        }
        dest => Err(BrokerError::InvalidRoute(dest)),
    }
}

fn broadcast(connections: &mut [TcpStream], msg: &Message) -> Result<(), BrokerError> {
    // Self-delivery is load-bearing: every connection, including the
    // sender's own, must receive the broadcast so the sender observes its
    // own Request/Release in its peer table.
    for conn in connections.iter_mut() {
        transport::send_message(conn, msg)?;
    }

    Ok(())
}

fn handle_coordinator_message(totals: &mut Totals, msg: Message) {
    match msg.kind {
        Kind::Done => {
            if let Payload::Done {
                user_time,
                sys_time,
                max_rss,
            } = msg.payload
            {
                totals.num_done += 1;
                totals.user_time = timeval_add(totals.user_time, user_time);
                totals.sys_time = timeval_add(totals.sys_time, sys_time);
                totals.max_rss += max_rss;
            }
        }
        other => {
            log::warn!(
                "coordinator: dropping unexpected record addressed to coordinator: {:?}",
                other
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn timeval_add_carries_overflow_micros_into_seconds() {
        let a = TimeVal { secs: 1, micros: 700_000 };
        let b = TimeVal { secs: 2, micros: 500_000 };

        assert_eq!(timeval_add(a, b), TimeVal { secs: 4, micros: 200_000 });
    }

    #[test]
    fn timeval_add_without_overflow() {
        let a = TimeVal { secs: 1, micros: 100 };
        let b = TimeVal { secs: 2, micros: 200 };

        assert_eq!(timeval_add(a, b), TimeVal { secs: 3, micros: 300 });
    }

    #[test]
    fn handle_coordinator_message_accumulates_done_totals() {
        let mut totals = Totals::default();

        handle_coordinator_message(
            &mut totals,
            Message::done(
                0,
                TimeVal { secs: 1, micros: 0 },
                TimeVal { secs: 0, micros: 500_000 },
                1024,
            ),
        );
        handle_coordinator_message(
            &mut totals,
            Message::done(
                1,
                TimeVal { secs: 2, micros: 0 },
                TimeVal { secs: 0, micros: 600_000 },
                2048,
            ),
        );

        assert_eq!(totals.num_done, 2);
        assert_eq!(totals.user_time, TimeVal { secs: 3, micros: 0 });
        assert_eq!(totals.sys_time, TimeVal { secs: 1, micros: 100_000 });
        assert_eq!(totals.max_rss, 3072);
    }

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        (client, server)
    }

    #[test]
    fn broadcast_delivers_to_every_connection_including_source() {
        let (a0, mut b0) = connected_pair();
        let (a1, mut b1) = connected_pair();
        let mut connections = vec![a0, a1];

        broadcast(&mut connections, &Message::release(0, BROADCAST, 3)).unwrap();

        for conn in [&mut b0, &mut b1] {
            match transport::recv_message(conn, Mode::Blocking, 2).unwrap() {
                RecvOutcome::Message(m) => assert_eq!(m.kind, Kind::Release),
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
    }

    #[test]
    fn route_unicasts_to_the_addressed_peer_only() {
        let (a0, mut b0) = connected_pair();
        let (a1, mut b1) = connected_pair();
        let mut connections = vec![a0, a1];
        let mut totals = Totals::default();

        route(&mut connections, &mut totals, Message::ack(1, 0, 9)).unwrap();

        match transport::recv_message(&mut b0, Mode::NonBlocking, 2).unwrap() {
            RecvOutcome::Message(m) => assert_eq!(m.kind, Kind::Ack),
            other => panic!("unexpected outcome: {:?}", other),
        }
        match transport::recv_message(&mut b1, Mode::NonBlocking, 2).unwrap() {
            RecvOutcome::Empty => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn route_rejects_an_unroutable_destination() {
        let (a0, _b0) = connected_pair();
        let mut connections = vec![a0];
        let mut totals = Totals::default();

        let err = route(&mut connections, &mut totals, Message::ack(0, 5, 1)).unwrap_err();

        assert!(matches!(err, BrokerError::InvalidRoute(5)));
    }
}
