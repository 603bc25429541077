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

//! The benchmark round loop run by each peer process.

use crate::error::{LamutexError, PeerError};
use crate::lifecycle;
use crate::peer::Peer;
use crate::wire::TimeVal;

/// Wraps `getrusage(2)`, kept behind this narrow interface so the rest of
/// the round loop doesn't touch `libc` directly.
fn rusage_self() -> (TimeVal, TimeVal, i64) {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    // SAFETY: `usage` is a plain-old-data struct sized for RUSAGE_SELF and
    // fully overwritten by a successful call; a failure (which can only
    // happen for an invalid `who`, impossible here) leaves it zeroed.
    unsafe {
        libc::getrusage(libc::RUSAGE_SELF, &mut usage);
    }

    let user = TimeVal {
        secs: usage.ru_utime.tv_sec as i64,
        micros: usage.ru_utime.tv_usec as i64,
    };
    let sys = TimeVal {
        secs: usage.ru_stime.tv_sec as i64,
        micros: usage.ru_stime.tv_usec as i64,
    };

    (user, sys, usage.ru_maxrss as i64)
}

fn timeval_sub(a: TimeVal, b: TimeVal) -> TimeVal {
    let mut secs = a.secs - b.secs;
    let mut micros = a.micros - b.micros;

    if micros < 0 {
        micros += 1_000_000;
        secs -= 1;
    }

    TimeVal { secs, micros }
}

/// Runs the full per-peer protocol: wait for `Start`, run `rounds` critical
/// section entries, report resource usage, and wait for the coordinator's
/// terminating `Done`.
pub fn run(mut peer: Peer, rounds: u32) -> Result<(), PeerError> {
    while !peer.started() {
        peer.yield_blocking()?;
    }

    let (start_user, start_sys, _) = rusage_self();

    for round in 0..rounds {
        peer.yield_non_blocking()?;

        peer.enter_critical_section()?;

        log::info!("P{} is in CS with clock {}.", peer.id, peer.clock());

        peer.yield_non_blocking()?;
        peer.yield_non_blocking()?;

        log::info!("P{} is leaving CS - {}.", peer.id, round);

        peer.leave_critical_section()?;
    }

    let (end_user, end_sys, max_rss) = rusage_self();

    peer.send_done(
        timeval_sub(end_user, start_user),
        timeval_sub(end_sys, start_sys),
        max_rss,
    )?;

    while !peer.is_shutdown() {
        peer.yield_blocking()?;
    }

    Ok(())
}

/// Connects to the coordinator, sends the handshake, and runs the peer.
/// This is the entry point the re-exec'd child process calls.
pub fn run_child(id: i32, npeers: i32, nrounds: u32, port: u16) -> Result<(), LamutexError> {
    let mut stream = lifecycle::connect_to_coordinator(id, port)?;

    lifecycle::send_handshake(&mut stream, id).map_err(|e| {
        LamutexError::Peer(PeerError::Io(e))
    })?;

    let peer = Peer::new(id, npeers, stream);

    run(peer, nrounds).map_err(LamutexError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeval_sub_borrows_from_seconds_when_micros_underflow() {
        let end = TimeVal { secs: 5, micros: 100 };
        let start = TimeVal { secs: 2, micros: 900 };

        assert_eq!(
            timeval_sub(end, start),
            TimeVal { secs: 2, micros: 999_200 }
        );
    }

    #[test]
    fn timeval_sub_without_borrow() {
        let end = TimeVal { secs: 5, micros: 900 };
        let start = TimeVal { secs: 2, micros: 100 };

        assert_eq!(timeval_sub(end, start), TimeVal { secs: 3, micros: 800 });
    }
}
