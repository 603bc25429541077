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

//! Fixed-size wire record for the Lamport mutual-exclusion protocol.
//!
//! Every record is exactly [`Message::WIRE_LEN`] bytes, regardless of kind,
//! so the transport layer can always pre-commit a read of that many bytes.

use std::convert::TryFrom;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// `dest` value meaning "deliver to every peer, including the sender".
pub const BROADCAST: i32 = -1;

/// `dest` value meaning "deliver to the coordinator's own handler".
pub const COORDINATOR: i32 = -2;

/// `src` value the coordinator uses to identify itself as a sender. Numerically
/// distinct from [`COORDINATOR`]: that constant only ever appears as a `dest`.
pub const COORDINATOR_ID: i32 = -1;

/// Message kind, repr as a single `u8` on the wire.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Kind {
    Request = 1,
    Release = 2,
    Ack = 3,
    Done = 4,
    Start = 5,

    /// Startup handshake: a peer announcing its id to the coordinator.
    /// Never forwarded to another peer; handled only during connection setup.
    Handshake = 6,
}

impl TryFrom<u8> for Kind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            x if x == Kind::Request as u8 => Ok(Kind::Request),
            x if x == Kind::Release as u8 => Ok(Kind::Release),
            x if x == Kind::Ack as u8 => Ok(Kind::Ack),
            x if x == Kind::Done as u8 => Ok(Kind::Done),
            x if x == Kind::Start as u8 => Ok(Kind::Start),
            x if x == Kind::Handshake as u8 => Ok(Kind::Handshake),
            x => Err(WireError::Malformed(x)),
        }
    }
}

/// A `{seconds, microseconds}` pair, matching the original `struct timeval`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeVal {
    pub secs: i64,
    pub micros: i64,
}

/// Payload discriminated by [`Kind`]. `Request`/`Release`/`Ack`/`Start` all
/// carry a single logical clock; `Done` carries the resource-usage summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    Clock(i64),
    Done {
        user_time: TimeVal,
        sys_time: TimeVal,
        max_rss: i64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: Kind,
    pub dest: i32,
    pub src: i32,
    pub payload: Payload,
}

impl Message {
    /// kind(1) + dest(4) + src(4) + payload(40, sized for the `Done` variant).
    pub const WIRE_LEN: usize = 1 + 4 + 4 + 40;

    pub fn request(src: i32, dest: i32, clock: i64) -> Self {
        Self {
            kind: Kind::Request,
            dest,
            src,
            payload: Payload::Clock(clock),
        }
    }

    pub fn release(src: i32, dest: i32, clock: i64) -> Self {
        Self {
            kind: Kind::Release,
            dest,
            src,
            payload: Payload::Clock(clock),
        }
    }

    pub fn ack(src: i32, dest: i32, clock: i64) -> Self {
        Self {
            kind: Kind::Ack,
            dest,
            src,
            payload: Payload::Clock(clock),
        }
    }

    pub fn start(src: i32, clock: i64) -> Self {
        Self {
            kind: Kind::Start,
            dest: BROADCAST,
            src,
            payload: Payload::Clock(clock),
        }
    }

    pub fn handshake(src: i32) -> Self {
        Self {
            kind: Kind::Handshake,
            dest: COORDINATOR,
            src,
            payload: Payload::Clock(0),
        }
    }

    pub fn done(
        src: i32,
        user_time: TimeVal,
        sys_time: TimeVal,
        max_rss: i64,
    ) -> Self {
        Self {
            kind: Kind::Done,
            dest: COORDINATOR,
            src,
            payload: Payload::Done {
                user_time,
                sys_time,
                max_rss,
            },
        }
    }

    pub fn shutdown_done(src: i32) -> Self {
        Self {
            kind: Kind::Done,
            dest: BROADCAST,
            src,
            payload: Payload::Done {
                user_time: TimeVal::default(),
                sys_time: TimeVal::default(),
                max_rss: 0,
            },
        }
    }

    /// Logical clock carried by a `Request`/`Release`/`Ack`/`Start` record.
    ///
    /// `Done` records carry no clock; callers match on `kind` first, so this
    /// never actually sees one, but unconditionally panics rather than
    /// return a fabricated value if it ever does.
    pub fn clock(&self) -> i64 {
        match self.payload {
            Payload::Clock(c) => c,
            Payload::Done { .. } => unreachable!("Done records carry no logical clock"),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);

        buf.put_u8(self.kind as u8);
        buf.put_i32_le(self.dest);
        buf.put_i32_le(self.src);

        match self.payload {
            Payload::Clock(c) => {
                buf.put_i64_le(c);
                buf.put_bytes(0, 40 - 8);
            }
            Payload::Done {
                user_time,
                sys_time,
                max_rss,
            } => {
                buf.put_i64_le(user_time.secs);
                buf.put_i64_le(user_time.micros);
                buf.put_i64_le(sys_time.secs);
                buf.put_i64_le(sys_time.micros);
                buf.put_i64_le(max_rss);
            }
        }

        debug_assert_eq!(buf.len(), Self::WIRE_LEN);

        buf.freeze()
    }

    /// Decode a record, validating `src`/`dest` fall within
    /// `[-2, npeers - 1]` for the configured peer count.
    pub fn decode(mut bytes: &[u8], npeers: i32) -> Result<Self, WireError> {
        if bytes.len() < Self::WIRE_LEN {
            return Err(WireError::Truncated {
                expected: Self::WIRE_LEN,
                got: bytes.len(),
            });
        }

        let kind = Kind::try_from(bytes.get_u8())?;
        let dest = bytes.get_i32_le();
        let src = bytes.get_i32_le();

        for id in [dest, src] {
            if id < COORDINATOR || id >= npeers {
                return Err(WireError::InvalidPeer(id));
            }
        }

        let payload = match kind {
            Kind::Done => {
                let user_time = TimeVal {
                    secs: bytes.get_i64_le(),
                    micros: bytes.get_i64_le(),
                };
                let sys_time = TimeVal {
                    secs: bytes.get_i64_le(),
                    micros: bytes.get_i64_le(),
                };
                let max_rss = bytes.get_i64_le();

                Payload::Done {
                    user_time,
                    sys_time,
                    max_rss,
                }
            }
            Kind::Request | Kind::Release | Kind::Ack | Kind::Start | Kind::Handshake => {
                Payload::Clock(bytes.get_i64_le())
            }
        };

        Ok(Self {
            kind,
            dest,
            src,
            payload,
        })
    }
}
