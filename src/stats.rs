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

//! Aggregate statistics printed after the coordinator's routing loop
//! finishes. Kept separate from [`crate::broker`] since it is purely a
//! presentation concern.

use serde::Serialize;

use crate::wire::TimeVal;

#[derive(Debug, Serialize)]
pub struct RunStats {
    #[serde(rename = "Total_memory")]
    pub total_memory_kb: i64,

    #[serde(rename = "Wallclock_time")]
    pub wallclock_secs: f64,

    #[serde(rename = "Total_processes")]
    pub total_processes: u32,

    #[serde(rename = "Total_process_time", serialize_with = "serialize_timeval")]
    pub total_process_time: TimeVal,

    #[serde(rename = "Total_user_time", serialize_with = "serialize_timeval")]
    pub total_user_time: TimeVal,
}

/// Render as `seconds.microseconds` with a six-digit, zero-padded
/// fractional part, matching the original's `%ld.%06ld` formatting. Emitted
/// as a raw JSON token (not a quoted string, and not routed through
/// `serde_json`'s float formatter) since the fixed-point shape is part of
/// the documented wire contract (§4.G) and `serde_json` would otherwise
/// collapse e.g. `2.500000` down to `2.5`.
fn serialize_timeval<S>(tv: &TimeVal, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let text = format!("{}.{:06}", tv.secs, tv.micros);
    let raw = serde_json::value::RawValue::from_string(text).map_err(serde::ser::Error::custom)?;

    raw.serialize(serializer)
}

impl RunStats {
    /// The single `###OUTPUT: {...}` line printed after shutdown.
    pub fn output_line(&self) -> String {
        format!(
            "###OUTPUT: {}",
            serde_json::to_string(self).expect("RunStats always serializes")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_output_line_with_marker() {
        let stats = RunStats {
            total_memory_kb: 4096,
            wallclock_secs: 1.5,
            total_processes: 3,
            total_process_time: TimeVal { secs: 2, micros: 500_000 },
            total_user_time: TimeVal { secs: 1, micros: 250_000 },
        };

        let line = stats.output_line();

        assert!(line.starts_with("###OUTPUT: "));
        assert!(line.contains("\"Total_memory\":4096"));
        assert!(line.contains("\"Total_processes\":3"));
    }
}
