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

//! Command-line surface: `clap` is used only for parsing/validation and
//! `--help`, not to add a subcommand surface beyond the two positional
//! arguments.

use clap::Parser;

use crate::error::LamutexError;

pub const MAX_NPEERS: u32 = 500;

#[derive(Debug, Parser)]
#[clap(name = "lamutex", about = "Benchmark of Lamport's distributed mutual-exclusion algorithm")]
pub struct Cli {
    /// Number of peer processes.
    #[clap(default_value = "10")]
    pub npeers: u32,

    /// Number of critical-section rounds each peer performs.
    #[clap(default_value = "5")]
    pub nrounds: u32,
}

impl Cli {
    pub fn validate(self) -> Result<(u32, u32), LamutexError> {
        if self.npeers < 1 || self.npeers > MAX_NPEERS {
            return Err(LamutexError::Usage(format!(
                "npeers must be between 1 and {}, got {}",
                MAX_NPEERS, self.npeers
            )));
        }

        Ok((self.npeers, self.nrounds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cli = Cli::parse_from(["lamutex"]);

        assert_eq!(cli.npeers, 10);
        assert_eq!(cli.nrounds, 5);
    }

    #[test]
    fn rejects_zero_peers() {
        let cli = Cli::parse_from(["lamutex", "0", "5"]);

        assert!(cli.validate().is_err());
    }

    #[test]
    fn rejects_too_many_peers() {
        let cli = Cli::parse_from(["lamutex", "501", "5"]);

        assert!(cli.validate().is_err());
    }

    #[test]
    fn accepts_boundary_values() {
        let cli = Cli::parse_from(["lamutex", "500", "0"]);

        assert_eq!(cli.validate().unwrap(), (500, 0));
    }
}
