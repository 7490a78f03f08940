/*
 * This file is a part of NTDB
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Capability records.
//!
//! A capability is a `(type, flags)` pair chained off the header, used to
//! signal "a feature beyond the base format is in use here" without
//! bumping the whole-file version number. An opener that doesn't recognize
//! a capability's type must still honour its flags: refuse to open
//! (`NOOPEN`), open read-only (`NOWRITE`), or skip consistency checking it
//! doesn't understand (`NOCHECK`).

use crate::error::{Error, Result};
use crate::format::{CAP_NOCHECK, CAP_NOOPEN, CAP_NOWRITE, CAP_TYPE_MASK};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub cap_type: u64,
    pub no_open: bool,
    pub no_write: bool,
    pub no_check: bool,
    pub next: u64,
}

impl Capability {
    pub fn decode(raw: u64, next: u64) -> Self {
        Capability {
            cap_type: raw & CAP_TYPE_MASK,
            no_open: raw & CAP_NOOPEN != 0,
            no_write: raw & CAP_NOWRITE != 0,
            no_check: raw & CAP_NOCHECK != 0,
            next,
        }
    }

    pub fn encode(&self) -> u64 {
        let mut v = self.cap_type & CAP_TYPE_MASK;
        if self.no_open {
            v |= CAP_NOOPEN;
        }
        if self.no_write {
            v |= CAP_NOWRITE;
        }
        if self.no_check {
            v |= CAP_NOCHECK;
        }
        v
    }
}

/// Known capability types this implementation understands. Anything else
/// is "unknown" and handled purely through its flags.
pub const CAP_TYPE_NONE: u64 = 0;

/// Walk the capability chain applying the open-time policy: refuse to open
/// entirely on an unknown `NOOPEN` capability, and downgrade to read-only
/// on an unknown `NOWRITE` one.
pub fn check_capabilities(caps: &[Capability], requested_write: bool) -> Result<bool> {
    let mut force_read_only = false;
    for cap in caps {
        let known = cap.cap_type == CAP_TYPE_NONE;
        if known {
            continue;
        }
        if cap.no_open {
            return Err(Error::einval(format!(
                "unknown required capability {:#x}",
                cap.cap_type
            )));
        }
        if cap.no_write && requested_write {
            force_read_only = true;
        }
    }
    Ok(force_read_only)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_roundtrip() {
        let cap = Capability {
            cap_type: 7,
            no_open: true,
            no_write: false,
            no_check: true,
            next: 0,
        };
        let raw = cap.encode();
        let back = Capability::decode(raw, 0);
        assert_eq!(back.cap_type, 7);
        assert!(back.no_open);
        assert!(!back.no_write);
        assert!(back.no_check);
    }

    #[test]
    fn unknown_noopen_rejected() {
        let caps = vec![Capability {
            cap_type: 99,
            no_open: true,
            no_write: false,
            no_check: false,
            next: 0,
        }];
        assert!(check_capabilities(&caps, true).is_err());
    }

    #[test]
    fn unknown_nowrite_downgrades() {
        let caps = vec![Capability {
            cap_type: 99,
            no_open: false,
            no_write: true,
            no_check: false,
            next: 0,
        }];
        let force_ro = check_capabilities(&caps, true).unwrap();
        assert!(force_ro);
    }

    #[test]
    fn known_capability_is_transparent() {
        let caps = vec![Capability {
            cap_type: CAP_TYPE_NONE,
            no_open: true,
            no_write: true,
            no_check: true,
            next: 0,
        }];
        let force_ro = check_capabilities(&caps, true).unwrap();
        assert!(!force_ro);
    }
}
