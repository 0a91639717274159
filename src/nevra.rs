// src/nevra.rs

//! Package identity (Name-Epoch-Version-Release-Arch) and EVR comparison
//!
//! Version comparison follows the classic rpm segment algorithm: runs of
//! digits compare numerically, runs of letters compare lexically, and a
//! numeric segment always sorts newer than an alphabetic one.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Full identity tuple of a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nevra {
    pub name: String,
    pub epoch: Option<u32>,
    pub version: String,
    pub release: String,
    pub arch: Option<String>,
}

impl Nevra {
    pub fn new(name: &str, version: &str, release: &str) -> Self {
        Self {
            name: name.to_string(),
            epoch: None,
            version: version.to_string(),
            release: release.to_string(),
            arch: None,
        }
    }

    pub fn with_epoch(mut self, epoch: u32) -> Self {
        self.epoch = Some(epoch);
        self
    }

    pub fn with_arch(mut self, arch: &str) -> Self {
        self.arch = Some(arch.to_string());
        self
    }

    /// Compare epoch:version-release against another identity
    pub fn compare_evr(&self, other: &Nevra) -> Ordering {
        let se = self.epoch.unwrap_or(0);
        let oe = other.epoch.unwrap_or(0);
        se.cmp(&oe)
            .then_with(|| rpm_version_compare(&self.version, &other.version))
            .then_with(|| rpm_version_compare(&self.release, &other.release))
    }

    /// True when `self` is not newer than `installed` (same name assumed)
    pub fn older_or_equal(&self, installed: &Nevra) -> bool {
        self.compare_evr(installed) != Ordering::Greater
    }
}

impl fmt::Display for Nevra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", self.name)?;
        if let Some(e) = self.epoch {
            write!(f, "{}:", e)?;
        }
        write!(f, "{}-{}", self.version, self.release)?;
        if let Some(ref a) = self.arch {
            write!(f, ".{}", a)?;
        }
        Ok(())
    }
}

/// Segment-wise rpm version comparison
pub fn rpm_version_compare(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    let mut i = 0;
    let mut j = 0;

    while i < a_bytes.len() || j < b_bytes.len() {
        // Skip separators (anything that is neither alphanumeric nor tilde).
        while i < a_bytes.len() && !a_bytes[i].is_ascii_alphanumeric() && a_bytes[i] != b'~' {
            i += 1;
        }
        while j < b_bytes.len() && !b_bytes[j].is_ascii_alphanumeric() && b_bytes[j] != b'~' {
            j += 1;
        }

        // Tilde sorts before everything, including end of string.
        let a_tilde = i < a_bytes.len() && a_bytes[i] == b'~';
        let b_tilde = j < b_bytes.len() && b_bytes[j] == b'~';
        if a_tilde || b_tilde {
            if !a_tilde {
                return Ordering::Greater;
            }
            if !b_tilde {
                return Ordering::Less;
            }
            i += 1;
            j += 1;
            continue;
        }

        if i >= a_bytes.len() || j >= b_bytes.len() {
            break;
        }

        let is_num = a_bytes[i].is_ascii_digit();
        let seg_a = take_segment(a_bytes, &mut i, is_num);
        let seg_b = take_segment(b_bytes, &mut j, is_num);

        // Segment type mismatch: the numeric side is newer.
        if seg_b.is_empty() {
            return if is_num {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let cmp = if is_num {
            let ta = seg_a.iter().skip_while(|&&c| c == b'0').count();
            let tb = seg_b.iter().skip_while(|&&c| c == b'0').count();
            ta.cmp(&tb).then_with(|| {
                let sa = &seg_a[seg_a.len() - ta..];
                let sb = &seg_b[seg_b.len() - tb..];
                sa.cmp(sb)
            })
        } else {
            seg_a.cmp(seg_b)
        };

        if cmp != Ordering::Equal {
            return cmp;
        }
    }

    // All shared segments equal: the longer string wins.
    (a_bytes.len() - i).cmp(&(b_bytes.len() - j))
}

fn take_segment<'a>(bytes: &'a [u8], pos: &mut usize, numeric: bool) -> &'a [u8] {
    let start = *pos;
    while *pos < bytes.len()
        && (if numeric {
            bytes[*pos].is_ascii_digit()
        } else {
            bytes[*pos].is_ascii_alphabetic()
        })
    {
        *pos += 1;
    }
    &bytes[start..*pos]
}
