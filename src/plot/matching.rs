//! The kBC matching rule.
//!
//! Sorted y values fall into groups of `y / kBC`; entries in adjacent
//! groups match when the right entry's group-local value equals one of 64
//! targets derived from the left entry's group-local value and the left
//! group's parity. The target table is process-wide immutable after
//! first use.
//!
//! The pair finder builds, per right group, a map from group-local value to
//! entry positions (two inline slots plus an overflow list, so no match is
//! ever dropped), then scans every left entry's 64 targets against it.
//! Matches are emitted in (left position, target index, right position)
//! order, which makes the pair stream deterministic.

use std::sync::OnceLock;

use crate::params::{EXTRA_BITS_POW, K_B, K_BC, K_C};

/// Flattened `[parity][local_r][m]` target table.
pub struct LeftTargets {
    table: Box<[u16]>,
}

impl LeftTargets {
    fn build() -> Self {
        let m_count = EXTRA_BITS_POW as usize;
        let mut table = vec![0u16; 2 * K_BC as usize * m_count];
        for parity in 0..2u32 {
            for r in 0..K_BC {
                let c = r / K_C;
                let base = (parity as usize * K_BC as usize + r as usize) * m_count;
                for m in 0..EXTRA_BITS_POW {
                    let quadratic = (2 * m + parity) * (2 * m + parity);
                    let target = ((c + m) % K_B) * K_C + (quadratic + r) % K_C;
                    table[base + m as usize] = target as u16;
                }
            }
        }
        Self {
            table: table.into_boxed_slice(),
        }
    }

    /// Target local-r for `(parity, local_l, m)`.
    #[inline]
    #[must_use]
    pub fn target(&self, parity: u32, local_l: u32, m: u32) -> u32 {
        let m_count = EXTRA_BITS_POW as usize;
        let idx = (parity as usize * K_BC as usize + local_l as usize) * m_count + m as usize;
        u32::from(self.table[idx])
    }
}

/// The shared target table.
pub fn left_targets() -> &'static LeftTargets {
    static TARGETS: OnceLock<LeftTargets> = OnceLock::new();
    TARGETS.get_or_init(LeftTargets::build)
}

/// Reference predicate: do two y values match?
///
/// Used by the verifier-style tests; the pair finder below is the
/// production path.
#[must_use]
pub fn has_match(left_y: u64, right_y: u64) -> bool {
    let group_l = left_y / u64::from(K_BC);
    let group_r = right_y / u64::from(K_BC);
    if group_r != group_l + 1 {
        return false;
    }
    let parity = (group_l & 1) as u32;
    let local_l = (left_y - group_l * u64::from(K_BC)) as u32;
    let local_r = (right_y - group_r * u64::from(K_BC)) as u32;
    let targets = left_targets();
    (0..EXTRA_BITS_POW).any(|m| targets.target(parity, local_l, m) == local_r)
}

/// A matched pair: positions into the sorted bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchPair {
    pub left: u32,
    pub right: u32,
}

#[derive(Clone, Copy, Default)]
struct RmapSlot {
    epoch: u32,
    count: u32,
    positions: [u32; 2],
}

/// Reusable pair finder for one bucket's sorted y values.
pub struct Matcher {
    rmap: Vec<RmapSlot>,
    overflow: Vec<(u32, u32)>,
    epoch: u32,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher {
    /// Creates a matcher; the rmap is sized by the group modulus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rmap: vec![RmapSlot::default(); K_BC as usize],
            overflow: Vec::new(),
            epoch: 0,
        }
    }

    /// Finds every adjacent-group match in ascending-sorted `ys`.
    ///
    /// Pairs are appended to `out` in (left, target index, right) order.
    pub fn find_matches(&mut self, ys: &[u64], out: &mut Vec<MatchPair>) {
        out.clear();
        if ys.len() < 2 {
            return;
        }
        debug_assert!(ys.windows(2).all(|w| w[0] <= w[1]), "ys must be sorted");

        let kbc = u64::from(K_BC);
        let mut prev: Option<(u64, usize, usize)> = None;
        let mut run_group = ys[0] / kbc;
        let mut run_start = 0usize;

        for i in 1..=ys.len() {
            if i < ys.len() && ys[i] / kbc == run_group {
                continue;
            }
            // Run [run_start, i) of run_group ended.
            if let Some((prev_group, prev_run_start, prev_end)) = prev {
                if run_group == prev_group + 1 {
                    self.match_groups(ys, prev_group, prev_run_start..prev_end, run_start..i, out);
                }
            }
            prev = Some((run_group, run_start, i));
            if i < ys.len() {
                run_group = ys[i] / kbc;
                run_start = i;
            }
        }
    }

    fn match_groups(
        &mut self,
        ys: &[u64],
        group_l: u64,
        left: std::ops::Range<usize>,
        right: std::ops::Range<usize>,
        out: &mut Vec<MatchPair>,
    ) {
        let kbc = u64::from(K_BC);
        let left_base = group_l * kbc;
        let right_base = left_base + kbc;

        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            // Wrapped: stale slots could alias the fresh epoch.
            self.rmap.fill(RmapSlot::default());
            self.epoch = 1;
        }
        self.overflow.clear();

        for pos in right.clone() {
            let local_r = (ys[pos] - right_base) as usize;
            let slot = &mut self.rmap[local_r];
            if slot.epoch != self.epoch {
                slot.epoch = self.epoch;
                slot.count = 0;
            }
            if (slot.count as usize) < slot.positions.len() {
                slot.positions[slot.count as usize] = pos as u32;
            } else {
                self.overflow.push((local_r as u32, pos as u32));
            }
            slot.count += 1;
        }

        let parity = (group_l & 1) as u32;
        let targets = left_targets();
        for li in left {
            let local_l = (ys[li] - left_base) as u32;
            for m in 0..EXTRA_BITS_POW {
                let target = targets.target(parity, local_l, m);
                let slot = &self.rmap[target as usize];
                if slot.epoch != self.epoch || slot.count == 0 {
                    continue;
                }
                let inline = (slot.count as usize).min(slot.positions.len());
                for &pos in &slot.positions[..inline] {
                    out.push(MatchPair {
                        left: li as u32,
                        right: pos,
                    });
                }
                if slot.count as usize > slot.positions.len() {
                    for &(r, pos) in &self.overflow {
                        if r == target {
                            out.push(MatchPair {
                                left: li as u32,
                                right: pos,
                            });
                        }
                    }
                }
            }
        }
    }
}
