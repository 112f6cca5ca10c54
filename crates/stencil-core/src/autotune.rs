// ─────────────────────────────────────────────────────────────────────
// SCPN Stencil Engine — Auto-Tuner
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Hill-climbing search over tile sizes to minimize observed time per
//! step. The tuner is an observer: it is fed (steps, seconds) samples
//! between step groups and may propose new sizes, which the context
//! applies before the next group. One tuner drives the global settings,
//! or one per pack when temporal blocking is off and several packs
//! exist.

use stencil_types::idx::IdxTuple;
use tracing::debug;

/// Which tile level is currently being tuned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TuneTarget {
    Block,
    MiniBlock,
    SubBlock,
}

const TARGETS: [TuneTarget; 3] = [TuneTarget::Block, TuneTarget::MiniBlock, TuneTarget::SubBlock];

/// Steps to skip after a size change before timing is trusted.
const WARMUP_STEPS: i64 = 1;
/// Minimum steps per trial measurement.
const TRIAL_STEPS: i64 = 2;

/// Tile sizes proposed by the tuner for one trial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileSizes {
    pub block: IdxTuple,
    pub mini_block: IdxTuple,
    pub sub_block: IdxTuple,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Warmup,
    Measure,
    Done,
}

pub struct AutoTuner {
    name: String,
    enabled: bool,
    state: State,
    target_idx: usize,
    /// Center of the current neighborhood and its best observed rate.
    center: TileSizes,
    best_secs_per_step: f64,
    /// Candidate currently being measured.
    candidate: TileSizes,
    /// Which neighbor of the center is being tried next; 0 is the
    /// center itself, then +/- radius per dim.
    neighbor: usize,
    radius: i64,
    /// Per-dim floor for tile sizes (the fold).
    min_sizes: Vec<i64>,
    /// Per-dim ceiling (the enclosing tile).
    max_sizes: Vec<i64>,
    warmup_left: i64,
    trial_steps: i64,
    trial_secs: f64,
}

impl AutoTuner {
    pub fn new(name: &str, initial: TileSizes, min_sizes: Vec<i64>, max_sizes: Vec<i64>) -> Self {
        let radius = max_sizes.iter().max().copied().unwrap_or(1) / 4;
        AutoTuner {
            name: name.to_string(),
            enabled: false,
            state: State::Warmup,
            target_idx: 0,
            center: initial.clone(),
            best_secs_per_step: f64::INFINITY,
            candidate: initial,
            neighbor: 0,
            radius: radius.max(1),
            min_sizes,
            max_sizes,
            warmup_left: WARMUP_STEPS,
            trial_steps: 0,
            trial_secs: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_done(&self) -> bool {
        !self.enabled || self.state == State::Done
    }

    pub fn best_sizes(&self) -> &TileSizes {
        &self.center
    }

    /// Re-arm (or disarm) the tuner, keeping its current center.
    pub fn reset(&mut self, enable: bool) {
        self.enabled = enable;
        self.state = if enable { State::Warmup } else { State::Done };
        self.target_idx = 0;
        self.best_secs_per_step = f64::INFINITY;
        self.neighbor = 0;
        self.radius = self.max_sizes.iter().max().copied().unwrap_or(1) / 4;
        self.radius = self.radius.max(1);
        self.warmup_left = WARMUP_STEPS;
        self.trial_steps = 0;
        self.trial_secs = 0.0;
        self.candidate = self.center.clone();
    }

    fn target_tuple<'a>(sizes: &'a mut TileSizes, target: TuneTarget) -> &'a mut IdxTuple {
        match target {
            TuneTarget::Block => &mut sizes.block,
            TuneTarget::MiniBlock => &mut sizes.mini_block,
            TuneTarget::SubBlock => &mut sizes.sub_block,
        }
    }

    /// Build neighbor `k` of the center at the current target/radius;
    /// None when the neighborhood is exhausted or the neighbor is out
    /// of range. Neighbor 0 is the center.
    fn make_neighbor(&self, k: usize) -> Option<Option<TileSizes>> {
        let nd = self.min_sizes.len();
        if k == 0 {
            return Some(Some(self.center.clone()));
        }
        let idx = k - 1;
        if idx >= 2 * nd {
            return None; // exhausted
        }
        let dim = idx / 2;
        let sign = if idx % 2 == 0 { 1 } else { -1 };
        let mut cand = self.center.clone();
        let tuple = Self::target_tuple(&mut cand, TARGETS[self.target_idx]);
        let cur = tuple.val(dim);
        let next = cur + sign * self.radius;
        if next < self.min_sizes[dim] || next > self.max_sizes[dim] || next == cur {
            return Some(None); // skip this neighbor
        }
        tuple.set_val(dim, next);
        Some(Some(cand))
    }

    /// Advance to the next measurable candidate; false when the search
    /// at this radius is finished.
    fn advance_candidate(&mut self) -> bool {
        loop {
            self.neighbor += 1;
            match self.make_neighbor(self.neighbor) {
                None => return false,
                Some(None) => continue,
                Some(Some(c)) => {
                    self.candidate = c;
                    return true;
                }
            }
        }
    }

    /// Feed one observation. Returns sizes to apply for the next trial
    /// when the tuner wants a change.
    pub fn eval(&mut self, steps: i64, secs: f64) -> Option<TileSizes> {
        if !self.enabled || self.state == State::Done || steps <= 0 {
            return None;
        }
        if self.state == State::Warmup {
            self.warmup_left -= steps;
            if self.warmup_left > 0 {
                return None;
            }
            self.state = State::Measure;
            self.trial_steps = 0;
            self.trial_secs = 0.0;
            // First measured candidate is the center itself.
            self.neighbor = 0;
            self.candidate = self.center.clone();
            return Some(self.candidate.clone());
        }

        self.trial_steps += steps;
        self.trial_secs += secs;
        if self.trial_steps < TRIAL_STEPS {
            return None;
        }
        let per_step = self.trial_secs / self.trial_steps as f64;
        if per_step < self.best_secs_per_step {
            self.best_secs_per_step = per_step;
            self.center = self.candidate.clone();
            debug!(
                "tuner '{}': new best {per_step:.3e} s/step at {:?}",
                self.name, self.center
            );
        }
        self.trial_steps = 0;
        self.trial_secs = 0.0;

        if self.advance_candidate() {
            return Some(self.candidate.clone());
        }

        // Neighborhood exhausted: tighten the radius or move on.
        self.neighbor = 0;
        if self.radius > 1 {
            self.radius /= 2;
            self.candidate = self.center.clone();
            if self.advance_candidate() {
                return Some(self.candidate.clone());
            }
        }
        self.target_idx += 1;
        self.radius = self.max_sizes.iter().max().copied().unwrap_or(1) / 4;
        self.radius = self.radius.max(1);
        if self.target_idx >= TARGETS.len() {
            self.state = State::Done;
            debug!(
                "tuner '{}' done: best {:.3e} s/step at {:?}",
                self.name, self.best_secs_per_step, self.center
            );
            return Some(self.center.clone());
        }
        self.candidate = self.center.clone();
        if self.advance_candidate() {
            Some(self.candidate.clone())
        } else {
            // Nothing tunable at this level either; settle.
            self.state = State::Done;
            Some(self.center.clone())
        }
    }
}
