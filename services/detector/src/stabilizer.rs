//! Temporal hysteresis over raw per-frame classifications.
//!
//! A spot only changes its reported state after `streak_length` consecutive
//! observations disagree with it. Any agreeing observation in between resets
//! the disagreement streak, so a single noisy frame (a pedestrian, a passing
//! shadow) never flips a spot.

use crate::classifier::Classification;
use crate::lot::{Region, SpotId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// One raw classification of one spot at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawObservation {
    pub spot_id: SpotId,
    pub occupied: bool,
    pub confidence: f32,
    pub foreground_pixels: u32,
    pub observed_at: DateTime<Utc>,
}

impl RawObservation {
    pub fn from_classification(
        spot_id: SpotId,
        classification: Classification,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            spot_id,
            occupied: classification.occupied,
            confidence: classification.confidence,
            foreground_pixels: classification.foreground_pixels,
            observed_at,
        }
    }
}

/// Stabilized, externally reported state of one spot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotState {
    pub spot_id: SpotId,
    pub occupied: bool,
    /// Confidence of the most recent observation
    pub confidence: f32,
    /// When the stabilized value last changed
    pub changed_at: DateTime<Utc>,
    /// Observations in a row agreeing with the stabilized value
    pub consecutive_agreeing_count: u32,
    /// Foreground count of the most recent observation
    pub foreground_pixels: u32,
    /// Plate recognition is not performed; always `None`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_plate: Option<String>,
}

/// A transition of a stabilized value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateChange {
    pub spot_id: SpotId,
    pub occupied: bool,
    pub changed_at: DateTime<Utc>,
    /// First value ever established for the spot
    pub initial: bool,
}

/// Hysteresis state machine for a single spot.
#[derive(Debug, Clone)]
pub struct SpotStabilizer {
    spot_id: SpotId,
    streak_length: u32,
    state: Option<SpotState>,
    disagreements: u32,
}

impl SpotStabilizer {
    /// Start with no established value; the first observation is adopted.
    pub fn new(spot_id: SpotId, streak_length: u32) -> Self {
        Self {
            spot_id,
            streak_length: streak_length.max(1),
            state: None,
            disagreements: 0,
        }
    }

    /// Resume from a previously established state.
    pub fn seeded(state: SpotState, streak_length: u32) -> Self {
        Self {
            spot_id: state.spot_id,
            streak_length: streak_length.max(1),
            state: Some(state),
            disagreements: 0,
        }
    }

    pub fn state(&self) -> Option<&SpotState> {
        self.state.as_ref()
    }

    /// Feed one raw observation; returns a change when the stabilized value flips.
    pub fn observe(&mut self, observation: &RawObservation) -> Option<StateChange> {
        let Some(state) = self.state.as_mut() else {
            self.state = Some(SpotState {
                spot_id: self.spot_id,
                occupied: observation.occupied,
                confidence: observation.confidence,
                changed_at: observation.observed_at,
                consecutive_agreeing_count: 1,
                foreground_pixels: observation.foreground_pixels,
                license_plate: None,
            });
            return Some(StateChange {
                spot_id: self.spot_id,
                occupied: observation.occupied,
                changed_at: observation.observed_at,
                initial: true,
            });
        };

        state.confidence = observation.confidence;
        state.foreground_pixels = observation.foreground_pixels;

        if observation.occupied == state.occupied {
            self.disagreements = 0;
            state.consecutive_agreeing_count = state.consecutive_agreeing_count.saturating_add(1);
            return None;
        }

        self.disagreements += 1;
        state.consecutive_agreeing_count = 0;
        if self.disagreements < self.streak_length {
            return None;
        }

        state.occupied = observation.occupied;
        state.changed_at = observation.observed_at;
        state.consecutive_agreeing_count = self.streak_length;
        self.disagreements = 0;

        Some(StateChange {
            spot_id: self.spot_id,
            occupied: state.occupied,
            changed_at: state.changed_at,
            initial: false,
        })
    }
}

/// Stabilizers for every region of one lot, kept in region order.
#[derive(Debug, Clone)]
pub struct LotStabilizer {
    spots: Vec<SpotStabilizer>,
}

impl LotStabilizer {
    pub fn new(regions: &[Region], streak_length: u32) -> Self {
        Self::with_seeds(regions, streak_length, HashMap::new())
    }

    /// Build stabilizers, resuming spots that have a carried-over state.
    pub fn with_seeds(
        regions: &[Region],
        streak_length: u32,
        mut seeds: HashMap<SpotId, SpotState>,
    ) -> Self {
        let spots = regions
            .iter()
            .map(|region| match seeds.remove(&region.spot_id) {
                Some(state) => SpotStabilizer::seeded(state, streak_length),
                None => SpotStabilizer::new(region.spot_id, streak_length),
            })
            .collect();
        Self { spots }
    }

    /// Observe a whole frame's worth of classifications.
    pub fn observe_all(&mut self, observations: &[RawObservation]) -> Vec<StateChange> {
        let mut changes = Vec::new();
        for observation in observations {
            if let Some(spot) = self.spots.iter_mut().find(|s| s.spot_id == observation.spot_id) {
                if let Some(change) = spot.observe(observation) {
                    changes.push(change);
                }
            }
        }
        changes
    }

    /// Established states in region order; spots never observed are omitted.
    pub fn snapshot(&self) -> Vec<SpotState> {
        self.spots.iter().filter_map(|s| s.state().cloned()).collect()
    }
}
