//! Connection policy: peer scoring, direction arbitration, back-off

use std::time::{Duration, Instant};

use crate::address::BleAddress;
use crate::peer::DiscoveredPeer;

// ----------------------------------------------------------------------------
// Scoring Constants
// ----------------------------------------------------------------------------

/// RSSI below this is treated as no signal.
pub const RSSI_FLOOR: i16 = -100;
/// RSSI above this offers no further practical benefit.
pub const RSSI_CEILING: i16 = -30;

const RSSI_POINTS: f64 = 70.0;
const HISTORY_POINTS: f64 = 50.0;
const NEW_PEER_BONUS: f64 = 25.0;
const RECENCY_POINTS: f64 = 25.0;
const RECENCY_FULL_WINDOW: Duration = Duration::from_secs(5);
const RECENCY_DECAY_WINDOW: Duration = Duration::from_secs(30);

/// Minimum spacing between connection attempts to the same peer.
pub const ATTEMPT_COOLDOWN: Duration = Duration::from_secs(5);

/// Cap on the blacklist back-off multiplier.
const MAX_BACKOFF_MULTIPLIER: u32 = 8;

// ----------------------------------------------------------------------------
// Scoring
// ----------------------------------------------------------------------------

/// Priority score for peer selection; higher is better.
///
/// Signal strength dominates (up to 70 points): RSSI is the strongest
/// predictor of connection success, so a previously reliable peer that moved
/// away is deprioritized. History contributes up to 50 points, with peers
/// that have no attempts yet getting a 25-point benefit of the doubt.
/// Recency adds up to 25 points, full inside 5 s and decaying linearly to
/// zero at 30 s, as a tiebreaker toward currently active peers.
pub fn score_peer(peer: &DiscoveredPeer, now: Instant) -> f64 {
    let mut score = 0.0;

    let clamped = peer.rssi.clamp(RSSI_FLOOR, RSSI_CEILING);
    score += f64::from(clamped - RSSI_FLOOR) * (RSSI_POINTS / f64::from(RSSI_CEILING - RSSI_FLOOR));

    if peer.attempts > 0 {
        score += peer.success_rate() * HISTORY_POINTS;
    } else {
        score += NEW_PEER_BONUS;
    }

    let age = now.saturating_duration_since(peer.last_seen);
    if age < RECENCY_FULL_WINDOW {
        score += RECENCY_POINTS;
    } else if age < RECENCY_DECAY_WINDOW {
        let into_decay = age - RECENCY_FULL_WINDOW;
        let span = RECENCY_DECAY_WINDOW - RECENCY_FULL_WINDOW;
        score += RECENCY_POINTS * (1.0 - into_decay.as_secs_f64() / span.as_secs_f64());
    }

    score
}

// ----------------------------------------------------------------------------
// Direction Arbitration
// ----------------------------------------------------------------------------

/// Connection-direction arbitration between two devices that discover each
/// other: the one with the numerically lower MAC initiates, the higher one
/// waits to be connected to. Returns true when the local side must defer.
/// Equal addresses fall through to normal behavior.
pub fn defers_to(local: &BleAddress, peer: &BleAddress) -> bool {
    local.canonical_value() > peer.canonical_value()
}

// ----------------------------------------------------------------------------
// Back-off
// ----------------------------------------------------------------------------

/// Blacklist duration after a failure pushed the counter to or past the
/// threshold: `backoff * min(failures - threshold + 1, 8)`, so with the
/// 60 s default the ladder runs 60 s up to 480 s.
pub fn blacklist_duration(failures: u32, threshold: u32, backoff: Duration) -> Duration {
    let multiplier = (failures.saturating_sub(threshold) + 1).min(MAX_BACKOFF_MULTIPLIER);
    backoff * multiplier
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
