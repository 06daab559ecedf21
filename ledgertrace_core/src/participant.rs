//! Epidemic state machine for a single participant.
//!
//! ```text
//!   NORMAL ──(exposure accepted)──► INFECTED
//!     │                               │
//!     └──(verified notification)──────┴──► NOTIFIED ──(arrival)──► QUARANTINED
//! ```
//!
//! State is only ever changed through the methods below; each date in
//! `MedicalStatus` is set once, at the moment of its transition.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Epidemic state of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantState {
    Normal,
    Infected,
    Notified,
    Quarantined,
}

impl ParticipantState {
    pub fn name(&self) -> &'static str {
        match self {
            ParticipantState::Normal => "normal",
            ParticipantState::Infected => "infected",
            ParticipantState::Notified => "notified",
            ParticipantState::Quarantined => "quarantined",
        }
    }
}

/// Transition dates, as simulation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicalStatus {
    pub infection_date: Option<Duration>,
    pub notification_date: Option<Duration>,
    pub quarantined_date: Option<Duration>,
}

/// A state change that just happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Infected,
    Notified,
    Quarantined,
}

/// Minimum-interval gate on periodic writes.
#[derive(Debug, Clone)]
pub struct WriteThrottle {
    min_interval: Duration,
    last_write: Option<Duration>,
}

impl WriteThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_write: None,
        }
    }

    /// True if no write happened yet or at least `min_interval` has elapsed.
    pub fn should_write(&self, now: Duration) -> bool {
        match self.last_write {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.min_interval,
        }
    }

    /// Records a successful write.
    pub fn record_write(&mut self, now: Duration) {
        self.last_write = Some(now);
    }

    pub fn last_write(&self) -> Option<Duration> {
        self.last_write
    }
}

/// One agent in the simulation.
#[derive(Debug, Clone)]
pub struct Participant {
    id: String,
    index: usize,
    state: ParticipantState,
    medical: MedicalStatus,
    throttle: WriteThrottle,
}

impl Participant {
    pub fn new(id: impl Into<String>, index: usize, min_write_interval: Duration) -> Self {
        Self {
            id: id.into(),
            index,
            state: ParticipantState::Normal,
            medical: MedicalStatus::default(),
            throttle: WriteThrottle::new(min_write_interval),
        }
    }

    /// Starts the participant already infected (patient zero).
    pub fn seeded_infection(mut self, now: Duration) -> Self {
        self.state = ParticipantState::Infected;
        self.medical.infection_date = Some(now);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> ParticipantState {
        self.state
    }

    pub fn medical(&self) -> &MedicalStatus {
        &self.medical
    }

    /// Notified participants behave as quarantined: no wandering,
    /// no further infection checks.
    pub fn is_quarantined(&self) -> bool {
        matches!(self.state, ParticipantState::Notified | ParticipantState::Quarantined)
    }

    pub fn is_infectious(&self) -> bool {
        self.state == ParticipantState::Infected
    }

    /// Applies the acceptance probability once per nearby infected participant.
    ///
    /// Only a NORMAL participant can change state here.
    pub fn expose<R: Rng + ?Sized>(
        &mut self,
        nearby_infected: usize,
        probability: f64,
        rng: &mut R,
        now: Duration,
    ) -> Option<Transition> {
        if self.state != ParticipantState::Normal {
            return None;
        }
        for _ in 0..nearby_infected {
            if rng.gen::<f64>() < probability {
                self.state = ParticipantState::Infected;
                self.medical.infection_date = Some(now);
                return Some(Transition::Infected);
            }
        }
        None
    }

    /// Reacts to the verified notification union.
    ///
    /// Moves NORMAL or INFECTED to NOTIFIED when the union names this participant.
    pub fn notify(&mut self, possible: &[String], now: Duration) -> Option<Transition> {
        if !matches!(self.state, ParticipantState::Normal | ParticipantState::Infected) {
            return None;
        }
        if !possible.iter().any(|p| p == &self.id) {
            return None;
        }
        self.state = ParticipantState::Notified;
        self.medical.notification_date = Some(now);
        Some(Transition::Notified)
    }

    /// Arrival at the care centre after a notification.
    pub fn admit(&mut self, now: Duration) -> Option<Transition> {
        if self.state != ParticipantState::Notified {
            return None;
        }
        self.state = ParticipantState::Quarantined;
        self.medical.quarantined_date = Some(now);
        Some(Transition::Quarantined)
    }

    pub fn should_write(&self, now: Duration) -> bool {
        self.throttle.should_write(now)
    }

    pub fn record_write(&mut self, now: Duration) {
        self.throttle.record_write(now);
    }

    pub fn throttle(&self) -> &WriteThrottle {
        &self.throttle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const T: Duration = Duration::from_secs(10);

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_throttle_half_interval_blocks() {
        let mut p = Participant::new("agent-0", 0, T);
        let mut writes = 0;
        for now in [secs(100), secs(105)] {
            if p.should_write(now) {
                p.record_write(now);
                writes += 1;
            }
        }
        assert_eq!(writes, 1);
    }

    #[test]
    fn test_throttle_double_interval_allows() {
        let mut p = Participant::new("agent-0", 0, T);
        let mut writes = 0;
        for now in [secs(100), secs(120)] {
            if p.should_write(now) {
                p.record_write(now);
                writes += 1;
            }
        }
        assert_eq!(writes, 2);
        assert_eq!(p.throttle().last_write(), Some(secs(120)));
    }

    #[test]
    fn test_certain_exposure_infects_once() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut p = Participant::new("agent-0", 0, T);

        assert_eq!(p.expose(1, 1.0, &mut rng, secs(3)), Some(Transition::Infected));
        assert_eq!(p.state(), ParticipantState::Infected);
        assert_eq!(p.medical().infection_date, Some(secs(3)));
    }

    #[test]
    fn test_infected_is_monotonic_under_exposure() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut p = Participant::new("agent-0", 0, T).seeded_infection(secs(1));

        for t in 2..50 {
            assert_eq!(p.expose(5, 1.0, &mut rng, secs(t)), None);
        }
        assert_eq!(p.state(), ParticipantState::Infected);
        assert_eq!(p.medical().infection_date, Some(secs(1)));
    }

    #[test]
    fn test_zero_probability_or_nobody_nearby() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut p = Participant::new("agent-0", 0, T);
        assert_eq!(p.expose(10, 0.0, &mut rng, secs(1)), None);
        assert_eq!(p.expose(0, 1.0, &mut rng, secs(1)), None);
        assert_eq!(p.state(), ParticipantState::Normal);
    }

    #[test]
    fn test_notification_requires_own_id() {
        let mut p = Participant::new("agent-0", 0, T);
        assert_eq!(p.notify(&[], secs(5)), None);
        assert_eq!(p.notify(&["agent-1".to_string()], secs(5)), None);
        assert_eq!(p.state(), ParticipantState::Normal);

        assert_eq!(p.notify(&["agent-0".to_string()], secs(6)), Some(Transition::Notified));
        assert_eq!(p.medical().notification_date, Some(secs(6)));
        assert!(p.is_quarantined());
    }

    #[test]
    fn test_infected_can_be_notified_and_admitted() {
        let mut p = Participant::new("agent-4", 4, T).seeded_infection(secs(0));
        assert_eq!(p.notify(&["agent-4".to_string()], secs(8)), Some(Transition::Notified));
        assert_eq!(p.admit(secs(12)), Some(Transition::Quarantined));
        assert_eq!(p.state(), ParticipantState::Quarantined);
        assert_eq!(p.medical().quarantined_date, Some(secs(12)));

        // Dates are never overwritten
        assert_eq!(p.notify(&["agent-4".to_string()], secs(20)), None);
        assert_eq!(p.admit(secs(30)), None);
        assert_eq!(p.medical().notification_date, Some(secs(8)));
    }

    #[test]
    fn test_quarantined_excluded_from_exposure() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut p = Participant::new("agent-0", 0, T);
        p.notify(&["agent-0".to_string()], secs(1));
        assert_eq!(p.expose(3, 1.0, &mut rng, secs(2)), None);
        assert_eq!(p.medical().infection_date, None);
    }

    #[test]
    fn test_admit_requires_notification() {
        let mut p = Participant::new("agent-0", 0, T);
        assert_eq!(p.admit(secs(1)), None);
        assert_eq!(p.state(), ParticipantState::Normal);
    }
}
