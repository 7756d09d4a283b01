//! Device lifecycle state machine
//!
//! Every device moves through Offline → Parked → Online. Offline devices
//! advertise themselves with `NatOfferRequest` on a three-tier backoff;
//! assigned devices count down an offline timeout that any received frame
//! resets, and emit periodic keep-alives.
//!
//! The machine is purely time-driven through [`StateMachine::tick`]; it
//! decides *what* is due and leaves the sending to the caller, which keeps
//! the schedule testable without a bus.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info};

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not assigned; emitting offers
    Offline,
    /// Assigned but not authorised; lifecycle commands only
    Parked,
    /// Assigned and fully operational
    Online,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Offline => write!(f, "offline"),
            LifecycleState::Parked => write!(f, "parked"),
            LifecycleState::Online => write!(f, "online"),
        }
    }
}

/// Something the caller must transmit or react to after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// An offer is due
    SendOffer,
    /// A keep-alive is due
    SendKeepAlive,
    /// The offline timeout elapsed and the device dropped to Offline
    WentOffline,
}

/// Time-driven lifecycle bookkeeping for one device
#[derive(Debug)]
pub struct StateMachine {
    state: LifecycleState,
    authorized: bool,
    extensions_offline: bool,
    offer_count: u32,
    next_offer_at: Option<Instant>,
    offline_deadline: Option<Instant>,
    next_keepalive_at: Option<Instant>,
    offline_timeout: Duration,
    keepalive_interval: Duration,
}

impl StateMachine {
    /// A machine booting into Offline; the first offer is due immediately.
    pub fn new(offline_timeout: Duration, keepalive_interval: Duration) -> Self {
        Self {
            state: LifecycleState::Offline,
            authorized: false,
            extensions_offline: false,
            offer_count: 0,
            next_offer_at: Some(Instant::now()),
            offline_deadline: None,
            next_keepalive_at: None,
            offline_timeout,
            keepalive_interval,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Whether the challenge succeeded this session.
    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    /// Whether offer emission is suppressed by `ExtensionsOffline`.
    pub fn offers_suppressed(&self) -> bool {
        self.extensions_offline
    }

    fn transition(&mut self, to: LifecycleState, reason: &str) {
        if self.state == to {
            return;
        }
        info!(from = %self.state, to = %to, reason, "state transition");
        self.state = to;

        let now = Instant::now();
        match to {
            LifecycleState::Offline => {
                self.offer_count = 0;
                self.next_offer_at = Some(now);
                self.offline_deadline = None;
                self.next_keepalive_at = None;
                self.authorized = false;
            }
            LifecycleState::Parked | LifecycleState::Online => {
                self.next_offer_at = None;
                self.offline_deadline = Some(now + self.offline_timeout);
                self.next_keepalive_at = Some(now + self.keepalive_interval);
            }
        }
    }

    /// Apply a `NatOfferConfirm` for this device's serial.
    pub fn on_confirm(&mut self, parked: bool) -> LifecycleState {
        if parked {
            self.transition(LifecycleState::Parked, "offer confirmed parked");
        } else {
            self.transition(LifecycleState::Online, "offer confirmed");
        }
        self.state
    }

    /// Record a solved challenge; a Parked device goes Online.
    ///
    /// Returns true when this authorization brought the device Online.
    pub fn authorize(&mut self) -> bool {
        self.authorized = true;
        if self.state == LifecycleState::Parked {
            self.transition(LifecycleState::Online, "challenge solved");
            return true;
        }
        false
    }

    /// A failed challenge withdraws authorization without moving state.
    pub fn deauthorize(&mut self) {
        self.authorized = false;
    }

    /// `ExtensionsOffline` received: stay put, drop authorization, restart
    /// offer timing, and hold offers until the next `IdentifyUnknown`.
    pub fn on_extensions_offline(&mut self) {
        debug!(state = %self.state, "extensions offline received");
        self.authorized = false;
        self.extensions_offline = true;
        self.offer_count = 0;
        self.next_offer_at = Some(Instant::now());
    }

    /// `IdentifyUnknown` received: offers may flow again.
    ///
    /// Returns true when the device is Offline and will resume offering.
    pub fn on_identify_unknown(&mut self) -> bool {
        self.extensions_offline = false;
        if self.state == LifecycleState::Offline {
            self.offer_count = 0;
            self.next_offer_at = Some(Instant::now());
            return true;
        }
        false
    }

    /// Any frame addressed to the device restarts the offline countdown.
    pub fn touch(&mut self) {
        if self.state != LifecycleState::Offline {
            self.offline_deadline = Some(Instant::now() + self.offline_timeout);
        }
    }

    /// Adopt timeouts from a freshly applied configuration.
    pub fn set_timeouts(&mut self, offline_timeout: Duration, keepalive_interval: Duration) {
        self.offline_timeout = offline_timeout;
        self.keepalive_interval = keepalive_interval;
        if self.state != LifecycleState::Offline {
            let now = Instant::now();
            self.offline_deadline = Some(now + offline_timeout);
            self.next_keepalive_at = Some(now + keepalive_interval);
        }
    }

    /// Power-on / reboot: back to Offline, everything cleared.
    pub fn reset(&mut self, reason: &str) {
        info!(from = %self.state, reason, "device reset");
        self.state = LifecycleState::Offline;
        self.authorized = false;
        self.extensions_offline = false;
        self.offer_count = 0;
        self.next_offer_at = Some(Instant::now());
        self.offline_deadline = None;
        self.next_keepalive_at = None;
    }

    /// Advance the schedule; returns every action now due.
    pub fn tick(&mut self, now: Instant) -> Vec<TimerAction> {
        let mut actions = Vec::new();

        match self.state {
            LifecycleState::Offline => {
                if self.extensions_offline {
                    return actions;
                }
                if let Some(due) = self.next_offer_at {
                    if now >= due {
                        actions.push(TimerAction::SendOffer);
                        self.offer_count += 1;
                        self.next_offer_at = Some(now + offer_delay(self.offer_count));
                    }
                }
            }
            LifecycleState::Parked | LifecycleState::Online => {
                if let Some(deadline) = self.offline_deadline {
                    if now >= deadline {
                        self.transition(LifecycleState::Offline, "offline timeout");
                        actions.push(TimerAction::WentOffline);
                        return actions;
                    }
                }
                if let Some(due) = self.next_keepalive_at {
                    if now >= due {
                        actions.push(TimerAction::SendKeepAlive);
                        self.next_keepalive_at = Some(now + self.keepalive_interval);
                    }
                }
            }
        }

        actions
    }
}

/// Inter-offer delay for the given number of offers already sent: three
/// quick tries, a handful of medium ones, then slow retries, each with
/// uniform jitter inside its band.
fn offer_delay(offers_sent: u32) -> Duration {
    let (lo, hi) = match offers_sent {
        0..=2 => (100, 150),
        3..=9 => (500, 1000),
        _ => (2000, 3000),
    };
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> StateMachine {
        StateMachine::new(Duration::from_secs(900), Duration::from_secs(900))
    }

    #[tokio::test(start_paused = true)]
    async fn boots_offline_with_an_immediate_offer() {
        let mut sm = machine();
        assert_eq!(sm.state(), LifecycleState::Offline);
        let actions = sm.tick(Instant::now());
        assert_eq!(actions, vec![TimerAction::SendOffer]);
    }

    #[tokio::test(start_paused = true)]
    async fn offer_backoff_walks_the_three_tiers() {
        let mut sm = machine();
        let mut offers = 0;
        let mut gaps = Vec::new();
        let mut last_offer = Instant::now();

        while offers < 12 {
            let now = Instant::now();
            if sm.tick(now).contains(&TimerAction::SendOffer) {
                if offers > 0 {
                    gaps.push(now - last_offer);
                }
                last_offer = now;
                offers += 1;
            }
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        // Gaps after offers 1 and 2 sit in the fast band.
        for gap in &gaps[..2] {
            assert!(*gap >= Duration::from_millis(100) && *gap <= Duration::from_millis(160));
        }
        // Gaps after offers 3..=9 sit in the medium band.
        for gap in &gaps[2..9] {
            assert!(*gap >= Duration::from_millis(500) && *gap <= Duration::from_millis(1010));
        }
        // Beyond that the slow band applies.
        for gap in &gaps[9..] {
            assert!(*gap >= Duration::from_secs(2) && *gap <= Duration::from_millis(3010));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_moves_online_and_stops_offers() {
        let mut sm = machine();
        assert_eq!(sm.on_confirm(false), LifecycleState::Online);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(sm.tick(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn parked_goes_online_on_authorization() {
        let mut sm = machine();
        assert_eq!(sm.on_confirm(true), LifecycleState::Parked);
        assert!(!sm.is_authorized());
        assert!(sm.authorize());
        assert_eq!(sm.state(), LifecycleState::Online);
        assert!(sm.is_authorized());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_timeout_drops_the_device() {
        let mut sm = StateMachine::new(Duration::from_secs(10), Duration::from_secs(900));
        sm.on_confirm(false);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(sm.tick(Instant::now()).is_empty());

        // A frame for us pushes the deadline out.
        sm.touch();
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(sm.tick(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(sm.tick(Instant::now()), vec![TimerAction::WentOffline]);
        assert_eq!(sm.state(), LifecycleState::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_fires_on_its_interval() {
        let mut sm = StateMachine::new(Duration::from_secs(900), Duration::from_secs(60));
        sm.on_confirm(false);

        tokio::time::advance(Duration::from_secs(61)).await;
        let actions = sm.tick(Instant::now());
        assert_eq!(actions, vec![TimerAction::SendKeepAlive]);

        // Not due again right away.
        assert!(sm.tick(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn extensions_offline_suppresses_offers_until_identify() {
        let mut sm = machine();
        sm.on_extensions_offline();
        assert!(sm.offers_suppressed());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(sm.tick(Instant::now()).is_empty());

        assert!(sm.on_identify_unknown());
        assert_eq!(sm.tick(Instant::now()), vec![TimerAction::SendOffer]);
    }

    #[tokio::test(start_paused = true)]
    async fn extensions_offline_keeps_state_but_clears_authorization() {
        let mut sm = machine();
        sm.on_confirm(true);
        sm.authorize();
        assert_eq!(sm.state(), LifecycleState::Online);

        sm.on_extensions_offline();
        assert_eq!(sm.state(), LifecycleState::Online);
        assert!(!sm.is_authorized());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_returns_to_offline_and_reoffers() {
        let mut sm = machine();
        sm.on_confirm(false);
        sm.reset("reboot");
        assert_eq!(sm.state(), LifecycleState::Offline);
        assert_eq!(sm.tick(Instant::now()), vec![TimerAction::SendOffer]);
    }
}
