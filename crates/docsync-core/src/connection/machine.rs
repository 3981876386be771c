//! Connection resilience state machine
//!
//! Three independent axes (connection phase, tab visibility, network
//! reachability) and a transition function `handle(event) -> effects`.
//! The machine performs no I/O; the driver executes the effects.
//!
//! ```text
//! disconnected --connect--> timedOut --(visible)--> socketCreated
//!                              ^  |                   opening -> opened
//!                              |  +--(offline)--> temporarilyOffline
//!                              |                      |
//!                        errorWait <----error---------+
//! pageHidden: entered on page hide/freeze, left on page show/resume
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};
use url::{Host, Url};

use crate::config::ConnectionConfig;

/// Tab visibility axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TabVisibility {
    #[default]
    VisibleOrUnknown,
    Hidden,
}

/// Network reachability axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reachability {
    #[default]
    OnlineOrUnknown,
    Offline,
}

/// Keepalive cycle of an opened socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keepalive {
    PongReceived,
    PingSent,
}

/// Open sub-state of a created socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPhase {
    Opening,
    Opened(Keepalive),
}

/// Idle sub-state of a created socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePhase {
    Active,
    Inactive,
}

/// Connection axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    TimedOut,
    ErrorWait,
    TemporarilyOffline,
    PageHidden,
    SocketCreated { open: OpenPhase, idle: IdlePhase },
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Disconnected => "disconnected",
            ConnectionPhase::TimedOut => "timedOut",
            ConnectionPhase::ErrorWait => "errorWait",
            ConnectionPhase::TemporarilyOffline => "temporarilyOffline",
            ConnectionPhase::PageHidden => "pageHidden",
            ConnectionPhase::SocketCreated {
                open: OpenPhase::Opening,
                ..
            } => "opening",
            ConnectionPhase::SocketCreated {
                open: OpenPhase::Opened(_),
                ..
            } => "opened",
        };
        f.write_str(name)
    }
}

/// Timers the machine arms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ErrorWait,
    OpenTimeout,
    PingPeriod,
    IdleTimeout,
}

impl TimerKind {
    const ALL: [TimerKind; 4] = [
        TimerKind::ErrorWait,
        TimerKind::OpenTimeout,
        TimerKind::PingPeriod,
        TimerKind::IdleTimeout,
    ];

    fn index(self) -> usize {
        match self {
            TimerKind::ErrorWait => 0,
            TimerKind::OpenTimeout => 1,
            TimerKind::PingPeriod => 2,
            TimerKind::IdleTimeout => 3,
        }
    }
}

/// Inputs of the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Configure(String),
    Connect,
    Disconnect,
    TabVisible,
    TabHidden,
    PageHide,
    PageShow,
    PageFreeze,
    PageResume,
    Online,
    Offline,
    /// The transport finished opening
    Opened,
    /// A keepalive probe was answered
    PingSucceeded,
    /// Connection-level failure
    Error(String),
    TimerFired { kind: TimerKind, generation: u64 },
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenTransport { endpoint: Url, attempt: u64 },
    CloseTransport,
    CancelPendingRequests,
    SendPing,
    StartTimer {
        kind: TimerKind,
        generation: u64,
        delay: Duration,
    },
    CancelTimer(TimerKind),
    NotifyDisconnected,
    NotifyReconnected,
}

/// Loopback endpoints are assumed to be always reachable
pub fn is_local_endpoint(endpoint: &Url) -> bool {
    match endpoint.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Upper bound on eventless transitions taken after one event
const MAX_SETTLE_STEPS: usize = 8;

/// The resilience machine for one transport
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    settings: ConnectionConfig,
    phase: ConnectionPhase,
    tab: TabVisibility,
    network: Reachability,
    endpoint: Option<Url>,
    errors: VecDeque<String>,
    error_count: usize,
    attempt: u64,
    generations: [u64; 4],
}

impl ConnectionMachine {
    pub fn new(settings: ConnectionConfig) -> Self {
        Self {
            settings,
            phase: ConnectionPhase::Disconnected,
            tab: TabVisibility::default(),
            network: Reachability::default(),
            endpoint: None,
            errors: VecDeque::new(),
            error_count: 0,
            attempt: 0,
            generations: [0; 4],
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn tab(&self) -> TabVisibility {
        self.tab
    }

    pub fn network(&self) -> Reachability {
        self.network
    }

    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.phase,
            ConnectionPhase::SocketCreated {
                open: OpenPhase::Opened(_),
                ..
            }
        )
    }

    /// Errors since the last clean state, oldest first
    pub fn recent_errors(&self) -> Vec<String> {
        self.errors.iter().cloned().collect()
    }

    /// Consecutive errors since the last clean state
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    // Guards

    fn has_endpoint(&self) -> bool {
        self.endpoint.is_some()
    }

    fn needs_network(&self) -> bool {
        !self.endpoint.as_ref().is_some_and(is_local_endpoint)
    }

    fn is_offline(&self) -> bool {
        self.network == Reachability::Offline
    }

    fn is_tab_hidden(&self) -> bool {
        self.tab == TabVisibility::Hidden
    }

    fn in_socket(&self) -> bool {
        matches!(self.phase, ConnectionPhase::SocketCreated { .. })
    }

    /// Process one event to completion
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.dispatch(event, &mut effects);
        self.settle(&mut effects);
        effects
    }

    fn dispatch(&mut self, event: Event, effects: &mut Vec<Effect>) {
        match event {
            Event::TabVisible => self.tab = TabVisibility::VisibleOrUnknown,
            Event::TabHidden => self.tab = TabVisibility::Hidden,
            Event::Online => self.network = Reachability::OnlineOrUnknown,
            Event::Offline => self.network = Reachability::Offline,
            Event::Configure(endpoint) => self.configure(&endpoint),
            Event::Connect => {
                if self.has_endpoint() && !self.in_socket() {
                    self.enter(ConnectionPhase::TimedOut, effects);
                }
            }
            Event::Disconnect => self.enter(ConnectionPhase::Disconnected, effects),
            Event::PageHide | Event::PageFreeze => {
                if matches!(
                    self.phase,
                    ConnectionPhase::TimedOut
                        | ConnectionPhase::ErrorWait
                        | ConnectionPhase::TemporarilyOffline
                        | ConnectionPhase::SocketCreated { .. }
                ) {
                    self.enter(ConnectionPhase::PageHidden, effects);
                }
            }
            Event::PageShow | Event::PageResume => {
                if self.phase == ConnectionPhase::PageHidden {
                    self.enter(ConnectionPhase::TimedOut, effects);
                }
            }
            Event::Opened => {
                if let ConnectionPhase::SocketCreated {
                    open: OpenPhase::Opening,
                    idle,
                } = self.phase
                {
                    self.clear_errors();
                    self.cancel_timer(TimerKind::OpenTimeout, effects);
                    self.phase = ConnectionPhase::SocketCreated {
                        open: OpenPhase::Opened(Keepalive::PongReceived),
                        idle,
                    };
                    self.arm_timer(TimerKind::PingPeriod, self.settings.ping_period(), effects);
                    effects.push(Effect::NotifyReconnected);
                }
            }
            Event::PingSucceeded => {
                if let ConnectionPhase::SocketCreated {
                    open: OpenPhase::Opened(Keepalive::PingSent),
                    idle,
                } = self.phase
                {
                    self.phase = ConnectionPhase::SocketCreated {
                        open: OpenPhase::Opened(Keepalive::PongReceived),
                        idle,
                    };
                    self.arm_timer(TimerKind::PingPeriod, self.settings.ping_period(), effects);
                }
            }
            Event::Error(message) => {
                if self.in_socket() {
                    warn!("Connection error: {}", message);
                    self.push_error(message);
                    self.enter(ConnectionPhase::ErrorWait, effects);
                } else {
                    debug!("Ignoring error outside socket ({}): {}", self.phase, message);
                }
            }
            Event::TimerFired { kind, generation } => {
                if self.generations[kind.index()] == generation {
                    self.on_timer(kind, effects);
                }
            }
        }
    }

    fn on_timer(&mut self, kind: TimerKind, effects: &mut Vec<Effect>) {
        match (kind, self.phase) {
            (TimerKind::ErrorWait, ConnectionPhase::ErrorWait) => {
                self.enter(ConnectionPhase::TimedOut, effects);
            }
            (
                TimerKind::OpenTimeout,
                ConnectionPhase::SocketCreated {
                    open: OpenPhase::Opening,
                    ..
                },
            ) => {
                self.dispatch(Event::Error("Open timeout".to_string()), effects);
            }
            (
                TimerKind::PingPeriod,
                ConnectionPhase::SocketCreated {
                    open: OpenPhase::Opened(Keepalive::PongReceived),
                    idle,
                },
            ) => {
                self.phase = ConnectionPhase::SocketCreated {
                    open: OpenPhase::Opened(Keepalive::PingSent),
                    idle,
                };
                effects.push(Effect::SendPing);
            }
            (
                TimerKind::IdleTimeout,
                ConnectionPhase::SocketCreated {
                    idle: IdlePhase::Inactive,
                    ..
                },
            ) => {
                debug!("Tab hidden for too long, closing connection");
                self.enter(ConnectionPhase::TimedOut, effects);
            }
            _ => {}
        }
    }

    fn configure(&mut self, endpoint: &str) {
        if self.phase != ConnectionPhase::Disconnected {
            warn!("Ignoring configure while {}", self.phase);
            return;
        }
        match Url::parse(endpoint) {
            Ok(url) if matches!(url.scheme(), "ws" | "wss") => self.endpoint = Some(url),
            Ok(url) => {
                warn!("Unsupported endpoint scheme '{}'", url.scheme());
                self.endpoint = None;
            }
            Err(e) => {
                warn!("Invalid endpoint '{}': {}", endpoint, e);
                self.endpoint = None;
            }
        }
    }

    /// Take eventless transitions until the machine is stable
    fn settle(&mut self, effects: &mut Vec<Effect>) {
        for _ in 0..MAX_SETTLE_STEPS {
            let next = match self.phase {
                ConnectionPhase::TimedOut if !self.has_endpoint() => {
                    Some(ConnectionPhase::Disconnected)
                }
                ConnectionPhase::TimedOut | ConnectionPhase::ErrorWait
                    if self.needs_network() && self.is_offline() =>
                {
                    Some(ConnectionPhase::TemporarilyOffline)
                }
                ConnectionPhase::TimedOut if !self.is_tab_hidden() => {
                    Some(ConnectionPhase::SocketCreated {
                        open: OpenPhase::Opening,
                        idle: IdlePhase::Active,
                    })
                }
                ConnectionPhase::TemporarilyOffline if !self.is_offline() => {
                    Some(ConnectionPhase::TimedOut)
                }
                ConnectionPhase::SocketCreated {
                    open: OpenPhase::Opening,
                    ..
                } if self.is_tab_hidden() => Some(ConnectionPhase::TimedOut),
                _ => None,
            };
            match next {
                Some(phase) => self.enter(phase, effects),
                None => {
                    self.settle_idle(effects);
                    return;
                }
            }
        }
        warn!("Connection machine did not settle, stopped in {}", self.phase);
    }

    fn settle_idle(&mut self, effects: &mut Vec<Effect>) {
        let ConnectionPhase::SocketCreated { open, idle } = self.phase else {
            return;
        };
        match idle {
            IdlePhase::Active if self.is_tab_hidden() => {
                self.phase = ConnectionPhase::SocketCreated {
                    open,
                    idle: IdlePhase::Inactive,
                };
                self.arm_timer(TimerKind::IdleTimeout, self.settings.idle_timeout(), effects);
            }
            IdlePhase::Inactive if !self.is_tab_hidden() => {
                self.phase = ConnectionPhase::SocketCreated {
                    open,
                    idle: IdlePhase::Active,
                };
                self.cancel_timer(TimerKind::IdleTimeout, effects);
            }
            _ => {}
        }
    }

    /// Exit the current phase and enter `next`, running both actions
    fn enter(&mut self, next: ConnectionPhase, effects: &mut Vec<Effect>) {
        match self.phase {
            ConnectionPhase::SocketCreated { .. } => {
                for kind in [
                    TimerKind::OpenTimeout,
                    TimerKind::PingPeriod,
                    TimerKind::IdleTimeout,
                ] {
                    self.cancel_timer(kind, effects);
                }
                effects.push(Effect::CancelPendingRequests);
                effects.push(Effect::CloseTransport);
            }
            ConnectionPhase::ErrorWait => self.cancel_timer(TimerKind::ErrorWait, effects),
            _ => {}
        }

        debug!("Connection {} -> {}", self.phase, next);
        self.phase = next;

        match next {
            ConnectionPhase::Disconnected | ConnectionPhase::TemporarilyOffline => {
                self.clear_errors();
                effects.push(Effect::NotifyDisconnected);
            }
            ConnectionPhase::PageHidden => self.clear_errors(),
            ConnectionPhase::ErrorWait => {
                let delay = self.settings.error_wait_time(self.error_count);
                debug!(
                    "Waiting {} ms before reconnecting ({} errors)",
                    delay.as_millis(),
                    self.error_count
                );
                self.arm_timer(TimerKind::ErrorWait, delay, effects);
            }
            ConnectionPhase::SocketCreated { .. } => match self.endpoint.clone() {
                Some(endpoint) => {
                    self.attempt += 1;
                    effects.push(Effect::OpenTransport {
                        endpoint,
                        attempt: self.attempt,
                    });
                    self.arm_timer(TimerKind::OpenTimeout, self.settings.open_timeout(), effects);
                }
                None => self.enter(ConnectionPhase::Disconnected, effects),
            },
            ConnectionPhase::TimedOut => {}
        }
    }

    fn arm_timer(&mut self, kind: TimerKind, delay: Duration, effects: &mut Vec<Effect>) {
        let generation = &mut self.generations[kind.index()];
        *generation += 1;
        effects.push(Effect::StartTimer {
            kind,
            generation: *generation,
            delay,
        });
    }

    fn cancel_timer(&mut self, kind: TimerKind, effects: &mut Vec<Effect>) {
        self.generations[kind.index()] += 1;
        effects.push(Effect::CancelTimer(kind));
    }

    /// Cancel every armed timer, used when the driver shuts down
    pub fn cancel_all_timers(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        for kind in TimerKind::ALL {
            self.cancel_timer(kind, &mut effects);
        }
        effects
    }

    fn push_error(&mut self, message: String) {
        self.error_count += 1;
        self.errors.push_back(message);
        while self.errors.len() > self.settings.max_recent_errors.max(1) {
            self.errors.pop_front();
        }
    }

    fn clear_errors(&mut self) {
        self.errors.clear();
        self.error_count = 0;
    }
}
