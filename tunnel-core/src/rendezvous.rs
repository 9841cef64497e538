//! Role resolution: claim the primary identity, fall back to secondary on conflict, then keep dialing
//! the counterpart identity until a channel is up.
//!
//! Host-driven like the rest of the core. The host calls [`RoleResolver::tick`] once per [`TICK`],
//! reports registration outcomes, and executes the returned [`RendezvousAction`]s.

use std::time::Duration;

use crate::identity::{Role, RoomId};

/// Interval at which the host is expected to call `tick`.
pub const TICK: Duration = Duration::from_secs(1);

/// Delay before claiming the secondary identity after losing the primary.
pub const SECONDARY_DELAY_TICKS: u64 = 1;

/// Interval between outbound connection attempts while disconnected.
pub const CONNECT_INTERVAL_TICKS: u64 = 3;

/// First backoff after a signalling failure; doubles per consecutive failure.
pub const INITIAL_BACKOFF_TICKS: u64 = 2;

/// Upper bound for the registration backoff.
pub const MAX_BACKOFF_TICKS: u64 = 32;

/// Why a registration failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    /// Someone else holds the identity.
    #[error("identity already claimed")]
    IdentityTaken,
    /// The signalling service could not be reached or refused for another reason.
    #[error("signalling unavailable: {0}")]
    Unavailable(String),
}

/// What the host must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousAction {
    /// Claim this identity at the signalling service.
    Register { identity: String },
    /// Drop the claim (or the failed registration attempt) for this identity.
    Release { identity: String },
    /// Open a channel toward this identity.
    Connect { target: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousState {
    /// Not started.
    Idle,
    /// Registration request for `role` is outstanding.
    Claiming { role: Role },
    /// Lost the primary; secondary claim goes out at `due`.
    FallbackPending { due: u64 },
    /// Signalling failed; restart from primary at `due`.
    Backoff { due: u64 },
    /// Holding `role`; dialing the other identity every interval while disconnected.
    Registered { role: Role, next_connect: u64 },
    /// Torn down. Inert.
    Shutdown,
}

/// Role resolution state machine for one room.
#[derive(Debug, Clone)]
pub struct RoleResolver {
    room: RoomId,
    state: RendezvousState,
    tick_count: u64,
    connected: bool,
    failures: u32,
}

impl RoleResolver {
    pub fn new(room: RoomId) -> Self {
        Self {
            room,
            state: RendezvousState::Idle,
            tick_count: 0,
            connected: false,
            failures: 0,
        }
    }

    pub fn state(&self) -> RendezvousState {
        self.state
    }

    /// Role currently held, if registered.
    pub fn role(&self) -> Option<Role> {
        match self.state {
            RendezvousState::Registered { role, .. } => Some(role),
            _ => None,
        }
    }

    /// Begin by claiming the primary identity immediately.
    pub fn start(&mut self) -> Vec<RendezvousAction> {
        if self.state != RendezvousState::Idle {
            return vec![];
        }
        self.claim(Role::Primary)
    }

    /// Registration for `identity` succeeded.
    pub fn on_registered(&mut self, identity: &str) -> Vec<RendezvousAction> {
        let role = match self.state {
            RendezvousState::Claiming { role } if self.room.endpoint(role) == identity => role,
            _ => {
                // Late success for a claim we no longer want.
                tracing::debug!(identity, "dropping stale registration");
                return vec![RendezvousAction::Release {
                    identity: identity.to_string(),
                }];
            }
        };
        tracing::info!(identity, ?role, "registered");
        self.failures = 0;
        self.state = RendezvousState::Registered {
            role,
            next_connect: self.tick_count,
        };
        self.connect_if_due()
    }

    /// Registration for the outstanding claim failed.
    pub fn on_register_failed(&mut self, err: &RegisterError) -> Vec<RendezvousAction> {
        let RendezvousState::Claiming { role } = self.state else {
            return vec![];
        };
        let identity = self.room.endpoint(role);
        let actions = vec![RendezvousAction::Release {
            identity: identity.clone(),
        }];
        match (role, err) {
            (Role::Primary, RegisterError::IdentityTaken) => {
                tracing::info!(%identity, "primary taken, falling back to secondary");
                self.state = RendezvousState::FallbackPending {
                    due: self.tick_count + SECONDARY_DELAY_TICKS,
                };
            }
            _ => {
                tracing::warn!(%identity, error = %err, "registration failed");
                self.back_off();
            }
        }
        actions
    }

    /// Connection to the signalling service dropped after registration. Claim is gone.
    pub fn on_signalling_lost(&mut self) -> Vec<RendezvousAction> {
        match self.state {
            RendezvousState::Registered { .. } | RendezvousState::Claiming { .. } => {
                tracing::warn!("signalling connection lost");
                self.back_off();
            }
            _ => {}
        }
        vec![]
    }

    /// A channel became active or went away.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        if let RendezvousState::Registered { role, .. } = self.state {
            if !connected {
                // Retry on the next tick.
                self.state = RendezvousState::Registered {
                    role,
                    next_connect: self.tick_count + 1,
                };
            }
        }
    }

    /// Advance one tick. Fires pending claims and connection attempts.
    pub fn tick(&mut self) -> Vec<RendezvousAction> {
        if self.state == RendezvousState::Shutdown {
            return vec![];
        }
        self.tick_count = self.tick_count.saturating_add(1);
        match self.state {
            RendezvousState::FallbackPending { due } if self.tick_count >= due => {
                self.claim(Role::Secondary)
            }
            RendezvousState::Backoff { due } if self.tick_count >= due => self.claim(Role::Primary),
            RendezvousState::Registered { .. } => self.connect_if_due(),
            _ => vec![],
        }
    }

    /// Release the claim and go inert. Safe to call more than once.
    pub fn shutdown(&mut self) -> Vec<RendezvousAction> {
        let held = match self.state {
            RendezvousState::Registered { role, .. } | RendezvousState::Claiming { role } => {
                Some(self.room.endpoint(role))
            }
            _ => None,
        };
        self.state = RendezvousState::Shutdown;
        self.connected = false;
        held.map(|identity| RendezvousAction::Release { identity })
            .into_iter()
            .collect()
    }

    fn claim(&mut self, role: Role) -> Vec<RendezvousAction> {
        self.state = RendezvousState::Claiming { role };
        vec![RendezvousAction::Register {
            identity: self.room.endpoint(role),
        }]
    }

    fn back_off(&mut self) {
        let shift = self.failures.min(8);
        let delay = (INITIAL_BACKOFF_TICKS << shift).min(MAX_BACKOFF_TICKS);
        self.failures = self.failures.saturating_add(1);
        self.state = RendezvousState::Backoff {
            due: self.tick_count + delay,
        };
    }

    fn connect_if_due(&mut self) -> Vec<RendezvousAction> {
        let RendezvousState::Registered { role, next_connect } = self.state else {
            return vec![];
        };
        if self.connected || self.tick_count < next_connect {
            return vec![];
        }
        self.state = RendezvousState::Registered {
            role,
            next_connect: self.tick_count + CONNECT_INTERVAL_TICKS,
        };
        vec![RendezvousAction::Connect {
            target: self.room.endpoint(role.other()),
        }]
    }
}
