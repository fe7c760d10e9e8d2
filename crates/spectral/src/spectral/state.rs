use std::time::{Duration, Instant};

use crate::spectral::net::Dialer;

/// Cached liveness of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Online,
    Offline,
    Unknown,
}

/// Per-backend liveness agent.
///
/// The probing variant answers from cache inside the cooldown window; outside
/// it, a single TCP dial decides Online/Offline. The probe connection is
/// dropped immediately, its only purpose is liveness.
#[derive(Debug)]
pub enum StateAgent {
    AlwaysOnline,
    AlwaysOffline,
    Probing(ProbeState),
}

impl StateAgent {
    pub fn probing(dialer: Dialer, cooldown: Duration) -> Self {
        Self::Probing(ProbeState {
            dialer,
            cooldown,
            state: ServerState::Unknown,
            last_probe: None,
        })
    }

    pub async fn state(&mut self) -> ServerState {
        match self {
            Self::AlwaysOnline => ServerState::Online,
            Self::AlwaysOffline => ServerState::Offline,
            Self::Probing(probe) => probe.state().await,
        }
    }
}

#[derive(Debug)]
pub struct ProbeState {
    dialer: Dialer,
    cooldown: Duration,
    state: ServerState,
    last_probe: Option<Instant>,
}

impl ProbeState {
    async fn state(&mut self) -> ServerState {
        if let Some(at) = self.last_probe {
            if at.elapsed() < self.cooldown {
                return self.state;
            }
        }

        self.state = match self.dialer.dial().await {
            Ok(conn) => {
                drop(conn);
                ServerState::Online
            }
            Err(_) => ServerState::Offline,
        };
        self.last_probe = Some(Instant::now());
        self.state
    }
}
