use std::{
    collections::HashMap,
    net::IpAddr,
    time::{Duration, Instant},
};

use crate::spectral::backend::{RequestData, RequestKind};

/// Per-backend connection limiter, selected at agent construction.
#[derive(Debug)]
pub enum ConnectionLimiter {
    AlwaysAllow,
    Absolute(AbsoluteLimiter),
    BotFilter(BotFilterLimiter),
}

impl ConnectionLimiter {
    pub fn allow(&mut self, req: &RequestData) -> bool {
        match self {
            Self::AlwaysAllow => true,
            Self::Absolute(limiter) => limiter.allow(req),
            Self::BotFilter(limiter) => limiter.allow(req),
        }
    }
}

/// Fixed-window counter: at most `limit` allowed requests per window.
#[derive(Debug)]
pub struct AbsoluteLimiter {
    limit: u32,
    window: Duration,
    limit_status: bool,
    count: u32,
    window_start: Option<Instant>,
}

impl AbsoluteLimiter {
    pub fn new(limit: u32, window: Duration, limit_status: bool) -> Self {
        Self {
            limit,
            window,
            limit_status,
            count: 0,
            window_start: None,
        }
    }

    fn allow(&mut self, req: &RequestData) -> bool {
        let now = Instant::now();
        match self.window_start {
            Some(start) if now.duration_since(start) < self.window => {}
            _ => {
                self.count = 0;
                self.window_start = Some(now);
            }
        }

        if !self.limit_status && req.kind == RequestKind::Status {
            return true;
        }
        if self.count < self.limit {
            self.count += 1;
            return true;
        }
        false
    }
}

/// Login limiter that, once a window overflows, switches into verification
/// mode: each source IP must reconnect with the username it was first seen
/// with; a username change gets the IP blacklisted.
#[derive(Debug)]
pub struct BotFilterLimiter {
    limit: u32,
    window: Duration,
    unverify_cooldown: Duration,
    list_clear_time: Duration,

    limiting: bool,
    count: u32,
    window_start: Option<Instant>,
    last_over_limit: Option<Instant>,

    name_by_ip: HashMap<IpAddr, (String, Instant)>,
    blacklist: HashMap<IpAddr, Instant>,
}

impl BotFilterLimiter {
    pub fn new(
        limit: u32,
        window: Duration,
        list_clear_time: Duration,
        unverify_cooldown: Duration,
    ) -> Self {
        Self {
            limit,
            window,
            unverify_cooldown,
            list_clear_time,
            limiting: false,
            count: 0,
            window_start: None,
            last_over_limit: None,
            name_by_ip: HashMap::new(),
            blacklist: HashMap::new(),
        }
    }

    fn allow(&mut self, req: &RequestData) -> bool {
        if req.kind == RequestKind::Status {
            return true;
        }

        let now = Instant::now();
        self.roll_window(now);

        // Limiting as of before this request: the login that crosses the
        // limit still passes, verification applies from the next one on.
        let was_limiting = self.limiting;
        self.count += 1;
        self.limiting = self.limiting || self.count > self.limit;

        let ip = req.client_addr.ip();
        match self.blacklist.get(&ip) {
            Some(&banned_at) if now.duration_since(banned_at) < self.list_clear_time => {
                return false;
            }
            Some(_) => {
                self.blacklist.remove(&ip);
            }
            None => {}
        }

        if was_limiting {
            match self.name_by_ip.get_mut(&ip) {
                None => {
                    self.name_by_ip.insert(ip, (req.username.clone(), now));
                    return false;
                }
                Some((name, seen)) if *name == req.username => {
                    *seen = now;
                }
                Some(_) => {
                    self.blacklist.insert(ip, now);
                    return false;
                }
            }
        }

        true
    }

    fn roll_window(&mut self, now: Instant) {
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return;
        };
        if now.duration_since(start) < self.window {
            return;
        }

        if self.count > self.limit {
            self.last_over_limit = Some(start);
        }
        if self.limiting {
            let calm = self
                .last_over_limit
                .map(|at| now.duration_since(at) >= self.unverify_cooldown)
                .unwrap_or(true);
            if calm {
                self.limiting = false;
            }
        }
        self.count = 0;
        self.window_start = Some(now);

        // Age out both maps so they cannot grow with the address space.
        let clear = self.list_clear_time;
        self.blacklist
            .retain(|_, &mut banned_at| now.duration_since(banned_at) < clear);
        self.name_by_ip
            .retain(|_, &mut (_, seen)| now.duration_since(seen) < clear);
    }
}
