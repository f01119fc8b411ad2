//! Fixed-window rate limiting per source IP, with escalation into the
//! blocklist.
//!
//! Every hit over the window limit is rejected and adds one penalty point,
//! so a window contributes exactly its excess hits. Each window that closes
//! within the limit halves the penalty. A source whose penalty reaches the
//! escalation threshold is moved into the [`AddressBlocklist`].
//!
//! Sources whose last window closed with no penalty left are forgotten,
//! swept at most once per window from [`AddressThrottle::hit`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use relayhub_core::Message;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::blocklist::AddressBlocklist;
use super::pipeline::Middleware;
use super::source_ip;
use crate::network::Connection;
use crate::service::config::ThrottleConfig;
use crate::service::request::ServiceRequest;

pub const THROTTLE_ID: &str = "address-throttle";
pub const THROTTLE_PRIORITY: i32 = 2;

/// Outcome of one recorded hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleVerdict {
    Allowed { hits: u32 },
    Limited { hits: u32, penalty: u32 },
    /// The source crossed the escalation threshold and is now blocklisted.
    Escalated { hits: u32 },
}

struct Window {
    started: Instant,
    hits: u32,
    penalty: u32,
}

impl Window {
    /// Penalty once the windows closed by `now` are accounted for, or `None`
    /// while the current window is still open. Windows skipped entirely had
    /// no hits, so they count as clean.
    fn rolled_penalty(&self, now: Instant, window: Duration, max: u32) -> Option<u32> {
        let elapsed = now.duration_since(self.started);
        if elapsed < window {
            return None;
        }
        let passed = elapsed.as_millis() / window.as_millis();
        let clean = passed - 1 + u128::from(self.hits <= max);
        Some(
            u32::try_from(clean)
                .ok()
                .and_then(|shift| self.penalty.checked_shr(shift))
                .unwrap_or(0),
        )
    }
}

/// Hit counters keyed by source IP.
pub struct AddressThrottle {
    config: ThrottleConfig,
    windows: DashMap<String, Window>,
    blocklist: Arc<AddressBlocklist>,
    last_sweep: Mutex<Instant>,
}

impl AddressThrottle {
    #[must_use]
    pub fn new(config: ThrottleConfig, blocklist: Arc<AddressBlocklist>) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            blocklist,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_ms.max(1))
    }

    /// Records one hit from `ip`.
    pub fn hit(&self, ip: &str) -> ThrottleVerdict {
        let now = Instant::now();
        let window = self.window();
        let max = self.config.max_hits_per_window;
        self.maybe_sweep(now);

        let verdict = {
            let mut w = self.windows.entry(ip.to_string()).or_insert_with(|| Window {
                started: now,
                hits: 0,
                penalty: 0,
            });

            if let Some(penalty) = w.rolled_penalty(now, window, max) {
                w.penalty = penalty;
                w.started = now;
                w.hits = 0;
            }

            w.hits = w.hits.saturating_add(1);
            let hits = w.hits;
            if hits <= max {
                ThrottleVerdict::Allowed { hits }
            } else {
                w.penalty = w.penalty.saturating_add(1);
                if w.penalty >= self.config.escalation_threshold {
                    ThrottleVerdict::Escalated { hits }
                } else {
                    ThrottleVerdict::Limited { hits, penalty: w.penalty }
                }
            }
        };

        if matches!(verdict, ThrottleVerdict::Escalated { .. }) {
            self.windows.remove(ip);
            self.blocklist
                .block(ip, self.config.blocklist_duration_ms.map(Duration::from_millis));
            warn!(source = %ip, "throttle penalty exceeded, source blocklisted");
        }
        verdict
    }

    /// Forgets sources whose windows have closed with no penalty left.
    /// Returns how many were removed.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let window = self.window();
        let max = self.config.max_hits_per_window;
        let before = self.windows.len();
        self.windows
            .retain(|_, w| w.rolled_penalty(now, window, max) != Some(0));
        before.saturating_sub(self.windows.len())
    }

    fn maybe_sweep(&self, now: Instant) {
        {
            let Some(mut last) = self.last_sweep.try_lock() else {
                return;
            };
            if now.duration_since(*last) < self.window() {
                return;
            }
            *last = now;
        }
        let purged = self.purge_idle();
        if purged > 0 {
            debug!(purged, "idle throttle windows dropped");
        }
    }

    /// Current penalty points of `ip`.
    #[must_use]
    pub fn penalty(&self, ip: &str) -> Option<u32> {
        self.windows.get(ip).map(|w| w.penalty)
    }

    /// Number of tracked sources.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

/// Rejects sources over their hit budget with `Forbidden`.
pub struct ThrottleMiddleware {
    throttle: AddressThrottle,
}

impl ThrottleMiddleware {
    #[must_use]
    pub fn new(config: ThrottleConfig, blocklist: Arc<AddressBlocklist>) -> Self {
        Self {
            throttle: AddressThrottle::new(config, blocklist),
        }
    }

    #[must_use]
    pub fn throttle(&self) -> &AddressThrottle {
        &self.throttle
    }
}

#[async_trait]
impl Middleware for ThrottleMiddleware {
    fn id(&self) -> &str {
        THROTTLE_ID
    }

    fn priority(&self) -> i32 {
        THROTTLE_PRIORITY
    }

    async fn run(&self, conn: &dyn Connection, request: &ServiceRequest) {
        if !self.throttle.config.enabled {
            return;
        }
        let ip = source_ip(conn, request);
        let verdict = self.throttle.hit(&ip);
        let hits = match verdict {
            ThrottleVerdict::Allowed { hits }
            | ThrottleVerdict::Limited { hits, .. }
            | ThrottleVerdict::Escalated { hits } => hits,
        };
        request.update_context(|ctx| ctx.throttle_hits = Some(hits));

        let reason = match verdict {
            ThrottleVerdict::Allowed { .. } => return,
            ThrottleVerdict::Limited { .. } => "rate limit exceeded",
            ThrottleVerdict::Escalated { .. } => "source address is blocked",
        };
        warn!(source = %ip, hits, request = %request.id(), "throttled request rejected");
        let _ = request.reject(Message::forbidden(request.message(), reason));
    }
}
