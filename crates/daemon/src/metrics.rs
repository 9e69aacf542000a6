use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Prometheus-compatible counters for the registry and the punching agent.
///
/// Both roles share the same struct; counters that do not apply to a role
/// simply stay at zero.
#[derive(Debug, Default)]
pub struct Metrics {
    // === Registry ===
    pub registrations_total: AtomicU64,
    pub lookups_total: AtomicU64,
    pub lookup_misses_total: AtomicU64,
    pub list_requests_total: AtomicU64,
    pub bad_requests_total: AtomicU64,

    // === Punching sessions ===
    /// Sessions currently in Punching or Established
    pub sessions_active: AtomicU64,
    pub sessions_started_total: AtomicU64,
    /// Sessions that saw an ACK for their own nonce
    pub sessions_established_total: AtomicU64,
    pub sessions_failed_total: AtomicU64,
    pub keepalives_sent_total: AtomicU64,
    pub datagrams_received_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // === Registry Methods ===

    pub fn inc_registrations(&self) {
        self.registrations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_lookups(&self) {
        self.lookups_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_lookup_misses(&self) {
        self.lookup_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_list_requests(&self) {
        self.list_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bad_requests(&self) {
        self.bad_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    // === Session Methods ===

    pub fn session_started(&self) {
        self.sessions_started_total.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self, failed: bool) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
        if failed {
            self.sessions_failed_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Lookup failures end an attempt before it ever becomes active.
    pub fn inc_sessions_failed(&self) {
        self.sessions_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_established(&self) {
        self.sessions_established_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_keepalives_sent(&self) {
        self.keepalives_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_datagrams_received(&self) {
        self.datagrams_received_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let series: [(&str, &str, &str, &AtomicU64); 11] = [
            (
                "registrations_total",
                "counter",
                "Registrations accepted",
                &self.registrations_total,
            ),
            (
                "lookups_total",
                "counter",
                "Peer lookups served",
                &self.lookups_total,
            ),
            (
                "lookup_misses_total",
                "counter",
                "Lookups for unknown ids",
                &self.lookup_misses_total,
            ),
            (
                "list_requests_total",
                "counter",
                "Registry listings served",
                &self.list_requests_total,
            ),
            (
                "bad_requests_total",
                "counter",
                "Malformed registry requests",
                &self.bad_requests_total,
            ),
            (
                "sessions_active",
                "gauge",
                "Punching sessions in progress",
                &self.sessions_active,
            ),
            (
                "sessions_started_total",
                "counter",
                "Punching sessions started",
                &self.sessions_started_total,
            ),
            (
                "sessions_established_total",
                "counter",
                "Sessions that received an ACK",
                &self.sessions_established_total,
            ),
            (
                "sessions_failed_total",
                "counter",
                "Attempts that ended with an error",
                &self.sessions_failed_total,
            ),
            (
                "keepalives_sent_total",
                "counter",
                "Keepalive datagrams sent",
                &self.keepalives_sent_total,
            ),
            (
                "datagrams_received_total",
                "counter",
                "Datagrams received on punched sockets",
                &self.datagrams_received_total,
            ),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in series {
            let _ = writeln!(out, "# HELP natpunch_{} {}", name, help);
            let _ = writeln!(out, "# TYPE natpunch_{} {}", name, kind);
            let _ = writeln!(out, "natpunch_{} {}", name, value.load(Ordering::Relaxed));
        }
        out
    }
}
