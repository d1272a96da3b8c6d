//! Migration state machine.
//!
//! Watches the default route and, when it moves, walks one attempt through
//! detect, validate and commit. The controller is the only component that
//! mutates path state on the session; everything else reads.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use roam_core::MigrationPolicy;
use roam_engine::{PacketWriter, Path, PathContext, Session, UdpWriter};

use crate::context::RunContext;
use crate::metrics::HandoverMetrics;
use crate::route::{self, RouteEntry};
use crate::validate::PathValidator;

/// Position of the controller in one migration attempt. New route signals
/// are accepted only while `Idle` or `Stable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    PathChangeDetected = 1,
    Validating = 2,
    Committing = 3,
    Stable = 4,
}

struct PhaseCell(AtomicU8);

impl PhaseCell {
    fn new() -> Self {
        Self(AtomicU8::new(Phase::Idle as u8))
    }

    fn get(&self) -> Phase {
        match self.0.load(Ordering::Acquire) {
            0 => Phase::Idle,
            1 => Phase::PathChangeDetected,
            2 => Phase::Validating,
            3 => Phase::Committing,
            _ => Phase::Stable,
        }
    }

    /// Claims the single attempt slot; exactly one caller wins until the
    /// attempt resolves back to a resting phase.
    fn arm(&self) -> bool {
        for resting in [Phase::Idle, Phase::Stable] {
            let claimed = self.0.compare_exchange(
                resting as u8,
                Phase::PathChangeDetected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if claimed.is_ok() {
                return true;
            }
        }
        false
    }

    fn set(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

/// Outcome of one route observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    /// Nothing actionable in the routing table.
    NoChange,
    /// Local-address drift seen but the policy keeps the current path.
    Ignored,
    /// A change arrived while an earlier attempt was still in flight.
    Busy,
    /// The attempt ran and failed; the session stays on the old path.
    Failed,
    /// The session now runs on the new path.
    Migrated,
}

/// Route the session is currently believed to use.
#[derive(Debug, Clone)]
struct ConfirmedRoute {
    interface: String,
    gateway: Ipv4Addr,
    local_ip: Option<Ipv4Addr>,
}

/// Owns the active path and drives migration attempts, at most one at a
/// time.
pub struct MigrationController {
    context: RunContext,
    session: Arc<dyn Session>,
    metrics: Arc<HandoverMetrics>,
    phase: PhaseCell,
    confirmed: Mutex<Option<ConfirmedRoute>>,
    active: tokio::sync::Mutex<Option<Path>>,
}

impl MigrationController {
    pub fn new(
        context: RunContext,
        session: Arc<dyn Session>,
        metrics: Arc<HandoverMetrics>,
    ) -> Self {
        Self {
            context,
            session,
            metrics,
            phase: PhaseCell::new(),
            confirmed: Mutex::new(None),
            active: tokio::sync::Mutex::new(None),
        }
    }

    fn confirmed(&self) -> MutexGuard<'_, Option<ConfirmedRoute>> {
        match self.confirmed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    /// An attempt is somewhere between detection and commit.
    pub fn is_migrating(&self) -> bool {
        matches!(
            self.phase.get(),
            Phase::PathChangeDetected | Phase::Validating | Phase::Committing
        )
    }

    /// Local address of the last committed path, if any migration or port
    /// rotation has happened.
    pub async fn active_local(&self) -> Option<SocketAddr> {
        self.active.lock().await.as_ref().map(|path| path.local)
    }

    /// Records the route the initial connection went out on, so subsequent
    /// polls start from "no change".
    pub fn seed_current_route(&self) {
        self.metrics.add_route_lookup();
        let Some(entry) = route::discover_default_route(None) else {
            debug!("no default route to seed from");
            return;
        };
        let local_ip = route::interface_ipv4(&entry.interface);
        debug!(gateway = %entry.gateway, interface = %entry.interface, "seeded current route");
        *self.confirmed() = Some(ConfirmedRoute {
            interface: entry.interface.clone(),
            gateway: entry.gateway,
            local_ip,
        });
    }

    /// One poll of the platform routing table.
    pub async fn poll_routes(&self) -> PollDecision {
        self.metrics.add_route_lookup();
        let current = self.confirmed().clone();
        let seen = current.as_ref().map(|route| route.gateway);
        if let Some(entry) = route::discover_default_route(seen) {
            let candidate_ip = route::interface_ipv4(&entry.interface);
            return self.observe(&entry, candidate_ip).await;
        }
        // No new gateway. The drift-sensitive policy still re-checks the
        // local address on the confirmed interface.
        if self.context.config().policy == MigrationPolicy::AnyPathChange {
            if let Some(current) = current {
                let entry = RouteEntry::assumed_default(current.interface.clone(), current.gateway);
                let candidate_ip = route::interface_ipv4(&current.interface);
                return self.observe(&entry, candidate_ip).await;
            }
        }
        PollDecision::NoChange
    }

    /// Processes one observed default route. Split out of [`poll_routes`]
    /// so synthetic routes can drive the state machine directly.
    ///
    /// [`poll_routes`]: MigrationController::poll_routes
    pub async fn observe(
        &self,
        entry: &RouteEntry,
        candidate_ip: Option<Ipv4Addr>,
    ) -> PollDecision {
        if !self.session.is_connected() {
            debug!("route change while disconnected, ignoring");
            return PollDecision::NoChange;
        }
        let (gateway_changed, known_local) = {
            let mut confirmed = self.confirmed();
            match confirmed.as_ref() {
                Some(current) => (current.gateway != entry.gateway, current.local_ip),
                None => {
                    // first sighting; the session already runs on this route
                    info!(
                        gateway = %entry.gateway,
                        interface = %entry.interface,
                        "adopted current route"
                    );
                    *confirmed = Some(ConfirmedRoute {
                        interface: entry.interface.clone(),
                        gateway: entry.gateway,
                        local_ip: candidate_ip,
                    });
                    return PollDecision::NoChange;
                }
            }
        };
        let Some(candidate_ip) = candidate_ip else {
            debug!(interface = %entry.interface, "candidate interface has no IPv4 address");
            return PollDecision::NoChange;
        };
        if !gateway_changed {
            if known_local == Some(candidate_ip) {
                return PollDecision::NoChange;
            }
            if self.context.config().policy == MigrationPolicy::GatewayChange {
                info!(
                    interface = %entry.interface,
                    local = %candidate_ip,
                    "local address drift without gateway change, keeping current path"
                );
                // remember the drifted address so this logs once
                if let Some(current) = self.confirmed().as_mut() {
                    current.local_ip = Some(candidate_ip);
                }
                return PollDecision::Ignored;
            }
        }
        if !self.phase.arm() {
            debug!(phase = ?self.phase.get(), "route change ignored, migration already in flight");
            return PollDecision::Busy;
        }
        self.attempt(entry, candidate_ip).await
    }

    /// Runs one armed attempt to completion. The phase cell is already
    /// claimed; every exit settles it to `Stable` (the surviving path,
    /// old or new, is authoritative) so detection can re-arm.
    async fn attempt(&self, entry: &RouteEntry, candidate_ip: Ipv4Addr) -> PollDecision {
        info!(gateway = %entry.gateway, interface = %entry.interface, "path change detected");
        self.metrics.record_handover_start(self.context.elapsed_ms());
        if let Some(sequence) = self.session.largest_received_sequence() {
            self.metrics.record_pre_handover_sequence(sequence);
        }

        let config = self.context.config();
        let writer = match UdpWriter::bind(IpAddr::V4(candidate_ip), config.local_port) {
            Ok(writer) => Arc::new(writer) as Arc<dyn PacketWriter>,
            Err(error) => {
                warn!(%error, local = %candidate_ip, "cannot bind writer on new path");
                self.phase.set(Phase::Stable);
                return PollDecision::Failed;
            }
        };
        let candidate = PathContext::new(writer, self.session.peer_address());
        let local = candidate.local();

        self.phase.set(Phase::Validating);
        let validator = PathValidator::new(Arc::clone(&self.session));
        let validated = match validator.validate(candidate).await {
            Ok(context) => context,
            Err(reason) => {
                warn!(%reason, %local, "migration attempt abandoned");
                self.phase.set(Phase::Stable);
                return PollDecision::Failed;
            }
        };

        self.phase.set(Phase::Committing);
        let mut active = self.active.lock().await;
        let peer = validated.peer();
        let writer = validated.into_writer();
        // owns_writer stays false: this controller keeps the only
        // long-lived handle and the engine must not close it
        if !self.session.migrate_path(local, peer, Arc::clone(&writer), false) {
            warn!(%local, "engine refused path migration");
            drop(active);
            self.phase.set(Phase::Stable);
            return PollDecision::Failed;
        }
        *active = Some(Path { local, peer, writer });
        drop(active);

        *self.confirmed() = Some(ConfirmedRoute {
            interface: entry.interface.clone(),
            gateway: entry.gateway,
            local_ip: Some(candidate_ip),
        });
        self.metrics.record_handover_confirmed(self.context.elapsed_ms());
        info!(%local, %peer, gateway = %entry.gateway, "migrated to new path");
        self.phase.set(Phase::Stable);
        PollDecision::Migrated
    }

    /// Rebinds the source port on the current local address and moves the
    /// session onto it without validation, exercising NAT rebinding between
    /// request cycles. Skipped while a migration attempt is in flight.
    pub async fn rotate_local_port(&self) -> bool {
        if self.is_migrating() {
            debug!("skipping port rotation, migration in flight");
            return false;
        }
        let mut active = self.active.lock().await;
        let local_ip = active
            .as_ref()
            .map(|path| path.local.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let writer = match UdpWriter::bind(local_ip, 0) {
            Ok(writer) => Arc::new(writer) as Arc<dyn PacketWriter>,
            Err(error) => {
                warn!(%error, "cannot bind rotation socket");
                return false;
            }
        };
        let local = writer.local_addr();
        let peer = self.session.peer_address();
        if !self.session.migrate_path(local, peer, Arc::clone(&writer), false) {
            debug!(%local, "engine refused port rotation");
            return false;
        }
        *active = Some(Path { local, peer, writer });
        debug!(%local, "rotated local port");
        true
    }
}
