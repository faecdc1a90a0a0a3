//! Cluster membership, active selection and the background loops that keep
//! exactly one member active.
//!
//! The active member heart-beats every passive member; passive members watch
//! for silence and elect a replacement. Every loop body is a separate tick
//! method so tests can drive it with an explicit clock.

pub mod election;
pub mod member;
pub mod member_list;
pub mod tasks;

pub use member::{Member, MemberState};
pub use member_list::MemberList;
pub use tasks::{TaskKind, TaskSet};

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use pulseha_core::messages::{
    HealthCheckPayload, IpBatchPayload, LogsPayload, MemberTargetPayload, PeerReply, PeerRequest,
    ReplyBody,
};
use pulseha_core::{elapsed_secs, ClockSource, LogLevel, MemberStatus};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConfigStore;
use crate::error::{DaemonError, DaemonResult};
use crate::network::{PeerClient, PeerTransportConfig};
use crate::plugins::PluginHost;
use crate::security::TlsContext;

/// Which way a batch of floating IPs moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpDirection {
    Up,
    Down,
}

pub struct Cluster {
    config: Arc<ConfigStore>,
    members: MemberList,
    plugins: Arc<PluginHost>,
    tasks: TaskSet,
    clock: Arc<dyn ClockSource>,
    tls: Arc<TlsContext>,
    transport: PeerTransportConfig,
    /// The next fail-over tick is the first since this node became passive.
    first_failover_tick: AtomicBool,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("members", &self.members)
            .field("tasks", &self.tasks.running())
            .finish_non_exhaustive()
    }
}

impl Cluster {
    #[must_use]
    pub fn new(
        config: Arc<ConfigStore>,
        plugins: Arc<PluginHost>,
        tls: Arc<TlsContext>,
        clock: Arc<dyn ClockSource>,
        transport: PeerTransportConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            members: MemberList::new(),
            plugins,
            tasks: TaskSet::new(),
            clock,
            tls,
            transport,
            first_failover_tick: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn members(&self) -> &MemberList {
        &self.members
    }

    #[must_use]
    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn local_member(&self) -> DaemonResult<Arc<Member>> {
        self.members.local().ok_or(DaemonError::NotInCluster)
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Brings the member list in line with the configuration and closes the
    /// connections of members that are gone.
    pub async fn reconcile(&self) {
        let config = self.config.get();
        let local = self.config.local_hostname();
        let dropped = self.members.reconcile(&config, &local, |hostname, node| {
            let addr = node.socket_addr()?;
            Some(PeerClient::new(
                hostname,
                addr,
                Arc::clone(&self.tls),
                self.transport,
            ))
        });
        for member in dropped {
            debug!(member = member.hostname(), "member dropped");
            member.close().await;
        }
    }

    /// Builds the member list and takes the initial role: a lone node becomes
    /// active, otherwise this node starts passive and waits for heart-beats.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::NotInCluster`] if the configuration is not a
    /// cluster.
    pub async fn setup(self: &Arc<Self>) -> DaemonResult<()> {
        if !self.config.cluster_check() {
            return Err(DaemonError::NotInCluster);
        }
        self.reconcile().await;
        if self.config.node_count() == 1 {
            self.make_local_active().await
        } else {
            self.make_local_passive().await
        }
    }

    /// Stops every loop and forgets every member.
    pub async fn reset(&self) {
        self.tasks.reset();
        for member in self.members.clear() {
            member.close().await;
        }
    }

    // -----------------------------------------------------------------------
    // Promotion and demotion
    // -----------------------------------------------------------------------

    /// Makes `hostname` the active member.
    ///
    /// # Errors
    ///
    /// - [`DaemonError::NotFound`] for an unknown member.
    /// - [`DaemonError::Conflict`] if it is already active, or unavailable in
    ///   a cluster of more than one node.
    /// - Whatever prevented the target from becoming active; the previous
    ///   active is re-promoted on a best-effort basis.
    pub async fn promote_member(self: &Arc<Self>, hostname: &str) -> DaemonResult<()> {
        let target = self
            .members
            .get(hostname)
            .ok_or_else(|| DaemonError::NotFound(format!("member {hostname}")))?;
        match target.status() {
            MemberStatus::Active => {
                return Err(DaemonError::Conflict(format!("{hostname} is already active")));
            }
            MemberStatus::Unavailable if self.config.node_count() > 1 => {
                return Err(DaemonError::Conflict(format!("{hostname} is unavailable")));
            }
            _ => {}
        }

        let previous = self.members.active();
        if let Some(previous) = &previous {
            if let Err(e) = self.make_passive(previous).await {
                warn!(member = previous.hostname(), error = %e, "failed to demote previous active");
            }
            previous.set_status(MemberStatus::Passive);
        }

        if let Err(e) = self.make_active(&target).await {
            error!(member = hostname, error = %e, "promotion failed");
            if let Some(previous) = previous {
                if let Err(restore) = self.make_active(&previous).await {
                    error!(
                        member = previous.hostname(),
                        error = %restore,
                        "failed to restore the previous active; cluster state is inconsistent"
                    );
                }
            }
            return Err(e);
        }
        self.members.set_exclusive_active(hostname);
        Ok(())
    }

    async fn make_active(self: &Arc<Self>, member: &Arc<Member>) -> DaemonResult<()> {
        if member.is_local() {
            return self.make_local_active().await;
        }
        member
            .send(&PeerRequest::Promote(MemberTargetPayload {
                member: member.hostname().to_string(),
            }))
            .await?;
        self.members.set_exclusive_active(member.hostname());
        Ok(())
    }

    async fn make_passive(self: &Arc<Self>, member: &Arc<Member>) -> DaemonResult<()> {
        if member.is_local() {
            return self.make_local_passive().await;
        }
        member
            .send(&PeerRequest::MakePassive(MemberTargetPayload {
                member: member.hostname().to_string(),
            }))
            .await?;
        Ok(())
    }

    /// Takes over the floating IPs and starts the active-side loops.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotInCluster`] if there is no local member.
    pub async fn make_local_active(self: &Arc<Self>) -> DaemonResult<()> {
        let local = self.local_member()?;
        local.set_latency(None);
        local.set_last_hc_response(None);
        self.members.set_exclusive_active(local.hostname());

        self.tasks.stop(TaskKind::FailOverMonitor);
        self.move_local_ips(IpDirection::Up).await;
        self.spawn_loop(TaskKind::ConnectionMonitor);
        self.spawn_loop(TaskKind::HeartbeatFanOut);
        self.spawn_loop(TaskKind::HealthChecks);

        info!(member = local.hostname(), "this node is now active");
        self.relay_log(LogLevel::Info, format!("{} became active", local.hostname()));
        self.notify_status_change();
        Ok(())
    }

    /// Releases the floating IPs and starts watching for heart-beat silence.
    ///
    /// # Errors
    ///
    /// [`DaemonError::NotInCluster`] if there is no local member.
    pub async fn make_local_passive(self: &Arc<Self>) -> DaemonResult<()> {
        let local = self.local_member()?;
        self.tasks.stop(TaskKind::ConnectionMonitor);
        self.tasks.stop(TaskKind::HeartbeatFanOut);
        self.move_local_ips(IpDirection::Down).await;

        local.set_last_hc_response(Some(self.now()));
        let prior = local.set_status(MemberStatus::Passive);
        if self.spawn_loop(TaskKind::FailOverMonitor) {
            self.first_failover_tick.store(true, Ordering::SeqCst);
        }
        self.spawn_loop(TaskKind::HealthChecks);

        if prior != MemberStatus::Passive {
            info!(member = local.hostname(), was = %prior, "this node is now passive");
            self.relay_log(LogLevel::Info, format!("{} became passive", local.hostname()));
            self.notify_status_change();
        }
        Ok(())
    }

    /// Handles a `Promote` addressed to this node.
    ///
    /// # Errors
    ///
    /// As [`make_local_active`](Self::make_local_active).
    pub async fn accept_promotion(self: &Arc<Self>) -> DaemonResult<()> {
        self.make_local_active().await
    }

    // -----------------------------------------------------------------------
    // Floating IPs
    // -----------------------------------------------------------------------

    /// Runs one batch through the local networking plugin. A missing plugin
    /// means monitoring mode and is not an error.
    ///
    /// # Errors
    ///
    /// [`DaemonError::Internal`] if the plugin fails.
    pub async fn apply_local_ips(
        &self,
        direction: IpDirection,
        iface: &str,
        ips: &[String],
    ) -> DaemonResult<()> {
        if ips.is_empty() {
            return Ok(());
        }
        let result = match direction {
            IpDirection::Up => self.plugins.bring_up(iface, ips).await,
            IpDirection::Down => self.plugins.bring_down(iface, ips).await,
        };
        match result {
            Err(DaemonError::PluginMissing) => {
                debug!(iface, ?direction, "no networking plugin; monitoring only");
                Ok(())
            }
            other => other,
        }
    }

    /// Moves every group assigned on this node.
    pub async fn move_local_ips(&self, direction: IpDirection) {
        for (iface, ips) in self.config.get().local_ip_batches() {
            if let Err(e) = self.apply_local_ips(direction, &iface, &ips).await {
                error!(%iface, ?direction, error = %e, "failed to move floating IPs");
            }
        }
    }

    /// Sends a batch of `group` to the active member, locally or by RPC.
    ///
    /// `iface` overrides the interface lookup (needed once an assignment has
    /// already been removed). `only_on` restricts the move to one member.
    ///
    /// # Errors
    ///
    /// Returns the plugin or RPC failure.
    pub async fn route_ips(
        &self,
        direction: IpDirection,
        group: &str,
        ips: &[String],
        iface: Option<&str>,
        only_on: Option<&str>,
    ) -> DaemonResult<()> {
        if ips.is_empty() {
            return Ok(());
        }
        let Some(active) = self.members.active() else {
            debug!(group, "no active member; floating IPs left alone");
            return Ok(());
        };
        if only_on.is_some_and(|hostname| hostname != active.hostname()) {
            return Ok(());
        }
        let iface = match iface {
            Some(iface) => iface.to_string(),
            None => match self.config.get().iface_for(active.hostname(), group) {
                Some(iface) => iface,
                None => {
                    debug!(group, member = active.hostname(), "group not assigned on the active member");
                    return Ok(());
                }
            },
        };
        if active.is_local() {
            return self.apply_local_ips(direction, &iface, ips).await;
        }
        let payload = IpBatchPayload {
            iface,
            ips: ips.to_vec(),
        };
        let request = match direction {
            IpDirection::Up => PeerRequest::BringUpIp(payload),
            IpDirection::Down => PeerRequest::BringDownIp(payload),
        };
        active.send(&request).await.map(drop)
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    fn period_for(&self, kind: TaskKind) -> Duration {
        let settings = self.config.settings();
        let millis = match kind {
            TaskKind::FailOverMonitor => settings.fos_interval,
            _ => settings.hcs_interval,
        };
        Duration::from_millis(millis)
    }

    fn spawn_loop(self: &Arc<Self>, kind: TaskKind) -> bool {
        let cluster = Arc::clone(self);
        self.tasks
            .spawn(kind, move |token| cluster.run_loop(kind, token))
    }

    fn run_loop(
        self: Arc<Self>,
        kind: TaskKind,
        token: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(self.period_for(kind)) => {}
                }
                if !self.config.cluster_check() {
                    break;
                }
                let Some(local) = self.members.local() else {
                    break;
                };
                let keep_going = match kind {
                    TaskKind::HealthChecks => true,
                    TaskKind::ConnectionMonitor | TaskKind::HeartbeatFanOut => {
                        local.status() == MemberStatus::Active
                    }
                    TaskKind::FailOverMonitor => local.status() == MemberStatus::Passive,
                };
                if !keep_going {
                    break;
                }
                match kind {
                    TaskKind::HealthChecks => {
                        self.health_checks_tick().await;
                    }
                    TaskKind::ConnectionMonitor => self.connection_monitor_tick().await,
                    TaskKind::HeartbeatFanOut => {
                        self.heartbeat_tick(&token);
                    }
                    TaskKind::FailOverMonitor => self.failover_tick(self.now()).await,
                }
            }
            debug!(task = kind.as_str(), "loop exited");
        })
    }

    /// Re-sums the local score from scratch.
    pub async fn health_checks_tick(&self) -> i32 {
        let mut score: i32 = 0;
        for plugin in self.plugins.health_checks() {
            match plugin.send().await {
                Ok(()) => {
                    let weight = i32::try_from(plugin.weight()).unwrap_or(i32::MAX);
                    score = score.saturating_add(weight);
                }
                Err(e) => debug!(plugin = plugin.name(), error = %e, "health check failed"),
            }
        }
        if let Some(local) = self.members.local() {
            local.set_score(score);
        }
        score
    }

    /// Active side: probe every peer, then check whether a better-scoring
    /// member should take over.
    pub async fn connection_monitor_tick(self: &Arc<Self>) {
        let others = self.members.others();
        let probes = others.iter().map(|member| async move {
            let state = match member.client() {
                Some(client) => client.probe().await.is_reachable(),
                None => false,
            };
            (member, state)
        });
        let mut changed = false;
        for (member, reachable) in join_all(probes).await {
            let next = if reachable {
                MemberStatus::Passive
            } else {
                MemberStatus::Unavailable
            };
            let prior = member.set_status(next);
            if prior != next {
                changed = true;
                info!(member = member.hostname(), from = %prior, to = %next, "member status changed");
            }
        }
        if changed {
            self.notify_status_change();
        }
        self.check_highest_score().await;
    }

    async fn check_highest_score(self: &Arc<Self>) {
        let Some(local) = self.members.local() else {
            return;
        };
        if local.status() != MemberStatus::Active {
            return;
        }
        let records = self.members.snapshot();
        let Some(winner) = election::highest_scorer(&records, local.hostname()) else {
            return;
        };
        let winner = winner.to_string();
        info!(member = %winner, "a member outscores this node; handing over");
        if let Err(e) = self.promote_member(&winner).await {
            warn!(member = %winner, error = %e, "hand-over to the higher scorer failed");
        }
    }

    /// Active side: sends one heart-beat to every idle passive member.
    /// Returns the handles of the spawned sends.
    pub fn heartbeat_tick(self: &Arc<Self>, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let snapshot = self.members.snapshot();
        let mut sends = Vec::new();
        for member in self.members.others() {
            if member.status() != MemberStatus::Passive || !member.try_begin_hc() {
                continue;
            }
            let cluster = Arc::clone(self);
            let token = token.child_token();
            let request = PeerRequest::HealthCheck(HealthCheckPayload {
                members: snapshot.clone(),
            });
            sends.push(tokio::spawn(async move {
                let started = Instant::now();
                let result = tokio::select! {
                    () = token.cancelled() => None,
                    result = member.send(&request) => Some(result),
                };
                member.end_hc();
                // Stepping down stops this loop, so it must run outside the select.
                if let Some(result) = result {
                    cluster.record_heartbeat(&member, started, result).await;
                }
            }));
        }
        sends
    }

    async fn record_heartbeat(
        self: &Arc<Self>,
        member: &Arc<Member>,
        started: Instant,
        result: DaemonResult<PeerReply>,
    ) {
        match result {
            Ok(reply) => {
                member.set_latency(Some(started.elapsed()));
                member.set_last_hc_response(Some(self.now()));
                if let Some(ReplyBody::HealthCheck { score }) = reply.body {
                    member.set_score(score);
                }
            }
            Err(DaemonError::Conflict(reason)) => {
                warn!(member = member.hostname(), %reason, "peer won split-brain arbitration; stepping down");
                if let Err(e) = self.make_local_passive().await {
                    error!(error = %e, "failed to step down");
                }
                self.members.set_exclusive_active(member.hostname());
            }
            Err(e) => {
                let prior = member.set_status(MemberStatus::Unavailable);
                if prior != MemberStatus::Unavailable {
                    warn!(member = member.hostname(), error = %e, "heart-beat failed; member unavailable");
                    self.notify_status_change();
                }
            }
        }
    }

    /// Passive side: reacts to heart-beat silence.
    pub async fn failover_tick(self: &Arc<Self>, now: u64) {
        let Some(local) = self.members.local() else {
            return;
        };
        let elapsed = elapsed_secs(local.last_hc_response(), now);

        if elapsed > 0 && elapsed % 4 == 0 {
            if let Some(active) = self.members.perceived_active() {
                if active.set_status(MemberStatus::Suspicious) != MemberStatus::Suspicious {
                    warn!(member = active.hostname(), elapsed, "active member is suspicious");
                    self.notify_status_change();
                }
            }
        }

        let fo_limit = self.config.settings().fo_limit;
        let limit = if self.first_failover_tick.swap(false, Ordering::SeqCst) {
            fo_limit.saturating_mul(2)
        } else {
            fo_limit
        };
        if elapsed < limit / 1000 {
            return;
        }

        info!(elapsed, "no heart-beat within the fail-over limit; electing");
        match self.members.next_active() {
            Some(winner) if !winner.is_local() => {
                debug!(member = winner.hostname(), "another member should take over; waiting");
                local.set_last_hc_response(Some(now));
            }
            _ => {
                let failed = self.members.perceived_active();
                if let Some(failed) = &failed {
                    failed.set_status(MemberStatus::Unavailable);
                }
                local.set_last_hc_response(None);
                if let Err(e) = self.promote_member(local.hostname()).await {
                    error!(error = %e, "self-promotion failed");
                    return;
                }
                self.relay_log(
                    LogLevel::Warn,
                    format!("{} took over after fail-over", local.hostname()),
                );
                if let Some(failed) = failed {
                    self.notify_failover(&failed);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Incoming heart-beats
    // -----------------------------------------------------------------------

    /// Handles a heart-beat from the active member.
    ///
    /// # Errors
    ///
    /// [`DaemonError::Conflict`] when this node is active too and wins
    /// arbitration; the sender steps down on that reply.
    pub async fn handle_health_check(
        self: &Arc<Self>,
        payload: HealthCheckPayload,
    ) -> DaemonResult<PeerReply> {
        let local = self.local_member()?;
        if local.status() == MemberStatus::Active {
            let auto_failback = self.config.settings().auto_failback;
            let winner = election::fail_over_winner(&payload.members, auto_failback);
            if winner == Some(local.hostname()) {
                local.set_last_hc_response(None);
                warn!("split brain: this node wins arbitration and stays active");
                return Err(DaemonError::Conflict(format!(
                    "{} is active and wins arbitration",
                    local.hostname()
                )));
            }
            warn!(winner = ?winner, "split brain: another member wins arbitration; stepping down");
            self.make_local_passive().await?;
        }
        self.members.apply_snapshot(&payload.members);
        local.set_last_hc_response(Some(self.now()));
        Ok(PeerReply::with_body(ReplyBody::HealthCheck {
            score: local.score(),
        }))
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    /// Sends `request` to every other member except `exclude`. Failures are
    /// logged and returned; they never stop the fan-out.
    pub async fn broadcast(
        &self,
        request: &PeerRequest,
        exclude: &[&str],
    ) -> Vec<(String, DaemonError)> {
        let targets: Vec<_> = self
            .members
            .others()
            .into_iter()
            .filter(|m| !exclude.contains(&m.hostname()))
            .collect();
        let sends = targets
            .iter()
            .map(|member| async move { (member.hostname().to_string(), member.send(request).await) });
        join_all(sends)
            .await
            .into_iter()
            .filter_map(|(hostname, result)| {
                result.err().map(|e| {
                    warn!(member = %hostname, rpc = request.name(), error = %e, "broadcast to member failed");
                    (hostname, e)
                })
            })
            .collect()
    }

    /// Logs locally and relays the line to every reachable member.
    pub fn relay_log(&self, level: LogLevel, message: String) {
        let node = self.config.local_hostname();
        let targets: Vec<_> = self
            .members
            .others()
            .into_iter()
            .filter(|m| m.status() != MemberStatus::Unavailable)
            .collect();
        if targets.is_empty() {
            return;
        }
        let request = PeerRequest::Logs(LogsPayload {
            node,
            level,
            message,
        });
        let token = self.tasks.child_token();
        tokio::spawn(async move {
            let sends = targets.iter().map(|m| m.send(&request));
            tokio::select! {
                () = token.cancelled() => {}
                results = join_all(sends) => {
                    for result in results {
                        if let Err(e) = result {
                            debug!(error = %e, "log relay failed");
                        }
                    }
                }
            }
        });
    }

    fn notify_status_change(&self) {
        if !self.plugins.has_general() {
            return;
        }
        let plugins = Arc::clone(&self.plugins);
        let records = self.members.snapshot();
        tokio::spawn(async move { plugins.notify_status_change(&records).await });
    }

    fn notify_failover(&self, member: &Member) {
        if !self.plugins.has_general() {
            return;
        }
        let plugins = Arc::clone(&self.plugins);
        let record = member.record();
        tokio::spawn(async move { plugins.notify_failover(&record).await });
    }
}
