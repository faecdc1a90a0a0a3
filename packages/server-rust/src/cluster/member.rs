//! Runtime state of one cluster member.

use std::time::Duration;

use parking_lot::Mutex;
use pulseha_core::messages::{PeerReply, PeerRequest};
use pulseha_core::{format_rfc1123, MemberRecord, MemberStatus};

use crate::error::{DaemonError, DaemonResult};
use crate::network::PeerClient;

/// Fields guarded by the member's own lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberState {
    pub status: MemberStatus,
    /// Milliseconds since the epoch; `None` is the zero timestamp.
    pub last_hc_response: Option<u64>,
    pub latency: Option<Duration>,
    pub score: i32,
    /// A heart-beat to this member is in flight.
    pub hc_busy: bool,
}

#[derive(Debug)]
pub struct Member {
    hostname: String,
    local: bool,
    state: Mutex<MemberState>,
    client: Option<PeerClient>,
}

/// Renders a latency the way `status` shows it, e.g. `1.204ms`.
#[must_use]
pub fn format_latency(latency: Option<Duration>) -> String {
    latency.map_or_else(String::new, |d| {
        format!("{:.3}ms", d.as_secs_f64() * 1000.0)
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_latency(value: &str) -> Option<Duration> {
    let millis: f64 = value.trim().strip_suffix("ms")?.parse().ok()?;
    (millis.is_finite() && millis >= 0.0)
        .then(|| Duration::from_micros((millis * 1000.0).round() as u64))
}

impl Member {
    #[must_use]
    pub fn local(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            local: true,
            state: Mutex::new(MemberState::default()),
            client: None,
        }
    }

    /// A remote member; `client` is `None` when its endpoint does not parse.
    #[must_use]
    pub fn remote(hostname: impl Into<String>, client: Option<PeerClient>) -> Self {
        Self {
            hostname: hostname.into(),
            local: false,
            state: Mutex::new(MemberState::default()),
            client,
        }
    }

    /// Carries runtime state over from another member (used on rename).
    #[must_use]
    pub fn with_state(self, state: MemberState) -> Self {
        *self.state.lock() = MemberState {
            hc_busy: false,
            ..state
        };
        self
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.local
    }

    #[must_use]
    pub fn client(&self) -> Option<&PeerClient> {
        self.client.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> MemberState {
        self.state.lock().clone()
    }

    #[must_use]
    pub fn status(&self) -> MemberStatus {
        self.state.lock().status
    }

    /// Sets the status and returns the previous one.
    pub fn set_status(&self, status: MemberStatus) -> MemberStatus {
        std::mem::replace(&mut self.state.lock().status, status)
    }

    #[must_use]
    pub fn last_hc_response(&self) -> Option<u64> {
        self.state.lock().last_hc_response
    }

    pub fn set_last_hc_response(&self, at: Option<u64>) {
        self.state.lock().last_hc_response = at;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    #[must_use]
    pub fn score(&self) -> i32 {
        self.state.lock().score
    }

    /// Scores are never negative; lower values are clamped to zero.
    pub fn set_score(&self, score: i32) {
        self.state.lock().score = score.max(0);
    }

    /// Marks a heart-beat as in flight. Returns `false` if one already is.
    pub fn try_begin_hc(&self) -> bool {
        let mut state = self.state.lock();
        if state.hc_busy {
            false
        } else {
            state.hc_busy = true;
            true
        }
    }

    pub fn end_hc(&self) {
        self.state.lock().hc_busy = false;
    }

    /// This member's entry in a heart-beat snapshot.
    #[must_use]
    pub fn record(&self) -> MemberRecord {
        let state = self.state.lock();
        MemberRecord {
            hostname: self.hostname.clone(),
            status: state.status,
            latency: format_latency(state.latency),
            last_received: format_rfc1123(state.last_hc_response),
            score: state.score,
        }
    }

    /// Adopts what a heart-beat says about this member. The local member keeps
    /// its own status, last-received time and score.
    pub fn apply_record(&self, record: &MemberRecord) {
        let mut state = self.state.lock();
        state.latency = parse_latency(&record.latency);
        if self.local {
            return;
        }
        state.status = record.status;
        state.last_hc_response = record.last_received_millis();
        state.score = record.score.max(0);
    }

    /// Sends one RPC to this member.
    ///
    /// # Errors
    ///
    /// [`DaemonError::Internal`] when called on the local member,
    /// [`DaemonError::Unreachable`] when the member has no usable endpoint,
    /// otherwise whatever the request returns.
    pub async fn send(&self, request: &PeerRequest) -> DaemonResult<PeerReply> {
        if self.local {
            return Err(DaemonError::Internal(format!(
                "{} sent to the local member",
                request.name()
            )));
        }
        let client = self.client.as_ref().ok_or_else(|| {
            DaemonError::Unreachable(format!("{} has no valid endpoint", self.hostname))
        })?;
        client.request(request).await
    }

    pub async fn close(&self) {
        if let Some(client) = &self.client {
            client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulseha_core::ZERO_TIMESTAMP;

    #[test]
    fn fresh_member_is_unavailable_with_zero_timestamp() {
        let member = Member::local("node-1");
        let record = member.record();
        assert_eq!(record.status, MemberStatus::Unavailable);
        assert_eq!(record.last_received, ZERO_TIMESTAMP);
        assert_eq!(record.latency, "");
        assert_eq!(record.score, 0);
    }

    #[test]
    fn hc_busy_flag_admits_one_sender() {
        let member = Member::remote("node-2", None);
        assert!(member.try_begin_hc());
        assert!(!member.try_begin_hc());
        member.end_hc();
        assert!(member.try_begin_hc());
    }

    #[test]
    fn latency_renders_and_parses() {
        let text = format_latency(Some(Duration::from_micros(1_204)));
        assert_eq!(text, "1.204ms");
        assert_eq!(parse_latency(&text), Some(Duration::from_micros(1_204)));
        assert_eq!(parse_latency(""), None);
        assert_eq!(parse_latency("-1ms"), None);
    }

    #[test]
    fn applying_a_record_spares_local_fields() {
        let local = Member::local("node-1");
        local.set_status(MemberStatus::Passive);
        local.set_last_hc_response(Some(5_000));
        local.set_score(4);
        let remote = Member::remote("node-2", None);

        let record = MemberRecord {
            hostname: "x".to_string(),
            status: MemberStatus::Active,
            latency: "2.000ms".to_string(),
            last_received: "Tue, 14 Nov 2023 22:13:20 UTC".to_string(),
            score: 9,
        };
        local.apply_record(&record);
        remote.apply_record(&record);

        let state = local.state();
        assert_eq!(state.status, MemberStatus::Passive);
        assert_eq!(state.last_hc_response, Some(5_000));
        assert_eq!(state.score, 4);
        assert_eq!(state.latency, Some(Duration::from_millis(2)));

        let state = remote.state();
        assert_eq!(state.status, MemberStatus::Active);
        assert_eq!(state.last_hc_response, Some(1_700_000_000_000));
        assert_eq!(state.score, 9);
    }

    #[tokio::test]
    async fn sending_without_endpoint_is_unreachable() {
        let remote = Member::remote("node-2", None);
        let request = PeerRequest::Promote(pulseha_core::messages::MemberTargetPayload {
            member: "node-2".to_string(),
        });
        assert!(matches!(remote.send(&request).await, Err(DaemonError::Unreachable(_))));
        let local = Member::local("node-1");
        assert!(matches!(local.send(&request).await, Err(DaemonError::Internal(_))));
    }
}
