//! Pure selection rules over member snapshots.

use pulseha_core::{MemberRecord, MemberStatus};

/// Decides who stays active when an active member receives a heart-beat from
/// another active member.
///
/// Two members: with `auto_failback`, the first record whose last-received
/// time is zero wins. Otherwise the winner is the neighbour of the first
/// record that is not unavailable: the one before it, or the one after it
/// when it is first.
///
/// Three or more members: the unique highest score among reachable records
/// wins; a tie falls back to the two-member rule.
#[must_use]
pub fn fail_over_winner(records: &[MemberRecord], auto_failback: bool) -> Option<&str> {
    if records.len() >= 3 {
        if let Some(winner) = unique_top_score(records) {
            return Some(winner);
        }
    }
    neighbour_rule(records, auto_failback)
}

fn neighbour_rule(records: &[MemberRecord], auto_failback: bool) -> Option<&str> {
    if auto_failback {
        if let Some(record) = records.iter().find(|r| r.last_received_millis().is_none()) {
            return Some(&record.hostname);
        }
    }
    let index = records
        .iter()
        .position(|r| r.status != MemberStatus::Unavailable)?;
    let neighbour = if index > 0 { index - 1 } else { index + 1 };
    records
        .get(neighbour)
        .or_else(|| records.get(index))
        .map(|r| r.hostname.as_str())
}

fn unique_top_score(records: &[MemberRecord]) -> Option<&str> {
    let mut reachable = records
        .iter()
        .filter(|r| r.status != MemberStatus::Unavailable);
    let first = reachable.next()?;
    let mut best = first;
    let mut tied = false;
    for record in reachable {
        if record.score > best.score {
            best = record;
            tied = false;
        } else if record.score == best.score {
            tied = true;
        }
    }
    (!tied).then_some(best.hostname.as_str())
}

/// Returns the member that should replace `active`: the first passive member
/// whose score is strictly higher than the active one's and than every other
/// candidate. Ties keep the current active.
#[must_use]
pub fn highest_scorer<'a>(records: &'a [MemberRecord], active: &str) -> Option<&'a str> {
    let current = records.iter().find(|r| r.hostname == active)?;
    let mut best: Option<&MemberRecord> = None;
    for record in records
        .iter()
        .filter(|r| r.hostname != active && r.status == MemberStatus::Passive)
    {
        if record.score > best.map_or(current.score, |b| b.score) {
            best = Some(record);
        }
    }
    best.map(|r| r.hostname.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulseha_core::{format_rfc1123, ZERO_TIMESTAMP};

    fn record(hostname: &str, status: MemberStatus, last: Option<u64>, score: i32) -> MemberRecord {
        MemberRecord {
            hostname: hostname.to_string(),
            status,
            latency: String::new(),
            last_received: format_rfc1123(last),
            score,
        }
    }

    use MemberStatus::{Active, Passive, Unavailable};

    #[test]
    fn two_members_pick_the_follower_of_the_first_reachable() {
        let records = [
            record("n1", Active, None, 0),
            record("n2", Active, Some(1_700_000_000_000), 0),
        ];
        assert_eq!(fail_over_winner(&records, false), Some("n2"));
    }

    #[test]
    fn two_members_pick_the_predecessor_when_first_is_unavailable() {
        let records = [
            record("n1", Unavailable, Some(1_700_000_000_000), 0),
            record("n2", Active, Some(1_700_000_000_000), 0),
        ];
        assert_eq!(fail_over_winner(&records, false), Some("n1"));
    }

    #[test]
    fn auto_failback_prefers_zero_last_received() {
        let records = [
            record("n1", Active, Some(1_700_000_000_000), 0),
            record("n2", Active, None, 0),
        ];
        assert_eq!(records[1].last_received, ZERO_TIMESTAMP);
        assert_eq!(fail_over_winner(&records, true), Some("n2"));
        assert_eq!(fail_over_winner(&records, false), Some("n2"));
    }

    #[test]
    fn single_reachable_record_wins_itself() {
        let records = [record("n1", Active, None, 0)];
        assert_eq!(fail_over_winner(&records, false), Some("n1"));
        let none: [MemberRecord; 0] = [];
        assert_eq!(fail_over_winner(&none, true), None);
    }

    #[test]
    fn larger_clusters_use_the_unique_top_score() {
        let records = [
            record("n1", Active, None, 1),
            record("n2", Active, None, 5),
            record("n3", Passive, None, 2),
        ];
        assert_eq!(fail_over_winner(&records, false), Some("n2"));

        let tied = [
            record("n1", Active, None, 5),
            record("n2", Active, None, 5),
            record("n3", Passive, None, 2),
        ];
        assert_eq!(fail_over_winner(&tied, false), Some("n2"));
    }

    #[test]
    fn highest_scorer_needs_a_strictly_greater_score() {
        let records = [
            record("n1", Active, None, 3),
            record("n2", Passive, None, 3),
            record("n3", Passive, None, 2),
        ];
        assert_eq!(highest_scorer(&records, "n1"), None);

        let records = [
            record("n1", Active, None, 3),
            record("n2", Passive, None, 4),
            record("n3", Passive, None, 6),
        ];
        assert_eq!(highest_scorer(&records, "n1"), Some("n3"));
    }

    #[test]
    fn highest_scorer_ignores_unreachable_members() {
        let records = [
            record("n1", Active, None, 0),
            record("n2", Unavailable, None, 9),
        ];
        assert_eq!(highest_scorer(&records, "n1"), None);
        assert_eq!(highest_scorer(&records, "missing"), None);
    }
}
