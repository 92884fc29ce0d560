//! In-memory bookkeeping for sent/received probe messages: a flat list of
//! records plus a "lowest unreconciled" index that slides forward so later
//! scans don't re-walk a settled prefix.

use std::time::Duration;

use chrono::{DateTime, Local};

pub struct MsgRecord {
    pub msg: String,
    pub time_send: DateTime<Local>,
    pub time_recv: Option<DateTime<Local>>,
    pub time_elapsed: Option<Duration>,
}

/// Tracks every probe message sent this run. Shared between the send loop
/// and the Q_OUT consume task behind a single async mutex — the two sides
/// never need to be lock-free since neither is on a hot path.
#[derive(Default)]
pub struct Tracker {
    records: Vec<MsgRecord>,
    lowest_unreconciled: usize,
}

impl Tracker {
    pub fn record_sent(&mut self, msg: String, time_send: DateTime<Local>) {
        self.records.push(MsgRecord {
            msg,
            time_send,
            time_recv: None,
            time_elapsed: None,
        });
    }

    /// Scans from `lowest_unreconciled` forward for an outstanding record
    /// whose body matches, and marks it received. Returns `true` if
    /// recognized.
    pub fn reconcile(&mut self, body: &str, time_recv: DateTime<Local>) -> bool {
        for m in self.records.iter_mut().skip(self.lowest_unreconciled) {
            if m.msg == body && m.time_recv.is_none() {
                m.time_recv = Some(time_recv);
                m.time_elapsed = Some(
                    (time_recv - m.time_send)
                        .to_std()
                        .unwrap_or(Duration::ZERO),
                );
                return true;
            }
        }
        false
    }

    /// Count of reconciled messages so far. Advances `lowest_unreconciled`
    /// past any leading run that has settled, as a side effect.
    pub fn reconciled_count(&mut self) -> usize {
        let mut reconciled = self.lowest_unreconciled;
        let mut found_unreconciled = false;
        for x in self.lowest_unreconciled..self.records.len() {
            if self.records[x].time_elapsed.is_none() {
                found_unreconciled = true;
            } else {
                reconciled += 1;
                if self.lowest_unreconciled == x && !found_unreconciled {
                    self.lowest_unreconciled = x + 1;
                }
            }
        }
        reconciled
    }

    pub fn total(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[MsgRecord] {
        &self.records
    }

    /// Bodies of messages never received, for the `--report` file.
    pub fn unreconciled_bodies(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|m| m.time_elapsed.is_none())
            .map(|m| m.msg.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn reconcile_marks_matching_record_and_is_idempotent() {
        let mut t = Tracker::default();
        let sent_at = Local::now();
        t.record_sent("msg #1".into(), sent_at);

        let recv_at = sent_at + ChronoDuration::milliseconds(50);
        assert!(t.reconcile("msg #1", recv_at));
        // A second echo of the same body finds no further outstanding record.
        assert!(!t.reconcile("msg #1", recv_at));
        assert!(!t.reconcile("unknown body", recv_at));
    }

    #[test]
    fn reconciled_count_advances_lowest_unreconciled_over_settled_prefix() {
        let mut t = Tracker::default();
        let now = Local::now();
        t.record_sent("a".into(), now);
        t.record_sent("b".into(), now);
        t.record_sent("c".into(), now);

        t.reconcile("a", now);
        t.reconcile("c", now);
        // "b" is still outstanding, so only "a" counts toward the settled prefix.
        assert_eq!(t.reconciled_count(), 2);

        t.reconcile("b", now);
        assert_eq!(t.reconciled_count(), 3);
        assert_eq!(t.unreconciled_bodies().len(), 0);
    }

    #[test]
    fn unreconciled_bodies_lists_only_never_received() {
        let mut t = Tracker::default();
        let now = Local::now();
        t.record_sent("a".into(), now);
        t.record_sent("b".into(), now);
        t.reconcile("a", now);

        assert_eq!(t.unreconciled_bodies(), vec!["b".to_string()]);
    }
}
