//! Sweep coordination: last-sweep-wins by request order.
//!
//! Every sweep request for a `(user, timeframe)` slot gets a [`Ticket`]
//! ordered by `(requested_at, seq)`.  Issuing a newer ticket aborts the task
//! running for the previous one, and [`SweepBoard::commit`] only accepts the
//! newest ticket issued for the slot, so a slow, older sweep can never
//! overwrite a newer result even if it escapes the abort.
//!
//! Committed results are published on a per-slot `watch` channel that cold
//! queries wait on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use reverie_types::{Pattern, PatternType, Prediction, Timeframe};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket {
    pub requested_at: DateTime<Utc>,
    pub seq: u64,
}

/// Output of one detection + prediction sweep.
#[derive(Debug, Clone)]
pub struct SweepResult {
    pub user_id: String,
    pub timeframe: Timeframe,
    pub ticket: Ticket,
    pub window_start: Option<DateTime<Utc>>,
    pub patterns: HashMap<PatternType, Vec<Pattern>>,
    pub predictions: Vec<Prediction>,
    pub completed_at: DateTime<Utc>,
}

impl SweepResult {
    pub fn pattern_count(&self) -> usize {
        self.patterns.values().map(Vec::len).sum()
    }

    pub fn patterns_of(&self, pattern_type: PatternType) -> &[Pattern] {
        self.patterns.get(&pattern_type).map(Vec::as_slice).unwrap_or(&[])
    }
}

type SlotKey = (String, Timeframe);

struct Slot {
    latest: Ticket,
    running: Option<(Ticket, AbortHandle)>,
    result: watch::Sender<Option<Arc<SweepResult>>>,
}

impl Slot {
    fn new(ticket: Ticket) -> Self {
        let (result, _) = watch::channel(None);
        Self {
            latest: ticket,
            running: None,
            result,
        }
    }
}

#[derive(Default)]
pub struct SweepBoard {
    seq: AtomicU64,
    slots: Mutex<HashMap<SlotKey, Slot>>,
}

impl SweepBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SlotKey, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue a ticket for a sweep requested at `requested_at`.
    ///
    /// Returns the ticket and whether it is now the newest for the slot.  A
    /// newest ticket aborts the sweep currently running for the slot.
    pub fn issue(&self, user_id: &str, timeframe: Timeframe, requested_at: DateTime<Utc>) -> (Ticket, bool) {
        let ticket = Ticket {
            requested_at,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };
        let mut slots = self.slots();
        let slot = slots
            .entry((user_id.to_string(), timeframe))
            .or_insert_with(|| Slot::new(ticket));
        if ticket < slot.latest {
            return (ticket, false);
        }
        slot.latest = ticket;
        if let Some((old, handle)) = slot.running.take() {
            if old != ticket {
                debug!(user_id, %timeframe, old_seq = old.seq, new_seq = ticket.seq, "superseding running sweep");
                handle.abort();
            }
        }
        (ticket, true)
    }

    /// Record the task running `ticket` so a newer request can abort it.
    /// Aborts the task immediately if the ticket is already stale.
    pub fn attach(&self, user_id: &str, timeframe: Timeframe, ticket: Ticket, handle: AbortHandle) {
        let mut slots = self.slots();
        match slots.get_mut(&(user_id.to_string(), timeframe)) {
            Some(slot) if slot.latest == ticket => slot.running = Some((ticket, handle)),
            _ => handle.abort(),
        }
    }

    /// `true` when a sweep for the slot is running.
    pub fn in_flight(&self, user_id: &str, timeframe: Timeframe) -> bool {
        self.slots()
            .get(&(user_id.to_string(), timeframe))
            .and_then(|s| s.running.as_ref())
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Store `result` if its ticket is still the newest for the slot.
    pub fn commit(&self, result: SweepResult) -> bool {
        let key = (result.user_id.clone(), result.timeframe);
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&key) else {
            return false;
        };
        if result.ticket != slot.latest {
            debug!(
                user_id = %result.user_id,
                timeframe = %result.timeframe,
                stale_seq = result.ticket.seq,
                latest_seq = slot.latest.seq,
                "stale sweep result discarded"
            );
            return false;
        }
        slot.running = None;
        slot.result.send_replace(Some(Arc::new(result)));
        true
    }

    /// The committed result for the slot, if any.
    pub fn latest(&self, user_id: &str, timeframe: Timeframe) -> Option<Arc<SweepResult>> {
        self.slots()
            .get(&(user_id.to_string(), timeframe))
            .and_then(|s| s.result.borrow().clone())
    }

    /// Watch the slot's committed result.
    pub fn watch(&self, user_id: &str, timeframe: Timeframe) -> watch::Receiver<Option<Arc<SweepResult>>> {
        let mut slots = self.slots();
        let slot = slots.entry((user_id.to_string(), timeframe)).or_insert_with(|| {
            Slot::new(Ticket {
                requested_at: DateTime::<Utc>::MIN_UTC,
                seq: 0,
            })
        });
        slot.result.subscribe()
    }

    /// Slots with a committed result, for periodic refresh.
    pub fn committed_slots(&self) -> Vec<(String, Timeframe)> {
        self.slots()
            .iter()
            .filter(|(_, slot)| slot.result.borrow().is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn result(user: &str, ticket: Ticket) -> SweepResult {
        SweepResult {
            user_id: user.to_string(),
            timeframe: Timeframe::Week,
            ticket,
            window_start: None,
            patterns: HashMap::new(),
            predictions: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn tickets_order_by_request_time_then_sequence() {
        let board = SweepBoard::new();
        let now = Utc::now();
        let (a, _) = board.issue("u1", Timeframe::Week, now);
        let (b, _) = board.issue("u1", Timeframe::Week, now);
        assert!(a < b);
        let (late_but_older, newest) = board.issue("u1", Timeframe::Week, now - Duration::seconds(5));
        assert!(late_but_older < b);
        assert!(!newest);
    }

    #[test]
    fn only_the_newest_ticket_commits() {
        let board = SweepBoard::new();
        let now = Utc::now();
        let (first, _) = board.issue("u1", Timeframe::Week, now);
        let (second, _) = board.issue("u1", Timeframe::Week, now + Duration::milliseconds(1));

        assert!(board.commit(result("u1", second)));
        assert!(!board.commit(result("u1", first)));
        assert_eq!(board.latest("u1", Timeframe::Week).unwrap().ticket, second);
    }

    #[test]
    fn slots_are_independent() {
        let board = SweepBoard::new();
        let now = Utc::now();
        let (a, _) = board.issue("u1", Timeframe::Week, now);
        let (_, _) = board.issue("u2", Timeframe::Week, now);
        assert!(board.commit(result("u1", a)));
        assert!(board.latest("u2", Timeframe::Week).is_none());
        assert!(board.latest("u1", Timeframe::Month).is_none());
        assert_eq!(board.committed_slots(), vec![("u1".to_string(), Timeframe::Week)]);
    }

    #[tokio::test]
    async fn newer_request_aborts_running_sweep() {
        let board = SweepBoard::new();
        let now = Utc::now();
        let (first, _) = board.issue("u1", Timeframe::Week, now);
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        });
        board.attach("u1", Timeframe::Week, first, task.abort_handle());
        assert!(board.in_flight("u1", Timeframe::Week));

        board.issue("u1", Timeframe::Week, now + Duration::milliseconds(1));
        let err = task.await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(!board.in_flight("u1", Timeframe::Week));
    }

    #[tokio::test]
    async fn watchers_see_committed_result() {
        let board = SweepBoard::new();
        let mut rx = board.watch("u1", Timeframe::Week);
        let (ticket, newest) = board.issue("u1", Timeframe::Week, Utc::now());
        assert!(newest);
        assert!(board.commit(result("u1", ticket)));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().ticket, ticket);
    }
}
