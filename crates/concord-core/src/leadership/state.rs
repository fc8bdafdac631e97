use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use concord_types::{NodeId, Versioned};

/// Authoritative lock state of one topic.
///
/// `term` increments each time a new holder is installed. Once a topic has
/// been contended its state stays in the map; an unlocked topic is the
/// tombstone `{holder: None, wait_queue: []}` carrying the last term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutexState {
    pub holder: Option<NodeId>,
    pub wait_queue: VecDeque<NodeId>,
    pub term: u64,
}

impl MutexState {
    pub fn is_locked(&self) -> bool {
        self.holder.is_some()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.holder.as_ref() == Some(node) || self.wait_queue.contains(node)
    }

    /// Holder first, then waiters in queue order.
    pub fn candidates(&self) -> Vec<NodeId> {
        self.holder.iter().chain(self.wait_queue.iter()).cloned().collect()
    }

    /// Grant the lock to `node` if free, otherwise queue it. Admitting a
    /// node already holding or waiting changes nothing.
    pub fn admit(mut self, node: &NodeId) -> Self {
        if self.contains(node) {
            return self;
        }
        if self.holder.is_none() {
            self.holder = Some(node.clone());
            self.term += 1;
        } else {
            self.wait_queue.push_back(node.clone());
        }
        self
    }

    /// Remove `node` as holder or waiter. Evicting the holder promotes the
    /// queue head under a new term.
    pub fn evict(mut self, node: &NodeId) -> Self {
        if self.holder.as_ref() == Some(node) {
            self.holder = self.wait_queue.pop_front();
            if self.holder.is_some() {
                self.term += 1;
            }
        } else {
            self.wait_queue.retain(|n| n != node);
        }
        self
    }
}

/// Cached view of a topic's leadership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leadership {
    pub topic: String,
    pub leader: Option<NodeId>,
    /// Holder first, then waiters.
    pub candidates: Vec<NodeId>,
    pub term: u64,
    /// Version of the map entry this view was taken from; 0 if the topic was
    /// never written.
    pub version: u64,
}

impl Leadership {
    pub fn from_state(topic: impl Into<String>, state: &Versioned<MutexState>) -> Self {
        Leadership {
            topic: topic.into(),
            leader: state.value.holder.clone(),
            candidates: state.value.candidates(),
            term: state.value.term,
            version: state.version,
        }
    }

    /// Position of this view in the topic's history.
    pub fn order(&self) -> (u64, u64) {
        (self.term, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadershipEventKind {
    LeaderElected,
    LeaderBooted,
    CandidatesChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipEvent {
    pub kind: LeadershipEventKind,
    pub leadership: Leadership,
}

impl LeadershipEvent {
    /// The event describing a transition of `topic`, if anyone can observe it.
    pub fn from_transition(topic: &str, old: &MutexState, new: &Versioned<MutexState>) -> Option<Self> {
        let new_state = &new.value;
        // A holder re-admitted under a new term counts as a fresh election.
        let kind = if new_state.holder != old.holder || (new_state.holder.is_some() && new_state.term != old.term) {
            match new_state.holder {
                Some(_) => LeadershipEventKind::LeaderElected,
                None => LeadershipEventKind::LeaderBooted,
            }
        } else if new_state.wait_queue != old.wait_queue {
            LeadershipEventKind::CandidatesChanged
        } else {
            return None;
        };
        Some(LeadershipEvent { kind, leadership: Leadership::from_state(topic, new) })
    }

    /// Whether this event should replace `cached`.
    ///
    /// Views are ordered by term, then by entry version within a term. Only a
    /// strictly newer view applies; anything else is stale or a duplicate.
    pub fn supersedes(&self, cached: Option<&Leadership>) -> bool {
        match cached {
            Some(cached) => self.leadership.order() > cached.order(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: &str) -> NodeId {
        NodeId::from(id)
    }

    #[test]
    fn admit_then_evict_holder_promotes_queue_head() {
        let state = MutexState::default().admit(&n("a"));
        assert_eq!(state.holder, Some(n("a")));
        assert_eq!(state.term, 1);

        let state = state.admit(&n("b")).admit(&n("c")).admit(&n("b")).admit(&n("a"));
        assert_eq!(state.candidates(), vec![n("a"), n("b"), n("c")]);
        assert_eq!(state.term, 1);

        let state = state.evict(&n("a"));
        assert_eq!(state.holder, Some(n("b")));
        assert_eq!(state.wait_queue, VecDeque::from([n("c")]));
        assert_eq!(state.term, 2);
    }

    #[test]
    fn evicting_last_holder_leaves_tombstone() {
        let state = MutexState::default().admit(&n("a")).evict(&n("a"));
        assert!(!state.is_locked());
        assert!(state.wait_queue.is_empty());
        assert_eq!(state.term, 1);

        // The next holder gets a fresh term.
        assert_eq!(state.admit(&n("b")).term, 2);
    }

    #[test]
    fn evicting_waiter_or_stranger() {
        let state = MutexState::default().admit(&n("a")).admit(&n("b"));
        assert_eq!(state.clone().evict(&n("zz")), state);
        let state = state.evict(&n("b"));
        assert_eq!(state.candidates(), vec![n("a")]);
        assert_eq!(state.term, 1);
    }

    fn at(state: &MutexState, version: u64) -> Versioned<MutexState> {
        Versioned::new(state.clone(), version)
    }

    #[test]
    fn transition_events() {
        let empty = MutexState::default();
        let held = empty.clone().admit(&n("a"));
        let queued = held.clone().admit(&n("b"));

        let elected = LeadershipEvent::from_transition("t", &empty, &at(&held, 1)).unwrap();
        assert_eq!(elected.kind, LeadershipEventKind::LeaderElected);
        assert_eq!(elected.leadership.leader, Some(n("a")));
        assert_eq!(elected.leadership.version, 1);

        let changed = LeadershipEvent::from_transition("t", &held, &at(&queued, 2)).unwrap();
        assert_eq!(changed.kind, LeadershipEventKind::CandidatesChanged);

        let booted = LeadershipEvent::from_transition("t", &held, &at(&held.clone().evict(&n("a")), 2)).unwrap();
        assert_eq!(booted.kind, LeadershipEventKind::LeaderBooted);
        assert_eq!(booted.leadership.term, 1);

        assert!(LeadershipEvent::from_transition("t", &held, &at(&held, 1)).is_none());

        let stepped_down = held.clone().evict(&n("a")).admit(&n("a"));
        let reelected = LeadershipEvent::from_transition("t", &held, &at(&stepped_down, 2)).unwrap();
        assert_eq!(reelected.kind, LeadershipEventKind::LeaderElected);
        assert_eq!(reelected.leadership.term, 2);
    }

    #[test]
    fn newer_term_or_version_wins() {
        let held = MutexState::default().admit(&n("a"));
        let cached = Leadership::from_state("t", &at(&held, 1));

        let duplicate = LeadershipEvent {
            kind: LeadershipEventKind::LeaderElected,
            leadership: cached.clone(),
        };
        assert!(duplicate.supersedes(None));
        assert!(!duplicate.supersedes(Some(&cached)));

        let stale_election = LeadershipEvent {
            kind: LeadershipEventKind::LeaderElected,
            leadership: Leadership { leader: Some(n("b")), ..cached.clone() },
        };
        assert!(!stale_election.supersedes(Some(&cached)));

        let boot = LeadershipEvent::from_transition("t", &held, &at(&held.clone().evict(&n("a")), 2)).unwrap();
        assert!(boot.supersedes(Some(&cached)));

        let promoted = held.clone().admit(&n("b")).evict(&n("a"));
        let election = LeadershipEvent::from_transition("t", &held, &at(&promoted, 3)).unwrap();
        assert!(election.supersedes(Some(&cached)));
        assert!(!boot.supersedes(Some(&election.leadership)));
    }

    #[test]
    fn same_term_events_delivered_out_of_order() {
        // a holds, b queues, b withdraws, a withdraws: all under term 1.
        let held = MutexState::default().admit(&n("a"));
        let queued = held.clone().admit(&n("b"));
        let alone = queued.clone().evict(&n("b"));
        let released = alone.clone().evict(&n("a"));

        let joined = LeadershipEvent::from_transition("t", &held, &at(&queued, 2)).unwrap();
        let left = LeadershipEvent::from_transition("t", &queued, &at(&alone, 3)).unwrap();
        let boot = LeadershipEvent::from_transition("t", &alone, &at(&released, 4)).unwrap();
        assert_eq!(left.kind, LeadershipEventKind::CandidatesChanged);
        assert_eq!(boot.kind, LeadershipEventKind::LeaderBooted);

        // The boot arrives first; the older candidate changes must not
        // bring the released holder back.
        assert!(!left.supersedes(Some(&boot.leadership)));
        assert!(!joined.supersedes(Some(&boot.leadership)));

        // A shorter, newer candidate list is not replaced by a longer, older one.
        assert!(!joined.supersedes(Some(&left.leadership)));
        assert!(left.supersedes(Some(&joined.leadership)));
    }
}
