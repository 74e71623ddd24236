//! Ordered set of pending timers.
//!
//! Keys order by expiry first and by a per-reactor sequence number second, so
//! two timers sharing an expiry still have a strict total order and iteration
//! visits them in registration order.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::time::TimeVal;

use super::source::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    pub expire: TimeVal,
    pub seq: u64,
}

#[derive(Default)]
pub(crate) struct TimerTree {
    map: BTreeMap<TimerKey, Rc<Source>>,
}

impl TimerTree {
    pub(crate) fn insert(&mut self, key: TimerKey, source: Rc<Source>) {
        let previous = self.map.insert(key, source);
        debug_assert!(previous.is_none(), "timer key collision");
    }

    pub(crate) fn remove(&mut self, key: &TimerKey) -> Option<Rc<Source>> {
        self.map.remove(key)
    }

    pub(crate) fn first_key(&self) -> Option<TimerKey> {
        self.map.first_key_value().map(|(k, _)| *k)
    }

    pub(crate) fn pop_first(&mut self) -> Option<(TimerKey, Rc<Source>)> {
        self.map.pop_first()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn sources(&self) -> Vec<Rc<Source>> {
        self.map.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}
