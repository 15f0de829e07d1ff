use std::sync::{Arc, Mutex, PoisonError};

use crate::render::{DrawingSurface, SliceBudget};
use crate::transport::operator_list::OperatorList;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SurfaceEvent {
    Begin,
    /// operators `[from, to)` were executed in a single call
    Executed { from: usize, to: usize },
    End,
}

/// A [DrawingSurface] that records what it is asked to do. Clones share the record, so a test
///  can keep a clone after handing the surface to a [crate::render::SurfaceSlot].
#[derive(Clone, Default)]
pub struct RecordingSurface {
    events: Arc<Mutex<Vec<SurfaceEvent>>>,
}

impl RecordingSurface {
    pub fn new() -> RecordingSurface {
        Default::default()
    }

    pub fn events(&self) -> Vec<SurfaceEvent> {
        self.events.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn executed_operators(&self) -> usize {
        self.events().iter()
            .map(|e| match e {
                SurfaceEvent::Executed { from, to } => to - from,
                _ => 0,
            })
            .sum()
    }

    fn record(&self, event: SurfaceEvent) {
        self.events.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl DrawingSurface for RecordingSurface {
    fn begin_drawing(&mut self) {
        self.record(SurfaceEvent::Begin);
    }

    fn execute_operator_list(&mut self, list: &OperatorList, from: usize, budget: &mut SliceBudget) -> usize {
        let mut next = from;
        while next < list.len() {
            next += 1;
            if !budget.tick() {
                break;
            }
        }
        if next > from {
            self.record(SurfaceEvent::Executed { from, to: next });
        }
        next
    }

    fn end_drawing(&mut self) {
        self.record(SurfaceEvent::End);
    }
}
