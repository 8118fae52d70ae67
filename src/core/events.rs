//! Typed callback lists for bot events.
//!
//! Listeners are registered once at startup and fanned out synchronously;
//! a panicking listener is a bug in the listener, not the engine.

use std::sync::{Arc, RwLock};

use crate::model::{CombinedPosition, ExitReason, Opportunity};

pub type OpportunityCallback = Arc<dyn Fn(&Opportunity) + Send + Sync>;
pub type PositionOpenedCallback = Arc<dyn Fn(&CombinedPosition) + Send + Sync>;
pub type PositionClosedCallback = Arc<dyn Fn(&CombinedPosition, ExitReason) + Send + Sync>;

/// Registry of event listeners, keyed by event type.
#[derive(Default)]
pub struct CallbackRegistry {
    on_opportunity: RwLock<Vec<OpportunityCallback>>,
    on_position_opened: RwLock<Vec<PositionOpenedCallback>>,
    on_position_closed: RwLock<Vec<PositionClosedCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_opportunity(&self, callback: OpportunityCallback) {
        self.on_opportunity
            .write()
            .expect("callback lock poisoned")
            .push(callback);
    }

    pub fn add_position_opened(&self, callback: PositionOpenedCallback) {
        self.on_position_opened
            .write()
            .expect("callback lock poisoned")
            .push(callback);
    }

    pub fn add_position_closed(&self, callback: PositionClosedCallback) {
        self.on_position_closed
            .write()
            .expect("callback lock poisoned")
            .push(callback);
    }

    pub fn emit_opportunity(&self, opportunity: &Opportunity) {
        for cb in self
            .on_opportunity
            .read()
            .expect("callback lock poisoned")
            .iter()
        {
            cb(opportunity);
        }
    }

    pub fn emit_position_opened(&self, position: &CombinedPosition) {
        for cb in self
            .on_position_opened
            .read()
            .expect("callback lock poisoned")
            .iter()
        {
            cb(position);
        }
    }

    pub fn emit_position_closed(&self, position: &CombinedPosition, reason: ExitReason) {
        for cb in self
            .on_position_closed
            .read()
            .expect("callback lock poisoned")
            .iter()
        {
            cb(position, reason);
        }
    }
}
