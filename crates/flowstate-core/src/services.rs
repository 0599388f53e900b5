// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node services handed through to flow logic.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::checkpoint::CheckpointStore;
use crate::manager::FlowRunId;
use crate::message::PeerAddress;
use crate::messaging::MessagingService;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything a node exposes to the flows it runs.
#[derive(Clone)]
pub struct ServiceHub {
    /// Wall-clock time.
    pub clock: Arc<dyn Clock>,
    /// Checkpoint storage.
    pub storage: Arc<dyn CheckpointStore>,
    /// Network endpoint of this node.
    pub network: Arc<dyn MessagingService>,
    /// This node's address.
    pub my_address: PeerAddress,
}

impl ServiceHub {
    /// Build a hub using the system clock; the address is taken from `network`.
    pub fn new(storage: Arc<dyn CheckpointStore>, network: Arc<dyn MessagingService>) -> Self {
        let my_address = network.my_address();
        Self {
            clock: Arc::new(SystemClock),
            storage,
            network,
            my_address,
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Per-step view of the node, given to [`FlowLogic::step`](crate::flow::FlowLogic::step).
pub struct FlowContext<'a> {
    run_id: FlowRunId,
    logger_name: &'a str,
    services: &'a ServiceHub,
}

impl<'a> FlowContext<'a> {
    pub(crate) fn new(run_id: FlowRunId, logger_name: &'a str, services: &'a ServiceHub) -> Self {
        Self {
            run_id,
            logger_name,
            services,
        }
    }

    /// Run id of the flow being stepped.
    pub fn run_id(&self) -> FlowRunId {
        self.run_id
    }

    /// Name the flow logs under.
    pub fn logger_name(&self) -> &str {
        self.logger_name
    }

    /// Node services.
    pub fn services(&self) -> &ServiceHub {
        self.services
    }

    /// Current time from the node clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    /// This node's address.
    pub fn my_address(&self) -> &PeerAddress {
        &self.services.my_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now(), start + Duration::seconds(30));
    }
}
