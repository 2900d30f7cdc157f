//! Acknowledged delivery
//!
//! The device confirms a field update or query by sending back a four-field
//! update with the same (scene, output, hash). An [`AckSlot`] holds the one
//! delivery currently waiting for that reply together with its deadline; the
//! engine checks the deadline on every wake-up and resends or gives up.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::protocol::{Outbound, WireUpdate, SCENE_HASH};

/// Exclusion class: each class has its own acknowledgement slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckClass {
    /// Field updates and resync queries, strictly one at a time
    Field,
    /// Scene select / scene query, newest wins
    Scene,
}

/// A message that wants an acknowledgement, with its attempt count
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: Outbound,
    pub attempts: u8,
}

impl Delivery {
    pub fn new(message: Outbound) -> Self {
        Self {
            message,
            attempts: 0,
        }
    }

    pub fn class(&self) -> AckClass {
        match self.message {
            Outbound::SceneSelect { .. } | Outbound::SceneQuery => AckClass::Scene,
            _ => AckClass::Field,
        }
    }

    /// Whether `reply` acknowledges this delivery
    pub fn is_acknowledged_by(&self, reply: &WireUpdate) -> bool {
        match self.message {
            Outbound::Update {
                scene,
                output,
                hash,
                ..
            }
            | Outbound::Query {
                scene,
                output,
                hash,
            } => {
                reply.scene == scene as i64 && reply.output == output as i64 && reply.hash == hash
            }
            // The device answers with its own scene/output prefix
            Outbound::SceneSelect { scene } => {
                reply.hash == SCENE_HASH && reply.value == scene as f64
            }
            Outbound::SceneQuery => reply.hash == SCENE_HASH,
            Outbound::VersionProbe | Outbound::DiskMode => false,
        }
    }

    /// True when both address the same field with the same kind of message
    fn same_target(&self, other: &Delivery) -> bool {
        match (&self.message, &other.message) {
            (
                Outbound::Update {
                    scene: s1,
                    output: o1,
                    hash: h1,
                    ..
                },
                Outbound::Update {
                    scene: s2,
                    output: o2,
                    hash: h2,
                    ..
                },
            )
            | (
                Outbound::Query {
                    scene: s1,
                    output: o1,
                    hash: h1,
                },
                Outbound::Query {
                    scene: s2,
                    output: o2,
                    hash: h2,
                },
            ) => s1 == s2 && o1 == o2 && h1 == h2,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    delivery: Delivery,
    deadline: Instant,
}

/// Outcome of checking a slot's deadline
#[derive(Debug, Clone, PartialEq)]
pub enum Expiry {
    /// Nothing in flight or deadline not reached
    Pending,
    /// Deadline passed with attempts left; resend this message
    Retry(Outbound),
    /// Deadline passed on the final attempt
    Abandoned(Delivery),
}

/// Holds at most one delivery awaiting acknowledgement
#[derive(Debug, Clone, Default)]
pub struct AckSlot {
    in_flight: Option<InFlight>,
}

impl AckSlot {
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|f| f.deadline)
    }

    pub fn current(&self) -> Option<&Delivery> {
        self.in_flight.as_ref().map(|f| &f.delivery)
    }

    /// Occupy the slot with a first attempt; returns the message to send
    ///
    /// Any delivery already in the slot is returned as superseded.
    pub fn start(
        &mut self,
        mut delivery: Delivery,
        now: Instant,
        timeout: Duration,
    ) -> (Outbound, Option<Delivery>) {
        delivery.attempts += 1;
        let message = delivery.message.clone();
        let superseded = self
            .in_flight
            .replace(InFlight {
                delivery,
                deadline: now + timeout,
            })
            .map(|f| f.delivery);
        (message, superseded)
    }

    /// Free the slot if `reply` acknowledges the waiting delivery
    pub fn resolve(&mut self, reply: &WireUpdate) -> Option<Delivery> {
        if self.current()?.is_acknowledged_by(reply) {
            self.in_flight.take().map(|f| f.delivery)
        } else {
            None
        }
    }

    /// Check the deadline, arming a retry when attempts remain
    pub fn expire(&mut self, now: Instant, timeout: Duration, max_attempts: u8) -> Expiry {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return Expiry::Pending;
        };
        if now < in_flight.deadline {
            return Expiry::Pending;
        }

        if in_flight.delivery.attempts < max_attempts {
            in_flight.delivery.attempts += 1;
            in_flight.deadline = now + timeout;
            Expiry::Retry(in_flight.delivery.message.clone())
        } else {
            match self.in_flight.take() {
                Some(f) => Expiry::Abandoned(f.delivery),
                None => Expiry::Pending,
            }
        }
    }

    /// Drop whatever is waiting
    pub fn cancel(&mut self) -> Option<Delivery> {
        self.in_flight.take().map(|f| f.delivery)
    }
}

/// FIFO of field-class deliveries waiting for the slot
#[derive(Debug, Clone, Default)]
pub struct DeliveryQueue {
    items: VecDeque<Delivery>,
}

impl DeliveryQueue {
    /// Append, or overwrite a queued delivery for the same target in place
    pub fn push(&mut self, delivery: Delivery) {
        match self.items.iter_mut().find(|d| d.same_target(&delivery)) {
            Some(existing) => existing.message = delivery.message,
            None => self.items.push_back(delivery),
        }
    }

    pub fn pop(&mut self) -> Option<Delivery> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
