//! # Object Snapshot Records
//!
//! What the state-provider returns and what `state`, `create`, `update` and
//! `init_state` frames carry. Deliberately plain: no handles into the physics
//! engine, so a snapshot can be built on one thread and read on another.

use serde::{Deserialize, Serialize};

use crate::math::Vec2;

/// Identifier of a simulated object, assigned by the simulation.
pub type ObjectId = u64;

/// Snapshot of one rigid body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    /// Object identifier.
    pub id: ObjectId,
    /// World position.
    pub position: Vec2,
    /// Orientation in radians.
    pub angle: f64,
    /// Linear velocity.
    #[serde(default)]
    pub velocity: Vec2,
    /// Angular velocity in radians per second.
    #[serde(default)]
    pub angular_velocity: f64,
}

impl ObjectState {
    /// Creates a record for a body at rest.
    #[must_use]
    pub fn at_rest(id: ObjectId, position: impl Into<Vec2>, angle: f64) -> Self {
        Self {
            id,
            position: position.into(),
            angle,
            ..Self::default()
        }
    }

    /// Sets the linear and angular velocity.
    #[must_use]
    pub fn with_velocity(mut self, velocity: impl Into<Vec2>, angular_velocity: f64) -> Self {
        self.velocity = velocity.into();
        self.angular_velocity = angular_velocity;
        self
    }
}
