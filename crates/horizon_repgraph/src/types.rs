//! Core types shared across the replication graph.
//!
//! Handles for objects, connections and nodes are slot-map keys issued by the
//! graph. The application identifies its own objects with [`NetObjectId`] and
//! never has to hold on to an [`ObjectHandle`] unless it wants the fast path.

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::ops::{Add, Mul, Sub};

new_key_type! {
    /// Graph-issued handle for a registered replicable object.
    pub struct ObjectHandle;
    /// Graph-issued handle for a client connection.
    pub struct ConnectionHandle;
    /// Handle to an interest node stored in the graph's node arena.
    pub struct NodeKey;
}

/// Application-level identity of a replicable object.
///
/// Stable for the lifetime of the object; the graph maps it onto an
/// internal [`ObjectHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetObjectId(pub u64);

impl std::fmt::Display for NetObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Transport-issued identifier for an open (object, connection) channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

/// Name of a streamed region (a sub-level the client may or may not have loaded).
pub type RegionName = String;

/// Frame counter type used throughout the scheduler.
pub type Frame = u32;

/// 3D vector used for world locations and view directions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn dot(&self, other: Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn length_squared(&self) -> f64 {
        self.dot(*self)
    }

    pub fn length(&self) -> f64 {
        self.length_squared().sqrt()
    }

    pub fn distance_squared(&self, other: Vec3) -> f64 {
        (*self - other).length_squared()
    }

    pub fn distance(&self, other: Vec3) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// Squared distance ignoring the vertical axis.
    pub fn distance_squared_2d(&self, other: Vec3) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    /// Returns the unit vector in the same direction, or zero for a
    /// degenerate input.
    pub fn normalized(&self) -> Vec3 {
        let len = self.length();
        if len <= f64::EPSILON {
            Vec3::zero()
        } else {
            Vec3::new(self.x / len, self.y / len, self.z / len)
        }
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;
    fn mul(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// A connection's spatial reference point.
///
/// A connection owns at least one viewer; split-screen children add more.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetViewer {
    /// Where the viewer is looking from.
    pub location: Vec3,
    /// Unit facing direction.
    pub direction: Vec3,
    /// The object the client controls, if any.
    pub viewer: Option<NetObjectId>,
    /// The object the client's camera is attached to, if any.
    pub view_target: Option<NetObjectId>,
}

impl NetViewer {
    pub fn at(location: Vec3) -> Self {
        Self {
            location,
            direction: Vec3::new(1.0, 0.0, 0.0),
            viewer: None,
            view_target: None,
        }
    }

    pub fn facing(mut self, direction: Vec3) -> Self {
        self.direction = direction.normalized();
        self
    }

    pub fn with_viewer(mut self, viewer: NetObjectId) -> Self {
        self.viewer = Some(viewer);
        self
    }

    pub fn with_view_target(mut self, target: NetObjectId) -> Self {
        self.view_target = Some(target);
        self
    }

    /// Returns true if `object` is this viewer's pawn or camera target.
    pub fn is_viewing(&self, object: NetObjectId) -> bool {
        self.viewer == Some(object) || self.view_target == Some(object)
    }
}

/// Dormancy intent declared by the simulation for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum NetDormancy {
    /// Never goes dormant.
    Never,
    /// Can go dormant but currently awake.
    #[default]
    Awake,
    /// Dormant on every connection.
    DormantAll,
    /// Dormant on a subset of connections.
    DormantPartial,
    /// Placed in the level dormant; not replicated until first flushed.
    Initial,
}

impl NetDormancy {
    /// Everything past `Awake` counts as wanting to be dormant.
    pub fn wants_dormant(self) -> bool {
        self > NetDormancy::Awake
    }
}

/// Candidate lane an interest node can feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    /// Scored and sorted; full channel replication.
    Default,
    /// Round-robin shared-buffer updates.
    FastShared,
}

/// Reason a channel is closed by the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    /// The object was torn off and has had its final replication.
    TearOff,
    /// No longer relevant to the connection.
    Relevancy,
    /// The object was destroyed.
    Destroyed,
}
