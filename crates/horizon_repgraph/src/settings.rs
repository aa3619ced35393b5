//! Per-class replication settings and routing.
//!
//! Settings are looked up by class name when an object registers and copied
//! into its global info, so later edits to the registry only affect objects
//! registered afterwards.

use crate::config::ClassDefaultsConfig;
use crate::types::NodeKey;
use std::collections::HashMap;

/// How a spatialized class behaves inside the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpatialMode {
    /// Never moves; placed in cells once.
    Static,
    /// Moves; cell rectangle is refreshed every Prepare.
    Dynamic,
    /// Static while dormant, dynamic while awake.
    Dormancy,
}

/// Where a newly registered object is placed in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingPolicy {
    /// Tracked, but no node offers it.
    NotRouted,
    /// Offered to every connection every tick.
    RelevantAllConnections,
    /// Offered only to the connection that owns it.
    RelevantOwnerConnection,
    /// Placed in the spatial grid.
    Spatialize(SpatialMode),
    /// Placed in a specific global node added by the application.
    Node(NodeKey),
}

impl RoutingPolicy {
    pub fn is_spatialized(&self) -> bool {
        matches!(self, RoutingPolicy::Spatialize(_))
    }
}

/// Replication tuning shared by every object of a class.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassReplicationSettings {
    pub distance_priority_scale: f32,
    pub starvation_priority_scale: f32,
    /// Constant added to every score of the class
    pub priority_bias: f32,
    /// Frames a channel stays open after the object stops being relevant, 0 never closes
    pub channel_close_timeout_frames: u32,
    pub cull_distance: f64,
    pub replication_period_frames: u32,
    /// The world can build shared fast-path payloads for this class
    pub fast_shared: bool,
    pub routing: RoutingPolicy,
}

impl ClassReplicationSettings {
    pub fn from_defaults(defaults: &ClassDefaultsConfig) -> Self {
        Self {
            distance_priority_scale: defaults.distance_priority_scale,
            starvation_priority_scale: defaults.starvation_priority_scale,
            priority_bias: 0.0,
            channel_close_timeout_frames: defaults.channel_close_timeout_frames,
            cull_distance: defaults.cull_distance,
            replication_period_frames: defaults.replication_period_frames.max(1),
            fast_shared: false,
            routing: RoutingPolicy::Spatialize(SpatialMode::Dormancy),
        }
    }

    pub fn cull_distance_squared(&self) -> f64 {
        self.cull_distance * self.cull_distance
    }

    pub fn with_routing(mut self, routing: RoutingPolicy) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_cull_distance(mut self, cull_distance: f64) -> Self {
        self.cull_distance = cull_distance;
        self
    }

    pub fn with_period(mut self, frames: u32) -> Self {
        self.replication_period_frames = frames.max(1);
        self
    }

    pub fn with_fast_shared(mut self, enabled: bool) -> Self {
        self.fast_shared = enabled;
        self
    }
}

impl Default for ClassReplicationSettings {
    fn default() -> Self {
        Self::from_defaults(&ClassDefaultsConfig::default())
    }
}

/// Class name to settings lookup with a fallback entry.
#[derive(Debug, Clone)]
pub struct ClassSettingsRegistry {
    classes: HashMap<String, ClassReplicationSettings>,
    fallback: ClassReplicationSettings,
}

impl ClassSettingsRegistry {
    pub fn new(defaults: &ClassDefaultsConfig) -> Self {
        Self {
            classes: HashMap::new(),
            fallback: ClassReplicationSettings::from_defaults(defaults),
        }
    }

    /// A settings template seeded from the configured defaults.
    pub fn template(&self) -> ClassReplicationSettings {
        self.fallback.clone()
    }

    pub fn set(&mut self, class: impl Into<String>, settings: ClassReplicationSettings) {
        self.classes.insert(class.into(), settings);
    }

    pub fn set_fallback(&mut self, settings: ClassReplicationSettings) {
        self.fallback = settings;
    }

    pub fn contains(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    /// Settings for `class`, or the fallback when the class was never configured.
    pub fn get(&self, class: &str) -> &ClassReplicationSettings {
        self.classes.get(class).unwrap_or(&self.fallback)
    }

    pub fn classes_with_routing(&self, routing: RoutingPolicy) -> impl Iterator<Item = &str> {
        self.classes
            .iter()
            .filter(move |(_, settings)| settings.routing == routing)
            .map(|(name, _)| name.as_str())
    }
}

impl Default for ClassSettingsRegistry {
    fn default() -> Self {
        Self::new(&ClassDefaultsConfig::default())
    }
}
