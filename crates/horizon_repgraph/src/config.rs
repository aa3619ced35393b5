//! Replication graph configuration.
//!
//! Every section deserializes with defaults so a host config file only needs
//! to mention the values it overrides.

use serde::{Deserialize, Serialize};

/// Complete replication graph configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Tick-level switches and global constants
    pub general: GeneralConfig,
    /// Defaults applied to classes without explicit settings
    pub class_defaults: ClassDefaultsConfig,
    /// Scoring weights
    pub prioritization: PrioritizationConfig,
    /// Secondary, shared-buffer lane
    pub fast_shared: FastSharedConfig,
    /// Spatial grid
    pub grid: GridConfig,
    /// Round-robin bucket lists
    pub frequency_buckets: FrequencyBucketsConfig,
    /// Dormancy nodes
    pub dormancy: DormancyConfig,
    /// Distance/direction driven frequency node
    pub dynamic_frequency: DynamicFrequencyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Network ticks per second the host drives the graph at
    pub server_tick_rate: f64,
    /// Throttle for `tick`; 0 replicates on every call
    pub target_updates_per_second: f64,
    /// Skip replication entirely while set
    pub paused: bool,
    /// Check node membership uniqueness on add
    pub verification: bool,
    /// Ignore cull distance while prioritizing
    pub skip_distance_cull: bool,
    /// Viewer objects always sort first
    pub force_viewer_top_priority: bool,
    /// Frames added on top of each class's channel close timeout
    pub global_channel_close_timeout_frames: u32,
    /// Viewers farther than this keep destruction notices pending
    pub destruction_info_max_distance: f64,
    /// Budget for first-time introductions, 0 disables
    pub discovery_budget_bytes_per_sec: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            server_tick_rate: 30.0,
            target_updates_per_second: 0.0,
            paused: false,
            verification: false,
            skip_distance_cull: false,
            force_viewer_top_priority: false,
            global_channel_close_timeout_frames: 2,
            destruction_info_max_distance: 15_000.0,
            discovery_budget_bytes_per_sec: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassDefaultsConfig {
    pub distance_priority_scale: f32,
    pub starvation_priority_scale: f32,
    pub channel_close_timeout_frames: u32,
    pub cull_distance: f64,
    pub replication_period_frames: u32,
}

impl Default for ClassDefaultsConfig {
    fn default() -> Self {
        Self {
            distance_priority_scale: 1.0,
            starvation_priority_scale: 1.0,
            channel_close_timeout_frames: 4,
            cull_distance: 15_000.0,
            replication_period_frames: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrioritizationConfig {
    /// Distance at which the distance term saturates (squared when applied)
    pub max_distance_scaling: f64,
    /// Frames without replication at which the starvation term saturates
    pub max_frames_since_last_rep: u32,
    pub dormancy_bias: f32,
    pub force_update_bias: f32,
    pub viewer_bias: f32,
}

impl Default for PrioritizationConfig {
    fn default() -> Self {
        Self {
            max_distance_scaling: 10_000.0,
            max_frames_since_last_rep: 20,
            dormancy_bias: -1.5,
            force_update_bias: -1.0,
            viewer_bias: -10.0,
        }
    }
}

/// 10 KiB/s spread over 30 ticks, in bits.
pub const DEFAULT_LANE_BITS_PER_FRAME: i64 = 10 * 1024 * 8 / 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FastSharedConfig {
    pub enabled: bool,
    pub max_bits_per_frame: i64,
    /// Fraction of the cull distance inside which direction is ignored
    pub distance_requirement_pct: f64,
    pub list_skip_per_frame: u32,
}

impl Default for FastSharedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bits_per_frame: DEFAULT_LANE_BITS_PER_FRAME,
            distance_requirement_pct: 0.1,
            list_skip_per_frame: 3,
        }
    }
}

/// Axis-aligned XY bounds of the playable area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub cell_size: f64,
    /// World XY that maps to cell (0, 0)
    pub spatial_bias: (f64, f64),
    pub bounds: Option<GridBounds>,
    /// Viewers above this height gather nothing from the grid
    pub connection_max_z: Option<f64>,
    pub destroy_dormant_dynamic_objects: bool,
    /// Destroyed cells after which a rebuild logs a collection hint
    pub rebuild_collect_threshold: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cell_size: 10_000.0,
            spatial_bias: (-100_000.0, -100_000.0),
            bounds: None,
            connection_max_z: None,
            destroy_dormant_dynamic_objects: false,
            rebuild_collect_threshold: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketThreshold {
    pub max_objects: usize,
    pub num_buckets: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrequencyBucketsConfig {
    pub num_buckets: usize,
    /// Ascending population limits; the first that fits picks the bucket count
    pub thresholds: Vec<BucketThreshold>,
    pub enable_fast_path: bool,
    pub fast_path_frame_modulo: u32,
}

impl Default for FrequencyBucketsConfig {
    fn default() -> Self {
        Self {
            num_buckets: 3,
            thresholds: Vec::new(),
            enable_fast_path: false,
            fast_path_frame_modulo: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DormancyConfig {
    /// Let connection mirrors drop the cull distance of one object at a time
    pub trickle_enabled: bool,
    /// Gathers before a connection mirror starts trickling
    pub trickle_start_counter: u32,
    /// Viewers above this height skip dormancy gathers
    pub max_z: Option<f64>,
}

impl Default for DormancyConfig {
    fn default() -> Self {
        Self {
            trickle_enabled: true,
            trickle_start_counter: 10,
            max_z: None,
        }
    }
}

/// One view-cone band of the dynamic frequency node.
///
/// Frequencies are in Hz and converted to frame periods with the server tick
/// rate. A fast-path frequency of 0 disables the secondary lane for the band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyZone {
    /// Band applies when the view dot product is at most this value
    pub min_dot: f64,
    pub min_dist_pct: f64,
    pub max_dist_pct: f64,
    pub near_hz: f64,
    pub far_hz: f64,
    pub fast_near_hz: f64,
    pub fast_far_hz: f64,
}

impl FrequencyZone {
    pub const fn new(min_dot: f64, min_dist_pct: f64, max_dist_pct: f64, near_hz: f64, far_hz: f64) -> Self {
        Self {
            min_dot,
            min_dist_pct,
            max_dist_pct,
            near_hz,
            far_hz,
            fast_near_hz: 0.0,
            fast_far_hz: 0.0,
        }
    }

    pub const fn with_fast_path(mut self, fast_near_hz: f64, fast_far_hz: f64) -> Self {
        self.fast_near_hz = fast_near_hz;
        self.fast_far_hz = fast_far_hz;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicFrequencyConfig {
    /// Keep only the closest N objects per gather, -1 for no cap
    pub max_nearest_objects: i32,
    pub enable_fast_path: bool,
    pub max_bits_per_frame: i64,
    /// Bands for classes that have a fast-shared hook
    pub fast_shared_zones: Vec<FrequencyZone>,
    /// Bands for everything else
    pub zones: Vec<FrequencyZone>,
}

impl Default for DynamicFrequencyConfig {
    fn default() -> Self {
        Self {
            max_nearest_objects: -1,
            enable_fast_path: true,
            max_bits_per_frame: DEFAULT_LANE_BITS_PER_FRAME,
            fast_shared_zones: vec![
                FrequencyZone::new(0.0, 0.05, 0.10, 1.0, 1.0),
                FrequencyZone::new(0.71, 0.05, 0.10, 1.0, 1.0),
                FrequencyZone::new(1.0, 0.10, 0.50, 5.0, 1.0).with_fast_path(20.0, 10.0),
            ],
            zones: vec![
                FrequencyZone::new(0.0, 0.05, 0.10, 5.0, 1.0),
                FrequencyZone::new(0.71, 0.05, 0.10, 10.0, 5.0),
                FrequencyZone::new(1.0, 0.10, 0.50, 20.0, 5.0),
            ],
        }
    }
}

/// Fluent builder for [`GraphConfig`].
pub struct GraphConfigBuilder {
    config: GraphConfig,
}

impl GraphConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: GraphConfig::default(),
        }
    }

    pub fn with_tick_rate(mut self, server_tick_rate: f64) -> Self {
        self.config.general.server_tick_rate = server_tick_rate;
        self
    }

    pub fn with_priority_scales(mut self, distance: f32, starvation: f32) -> Self {
        self.config.class_defaults.distance_priority_scale = distance;
        self.config.class_defaults.starvation_priority_scale = starvation;
        self
    }

    pub fn with_channel_close_timeout(mut self, frames: u32) -> Self {
        self.config.class_defaults.channel_close_timeout_frames = frames;
        self
    }

    pub fn with_cull_distance(mut self, cull_distance: f64) -> Self {
        self.config.class_defaults.cull_distance = cull_distance;
        self
    }

    pub fn with_grid(mut self, cell_size: f64, spatial_bias: (f64, f64)) -> Self {
        self.config.grid.cell_size = cell_size;
        self.config.grid.spatial_bias = spatial_bias;
        self
    }

    pub fn with_grid_bounds(mut self, bounds: GridBounds) -> Self {
        self.config.grid.bounds = Some(bounds);
        self
    }

    pub fn with_fast_shared(mut self, enabled: bool, max_bits_per_frame: i64) -> Self {
        self.config.fast_shared.enabled = enabled;
        self.config.fast_shared.max_bits_per_frame = max_bits_per_frame;
        self
    }

    pub fn with_max_nearest_objects(mut self, max_nearest_objects: i32) -> Self {
        self.config.dynamic_frequency.max_nearest_objects = max_nearest_objects;
        self
    }

    pub fn with_discovery_budget(mut self, bytes_per_sec: u32) -> Self {
        self.config.general.discovery_budget_bytes_per_sec = bytes_per_sec;
        self
    }

    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.config.general.verification = enabled;
        self
    }

    pub fn build(self) -> GraphConfig {
        self.config
    }
}

impl Default for GraphConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Ready-made configurations for common deployments.
pub mod presets {
    use super::*;

    pub fn high_performance() -> GraphConfig {
        GraphConfigBuilder::new()
            .with_tick_rate(60.0)
            .with_grid(20_000.0, (-400_000.0, -400_000.0))
            .with_fast_shared(true, 2 * DEFAULT_LANE_BITS_PER_FRAME)
            .with_max_nearest_objects(256)
            .build()
    }

    pub fn development() -> GraphConfig {
        GraphConfigBuilder::new()
            .with_verification(true)
            .build()
    }

    pub fn low_resource() -> GraphConfig {
        let mut config = GraphConfigBuilder::new()
            .with_tick_rate(15.0)
            .with_channel_close_timeout(8)
            .with_fast_shared(false, 0)
            .with_max_nearest_objects(64)
            .build();
        config.frequency_buckets.num_buckets = 6;
        config
    }

    pub fn testing() -> GraphConfig {
        GraphConfigBuilder::new()
            .with_grid(1_000.0, (0.0, 0.0))
            .with_cull_distance(2_000.0)
            .with_verification(true)
            .build()
    }
}

impl GraphConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.general.server_tick_rate <= 0.0 {
            return Err(ConfigValidationError::InvalidValue("server_tick_rate must be > 0".to_string()));
        }
        if self.general.target_updates_per_second < 0.0 {
            return Err(ConfigValidationError::InvalidValue("target_updates_per_second cannot be negative".to_string()));
        }
        if self.grid.cell_size <= 0.0 {
            return Err(ConfigValidationError::InvalidValue("grid.cell_size must be > 0".to_string()));
        }
        if let Some(bounds) = self.grid.bounds {
            if bounds.min_x >= bounds.max_x || bounds.min_y >= bounds.max_y {
                return Err(ConfigValidationError::InvalidValue("grid.bounds: min values must be < max values".to_string()));
            }
        }
        if self.class_defaults.cull_distance < 0.0 {
            return Err(ConfigValidationError::InvalidValue("class_defaults.cull_distance cannot be negative".to_string()));
        }
        if self.class_defaults.replication_period_frames == 0 {
            return Err(ConfigValidationError::InvalidValue("class_defaults.replication_period_frames must be > 0".to_string()));
        }
        if self.prioritization.max_distance_scaling <= 0.0 {
            return Err(ConfigValidationError::InvalidValue("prioritization.max_distance_scaling must be > 0".to_string()));
        }
        if self.prioritization.max_frames_since_last_rep == 0 {
            return Err(ConfigValidationError::InvalidValue("prioritization.max_frames_since_last_rep must be > 0".to_string()));
        }
        if self.fast_shared.enabled && self.fast_shared.max_bits_per_frame <= 0 {
            return Err(ConfigValidationError::Conflict("fast_shared is enabled with no bit budget".to_string()));
        }
        if self.frequency_buckets.enable_fast_path && !self.fast_shared.enabled {
            return Err(ConfigValidationError::Conflict("frequency_buckets.enable_fast_path needs fast_shared.enabled".to_string()));
        }
        if self.frequency_buckets.num_buckets == 0 {
            return Err(ConfigValidationError::InvalidValue("frequency_buckets.num_buckets must be > 0".to_string()));
        }
        if self.frequency_buckets.fast_path_frame_modulo == 0 {
            return Err(ConfigValidationError::InvalidValue("frequency_buckets.fast_path_frame_modulo must be > 0".to_string()));
        }
        if self.frequency_buckets.thresholds.iter().any(|t| t.num_buckets == 0) {
            return Err(ConfigValidationError::InvalidValue("frequency_buckets.thresholds entries need at least one bucket".to_string()));
        }
        if self
            .frequency_buckets
            .thresholds
            .windows(2)
            .any(|pair| pair[0].max_objects > pair[1].max_objects)
        {
            return Err(ConfigValidationError::InvalidValue("frequency_buckets.thresholds must be sorted by max_objects".to_string()));
        }
        if self.dynamic_frequency.zones.is_empty() || self.dynamic_frequency.fast_shared_zones.is_empty() {
            return Err(ConfigValidationError::MissingRequired("dynamic_frequency zones".to_string()));
        }
        for zone in self.dynamic_frequency.zones.iter().chain(&self.dynamic_frequency.fast_shared_zones) {
            if zone.max_dist_pct <= zone.min_dist_pct {
                return Err(ConfigValidationError::InvalidValue(format!(
                    "frequency zone at dot {} needs max_dist_pct > min_dist_pct",
                    zone.min_dot
                )));
            }
            if zone.near_hz <= 0.0 || zone.far_hz <= 0.0 {
                return Err(ConfigValidationError::InvalidValue(format!(
                    "frequency zone at dot {} needs positive frequencies",
                    zone.min_dot
                )));
            }
        }
        Ok(())
    }

    /// Converts a frequency to a frame period at the configured tick rate.
    ///
    /// Returns 0 for a non-positive frequency.
    pub fn hz_to_period(&self, hz: f64) -> u32 {
        if hz <= 0.0 {
            return 0;
        }
        ((self.general.server_tick_rate / hz).round() as u32).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
    #[error("Conflicting configuration: {0}")]
    Conflict(String),
}
