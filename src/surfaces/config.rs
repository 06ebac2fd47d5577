//! Surface set, feature classes, treeline table and resolution scaling.

use serde::Serialize;

use crate::features::TagFilter;
use crate::geo::BoundingBox;

pub const MATERIAL_BASE: &str = "ArmaReforger/Terrains/Common/Surfaces";

/// The five painted surfaces. `Grass` is the default: it takes whatever
/// share of a pixel the other four leave.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceKind {
    Grass,
    ForestFloor,
    Asphalt,
    Rock,
    SandDirt,
}

impl SurfaceKind {
    /// Every surface, default first.
    pub const ALL: [SurfaceKind; 5] = [
        SurfaceKind::Grass,
        SurfaceKind::ForestFloor,
        SurfaceKind::Asphalt,
        SurfaceKind::Rock,
        SurfaceKind::SandDirt,
    ];

    /// Recommended editor import order, most specific first.
    pub const IMPORT_ORDER: [SurfaceKind; 4] = [
        SurfaceKind::Rock,
        SurfaceKind::ForestFloor,
        SurfaceKind::Asphalt,
        SurfaceKind::SandDirt,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SurfaceKind::Grass => "grass",
            SurfaceKind::ForestFloor => "forest_floor",
            SurfaceKind::Asphalt => "asphalt",
            SurfaceKind::Rock => "rock",
            SurfaceKind::SandDirt => "sand_dirt",
        }
    }

    pub fn is_default(&self) -> bool {
        *self == SurfaceKind::Grass
    }

    pub fn material_path(&self) -> String {
        let file = match self {
            SurfaceKind::Grass => "Grass_01",
            SurfaceKind::ForestFloor => "ForestFloor_01",
            SurfaceKind::Asphalt => "Asphalt_01",
            SurfaceKind::Rock => "Rock_01",
            SurfaceKind::SandDirt => "Dirt_01",
        };
        format!("{MATERIAL_BASE}/{file}.emat")
    }
}

// ===== FEATURE CLASSES =====

pub const PAVED_ROAD_CLASSES: &[&str] = &[
    "motorway",
    "trunk",
    "primary",
    "secondary",
    "tertiary",
    "residential",
    "unclassified",
    "service",
    "motorway_link",
    "trunk_link",
    "primary_link",
    "secondary_link",
    "tertiary_link",
    "living_street",
    "cycleway",
];

pub const LOOSE_ROAD_CLASSES: &[&str] = &["track", "path", "footway", "bridleway"];

pub const FARMLAND_TYPES: &[&str] = &["farmland", "farmyard", "allotments", "orchard"];

pub const URBAN_TYPES: &[&str] = &["residential", "industrial", "commercial", "retail"];

pub const SURFACE_WATER_TYPES: &[&str] = &["lake", "pond", "reservoir", "water"];

pub fn paved_roads() -> TagFilter {
    TagFilter::new("highway", PAVED_ROAD_CLASSES)
}

pub fn loose_roads() -> TagFilter {
    TagFilter::new("highway", LOOSE_ROAD_CLASSES)
}

pub fn farmland() -> TagFilter {
    TagFilter::new("type", FARMLAND_TYPES)
}

pub fn urban() -> TagFilter {
    TagFilter::new("type", URBAN_TYPES)
}

pub fn surface_water() -> TagFilter {
    TagFilter::new("water_type", SURFACE_WATER_TYPES)
}

// ===== TREELINE =====

const DEFAULT_TREELINE_M: f32 = 1200.0;

/// Base treeline per country; flat countries effectively have none.
fn base_treeline(country: &str) -> f32 {
    match country {
        "NO" => 1100.0,
        "SE" => 1000.0,
        "FI" => 600.0,
        "PL" => 1400.0,
        "DK" | "EE" | "LV" | "LT" => 9999.0,
        _ => DEFAULT_TREELINE_M,
    }
}

/// (south_lat, north_lat, treeline_south, treeline_north)
fn latitude_range(country: &str) -> Option<(f64, f64, f64, f64)> {
    match country {
        "NO" => Some((58.0, 71.0, 1200.0, 800.0)),
        "SE" => Some((55.5, 69.0, 1100.0, 800.0)),
        "FI" => Some((60.0, 70.0, 700.0, 400.0)),
        _ => None,
    }
}

/// Treeline elevation in metres for a job, interpolated by the box's centre
/// latitude where the country has a known north-south gradient.
pub fn treeline_elevation(country: Option<&str>, bbox: &BoundingBox) -> f32 {
    let Some(code) = country.map(|c| c.to_ascii_uppercase()) else {
        return DEFAULT_TREELINE_M;
    };
    match latitude_range(&code) {
        Some((lat_s, lat_n, tree_s, tree_n)) => {
            let lat = (bbox.south() + bbox.north()) / 2.0;
            let t = ((lat - lat_s) / (lat_n - lat_s)).clamp(0.0, 1.0);
            (tree_s + t * (tree_n - tree_s)).trunc() as f32
        }
        None => base_treeline(&code),
    }
}

// ===== RESOLUTION SCALING =====

/// Buffer and transition widths converted from metres to pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ScaledWidths {
    /// Rock blur sigma
    pub sigma: f32,
    /// Paved road half-width (~6 m)
    pub road_buffer_px: usize,
    /// Loose road half-width (~3 m)
    pub gravel_buffer_px: usize,
    /// Forest edge transition (~20 m)
    pub forest_transition_px: usize,
    /// Shoreline sand band (~10 m)
    pub sand_transition_px: usize,
}

impl ScaledWidths {
    pub fn for_cell_size(cell_size_m: f64) -> Self {
        let cell = if cell_size_m > 0.0 { cell_size_m } else { 1.0 };
        let px = |metres: f64, min: usize| ((metres / cell) as usize).max(min);
        Self {
            sigma: cell.max(1.0) as f32,
            road_buffer_px: px(6.0, 2),
            gravel_buffer_px: px(3.0, 1),
            forest_transition_px: px(20.0, 3),
            sand_transition_px: px(10.0, 2),
        }
    }
}
