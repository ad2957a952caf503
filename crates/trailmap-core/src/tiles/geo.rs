//! Web-Mercator (EPSG:3857) helpers for turning geographic views into tile
//! ranges and stored tiles back into geographic footprints.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::codec::TileDescriptor;

/// Pixel size of the whole world at zoom 0.
const WORLD_SIZE: f64 = 256.0;

/// Latitude limit of the spherical Mercator projection.
const MAX_LATITUDE: f64 = 85.051_128_779_8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned box in pixel space at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelBounds {
    pub min: Point,
    pub max: Point,
}

impl PixelBounds {
    /// Normalizes the corners so `min` is top-left and `max` bottom-right.
    pub fn new(a: Point, b: Point) -> Self {
        Self {
            min: Point::new(a.x.min(b.x), a.y.min(b.y)),
            max: Point::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLngBounds {
    pub south_west: LatLng,
    pub north_east: LatLng,
}

impl LatLngBounds {
    pub fn new(south_west: LatLng, north_east: LatLng) -> Self {
        Self {
            south_west,
            north_east,
        }
    }

    /// Parse `south,west,north,east` in decimal degrees.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        match parts.as_slice() {
            [south, west, north, east] => Some(Self::new(
                LatLng::new(*south, *west),
                LatLng::new(*north, *east),
            )),
            _ => None,
        }
    }

    pub fn north_west(&self) -> LatLng {
        LatLng::new(self.north_east.lat, self.south_west.lng)
    }

    pub fn south_east(&self) -> LatLng {
        LatLng::new(self.south_west.lat, self.north_east.lng)
    }

    /// Pixel box covering these bounds at `zoom`.
    pub fn to_pixel_bounds(&self, zoom: u32) -> PixelBounds {
        PixelBounds::new(project(self.north_west(), zoom), project(self.south_east(), zoom))
    }
}

fn scale(zoom: u32) -> f64 {
    WORLD_SIZE * 2f64.powi(zoom as i32)
}

/// Geographic position to absolute pixel coordinates at `zoom`.
pub fn project(latlng: LatLng, zoom: u32) -> Point {
    let lat = latlng.lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let s = scale(zoom);
    let x = s * (latlng.lng / 360.0 + 0.5);
    let y = s * (0.5 - (PI / 4.0 + lat / 2.0).tan().ln() / (2.0 * PI));
    Point::new(x, y)
}

/// Absolute pixel coordinates at `zoom` back to a geographic position.
pub fn unproject(point: Point, zoom: u32) -> LatLng {
    let s = scale(zoom);
    let lng = (point.x / s - 0.5) * 360.0;
    let lat = (2.0 * ((0.5 - point.y / s) * 2.0 * PI).exp().atan() - PI / 2.0).to_degrees();
    LatLng::new(lat, lng)
}

/// GeoJSON FeatureCollection with one polygon per stored tile, the tile's
/// metadata as feature properties.
pub fn coverage_geojson(tiles: &[TileDescriptor], tile_size: u32) -> Value {
    let size = f64::from(tile_size);
    let features: Vec<Value> = tiles
        .iter()
        .map(|tile| {
            let top_left = Point::new(tile.x as f64 * size, tile.y as f64 * size);
            let bottom_right = Point::new(top_left.x + size, top_left.y + size);
            let tl = unproject(top_left, tile.z);
            let br = unproject(bottom_right, tile.z);
            json!({
                "type": "Feature",
                "properties": tile,
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[
                        [tl.lng, tl.lat],
                        [br.lng, tl.lat],
                        [br.lng, br.lat],
                        [tl.lng, br.lat],
                        [tl.lng, tl.lat],
                    ]],
                },
            })
        })
        .collect();

    json!({
        "type": "FeatureCollection",
        "features": features,
    })
}
