use std::time::Duration;

use tracing::{debug, warn};

/// Fallback viewport center used whenever a chapter carries no
/// locations.
pub const DEFAULT_CENTER: (f64, f64) = (31.7683, 35.2137);

const OVERVIEW_ZOOM: u8 = 7;
const MARKER_ZOOM: u8 = 11;
const MAX_FOCUS_ZOOM: u8 = 21;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_millis(5000);

const DIRECTIVE_NAME: &str = "showLocation(";

/// Typed decode of one embedded location invocation:
/// `showLocation(id,'placename',lat,lng,viewLat,viewLng,viewTilt,
/// viewRoll,viewAltitude,viewHeading,flags)`.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationDirective {
    pub geotag_id: i64,
    pub placename: String,
    pub latitude: f64,
    pub longitude: f64,
    pub view_latitude: f64,
    pub view_longitude: f64,
    pub view_tilt: f64,
    pub view_roll: f64,
    pub view_altitude: f64,
    pub view_heading: f64,
    /// Parsed but deliberately never appended to the placename.
    pub flags: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapMarker {
    pub placename: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&LocationDirective> for MapMarker {
    fn from(directive: &LocationDirective) -> Self {
        Self {
            placename: directive.placename.clone(),
            latitude: directive.latitude,
            longitude: directive.longitude,
        }
    }
}

/// Scans rendered content for location directives, in content order.
/// Duplicates are preserved; candidates that fail to decode are
/// skipped without aborting the scan.
pub fn extract_directives(markup: &str) -> Vec<MapMarker> {
    extract_location_directives(markup)
        .iter()
        .map(MapMarker::from)
        .collect()
}

pub fn extract_location_directives(markup: &str) -> Vec<LocationDirective> {
    let mut directives = Vec::new();
    let mut rest = markup;
    while let Some(pos) = rest.find(DIRECTIVE_NAME) {
        let tail = &rest[pos + DIRECTIVE_NAME.len()..];
        match parse_argument_list(tail) {
            Some((directive, consumed)) => {
                directives.push(directive);
                rest = &tail[consumed..];
            }
            None => {
                debug!("skipping malformed location directive");
                rest = tail;
            }
        }
    }
    directives
}

/// Decodes a full `showLocation(...)` invocation string.
pub fn parse_directive(invocation: &str) -> Option<LocationDirective> {
    let start = invocation.find(DIRECTIVE_NAME)?;
    let (directive, _) = parse_argument_list(&invocation[start + DIRECTIVE_NAME.len()..])?;
    Some(directive)
}

/// Parses the argument list following the opening parenthesis and
/// returns how many bytes were consumed, including the closing one.
fn parse_argument_list(input: &str) -> Option<(LocationDirective, usize)> {
    let mut cursor = Cursor::new(input);

    let geotag_id = cursor.field_until(',')?.trim().parse::<i64>().ok()?;
    let placename = cursor.quoted()?;
    cursor.expect(',')?;

    let mut numbers = [0f64; 8];
    for slot in &mut numbers {
        *slot = cursor.field_until(',')?.trim().parse::<f64>().ok()?;
    }

    // Flags are usually quoted and may themselves contain parentheses.
    let flags = if cursor.rest().trim_start().starts_with('\'') {
        let flags = cursor.quoted()?;
        cursor.expect(')')?;
        flags
    } else {
        cursor.field_until(')')?.trim().to_string()
    };

    let directive = LocationDirective {
        geotag_id,
        placename,
        latitude: numbers[0],
        longitude: numbers[1],
        view_latitude: numbers[2],
        view_longitude: numbers[3],
        view_tilt: numbers[4],
        view_roll: numbers[5],
        view_altitude: numbers[6],
        view_heading: numbers[7],
        flags,
    };
    Some((directive, cursor.consumed()))
}

struct Cursor<'a> {
    input: &'a str,
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, offset: 0 }
    }

    fn consumed(&self) -> usize {
        self.offset
    }

    fn rest(&self) -> &'a str {
        &self.input[self.offset..]
    }

    fn field_until(&mut self, delimiter: char) -> Option<&'a str> {
        let rest = self.rest();
        let end = rest.find(delimiter)?;
        self.offset += end + delimiter.len_utf8();
        Some(&rest[..end])
    }

    fn expect(&mut self, expected: char) -> Option<()> {
        let rest = self.rest().trim_start();
        self.offset += self.rest().len() - rest.len();
        if rest.starts_with(expected) {
            self.offset += expected.len_utf8();
            Some(())
        } else {
            None
        }
    }

    fn quoted(&mut self) -> Option<String> {
        self.expect('\'')?;
        let rest = self.rest();
        let end = rest.find('\'')?;
        self.offset += end + 1;
        Some(rest[..end].to_string())
    }
}

/// Geographic rectangle accumulated over marker coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl GeoBounds {
    pub fn from_markers(markers: &[MapMarker]) -> Option<Self> {
        let first = markers.first()?;
        let mut bounds = Self {
            south: first.latitude,
            west: first.longitude,
            north: first.latitude,
            east: first.longitude,
        };
        for marker in &markers[1..] {
            bounds.extend(marker.latitude, marker.longitude);
        }
        Some(bounds)
    }

    pub fn extend(&mut self, latitude: f64, longitude: f64) {
        self.south = self.south.min(latitude);
        self.north = self.north.max(latitude);
        self.west = self.west.min(longitude);
        self.east = self.east.max(longitude);
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        latitude >= self.south
            && latitude <= self.north
            && longitude >= self.west
            && longitude <= self.east
    }
}

/// Marker-drawing capability of the embedding environment.
pub trait MapSurface: Send {
    /// Whether the capability has finished initializing. Sync attempts
    /// against a not-yet-ready surface are retried with backoff.
    fn is_ready(&self) -> bool;
    fn add_marker(&mut self, marker: &MapMarker);
    fn clear_markers(&mut self);
    fn set_zoom(&mut self, zoom: u8);
    fn pan_to(&mut self, latitude: f64, longitude: f64);
    fn fit_bounds(&mut self, bounds: &GeoBounds);
}

/// Backoff policy guarding marker setup. The delay doubles after each
/// attempt and never resets; once the doubled delay would exceed the
/// ceiling the just-scheduled attempt is abandoned and no further
/// attempts are made.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    delay: Duration,
    ceiling: Duration,
}

impl RetryScheduler {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            delay: initial,
            ceiling,
        }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        let scheduled = self.delay;
        self.delay *= 2;
        if self.delay > self.ceiling {
            None
        } else {
            Some(scheduled)
        }
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new(INITIAL_RETRY_DELAY, MAX_RETRY_DELAY)
    }
}

/// Owns the live marker set for the currently displayed chapter and
/// replaces it atomically on every navigation.
pub struct MarkerManager<S: MapSurface> {
    surface: S,
    markers: Vec<MapMarker>,
    retry: RetryScheduler,
}

impl<S: MapSurface> MarkerManager<S> {
    pub fn new(surface: S) -> Self {
        Self {
            surface,
            markers: Vec::new(),
            retry: RetryScheduler::default(),
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn markers(&self) -> &[MapMarker] {
        &self.markers
    }

    /// Replaces the drawn marker set: clear everything first, draw the
    /// new set, then apply the viewport policy. While the surface is
    /// not ready the attempt is re-scheduled with doubling delay; once
    /// the policy gives up the sync is skipped for this navigation.
    pub async fn sync(&mut self, markers: Vec<MapMarker>) {
        while !self.surface.is_ready() {
            match self.retry.next_delay() {
                Some(delay) => {
                    debug!(?delay, "map capability not ready, retrying marker sync");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!("map capability unavailable, marker sync skipped");
                    return;
                }
            }
        }
        self.apply(markers);
    }

    fn apply(&mut self, markers: Vec<MapMarker>) {
        self.surface.clear_markers();
        for marker in &markers {
            self.surface.add_marker(marker);
        }
        self.markers = markers;

        match self.markers.len() {
            0 => {
                self.surface.set_zoom(MARKER_ZOOM);
                self.surface.pan_to(DEFAULT_CENTER.0, DEFAULT_CENTER.1);
            }
            1 => {
                let marker = &self.markers[0];
                self.surface.set_zoom(MARKER_ZOOM);
                self.surface.pan_to(marker.latitude, marker.longitude);
            }
            _ => {
                let bounds = GeoBounds::from_markers(&self.markers)
                    .unwrap_or(GeoBounds {
                        south: DEFAULT_CENTER.0,
                        west: DEFAULT_CENTER.1,
                        north: DEFAULT_CENTER.0,
                        east: DEFAULT_CENTER.1,
                    });
                self.surface.fit_bounds(&bounds);
            }
        }
    }

    /// Clears the map and returns to the overview framing; used by
    /// table-of-contents navigations.
    pub fn recenter(&mut self) {
        if !self.surface.is_ready() {
            warn!("map capability unavailable, recenter skipped");
            return;
        }
        self.surface.clear_markers();
        self.markers.clear();
        self.surface.set_zoom(OVERVIEW_ZOOM);
        self.surface.pan_to(DEFAULT_CENTER.0, DEFAULT_CENTER.1);
    }

    /// Spotlights a single location from an explicit directive
    /// activation, deriving zoom from the directive's view altitude.
    pub fn focus(&mut self, directive: &LocationDirective) {
        if !self.surface.is_ready() {
            warn!("map capability unavailable, focus skipped");
            return;
        }
        self.surface.clear_markers();
        self.markers.clear();
        let marker = MapMarker::from(directive);
        self.surface.add_marker(&marker);
        self.surface.set_zoom(focus_zoom(directive.view_altitude));
        self.surface.pan_to(marker.latitude, marker.longitude);
        self.markers.push(marker);
    }
}

fn focus_zoom(view_altitude: f64) -> u8 {
    let zoom = (16.0 - view_altitude / 1000.0).floor();
    zoom.clamp(0.0, f64::from(MAX_FOCUS_ZOOM)) as u8
}
