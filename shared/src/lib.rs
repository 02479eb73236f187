//! Wire protocol and grid model shared by the canvas server and its clients.
//!
//! Clients speak JSON packets of the form `{"type": ..., "data": ...}` over a
//! persistent WebSocket. Between server processes, committed edits travel on
//! the update bus as bincode-encoded [`UpdateEvent`]s.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_GRID_WIDTH: usize = 500;
pub const DEFAULT_GRID_HEIGHT: usize = 500;

/// Store key holding the flat grid buffer.
pub const GRID_KEY: &str = "pixel_grid";
/// Bus channel carrying committed edits.
pub const UPDATE_CHANNEL: &str = "pixel_updates";

/// Index into the palette. Valid values are `0..PALETTE_SIZE`.
pub type ColorIndex = u8;

/// Default palette, indexed by [`ColorIndex`].
pub const PALETTE: [(&str, &str); 16] = [
    ("white", "#FFFFFF"),
    ("black", "#000000"),
    ("red", "#FF0000"),
    ("crimson", "#DC143C"),
    ("orange", "#FF7F00"),
    ("yellow", "#FFFF00"),
    ("brown", "#8B4513"),
    ("green", "#00FF00"),
    ("emerald", "#50C878"),
    ("cyan", "#00FFFF"),
    ("teal", "#008080"),
    ("blue", "#0000FF"),
    ("navy", "#000080"),
    ("purple", "#800080"),
    ("pink", "#FF00FF"),
    ("lime", "#BFFF00"),
];

pub const PALETTE_SIZE: usize = PALETTE.len();

const TOKEN_BASE: u8 = b'a';

/// Encodes a color as its one-byte cell token.
pub fn color_to_token(color: ColorIndex) -> u8 {
    TOKEN_BASE + color
}

/// Decodes a cell token, returning `None` for bytes outside the palette.
pub fn token_to_color(token: u8) -> Option<ColorIndex> {
    let color = token.checked_sub(TOKEN_BASE)?;
    if (color as usize) < PALETTE_SIZE {
        Some(color)
    } else {
        None
    }
}

/// A single cell assignment as it appears on the wire.
///
/// Fields are signed 64-bit so that any JSON integer a client can sensibly
/// send still parses and is rejected by validation instead of by the JSON
/// decoder.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pixel {
    pub x: i64,
    pub y: i64,
    pub color: i64,
}

impl Pixel {
    pub fn new(x: i64, y: i64, color: i64) -> Self {
        Self { x, y, color }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("pixel ({x}, {y}) is outside the grid")]
    OutOfBounds { x: i64, y: i64 },

    #[error("color {0} is not a palette index")]
    InvalidColor(i64),
}

/// A pixel that passed validation against a concrete grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub x: usize,
    pub y: usize,
    pub color: ColorIndex,
}

impl Cell {
    pub fn to_pixel(self) -> Pixel {
        Pixel::new(self.x as i64, self.y as i64, self.color as i64)
    }
}

/// Grid dimensions, fixed for the lifetime of a grid.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct GridDimensions {
    pub width: usize,
    pub height: usize,
}

impl GridDimensions {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn cell_count(&self) -> usize {
        self.width * self.height
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && (x as u64) < self.width as u64 && (y as u64) < self.height as u64
    }

    /// Linear offset of `(x, y)`. Callers must have checked bounds.
    pub fn index_of(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    /// Checks bounds and palette range, producing an addressable [`Cell`].
    pub fn validate(&self, pixel: &Pixel) -> Result<Cell, ValidationError> {
        let (x, y) = (pixel.x, pixel.y);
        if !self.contains(x, y) {
            return Err(ValidationError::OutOfBounds { x, y });
        }
        if pixel.color < 0 || pixel.color as usize >= PALETTE_SIZE {
            return Err(ValidationError::InvalidColor(pixel.color));
        }
        Ok(Cell {
            x: x as usize,
            y: y as usize,
            color: pixel.color as ColorIndex,
        })
    }
}

impl Default for GridDimensions {
    fn default() -> Self {
        Self::new(DEFAULT_GRID_WIDTH, DEFAULT_GRID_HEIGHT)
    }
}

/// Rectangular slice of the grid anchored at `(start_x, start_y)`; rows first.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdate {
    pub start_x: usize,
    pub start_y: usize,
    pub grid: Vec<Vec<ColorIndex>>,
}

/// Inclusive rectangle `(x1, y1)..=(x2, y2)` requested by a client.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

/// Packets sent by clients.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ClientPacket {
    #[serde(rename = "UPDATE")]
    Update(Pixel),
    /// Asks for the current contents of a rectangle, answered with a
    /// `BATCH_UPDATE` anchored at the clamped corner.
    #[serde(rename = "FETCH")]
    Fetch(Region),
    /// Asks for the grid size, cooldown and palette.
    #[serde(rename = "CONFIG")]
    Config,
}

/// Packets sent by the server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ServerPacket {
    /// Full (or regional) state, sent once when a session becomes active.
    #[serde(rename = "BATCH_UPDATE")]
    BatchUpdate(BatchUpdate),
    /// One flushed batch of committed edits, in commit order.
    #[serde(rename = "LIVE_UPDATE")]
    LiveUpdate(Vec<Pixel>),
    #[serde(rename = "CONFIG")]
    Config(ClientConfig),
}

impl ClientPacket {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ServerPacket {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// One published message on the update bus.
///
/// `sequence` is assigned by the bus, strictly increasing per channel, so a
/// subscriber can drop redeliveries and notice gaps.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UpdateEvent {
    pub sequence: u64,
    pub pixels: Vec<Pixel>,
}

impl UpdateEvent {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Configuration document handed to browser clients.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub grid_width: usize,
    pub grid_height: usize,
    /// Minimum delay between two edits of one session, in milliseconds.
    pub pixel_cooldown: u64,
    pub color_map: BTreeMap<ColorIndex, String>,
}

impl ClientConfig {
    pub fn new(dimensions: GridDimensions, pixel_cooldown_ms: u64) -> Self {
        let color_map = PALETTE
            .iter()
            .enumerate()
            .map(|(index, (_, hex))| (index as ColorIndex, hex.to_string()))
            .collect();

        Self {
            grid_width: dimensions.width,
            grid_height: dimensions.height,
            pixel_cooldown: pixel_cooldown_ms,
            color_map,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_codec() {
        assert_eq!(color_to_token(0), b'a');
        assert_eq!(color_to_token(15), b'p');
        assert_eq!(token_to_color(b'a'), Some(0));
        assert_eq!(token_to_color(b'p'), Some(15));
        assert_eq!(token_to_color(b'q'), None);
        assert_eq!(token_to_color(b'0'), None);
        assert_eq!(token_to_color(0), None);
    }

    #[test]
    fn test_index_of_is_row_major() {
        let dims = GridDimensions::new(4, 3);
        assert_eq!(dims.index_of(0, 0), 0);
        assert_eq!(dims.index_of(3, 0), 3);
        assert_eq!(dims.index_of(0, 1), 4);
        assert_eq!(dims.index_of(3, 2), 11);
        assert_eq!(dims.cell_count(), 12);
    }

    #[test]
    fn test_validate_accepts_in_bounds() {
        let dims = GridDimensions::new(4, 4);
        let cell = dims.validate(&Pixel::new(1, 2, 5)).unwrap();
        assert_eq!(cell, Cell { x: 1, y: 2, color: 5 });
        assert_eq!(cell.to_pixel(), Pixel::new(1, 2, 5));
    }

    #[test]
    fn test_validate_rejects_out_of_bounds() {
        let dims = GridDimensions::new(4, 4);
        for (x, y) in [(-1, 0), (0, -1), (4, 0), (0, 4), (i64::MAX, i64::MIN), (1 << 31, 0)] {
            let result = dims.validate(&Pixel::new(x, y, 1));
            assert_eq!(
                result,
                Err(ValidationError::OutOfBounds { x, y })
            );
        }
    }

    #[test]
    fn test_validate_rejects_colors_outside_palette() {
        let dims = GridDimensions::new(4, 4);
        assert_eq!(
            dims.validate(&Pixel::new(0, 0, PALETTE_SIZE as i64)),
            Err(ValidationError::InvalidColor(PALETTE_SIZE as i64))
        );
        assert_eq!(
            dims.validate(&Pixel::new(0, 0, -3)),
            Err(ValidationError::InvalidColor(-3))
        );
    }

    #[test]
    fn test_client_packet_wire_format() {
        let text = r#"{"type":"UPDATE","data":{"x":3,"y":7,"color":2}}"#;
        let packet = ClientPacket::from_json(text).unwrap();
        assert_eq!(packet, ClientPacket::Update(Pixel::new(3, 7, 2)));
    }

    #[test]
    fn test_coordinates_beyond_i32_still_parse() {
        let text = r#"{"type":"UPDATE","data":{"x":2147483648,"y":-2147483649,"color":1}}"#;
        let pixel = match ClientPacket::from_json(text).unwrap() {
            ClientPacket::Update(pixel) => pixel,
            other => panic!("expected UPDATE, got {:?}", other),
        };
        assert_eq!(pixel, Pixel::new(2_147_483_648, -2_147_483_649, 1));
        assert!(matches!(
            GridDimensions::default().validate(&pixel),
            Err(ValidationError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_request_packets_wire_format() {
        let fetch = r#"{"type":"FETCH","data":{"x1":0,"y1":1,"x2":9,"y2":4}}"#;
        assert_eq!(
            ClientPacket::from_json(fetch).unwrap(),
            ClientPacket::Fetch(Region {
                x1: 0,
                y1: 1,
                x2: 9,
                y2: 4
            })
        );
        assert_eq!(
            ClientPacket::from_json(r#"{"type":"CONFIG"}"#).unwrap(),
            ClientPacket::Config
        );
    }

    #[test]
    fn test_unknown_client_packet_is_rejected() {
        assert!(ClientPacket::from_json(r#"{"type":"ERASE","data":{}}"#).is_err());
        assert!(ClientPacket::from_json("not json").is_err());
    }

    #[test]
    fn test_batch_update_wire_format() {
        let packet = ServerPacket::BatchUpdate(BatchUpdate {
            start_x: 0,
            start_y: 0,
            grid: vec![vec![0, 1], vec![2, 3]],
        });
        let value: serde_json::Value = serde_json::from_str(&packet.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "BATCH_UPDATE");
        assert_eq!(value["data"]["startX"], 0);
        assert_eq!(value["data"]["startY"], 0);
        assert_eq!(value["data"]["grid"][1][0], 2);
    }

    #[test]
    fn test_live_update_wire_format() {
        let packet = ServerPacket::LiveUpdate(vec![Pixel::new(1, 2, 5), Pixel::new(0, 0, 1)]);
        let value: serde_json::Value = serde_json::from_str(&packet.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "LIVE_UPDATE");
        assert_eq!(value["data"].as_array().unwrap().len(), 2);
        assert_eq!(value["data"][0]["x"], 1);
        assert_eq!(value["data"][0]["y"], 2);
        assert_eq!(value["data"][0]["color"], 5);
    }

    #[test]
    fn test_update_event_rejects_truncated_payload() {
        let event = UpdateEvent {
            sequence: 9,
            pixels: vec![Pixel::new(1, 1, 1)],
        };
        let bytes = event.encode().unwrap();
        assert_eq!(UpdateEvent::decode(&bytes).unwrap(), event);
        assert!(UpdateEvent::decode(&bytes[..bytes.len() / 2]).is_err());
        assert!(UpdateEvent::decode(&[]).is_err());
    }

    #[test]
    fn test_client_config_document() {
        let config = ClientConfig::new(GridDimensions::new(500, 400), 3000);
        let value: serde_json::Value = serde_json::to_value(&config).unwrap();

        assert_eq!(value["gridWidth"], 500);
        assert_eq!(value["gridHeight"], 400);
        assert_eq!(value["pixelCooldown"], 3000);
        assert_eq!(value["colorMap"]["0"], "#FFFFFF");
        assert_eq!(value["colorMap"]["15"], "#BFFF00");
        assert_eq!(config.color_map.len(), PALETTE_SIZE);
    }
}
