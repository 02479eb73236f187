//! Client-side copy of the canvas
//!
//! The replica starts empty, is filled by the first `BATCH_UPDATE` and then
//! follows `LIVE_UPDATE` packets. Applying a pixel twice is harmless, which
//! is what makes the server's snapshot handoff safe to observe.

use shared::{BatchUpdate, ColorIndex, GridDimensions, Pixel, ServerPacket};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaGrid {
    dimensions: GridDimensions,
    cells: Vec<ColorIndex>,
    /// Whether a snapshot has been applied yet
    synced: bool,
    live_updates: usize,
}

impl ReplicaGrid {
    pub fn new(dimensions: GridDimensions) -> Self {
        Self {
            dimensions,
            cells: vec![0; dimensions.cell_count()],
            synced: false,
            live_updates: 0,
        }
    }

    pub fn dimensions(&self) -> GridDimensions {
        self.dimensions
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Number of `LIVE_UPDATE` packets applied so far
    pub fn live_updates(&self) -> usize {
        self.live_updates
    }

    pub fn get(&self, x: usize, y: usize) -> Option<ColorIndex> {
        if x < self.dimensions.width && y < self.dimensions.height {
            Some(self.cells[self.dimensions.index_of(x, y)])
        } else {
            None
        }
    }

    pub fn apply(&mut self, packet: &ServerPacket) {
        match packet {
            ServerPacket::BatchUpdate(batch) => self.apply_batch(batch),
            ServerPacket::LiveUpdate(pixels) => {
                self.live_updates += 1;
                for pixel in pixels {
                    self.apply_pixel(pixel);
                }
            }
            ServerPacket::Config(_) => {}
        }
    }

    /// Copies a rectangle into the replica. Cells outside the grid are ignored.
    pub fn apply_batch(&mut self, batch: &BatchUpdate) {
        for (row_offset, row) in batch.grid.iter().enumerate() {
            let y = batch.start_y + row_offset;
            for (col_offset, &color) in row.iter().enumerate() {
                let x = batch.start_x + col_offset;
                if x < self.dimensions.width && y < self.dimensions.height {
                    let index = self.dimensions.index_of(x, y);
                    self.cells[index] = color;
                }
            }
        }
        self.synced = true;
    }

    /// Returns false if the pixel does not address a valid cell.
    pub fn apply_pixel(&mut self, pixel: &Pixel) -> bool {
        match self.dimensions.validate(pixel) {
            Ok(cell) => {
                let index = self.dimensions.index_of(cell.x, cell.y);
                self.cells[index] = cell.color;
                true
            }
            Err(_) => false,
        }
    }

    pub fn rows(&self) -> Vec<Vec<ColorIndex>> {
        self.cells
            .chunks(self.dimensions.width.max(1))
            .map(|row| row.to_vec())
            .collect()
    }
}
