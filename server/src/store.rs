//! Grid store adapter over a flat key/value backend.
//!
//! The grid lives under one key as `width * height` one-byte cell tokens in
//! row-major order. A cell write is a one-byte range overwrite at
//! `y * width + x`, so writers never touch neighboring cells and a concurrent
//! full read sees every cell either before or after any given write.

use crate::error::StoreError;
use async_trait::async_trait;
use log::{info, warn};
use shared::{
    color_to_token, token_to_color, BatchUpdate, Cell, ColorIndex, GridDimensions, GRID_KEY,
    PALETTE_SIZE,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Byte-string storage shared by every server process.
///
/// Semantics follow the usual string commands of a networked key/value
/// store: `set_range` zero-pads a short value, `get_range` takes an inclusive
/// end and truncates to the stored length.
#[async_trait]
pub trait GridBackend: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Stores `value` only if `key` is absent. Returns true if it stored.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError>;

    async fn set_range(&self, key: &str, offset: usize, value: &[u8]) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn get_range(&self, key: &str, start: usize, end: usize)
        -> Result<Vec<u8>, StoreError>;
}

/// In-process backend. Shared by handing out clones of the same `Arc`.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GridBackend for MemoryBackend {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }

    async fn set_range(&self, key: &str, offset: usize, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_default();
        let end = offset + value.len();
        if entry.len() < end {
            entry.resize(end, 0);
        }
        entry[offset..end].copy_from_slice(value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn get_range(
        &self,
        key: &str,
        start: usize,
        end: usize,
    ) -> Result<Vec<u8>, StoreError> {
        let entries = self.entries.read().await;
        let Some(value) = entries.get(key) else {
            return Ok(Vec::new());
        };
        if start >= value.len() || end < start {
            return Ok(Vec::new());
        }
        let end = end.min(value.len() - 1);
        Ok(value[start..=end].to_vec())
    }
}

/// The only component that addresses the raw grid buffer.
#[derive(Clone)]
pub struct GridStore {
    backend: Arc<dyn GridBackend>,
    key: String,
    dimensions: GridDimensions,
}

impl GridStore {
    pub fn new(backend: Arc<dyn GridBackend>, dimensions: GridDimensions) -> Self {
        Self::with_key(backend, GRID_KEY, dimensions)
    }

    pub fn with_key(
        backend: Arc<dyn GridBackend>,
        key: impl Into<String>,
        dimensions: GridDimensions,
    ) -> Self {
        Self {
            backend,
            key: key.into(),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> GridDimensions {
        self.dimensions
    }

    /// Creates the grid filled with `fill` unless it already exists.
    ///
    /// Returns true if this call created it. Racing initializers are safe
    /// because creation is a single set-if-absent.
    pub async fn initialize(&self, fill: ColorIndex) -> Result<bool, StoreError> {
        if fill as usize >= PALETTE_SIZE {
            return Err(StoreError::InvalidColor(fill));
        }
        if self.backend.exists(&self.key).await? {
            info!("Grid '{}' already present, keeping it", self.key);
            return Ok(false);
        }

        let buffer = vec![color_to_token(fill); self.dimensions.cell_count()];
        let created = self.backend.set_if_absent(&self.key, buffer).await?;
        if created {
            info!(
                "Initialized grid '{}' ({}x{}) with color {}",
                self.key, self.dimensions.width, self.dimensions.height, fill
            );
        }
        Ok(created)
    }

    /// Overwrites exactly one cell. Out-of-range coordinates never reach the
    /// backend.
    pub async fn write_pixel(&self, x: i64, y: i64, color: ColorIndex) -> Result<(), StoreError> {
        if !self.dimensions.contains(x, y) {
            return Err(StoreError::OutOfBounds { x, y });
        }
        if color as usize >= PALETTE_SIZE {
            return Err(StoreError::InvalidColor(color));
        }
        let offset = self.dimensions.index_of(x as usize, y as usize);
        self.backend
            .set_range(&self.key, offset, &[color_to_token(color)])
            .await
    }

    pub async fn write_cell(&self, cell: Cell) -> Result<(), StoreError> {
        self.write_pixel(cell.x as i64, cell.y as i64, cell.color)
            .await
    }

    /// Full grid as `height` rows of `width` colors.
    pub async fn read_grid(&self) -> Result<Vec<Vec<ColorIndex>>, StoreError> {
        let buffer = self.backend.get(&self.key).await?.unwrap_or_default();
        if buffer.len() != self.dimensions.cell_count() {
            warn!(
                "Grid '{}' holds {} cells, expected {}",
                self.key,
                buffer.len(),
                self.dimensions.cell_count()
            );
        }

        let width = self.dimensions.width;
        let grid: Vec<Vec<ColorIndex>> = (0..self.dimensions.height)
            .map(|y| {
                let start = (y * width).min(buffer.len());
                let end = ((y + 1) * width).min(buffer.len());
                decode_row(&buffer[start..end], width)
            })
            .collect();

        let unreadable = buffer
            .iter()
            .take(self.dimensions.cell_count())
            .filter(|&&token| token_to_color(token).is_none())
            .count();
        if unreadable > 0 {
            warn!(
                "Grid '{}' has {} unreadable cells, reading them as color 0",
                self.key, unreadable
            );
        }
        Ok(grid)
    }

    /// Inclusive rectangle `(x1, y1)..=(x2, y2)`, clamped to the grid.
    pub async fn read_region(
        &self,
        x1: i64,
        y1: i64,
        x2: i64,
        y2: i64,
    ) -> Result<BatchUpdate, StoreError> {
        let max_x = self.dimensions.width as i64 - 1;
        let max_y = self.dimensions.height as i64 - 1;
        let (left, right) = (x1.max(0), x2.min(max_x));
        let (top, bottom) = (y1.max(0), y2.min(max_y));
        if left > right || top > bottom {
            return Err(StoreError::OutOfBounds { x: x2, y: y2 });
        }

        let (left, right) = (left as usize, right as usize);
        let region_width = right - left + 1;
        let mut grid = Vec::with_capacity(bottom as usize - top as usize + 1);
        for y in top as usize..=bottom as usize {
            let start = self.dimensions.index_of(left, y);
            let end = self.dimensions.index_of(right, y);
            let row = self.backend.get_range(&self.key, start, end).await?;
            grid.push(decode_row(&row, region_width));
        }

        Ok(BatchUpdate {
            start_x: left,
            start_y: top as usize,
            grid,
        })
    }
}

/// Decodes up to `width` tokens. Missing or unreadable cells read as color 0.
fn decode_row(tokens: &[u8], width: usize) -> Vec<ColorIndex> {
    let mut row: Vec<ColorIndex> = tokens
        .iter()
        .take(width)
        .map(|&token| token_to_color(token).unwrap_or(0))
        .collect();
    row.resize(width, 0);
    row
}
