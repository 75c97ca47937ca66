//! Split a bitmap into a regular grid, upscale each cell, and stitch the
//! results back together.

use tracing::debug;

use crate::bitmap::{Bitmap, PageMetadata, Rect};
use crate::error::{Result, UpscaleError};

/// Row-major grid of tile rectangles covering a `width x height` image.
///
/// Every tile is `tile_size` square except those touching the right or
/// bottom edge, which are clipped to the remaining extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    across: usize,
    down: usize,
    tiles: Vec<Rect>,
}

impl TileGrid {
    pub fn new(width: u32, height: u32, tile_size: u32) -> Result<Self> {
        if tile_size == 0 {
            return Err(UpscaleError::image("tile size must be positive"));
        }
        if width == 0 || height == 0 {
            return Err(UpscaleError::image(format!(
                "cannot tile a {width}x{height} image"
            )));
        }
        let across = width.div_ceil(tile_size) as usize;
        let down = height.div_ceil(tile_size) as usize;

        let mut tiles = Vec::with_capacity(across * down);
        for row in 0..down as u32 {
            let y = row * tile_size;
            let tile_h = tile_size.min(height - y);
            for column in 0..across as u32 {
                let x = column * tile_size;
                let tile_w = tile_size.min(width - x);
                tiles.push(Rect::new(x, y, tile_w, tile_h));
            }
        }
        Ok(Self {
            across,
            down,
            tiles,
        })
    }

    /// Tiles per row.
    pub fn across(&self) -> usize {
        self.across
    }

    /// Tiles per column.
    pub fn down(&self) -> usize {
        self.down
    }

    pub fn tiles(&self) -> &[Rect] {
        &self.tiles
    }
}

/// Upscale `source` tile by tile with `infer` and reassemble the result.
///
/// Tiles are processed in row-major order. The joined image is cropped to
/// the sum of the first row's output widths by the sum of the first
/// column's output heights, since the grid join pads smaller edge tiles out
/// to full cells.
pub fn tiled_inference<F>(source: &Bitmap, tile_size: u32, mut infer: F) -> Result<Bitmap>
where
    F: FnMut(&Bitmap) -> Result<Bitmap>,
{
    let grid = TileGrid::new(source.width(), source.height(), tile_size)?;
    debug!(
        width = source.width(),
        height = source.height(),
        tile_size,
        across = grid.across(),
        down = grid.down(),
        "Running tiled inference"
    );

    let mut outputs = Vec::with_capacity(grid.tiles().len());
    for rect in grid.tiles() {
        let region = source.extract_region(*rect)?;
        let tile = Bitmap::from_raw(region, rect.width, rect.height, source.bands())?
            .with_format_of(source)?;
        outputs.push(infer(&tile)?);
    }

    let expected_w: u32 = outputs[..grid.across()].iter().map(Bitmap::width).sum();
    let expected_h: u32 = outputs
        .iter()
        .step_by(grid.across())
        .map(Bitmap::height)
        .sum();

    let joined = Bitmap::join_grid(&outputs, grid.across())?;
    drop(outputs);

    let mut result = if joined.width() != expected_w || joined.height() != expected_h {
        debug!(
            joined_width = joined.width(),
            joined_height = joined.height(),
            expected_w,
            expected_h,
            "Cropping joined tiles"
        );
        joined.crop(Rect::new(0, 0, expected_w, expected_h))?
    } else {
        joined
    };

    copy_page_metadata(source, &mut result);
    Ok(result)
}

/// Carry animation metadata from `source` onto an upscaled `result`, with the
/// page height rescaled to the output.
pub fn copy_page_metadata(source: &Bitmap, result: &mut Bitmap) {
    let Some(pages) = source.pages() else {
        return;
    };
    if pages.page_count == 0 {
        return;
    }
    result.set_pages(Some(PageMetadata {
        page_count: pages.page_count,
        page_height: result.height() / pages.page_count,
        delays_ms: pages.delays_ms.clone(),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(width: u32, height: u32) -> Bitmap {
        let pixels = (0..width * height)
            .flat_map(|i| {
                let (x, y) = (i % width, i / width);
                [(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8]
            })
            .collect();
        Bitmap::from_raw(pixels, width, height, 3).unwrap()
    }

    fn nearest_x2(tile: &Bitmap) -> Result<Bitmap> {
        let (w, h) = (tile.width() * 2, tile.height() * 2);
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for x in 0..w {
                let src = (((y / 2) * tile.width() + x / 2) * 3) as usize;
                pixels.extend_from_slice(&tile.pixels()[src..src + 3]);
            }
        }
        Bitmap::from_raw(pixels, w, h, 3)
    }

    #[test]
    fn grid_600_by_256_has_clipped_edges() {
        let grid = TileGrid::new(600, 600, 256).unwrap();
        assert_eq!((grid.across(), grid.down()), (3, 3));
        let tiles = grid.tiles();
        assert_eq!(tiles.len(), 9);
        assert_eq!(tiles[0], Rect::new(0, 0, 256, 256));
        assert_eq!(tiles[2], Rect::new(512, 0, 88, 256));
        assert_eq!(tiles[6], Rect::new(0, 512, 256, 88));
        assert_eq!(tiles[8], Rect::new(512, 512, 88, 88));
    }

    #[test]
    fn grid_covers_image_exactly_once() {
        for (w, h, t) in [
            (600, 600, 256),
            (17, 5, 4),
            (1, 1, 64),
            (513, 255, 256),
            (64, 64, 64),
        ] {
            let grid = TileGrid::new(w, h, t).unwrap();
            let mut hits = vec![0u8; (w * h) as usize];
            for rect in grid.tiles() {
                for y in rect.y..rect.y + rect.height {
                    for x in rect.x..rect.x + rect.width {
                        hits[(y * w + x) as usize] += 1;
                    }
                }
            }
            assert!(hits.iter().all(|&n| n == 1), "{w}x{h}/{t}");

            let first_row: u32 = grid.tiles()[..grid.across()].iter().map(|r| r.width).sum();
            let first_col: u32 = grid
                .tiles()
                .iter()
                .step_by(grid.across())
                .map(|r| r.height)
                .sum();
            assert_eq!((first_row, first_col), (w, h));
        }
    }

    #[test]
    fn zero_tile_size_is_rejected() {
        assert!(TileGrid::new(10, 10, 0).is_err());
    }

    #[test]
    fn tiled_matches_whole_image_inference() {
        let image = source(600, 600);
        let mut calls = 0;
        let tiled = tiled_inference(&image, 256, |tile| {
            calls += 1;
            nearest_x2(tile)
        })
        .unwrap();
        assert_eq!(calls, 9);
        assert_eq!((tiled.width(), tiled.height()), (1200, 1200));
        assert_eq!(tiled, nearest_x2(&image).unwrap());
    }

    #[test]
    fn tile_failure_stops_processing() {
        let image = source(100, 100);
        let mut calls = 0;
        let err = tiled_inference(&image, 40, |tile| {
            calls += 1;
            if calls == 4 {
                Err(UpscaleError::inference("boom"))
            } else {
                nearest_x2(tile)
            }
        })
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(calls, 4);
    }

    #[test]
    fn page_metadata_is_rescaled() {
        let mut image = source(40, 80);
        image.set_pages(Some(PageMetadata {
            page_count: 2,
            page_height: 40,
            delays_ms: vec![100, 150],
        }));
        let out = tiled_inference(&image, 32, nearest_x2).unwrap();
        let pages = out.pages().unwrap();
        assert_eq!(pages.page_count, 2);
        assert_eq!(pages.page_height, 80);
        assert_eq!(pages.delays_ms, vec![100, 150]);
    }
}
