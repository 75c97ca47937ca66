//! 8-bit raster used at the boundary of the upscaling pipeline.
//!
//! Decoding, encoding and resampling are delegated to the `image` crate. The
//! geometric helpers (crop, pad, grid join) are implemented directly on the
//! interleaved buffer because the tiling engine depends on their exact
//! placement rules.

use std::io::Cursor;

use image::codecs::gif::GifDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, ImageBuffer, ImageFormat};

use crate::error::{Result, UpscaleError};

/// Colour interpretation of a bitmap's bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interpretation {
    BlackWhite,
    Srgb,
    Histogram,
}

/// Multi-frame layout of an animated image decoded as a vertical strip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMetadata {
    pub page_count: u32,
    pub page_height: u32,
    /// Per-frame delay in milliseconds.
    pub delays_ms: Vec<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Where the original pixels are placed when a bitmap is padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Gravity {
    #[default]
    Centre,
    North,
    South,
    East,
    West,
    NorthEast,
    NorthWest,
    SouthEast,
    SouthWest,
}

impl Gravity {
    fn offsets(self, extra_w: u32, extra_h: u32) -> (u32, u32) {
        let (low, mid_w, high_w) = (0, extra_w / 2, extra_w);
        let (mid_h, high_h) = (extra_h / 2, extra_h);
        match self {
            Self::Centre => (mid_w, mid_h),
            Self::North => (mid_w, low),
            Self::South => (mid_w, high_h),
            Self::East => (high_w, mid_h),
            Self::West => (low, mid_h),
            Self::NorthEast => (high_w, low),
            Self::NorthWest => (low, low),
            Self::SouthEast => (high_w, high_h),
            Self::SouthWest => (low, high_h),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
    Jpeg,
    WebP,
}

impl OutputFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::WebP),
            _ => None,
        }
    }

    fn image_format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
            Self::WebP => ImageFormat::WebP,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    bands: u8,
    interpretation: Interpretation,
    pixels: Vec<u8>,
    pages: Option<PageMetadata>,
}

impl Bitmap {
    /// Wrap an interleaved 8-bit buffer.
    ///
    /// The interpretation is inferred from the band count (1-2 bands are
    /// black/white, 3-4 are sRGB); use [`Bitmap::with_format_of`] to re-tag a
    /// buffer carved from another bitmap.
    pub fn from_raw(pixels: Vec<u8>, width: u32, height: u32, bands: u8) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(UpscaleError::image(format!(
                "invalid bitmap dimensions {width}x{height}"
            )));
        }
        if !(1..=4).contains(&bands) {
            return Err(UpscaleError::image(format!(
                "unsupported band count {bands}"
            )));
        }
        let expected = width as usize * height as usize * bands as usize;
        if pixels.len() != expected {
            return Err(UpscaleError::image(format!(
                "pixel buffer length mismatch: expected {expected} ({width}x{height}x{bands}), got {}",
                pixels.len()
            )));
        }
        let interpretation = if bands <= 2 {
            Interpretation::BlackWhite
        } else {
            Interpretation::Srgb
        };
        Ok(Self {
            width,
            height,
            bands,
            interpretation,
            pixels,
            pages: None,
        })
    }

    pub fn with_interpretation(mut self, interpretation: Interpretation) -> Self {
        self.interpretation = interpretation;
        self
    }

    /// Copy band layout and interpretation from `source`.
    pub fn with_format_of(mut self, source: &Bitmap) -> Result<Self> {
        if self.bands != source.bands {
            return Err(UpscaleError::image(format!(
                "cannot re-tag {}-band buffer as {}-band image",
                self.bands, source.bands
            )));
        }
        self.interpretation = source.interpretation;
        Ok(self)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bands(&self) -> u8 {
        self.bands
    }

    pub fn interpretation(&self) -> Interpretation {
        self.interpretation
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    pub fn pages(&self) -> Option<&PageMetadata> {
        self.pages.as_ref()
    }

    pub fn set_pages(&mut self, pages: Option<PageMetadata>) {
        self.pages = pages;
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if matches!(image::guess_format(bytes), Ok(ImageFormat::Gif)) {
            if let Some(strip) = decode_gif_strip(bytes)? {
                return Ok(strip);
            }
        }
        let decoded = image::load_from_memory(bytes)?;
        Self::from_dynamic(decoded)
    }

    pub fn encode(&self, format: OutputFormat) -> Result<Vec<u8>> {
        let mut image = self.to_dynamic()?;
        if format == OutputFormat::Jpeg && image.color().has_alpha() {
            image = DynamicImage::ImageRgb8(image.to_rgb8());
        }
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, format.image_format())?;
        Ok(out.into_inner())
    }

    /// Lanczos3 resample to exactly `width` x `height`.
    pub fn resize(&self, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(UpscaleError::image(format!(
                "invalid resize target {width}x{height}"
            )));
        }
        let resized = self
            .to_dynamic()?
            .resize_exact(width, height, FilterType::Lanczos3);
        let mut out = Self::from_dynamic(resized)?.with_interpretation(self.interpretation);
        out.pages = self.pages.as_ref().map(|pages| PageMetadata {
            page_count: pages.page_count,
            page_height: height / pages.page_count.max(1),
            delays_ms: pages.delays_ms.clone(),
        });
        Ok(out)
    }

    /// Raw interleaved bytes of `rect`, without any format metadata.
    pub fn extract_region(&self, rect: Rect) -> Result<Vec<u8>> {
        self.check_rect(rect)?;
        let bands = self.bands as usize;
        let stride = self.width as usize * bands;
        let row_len = rect.width as usize * bands;
        let mut out = Vec::with_capacity(row_len * rect.height as usize);
        for row in rect.y..rect.y + rect.height {
            let start = row as usize * stride + rect.x as usize * bands;
            out.extend_from_slice(&self.pixels[start..start + row_len]);
        }
        Ok(out)
    }

    pub fn crop(&self, rect: Rect) -> Result<Self> {
        let region = self.extract_region(rect)?;
        Self::from_raw(region, rect.width, rect.height, self.bands)?.with_format_of(self)
    }

    /// Convert to sRGB: grey bands are replicated into RGB, alpha is kept.
    pub fn to_srgb(&self) -> Result<Self> {
        if self.interpretation == Interpretation::Srgb {
            return Ok(self.clone());
        }
        let (pixels, bands) = match self.bands {
            1 => (
                self.pixels.iter().flat_map(|&g| [g, g, g]).collect(),
                3,
            ),
            2 => (
                self.pixels
                    .chunks_exact(2)
                    .flat_map(|px| [px[0], px[0], px[0], px[1]])
                    .collect(),
                4,
            ),
            _ => (self.pixels.clone(), self.bands),
        };
        let mut out = Self::from_raw(pixels, self.width, self.height, bands)?
            .with_interpretation(Interpretation::Srgb);
        out.pages = self.pages.clone();
        Ok(out)
    }

    /// Drop the alpha band by blending over a black background.
    pub fn flatten_alpha(&self) -> Result<Self> {
        let colour_bands = match self.bands {
            2 => 1,
            4 => 3,
            _ => return Ok(self.clone()),
        };
        let bands = self.bands as usize;
        let mut pixels = Vec::with_capacity(self.pixel_count() as usize * colour_bands);
        for px in self.pixels.chunks_exact(bands) {
            let alpha = px[bands - 1] as u32;
            for &value in &px[..colour_bands] {
                pixels.push(((value as u32 * alpha + 127) / 255) as u8);
            }
        }
        let mut out = Self::from_raw(pixels, self.width, self.height, colour_bands as u8)?
            .with_interpretation(self.interpretation);
        out.pages = self.pages.clone();
        Ok(out)
    }

    /// Embed into a larger black canvas, placing the original by `gravity`.
    pub fn pad(&self, width: u32, height: u32, gravity: Gravity) -> Result<Self> {
        if width < self.width || height < self.height {
            return Err(UpscaleError::image(format!(
                "cannot pad {}x{} down to {width}x{height}",
                self.width, self.height
            )));
        }
        let (off_x, off_y) = gravity.offsets(width - self.width, height - self.height);
        let bands = self.bands as usize;
        let dst_stride = width as usize * bands;
        let src_stride = self.width as usize * bands;
        let mut pixels = vec![0u8; dst_stride * height as usize];
        for row in 0..self.height as usize {
            let dst = (row + off_y as usize) * dst_stride + off_x as usize * bands;
            let src = row * src_stride;
            pixels[dst..dst + src_stride].copy_from_slice(&self.pixels[src..src + src_stride]);
        }
        let mut out = Self::from_raw(pixels, width, height, self.bands)?.with_format_of(self)?;
        out.pages = self.pages.clone();
        Ok(out)
    }

    /// Lay `tiles` out on a grid `across` cells wide.
    ///
    /// Every cell is as large as the largest tile; each tile sits in the
    /// top-left corner of its cell and the remainder is black. A grid whose
    /// last row/column holds smaller tiles therefore comes out larger than
    /// the sum of the tile sizes.
    pub fn join_grid(tiles: &[Bitmap], across: usize) -> Result<Self> {
        let first = tiles
            .first()
            .ok_or_else(|| UpscaleError::image("cannot join an empty tile list"))?;
        if across == 0 {
            return Err(UpscaleError::image("grid must be at least one tile across"));
        }
        if let Some(odd) = tiles.iter().find(|t| t.bands != first.bands) {
            return Err(UpscaleError::image(format!(
                "cannot join tiles with {} and {} bands",
                first.bands, odd.bands
            )));
        }

        let columns = across.min(tiles.len());
        let rows = tiles.len().div_ceil(columns);
        let cell_w = tiles.iter().map(|t| t.width).max().unwrap_or(0) as usize;
        let cell_h = tiles.iter().map(|t| t.height).max().unwrap_or(0) as usize;
        let bands = first.bands as usize;
        let out_w = columns * cell_w;
        let out_h = rows * cell_h;
        let dst_stride = out_w * bands;

        let mut pixels = vec![0u8; dst_stride * out_h];
        for (index, tile) in tiles.iter().enumerate() {
            let origin_x = (index % columns) * cell_w;
            let origin_y = (index / columns) * cell_h;
            let src_stride = tile.width as usize * bands;
            for row in 0..tile.height as usize {
                let dst = (origin_y + row) * dst_stride + origin_x * bands;
                let src = row * src_stride;
                pixels[dst..dst + src_stride].copy_from_slice(&tile.pixels[src..src + src_stride]);
            }
        }

        Ok(Self::from_raw(pixels, out_w as u32, out_h as u32, first.bands)?
            .with_interpretation(first.interpretation))
    }

    fn check_rect(&self, rect: Rect) -> Result<()> {
        let fits = rect.width > 0
            && rect.height > 0
            && rect.x as u64 + rect.width as u64 <= self.width as u64
            && rect.y as u64 + rect.height as u64 <= self.height as u64;
        if fits {
            Ok(())
        } else {
            Err(UpscaleError::image(format!(
                "region {}x{}+{}+{} is outside {}x{} image",
                rect.width, rect.height, rect.x, rect.y, self.width, self.height
            )))
        }
    }

    fn from_dynamic(image: DynamicImage) -> Result<Self> {
        let (width, height) = (image.width(), image.height());
        let (pixels, bands) = match image {
            DynamicImage::ImageLuma8(buf) => (buf.into_raw(), 1),
            DynamicImage::ImageLumaA8(buf) => (buf.into_raw(), 2),
            DynamicImage::ImageRgb8(buf) => (buf.into_raw(), 3),
            DynamicImage::ImageRgba8(buf) => (buf.into_raw(), 4),
            other => {
                let color = other.color();
                if color.has_alpha() && color.has_color() {
                    (other.to_rgba8().into_raw(), 4)
                } else if color.has_alpha() {
                    (other.to_luma_alpha8().into_raw(), 2)
                } else if color.has_color() {
                    (other.to_rgb8().into_raw(), 3)
                } else {
                    (other.to_luma8().into_raw(), 1)
                }
            }
        };
        Self::from_raw(pixels, width, height, bands)
    }

    fn to_dynamic(&self) -> Result<DynamicImage> {
        let (w, h) = (self.width, self.height);
        let pixels = self.pixels.clone();
        let image = match self.bands {
            1 => ImageBuffer::from_raw(w, h, pixels).map(DynamicImage::ImageLuma8),
            2 => ImageBuffer::from_raw(w, h, pixels).map(DynamicImage::ImageLumaA8),
            3 => ImageBuffer::from_raw(w, h, pixels).map(DynamicImage::ImageRgb8),
            _ => ImageBuffer::from_raw(w, h, pixels).map(DynamicImage::ImageRgba8),
        };
        image.ok_or_else(|| UpscaleError::image("pixel buffer does not match image dimensions"))
    }
}

/// Page count and total height of a strip of `frames` pages.
fn strip_layout(page_height: u32, frames: usize) -> Result<(u32, u32)> {
    let too_tall = || {
        UpscaleError::image(format!(
            "animated GIF strip too tall: {frames} frames of height {page_height}"
        ))
    };
    let page_count = u32::try_from(frames).map_err(|_| too_tall())?;
    let height = page_height.checked_mul(page_count).ok_or_else(too_tall)?;
    Ok((page_count, height))
}

/// Decode an animated GIF into a vertical RGBA strip. Returns `None` for
/// single-frame files so they take the regular decode path.
fn decode_gif_strip(bytes: &[u8]) -> Result<Option<Bitmap>> {
    let decoder = GifDecoder::new(Cursor::new(bytes))?;
    let frames = decoder.into_frames().collect_frames()?;
    if frames.len() < 2 {
        return Ok(None);
    }

    let page_width = frames[0].buffer().width();
    let page_height = frames[0].buffer().height();
    let frame_len = page_width as usize * page_height as usize * 4;
    let mut pixels = Vec::with_capacity(frame_len * frames.len());
    let mut delays_ms = Vec::with_capacity(frames.len());
    for frame in &frames {
        let buffer = frame.buffer();
        if buffer.width() != page_width || buffer.height() != page_height {
            return Err(UpscaleError::image("animated GIF frames differ in size"));
        }
        pixels.extend_from_slice(buffer.as_raw());
        let (numer, denom) = frame.delay().numer_denom_ms();
        delays_ms.push((numer / denom.max(1)) as i32);
    }

    let (page_count, strip_height) = strip_layout(page_height, frames.len())?;
    let mut strip = Bitmap::from_raw(pixels, page_width, strip_height, 4)?;
    strip.set_pages(Some(PageMetadata {
        page_count,
        page_height,
        delays_ms,
    }));
    Ok(Some(strip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpscaleErrorKind;

    fn gradient(width: u32, height: u32, bands: u8) -> Bitmap {
        let len = width as usize * height as usize * bands as usize;
        let pixels = (0..len).map(|i| (i % 251) as u8).collect();
        Bitmap::from_raw(pixels, width, height, bands).unwrap()
    }

    #[test]
    fn from_raw_validates_length() {
        let err = Bitmap::from_raw(vec![0; 10], 2, 2, 3).unwrap_err();
        assert!(err.to_string().contains("expected 12"));
        assert!(Bitmap::from_raw(vec![], 0, 2, 3).is_err());
        assert!(Bitmap::from_raw(vec![0; 20], 2, 2, 5).is_err());
    }

    #[test]
    fn from_raw_infers_interpretation() {
        assert_eq!(
            gradient(2, 2, 1).interpretation(),
            Interpretation::BlackWhite
        );
        assert_eq!(gradient(2, 2, 3).interpretation(), Interpretation::Srgb);
    }

    #[test]
    fn crop_copies_expected_rows() {
        let image = gradient(4, 3, 1);
        let cropped = image.crop(Rect::new(1, 1, 2, 2)).unwrap();
        assert_eq!(cropped.width(), 2);
        assert_eq!(cropped.height(), 2);
        assert_eq!(cropped.pixels(), &[5, 6, 9, 10]);
    }

    #[test]
    fn crop_rejects_out_of_bounds() {
        let image = gradient(4, 4, 3);
        assert!(image.crop(Rect::new(3, 0, 2, 1)).is_err());
        assert!(image.crop(Rect::new(0, 0, 0, 1)).is_err());
    }

    #[test]
    fn to_srgb_replicates_grey() {
        let grey = Bitmap::from_raw(vec![10, 200], 2, 1, 1).unwrap();
        let rgb = grey.to_srgb().unwrap();
        assert_eq!(rgb.bands(), 3);
        assert_eq!(rgb.interpretation(), Interpretation::Srgb);
        assert_eq!(rgb.pixels(), &[10, 10, 10, 200, 200, 200]);

        let grey_alpha = Bitmap::from_raw(vec![7, 128], 1, 1, 2).unwrap();
        let rgba = grey_alpha.to_srgb().unwrap();
        assert_eq!(rgba.pixels(), &[7, 7, 7, 128]);
    }

    #[test]
    fn flatten_alpha_blends_over_black() {
        let rgba = Bitmap::from_raw(vec![255, 100, 0, 255, 200, 200, 200, 0], 2, 1, 4).unwrap();
        let flat = rgba.flatten_alpha().unwrap();
        assert_eq!(flat.bands(), 3);
        assert_eq!(flat.pixels(), &[255, 100, 0, 0, 0, 0]);

        let half = Bitmap::from_raw(vec![200, 200, 200, 128], 1, 1, 4).unwrap();
        assert_eq!(half.flatten_alpha().unwrap().pixels(), &[100, 100, 100]);
    }

    #[test]
    fn pad_west_keeps_left_edge_and_fills_black() {
        let image = Bitmap::from_raw(vec![1, 2, 3, 4, 5, 6], 3, 2, 1).unwrap();
        let padded = image.pad(4, 3, Gravity::West).unwrap();
        assert_eq!(padded.width(), 4);
        assert_eq!(padded.height(), 3);
        assert_eq!(
            padded.pixels(),
            &[1, 2, 3, 0, 4, 5, 6, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn pad_rejects_shrinking() {
        let image = gradient(4, 4, 3);
        assert!(image.pad(3, 4, Gravity::West).is_err());
    }

    #[test]
    fn join_grid_uses_largest_cell() {
        let big = Bitmap::from_raw(vec![9; 4], 2, 2, 1).unwrap();
        let small = Bitmap::from_raw(vec![7; 2], 1, 2, 1).unwrap();
        let joined = Bitmap::join_grid(&[big.clone(), small], 2).unwrap();
        assert_eq!(joined.width(), 4);
        assert_eq!(joined.height(), 2);
        assert_eq!(joined.pixels(), &[9, 9, 7, 0, 9, 9, 7, 0]);
    }

    #[test]
    fn join_grid_rejects_mixed_bands() {
        let grey = gradient(2, 2, 1);
        let rgb = gradient(2, 2, 3);
        assert!(Bitmap::join_grid(&[grey, rgb], 2).is_err());
        assert!(Bitmap::join_grid(&[], 2).is_err());
    }

    #[test]
    fn png_encode_decode_preserves_pixels() {
        let image = gradient(5, 3, 3);
        let bytes = image.encode(OutputFormat::Png).unwrap();
        let decoded = Bitmap::decode(&bytes).unwrap();
        assert_eq!(decoded, image);
    }

    #[test]
    fn resize_rescales_page_height() {
        let mut strip = gradient(4, 8, 3);
        strip.set_pages(Some(PageMetadata {
            page_count: 2,
            page_height: 4,
            delays_ms: vec![40, 60],
        }));
        let resized = strip.resize(8, 16).unwrap();
        assert_eq!(resized.width(), 8);
        assert_eq!(resized.height(), 16);
        let pages = resized.pages().unwrap();
        assert_eq!(pages.page_height, 8);
        assert_eq!(pages.delays_ms, vec![40, 60]);
    }

    #[test]
    fn strip_layout_rejects_overflowing_heights() {
        assert_eq!(strip_layout(10, 3).unwrap(), (3, 30));
        let err = strip_layout(65_535, 65_537).unwrap_err();
        assert_eq!(err.kind(), UpscaleErrorKind::ImageProcessing);
        assert!(strip_layout(1, usize::MAX).is_err());
    }

    #[test]
    fn output_format_from_extension() {
        assert_eq!(OutputFormat::from_extension("PNG"), Some(OutputFormat::Png));
        assert_eq!(OutputFormat::from_extension("jpg"), Some(OutputFormat::Jpeg));
        assert_eq!(OutputFormat::from_extension("webp"), Some(OutputFormat::WebP));
        assert_eq!(OutputFormat::from_extension("bmp"), None);
    }
}
