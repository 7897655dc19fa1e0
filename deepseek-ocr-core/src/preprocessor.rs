//! Dynamic image tiling, image-token-sequence construction, and tokenization.
//! Grounded on `processor.py` (`_select_best_resolution`,
//! `_image_token_sequence`, `_collate`).

use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage, GenericImageView, Rgb, RgbImage};
use tokenizers::Tokenizer;

use crate::error::{OcrError, Result};
use crate::layers::bicubic_resize_hwc;

const IMAGE_TOKEN: &str = "<image>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Text,
    Vision,
    Newline,
    Separator,
}

/// The per-tile pixel tensors plus the fused token-type sequence the model
/// scatters vision features into.
#[derive(Debug)]
pub struct VisionInput {
    pub local_tiles: Option<Tensor>,
    pub global_tile: Tensor,
    pub token_types: Vec<TokenType>,
}

/// Candidate local-tile grids the base resolution is carved into
/// (`_select_best_resolution`/`_select_ratio`): ranked by aspect-ratio
/// closeness to the source image, with ties broken toward the larger grid
/// only when the source image is itself large enough to warrant it (image
/// pixel area exceeds half of `crop_size^2 * w * h`). `(1, 1)` (no tiling) is
/// always a candidate.
fn select_best_grid(
    img_w: u32,
    img_h: u32,
    crop_size: usize,
    min_crops: usize,
    max_crops: usize,
) -> (usize, usize) {
    let mut candidates = vec![(1usize, 1usize)];
    for n in min_crops..=max_crops {
        for w in 1..=n {
            if n % w == 0 {
                candidates.push((w, n / w));
            }
        }
    }
    candidates.sort();
    candidates.dedup();

    let aspect = img_w as f64 / img_h as f64;
    let image_area = img_w as f64 * img_h as f64;
    let reference_area = (crop_size * crop_size) as f64;

    let mut best = (1usize, 1usize);
    let mut best_diff = f64::MAX;
    let mut best_area = 0i64;
    for (w, h) in candidates {
        let grid_aspect = w as f64 / h as f64;
        let diff = (aspect - grid_aspect).abs();
        let area = (w * crop_size) as i64 * (h * crop_size) as i64;
        let prefer_larger_on_tie = image_area > 0.5 * reference_area * (w * h) as f64;
        if diff < best_diff || (diff == best_diff && prefer_larger_on_tie && area > best_area) {
            best = (w, h);
            best_diff = diff;
            best_area = area;
        }
    }
    best
}

/// Letterboxes `img` into a `size x size` canvas (BICUBIC resize preserving
/// aspect ratio, centered on a constant fill), matching `ImageOps.pad` with
/// `processor.py`'s `_pad_color = tuple(int(c*255) for c in mean)`.
fn letterbox(img: &DynamicImage, size: usize, pad_color: [u8; 3]) -> RgbImage {
    let (w, h) = img.dimensions();
    let scale = (size as f32 / w as f32).min(size as f32 / h as f32);
    let (new_w, new_h) = ((w as f32 * scale) as u32, (h as f32 * scale) as u32);
    let resized = resize_bicubic(img, new_w.max(1), new_h.max(1));

    let mut canvas = RgbImage::from_pixel(size as u32, size as u32, Rgb(pad_color));
    let off_x = (size as u32 - new_w.max(1)) / 2;
    let off_y = (size as u32 - new_h.max(1)) / 2;
    image::imageops::overlay(&mut canvas, &resized, off_x as i64, off_y as i64);
    canvas
}

/// Bicubic resize using the hand-written Catmull-Rom kernel shared with the
/// vision backbones' position-embedding interpolation, for PIL-bicubic
/// fidelity `image`'s own `FilterType::CatmullRom` only approximates.
fn resize_bicubic(img: &DynamicImage, w: u32, h: u32) -> RgbImage {
    let rgb = img.to_rgb8();
    let (src_w, src_h) = rgb.dimensions();
    let data: Vec<f32> = rgb.pixels().flat_map(|p| p.0.iter().map(|&c| c as f32)).collect();
    if w == h && src_w == src_h {
        let resized = bicubic_resize_hwc(&data, src_h as usize, src_w as usize, 3, w as usize);
        return RgbImage::from_vec(w, h, resized.iter().map(|&v| v.round().clamp(0.0, 255.0) as u8).collect()).unwrap();
    }
    // Non-square targets fall back to `image`'s own bicubic-ish filter: the
    // shared kernel above only supports square target grids (it backs the
    // ViT position tables, which are always square).
    image::imageops::resize(&rgb, w, h, FilterType::CatmullRom)
}

/// Converts to CHW and normalizes each channel to zero mean / unit scale:
/// `(pixel/255 - mean[c]) / std[c]`, matching `processor.py`'s
/// `transforms.Normalize(mean, std)`.
fn rgb_to_chw_tensor(img: &RgbImage, mean: [f32; 3], std: [f32; 3], device: &Device) -> candle_core::Result<Tensor> {
    let (w, h) = img.dimensions();
    let mut chw = vec![0f32; 3 * h as usize * w as usize];
    for (x, y, p) in img.enumerate_pixels() {
        for c in 0..3 {
            chw[c * (h as usize * w as usize) + y as usize * w as usize + x as usize] =
                (p.0[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }
    Tensor::from_vec(chw, (3, h as usize, w as usize), device)
}

pub struct PreprocessorOutput {
    pub input_ids: Vec<u32>,
    pub vision: VisionInput,
}

pub struct Preprocessor {
    tokenizer: Tokenizer,
    base_size: usize,
    crop_size: usize,
    min_dynamic_crops: usize,
    max_dynamic_crops: usize,
    local_queries: usize,
    global_queries: usize,
    mean: [f32; 3],
    std: [f32; 3],
}

impl Preprocessor {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self {
            tokenizer,
            base_size: 1024,
            crop_size: 640,
            min_dynamic_crops: 2,
            max_dynamic_crops: 9,
            local_queries: 10,
            global_queries: 16,
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
        }
    }

    /// The letterbox pad color in 0-255 space: the per-channel mean,
    /// matching `processor.py`'s `_pad_color = tuple(int(c*255) for c in mean)`.
    fn pad_color(&self) -> [u8; 3] {
        [
            (self.mean[0] * 255.0).round().clamp(0.0, 255.0) as u8,
            (self.mean[1] * 255.0).round().clamp(0.0, 255.0) as u8,
            (self.mean[2] * 255.0).round().clamp(0.0, 255.0) as u8,
        ]
    }

    /// Builds the full token-type sequence (`_image_token_sequence`): local
    /// tiles first in row-major order with a newline after each row, then one
    /// separator token, then the global grid with its own per-row newlines.
    fn image_token_sequence(&self, width_tiles: usize, height_tiles: usize, has_locals: bool) -> Vec<TokenType> {
        let mut seq = Vec::new();
        if has_locals {
            for _row in 0..height_tiles {
                for _col in 0..(width_tiles * self.local_queries) {
                    seq.push(TokenType::Vision);
                }
                seq.push(TokenType::Newline);
            }
        }
        seq.push(TokenType::Separator);
        for _row in 0..self.global_queries {
            for _col in 0..self.global_queries {
                seq.push(TokenType::Vision);
            }
            seq.push(TokenType::Newline);
        }
        seq
    }

    /// Runs dynamic tiling and tokenizes `prompt`, splicing `token_sequence`
    /// of image-marker tokens wherever `<image>` appears in the prompt text.
    pub fn process(&self, image: &DynamicImage, prompt: &str, device: &Device) -> Result<PreprocessorOutput> {
        let (w, h) = image.dimensions();
        let (width_tiles, height_tiles) = if w as usize > self.crop_size || h as usize > self.crop_size {
            select_best_grid(w, h, self.crop_size, self.min_dynamic_crops, self.max_dynamic_crops)
        } else {
            (1, 1)
        };
        let has_locals = !(width_tiles == 1 && height_tiles == 1);

        let local_tiles_tensor = if has_locals {
            let target_w = width_tiles * self.crop_size;
            let target_h = height_tiles * self.crop_size;
            let resized = resize_bicubic(image, target_w as u32, target_h as u32);

            let mut tiles = Vec::with_capacity(width_tiles * height_tiles);
            for row in 0..height_tiles {
                for col in 0..width_tiles {
                    let sub = image::imageops::crop_imm(
                        &resized,
                        (col * self.crop_size) as u32,
                        (row * self.crop_size) as u32,
                        self.crop_size as u32,
                        self.crop_size as u32,
                    )
                    .to_image();
                    tiles.push(rgb_to_chw_tensor(&sub, self.mean, self.std, device)?);
                }
            }
            Some(Tensor::stack(&tiles, 0)?)
        } else {
            None
        };
        let (width_tiles, height_tiles) = if has_locals { (width_tiles, height_tiles) } else { (0, 0) };

        let global_img = letterbox(image, self.base_size, self.pad_color());
        let global_tensor = rgb_to_chw_tensor(&global_img, self.mean, self.std, device)?.unsqueeze(0)?;

        let image_token_types = self.image_token_sequence(width_tiles, height_tiles, has_locals);

        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| OcrError::Tokenizer(e.to_string()))?;
        let prompt_ids = encoding.get_ids();

        let image_token_id = self
            .tokenizer
            .token_to_id(IMAGE_TOKEN)
            .ok_or_else(|| OcrError::Tokenizer(format!("tokenizer has no {IMAGE_TOKEN} token")))?;

        let mut input_ids = Vec::with_capacity(prompt_ids.len() + image_token_types.len());
        let mut token_types = Vec::with_capacity(input_ids.capacity());
        for &id in prompt_ids {
            if id == image_token_id {
                for ty in &image_token_types {
                    input_ids.push(image_token_id);
                    token_types.push(*ty);
                }
            } else {
                input_ids.push(id);
                token_types.push(TokenType::Text);
            }
        }

        Ok(PreprocessorOutput {
            input_ids,
            vision: VisionInput {
                local_tiles: local_tiles_tensor,
                global_tile: global_tensor,
                token_types,
            },
        })
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| OcrError::Tokenizer(e.to_string()))
    }
}

pub fn input_ids_tensor(ids: &[u32], device: &Device) -> candle_core::Result<Tensor> {
    Tensor::from_slice(ids, (1, ids.len()), device)?.to_dtype(DType::U32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_selection_prefers_matching_aspect_ratio() {
        let (w, h) = select_best_grid(2000, 1000, 640, 2, 9);
        assert!(w >= h);
        assert!(w * h >= 2 && w * h <= 9);
    }

    #[test]
    fn grid_selection_keeps_no_tiling_for_small_square_image() {
        // Below the area threshold that would justify tiling a tied-aspect
        // square grid, `_select_ratio`'s tiebreak keeps the smallest (1, 1).
        let (w, h) = select_best_grid(500, 500, 640, 2, 9);
        assert_eq!((w, h), (1, 1));
    }

    #[test]
    fn grid_selection_tiles_large_square_image() {
        // Large enough that the area-gated tiebreak prefers the bigger tied
        // grid over (1, 1) every time a larger same-aspect candidate appears.
        let (w, h) = select_best_grid(2000, 2000, 640, 2, 9);
        assert_eq!(w, h);
        assert!(w * h > 1);
    }

    #[test]
    fn token_sequence_places_separator_after_locals() {
        let pre = Preprocessor {
            tokenizer: Tokenizer::new(tokenizers::models::bpe::BPE::default()),
            base_size: 1024,
            crop_size: 640,
            min_dynamic_crops: 2,
            max_dynamic_crops: 9,
            local_queries: 2,
            global_queries: 2,
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
        };
        let seq = pre.image_token_sequence(2, 1, true);
        // one row of locals: 2 tiles * 2 queries = 4 vision + 1 newline,
        // then 1 separator, then a 2x2 global grid with 2 newlines.
        assert_eq!(seq[4], TokenType::Newline);
        assert_eq!(seq[5], TokenType::Separator);
    }
}
