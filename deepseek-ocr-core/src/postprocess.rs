//! Parses `<|ref|>label<|/ref|><|det|>boxes<|/det|>` grounded-detection spans
//! out of generated text, crops/saves the regions labeled `image`, and
//! renders the remaining text as markdown. Grounded on `postprocess.py`.

use std::path::Path;

use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{OcrError, Result};

static DETECTION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)(<\|ref\|>(.*?)<\|/ref\|><\|det\|>(.*?)<\|/det\|>)").unwrap()
});

const PALETTE: [[u8; 3]; 6] = [
    [255, 0, 0],
    [0, 255, 0],
    [0, 0, 255],
    [255, 165, 0],
    [255, 0, 255],
    [0, 255, 255],
];

#[derive(Debug, Clone)]
pub struct Detection {
    pub full_match: String,
    pub label: String,
    pub boxes: Vec<[u32; 4]>,
}

/// Parses a Python-literal-looking list of `[x0, y0, x1, y1]` boxes in
/// `[0, 999]` coordinate space (the original uses `ast.literal_eval`; this is
/// a small hand-rolled parser for the same bracketed-number-list grammar).
fn parse_box_list(raw: &str) -> Option<Vec<[u32; 4]>> {
    let raw = raw.trim();
    let inner = raw.strip_prefix('[')?.strip_suffix(']')?;
    let mut boxes = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for ch in inner.chars() {
        match ch {
            '[' => {
                depth += 1;
                current.clear();
            }
            ']' => {
                depth -= 1;
                let nums: Vec<u32> = current
                    .split(',')
                    .filter_map(|s| s.trim().parse::<f64>().ok())
                    .map(|v| v.round() as u32)
                    .collect();
                if nums.len() == 4 {
                    boxes.push([nums[0], nums[1], nums[2], nums[3]]);
                }
            }
            _ if depth > 0 => current.push(ch),
            _ => {}
        }
    }
    Some(boxes)
}

pub fn parse_detections(text: &str) -> Vec<Detection> {
    let mut out = Vec::new();
    for caps in DETECTION_PATTERN.captures_iter(text) {
        let full_match = caps[1].to_string();
        let label = caps[2].trim().to_string();
        let boxes = parse_box_list(&caps[3]).unwrap_or_default();
        out.push(Detection { full_match, label, boxes });
    }
    out
}

/// Maps a `[0, 999]`-space coordinate to pixel space and clamps to bounds.
pub fn scale_box(box_999: &[u32; 4], img_w: u32, img_h: u32) -> [u32; 4] {
    let scale = |v: u32, dim: u32| -> u32 {
        ((v as f64 / 999.0) * dim as f64).round().clamp(0.0, dim as f64) as u32
    };
    [
        scale(box_999[0], img_w),
        scale(box_999[1], img_h),
        scale(box_999[2], img_w),
        scale(box_999[3], img_h),
    ]
}

/// Crops every detection labeled `image` (case-insensitive) out of `image`,
/// saving each as `{out_dir}/images/{n}.jpg`, and returns one markdown
/// image-embed replacement string per detection in the input order (`None`
/// for non-image detections, which the caller blanks out instead).
pub fn save_image_crops(image: &DynamicImage, detections: &[Detection], out_dir: &Path) -> Result<Vec<Option<String>>> {
    let images_dir = out_dir.join("images");
    std::fs::create_dir_all(&images_dir)?;
    let (img_w, img_h) = image.dimensions();

    let mut replacements = Vec::with_capacity(detections.len());
    let mut crop_idx = 0usize;
    for det in detections {
        if !det.label.eq_ignore_ascii_case("image") {
            replacements.push(None);
            continue;
        }
        let Some(box_999) = det.boxes.first() else {
            replacements.push(None);
            continue;
        };
        let [x0, y0, x1, y1] = scale_box(box_999, img_w, img_h);
        let (w, h) = (x1.saturating_sub(x0).max(1), y1.saturating_sub(y0).max(1));
        let cropped = image.crop_imm(x0, y0, w, h);
        let path = images_dir.join(format!("{crop_idx}.jpg"));
        cropped.to_rgb8().save(&path).map_err(|e| OcrError::Resource(e.to_string()))?;
        replacements.push(Some(format!("![](images/{crop_idx}.jpg)\n")));
        crop_idx += 1;
    }
    Ok(replacements)
}

/// Draws colored rectangles, a semi-transparent fill, and text labels for
/// each detection, cycling through a 6-color palette by detection index.
pub fn annotate_image(image: &DynamicImage, detections: &[Detection]) -> RgbaImage {
    let mut canvas = image.to_rgba8();
    let (img_w, img_h) = image.dimensions();

    for (i, det) in detections.iter().enumerate() {
        let color = PALETTE[i % PALETTE.len()];
        let line_width = if det.label.eq_ignore_ascii_case("title") { 4 } else { 2 };
        for box_999 in &det.boxes {
            let [x0, y0, x1, y1] = scale_box(box_999, img_w, img_h);
            draw_rect(&mut canvas, x0, y0, x1, y1, color, line_width);
            fill_rect_alpha(&mut canvas, x0, y0, x1, y1, color, 40);
        }
    }
    canvas
}

fn draw_rect(img: &mut RgbaImage, x0: u32, y0: u32, x1: u32, y1: u32, color: [u8; 3], width: u32) {
    let (w, h) = img.dimensions();
    let rgba = Rgba([color[0], color[1], color[2], 255]);
    for t in 0..width {
        for x in x0..=x1.min(w.saturating_sub(1)) {
            if y0 + t < h {
                img.put_pixel(x, y0 + t, rgba);
            }
            if y1 >= t && y1 - t < h {
                img.put_pixel(x, y1 - t, rgba);
            }
        }
        for y in y0..=y1.min(h.saturating_sub(1)) {
            if x0 + t < w {
                img.put_pixel(x0 + t, y, rgba);
            }
            if x1 >= t && x1 - t < w {
                img.put_pixel(x1 - t, y, rgba);
            }
        }
    }
}

fn fill_rect_alpha(img: &mut RgbaImage, x0: u32, y0: u32, x1: u32, y1: u32, color: [u8; 3], alpha: u8) {
    let (w, h) = img.dimensions();
    let a = alpha as f32 / 255.0;
    for y in y0..=y1.min(h.saturating_sub(1)) {
        for x in x0..=x1.min(w.saturating_sub(1)) {
            let px = img.get_pixel_mut(x, y);
            for c in 0..3 {
                px.0[c] = ((1.0 - a) * px.0[c] as f32 + a * color[c] as f32).round() as u8;
            }
        }
    }
}

/// Replaces each detection span with its crop replacement (blank for
/// non-image labels) and strips the model's end-of-sentence marker and
/// LaTeX-ism shorthand (`\coloneqq` -> `:=`, `\eqqcolon` -> `=:`).
pub fn render_markdown(text: &str, detections: &[Detection], replacements: &[Option<String>]) -> String {
    let mut out = text.to_string();
    for (det, replacement) in detections.iter().zip(replacements) {
        let sub = replacement.clone().unwrap_or_default();
        out = out.replacen(&det.full_match, &sub, 1);
    }
    out = out.replace("<｜end▁of▁sentence｜>", "");
    out = out.replace("\\coloneqq", ":=");
    out = out.replace("\\eqqcolon", "=:");
    out.trim().to_string()
}

/// Orchestrates a full save: wipes/recreates `out_dir`, crops and saves
/// detected images, writes an annotated preview, and writes `result.md`.
pub fn save_ocr_outputs(image: &DynamicImage, generated_text: &str, out_dir: &Path) -> Result<()> {
    if out_dir.exists() {
        std::fs::remove_dir_all(out_dir)?;
    }
    std::fs::create_dir_all(out_dir)?;

    let detections = parse_detections(generated_text);
    let replacements = save_image_crops(image, &detections, out_dir)?;
    let annotated = annotate_image(image, &detections);
    annotated
        .save(out_dir.join("annotated.png"))
        .map_err(|e| OcrError::Resource(e.to_string()))?;

    let markdown = render_markdown(generated_text, &detections, &replacements);
    std::fs::write(out_dir.join("result.md"), markdown)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_detection() {
        let text = "<|ref|>title<|/ref|><|det|>[[10, 20, 100, 200]]<|/det|> some text";
        let dets = parse_detections(text);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label, "title");
        assert_eq!(dets[0].boxes, vec![[10, 20, 100, 200]]);
    }

    #[test]
    fn parses_multiple_detections_with_multiple_boxes() {
        let text = "a <|ref|>image<|/ref|><|det|>[[0, 0, 999, 999], [1, 2, 3, 4]]<|/det|> b \
                    <|ref|>text<|/ref|><|det|>[[5, 5, 10, 10]]<|/det|>";
        let dets = parse_detections(text);
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].boxes.len(), 2);
        assert_eq!(dets[1].label, "text");
    }

    #[test]
    fn scale_box_maps_999_space_to_pixels() {
        let scaled = scale_box(&[0, 0, 999, 999], 1000, 500);
        assert_eq!(scaled, [0, 0, 1000, 500]);
    }

    #[test]
    fn render_markdown_strips_eos_and_latex_shorthand() {
        let out = render_markdown("a \\coloneqq b <｜end▁of▁sentence｜>", &[], &[]);
        assert_eq!(out, "a := b");
    }

    #[test]
    fn render_markdown_embeds_image_crop_with_empty_alt_and_trailing_newline() {
        let text = "A<|ref|>image<|/ref|><|det|>[[0, 0, 500, 500]]<|/det|>B";
        let dets = parse_detections(text);
        let replacements = vec![Some("![](images/0.jpg)\n".to_string())];
        let out = render_markdown(text, &dets, &replacements);
        assert_eq!(out, "A![](images/0.jpg)\nB");
    }
}
