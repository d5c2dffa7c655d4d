//! Heuristic stand-in for a vision-language model.
//!
//! The engine looks at a downsampled RGB thumbnail of the frame and streams a
//! short description of its brightness, dominant colour, contrast and light
//! direction, one word per token.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use image::{RgbImage, imageops::FilterType};
use tracing::{debug, info};
use video_ingest::Frame;
use vision::{EngineError, GenerateControl, InferenceEngine, Token};

const THUMBNAIL: u32 = 32;

/// Every word the describer can produce; token ids index into this table.
const VOCAB: &[&str] = &[
    "a", "dark", "dim", "well-lit", "bright", "scene", "with", "mostly", "neutral", "grey",
    "red", "orange", "yellow", "green", "cyan", "blue", "purple", "magenta", "tones", "and",
    "high", "low", "contrast", "light", "from", "the", "left", "right", "above", "below",
    "evenly", "lit",
];

/// Summary statistics of a frame thumbnail, all in `0.0..=1.0` except `hue`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneStats {
    pub luma: f32,
    pub contrast: f32,
    pub saturation: f32,
    /// Mean hue in degrees, weighted by saturation.
    pub hue: f32,
    pub left: f32,
    pub right: f32,
    pub top: f32,
    pub bottom: f32,
}

pub struct SceneInput {
    prompt: String,
    stats: SceneStats,
}

pub struct SceneSummaryEngine {
    warmup: Duration,
    token_delay: Duration,
    loaded: AtomicBool,
}

impl SceneSummaryEngine {
    pub fn new(warmup: Duration, token_delay: Duration) -> Self {
        Self {
            warmup,
            token_delay,
            loaded: AtomicBool::new(false),
        }
    }

    fn token_of(word: &str) -> Result<Token, EngineError> {
        VOCAB
            .iter()
            .position(|candidate| *candidate == word)
            .map(|index| index as Token)
            .ok_or_else(|| EngineError::Generate(format!("word {word:?} missing from vocabulary")))
    }
}

impl InferenceEngine for SceneSummaryEngine {
    type Input = SceneInput;

    fn ensure_loaded(&self) -> Result<(), EngineError> {
        if self.loaded.load(Ordering::SeqCst) {
            return Ok(());
        }
        info!(warmup_ms = self.warmup.as_millis() as u64, "warming up scene describer");
        thread::sleep(self.warmup);
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn prepare_input(&self, prompt: &str, frame: &Frame) -> Result<SceneInput, EngineError> {
        let stats = scene_stats(frame)?;
        debug!(?stats, "prepared scene input");
        Ok(SceneInput {
            prompt: prompt.to_string(),
            stats,
        })
    }

    fn generate(
        &self,
        input: SceneInput,
        max_tokens: usize,
        on_token: &mut dyn FnMut(&[Token]) -> GenerateControl,
    ) -> Result<String, EngineError> {
        debug!(prompt = %input.prompt, "describing scene");
        let words = describe(&input.stats);
        let mut tokens = Vec::with_capacity(words.len());
        for word in words.into_iter().take(max_tokens) {
            thread::sleep(self.token_delay);
            tokens.push(Self::token_of(word)?);
            if on_token(&tokens) == GenerateControl::Stop {
                break;
            }
        }
        Ok(self.decode(&tokens))
    }

    fn decode(&self, tokens: &[Token]) -> String {
        let words: Vec<&str> = tokens
            .iter()
            .filter_map(|token| VOCAB.get(*token as usize).copied())
            .collect();
        words.join(" ")
    }
}

/// Normalise the frame to RGB, shrink it and measure it.
pub fn scene_stats(frame: &Frame) -> Result<SceneStats, EngineError> {
    let rgb = frame
        .to_rgb8()
        .map_err(|err| EngineError::Prepare(err.to_string()))?;
    let image = RgbImage::from_raw(frame.width as u32, frame.height as u32, rgb)
        .ok_or_else(|| EngineError::Prepare("frame does not fit its dimensions".into()))?;
    let thumb = image::imageops::resize(&image, THUMBNAIL, THUMBNAIL, FilterType::Triangle);

    let half = THUMBNAIL / 2;
    let mut sum = 0.0f32;
    let mut sum_sq = 0.0f32;
    let mut sat_sum = 0.0f32;
    let (mut hue_x, mut hue_y) = (0.0f32, 0.0f32);
    let (mut left, mut right, mut top, mut bottom) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);

    for (x, y, pixel) in thumb.enumerate_pixels() {
        let [r, g, b] = pixel.0.map(|channel| channel as f32 / 255.0);
        let luma = 0.299 * r + 0.587 * g + 0.114 * b;
        sum += luma;
        sum_sq += luma * luma;

        let (hue, saturation) = hue_saturation(r, g, b);
        sat_sum += saturation;
        hue_x += saturation * hue.to_radians().cos();
        hue_y += saturation * hue.to_radians().sin();

        if x < half { left += luma } else { right += luma }
        if y < half { top += luma } else { bottom += luma }
    }

    let count = (THUMBNAIL * THUMBNAIL) as f32;
    let halves = count / 2.0;
    let luma = sum / count;
    Ok(SceneStats {
        luma,
        contrast: (sum_sq / count - luma * luma).max(0.0).sqrt(),
        saturation: sat_sum / count,
        hue: hue_y.atan2(hue_x).to_degrees().rem_euclid(360.0),
        left: left / halves,
        right: right / halves,
        top: top / halves,
        bottom: bottom / halves,
    })
}

fn hue_saturation(r: f32, g: f32, b: f32) -> (f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    if delta <= f32::EPSILON {
        return (0.0, 0.0);
    }
    let hue = if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    (hue, delta / max)
}

fn hue_name(hue: f32) -> &'static str {
    match hue {
        h if h < 15.0 => "red",
        h if h < 45.0 => "orange",
        h if h < 70.0 => "yellow",
        h if h < 160.0 => "green",
        h if h < 200.0 => "cyan",
        h if h < 255.0 => "blue",
        h if h < 290.0 => "purple",
        h if h < 340.0 => "magenta",
        _ => "red",
    }
}

/// Words describing the scene, at most fifteen.
pub fn describe(stats: &SceneStats) -> Vec<&'static str> {
    let mut words = vec!["a"];
    words.push(match stats.luma {
        l if l < 0.2 => "dark",
        l if l < 0.45 => "dim",
        l if l < 0.75 => "well-lit",
        _ => "bright",
    });
    words.extend(["scene", "with", "mostly"]);
    if stats.saturation < 0.15 {
        words.extend(["neutral", "grey"]);
    } else {
        words.push(hue_name(stats.hue));
    }
    words.push("tones");

    if stats.contrast > 0.25 {
        words.extend(["and", "high", "contrast"]);
    } else if stats.contrast < 0.05 {
        words.extend(["and", "low", "contrast"]);
    }

    let horizontal = stats.left - stats.right;
    let vertical = stats.top - stats.bottom;
    if horizontal.abs() > 0.1 && horizontal.abs() >= vertical.abs() {
        words.extend(["light", "from", "the", if horizontal > 0.0 { "left" } else { "right" }]);
    } else if vertical.abs() > 0.1 {
        words.extend(["light", "from", if vertical > 0.0 { "above" } else { "below" }]);
    }
    words.truncate(15);
    words
}
