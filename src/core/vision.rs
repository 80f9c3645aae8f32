//! Face detection and recognition capability used by the authentication
//! engine and the template store.
//!
//! The engine never looks at pixels itself: it asks a [`Vision`] to find
//! faces, normalise them into [`FaceSample`]s and build [`FaceModel`]s from
//! labelled samples. [`LocalVision`] is the bundled implementation (ONNX
//! detector + LBPH recogniser).

use crate::common::{Config, FaceAuthError, Result};
use crate::common::config::RecognizerConfig;
use crate::core::detector::{FaceBox, FaceDetector, OnnxFaceDetector};
use crate::core::lbph::{LbphModel, LbphParams};
use image::{DynamicImage, GrayImage, ImageBuffer, imageops::FilterType};
use serde::{Deserialize, Serialize};

/// Label reserved for throwaway comparison models. User ids are always > 0.
pub const COMPARE_SENTINEL_ID: i32 = -999;

/// Distance reported when there is nothing to compare against.
pub const MAX_DISTANCE: f64 = 9999.0;

const BLUR_SIGMA: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb8,
}

impl PixelFormat {
    pub fn tag(self) -> i32 {
        match self {
            PixelFormat::Gray8 => 0,
            PixelFormat::Rgb8 => 16,
        }
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            0 => Some(PixelFormat::Gray8),
            16 => Some(PixelFormat::Rgb8),
            _ => None,
        }
    }

    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// Raw row-major pixels of a normalised face.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceSample {
    pub rows: u32,
    pub cols: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl FaceSample {
    pub fn new(rows: u32, cols: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let expected = rows as usize * cols as usize * format.channels();
        if data.len() != expected {
            return Err(FaceAuthError::Storage(format!(
                "Sample of {}x{} {:?} needs {} bytes, got {}",
                rows, cols, format, expected, data.len()
            )));
        }
        Ok(Self { rows, cols, format, data })
    }

    pub fn from_gray(image: GrayImage) -> Self {
        Self {
            rows: image.height(),
            cols: image.width(),
            format: PixelFormat::Gray8,
            data: image.into_raw(),
        }
    }

    pub fn to_luma(&self) -> Result<GrayImage> {
        let invalid = || FaceAuthError::Storage("Sample buffer does not match its dimensions".into());
        match self.format {
            PixelFormat::Gray8 => {
                ImageBuffer::from_raw(self.cols, self.rows, self.data.clone()).ok_or_else(invalid)
            }
            PixelFormat::Rgb8 => {
                let rgb: image::RgbImage =
                    ImageBuffer::from_raw(self.cols, self.rows, self.data.clone()).ok_or_else(invalid)?;
                Ok(DynamicImage::ImageRgb8(rgb).to_luma8())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: i32,
    pub distance: f64,
}

/// A trained recogniser. Built by [`Vision::train_model`], never mutated.
pub trait FaceModel: Send + Sync {
    fn predict(&self, sample: &FaceSample) -> Result<Prediction>;
    fn to_bytes(&self) -> Result<Vec<u8>>;
}

pub trait Vision: Send + Sync {
    fn detect_faces(&self, image: &DynamicImage) -> Result<Vec<FaceBox>>;

    /// Fixed-size resize, grayscale, noise reduction and contrast
    /// normalisation.
    fn preprocess(&self, region: &DynamicImage) -> Result<FaceSample>;

    fn train_model(&self, samples: &[(i32, &FaceSample)]) -> Result<Box<dyn FaceModel>>;

    fn load_model(&self, bytes: &[u8]) -> Result<Box<dyn FaceModel>>;

    /// Distance between two normalised samples, computed on a disposable
    /// model that only knows `reference`.
    fn compare(&self, reference: &FaceSample, probe: &FaceSample) -> Result<f64> {
        let model = self.train_model(&[(COMPARE_SENTINEL_ID, reference)])?;
        Ok(model.predict(probe)?.distance)
    }
}

/// Shared preprocessing pipeline.
pub fn normalize_face(region: &DynamicImage, size: u32) -> FaceSample {
    let resized = region.resize_exact(size, size, FilterType::CatmullRom);
    let gray = resized.to_luma8();
    let blurred = imageproc::filter::gaussian_blur_f32(&gray, BLUR_SIGMA);
    let equalized = imageproc::contrast::equalize_histogram(&blurred);
    FaceSample::from_gray(equalized)
}

pub struct LocalVision {
    detector: Box<dyn FaceDetector>,
    sample_size: u32,
    params: LbphParams,
}

impl LocalVision {
    pub fn new(config: &Config) -> Result<Self> {
        let detector = OnnxFaceDetector::new(config)?;
        Ok(Self::with_detector(Box::new(detector), &config.recognizer))
    }

    pub fn with_detector(detector: Box<dyn FaceDetector>, recognizer: &RecognizerConfig) -> Self {
        Self {
            detector,
            sample_size: recognizer.sample_size,
            params: LbphParams::from(recognizer),
        }
    }
}

impl Vision for LocalVision {
    fn detect_faces(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        self.detector.detect(image)
    }

    fn preprocess(&self, region: &DynamicImage) -> Result<FaceSample> {
        if region.width() == 0 || region.height() == 0 {
            return Err(FaceAuthError::NoFaceDetected);
        }
        Ok(normalize_face(region, self.sample_size))
    }

    fn train_model(&self, samples: &[(i32, &FaceSample)]) -> Result<Box<dyn FaceModel>> {
        Ok(Box::new(LbphModel::train(self.params, samples)?))
    }

    fn load_model(&self, bytes: &[u8]) -> Result<Box<dyn FaceModel>> {
        Ok(Box::new(LbphModel::from_bytes(bytes)?))
    }
}
