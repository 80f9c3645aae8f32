use crate::common::{FaceAuthError, Result, Config};
use ort::{Environment, Session, SessionBuilder, Value, GraphOptimizationLevel};
use std::sync::Arc;
use image::{DynamicImage, imageops::FilterType};
use ndarray::{Array4, CowArray};

const NMS_IOU_THRESHOLD: f32 = 0.45;
const MAX_FACES: usize = 5;
const MIN_BOX_SIDE: f32 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Crops the box out of `image`, clamped to the image bounds. Returns
    /// `None` when nothing of the box lies inside the image.
    pub fn crop(&self, image: &DynamicImage) -> Option<DynamicImage> {
        let x = self.x1.max(0.0) as u32;
        let y = self.y1.max(0.0) as u32;
        if x >= image.width() || y >= image.height() {
            return None;
        }
        let width = (self.width().max(1.0) as u32).min(image.width() - x);
        let height = (self.height().max(1.0) as u32).min(image.height() - y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(image.crop_imm(x, y, width, height))
    }
}

/// Largest box by area; the first one wins ties.
pub fn largest_face(faces: &[FaceBox]) -> Option<&FaceBox> {
    faces.iter().fold(None, |best: Option<&FaceBox>, face| match best {
        Some(b) if b.area() >= face.area() => Some(b),
        _ => Some(face),
    })
}

/// Face localisation backend.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>>;
}

/// YOLO-style single-class face detector running through ONNX Runtime.
pub struct OnnxFaceDetector {
    session: Session,
    _environment: Arc<Environment>,
    input_width: u32,
    input_height: u32,
    confidence_threshold: f32,
}

impl OnnxFaceDetector {
    pub fn new(config: &Config) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_detector")
                .build()
                .map_err(|e| FaceAuthError::Model(format!("Failed to create environment: {}", e)))?
        );

        let model_path = &config.detector.model_path;
        if !model_path.exists() {
            return Err(FaceAuthError::Model(
                format!("Detector model not found at: {:?}", model_path)
            ));
        }

        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_model_from_file(model_path)?;

        tracing::info!("Loaded face detector from {}", model_path.display());

        Ok(Self {
            session,
            _environment: environment,
            input_width: config.detector.input_width,
            input_height: config.detector.input_height,
            confidence_threshold: config.auth.detection_confidence,
        })
    }

    fn image_to_array(&self, img: &DynamicImage) -> Array4<f32> {
        let gray = img.to_luma8();
        let width = gray.width() as usize;
        let height = gray.height() as usize;
        let raw = gray.as_raw();
        let mut array = Array4::<f32>::zeros((1, 3, height, width));

        let norm_factor = 1.0 / 255.0;
        for y in 0..height {
            let row_offset = y * width;
            for x in 0..width {
                let pixel_value = raw[row_offset + x] as f32 * norm_factor;
                array[[0, 0, y, x]] = pixel_value;
                array[[0, 1, y, x]] = pixel_value;
                array[[0, 2, y, x]] = pixel_value;
            }
        }

        array
    }

    fn parse_detections(&self, outputs: &[Value]) -> Result<Vec<FaceBox>> {
        let mut faces = Vec::new();

        let Some(first) = outputs.first() else {
            return Ok(faces);
        };
        let output = first.try_extract::<f32>()?.view().to_owned();
        let shape = output.shape().to_vec();
        let data = output
            .as_slice()
            .ok_or_else(|| FaceAuthError::Model("Detector output is not contiguous".into()))?;

        // [1, N, 5] or transposed [1, 5, N]; each prediction is cx, cy, w, h, score
        let (num_predictions, prediction_length, is_transposed) = match shape.len() {
            3 if shape[2] > shape[1] && shape[1] <= 10 => (shape[2], shape[1], true),
            3 => (shape[1], shape[2], false),
            2 => (shape[0], shape[1], false),
            _ => {
                tracing::warn!("Unexpected detector output shape: {:?}", shape);
                return Ok(faces);
            }
        };
        if prediction_length < 5 {
            tracing::warn!("Detector output has no score column: {:?}", shape);
            return Ok(faces);
        }

        let input_w = self.input_width as f32;
        let input_h = self.input_height as f32;

        for i in 0..num_predictions {
            let at = |field: usize| {
                if is_transposed {
                    data[field * num_predictions + i]
                } else {
                    data[i * prediction_length + field]
                }
            };
            let (cx, cy, w, h, confidence) = (at(0), at(1), at(2), at(3), at(4));

            if confidence <= 0.001 {
                continue;
            }

            // Normalised coordinates are scaled up to pixel space
            let scale = if cx > 1.0 || cy > 1.0 || w > 1.0 || h > 1.0 { 1.0 } else { input_w };
            let (cx, cy, w, h) = (cx * scale, cy * scale, w * scale, h * scale);

            let x1 = (cx - w / 2.0).max(0.0);
            let y1 = (cy - h / 2.0).max(0.0);
            let x2 = (cx + w / 2.0).min(input_w);
            let y2 = (cy + h / 2.0).min(input_h);

            if x2 - x1 > MIN_BOX_SIDE && y2 - y1 > MIN_BOX_SIDE {
                faces.push(FaceBox { x1, y1, x2, y2, confidence });
            }
        }

        let mut faces = apply_nms(faces, NMS_IOU_THRESHOLD);
        faces.retain(|face| face.confidence >= self.confidence_threshold);
        faces.truncate(MAX_FACES);
        Ok(faces)
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let orig_width = image.width() as f32;
        let orig_height = image.height() as f32;

        let img_array = if image.width() == self.input_width && image.height() == self.input_height {
            self.image_to_array(image)
        } else {
            let resized = image.resize_exact(self.input_width, self.input_height, FilterType::Nearest);
            self.image_to_array(&resized)
        };

        let cow_array = CowArray::from(img_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let mut faces = self.parse_detections(&outputs)?;

        let scale_x = orig_width / self.input_width as f32;
        let scale_y = orig_height / self.input_height as f32;
        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
        }

        tracing::debug!("Detected {} face(s) in {}x{} image", faces.len(), image.width(), image.height());
        Ok(faces)
    }
}

/// Greedy non-maximum suppression; output is sorted by confidence.
pub fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| calculate_iou(kept, &candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

pub fn calculate_iou(box1: &FaceBox, box2: &FaceBox) -> f32 {
    let x1 = box1.x1.max(box2.x1);
    let y1 = box1.y1.max(box2.y1);
    let x2 = box1.x2.min(box2.x2);
    let y2 = box1.y2.min(box2.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = box1.area() + box2.area() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
