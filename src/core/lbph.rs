use crate::common::{FaceAuthError, Result};
use crate::common::config::RecognizerConfig;
use crate::core::vision::{FaceModel, FaceSample, Prediction, MAX_DISTANCE};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

const MODEL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self::from(&RecognizerConfig::default())
    }
}

impl From<&RecognizerConfig> for LbphParams {
    fn from(config: &RecognizerConfig) -> Self {
        Self {
            radius: config.radius,
            neighbors: config.neighbors,
            grid_x: config.grid_x,
            grid_y: config.grid_y,
        }
    }
}

/// Local binary pattern histogram recogniser. Nearest neighbour over
/// spatial histograms with a chi-square distance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    version: u32,
    params: LbphParams,
    histograms: Vec<(i32, Vec<f32>)>,
}

impl LbphModel {
    pub fn train(params: LbphParams, samples: &[(i32, &FaceSample)]) -> Result<Self> {
        let mut histograms = Vec::with_capacity(samples.len());
        for (label, sample) in samples {
            histograms.push((*label, spatial_histogram(&params, &sample.to_luma()?)?));
        }

        Ok(Self {
            version: MODEL_VERSION,
            params,
            histograms,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let model: LbphModel = bincode::deserialize(bytes)
            .map_err(|e| FaceAuthError::Storage(format!("Failed to deserialize model: {}", e)))?;
        if model.version != MODEL_VERSION {
            return Err(FaceAuthError::Storage(format!(
                "Unsupported model version {}", model.version
            )));
        }
        Ok(model)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.histograms.len()
    }
}

impl FaceModel for LbphModel {
    fn predict(&self, sample: &FaceSample) -> Result<Prediction> {
        if self.histograms.is_empty() {
            return Ok(Prediction { label: -1, distance: MAX_DISTANCE });
        }

        let query = spatial_histogram(&self.params, &sample.to_luma()?)?;
        let mut best = Prediction { label: -1, distance: f64::MAX };
        for (label, hist) in &self.histograms {
            let distance = chi_square(hist, &query);
            if distance < best.distance {
                best = Prediction { label: *label, distance };
            }
        }
        Ok(best)
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// Circular extended LBP codes. Output is `(codes, width, height)`, shrunk by
/// the radius on every side.
fn extended_lbp(src: &GrayImage, radius: u32, neighbors: u32) -> (Vec<u32>, usize, usize) {
    let (w, h) = (src.width() as i64, src.height() as i64);
    let r = radius as i64;
    let out_w = (w - 2 * r).max(0) as usize;
    let out_h = (h - 2 * r).max(0) as usize;
    let mut codes = vec![0u32; out_w * out_h];
    let px = |x: i64, y: i64| src.get_pixel(x as u32, y as u32)[0] as f32;

    for n in 0..neighbors {
        let angle = 2.0 * PI * n as f32 / neighbors as f32;
        let x = radius as f32 * angle.cos();
        let y = -(radius as f32) * angle.sin();
        let (fx, fy) = (x.floor(), y.floor());
        let (cx, cy) = (x.ceil(), y.ceil());
        let (tx, ty) = (x - fx, y - fy);
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;
        let (fx, fy, cx, cy) = (fx as i64, fy as i64, cx as i64, cy as i64);

        for i in r..h - r {
            for j in r..w - r {
                let t = w1 * px(j + fx, i + fy)
                    + w2 * px(j + cx, i + fy)
                    + w3 * px(j + fx, i + cy)
                    + w4 * px(j + cx, i + cy);
                let center = px(j, i);
                if t > center || (t - center).abs() < f32::EPSILON {
                    codes[(i - r) as usize * out_w + (j - r) as usize] |= 1 << n;
                }
            }
        }
    }

    (codes, out_w, out_h)
}

fn spatial_histogram(params: &LbphParams, image: &GrayImage) -> Result<Vec<f32>> {
    let (codes, width, height) = extended_lbp(image, params.radius, params.neighbors);
    let bins = 1usize << params.neighbors;
    let grid_x = params.grid_x as usize;
    let grid_y = params.grid_y as usize;
    let cell_w = width / grid_x;
    let cell_h = height / grid_y;
    if cell_w == 0 || cell_h == 0 {
        return Err(FaceAuthError::Model(format!(
            "Sample of {}x{} is too small for a {}x{} LBP grid",
            image.width(), image.height(), grid_x, grid_y
        )));
    }

    let mut histogram = vec![0f32; grid_x * grid_y * bins];
    for gy in 0..grid_y {
        for gx in 0..grid_x {
            let cell = &mut histogram[(gy * grid_x + gx) * bins..][..bins];
            for y in gy * cell_h..(gy + 1) * cell_h {
                for &code in &codes[y * width + gx * cell_w..][..cell_w] {
                    cell[code as usize] += 1.0;
                }
            }
            let total = (cell_w * cell_h) as f32;
            cell.iter_mut().for_each(|v| *v /= total);
        }
    }

    Ok(histogram)
}

fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| {
            let (x, y) = (x as f64, y as f64);
            let denom = x + y;
            if denom.abs() > f64::EPSILON {
                (x - y) * (x - y) / denom
            } else {
                0.0
            }
        })
        .sum();
    2.0 * sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn sample_from_fn(f: impl Fn(u32, u32) -> u8) -> FaceSample {
        FaceSample::from_gray(GrayImage::from_fn(64, 64, |x, y| Luma([f(x, y)])))
    }

    fn checker() -> FaceSample {
        sample_from_fn(|x, y| if (x / 4 + y / 4) % 2 == 0 { 230 } else { 20 })
    }

    fn stripes() -> FaceSample {
        sample_from_fn(|x, _| if x % 2 == 0 { 255 } else { 0 })
    }

    #[test]
    fn empty_model_predicts_unknown() {
        let model = LbphModel::train(LbphParams::default(), &[]).unwrap();
        let prediction = model.predict(&checker()).unwrap();
        assert_eq!(prediction.label, -1);
        assert_eq!(prediction.distance, MAX_DISTANCE);
    }

    #[test]
    fn identical_sample_has_zero_distance() {
        let sample = checker();
        let model = LbphModel::train(LbphParams::default(), &[(7, &sample)]).unwrap();
        let prediction = model.predict(&sample).unwrap();
        assert_eq!(prediction.label, 7);
        assert!(prediction.distance.abs() < 1e-9);
    }

    #[test]
    fn nearest_label_wins() {
        let a = checker();
        let b = stripes();
        let model = LbphModel::train(LbphParams::default(), &[(1, &a), (2, &b)]).unwrap();
        assert_eq!(model.predict(&a).unwrap().label, 1);
        assert_eq!(model.predict(&b).unwrap().label, 2);
    }

    #[test]
    fn unrelated_patterns_are_far_apart() {
        let model = LbphModel::train(LbphParams::default(), &[(1, &checker())]).unwrap();
        let distance = model.predict(&stripes()).unwrap().distance;
        assert!(distance >= 70.0, "distance was {}", distance);
    }

    #[test]
    fn model_bytes_round_trip() {
        let a = checker();
        let model = LbphModel::train(LbphParams::default(), &[(3, &a)]).unwrap();
        let restored = LbphModel::from_bytes(&model.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.predict(&stripes()).unwrap(), model.predict(&stripes()).unwrap());
    }

    #[test]
    fn too_small_sample_is_rejected() {
        let tiny = FaceSample::from_gray(GrayImage::new(6, 6));
        assert!(LbphModel::train(LbphParams::default(), &[(1, &tiny)]).is_err());
    }

    #[test]
    fn chi_square_is_symmetric() {
        let a = [0.5, 0.5, 0.0];
        let b = [0.0, 0.5, 0.5];
        assert!((chi_square(&a, &b) - chi_square(&b, &a)).abs() < 1e-12);
        assert!((chi_square(&a, &b) - 2.0).abs() < 1e-9);
    }
}
