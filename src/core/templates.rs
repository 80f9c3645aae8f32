//! Per-user face templates and the classifier built from them.
//!
//! Every `train` appends one sample and rebuilds the classifier from the full
//! sample set, then writes both the sample archive and the classifier to the
//! models directory. The state sits behind a `RwLock`: training holds the
//! write half for the whole append/rebuild/persist sequence, lookups take the
//! read half.

use crate::common::{FaceAuthError, Result};
use crate::core::vision::{FaceModel, FaceSample, PixelFormat, Prediction, Vision, MAX_DISTANCE};
use image::DynamicImage;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const SAMPLE_ARCHIVE_FILE: &str = "training_data.dat";
pub const MODEL_FILE: &str = "face_model.bin";

// Upper bound on a single archived sample, guards against corrupt headers.
const MAX_SAMPLE_BYTES: u64 = 64 * 1024 * 1024;

pub type TemplateSet = BTreeMap<i32, Vec<FaceSample>>;

#[derive(Default)]
struct TemplateState {
    samples: TemplateSet,
    model: Option<Box<dyn FaceModel>>,
}

pub struct FaceTemplateStore {
    vision: Arc<dyn Vision>,
    archive_path: PathBuf,
    model_path: PathBuf,
    state: RwLock<TemplateState>,
}

impl FaceTemplateStore {
    /// Opens the store in `models_dir`. Starts empty when either artifact is
    /// missing; fails when both exist but cannot be read.
    pub fn open(vision: Arc<dyn Vision>, models_dir: &Path) -> Result<Self> {
        fs::create_dir_all(models_dir)?;
        let archive_path = models_dir.join(SAMPLE_ARCHIVE_FILE);
        let model_path = models_dir.join(MODEL_FILE);

        let state = if archive_path.exists() && model_path.exists() {
            let file = fs::File::open(&archive_path)?;
            let samples = read_archive(&mut BufReader::new(file))?;
            let model = vision.load_model(&fs::read(&model_path)?)?;
            tracing::info!(
                "Loaded {} face template(s) for {} user(s)",
                samples.values().map(Vec::len).sum::<usize>(),
                samples.len()
            );
            TemplateState { samples, model: Some(model) }
        } else {
            tracing::info!("No trained face model in {}, starting untrained", models_dir.display());
            TemplateState::default()
        };

        Ok(Self {
            vision,
            archive_path,
            model_path,
            state: RwLock::new(state),
        })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, TemplateState> {
        // Training never leaves the state half-updated, so a poisoned lock is still usable
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, TemplateState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Preprocesses a raw face region and trains on it.
    pub fn train(&self, user_id: i32, region: &DynamicImage) -> Result<usize> {
        let sample = self.vision.preprocess(region)?;
        self.train_sample(user_id, sample)
    }

    /// Appends an already normalised sample and rebuilds the classifier.
    /// Returns the user's sample count afterwards.
    pub fn train_sample(&self, user_id: i32, sample: FaceSample) -> Result<usize> {
        let mut state = self.write_state();
        self.train_locked(&mut state, user_id, sample)
    }

    /// Trains only when `user_id` has no samples yet. Returns whether it trained.
    pub fn train_sample_if_absent(&self, user_id: i32, sample: FaceSample) -> Result<bool> {
        let mut state = self.write_state();
        if state.samples.get(&user_id).is_some_and(|s| !s.is_empty()) {
            return Ok(false);
        }
        self.train_locked(&mut state, user_id, sample)?;
        Ok(true)
    }

    fn train_locked(&self, state: &mut TemplateState, user_id: i32, sample: FaceSample) -> Result<usize> {
        state.samples.entry(user_id).or_default().push(sample);

        // The new model only replaces the old one once both artifacts are on disk
        let trained = self
            .rebuild(&state.samples)
            .and_then(|model| self.persist(&state.samples, model.as_ref()).map(|_| model));
        let model = match trained {
            Ok(model) => model,
            Err(e) => {
                if let Some(list) = state.samples.get_mut(&user_id) {
                    list.pop();
                    if list.is_empty() {
                        state.samples.remove(&user_id);
                    }
                }
                return Err(e);
            }
        };
        state.model = Some(model);

        let count = state.samples.get(&user_id).map_or(0, Vec::len);
        tracing::info!(
            "Trained face model for user {} ({} sample(s), {} total)",
            user_id,
            count,
            state.samples.values().map(Vec::len).sum::<usize>()
        );
        Ok(count)
    }

    fn rebuild(&self, samples: &TemplateSet) -> Result<Box<dyn FaceModel>> {
        let labeled: Vec<(i32, &FaceSample)> = samples
            .iter()
            .flat_map(|(id, list)| list.iter().map(move |s| (*id, s)))
            .collect();
        self.vision.train_model(&labeled)
    }

    /// Stages both files before renaming either, so a failed write leaves
    /// the previous pair in place.
    fn persist(&self, samples: &TemplateSet, model: &dyn FaceModel) -> Result<()> {
        let mut archive = Vec::new();
        write_archive(&mut archive, samples)?;
        let model_bytes = model.to_bytes()?;

        let archive_tmp = write_staged(&self.archive_path, &archive)?;
        let model_tmp = match write_staged(&self.model_path, &model_bytes) {
            Ok(tmp) => tmp,
            Err(e) => {
                let _ = fs::remove_file(&archive_tmp);
                return Err(e);
            }
        };
        fs::rename(&archive_tmp, &self.archive_path)?;
        fs::rename(&model_tmp, &self.model_path)?;
        Ok(())
    }

    /// Writes the current state to disk.
    pub fn save(&self) -> Result<()> {
        let state = self.read_state();
        match state.model.as_ref() {
            Some(model) => self.persist(&state.samples, model.as_ref()),
            None => Ok(()),
        }
    }

    /// Closest enrolled user for a raw face region.
    pub fn recognize(&self, region: &DynamicImage) -> Result<Prediction> {
        let sample = self.vision.preprocess(region)?;
        self.recognize_sample(&sample)
    }

    pub fn recognize_sample(&self, sample: &FaceSample) -> Result<Prediction> {
        let state = self.read_state();
        match state.model.as_ref() {
            Some(model) if !state.samples.is_empty() => model.predict(sample),
            _ => Ok(Prediction { label: -1, distance: MAX_DISTANCE }),
        }
    }

    /// Distance between two normalised samples. Leaves the store untouched.
    pub fn compare(&self, reference: &FaceSample, probe: &FaceSample) -> Result<f64> {
        let _state = self.read_state();
        self.vision.compare(reference, probe)
    }

    pub fn has_samples(&self, user_id: i32) -> bool {
        self.sample_count(user_id) > 0
    }

    pub fn sample_count(&self, user_id: i32) -> usize {
        self.read_state().samples.get(&user_id).map_or(0, Vec::len)
    }

    pub fn user_count(&self) -> usize {
        self.read_state().samples.len()
    }

    pub fn samples(&self, user_id: i32) -> Vec<FaceSample> {
        self.read_state().samples.get(&user_id).cloned().unwrap_or_default()
    }
}

fn write_staged(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let tmp = path.with_extension("tmp");
    let mut file = BufWriter::new(fs::File::create(&tmp)?);
    file.write_all(bytes)?;
    file.flush()?;
    Ok(tmp)
}

/// Serialises the sample set: user count, then per user id and sample count,
/// then per sample rows, cols, pixel format tag and the raw row-major pixels.
pub fn write_archive<W: Write>(out: &mut W, samples: &TemplateSet) -> Result<()> {
    out.write_all(&(samples.len() as u64).to_le_bytes())?;
    for (user_id, list) in samples {
        out.write_all(&user_id.to_le_bytes())?;
        out.write_all(&(list.len() as u64).to_le_bytes())?;
        for sample in list {
            out.write_all(&(sample.rows as u64).to_le_bytes())?;
            out.write_all(&(sample.cols as u64).to_le_bytes())?;
            out.write_all(&sample.format.tag().to_le_bytes())?;
            out.write_all(&sample.data)?;
        }
    }
    Ok(())
}

pub fn read_archive<R: Read>(input: &mut R) -> Result<TemplateSet> {
    let mut samples = TemplateSet::new();

    let user_count = read_u64(input)?;
    for _ in 0..user_count {
        let user_id = read_i32(input)?;
        let sample_count = read_u64(input)?;
        let mut list = Vec::new();
        for _ in 0..sample_count {
            let rows = read_u64(input)?;
            let cols = read_u64(input)?;
            let tag = read_i32(input)?;
            let format = PixelFormat::from_tag(tag)
                .ok_or_else(|| FaceAuthError::Storage(format!("Unknown pixel format tag {}", tag)))?;

            let len = rows
                .checked_mul(cols)
                .and_then(|n| n.checked_mul(format.channels() as u64))
                .filter(|&n| n <= MAX_SAMPLE_BYTES)
                .ok_or_else(|| FaceAuthError::Storage(format!("Sample of {}x{} is too large", rows, cols)))?;

            let mut data = vec![0u8; len as usize];
            read_exact(input, &mut data)?;
            list.push(FaceSample::new(rows as u32, cols as u32, format, data)?);
        }
        samples.insert(user_id, list);
    }

    Ok(samples)
}

fn read_exact<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<()> {
    input.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FaceAuthError::Storage("Sample archive is truncated".into()),
        _ => FaceAuthError::Io(e),
    })
}

fn read_u64<R: Read>(input: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(input, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i32<R: Read>(input: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    read_exact(input, &mut buf)?;
    Ok(i32::from_le_bytes(buf))
}
