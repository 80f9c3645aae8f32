#![allow(dead_code)]

use facegate::common::{Config, Paths, Result};
use facegate::core::{AuthEngine, FaceBox, FaceDetector, FaceTemplateStore, LocalVision, Vision};
use facegate::storage::{FileUserStore, UserStore};
use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Treats dark images as faceless and everything else as one face filling
/// the frame. Counts calls.
pub struct StubDetector {
    calls: Arc<AtomicUsize>,
}

impl FaceDetector for StubDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let gray = image.to_luma8();
        let mean = gray.pixels().map(|p| p[0] as u64).sum::<u64>() / gray.pixels().len().max(1) as u64;
        if mean < 40 {
            return Ok(vec![]);
        }

        Ok(vec![FaceBox {
            x1: 0.0,
            y1: 0.0,
            x2: image.width() as f32,
            y2: image.height() as f32,
            confidence: 0.99,
        }])
    }
}

fn encode_jpeg(image: GrayImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(image)
        .write_to(&mut out, ImageOutputFormat::Jpeg(90))
        .unwrap();
    out.into_inner()
}

/// A bright textured image the stub detector accepts. Different seeds give
/// clearly different textures.
pub fn face_jpeg(seed: u32) -> Vec<u8> {
    encode_jpeg(GrayImage::from_fn(120, 120, |x, y| {
        let v = ((x * (seed + 3)) ^ (y * (2 * seed + 5))) % 160;
        Luma([(v + 80) as u8])
    }))
}

pub fn dark_jpeg() -> Vec<u8> {
    encode_jpeg(GrayImage::from_pixel(120, 120, Luma([8])))
}

pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub paths: Paths,
    pub detector_calls: Arc<AtomicUsize>,
    pub vision: Arc<dyn Vision>,
    pub users: Arc<FileUserStore>,
    pub templates: Arc<FaceTemplateStore>,
    pub engine: Arc<AuthEngine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(mut config: Config) -> Self {
        let dir = tempfile::tempdir().unwrap();
        config.storage.data_dir = dir.path().join("data");
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;

        let paths = Paths::new(&config.storage.data_dir);
        paths.bootstrap().unwrap();

        let detector_calls = Arc::new(AtomicUsize::new(0));
        let detector = StubDetector { calls: Arc::clone(&detector_calls) };
        let vision: Arc<dyn Vision> = Arc::new(LocalVision::with_detector(Box::new(detector), &config.recognizer));

        let users = Arc::new(FileUserStore::open(&paths, config.storage.retain_login_images).unwrap());
        let templates = Arc::new(FaceTemplateStore::open(Arc::clone(&vision), &paths.models_dir()).unwrap());
        let engine = Arc::new(AuthEngine::new(
            &config,
            paths.clone(),
            Arc::clone(&vision),
            Arc::clone(&users) as Arc<dyn UserStore>,
            Arc::clone(&templates),
        ));

        Self {
            dir,
            config,
            paths,
            detector_calls,
            vision,
            users,
            templates,
            engine,
        }
    }

    pub fn detector_calls(&self) -> usize {
        self.detector_calls.load(Ordering::SeqCst)
    }

    /// A fresh template store over the same models directory.
    pub fn reopen_templates(&self) -> FaceTemplateStore {
        FaceTemplateStore::open(Arc::clone(&self.vision), &self.paths.models_dir()).unwrap()
    }
}
