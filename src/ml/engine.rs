use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ValueEnum;
use image::{DynamicImage, GenericImageView, GrayImage};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, warn};

use crate::ml::pipeline::{self, Normalization};
use crate::ml::session::{BackgroundModel, ModelLoader};
use crate::utils::config;

/// Segmentation networks the service knows how to feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum ModelKind {
    #[value(name = "u2net")]
    U2net,
    #[value(name = "u2netp")]
    U2netp,
    #[value(name = "u2net_human_seg")]
    U2netHumanSeg,
    #[value(name = "silueta")]
    Silueta,
    #[value(name = "isnet-general-use")]
    IsnetGeneralUse,
}

impl ModelKind {
    pub fn name(self) -> &'static str {
        match self {
            ModelKind::U2net => "u2net",
            ModelKind::U2netp => "u2netp",
            ModelKind::U2netHumanSeg => "u2net_human_seg",
            ModelKind::Silueta => "silueta",
            ModelKind::IsnetGeneralUse => "isnet-general-use",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.onnx", self.name())
    }

    /// Side of the square input tensor the network expects.
    pub fn input_size(self) -> u32 {
        match self {
            ModelKind::IsnetGeneralUse => 1024,
            _ => 320,
        }
    }

    pub fn normalization(self) -> Normalization {
        match self {
            ModelKind::IsnetGeneralUse => Normalization {
                mean: [0.5, 0.5, 0.5],
                std: [1.0, 1.0, 1.0],
            },
            _ => Normalization {
                mean: [0.485, 0.456, 0.406],
                std: [0.229, 0.224, 0.225],
            },
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Backend ONNX Runtime runs the network on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum ExecutionProvider {
    #[value(name = "cpu")]
    Cpu,
    #[value(name = "cuda")]
    Cuda,
    #[value(name = "coreml")]
    CoreMl,
}

impl ExecutionProvider {
    pub fn name(self) -> &'static str {
        match self {
            ExecutionProvider::Cpu => "cpu",
            ExecutionProvider::Cuda => "cuda",
            ExecutionProvider::CoreMl => "coreml",
        }
    }

    fn dispatch(self) -> ExecutionProviderDispatch {
        match self {
            ExecutionProvider::Cpu => CPUExecutionProvider::default().build(),
            ExecutionProvider::Cuda => CUDAExecutionProvider::default().build(),
            ExecutionProvider::CoreMl => CoreMLExecutionProvider::default().build(),
        }
    }
}

impl fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct InferenceEngine {
    session: Session,
    model: ModelKind,
}

impl InferenceEngine {
    pub fn new(
        model_path: &Path,
        model: ModelKind,
        provider: ExecutionProvider,
        intra_threads: usize,
    ) -> Result<Self> {
        // Later calls find the environment already committed; that is not an error for us.
        if let Err(e) = ort::init().with_name("bg-remover").commit() {
            warn!("ONNX Runtime environment not committed: {}", e);
        }

        let session = Session::builder()?
            .with_execution_providers([provider.dispatch()])?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load model from {}", model_path.display()))?;

        Ok(Self { session, model })
    }

    /// Runs the network and returns an alpha mask the size of `image`.
    pub fn predict_mask(&self, image: &DynamicImage) -> Result<GrayImage> {
        let (width, height) = image.dimensions();
        let input = pipeline::normalize_for_model(
            image,
            self.model.input_size(),
            &self.model.normalization(),
        );

        let tensor = Tensor::from_array(input).context("Failed to build input tensor")?;
        let outputs = self
            .session
            .run(ort::inputs![tensor]?)
            .context("Model inference failed")?;
        let prediction = outputs[0]
            .try_extract_tensor::<f32>()
            .context("Failed to read model output")?;

        debug!("Prediction shape {:?} for {}x{} input", prediction.shape(), width, height);
        pipeline::mask_from_prediction(prediction.view(), width, height)
    }
}

impl BackgroundModel for InferenceEngine {
    fn remove_background(&self, image: &[u8]) -> Result<Vec<u8>> {
        let decoded = image::load_from_memory(image).context("Failed to decode image")?;
        let mask = self.predict_mask(&decoded)?;
        let cutout = pipeline::apply_mask(&decoded, &mask)?;
        pipeline::encode_png(cutout)
    }
}

/// Builds ONNX-backed models from `.onnx` files on disk.
pub struct OnnxModelLoader {
    model_path: Option<PathBuf>,
    intra_threads: usize,
}

impl OnnxModelLoader {
    pub fn new(model_path: Option<PathBuf>, intra_threads: usize) -> Self {
        Self {
            model_path,
            intra_threads,
        }
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(
        &self,
        model: ModelKind,
        provider: ExecutionProvider,
    ) -> Result<Arc<dyn BackgroundModel>> {
        let path = config::resolve_model_path(model, self.model_path.as_deref())?;
        let engine = InferenceEngine::new(&path, model, provider, self.intra_threads)?;
        Ok(Arc::new(engine))
    }
}
