//! Final stage of the detector pipeline: score embedding windows against the
//! configured wake-word models and emit patience-gated predictions.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::{Result, VozError};
use crate::rollbuf::SyncRollBuffer;
use crate::runner::{Infer, Runner};
use crate::{Embedding, EMBEDDING_DIM, MAX_ERROR_ALLOWED};

pub const DEFAULT_NAME: &str = "no_name";
pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_PATIENCE: u32 = 1;

/// One wake-word model as configured on the command line:
/// `path[:name[:threshold[:patience]]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub path: PathBuf,
    pub name: String,
    pub threshold: f32,
    pub patience: u32,
}

impl ModelSpec {
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let path = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| VozError::Config(format!("empty model spec '{s}'")))?;
        let name = match parts.next() {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => DEFAULT_NAME.to_string(),
        };
        let threshold = match parts.next() {
            Some(t) => t
                .parse::<f32>()
                .map_err(|_| VozError::Config(format!("bad threshold in '{s}'")))?,
            None => DEFAULT_THRESHOLD,
        };
        if !(0.0..=1.0).contains(&threshold) {
            return Err(VozError::Config(format!(
                "threshold {} out of range in '{s}'",
                threshold
            )));
        }
        let patience = match parts.next() {
            Some(p) => p
                .parse::<u32>()
                .map_err(|_| VozError::Config(format!("bad patience in '{s}'")))?,
            None => DEFAULT_PATIENCE,
        };
        if patience == 0 {
            return Err(VozError::Config(format!("patience must be >= 1 in '{s}'")));
        }
        Ok(Self {
            path: PathBuf::from(path),
            name,
            threshold,
            patience,
        })
    }
}

/// Runtime state of one configured wake-word model.
pub struct WakeWordConfig {
    pub name: String,
    pub model_path: PathBuf,
    pub threshold: f32,
    pub patience: u32,
    /// Embeddings this model scores at once, from its input shape.
    pub window: usize,
    /// `max_window - window`: all models read from the tail of the shared
    /// feature window.
    pub offset: usize,
    patience_counter: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WakeWordPrediction {
    pub name: String,
    pub score: f32,
    pub count: u32,
}

struct WakeModel {
    cfg: WakeWordConfig,
    runner: Box<dyn Infer>,
}

pub struct WakeWordDetector {
    models: Vec<WakeModel>,
    max_window: usize,
    min_window: usize,
    input: Arc<SyncRollBuffer<Embedding>>,
    output: Arc<SyncRollBuffer<WakeWordPrediction>>,
    flat: Vec<f32>,
    errors: u32,
    windows: u64,
}

impl WakeWordDetector {
    /// Load every configured model and create the features buffer sized for
    /// the widest window. The buffer is handed to the feature stage as its
    /// output.
    pub fn new(
        specs: &[ModelSpec],
        output: Arc<SyncRollBuffer<WakeWordPrediction>>,
    ) -> Result<(Self, Arc<SyncRollBuffer<Embedding>>)> {
        if specs.is_empty() {
            return Err(VozError::Config("no wake-word models configured".into()));
        }
        let mut loaded: Vec<(ModelSpec, Box<dyn Infer>)> = Vec::with_capacity(specs.len());
        for spec in specs {
            let runner = Runner::load(&spec.path.to_string_lossy(), 1, false, None)?;
            loaded.push((spec.clone(), Box::new(runner)));
        }
        Self::with_models(loaded, output)
    }

    pub fn with_models(
        models: Vec<(ModelSpec, Box<dyn Infer>)>,
        output: Arc<SyncRollBuffer<WakeWordPrediction>>,
    ) -> Result<(Self, Arc<SyncRollBuffer<Embedding>>)> {
        let mut wake: Vec<WakeModel> = Vec::with_capacity(models.len());
        for (spec, runner) in models {
            let shape = runner.input_shape();
            let window = *shape.get(1).ok_or_else(|| {
                VozError::NotRunnable(format!(
                    "{}: input shape {:?} has no window axis",
                    spec.path.display(),
                    shape
                ))
            })?;
            if window == 0 {
                return Err(VozError::NotRunnable(format!(
                    "{}: zero-width feature window",
                    spec.path.display()
                )));
            }
            wake.push(WakeModel {
                cfg: WakeWordConfig {
                    name: spec.name,
                    model_path: spec.path,
                    threshold: spec.threshold,
                    patience: spec.patience,
                    window,
                    offset: 0,
                    patience_counter: 0,
                },
                runner,
            });
        }

        let max_window = wake.iter().map(|m| m.cfg.window).max().unwrap_or(1);
        let min_window = wake.iter().map(|m| m.cfg.window).min().unwrap_or(1);
        for m in &mut wake {
            m.cfg.offset = max_window - m.cfg.window;
        }
        log::debug!(
            "wake-word stage: {} model(s), window {}..={}",
            wake.len(),
            min_window,
            max_window
        );

        let features = Arc::new(SyncRollBuffer::new(max_window + 1, false));
        Ok((
            Self {
                models: wake,
                max_window,
                min_window,
                input: Arc::clone(&features),
                output,
                flat: Vec::with_capacity(max_window * EMBEDDING_DIM),
                errors: 0,
                windows: 0,
            },
            features,
        ))
    }

    pub fn max_window(&self) -> usize {
        self.max_window
    }

    pub fn min_window(&self) -> usize {
        self.min_window
    }

    /// Score one feature window with every model. Matches are appended to
    /// `matches` in configuration order.
    fn predict_window(
        models: &mut [WakeModel],
        flat: &mut Vec<f32>,
        features: &[Embedding],
        matches: &mut Vec<WakeWordPrediction>,
        errors: &mut u32,
    ) {
        for model in models.iter_mut() {
            let cfg = &mut model.cfg;
            if features.len() < cfg.offset + cfg.window {
                continue;
            }
            flat.clear();
            for emb in &features[cfg.offset..cfg.offset + cfg.window] {
                flat.extend_from_slice(emb);
            }
            let score = match model.runner.run(flat) {
                Ok(out) if !out.is_empty() => out[0],
                Ok(_) => {
                    *errors += 1;
                    log::warn!("{}: empty classifier output", cfg.name);
                    continue;
                }
                Err(e) => {
                    *errors += 1;
                    log::warn!("{}: {}", cfg.name, e);
                    continue;
                }
            };
            if score <= cfg.threshold {
                cfg.patience_counter = 0;
                continue;
            }
            cfg.patience_counter += 1;
            if cfg.patience_counter >= cfg.patience {
                matches.push(WakeWordPrediction {
                    name: cfg.name.clone(),
                    score,
                    count: cfg.patience_counter,
                });
            }
        }
    }

    pub fn run(&mut self) {
        let mut matches: Vec<WakeWordPrediction> = Vec::new();
        loop {
            let mut guard = self.input.wait_at_least(self.max_window);
            let status = guard.status();
            while guard.len() >= self.max_window {
                Self::predict_window(
                    &mut self.models,
                    &mut self.flat,
                    &guard.get()[..self.max_window],
                    &mut matches,
                    &mut self.errors,
                );
                self.windows += 1;
                guard.shift(1);
            }
            if status.reset {
                guard.release_and_signal();
            } else {
                guard.release();
            }

            if !matches.is_empty() {
                let mut out = self.output.lock();
                for m in matches.drain(..) {
                    out.append_one(m);
                }
                out.release();
                self.output.notify();
            }

            if status.cancel {
                break;
            }
            if status.reset {
                for m in &mut self.models {
                    m.cfg.patience_counter = 0;
                }
                self.output.reset();
            }
            if self.errors >= MAX_ERROR_ALLOWED {
                log::error!("wake-word stage giving up after {} errors", self.errors);
                break;
            }
        }
        log::debug!(
            "wake-word stage done: {} windows, {} errors",
            self.windows,
            self.errors
        );
        self.output.cancel();
    }
}

/// Run the wake-word stage on its own thread. Models load inside the thread;
/// the receiver yields the features buffer to wire into the feature stage, or
/// the setup error.
pub fn spawn(
    specs: Vec<ModelSpec>,
    output: Arc<SyncRollBuffer<WakeWordPrediction>>,
) -> (
    JoinHandle<()>,
    mpsc::Receiver<Result<Arc<SyncRollBuffer<Embedding>>>>,
) {
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::Builder::new()
        .name("wakeword".into())
        .spawn(
            move || match WakeWordDetector::new(&specs, Arc::clone(&output)) {
                Ok((mut det, features)) => {
                    let _ = tx.send(Ok(features));
                    det.run();
                }
                Err(e) => {
                    output.cancel();
                    let _ = tx.send(Err(e));
                }
            },
        )
        .expect("spawn wake-word thread");
    (handle, rx)
}
