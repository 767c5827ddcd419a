//! PCM to embeddings: the middle stage of the detector pipeline.
//!
//! Consumes the audio roll-buffer one frame (plus 30ms of leading overlap)
//! at a time, turns the frame into mel-spectrogram rows and the mel rows
//! into one 96-float embedding per 80ms chunk.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::{Result, VozError};
use crate::rollbuf::{RollBuffer, Status, SyncRollBuffer};
use crate::runner::{embedding_engine_options, Infer, Runner};
use crate::{
    Embedding, MelRow, CHUNK_SIZE, EMBEDDING_DIM, EMBEDDING_WINDOW, FRAME_CHUNKS, FRAME_SIZE,
    MAX_ERROR_ALLOWED, MEL_BINS, MEL_WARMUP_VALUE, OVERLAP_SIZE,
};

/// Samples consumed per pipeline step: one frame plus the carried overlap.
pub const STEP_SIZE: usize = OVERLAP_SIZE + FRAME_SIZE;

/// Capacity of the shared audio buffer: the producer can always append one
/// more chunk while a full step is pending.
pub const AUDIO_BUFFER_SIZE: usize = STEP_SIZE + CHUNK_SIZE;

#[derive(Debug, Clone)]
pub struct FeatureStageConfig {
    pub mel_model: PathBuf,
    pub embedding_model: PathBuf,
}

pub struct FeatureStage {
    mel: Box<dyn Infer>,
    embed: Box<dyn Infer>,
    /// Mel rows the mel model emits for one 80ms chunk, probed at load time.
    mels_per_chunk: usize,
    mel_rows: RollBuffer<MelRow>,
    staged: Vec<f32>,
    flat: Vec<f32>,
    input: Arc<SyncRollBuffer<i16>>,
    output: Arc<SyncRollBuffer<Embedding>>,
    errors: u32,
    frames: u64,
    embeddings: u64,
}

impl FeatureStage {
    /// Load the two base models and bind them to the hand-off buffers.
    pub fn new(
        cfg: &FeatureStageConfig,
        input: Arc<SyncRollBuffer<i16>>,
        output: Arc<SyncRollBuffer<Embedding>>,
    ) -> Result<Self> {
        // Probe the per-chunk mel count with a chunk-sized input, then widen
        // to the full step.
        let mel_path = cfg.mel_model.to_string_lossy();
        let mel = Runner::load(
            &mel_path,
            1,
            false,
            Some(&[1, OVERLAP_SIZE + CHUNK_SIZE]),
        )?;

        let (threads, use_xnn) = embedding_engine_options();
        let embed_path = cfg.embedding_model.to_string_lossy();
        let embed = Runner::load(&embed_path, threads, use_xnn, None)?;

        log::debug!(
            "feature stage: embedding engine {} thread(s) xnn={}",
            threads,
            use_xnn
        );
        Self::with_models(Box::new(mel), Box::new(embed), input, output)
    }

    /// Bind already-loaded (or stub) models. The mel model must still carry
    /// its chunk-sized probe input; it is widened to the full step here.
    pub fn with_models(
        mut mel: Box<dyn Infer>,
        embed: Box<dyn Infer>,
        input: Arc<SyncRollBuffer<i16>>,
        output: Arc<SyncRollBuffer<Embedding>>,
    ) -> Result<Self> {
        let mels_per_chunk = probe_mels_per_chunk(mel.as_ref())?;
        mel.set_input_shape(&[1, STEP_SIZE])?;
        let mels_per_frame = FRAME_CHUNKS * mels_per_chunk;
        let mut stage = Self {
            mel,
            embed,
            mels_per_chunk,
            mel_rows: RollBuffer::new((EMBEDDING_WINDOW - mels_per_chunk) + mels_per_frame),
            staged: Vec::with_capacity(STEP_SIZE),
            flat: Vec::with_capacity(EMBEDDING_WINDOW * MEL_BINS),
            input,
            output,
            errors: 0,
            frames: 0,
            embeddings: 0,
        };
        stage.warm_input();
        stage.warm_mels();
        Ok(stage)
    }

    /// Zero leading context so the first real frame has a valid 30ms overlap.
    fn warm_input(&mut self) {
        let mut guard = self.input.lock();
        guard.reset();
        guard.append(&[0i16; OVERLAP_SIZE]);
        guard.release();
    }

    /// Unit-mel warm-up rows expected by the embedding model.
    fn warm_mels(&mut self) {
        self.mel_rows.reset();
        for _ in 0..EMBEDDING_WINDOW - self.mels_per_chunk {
            self.mel_rows.append_one([MEL_WARMUP_VALUE; MEL_BINS]);
        }
    }

    /// Wait for a full step, stage it as floats and advance by one frame.
    fn process_input(&mut self) -> (bool, Status) {
        let mut guard = self.input.wait_at_least(STEP_SIZE);
        let status = guard.status();
        let mut fresh = false;
        if guard.len() >= STEP_SIZE {
            self.staged.clear();
            self.staged
                .extend(guard.get()[..STEP_SIZE].iter().map(|&s| s as f32));
            guard.shift(FRAME_SIZE);
            fresh = true;
        }
        if status.reset {
            guard.release_and_signal();
        } else {
            guard.release();
        }
        (fresh, status)
    }

    /// Run the mel model over the staged step and roll the rescaled rows in.
    fn to_mels(&mut self) -> Result<()> {
        let out = self.mel.run(&self.staged)?;
        if out.len() % MEL_BINS != 0 {
            return Err(VozError::TensorRuntime(format!(
                "mel output of {} values is not a row multiple",
                out.len()
            )));
        }
        for row in out.chunks_exact(MEL_BINS) {
            let mut mel = [0f32; MEL_BINS];
            for (dst, &x) in mel.iter_mut().zip(row) {
                *dst = x.mul_add(0.1, 2.0);
            }
            self.mel_rows.append_one(mel);
        }
        self.frames += 1;
        Ok(())
    }

    /// Emit one embedding per 80ms of buffered mels. Returns whether anything
    /// was appended; the caller signals once per iteration.
    fn to_features(&mut self) -> bool {
        if self.mel_rows.len() < EMBEDDING_WINDOW {
            return false;
        }
        let mut guard = self.output.lock();
        let mut appended = false;
        while self.mel_rows.len() >= EMBEDDING_WINDOW {
            self.flat.clear();
            for row in &self.mel_rows.get()[..EMBEDDING_WINDOW] {
                self.flat.extend_from_slice(row);
            }
            match self.embed.run(&self.flat) {
                Ok(out) if out.len() >= EMBEDDING_DIM => {
                    let mut emb = [0f32; EMBEDDING_DIM];
                    emb.copy_from_slice(&out[..EMBEDDING_DIM]);
                    guard.append_one(emb);
                    self.embeddings += 1;
                    appended = true;
                }
                Ok(out) => {
                    self.errors += 1;
                    log::warn!("embedding output too short: {} values", out.len());
                }
                Err(e) => {
                    self.errors += 1;
                    log::warn!("embedding inference: {}", e);
                }
            }
            self.mel_rows.shift(self.mels_per_chunk);
        }
        guard.release();
        appended
    }

    /// Re-run the warm-ups and propagate the reset downstream. Idempotent.
    fn rewarm(&mut self) {
        self.warm_input();
        self.warm_mels();
        self.staged.clear();
        self.output.reset();
    }

    pub fn run(&mut self) {
        loop {
            let (fresh, status) = self.process_input();
            if fresh {
                if let Err(e) = self.to_mels() {
                    self.errors += 1;
                    log::warn!("mel inference: {}", e);
                }
                if self.to_features() {
                    self.output.notify();
                }
            }
            if status.cancel {
                break;
            }
            if status.reset {
                self.rewarm();
            }
            if self.errors >= MAX_ERROR_ALLOWED {
                log::error!("feature stage giving up after {} errors", self.errors);
                break;
            }
        }
        log::debug!(
            "feature stage done: {} frames, {} embeddings, {} errors",
            self.frames,
            self.embeddings,
            self.errors
        );
        self.output.cancel();
    }
}

fn probe_mels_per_chunk(mel: &dyn Infer) -> Result<usize> {
    let shape = mel.output_shape();
    let mels = *shape.get(2).ok_or_else(|| {
        VozError::NotRunnable(format!("mel model output shape {:?} has no mel axis", shape))
    })?;
    if mels == 0 || mels >= EMBEDDING_WINDOW {
        return Err(VozError::NotRunnable(format!(
            "implausible per-chunk mel count {}",
            mels
        )));
    }
    Ok(mels)
}

/// Run the feature stage on its own thread. Model loading happens inside the
/// thread (the engine is not shareable across threads); the receiver reports
/// whether setup succeeded.
pub fn spawn(
    cfg: FeatureStageConfig,
    input: Arc<SyncRollBuffer<i16>>,
    output: Arc<SyncRollBuffer<Embedding>>,
) -> (JoinHandle<()>, mpsc::Receiver<Result<()>>) {
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::Builder::new()
        .name("features".into())
        .spawn(move || {
            match FeatureStage::new(&cfg, input, Arc::clone(&output)) {
                Ok(mut stage) => {
                    let _ = tx.send(Ok(()));
                    stage.run();
                }
                Err(e) => {
                    output.cancel();
                    let _ = tx.send(Err(e));
                }
            }
        })
        .expect("spawn features thread");
    (handle, rx)
}
