pub mod detector;
pub mod dsp;
pub mod error;
pub mod features;
pub mod gpio;
pub mod input;
pub mod output;
pub mod rollbuf;
pub mod runner;
pub mod serial;
pub mod sigpipe;
pub mod wav;

// Stream geometry - must match the training pipeline of the base models exactly
pub const SAMPLE_RATE: u32 = 16000;
pub const CHUNK_SIZE: usize = 1280; // 80ms at 16kHz
pub const FRAME_CHUNKS: usize = 4;
pub const FRAME_SIZE: usize = FRAME_CHUNKS * CHUNK_SIZE; // 320ms
pub const OVERLAP_SIZE: usize = 480; // 30ms carried into the next frame
pub const SUBCHUNK_SIZE: usize = 160; // 10ms DSP granule
pub const CHUNK_TIME_MS: u64 = 80;

pub const MEL_BINS: usize = 32;
pub const EMBEDDING_WINDOW: usize = 76; // mel rows per embedding
pub const EMBEDDING_DIM: usize = 96;
pub const MEL_WARMUP_VALUE: f32 = 1.0;

/// Inference failures tolerated by a model thread before it gives up.
pub const MAX_ERROR_ALLOWED: u32 = 10;

pub type MelRow = [f32; MEL_BINS];
pub type Embedding = [f32; EMBEDDING_DIM];

pub use detector::{WakeWordConfig, WakeWordPrediction};
pub use error::VozError;
pub use rollbuf::{RollBuffer, SyncRollBuffer};
