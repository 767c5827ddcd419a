//! Thin uniform wrapper over the TFLite inference engine.
//!
//! Every model thread owns its own [`Runner`]; the interpreter is not
//! thread-safe and is never shared. The rest of the crate talks to models
//! through the [`Infer`] seam so stages can be driven by stubs in tests.

use tflitec::interpreter::{Interpreter, Options};
use tflitec::tensor::Shape;

use crate::error::{Result, VozError};

/// Minimal inference surface used by the pipeline stages.
///
/// `run` returns a borrow of the output buffer that is only valid until the
/// next `run`/`set_input_shape` call on the same model.
pub trait Infer {
    fn input_shape(&self) -> &[usize];
    fn output_shape(&self) -> &[usize];
    fn set_input_shape(&mut self, shape: &[usize]) -> Result<()>;
    fn run(&mut self, input: &[f32]) -> Result<&[f32]>;
}

/// TFLite interpreter with cached tensor shapes.
pub struct Runner {
    interpreter: Interpreter<'static>,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    out_scratch: Vec<f32>,
}

impl Runner {
    /// Load a model, build the interpreter, optionally resize input 0 and
    /// allocate tensors.
    pub fn load(
        path: &str,
        threads: i32,
        use_xnn: bool,
        input_shape: Option<&[usize]>,
    ) -> Result<Self> {
        let mut options = Options::default();
        options.thread_count = threads;
        options.is_xnnpack_enabled = use_xnn;
        let interpreter = Interpreter::with_model_path(path, Some(options))
            .map_err(|e| VozError::TensorAlloc(format!("{}: {}", path, e)))?;

        if interpreter.input_tensor_count() == 0 || interpreter.output_tensor_count() == 0 {
            return Err(VozError::NotRunnable(format!(
                "{}: model exposes no input or output tensor",
                path
            )));
        }

        if let Some(shape) = input_shape {
            interpreter
                .resize_input(0, Shape::new(shape.to_vec()))
                .map_err(|e| VozError::TensorAlloc(format!("resize input: {}", e)))?;
        }
        interpreter
            .allocate_tensors()
            .map_err(|e| VozError::TensorAlloc(format!("allocate tensors: {}", e)))?;

        let mut runner = Self {
            interpreter,
            input_shape: Vec::new(),
            output_shape: Vec::new(),
            out_scratch: Vec::new(),
        };
        runner.refresh_shapes()?;
        log::debug!(
            "loaded {} (input {:?}, output {:?})",
            path,
            runner.input_shape,
            runner.output_shape
        );
        Ok(runner)
    }

    fn refresh_shapes(&mut self) -> Result<()> {
        let input = self
            .interpreter
            .input(0)
            .map_err(|e| VozError::TensorRuntime(format!("input tensor: {}", e)))?;
        self.input_shape = input.shape().dimensions().clone();
        let output = self
            .interpreter
            .output(0)
            .map_err(|e| VozError::TensorRuntime(format!("output tensor: {}", e)))?;
        self.output_shape = output.shape().dimensions().clone();
        Ok(())
    }

    fn input_len(&self) -> usize {
        self.input_shape.iter().product()
    }
}

impl Infer for Runner {
    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn set_input_shape(&mut self, shape: &[usize]) -> Result<()> {
        self.interpreter
            .resize_input(0, Shape::new(shape.to_vec()))
            .map_err(|e| VozError::TensorRuntime(format!("resize input: {}", e)))?;
        self.interpreter
            .allocate_tensors()
            .map_err(|e| VozError::TensorRuntime(format!("allocate tensors: {}", e)))?;
        self.refresh_shapes()
    }

    fn run(&mut self, input: &[f32]) -> Result<&[f32]> {
        if input.len() != self.input_len() {
            return Err(VozError::TensorRuntime(format!(
                "input size mismatch: got {}, tensor wants {}",
                input.len(),
                self.input_len()
            )));
        }
        self.interpreter
            .copy(input, 0)
            .map_err(|e| VozError::TensorRuntime(format!("copy input: {}", e)))?;
        self.interpreter
            .invoke()
            .map_err(|e| VozError::TensorRuntime(format!("invoke: {}", e)))?;
        let output = self
            .interpreter
            .output(0)
            .map_err(|e| VozError::TensorRuntime(format!("output tensor: {}", e)))?;
        self.out_scratch.clear();
        self.out_scratch.extend_from_slice(output.data::<f32>());
        Ok(&self.out_scratch)
    }
}

/// Thread/XNNPack policy for the embedding model: two accelerated threads on
/// boxes with at least three cores, one plain thread otherwise.
pub fn embedding_engine_options() -> (i32, bool) {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if cores >= 3 {
        (2, true)
    } else {
        (1, false)
    }
}
