//! Runtime for the exported anomaly classifier.
//!
//! The trainer exports its network as JSON: an input shape and an ordered
//! list of layers. Tensors are `height x width x channels`, row-major with
//! channels last, which is also the order `flatten` produces.
//!
//! Weight layouts:
//! - `conv2d`: `[kernel_h][kernel_w][in_channels][filters]`, valid padding, stride 1
//! - `dense`: `[inputs][units]`
//!
//! ```json
//! {
//!   "input_shape": [64, 64, 1],
//!   "layers": [
//!     { "type": "rescaling", "scale": 0.00392156862 },
//!     { "type": "conv2d", "filters": 32, "kernel_size": [3, 3], "activation": "relu",
//!       "weights": [...], "bias": [...] },
//!     { "type": "max_pooling2d", "pool_size": [2, 2] },
//!     { "type": "flatten" },
//!     { "type": "dense", "units": 1, "activation": "sigmoid", "weights": [...], "bias": [0.1] }
//!   ]
//! }
//! ```

use image::GrayImage;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use super::Classifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Relu,
    Sigmoid,
}

impl Activation {
    fn apply(self, value: f32) -> f32 {
        match self {
            Activation::Linear => value,
            Activation::Relu => value.max(0.0),
            Activation::Sigmoid => 1.0 / (1.0 + (-value).exp()),
        }
    }
}

fn default_activation() -> Activation {
    Activation::Linear
}

fn default_pool_size() -> [usize; 2] {
    [2, 2]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Rescaling {
        scale: f32,
        #[serde(default)]
        offset: f32,
    },
    Conv2d {
        filters: usize,
        kernel_size: [usize; 2],
        #[serde(default = "default_activation")]
        activation: Activation,
        weights: Vec<f32>,
        bias: Vec<f32>,
    },
    MaxPooling2d {
        #[serde(default = "default_pool_size")]
        pool_size: [usize; 2],
    },
    Flatten,
    Dense {
        units: usize,
        #[serde(default = "default_activation")]
        activation: Activation,
        weights: Vec<f32>,
        bias: Vec<f32>,
    },
}

impl LayerSpec {
    fn kind(&self) -> &'static str {
        match self {
            LayerSpec::Rescaling { .. } => "rescaling",
            LayerSpec::Conv2d { .. } => "conv2d",
            LayerSpec::MaxPooling2d { .. } => "max_pooling2d",
            LayerSpec::Flatten => "flatten",
            LayerSpec::Dense { .. } => "dense",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelArtifact {
    pub input_shape: [usize; 3],
    pub layers: Vec<LayerSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Shape {
    h: usize,
    w: usize,
    c: usize,
}

impl Shape {
    fn len(&self) -> usize {
        self.h * self.w * self.c
    }
}

/// A validated sequential network ending in a single sigmoid unit.
#[derive(Debug, Clone)]
pub struct SequentialModel {
    input: Shape,
    /// Each layer paired with the shape of the tensor it receives.
    layers: Vec<(LayerSpec, Shape)>,
}

impl SequentialModel {
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ClassifierError::Read(path.to_path_buf(), e))?;
        let model = Self::from_json(&text)?;
        info!(
            path = %path.display(),
            layers = model.layers.len(),
            input = ?model.input_shape(),
            "classifier model loaded"
        );
        Ok(model)
    }

    pub fn from_json(text: &str) -> Result<Self, ClassifierError> {
        let artifact: ModelArtifact =
            serde_json::from_str(text).map_err(|e| ClassifierError::Parse(e.to_string()))?;
        Self::from_artifact(artifact)
    }

    /// Propagate shapes through the layers and check every parameter length.
    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, ClassifierError> {
        let [h, w, c] = artifact.input_shape;
        if h == 0 || w == 0 || c == 0 {
            return Err(ClassifierError::Shape {
                index: 0,
                kind: "input",
                reason: format!("input shape {:?} has an empty axis", artifact.input_shape),
            });
        }
        let input = Shape { h, w, c };

        let mut shape = input;
        let mut layers = Vec::with_capacity(artifact.layers.len());
        for (index, layer) in artifact.layers.into_iter().enumerate() {
            let next = output_shape(&layer, shape).map_err(|reason| ClassifierError::Shape {
                index,
                kind: layer.kind(),
                reason,
            })?;
            layers.push((layer, shape));
            shape = next;
        }

        match layers.last() {
            Some((
                LayerSpec::Dense {
                    units: 1,
                    activation: Activation::Sigmoid,
                    ..
                },
                _,
            )) => {}
            Some((last, _)) => {
                return Err(ClassifierError::Output(format!(
                    "last layer is {}, expected a one-unit sigmoid dense layer",
                    last.kind()
                )))
            }
            None => return Err(ClassifierError::Output("model has no layers".into())),
        }

        Ok(Self { input, layers })
    }

    /// `[height, width, channels]` of the expected input.
    pub fn input_shape(&self) -> [usize; 3] {
        [self.input.h, self.input.w, self.input.c]
    }

    /// Fail unless the model accepts single-channel `size x size` patches.
    pub fn ensure_input(&self, size: u32) -> Result<(), ClassifierError> {
        let actual = [size as usize, size as usize, 1];
        if self.input_shape() != actual {
            return Err(ClassifierError::InputMismatch {
                expected: self.input_shape(),
                actual,
            });
        }
        Ok(())
    }

    /// Run the network on a flat `h x w x c` tensor.
    pub fn forward(&self, input: &[f32]) -> Result<Vec<f32>, ClassifierError> {
        if input.len() != self.input.len() {
            return Err(ClassifierError::InputLength {
                expected: self.input.len(),
                actual: input.len(),
            });
        }

        let mut tensor = input.to_vec();
        for (layer, shape) in &self.layers {
            tensor = apply_layer(layer, *shape, &tensor);
        }
        Ok(tensor)
    }
}

impl Classifier for SequentialModel {
    fn score(&self, patch: &GrayImage) -> Result<f32, ClassifierError> {
        let (width, height) = patch.dimensions();
        let actual = [height as usize, width as usize, 1];
        if self.input_shape() != actual {
            return Err(ClassifierError::InputMismatch {
                expected: self.input_shape(),
                actual,
            });
        }

        let input: Vec<f32> = patch.as_raw().iter().map(|&p| p as f32).collect();
        self.forward(&input)?
            .first()
            .copied()
            .ok_or_else(|| ClassifierError::Output("network produced no output".into()))
    }

    fn name(&self) -> &str {
        "sequential"
    }
}

fn output_shape(layer: &LayerSpec, input: Shape) -> Result<Shape, String> {
    match layer {
        LayerSpec::Rescaling { .. } => Ok(input),
        LayerSpec::Conv2d {
            filters,
            kernel_size: [kh, kw],
            weights,
            bias,
            ..
        } => {
            if *filters == 0 || *kh == 0 || *kw == 0 {
                return Err("filters and kernel size must be positive".into());
            }
            if *kh > input.h || *kw > input.w {
                return Err(format!(
                    "kernel {kh}x{kw} larger than input {}x{}",
                    input.h, input.w
                ));
            }
            let expected = kh * kw * input.c * filters;
            if weights.len() != expected {
                return Err(format!("expected {expected} weights, found {}", weights.len()));
            }
            if bias.len() != *filters {
                return Err(format!("expected {filters} biases, found {}", bias.len()));
            }
            Ok(Shape {
                h: input.h - kh + 1,
                w: input.w - kw + 1,
                c: *filters,
            })
        }
        LayerSpec::MaxPooling2d {
            pool_size: [ph, pw],
        } => {
            if *ph == 0 || *pw == 0 {
                return Err("pool size must be positive".into());
            }
            let out = Shape {
                h: input.h / ph,
                w: input.w / pw,
                c: input.c,
            };
            if out.h == 0 || out.w == 0 {
                return Err(format!(
                    "pool {ph}x{pw} larger than input {}x{}",
                    input.h, input.w
                ));
            }
            Ok(out)
        }
        LayerSpec::Flatten => Ok(Shape {
            h: 1,
            w: 1,
            c: input.len(),
        }),
        LayerSpec::Dense {
            units,
            weights,
            bias,
            ..
        } => {
            if input.h != 1 || input.w != 1 {
                return Err(format!(
                    "expects flattened input, got {}x{}x{}",
                    input.h, input.w, input.c
                ));
            }
            if *units == 0 {
                return Err("units must be positive".into());
            }
            let expected = input.c * units;
            if weights.len() != expected {
                return Err(format!("expected {expected} weights, found {}", weights.len()));
            }
            if bias.len() != *units {
                return Err(format!("expected {units} biases, found {}", bias.len()));
            }
            Ok(Shape {
                h: 1,
                w: 1,
                c: *units,
            })
        }
    }
}

fn apply_layer(layer: &LayerSpec, shape: Shape, input: &[f32]) -> Vec<f32> {
    match layer {
        LayerSpec::Rescaling { scale, offset } => {
            input.iter().map(|v| v * scale + offset).collect()
        }
        LayerSpec::Conv2d {
            filters,
            kernel_size: [kh, kw],
            activation,
            weights,
            bias,
        } => conv2d(input, shape, *filters, *kh, *kw, weights, bias, *activation),
        LayerSpec::MaxPooling2d {
            pool_size: [ph, pw],
        } => max_pool(input, shape, *ph, *pw),
        LayerSpec::Flatten => input.to_vec(),
        LayerSpec::Dense {
            units,
            activation,
            weights,
            bias,
        } => (0..*units)
            .map(|k| {
                let sum: f32 = input
                    .iter()
                    .enumerate()
                    .map(|(i, v)| v * weights[i * units + k])
                    .sum();
                activation.apply(sum + bias[k])
            })
            .collect(),
    }
}

#[allow(clippy::too_many_arguments)]
fn conv2d(
    input: &[f32],
    shape: Shape,
    filters: usize,
    kh: usize,
    kw: usize,
    weights: &[f32],
    bias: &[f32],
    activation: Activation,
) -> Vec<f32> {
    let out_h = shape.h - kh + 1;
    let out_w = shape.w - kw + 1;
    let mut out = vec![0.0f32; out_h * out_w * filters];

    for oy in 0..out_h {
        for ox in 0..out_w {
            let base = (oy * out_w + ox) * filters;
            out[base..base + filters].copy_from_slice(bias);
            for dy in 0..kh {
                for dx in 0..kw {
                    let pixel = ((oy + dy) * shape.w + (ox + dx)) * shape.c;
                    for ci in 0..shape.c {
                        let value = input[pixel + ci];
                        let w_base = ((dy * kw + dx) * shape.c + ci) * filters;
                        for k in 0..filters {
                            out[base + k] += value * weights[w_base + k];
                        }
                    }
                }
            }
            for v in &mut out[base..base + filters] {
                *v = activation.apply(*v);
            }
        }
    }
    out
}

fn max_pool(input: &[f32], shape: Shape, ph: usize, pw: usize) -> Vec<f32> {
    let out_h = shape.h / ph;
    let out_w = shape.w / pw;
    let mut out = vec![f32::NEG_INFINITY; out_h * out_w * shape.c];

    for oy in 0..out_h {
        for ox in 0..out_w {
            let base = (oy * out_w + ox) * shape.c;
            for dy in 0..ph {
                for dx in 0..pw {
                    let pixel = ((oy * ph + dy) * shape.w + (ox * pw + dx)) * shape.c;
                    for ci in 0..shape.c {
                        out[base + ci] = out[base + ci].max(input[pixel + ci]);
                    }
                }
            }
        }
    }
    out
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("failed to read model {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse model: {0}")]
    Parse(String),
    #[error("layer {index} ({kind}): {reason}")]
    Shape {
        index: usize,
        kind: &'static str,
        reason: String,
    },
    #[error("model expects {expected:?} input but patches are {actual:?}")]
    InputMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },
    #[error("model expects {expected} input values, got {actual}")]
    InputLength { expected: usize, actual: usize },
    #[error("invalid model output: {0}")]
    Output(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn sigmoid(v: f32) -> f32 {
        1.0 / (1.0 + (-v).exp())
    }

    #[test]
    fn dense_only_model() {
        let model = SequentialModel::from_json(
            r#"{
                "input_shape": [2, 2, 1],
                "layers": [
                    {"type": "rescaling", "scale": 0.5},
                    {"type": "flatten"},
                    {"type": "dense", "units": 1, "activation": "sigmoid",
                     "weights": [1.0, -1.0, 0.5, 0.0], "bias": [0.25]}
                ]
            }"#,
        )
        .unwrap();

        let out = model.forward(&[2.0, 4.0, 6.0, 8.0]).unwrap();
        // rescaled: [1, 2, 3, 4] -> 1 - 2 + 1.5 + 0 + 0.25
        assert_eq!(out.len(), 1);
        assert!((out[0] - sigmoid(0.75)).abs() < 1e-6);
    }

    #[test]
    fn conv_pool_dense_forward_pass() {
        // 3x3 input, one 2x2 averaging filter -> 2x2, pooled to 1x1.
        let model = SequentialModel::from_json(
            r#"{
                "input_shape": [3, 3, 1],
                "layers": [
                    {"type": "conv2d", "filters": 1, "kernel_size": [2, 2], "activation": "relu",
                     "weights": [0.25, 0.25, 0.25, 0.25], "bias": [-1.0]},
                    {"type": "max_pooling2d", "pool_size": [2, 2]},
                    {"type": "flatten"},
                    {"type": "dense", "units": 1, "activation": "sigmoid",
                     "weights": [2.0], "bias": [-3.0]}
                ]
            }"#,
        )
        .unwrap();

        let input = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        // Windows average to 3, 4, 6, 7; minus bias 1 -> 2, 3, 5, 6; max 6.
        let out = model.forward(&input).unwrap();
        assert!((out[0] - sigmoid(2.0 * 6.0 - 3.0)).abs() < 1e-6);
    }

    #[test]
    fn multi_channel_conv_uses_channels_last_layout() {
        // 1x1 kernel mixing two input channels into two filters.
        let model = SequentialModel::from_json(
            r#"{
                "input_shape": [1, 2, 2],
                "layers": [
                    {"type": "conv2d", "filters": 2, "kernel_size": [1, 1],
                     "weights": [1.0, 0.0, 0.0, 10.0], "bias": [0.0, 0.0]},
                    {"type": "flatten"},
                    {"type": "dense", "units": 1, "activation": "sigmoid",
                     "weights": [1.0, 0.0, 0.0, 0.001], "bias": [0.0]}
                ]
            }"#,
        )
        .unwrap();

        // pixel0 = (c0=1, c1=2), pixel1 = (c0=3, c1=4)
        // conv: pixel0 -> (1, 20), pixel1 -> (3, 40)
        let out = model.forward(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!((out[0] - sigmoid(1.0 + 0.04)).abs() < 1e-6);
    }

    #[test]
    fn weight_length_mismatch_is_rejected() {
        let err = SequentialModel::from_json(
            r#"{
                "input_shape": [2, 2, 1],
                "layers": [
                    {"type": "flatten"},
                    {"type": "dense", "units": 1, "activation": "sigmoid",
                     "weights": [1.0, 2.0], "bias": [0.0]}
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ClassifierError::Shape { index: 1, kind: "dense", .. }));
    }

    #[test]
    fn dense_requires_flattened_input() {
        let err = SequentialModel::from_json(
            r#"{
                "input_shape": [2, 2, 1],
                "layers": [
                    {"type": "dense", "units": 1, "activation": "sigmoid",
                     "weights": [1.0], "bias": [0.0]}
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ClassifierError::Shape { index: 0, .. }));
    }

    #[test]
    fn output_must_be_one_sigmoid_unit() {
        let linear = SequentialModel::from_json(
            r#"{
                "input_shape": [1, 1, 1],
                "layers": [
                    {"type": "flatten"},
                    {"type": "dense", "units": 1, "weights": [1.0], "bias": [0.0]}
                ]
            }"#,
        );
        assert!(matches!(linear, Err(ClassifierError::Output(_))));

        let empty = SequentialModel::from_json(r#"{"input_shape": [1, 1, 1], "layers": []}"#);
        assert!(matches!(empty, Err(ClassifierError::Output(_))));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = SequentialModel::from_json(r#"{"input_shape": [64, 64]"#).unwrap_err();
        assert!(matches!(err, ClassifierError::Parse(_)));

        let err = SequentialModel::from_json(
            r#"{"input_shape": [1, 1, 1], "layers": [{"type": "dropout"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ClassifierError::Parse(_)));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SequentialModel::load(&dir.path().join("model.json")).unwrap_err();
        assert!(matches!(err, ClassifierError::Read(_, _)));
    }

    #[test]
    fn scores_patches_and_checks_their_size() {
        let model = SequentialModel::from_json(
            r#"{
                "input_shape": [2, 2, 1],
                "layers": [
                    {"type": "rescaling", "scale": 0.00392156862},
                    {"type": "flatten"},
                    {"type": "dense", "units": 1, "activation": "sigmoid",
                     "weights": [-1.0, -1.0, -1.0, -1.0], "bias": [2.0]}
                ]
            }"#,
        )
        .unwrap();

        assert!(model.ensure_input(2).is_ok());
        assert!(matches!(
            model.ensure_input(64),
            Err(ClassifierError::InputMismatch { .. })
        ));

        let dark = GrayImage::from_pixel(2, 2, Luma([0]));
        let bright = GrayImage::from_pixel(2, 2, Luma([255]));
        let dark_score = model.score(&dark).unwrap();
        let bright_score = model.score(&bright).unwrap();
        assert!(dark_score > 0.5);
        assert!(bright_score < 0.5);
        assert!((0.0..=1.0).contains(&bright_score));

        let wrong = GrayImage::new(3, 3);
        assert!(model.score(&wrong).is_err());
    }
}
