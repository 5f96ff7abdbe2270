//! Batch transforms
//!
//! A [`Transform`] maps a batch to a batch of the same size. Randomized
//! transforms draw from the calling worker's seeded generator, so a stage
//! with a fixed seed replays the same augmentations.
//!
//! Transform lists can be described in configuration through
//! [`TransformSpec`].

pub mod image;

use rand::rngs::StdRng;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::Result;
use crate::tensor::Batch;

pub use image::{
    AdditiveNoise, FlipX, Interpolation, Rescale, Resize, ResizeMode, Slicer, TopCenterCrop,
};

/// A batch-to-batch policy
///
/// Implementations keep no per-call state; everything random comes from
/// `rng`. Unless documented otherwise the key set and batch size are
/// preserved.
pub trait Transform: Send + Sync {
    /// Short name used in errors and logs
    fn name(&self) -> &'static str;

    /// Apply to one batch; `deterministic` selects the evaluation behaviour
    fn apply(&self, batch: Batch, deterministic: bool, rng: &mut StdRng) -> Result<Batch>;
}

/// Shared, dynamically dispatched transform
pub type TransformRef = Arc<dyn Transform>;

/// Apply `transforms` in order
pub fn apply_all(
    transforms: &[TransformRef],
    batch: Batch,
    deterministic: bool,
    rng: &mut StdRng,
) -> Result<Batch> {
    transforms
        .iter()
        .try_fold(batch, |batch, t| t.apply(batch, deterministic, rng))
}

fn default_rescale_scale() -> f64 {
    1.0 / 128.0
}

fn default_rescale_offset() -> f64 {
    128.0
}

fn default_slice_height() -> f64 {
    0.33
}

fn default_slice_width() -> f64 {
    1.0
}

fn default_noise_strength() -> f64 {
    0.2
}

fn default_noise_sigma() -> f64 {
    50.0
}

/// Configuration form of the built-in transforms
///
/// ```toml
/// [[transforms]]
/// type = "resize"
/// height = 255
/// width = 255
/// interpolation = "nearest"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformSpec {
    Resize {
        width: usize,
        #[serde(default)]
        height: Option<usize>,
        #[serde(default)]
        mode: ResizeMode,
        #[serde(default)]
        interpolation: Interpolation,
    },
    FlipX,
    Rescale {
        #[serde(default = "default_rescale_scale")]
        scale: f64,
        #[serde(default = "default_rescale_offset")]
        offset: f64,
    },
    Slicer {
        #[serde(default = "default_slice_height")]
        height: f64,
        #[serde(default = "default_slice_width")]
        width: f64,
        #[serde(default)]
        yoffset: f64,
        #[serde(default)]
        xoffset: f64,
    },
    TopCenterCrop {
        height: usize,
        width: usize,
    },
    AdditiveNoise {
        #[serde(default = "default_noise_strength")]
        strength: f64,
        #[serde(default)]
        mu: f64,
        #[serde(default = "default_noise_sigma")]
        sigma: f64,
    },
}

impl TransformSpec {
    /// Validate parameters and build the transform
    pub fn build(&self) -> Result<TransformRef> {
        let transform: TransformRef = match *self {
            TransformSpec::Resize {
                width,
                height,
                mode,
                interpolation,
            } => Arc::new(Resize::from_mode(mode, height, width, interpolation)?),
            TransformSpec::FlipX => Arc::new(FlipX),
            TransformSpec::Rescale { scale, offset } => Arc::new(Rescale::new(scale, offset)),
            TransformSpec::Slicer {
                height,
                width,
                yoffset,
                xoffset,
            } => Arc::new(Slicer::new(height, width, yoffset, xoffset)?),
            TransformSpec::TopCenterCrop { height, width } => {
                Arc::new(TopCenterCrop::new(height, width)?)
            }
            TransformSpec::AdditiveNoise { strength, mu, sigma } => {
                Arc::new(AdditiveNoise::new(strength, mu, sigma)?)
            }
        };
        Ok(transform)
    }
}

/// Build every spec in order, failing on the first invalid one
pub fn build_all(specs: &[TransformSpec]) -> Result<Vec<TransformRef>> {
    specs.iter().map(TransformSpec::build).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Tensor, IMAGES};
    use rand::SeedableRng;

    #[derive(Debug, Deserialize)]
    struct List {
        transforms: Vec<TransformSpec>,
    }

    #[test]
    fn test_parse_transform_list() {
        let list: List = toml::from_str(
            r#"
            [[transforms]]
            type = "resize"
            height = 8
            width = 6

            [[transforms]]
            type = "flip_x"

            [[transforms]]
            type = "rescale"
            "#,
        )
        .unwrap();

        assert_eq!(list.transforms.len(), 3);
        assert_eq!(
            list.transforms[2],
            TransformSpec::Rescale {
                scale: 1.0 / 128.0,
                offset: 128.0
            }
        );
        let built = build_all(&list.transforms).unwrap();
        assert_eq!(built[0].name(), "resize");
        assert_eq!(built[1].name(), "flip_x");
    }

    #[test]
    fn test_unknown_mode_is_descriptive() {
        let err = toml::from_str::<List>(
            r#"
            [[transforms]]
            type = "resize"
            width = 6
            mode = "stretch"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("stretch"));
    }

    #[test]
    fn test_invalid_parameters_fail_at_build() {
        let spec = TransformSpec::Slicer {
            height: 1.5,
            width: 1.0,
            yoffset: 0.0,
            xoffset: 0.0,
        };
        assert!(spec.build().is_err());
    }

    #[test]
    fn test_apply_all_in_order() {
        let transforms = build_all(&[
            TransformSpec::Rescale { scale: 2.0, offset: 1.0 },
            TransformSpec::Rescale { scale: 1.0, offset: 1.0 },
        ])
        .unwrap();
        let batch = Batch::new().with(IMAGES, Tensor::full(vec![1, 1, 1, 1], 3u8));
        let mut rng = StdRng::seed_from_u64(0);
        let out = apply_all(&transforms, batch, true, &mut rng).unwrap();
        // (3 - 1) * 2 = 4, then 4 - 1 = 3
        assert_eq!(out.get(IMAGES).unwrap().to_vec::<f32>().unwrap(), vec![3.0]);
    }
}
