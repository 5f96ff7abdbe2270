//! Image transforms over NHWC tensors stored under `"images"`
//!
//! Geometric transforms (flip, crop, nearest resize) move whole pixels as
//! raw bytes and keep the input dtype. Arithmetic transforms work in `f64`
//! and emit `f32`.

use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::Rng;
use serde::Deserialize;

use super::Transform;
use crate::error::{HighwayError, Result};
use crate::tensor::{Batch, DType, Tensor, IMAGES};

fn invalid(transform: &'static str, reason: impl Into<String>) -> HighwayError {
    HighwayError::InvalidTransform {
        transform,
        reason: reason.into(),
    }
}

/// Dimensions of an NHWC image tensor
#[derive(Debug, Clone, Copy)]
struct Layout {
    n: usize,
    h: usize,
    w: usize,
    c: usize,
    elem: usize,
}

impl Layout {
    fn of(transform: &'static str, images: &Tensor) -> Result<Self> {
        match *images.shape() {
            [n, h, w, c] => Ok(Self {
                n,
                h,
                w,
                c,
                elem: images.dtype().size(),
            }),
            _ => Err(invalid(
                transform,
                format!("expected NHWC images, got shape {:?}", images.shape()),
            )),
        }
    }

    fn pixel(&self) -> usize {
        self.c * self.elem
    }

    fn row(&self) -> usize {
        self.w * self.pixel()
    }

    fn image(&self) -> usize {
        self.h * self.row()
    }
}

/// Copy an `out_h x out_w` window per image, origin `(top, left)` per image
fn crop(
    images: &Tensor,
    layout: Layout,
    out_h: usize,
    out_w: usize,
    origins: &[(usize, usize)],
) -> Result<Tensor> {
    let pixel = layout.pixel();
    let data = images.data();
    let mut buf = BytesMut::with_capacity(layout.n * out_h * out_w * pixel);

    for (i, &(top, left)) in origins.iter().enumerate() {
        for y in top..top + out_h {
            let start = i * layout.image() + y * layout.row() + left * pixel;
            buf.extend_from_slice(&data[start..start + out_w * pixel]);
        }
    }

    Tensor::from_bytes(vec![layout.n, out_h, out_w, layout.c], images.dtype(), buf.freeze())
}

/// Replace the images entry after a transform
fn replace_images(mut batch: Batch, images: Tensor) -> Batch {
    batch.insert(IMAGES, images);
    batch
}

// ========== Resize ==========

/// How [`Resize`] picks the output size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    /// Exactly `height x width`
    #[default]
    Exact,
    /// Width becomes `width`; height keeps the aspect ratio
    Width,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Exact { height: usize, width: usize },
    Width { width: usize },
}

/// Resize every image
///
/// Resizing is the same in training and evaluation, so `deterministic` is
/// ignored.
#[derive(Debug, Clone)]
pub struct Resize {
    target: Target,
    interpolation: Interpolation,
}

impl Resize {
    pub fn exact(height: usize, width: usize, interpolation: Interpolation) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(invalid("resize", format!("target {}x{} has a zero side", height, width)));
        }
        Ok(Self {
            target: Target::Exact { height, width },
            interpolation,
        })
    }

    pub fn width(width: usize, interpolation: Interpolation) -> Result<Self> {
        if width == 0 {
            return Err(invalid("resize", "target width must be positive"));
        }
        Ok(Self {
            target: Target::Width { width },
            interpolation,
        })
    }

    pub fn from_mode(
        mode: ResizeMode,
        height: Option<usize>,
        width: usize,
        interpolation: Interpolation,
    ) -> Result<Self> {
        match mode {
            ResizeMode::Exact => {
                let height = height.ok_or_else(|| invalid("resize", "exact mode needs a height"))?;
                Self::exact(height, width, interpolation)
            }
            ResizeMode::Width => Self::width(width, interpolation),
        }
    }

    fn output_size(&self, layout: Layout) -> (usize, usize) {
        match self.target {
            Target::Exact { height, width } => (height, width),
            Target::Width { width } => {
                let height = (layout.h as f64 * width as f64 / layout.w as f64).round() as usize;
                (height.max(1), width)
            }
        }
    }
}

/// Pixel-center mapping from an output coordinate to the source axis
fn source_coord(dst: usize, src_len: usize, dst_len: usize) -> f64 {
    let x = (dst as f64 + 0.5) * src_len as f64 / dst_len as f64 - 0.5;
    x.clamp(0.0, (src_len - 1) as f64)
}

fn nearest_index(dst: usize, src_len: usize, dst_len: usize) -> usize {
    ((dst * src_len) / dst_len).min(src_len - 1)
}

fn resize_nearest(images: &Tensor, layout: Layout, out_h: usize, out_w: usize) -> Result<Tensor> {
    let pixel = layout.pixel();
    let data = images.data();
    let cols: Vec<usize> = (0..out_w).map(|x| nearest_index(x, layout.w, out_w)).collect();
    let mut buf = BytesMut::with_capacity(layout.n * out_h * out_w * pixel);

    for i in 0..layout.n {
        for y in 0..out_h {
            let row = i * layout.image() + nearest_index(y, layout.h, out_h) * layout.row();
            for &sx in &cols {
                let p = row + sx * pixel;
                buf.extend_from_slice(&data[p..p + pixel]);
            }
        }
    }

    Tensor::from_bytes(vec![layout.n, out_h, out_w, layout.c], images.dtype(), buf.freeze())
}

fn resize_bilinear(images: &Tensor, layout: Layout, out_h: usize, out_w: usize) -> Result<Tensor> {
    let src = images.to_f64_vec();
    let (h, w, c) = (layout.h, layout.w, layout.c);

    let axis = |src_len: usize, dst_len: usize| -> Vec<(usize, usize, f64)> {
        (0..dst_len)
            .map(|d| {
                let s = source_coord(d, src_len, dst_len);
                let lo = s.floor() as usize;
                (lo, (lo + 1).min(src_len - 1), s - lo as f64)
            })
            .collect()
    };
    let rows = axis(h, out_h);
    let cols = axis(w, out_w);

    let mut out = Vec::with_capacity(layout.n * out_h * out_w * c);
    for i in 0..layout.n {
        let base = i * h * w * c;
        for &(y0, y1, fy) in &rows {
            for &(x0, x1, fx) in &cols {
                for ch in 0..c {
                    let at = |y: usize, x: usize| src[base + (y * w + x) * c + ch];
                    let top = at(y0, x0) * (1.0 - fx) + at(y0, x1) * fx;
                    let bottom = at(y1, x0) * (1.0 - fx) + at(y1, x1) * fx;
                    out.push(top * (1.0 - fy) + bottom * fy);
                }
            }
        }
    }

    Tensor::from_f64(vec![layout.n, out_h, out_w, c], images.dtype(), &out)
}

impl Transform for Resize {
    fn name(&self) -> &'static str {
        "resize"
    }

    fn apply(&self, batch: Batch, _deterministic: bool, _rng: &mut StdRng) -> Result<Batch> {
        let images = batch.require(IMAGES)?;
        let layout = Layout::of(self.name(), images)?;
        if layout.h == 0 || layout.w == 0 {
            return Err(invalid(self.name(), "cannot resize an empty image"));
        }

        let (out_h, out_w) = self.output_size(layout);
        let resized = match self.interpolation {
            Interpolation::Nearest => resize_nearest(images, layout, out_h, out_w)?,
            Interpolation::Bilinear => resize_bilinear(images, layout, out_h, out_w)?,
        };
        Ok(replace_images(batch, resized))
    }
}

// ========== FlipX ==========

/// Mirror each image horizontally with probability 1/2
///
/// Identity when deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlipX;

fn flip_x(images: &Tensor, layout: Layout, flips: &[bool]) -> Result<Tensor> {
    let pixel = layout.pixel();
    let data = images.data();
    let mut buf = BytesMut::with_capacity(data.len());

    for (i, &flip) in flips.iter().enumerate() {
        for y in 0..layout.h {
            let row = i * layout.image() + y * layout.row();
            if flip {
                for x in (0..layout.w).rev() {
                    let p = row + x * pixel;
                    buf.extend_from_slice(&data[p..p + pixel]);
                }
            } else {
                buf.extend_from_slice(&data[row..row + layout.row()]);
            }
        }
    }

    Tensor::from_bytes(images.shape().to_vec(), images.dtype(), buf.freeze())
}

impl Transform for FlipX {
    fn name(&self) -> &'static str {
        "flip_x"
    }

    fn apply(&self, batch: Batch, deterministic: bool, rng: &mut StdRng) -> Result<Batch> {
        if deterministic {
            return Ok(batch);
        }
        let images = batch.require(IMAGES)?;
        let layout = Layout::of(self.name(), images)?;
        let flips: Vec<bool> = (0..layout.n).map(|_| rng.gen_bool(0.5)).collect();
        let flipped = flip_x(images, layout, &flips)?;
        Ok(replace_images(batch, flipped))
    }
}

// ========== Rescale ==========

/// `(x - offset) * scale`, emitted as `f32`
#[derive(Debug, Clone, Copy)]
pub struct Rescale {
    scale: f64,
    offset: f64,
}

impl Rescale {
    pub fn new(scale: f64, offset: f64) -> Self {
        Self { scale, offset }
    }
}

impl Default for Rescale {
    fn default() -> Self {
        Self::new(1.0 / 128.0, 128.0)
    }
}

impl Transform for Rescale {
    fn name(&self) -> &'static str {
        "rescale"
    }

    fn apply(&self, batch: Batch, _deterministic: bool, _rng: &mut StdRng) -> Result<Batch> {
        let images = batch.require(IMAGES)?;
        let values: Vec<f64> = images
            .to_f64_vec()
            .into_iter()
            .map(|x| (x - self.offset) * self.scale)
            .collect();
        let rescaled = Tensor::from_f64(images.shape().to_vec(), DType::F32, &values)?;
        Ok(replace_images(batch, rescaled))
    }
}

// ========== Slicer ==========

/// Crop a window whose sides are fractions of the image
///
/// Offsets are fractional margins kept clear on both sides of each axis.
/// The window is centered when deterministic and placed uniformly at
/// random inside the margins otherwise.
#[derive(Debug, Clone, Copy)]
pub struct Slicer {
    height: f64,
    width: f64,
    yoffset: f64,
    xoffset: f64,
}

impl Slicer {
    pub fn new(height: f64, width: f64, yoffset: f64, xoffset: f64) -> Result<Self> {
        for (what, side) in [("height", height), ("width", width)] {
            if side.is_nan() || side <= 0.0 || side > 1.0 {
                return Err(invalid("slicer", format!("{} must be in (0, 1], got {}", what, side)));
            }
        }
        for (what, offset) in [("yoffset", yoffset), ("xoffset", xoffset)] {
            if !(0.0..=1.0).contains(&offset) {
                let reason = format!("{} must be in [0, 1], got {}", what, offset);
                return Err(invalid("slicer", reason));
            }
        }
        Ok(Self {
            height,
            width,
            yoffset,
            xoffset,
        })
    }
}

/// Window length and the free range for its start along one axis
fn window(axis: &str, len: usize, side: f64, offset: f64) -> Result<(usize, usize, usize)> {
    let size = (side * len as f64) as usize;
    let margin = (offset * len as f64) as usize;
    if size == 0 {
        return Err(invalid("slicer", format!("window {} rounds to zero for {} pixels", axis, len)));
    }
    let room = len
        .checked_sub(2 * margin)
        .and_then(|free| free.checked_sub(size))
        .ok_or_else(|| {
            invalid(
                "slicer",
                format!("cannot fit a {} window of {} with {} offset {}", axis, size, axis, margin),
            )
        })?;
    Ok((size, margin, room))
}

impl Transform for Slicer {
    fn name(&self) -> &'static str {
        "slicer"
    }

    fn apply(&self, batch: Batch, deterministic: bool, rng: &mut StdRng) -> Result<Batch> {
        let images = batch.require(IMAGES)?;
        let layout = Layout::of(self.name(), images)?;
        let (win_h, margin_y, room_y) = window("height", layout.h, self.height, self.yoffset)?;
        let (win_w, margin_x, room_x) = window("width", layout.w, self.width, self.xoffset)?;

        let origins: Vec<(usize, usize)> = (0..layout.n)
            .map(|_| {
                if deterministic {
                    (margin_y + room_y / 2, margin_x + room_x / 2)
                } else {
                    (margin_y + rng.gen_range(0..=room_y), margin_x + rng.gen_range(0..=room_x))
                }
            })
            .collect();

        let sliced = crop(images, layout, win_h, win_w, &origins)?;
        Ok(replace_images(batch, sliced))
    }
}

// ========== TopCenterCrop ==========

/// Crop `height x width` from the top edge, centered horizontally
///
/// Only the deterministic variant exists; applying it in random mode is an
/// error.
#[derive(Debug, Clone, Copy)]
pub struct TopCenterCrop {
    height: usize,
    width: usize,
}

impl TopCenterCrop {
    pub fn new(height: usize, width: usize) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(invalid("top_center_crop", "crop sides must be positive"));
        }
        Ok(Self { height, width })
    }
}

impl Transform for TopCenterCrop {
    fn name(&self) -> &'static str {
        "top_center_crop"
    }

    fn apply(&self, batch: Batch, deterministic: bool, _rng: &mut StdRng) -> Result<Batch> {
        if !deterministic {
            return Err(invalid(self.name(), "random top-center cropping is not supported"));
        }
        let images = batch.require(IMAGES)?;
        let layout = Layout::of(self.name(), images)?;
        if self.height > layout.h || self.width > layout.w {
            return Err(invalid(
                self.name(),
                format!(
                    "crop {}x{} is larger than image {}x{}",
                    self.height, self.width, layout.h, layout.w
                ),
            ));
        }

        let left = (layout.w - self.width) / 2;
        let origins = vec![(0, left); layout.n];
        let cropped = crop(images, layout, self.height, self.width, &origins)?;
        Ok(replace_images(batch, cropped))
    }
}

// ========== AdditiveNoise ==========

/// Add `strength * N(mu, sigma)` per element, emitted as `f32`
///
/// Identity when deterministic.
#[derive(Debug, Clone, Copy)]
pub struct AdditiveNoise {
    strength: f64,
    mu: f64,
    sigma: f64,
}

impl AdditiveNoise {
    pub fn new(strength: f64, mu: f64, sigma: f64) -> Result<Self> {
        if !sigma.is_finite() || sigma < 0.0 {
            let reason = format!("sigma must be finite and >= 0, got {}", sigma);
            return Err(invalid("additive_noise", reason));
        }
        Ok(Self { strength, mu, sigma })
    }
}

impl Default for AdditiveNoise {
    fn default() -> Self {
        Self {
            strength: 0.2,
            mu: 0.0,
            sigma: 50.0,
        }
    }
}

/// One standard normal draw (Box-Muller)
fn standard_normal(rng: &mut StdRng) -> f64 {
    // gen::<f64>() is in [0, 1); shift to (0, 1] so ln stays finite
    let u1 = 1.0 - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

impl Transform for AdditiveNoise {
    fn name(&self) -> &'static str {
        "additive_noise"
    }

    fn apply(&self, batch: Batch, deterministic: bool, rng: &mut StdRng) -> Result<Batch> {
        if deterministic {
            return Ok(batch);
        }
        let images = batch.require(IMAGES)?;
        let values: Vec<f64> = images
            .to_f64_vec()
            .into_iter()
            .map(|x| x + self.strength * (self.mu + self.sigma * standard_normal(rng)))
            .collect();
        let noisy = Tensor::from_f64(images.shape().to_vec(), DType::F32, &values)?;
        Ok(replace_images(batch, noisy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::LABELS;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    /// 1 image, 2x3 pixels, 1 channel, values 0..6
    fn ramp() -> Batch {
        Batch::new()
            .with(IMAGES, Tensor::from_vec(vec![1, 2, 3, 1], vec![0u8, 1, 2, 3, 4, 5]).unwrap())
            .with(LABELS, Tensor::from_vec(vec![1], vec![9i64]).unwrap())
    }

    fn pixels(batch: &Batch) -> Vec<u8> {
        batch.get(IMAGES).unwrap().to_vec::<u8>().unwrap()
    }

    #[test]
    fn test_resize_exact_shape() {
        let batch = Batch::new().with(IMAGES, Tensor::zeros(vec![2, 32, 24, 3], DType::U8));
        let resize = Resize::exact(25, 25, Interpolation::Bilinear).unwrap();
        let out = resize.apply(batch, false, &mut rng()).unwrap();
        assert_eq!(out.get(IMAGES).unwrap().shape(), &[2, 25, 25, 3]);
        assert_eq!(out.get(IMAGES).unwrap().dtype(), DType::U8);
    }

    #[test]
    fn test_resize_width_keeps_aspect() {
        let batch = Batch::new().with(IMAGES, Tensor::zeros(vec![1, 40, 20, 1], DType::F32));
        let out = Resize::width(10, Interpolation::Nearest)
            .unwrap()
            .apply(batch, true, &mut rng())
            .unwrap();
        assert_eq!(out.get(IMAGES).unwrap().shape(), &[1, 20, 10, 1]);
    }

    #[test]
    fn test_resize_identity_size_is_lossless() {
        let batch = ramp();
        for interpolation in [Interpolation::Nearest, Interpolation::Bilinear] {
            let out = Resize::exact(2, 3, interpolation)
                .unwrap()
                .apply(batch.clone(), true, &mut rng())
                .unwrap();
            assert_eq!(pixels(&out), pixels(&batch));
        }
    }

    #[test]
    fn test_resize_rejects_non_images() {
        let batch = Batch::new().with(IMAGES, Tensor::zeros(vec![4, 4], DType::U8));
        let err = Resize::exact(2, 2, Interpolation::Nearest)
            .unwrap()
            .apply(batch, true, &mut rng())
            .unwrap_err();
        assert!(matches!(err, HighwayError::InvalidTransform { .. }));
        assert!(Resize::exact(0, 2, Interpolation::Nearest).is_err());
    }

    #[test]
    fn test_flip_x() {
        let images = Tensor::from_vec(vec![1, 2, 3, 1], vec![0u8, 1, 2, 3, 4, 5]).unwrap();
        let layout = Layout::of("flip_x", &images).unwrap();
        let flipped = flip_x(&images, layout, &[true]).unwrap();
        assert_eq!(flipped.to_vec::<u8>().unwrap(), vec![2, 1, 0, 5, 4, 3]);

        let batch = ramp();
        assert_eq!(FlipX.apply(batch.clone(), true, &mut rng()).unwrap(), batch);
    }

    #[test]
    fn test_rescale() {
        let out = Rescale::new(0.5, 2.0).apply(ramp(), false, &mut rng()).unwrap();
        let images = out.get(IMAGES).unwrap();
        assert_eq!(images.dtype(), DType::F32);
        assert_eq!(images.to_vec::<f32>().unwrap(), vec![-1.0, -0.5, 0.0, 0.5, 1.0, 1.5]);
        assert!(out.get(LABELS).is_some());
    }

    #[test]
    fn test_slicer_centered_when_deterministic() {
        let batch = Batch::new().with(
            IMAGES,
            Tensor::from_vec(vec![1, 1, 5, 1], vec![0u8, 1, 2, 3, 4]).unwrap(),
        );
        let slicer = Slicer::new(1.0, 0.6, 0.0, 0.0).unwrap();
        let out = slicer.apply(batch, true, &mut rng()).unwrap();
        assert_eq!(pixels(&out), vec![1, 2, 3]);
    }

    #[test]
    fn test_slicer_validation() {
        assert!(Slicer::new(0.0, 1.0, 0.0, 0.0).is_err());
        assert!(Slicer::new(1.0, 1.0, 1.2, 0.0).is_err());

        // margins of 2 on each side leave 1 pixel for a 3 pixel window
        let slicer = Slicer::new(1.0, 0.6, 0.0, 0.4).unwrap();
        let batch = Batch::new().with(IMAGES, Tensor::zeros(vec![1, 1, 5, 1], DType::U8));
        assert!(slicer.apply(batch, true, &mut rng()).is_err());
    }

    #[test]
    fn test_slicer_random_stays_in_bounds() {
        let batch = Batch::new().with(IMAGES, Tensor::zeros(vec![8, 10, 10, 3], DType::U8));
        let slicer = Slicer::new(0.5, 0.5, 0.1, 0.1).unwrap();
        let out = slicer.apply(batch, false, &mut rng()).unwrap();
        assert_eq!(out.get(IMAGES).unwrap().shape(), &[8, 5, 5, 3]);
    }

    #[test]
    fn test_top_center_crop() {
        let crop = TopCenterCrop::new(1, 1).unwrap();
        let out = crop.apply(ramp(), true, &mut rng()).unwrap();
        assert_eq!(pixels(&out), vec![1]);
        assert!(crop.apply(ramp(), false, &mut rng()).is_err());
        assert!(TopCenterCrop::new(3, 1).unwrap().apply(ramp(), true, &mut rng()).is_err());
    }

    #[test]
    fn test_additive_noise() {
        let batch = ramp();
        let noise = AdditiveNoise::default();
        assert_eq!(noise.apply(batch.clone(), true, &mut rng()).unwrap(), batch);

        let a = noise.apply(batch.clone(), false, &mut rng()).unwrap();
        let b = noise.apply(batch, false, &mut rng()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.get(IMAGES).unwrap().dtype(), DType::F32);
        assert!(AdditiveNoise::new(0.2, 0.0, -1.0).is_err());
    }
}
