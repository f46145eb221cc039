use candle_core::{DType, Device, IndexOp, Result, Tensor};
use image::{DynamicImage, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Channels of the Stable Diffusion latent space.
pub const LATENT_CHANNELS: usize = 4;

/// The VAE downsamples each spatial dimension by this factor.
pub const VAE_DOWNSAMPLE: usize = 8;

/// Returns the caller's seed, or a freshly drawn one so the run can be reproduced later.
pub fn resolve_seed(seed: Option<u64>) -> u64 {
    seed.unwrap_or_else(rand::random)
}

/// Standard normal noise for the initial latents, drawn on the host so that a seed gives
/// the same starting point on every device.
pub fn initial_latents(seed: u64, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let shape = (
        1,
        LATENT_CHANNELS,
        height / VAE_DOWNSAMPLE,
        width / VAE_DOWNSAMPLE,
    );
    let count = shape.1 * shape.2 * shape.3;
    let mut rng = StdRng::seed_from_u64(seed);
    let noise: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_vec(noise, shape, device)
}

/// Maps a decoded VAE batch `(1, 3, h, w)` with values in `[-1, 1]` to an 8-bit RGB image.
pub fn decoded_to_image(decoded: &Tensor) -> Result<DynamicImage> {
    let rgb = ((decoded.to_device(&Device::Cpu)?.to_dtype(DType::F32)? / 2.)? + 0.5)?
        .clamp(0f32, 1f32)?;
    let rgb = (rgb * 255.)?.round()?.to_dtype(DType::U8)?.i(0)?;
    let (channels, height, width) = rgb.dims3()?;
    if channels != 3 {
        candle_core::bail!("decoded image has {channels} channels, expected 3");
    }
    let pixels = rgb.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| candle_core::Error::Msg("decoded pixels do not fill the image".into()))
}
