use candle_core::{Device, Result, Shape, Tensor};

/// PCG32 generator used for every random draw in the pipeline.
///
/// Candle's own `randn` cannot be seeded on CPU, so noise is generated on the
/// host from this generator and uploaded. The same seed yields the same noise
/// on every device.
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

/// Default PCG stream selector
pub const DEFAULT_STREAM: u64 = 1442695040888963407;

impl Pcg32 {
    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (stream << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(seed, DEFAULT_STREAM)
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old
            .wrapping_mul(6364136223846793005)
            .wrapping_add(self.inc);
        // XSH-RR output
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform float in [0, 1) with 24 bits of precision
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * (1.0 / 16_777_216.0)
    }

    /// Two independent standard normals (Box-Muller)
    pub fn next_gaussian_pair(&mut self) -> (f32, f32) {
        let u1 = loop {
            let x = self.next_f32();
            if x > 1e-7 {
                break x;
            }
        };
        let u2 = self.next_f32();

        let mag = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f32::consts::PI * u2;
        (mag * angle.cos(), mag * angle.sin())
    }

    /// Standard-normal f32 tensor of the given shape
    pub fn randn(&mut self, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let count = shape.elem_count();
        let mut data = Vec::with_capacity(count + 1);
        while data.len() < count {
            let (z0, z1) = self.next_gaussian_pair();
            data.push(z0);
            data.push(z1);
        }
        data.truncate(count);
        Tensor::from_vec(data, shape, device)
    }
}
