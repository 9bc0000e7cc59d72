//! Raw dump of final latents for offline inspection.
//!
//! Format (little-endian):
//! - magic: `b"SDVL"`
//! - ndims: u32
//! - dims: ndims * u64
//! - data: f32 * product(dims), row-major

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use candle_core::{DType, Device, Result, Tensor};

const MAGIC: &[u8; 4] = b"SDVL";
const MAX_DIMS: usize = 8;

pub fn save_latents(path: impl AsRef<Path>, tensor: &Tensor) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(MAGIC)?;
    out.write_all(&(tensor.rank() as u32).to_le_bytes())?;
    for &d in tensor.dims() {
        out.write_all(&(d as u64).to_le_bytes())?;
    }

    let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    for v in data {
        out.write_all(&v.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

pub fn load_latents(path: impl AsRef<Path>, device: &Device) -> Result<Tensor> {
    let mut input = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        candle_core::bail!("not a latent dump (bad magic {magic:?})");
    }

    let mut u32_buf = [0u8; 4];
    input.read_exact(&mut u32_buf)?;
    let ndims = u32::from_le_bytes(u32_buf) as usize;
    if ndims > MAX_DIMS {
        candle_core::bail!("latent dump has {ndims} dims, at most {MAX_DIMS} supported");
    }

    let mut u64_buf = [0u8; 8];
    let mut dims = Vec::with_capacity(ndims);
    for _ in 0..ndims {
        input.read_exact(&mut u64_buf)?;
        dims.push(u64::from_le_bytes(u64_buf) as usize);
    }

    let numel: usize = dims.iter().product();
    let mut bytes = vec![0u8; numel * 4];
    input.read_exact(&mut bytes)?;
    let data: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Tensor::from_vec(data, dims, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_then_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("latents.bin");
        let t = Tensor::arange(0f32, 24f32, &Device::Cpu)?.reshape((1, 4, 2, 3, 1))?;
        save_latents(&path, &t)?;
        let loaded = load_latents(&path, &Device::Cpu)?;
        assert_eq!(loaded.dims(), t.dims());
        assert_eq!(
            loaded.flatten_all()?.to_vec1::<f32>()?,
            t.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_rejects_foreign_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, b"JUNKJUNK")?;
        assert!(load_latents(&path, &Device::Cpu).is_err());
        Ok(())
    }
}
