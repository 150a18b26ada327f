//! Lane kernel loading and SPIR-V header checks
//!
//! The lane kernel ships as a SPIR-V binary produced from
//! `shaders/sha256_lane.comp`. Catching a truncated or mis-built file
//! here gives a clearer error than whatever the driver reports.

use std::path::Path;

use crate::error::{EngineError, Result};

/// SPIR-V magic number as the first little-endian word.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Header is five words.
const HEADER_LEN: usize = 20;

/// Check the SPIR-V header: size, alignment, magic, version 1.0-1.6,
/// non-zero id bound.
///
/// This is not a full validator (use `spirv-val` for that).
pub fn validate_spirv(bytes: &[u8]) -> Result<()> {
    if bytes.len() < HEADER_LEN {
        return Err(EngineError::InvalidKernel(format!(
            "SPIR-V too small: {} bytes (minimum {})",
            bytes.len(),
            HEADER_LEN
        )));
    }

    if bytes.len() % 4 != 0 {
        return Err(EngineError::InvalidKernel(format!(
            "SPIR-V size ({}) not 4-byte aligned",
            bytes.len()
        )));
    }

    let word = |i: usize| u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]]);

    let magic = word(0);
    if magic != SPIRV_MAGIC {
        return Err(EngineError::InvalidKernel(format!(
            "invalid SPIR-V magic 0x{:08x} (expected 0x{:08x})",
            magic, SPIRV_MAGIC
        )));
    }

    let version = word(1);
    let major = (version >> 16) & 0xFF;
    let minor = (version >> 8) & 0xFF;
    if major != 1 || minor > 6 {
        return Err(EngineError::InvalidKernel(format!(
            "unsupported SPIR-V version {}.{} (supported: 1.0-1.6)",
            major, minor
        )));
    }

    let bound = word(3);
    if bound == 0 {
        return Err(EngineError::InvalidKernel("SPIR-V id bound is 0".to_string()));
    }

    log::trace!(
        "SPIR-V header ok: version {}.{}, bound {}, {} bytes",
        major,
        minor,
        bound,
        bytes.len()
    );

    Ok(())
}

/// Validated SPIR-V as little-endian words.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    validate_spirv(bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Read and validate a kernel binary from disk.
pub fn load_kernel(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path).map_err(|e| {
        EngineError::KernelLoadFailed(format!("failed to read {}: {}", path.display(), e))
    })?;
    log::debug!("Read lane kernel {} ({} bytes)", path.display(), bytes.len());
    spirv_words(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Version word layout: bits 16-23 major, bits 8-15 minor.
    fn header() -> Vec<u8> {
        vec![
            0x03, 0x02, 0x23, 0x07, // magic
            0x00, 0x00, 0x01, 0x00, // version 1.0
            0x00, 0x00, 0x00, 0x00, // generator
            0x01, 0x00, 0x00, 0x00, // bound = 1
            0x00, 0x00, 0x00, 0x00, // schema
        ]
    }

    fn message(result: Result<()>) -> String {
        match result {
            Err(EngineError::InvalidKernel(msg)) => msg,
            other => panic!("expected InvalidKernel, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_header() {
        assert!(validate_spirv(&header()).is_ok());
        assert_eq!(spirv_words(&header()).unwrap()[0], SPIRV_MAGIC);
    }

    #[test]
    fn test_truncated() {
        assert!(message(validate_spirv(&header()[..8])).contains("too small"));
    }

    #[test]
    fn test_unaligned() {
        let mut spirv = header();
        spirv.push(0);
        assert!(message(validate_spirv(&spirv)).contains("aligned"));
    }

    #[test]
    fn test_bad_magic() {
        let mut spirv = header();
        spirv[0] = 0;
        assert!(message(validate_spirv(&spirv)).contains("magic"));
    }

    #[test]
    fn test_version_window() {
        let mut spirv = header();
        spirv[5] = 0x06;
        assert!(validate_spirv(&spirv).is_ok());

        spirv[5] = 0x07;
        assert!(message(validate_spirv(&spirv)).contains("version"));

        spirv[5] = 0x00;
        spirv[6] = 0x02;
        assert!(validate_spirv(&spirv).is_err());
    }

    #[test]
    fn test_zero_bound() {
        let mut spirv = header();
        spirv[12] = 0;
        assert!(message(validate_spirv(&spirv)).contains("bound"));
    }

    #[test]
    fn test_missing_kernel_file() {
        let err = load_kernel(Path::new("/nonexistent/sha256_lane.spv")).unwrap_err();
        assert!(matches!(err, EngineError::KernelLoadFailed(_)));
    }
}
