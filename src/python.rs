//! Python bindings
//!
//! Built with `--features python` (e.g. via maturin).

use std::path::PathBuf;

use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict};

use crate::device::{AnyDevice, BackendOptions, CpuGridOptions, Device, VulkanOptions};
use crate::dispatch::{BatchHasher, DispatchConfig};
use crate::error::EngineError;
use crate::sha256::{DIGEST_LEN, RECORD_LEN};

/// Batch SHA-256 engine over 33-byte records.
///
/// # Python Example
///
/// ```python
/// from sha256_lanes import Sha256Lanes
///
/// engine = Sha256Lanes("vulkan", kernel_path="shaders/sha256_lane.spv")
/// print(f"Using: {engine.device_name}")
///
/// records = bytes.fromhex("0279be66...") * 1000
/// digests = engine.hash_batch(records)   # 32 bytes per record
/// ```
#[pyclass]
pub struct Sha256Lanes {
    /// Name of the device running the lanes
    #[pyo3(get)]
    pub device_name: String,

    hasher: BatchHasher<AnyDevice>,
}

#[pymethods]
impl Sha256Lanes {
    /// Open an engine.
    ///
    /// # Arguments
    ///
    /// * `backend` - `"cpu"` or `"vulkan"` (default: `"cpu"`)
    /// * `kernel_path` - compiled lane kernel, Vulkan only
    /// * `device_index` - GPU index, Vulkan only
    /// * `group_size` - lanes per execution group
    ///
    /// # Raises
    ///
    /// * `ValueError` - unknown backend or zero group size
    /// * `RuntimeError` - device or kernel initialization failed
    #[new]
    #[pyo3(signature = (backend="cpu", kernel_path=None, device_index=0, group_size=128))]
    pub fn new(
        backend: &str,
        kernel_path: Option<PathBuf>,
        device_index: usize,
        group_size: u32,
    ) -> PyResult<Self> {
        let options = match backend {
            "cpu" => BackendOptions::Cpu(CpuGridOptions::default()),
            "vulkan" => {
                let mut opts = VulkanOptions { device_index, ..Default::default() };
                if let Some(path) = kernel_path {
                    opts.kernel_path = path;
                }
                BackendOptions::Vulkan(opts)
            }
            other => {
                return Err(EngineError::PreconditionViolation(format!(
                    "unknown backend '{}' (expected 'cpu' or 'vulkan')",
                    other
                ))
                .into())
            }
        };

        let hasher = BatchHasher::open(&options, DispatchConfig { group_size })?;
        let device_name = hasher.device().map(|d| d.name().to_string()).unwrap_or_default();

        Ok(Self { device_name, hasher })
    }

    /// Hash packed records (`len(records)` must be a multiple of 33).
    ///
    /// Returns the packed digests, 32 bytes per record, in input order.
    pub fn hash_batch<'py>(&self, py: Python<'py>, records: &[u8]) -> PyResult<Bound<'py, PyBytes>> {
        if records.len() % RECORD_LEN != 0 {
            return Err(EngineError::PreconditionViolation(format!(
                "input length {} is not a multiple of {}",
                records.len(),
                RECORD_LEN
            ))
            .into());
        }
        let count = records.len() / RECORD_LEN;
        let mut output = vec![0u8; count * DIGEST_LEN];

        py.allow_threads(|| self.hasher.hash_batch(records, &mut output, count))?;

        Ok(PyBytes::new_bound(py, &output))
    }

    /// Engine counters.
    ///
    /// # Returns
    ///
    /// Dict with `batches`, `lanes`, `failures` and `busy_seconds`.
    pub fn stats(&self, py: Python<'_>) -> PyResult<PyObject> {
        let stats = self.hasher.stats();

        let dict = PyDict::new_bound(py);
        dict.set_item("batches", stats.batches)?;
        dict.set_item("lanes", stats.lanes)?;
        dict.set_item("failures", stats.failures)?;
        dict.set_item("busy_seconds", stats.busy.as_secs_f64())?;

        Ok(dict.into())
    }

    /// Release the device. Later `hash_batch` calls raise `RuntimeError`.
    pub fn shutdown(&mut self) {
        self.hasher.shutdown();
    }

    fn __repr__(&self) -> String {
        format!(
            "Sha256Lanes(device='{}', group_size={})",
            self.device_name,
            self.hasher.config().group_size
        )
    }
}

#[pymodule]
fn sha256_lanes(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let _ = env_logger::try_init();
    m.add_class::<Sha256Lanes>()?;
    m.add("RECORD_LEN", RECORD_LEN)?;
    m.add("DIGEST_LEN", DIGEST_LEN)?;
    Ok(())
}
