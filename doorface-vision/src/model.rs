use std::path::Path;

use anyhow::{Context, Result};
#[cfg(any(feature = "openvino", feature = "cuda"))]
use ort::ep::{self, ExecutionProvider};
use ort::session::{
    builder::{GraphOptimizationLevel, SessionBuilder},
    Session,
};

/// Builder with the execution providers compiled in through cargo features.
/// Providers missing from the linked runtime leave inference on the CPU.
fn session_builder() -> Result<SessionBuilder> {
    #[allow(unused_mut)]
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    #[cfg(feature = "openvino")]
    use_provider(&mut builder, ep::OpenVINO::default(), "openvino")?;
    #[cfg(feature = "cuda")]
    use_provider(&mut builder, ep::CUDA::default(), "cuda")?;

    Ok(builder)
}

#[cfg(any(feature = "openvino", feature = "cuda"))]
fn use_provider<E: ExecutionProvider>(
    builder: &mut SessionBuilder,
    provider: E,
    name: &str,
) -> Result<()> {
    if E::is_available()? {
        provider.register(builder)?;
        log::info!("detector runs on the {} execution provider", name);
    } else {
        log::warn!("{name} feature is enabled, onnx runtime not compiled with {name}");
    }
    Ok(())
}

/// Load the YuNet face detector from an ONNX file on disk.
pub fn detector_session(path: &Path) -> Result<Session> {
    if !path.is_file() {
        anyhow::bail!("detector model {} not found", path.display());
    }
    session_builder()?
        .commit_from_file(path)
        .with_context(|| format!("load detector model {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_is_reported_with_its_path() {
        let err = detector_session(Path::new("/nonexistent/yunet.onnx")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("not found"), "{msg}");
        assert!(msg.contains("/nonexistent/yunet.onnx"), "{msg}");
    }
}
