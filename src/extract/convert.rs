//! Legacy `.ppt` conversion via headless LibreOffice.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::info;

use crate::error::{Error, Result};

/// Convert a legacy `.ppt` file to PDF, writing next to `out_dir`.
/// Returns the path of the generated PDF.
pub async fn convert_ppt_to_pdf(ppt_path: &Path, out_dir: &Path) -> Result<PathBuf> {
    which::which("soffice")
        .map_err(|_| Error::PermanentExternal("external tool not found: soffice".into()))?;

    let output = Command::new("soffice")
        .arg("--headless")
        .arg("--convert-to")
        .arg("pdf")
        .arg("--outdir")
        .arg(out_dir)
        .arg(ppt_path)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::PermanentExternal(format!(
            "ppt conversion failed: {stderr}"
        )));
    }

    let stem = ppt_path
        .file_stem()
        .ok_or_else(|| Error::InputInvalid("ppt path has no file name".into()))?;
    let pdf_path = out_dir.join(format!("{}.pdf", stem.to_string_lossy()));

    if !pdf_path.exists() {
        return Err(Error::PermanentExternal(
            "ppt conversion reported success but produced no pdf".into(),
        ));
    }

    info!(from = %ppt_path.display(), to = %pdf_path.display(), "converted legacy ppt");
    Ok(pdf_path)
}
