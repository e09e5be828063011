//! Notebook export.
//!
//! An exporter turns a notebook into bytes; the session decides where the
//! bytes go and when.

use std::path::Path;

use techo_types::Notebook;

/// Serializes a notebook to a file format.
pub trait Exporter: Send + Sync {
    /// Get the exporter name.
    fn name(&self) -> &str;

    /// File extension without the dot.
    fn extension(&self) -> &str;

    fn export(&self, notebook: &Notebook) -> anyhow::Result<Vec<u8>>;
}

/// Exports the notebook document as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonExporter {
    pub pretty: bool,
}

impl JsonExporter {
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl Exporter for JsonExporter {
    fn name(&self) -> &str {
        "json"
    }

    fn extension(&self) -> &str {
        "json"
    }

    fn export(&self, notebook: &Notebook) -> anyhow::Result<Vec<u8>> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(notebook)?
        } else {
            serde_json::to_vec(notebook)?
        };
        Ok(bytes)
    }
}

/// Export `notebook` and write it to `path`, creating parent directories.
///
/// Returns the number of bytes written.
pub async fn write_export(
    exporter: &dyn Exporter,
    notebook: &Notebook,
    path: &Path,
) -> anyhow::Result<usize> {
    let bytes = exporter.export(notebook)?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, &bytes).await?;
    Ok(bytes.len())
}
