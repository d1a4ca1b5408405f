use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Pool de archivos de cookies para yt-dlp.
///
/// Cada invocación elige uno al azar para repartir el rate limiting entre
/// cuentas. No hay garantía de equidad en la rotación.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    dir: PathBuf,
}

impl CredentialPool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Elige un `*.txt` al azar, o `None` si el directorio no existe o está vacío.
    pub async fn pick(&self) -> Option<PathBuf> {
        let files = self.list().await;
        let chosen = files.choose(&mut rand::thread_rng()).cloned();
        if let Some(path) = &chosen {
            debug!("🍪 Usando cookies: {}", path.display());
        }
        chosen
    }

    /// Argumentos `--cookies <archivo>` listos para yt-dlp.
    pub async fn args(&self) -> Vec<String> {
        match self.pick().await {
            Some(path) => vec!["--cookies".to_string(), path.to_string_lossy().into_owned()],
            None => Vec::new(),
        }
    }

    async fn list(&self) -> Vec<PathBuf> {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return Vec::new();
        };

        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_file = tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false);
            if is_file && has_txt_extension(&path) {
                files.push(path);
            }
        }
        files
    }
}

fn has_txt_extension(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("txt")
}
