use anyhow::{Context, Result};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Extensiones que cuentan como archivo válido en la carpeta de descargas.
pub const KNOWN_EXTENSIONS: [&str; 4] = ["mp3", "m4a", "webm", "mp4"];

/// Carpeta de descargas compartida por todos los chats, indexada por id de medio.
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, ext))
    }

    /// Plantilla de salida para yt-dlp: `<dir>/<id>.%(ext)s`
    pub fn output_template(&self, id: &str) -> String {
        self.dir.join(format!("{}.%(ext)s", id)).to_string_lossy().into_owned()
    }

    /// Busca un archivo ya descargado para `id`.
    pub async fn find_cached(&self, id: &str, want_video: bool) -> Option<PathBuf> {
        find_media(&self.dir, id, want_video).await
    }

    /// Carpeta temporal dentro del store para que yt-dlp escriba ahí.
    ///
    /// Se borra al soltarla, junto con cualquier archivo a medio escribir.
    pub async fn staging(&self) -> Result<TempDir> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || tempfile::Builder::new().prefix(".staging-").tempdir_in(&dir))
            .await?
            .context("Error creando carpeta temporal de descarga")
    }

    /// Mueve un archivo terminado a `<dir>/<name>`.
    pub async fn adopt(&self, staged: &Path, name: &str) -> Result<PathBuf> {
        let target = self.dir.join(name);
        tokio::fs::rename(staged, &target)
            .await
            .with_context(|| format!("Error guardando {}", target.display()))?;
        Ok(target)
    }

    /// Descarga `url` a `<id>.<ext>`.
    ///
    /// El cuerpo se escribe en un temporal único dentro de la carpeta y se renombra
    /// al final, así una descarga interrumpida nunca queda como falso acierto de caché.
    pub async fn download(&self, client: &reqwest::Client, url: &str, id: &str, ext: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let response = client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Error descargando {}", url))?
            .error_for_status()?;

        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", id))
            .suffix(".part")
            .tempfile_in(&self.dir)?
            .into_temp_path();

        let mut file = tokio::fs::File::create(&temp).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk: bytes::Bytes = chunk.context("Error leyendo el cuerpo de la descarga")?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let target = self.path_for(id, ext);
        temp.persist(&target)
            .with_context(|| format!("Error guardando {}", target.display()))?;

        info!("💾 Descargado {} ({} bytes)", target.display(), written);
        Ok(target)
    }
}

/// Extensiones aceptadas según el tipo de medio. Video sólo acepta `mp4`,
/// que es el contenedor de la mezcla video+audio.
pub fn media_extensions(want_video: bool) -> &'static [&'static str] {
    if want_video {
        &["mp4"]
    } else {
        &KNOWN_EXTENSIONS
    }
}

/// Primer `<dir>/<id>.<ext>` existente para el tipo de medio pedido.
pub async fn find_media(dir: &Path, id: &str, want_video: bool) -> Option<PathBuf> {
    for ext in media_extensions(want_video) {
        let path = dir.join(format!("{}.{}", id, ext));
        if tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
            return Some(path);
        }
    }
    None
}

/// Deduce la extensión de una URL de descarga, si es conocida.
pub fn extension_from_url(url: &str) -> Option<&'static str> {
    let path = url::Url::parse(url).ok()?.path().to_lowercase();
    let ext = path.rsplit('.').next()?;
    let found = KNOWN_EXTENSIONS.iter().copied().find(|known| *known == ext);
    if found.is_none() {
        debug!("Extensión desconocida en {}", url);
    }
    found
}
