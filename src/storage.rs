use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info};

const BANNED_FILE: &str = "banned_users.json";
const GBANNED_FILE: &str = "gbanned_users.json";

/// Manager de almacenamiento basado en archivos JSON
///
/// Cada lista es un arreglo JSON de ids de usuario. Un archivo ausente es una
/// lista vacía.
pub struct JsonStorage {
    data_dir: PathBuf,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir).await?;
        info!("📁 Storage inicializado en: {}", data_dir.display());
        Ok(Self { data_dir })
    }

    /// Usuarios bloqueados en este bot más los bloqueados globalmente.
    pub async fn load_banned(&self) -> Result<BTreeSet<i64>> {
        let mut users = self.read_list(BANNED_FILE).await?;
        users.extend(self.read_list(GBANNED_FILE).await?);
        Ok(users)
    }

    #[allow(dead_code)]
    pub async fn ban(&self, user_id: i64) -> Result<bool> {
        self.update(BANNED_FILE, |users| users.insert(user_id)).await
    }

    #[allow(dead_code)]
    pub async fn unban(&self, user_id: i64) -> Result<bool> {
        let local = self.update(BANNED_FILE, |users| users.remove(&user_id)).await?;
        let global = self.update(GBANNED_FILE, |users| users.remove(&user_id)).await?;
        Ok(local || global)
    }

    #[allow(dead_code)]
    pub async fn gban(&self, user_id: i64) -> Result<bool> {
        self.update(GBANNED_FILE, |users| users.insert(user_id)).await
    }

    async fn update(&self, file: &str, change: impl FnOnce(&mut BTreeSet<i64>) -> bool) -> Result<bool> {
        let mut users = self.read_list(file).await?;
        if !change(&mut users) {
            return Ok(false);
        }

        let path = self.data_dir.join(file);
        let content = serde_json::to_string_pretty(&users)?;
        fs::write(&path, content)
            .await
            .with_context(|| format!("Error guardando {}", path.display()))?;
        debug!("💾 {} actualizado ({} usuarios)", file, users.len());
        Ok(true)
    }

    async fn read_list(&self, file: &str) -> Result<BTreeSet<i64>> {
        let path = self.data_dir.join(file);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e).with_context(|| format!("Error leyendo {}", path.display())),
        };

        serde_json::from_str(&content).with_context(|| format!("{} no es una lista de ids", path.display()))
    }
}
