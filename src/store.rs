//! Reading and writing the resource file.
//!
//! The file is a YAML list. Each entry is either a bare name (a local resource) or a mapping:
//!
//! ```yaml
//! - laptop
//! - name: web1
//!   kind: remote
//!   address: 10.0.0.5
//!   username: ubuntu
//!   key: ~/.ssh/id_prod
//!   labels: [prod, web]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::directory::ResourceDirectory;
use crate::error::MeshError;
use crate::resource::{Resource, ResourceEntry};
use crate::serde::string_or_mapping;
use crate::sync::LockedFile;

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct EntrySpec(#[serde(deserialize_with = "string_or_mapping")] ResourceEntry);

pub struct ResourceStore {
    path: PathBuf,
}

impl ResourceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every resource. A missing file is an empty directory.
    pub async fn load(&self) -> Result<Vec<Resource>, MeshError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no resource file yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        // An empty file parses as YAML null rather than an empty list.
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        let specs: Vec<EntrySpec> = serde_yaml::from_str(&contents)?;
        let resources = specs
            .into_iter()
            .map(|EntrySpec(entry)| entry.into_resource())
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(path = %self.path.display(), count = resources.len(), "loaded resources");
        Ok(resources)
    }

    /// Replaces the file contents with `resources`, holding the lock file while writing.
    pub async fn save(&self, resources: &[Resource]) -> Result<(), MeshError> {
        let _locked = self.lock().await?;
        self.write(resources).await
    }

    /// Loads the directory, applies `change` and writes the result back, all under the lock
    /// file. Nothing is written if `change` fails.
    pub async fn update<T, F>(&self, change: F) -> Result<T, MeshError>
    where
        F: FnOnce(&ResourceDirectory) -> Result<T, MeshError>,
    {
        let _locked = self.lock().await?;
        let directory = ResourceDirectory::from_resources(self.load().await?);
        let value = change(&directory)?;
        self.write(&directory.list().collect::<Vec<_>>()).await?;
        Ok(value)
    }

    async fn lock(&self) -> Result<LockedFile, MeshError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(LockedFile::acquire(&self.path, LOCK_TIMEOUT).await?)
    }

    /// Writes a sibling temp file and renames it over the real one, so readers never see a
    /// half-written file. Callers hold the lock.
    async fn write(&self, resources: &[Resource]) -> Result<(), MeshError> {
        let entries: Vec<ResourceEntry> = resources.iter().map(Resource::to_entry).collect();
        let yaml = serde_yaml::to_string(&entries)?;
        let mut staging = self.path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, yaml).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        tracing::debug!(path = %self.path.display(), count = entries.len(), "saved resources");
        Ok(())
    }
}
