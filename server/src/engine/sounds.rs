use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::models::Sound;
use super::reconciler::{Resource, ResourceEvent, ResourceSet, Snapshot};
use super::snapshot::SnapshotState;
use crate::config::SoundsSection;
use crate::error::BotError;

/// The sandboxed folder of playable sound files.
///
/// Only files under `root` with a supported extension can be played. The
/// top level of the folder is polled and its listing is exposed as a
/// [`Snapshot`] of [`Sound`]s.
pub struct SoundLibrary {
    root: PathBuf,
    extensions: Vec<String>,
    mappings: HashMap<String, String>,
    scan_interval: Duration,
    sounds: SnapshotState<Sound>,
}

impl SoundLibrary {
    pub fn new(
        root: impl Into<PathBuf>,
        extensions: &[String],
        mappings: HashMap<String, String>,
        scan_interval: Duration,
    ) -> Self {
        let extensions = extensions
            .iter()
            .map(|ext| {
                let ext = ext.trim().to_ascii_lowercase();
                if ext.starts_with('.') { ext } else { format!(".{ext}") }
            })
            .collect();

        Self {
            root: root.into(),
            extensions,
            mappings,
            scan_interval,
            sounds: SnapshotState::new(),
        }
    }

    pub fn from_config(section: &SoundsSection) -> Self {
        Self::new(
            &section.folder,
            &section.supported_extensions,
            section.mappings.clone(),
            Duration::from_secs(section.scan_interval_secs.max(1)),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<Sound>> {
        self.sounds.subscribe()
    }

    pub fn sounds(&self) -> Snapshot<Sound> {
        self.sounds.current()
    }

    pub fn is_supported(&self, filename: &str) -> bool {
        let lower = filename.to_ascii_lowercase();
        self.extensions.iter().any(|ext| lower.ends_with(ext.as_str()))
    }

    /// Turn a track identifier into what the audio engine should load.
    ///
    /// http(s) identifiers pass through unchanged. Anything else names a file
    /// relative to the sound folder and resolves to its canonical path, which
    /// must stay inside the folder.
    pub async fn resolve_identifier(&self, identifier: &str) -> Result<String, BotError> {
        if is_remote(identifier) {
            return Ok(identifier.to_string());
        }

        let mut relative = PathBuf::new();
        for component in Path::new(identifier).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(BotError::validation(format!(
                        "sound identifier {identifier} leaves the sound folder"
                    )));
                }
            }
        }

        let filename = relative
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| BotError::validation("empty sound identifier"))?;
        if !self.is_supported(filename) {
            return Err(BotError::validation(format!(
                "unsupported sound file type: {identifier}"
            )));
        }

        let root = tokio::fs::canonicalize(&self.root).await.map_err(|e| {
            BotError::validation(format!("sound folder {} unavailable: {e}", self.root.display()))
        })?;
        let path = tokio::fs::canonicalize(root.join(&relative))
            .await
            .map_err(|_| BotError::validation(format!("sound {identifier} does not exist")))?;

        // Symlinks can still point outside after canonicalization.
        if !path.starts_with(&root) {
            return Err(BotError::validation(format!(
                "sound identifier {identifier} leaves the sound folder"
            )));
        }

        path.to_str()
            .map(str::to_string)
            .ok_or_else(|| BotError::validation(format!("sound path for {identifier} is not UTF-8")))
    }

    /// List the supported files of the sound folder, top level only.
    pub async fn scan(&self) -> std::io::Result<Vec<Sound>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut found = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(filename) = entry.file_name().into_string() else {
                continue;
            };
            if self.is_supported(&filename) {
                found.push(Sound {
                    display_name: self.mappings.get(&filename).cloned(),
                    filename,
                });
            }
        }
        Ok(found)
    }

    /// Poll the folder until `cancel` fires, folding each listing into the
    /// published snapshot.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(folder = %self.root.display(), "watching sound folder");
        let mut set = ResourceSet::new(Vec::new());
        let mut unreadable = false;

        loop {
            let found = match self.scan().await {
                Ok(found) => {
                    unreadable = false;
                    found
                }
                Err(e) => {
                    if !unreadable {
                        error!(folder = %self.root.display(), error = %e, "sound folder unreadable");
                        unreadable = true;
                    }
                    Vec::new()
                }
            };

            for event in diff(&set.snapshot(), &found) {
                match &event {
                    ResourceEvent::Create(sound) => info!(filename = %sound.filename, "sound added"),
                    ResourceEvent::Update(sound) => debug!(filename = %sound.filename, "sound updated"),
                    ResourceEvent::Delete(sound) => info!(filename = %sound.filename, "sound removed"),
                }
                set.apply(event);
            }
            self.sounds.publish(set.snapshot());

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.scan_interval) => {}
            }
        }
        debug!("sound folder watch stopped");
    }
}

fn is_remote(identifier: &str) -> bool {
    identifier.starts_with("http://") || identifier.starts_with("https://")
}

/// Events that turn `previous` into `found`.
fn diff(previous: &Snapshot<Sound>, found: &[Sound]) -> Vec<ResourceEvent<Sound>> {
    let mut events: Vec<_> = previous
        .iter()
        .filter(|old| !found.iter().any(|new| new.id() == old.id()))
        .cloned()
        .map(ResourceEvent::Delete)
        .collect();

    for sound in found {
        match previous.find(sound.id()) {
            None => events.push(ResourceEvent::Create(sound.clone())),
            Some(old) if old != sound => events.push(ResourceEvent::Update(sound.clone())),
            Some(_) => {}
        }
    }
    events
}
