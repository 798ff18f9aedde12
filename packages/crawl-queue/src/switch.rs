use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::Result;
use crate::traits::CrawlerSwitch;

/// Kill-switch backed by the presence of a flag file shared by all workers.
#[derive(Debug, Clone)]
pub struct FileCrawlerSwitch {
    path: PathBuf,
}

impl FileCrawlerSwitch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn disable(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, b"")?;
        info!(path = %self.path.display(), "Crawling disabled");
        Ok(())
    }

    pub fn enable(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(path = %self.path.display(), "Crawling enabled");
        Ok(())
    }
}

impl CrawlerSwitch for FileCrawlerSwitch {
    fn is_disabled(&self) -> bool {
        self.path.exists()
    }
}
