//! Source-system contract and the built-in filesystem source.
//!
//! A [`Source`] exposes a pollable listing (identifier plus timestamp,
//! and a content hash when the system has one) and lets the detector
//! fetch a single item. Systems that push changes instead hand the
//! detector a [`Notification`].
//!
//! Document ids are `"{source name}:{source-local id}"`, so a full scan
//! of one source can tell which previously-known ids disappeared.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::config::FilesystemSourceConfig;
use crate::models::{ChangeOp, DocumentId, SourceItem, SourceType};

/// One entry of a source listing.
#[derive(Debug, Clone)]
pub struct SourceListing {
    pub document_id: DocumentId,
    pub updated_at: DateTime<Utc>,
    /// Normalized-content hash, when the source can provide it cheaply.
    pub content_hash: Option<String>,
}

/// A push notification: identifier, operation, and either the payload or
/// nothing (the detector then fetches by identifier).
#[derive(Debug, Clone)]
pub struct Notification {
    pub document_id: DocumentId,
    pub op: ChangeOp,
    pub item: Option<SourceItem>,
}

#[async_trait]
pub trait Source: Send + Sync {
    /// Instance name; prefixes every document id of this source.
    fn name(&self) -> &str;

    fn source_type(&self) -> SourceType;

    /// Prefix shared by all document ids of this source.
    fn id_prefix(&self) -> String {
        format!("{}:", self.name())
    }

    /// Everything the source currently holds.
    async fn list(&self) -> Result<Vec<SourceListing>>;

    /// Read one item.
    async fn fetch(&self, id: &DocumentId) -> Result<SourceItem>;
}

/// Files under a root directory, filtered by include/exclude globs.
pub struct FilesystemSource {
    name: String,
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
    source_type: SourceType,
    category: Option<String>,
}

impl FilesystemSource {
    pub fn new(name: &str, config: &FilesystemSourceConfig) -> Result<Self> {
        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());

        Ok(Self {
            name: name.to_string(),
            root: config.root.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&default_excludes)?,
            follow_symlinks: config.follow_symlinks,
            source_type: config.source_type,
            category: config.category.clone(),
        })
    }

    /// The id's path below `root`. Only plain path components are
    /// accepted, so a pushed id cannot name a file outside the root.
    fn relative_path<'a>(&self, id: &'a DocumentId) -> Result<&'a str> {
        let relative = id
            .as_str()
            .strip_prefix(&self.id_prefix())
            .ok_or_else(|| anyhow::anyhow!("{} does not belong to source '{}'", id, self.name))?;
        let mut components = Path::new(relative).components().peekable();
        if components.peek().is_none() || !components.all(|c| matches!(c, Component::Normal(_))) {
            bail!("{} is not a path inside source '{}'", id, self.name);
        }
        Ok(relative)
    }
}

#[async_trait]
impl Source for FilesystemSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_type(&self) -> SourceType {
        self.source_type
    }

    async fn list(&self) -> Result<Vec<SourceListing>> {
        if !self.root.exists() {
            bail!(
                "Filesystem source root does not exist: {}",
                self.root.display()
            );
        }

        let mut listings = Vec::new();
        let walker = WalkDir::new(&self.root).follow_links(self.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            listings.push(SourceListing {
                document_id: DocumentId::for_source(&self.name, &rel_str),
                updated_at: modified_at(path)?,
                content_hash: None,
            });
        }

        // Sort for deterministic ordering
        listings.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(listings)
    }

    async fn fetch(&self, id: &DocumentId) -> Result<SourceItem> {
        let relative = self.relative_path(id)?;
        let path = self.root.join(relative);
        let body = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let title = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string());

        Ok(SourceItem {
            document_id: id.clone(),
            source_type: self.source_type,
            category: self.category.clone(),
            title,
            updated_at: modified_at(&path)?,
            body,
        })
    }
}

fn modified_at(path: &Path) -> Result<DateTime<Utc>> {
    let modified = std::fs::metadata(path)?
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
    let secs = modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    Ok(Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
