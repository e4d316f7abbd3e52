//! Turns worker output into ordered page results.
//!
//! Archive jobs unpack both the uploaded archive and the translated one
//! into `{root}/{originals|translated}/{requestId}/`, sort each image list
//! lexicographically and pair the two lists by rank. Image jobs copy the
//! declared pages into the same directories.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use manga_core::file_kind::FileKind;
use manga_core::paths::{StorageArea, StorageLayout};
use manga_core::types::RequestId;
use manga_db::models::result::{NewPageResult, PageResult};

use crate::error::CatalogError;
use crate::store::JobStore;
use crate::supervisor::WorkerOutput;

/// File suffixes treated as page images.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp"];

pub struct OutputCataloger {
    layout: StorageLayout,
    store: Arc<dyn JobStore>,
}

impl OutputCataloger {
    pub fn new(layout: StorageLayout, store: Arc<dyn JobStore>) -> Self {
        Self { layout, store }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Build, persist and return the page results for a finished job.
    ///
    /// The batch replaces any results from an earlier delivery and the
    /// request's page count is only updated once it has committed.
    pub async fn catalog(
        &self,
        request_id: RequestId,
        kind: FileKind,
        output: &WorkerOutput,
    ) -> Result<Vec<PageResult>, CatalogError> {
        let originals_dir = self.layout.request_dir(StorageArea::Originals, request_id);
        let translated_dir = self.layout.request_dir(StorageArea::Translated, request_id);
        for dir in [&originals_dir, &translated_dir] {
            reset_dir(dir).await?;
        }

        let pages = match kind {
            FileKind::Archive => {
                self.catalog_archive(request_id, output, &originals_dir, &translated_dir)
                    .await?
            }
            FileKind::Image => {
                self.catalog_images(request_id, output, &originals_dir, &translated_dir)
                    .await?
            }
        };
        if pages.is_empty() {
            return Err(CatalogError::NoPages);
        }

        let saved = self.store.save_results(request_id, &pages).await?;
        let page_count = u32::try_from(saved.len()).unwrap_or(u32::MAX);
        if let Err(e) = self.store.set_page_count(request_id, page_count).await {
            // A failed catalog must not leave its pages visible.
            if let Err(retract) = self.store.save_results(request_id, &[]).await {
                tracing::error!(
                    request_id = %request_id,
                    error = %retract,
                    "Failed to retract results after page count write failed",
                );
            }
            return Err(e.into());
        }

        tracing::info!(
            request_id = %request_id,
            kind = %kind,
            pages = saved.len(),
            "Cataloged worker output",
        );
        Ok(saved)
    }

    async fn catalog_archive(
        &self,
        request_id: RequestId,
        output: &WorkerOutput,
        originals_dir: &Path,
        translated_dir: &Path,
    ) -> Result<Vec<NewPageResult>, CatalogError> {
        let uploads_dir = self.layout.request_dir(StorageArea::Uploads, request_id);
        match first_zip_in(&uploads_dir, &output.artifact).await {
            Some(original_zip) => {
                if let Err(e) = extract_zip(original_zip.clone(), originals_dir.to_path_buf()).await {
                    tracing::error!(
                        request_id = %request_id,
                        path = %original_zip.display(),
                        error = %e,
                        "Failed to extract original archive",
                    );
                }
            }
            None => {
                tracing::warn!(request_id = %request_id, "No original archive in uploads");
            }
        }

        extract_zip(output.artifact.clone(), translated_dir.to_path_buf()).await?;

        let originals = collect_images(originals_dir.to_path_buf()).await?;
        let translated = collect_images(translated_dir.to_path_buf()).await?;
        tracing::debug!(
            request_id = %request_id,
            originals = originals.len(),
            translated = translated.len(),
            "Collected page images",
        );

        Ok(pair_by_rank(&originals, &translated)
            .into_iter()
            .map(|(page_number, original, translated)| NewPageResult {
                page_number,
                original_path: original
                    .map(|rel| self.file_ref(request_id, StorageArea::Originals, rel))
                    .unwrap_or_default(),
                translated_path: self.file_ref(request_id, StorageArea::Translated, translated),
            })
            .collect())
    }

    async fn catalog_images(
        &self,
        request_id: RequestId,
        output: &WorkerOutput,
        originals_dir: &Path,
        translated_dir: &Path,
    ) -> Result<Vec<NewPageResult>, CatalogError> {
        let mut pages = Vec::with_capacity(output.pages.len());
        for page in &output.pages {
            let original_name = copy_into(&page.original_path, originals_dir).await?;
            let translated_name = copy_into(&page.translated_path, translated_dir).await?;
            pages.push(NewPageResult {
                page_number: i32::try_from(page.page_number).unwrap_or(i32::MAX),
                original_path: self.file_ref(request_id, StorageArea::Originals, &original_name),
                translated_path: self.file_ref(
                    request_id,
                    StorageArea::Translated,
                    &translated_name,
                ),
            });
        }
        Ok(pages)
    }

    fn file_ref(&self, request_id: RequestId, area: StorageArea, relative: &str) -> String {
        self.layout.artifact_ref(request_id, area, Path::new(relative))
    }
}

/// Pair two sorted lists by rank, 1-based.
///
/// Every translated entry yields one page. Originals beyond the translated
/// count are dropped, and translated pages without an original at the same
/// rank get `None`. Stems are deliberately not matched.
pub fn pair_by_rank<'a>(
    originals: &'a [String],
    translated: &'a [String],
) -> Vec<(i32, Option<&'a str>, &'a str)> {
    translated
        .iter()
        .enumerate()
        .map(|(i, tr)| {
            let page = i32::try_from(i + 1).unwrap_or(i32::MAX);
            (page, originals.get(i).map(String::as_str), tr.as_str())
        })
        .collect()
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

async fn reset_dir(dir: &Path) -> Result<(), CatalogError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(CatalogError::io(
                format!("Failed to clear {}", dir.display()),
                e,
            ))
        }
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| CatalogError::io(format!("Failed to create directory {}", dir.display()), e))
}

/// First `*.zip` directly inside `dir` by file name, other than `exclude`.
///
/// The translated archive is written next to the upload, so it has to be
/// skipped explicitly.
async fn first_zip_in(dir: &Path, exclude: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut zips = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
        let is_zip = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if is_file && is_zip && path != exclude {
            zips.push(path);
        }
    }
    zips.sort();
    zips.into_iter().next()
}

/// Copy `src` into `dir` under its own file name and return that name.
async fn copy_into(src: &Path, dir: &Path) -> Result<String, CatalogError> {
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| CatalogError::Extract {
            path: src.to_path_buf(),
            message: "path has no file name".into(),
        })?;
    tokio::fs::copy(src, dir.join(&name))
        .await
        .map_err(|e| CatalogError::io(format!("Failed to copy {}", src.display()), e))?;
    Ok(name)
}

/// Unpack `archive` into `dest`. Entries escaping `dest` are skipped.
async fn extract_zip(archive: PathBuf, dest: PathBuf) -> Result<usize, CatalogError> {
    let path = archive.clone();
    tokio::task::spawn_blocking(move || extract_zip_blocking(&archive, &dest))
        .await
        .map_err(|e| CatalogError::Extract {
            path,
            message: e.to_string(),
        })?
}

fn extract_zip_blocking(archive: &Path, dest: &Path) -> Result<usize, CatalogError> {
    let extract_err = |message: String| CatalogError::Extract {
        path: archive.to_path_buf(),
        message,
    };

    let file = File::open(archive)
        .map_err(|e| CatalogError::io(format!("Failed to open {}", archive.display()), e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| extract_err(e.to_string()))?;

    let mut written = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| extract_err(e.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!(entry = entry.name(), "Skipping archive entry outside destination");
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| CatalogError::io(format!("Failed to create {}", target.display()), e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CatalogError::io(format!("Failed to create {}", parent.display()), e))?;
        }
        let mut out = File::create(&target)
            .map_err(|e| CatalogError::io(format!("Failed to create {}", target.display()), e))?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|e| CatalogError::io(format!("Failed to write {}", target.display()), e))?;
        written += 1;
    }
    Ok(written)
}

/// Image files under `root`, as forward-slash relative paths, sorted.
async fn collect_images(root: PathBuf) -> Result<Vec<String>, CatalogError> {
    tokio::task::spawn_blocking(move || -> Result<Vec<String>, CatalogError> {
        let mut found = Vec::new();
        walk_images(&root, &root, &mut found)?;
        found.sort();
        Ok(found)
    })
    .await
    .map_err(|e| CatalogError::io("Image scan aborted", std::io::Error::other(e)))?
}

fn walk_images(root: &Path, dir: &Path, found: &mut Vec<String>) -> Result<(), CatalogError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| CatalogError::io(format!("Failed to read {}", dir.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CatalogError::io(format!("Failed to read {}", dir.display()), e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| CatalogError::io(format!("Failed to stat {}", path.display()), e))?;
        if file_type.is_dir() {
            walk_images(root, &path, found)?;
        } else if file_type.is_file() && is_image(&path) {
            if let Ok(relative) = path.strip_prefix(root) {
                let rel = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                found.push(rel);
            }
        }
    }
    Ok(())
}
