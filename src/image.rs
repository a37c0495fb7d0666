use std::ffi::OsStr;
use std::path::Path;

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::cloudinit;
use crate::config::VmRecord;
use crate::deps::Toolchain;
use crate::error::VmError;
use crate::paths;
use crate::util::run_tool;

/// Whether `ensure_ready` had to build the seed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Existing,
    Built,
}

/// Make sure the disk image and seed image for `record` are in place.
///
/// Records with an `image_url` fetch a missing image and resize it to
/// `disk_size`; direct-launch records only require the image to exist.
/// In both cases a missing seed is built exactly once.
pub async fn ensure_ready(record: &VmRecord, tools: &Toolchain) -> Result<SeedOutcome, VmError> {
    let img = &record.img_file;

    if record.is_direct_launch() {
        if !img.exists() {
            return Err(VmError::ImageFileMissing {
                path: img.display().to_string(),
            });
        }
    } else {
        if img.exists() {
            tracing::info!(path = %img.display(), "using existing disk image");
        } else {
            fetch_image(&record.config.image_url, img).await?;
        }

        if !record.config.disk_size.is_empty()
            && let Err(e) = resize_image(&tools.qemu_img, img, &record.config.disk_size).await
        {
            tracing::warn!(error = %e, "continuing with the image at its current size");
        }
    }

    if record.seed_file.exists() {
        tracing::info!(path = %record.seed_file.display(), "using existing seed image");
        return Ok(SeedOutcome::Existing);
    }

    tracing::info!(name = %record.name, "seed image missing, building it");
    cloudinit::build_seed(record, &tools.cloud_localds).await?;
    Ok(SeedOutcome::Built)
}

/// Resize the image with `qemu-img resize`.
pub async fn resize_image(qemu_img: &str, img: &Path, size: &str) -> Result<(), VmError> {
    run_tool(
        qemu_img,
        [OsStr::new("resize"), img.as_os_str(), OsStr::new(size)],
    )
    .await
    .map_err(|e| VmError::ImageResize {
        path: img.display().to_string(),
        size: size.to_string(),
        message: e.to_string(),
    })?;
    tracing::info!(path = %img.display(), size, "resized disk image");
    Ok(())
}

/// Fetch the base image into `dest`.
///
/// `http(s)://` sources are downloaded, anything else is treated as a local
/// path and copied. Data is staged in `<dest>.part` and only renamed into
/// place once complete.
pub async fn fetch_image(source: &str, dest: &Path) -> Result<(), VmError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VmError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }

    let tmp_path = paths::staging_path(dest);

    // Remove any stale .part file from a previous failed download
    let _ = tokio::fs::remove_file(&tmp_path).await;

    let result = if source.starts_with("http://") || source.starts_with("https://") {
        download(source, &tmp_path).await
    } else {
        copy_local(source, &tmp_path).await
    };

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, dest)
        .await
        .map_err(|e| VmError::Io {
            context: format!("renaming {} to {}", tmp_path.display(), dest.display()),
            source: e,
        })?;

    tracing::info!(path = %dest.display(), "disk image ready");
    Ok(())
}

async fn download(url: &str, tmp_path: &Path) -> Result<(), VmError> {
    tracing::info!(url, "downloading base image");

    let response = reqwest::get(url)
        .await
        .map_err(|e| VmError::ImageDownload {
            message: format!("request to {url} failed"),
            source: Box::new(e),
        })?;

    if !response.status().is_success() {
        return Err(VmError::ImageDownload {
            message: format!("HTTP {} from {url}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let pb = ProgressBar::new(response.content_length().unwrap_or(0));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let result = download_to_file(tmp_path, response, &pb).await;
    pb.finish_and_clear();
    result
}

/// Download a response body to a file, updating the progress bar as chunks arrive.
async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), VmError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| VmError::Io {
            context: format!("creating temp file {}", path.display()),
            source: e,
        })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| VmError::ImageDownload {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk).await.map_err(|e| VmError::Io {
            context: "writing image data".into(),
            source: e,
        })?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| VmError::Io {
        context: "flushing image file".into(),
        source: e,
    })?;

    Ok(())
}

async fn copy_local(source: &str, tmp_path: &Path) -> Result<(), VmError> {
    tracing::info!(source, "copying base image");
    tokio::fs::copy(source, tmp_path)
        .await
        .map_err(|e| VmError::ImageDownload {
            message: format!("copying {source}"),
            source: Box::new(e),
        })?;
    Ok(())
}
