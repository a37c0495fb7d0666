use std::path::Path;

use facet_value::{Value, value};
use sha_crypt::{ROUNDS_DEFAULT, Sha512Params, sha512_simple};

use crate::config::VmRecord;
use crate::error::VmError;
use crate::paths;
use crate::util::run_tool;

/// Hash a password with SHA-512-crypt (`$6$`) and a fresh random salt.
pub fn hash_password(password: &str) -> Result<String, VmError> {
    let params = Sha512Params::new(ROUNDS_DEFAULT).map_err(|e| VmError::SeedBuild {
        message: format!("password hash parameters: {e:?}"),
    })?;
    sha512_simple(password, &params).map_err(|e| VmError::SeedBuild {
        message: format!("hashing password: {e:?}"),
    })
}

/// NoCloud `meta-data`: stable instance id plus hostname.
pub fn build_meta_data(record: &VmRecord) -> Result<String, VmError> {
    let instance_id = format!("iid-{}", record.name);
    let meta = value!({
        "instance-id": (instance_id.as_str()),
        "local-hostname": (record.hostname()),
    });
    render_yaml(&meta, "meta-data")
}

/// NoCloud `user-data`: one sudo user, password login, root enabled.
///
/// `root` and the user get the same password through `chpasswd`; only the
/// hash ever lands in the seed.
pub fn build_user_data(record: &VmRecord, password_hash: &str) -> Result<String, VmError> {
    let username = record.config.username.as_str();

    let user = value!({
        "name": (username),
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
        "shell": "/bin/bash",
        "lock_passwd": false,
        "passwd": (password_hash),
    });

    let list = format!("root:{password_hash}\n{username}:{password_hash}\n");
    let chpasswd = value!({
        "list": (list.as_str()),
        "expire": false,
    });

    let config = value!({
        "hostname": (record.hostname()),
        "ssh_pwauth": true,
        "disable_root": false,
        "users": [user],
        "chpasswd": (chpasswd),
    });

    // cloud-init wants #cloud-config on the first line.
    let yaml = render_yaml(&config, "user-data")?;
    Ok(format!("#cloud-config\n{yaml}"))
}

/// Serialize one seed document without a leading document separator.
fn render_yaml(doc: &Value, what: &str) -> Result<String, VmError> {
    let yaml = facet_yaml::to_string(doc).map_err(|e| VmError::SeedBuild {
        message: format!("rendering {what}: {e}"),
    })?;
    Ok(yaml.strip_prefix("---\n").unwrap_or(&yaml).to_string())
}

/// Render the seed documents and package them into `record.seed_file`.
///
/// The documents live in a private temp dir that is removed when this
/// function returns or its future is dropped. Packaging writes to a staging
/// file first, so a failed run never leaves a partial seed in place.
pub async fn build_seed(record: &VmRecord, cloud_localds: &str) -> Result<(), VmError> {
    let seed_path = &record.seed_file;
    if let Some(parent) = seed_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VmError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }

    let hash = hash_password(&record.config.password)?;
    let user_data = build_user_data(record, &hash)?;
    let meta_data = build_meta_data(record)?;

    let scratch = tempfile::Builder::new()
        .prefix("solovm-seed-")
        .tempdir()
        .map_err(|e| VmError::Io {
            context: "creating seed scratch directory".into(),
            source: e,
        })?;
    let user_data_path = scratch.path().join("user-data");
    let meta_data_path = scratch.path().join("meta-data");
    write_document(&user_data_path, &user_data).await?;
    write_document(&meta_data_path, &meta_data).await?;

    let staging = paths::staging_path(seed_path);
    let _ = tokio::fs::remove_file(&staging).await;

    if let Err(e) = run_tool(
        cloud_localds,
        [staging.as_os_str(), user_data_path.as_os_str(), meta_data_path.as_os_str()],
    )
    .await
    {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(VmError::SeedBuild {
            message: e.to_string(),
        });
    }

    tokio::fs::rename(&staging, seed_path)
        .await
        .map_err(|e| VmError::SeedBuild {
            message: format!(
                "moving {} to {}: {e}",
                staging.display(),
                seed_path.display()
            ),
        })?;

    tracing::info!(path = %seed_path.display(), "generated cloud-init seed image");
    Ok(())
}

async fn write_document(path: &Path, contents: &str) -> Result<(), VmError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| VmError::Io {
            context: format!("writing {}", path.display()),
            source: e,
        })
}
