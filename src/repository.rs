//! Application sources: where they come from and how they get on disk.
//!
//! A descriptor's `repository.type` selects one [`Repository`] variant.
//! Fetching shells out to the usual tools (`git`, `tar`, `npm`), unpacks
//! zip archives in-process and downloads archives with `reqwest`; every
//! subprocess failure carries its stderr.

use crate::config::RepositoryConfig;
use crate::descriptor::ApplicationDescriptor;
use crate::error::DroneError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq)]
pub enum Repository {
    Git { url: String, branch: Option<String> },
    Local { directory: PathBuf },
    Tar { url: String },
    Zip { url: String },
    Npm { package: String },
}

/// Why a subprocess or download failed
struct StepFailure {
    message: String,
    stderr: Vec<String>,
}

impl StepFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stderr: Vec::new(),
        }
    }
}

impl Repository {
    /// Select and validate the variant for `app`
    pub fn from_descriptor(app: &ApplicationDescriptor) -> Result<Self, DroneError> {
        let info = &app.repository;
        let missing = |field: &str| DroneError::InvalidDescriptor {
            app: app.name.clone(),
            reason: format!("repository.{} is required for type '{}'", field, info.kind),
        };
        let required = |value: &Option<String>, field: &str| {
            value
                .as_ref()
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .ok_or_else(|| missing(field))
        };

        let repository = match info.kind.as_str() {
            "git" => Repository::Git {
                url: required(&info.url, "url")?,
                branch: info.branch.clone(),
            },
            "local" => Repository::Local {
                directory: PathBuf::from(required(&info.directory, "directory")?),
            },
            "tar" => Repository::Tar {
                url: required(&info.url, "url")?,
            },
            "zip" => Repository::Zip {
                url: required(&info.url, "url")?,
            },
            "npm" => Repository::Npm {
                package: info
                    .package
                    .clone()
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or_else(|| app.name.clone()),
            },
            other => {
                return Err(DroneError::UnknownRepository {
                    app: app.name.clone(),
                    user: app.user.clone(),
                    kind: other.to_string(),
                })
            }
        };

        repository
            .validate()
            .map_err(|reason| DroneError::InvalidDescriptor {
                app: app.name.clone(),
                reason,
            })?;
        Ok(repository)
    }

    /// Check the locator is something the fetch step can use
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Repository::Tar { url } | Repository::Zip { url } => {
                if url.starts_with("http://") || url.starts_with("https://") {
                    Ok(())
                } else {
                    Err(format!("repository.url must be an http(s) URL, got '{}'", url))
                }
            }
            Repository::Git { url, branch } => {
                if url.starts_with('-') {
                    return Err(format!("repository.url '{}' is not a git URL", url));
                }
                match branch {
                    Some(b) if b.starts_with('-') || b.trim().is_empty() => {
                        Err(format!("repository.branch '{}' is not a branch name", b))
                    }
                    _ => Ok(()),
                }
            }
            Repository::Npm { package } if package.starts_with('-') => {
                Err(format!("repository.package '{}' is not a package name", package))
            }
            Repository::Npm { .. } | Repository::Local { .. } => Ok(()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Repository::Git { .. } => "git",
            Repository::Local { .. } => "local",
            Repository::Tar { .. } => "tar",
            Repository::Zip { .. } => "zip",
            Repository::Npm { .. } => "npm",
        }
    }

    /// Directory the source lives in once materialised
    pub fn app_dir(&self, app: &ApplicationDescriptor, config: &RepositoryConfig) -> PathBuf {
        match self {
            Repository::Local { directory } => directory.clone(),
            _ => config.apps_dir.join(&app.user).join(&app.name),
        }
    }

    /// Make the source available and run `scripts.install` when fetched.
    ///
    /// Returns the directory holding the app's entry point. An already
    /// materialised source is not fetched again.
    pub async fn init(
        &self,
        app: &ApplicationDescriptor,
        config: &RepositoryConfig,
        http: &reqwest::Client,
    ) -> Result<PathBuf, DroneError> {
        let dir = self.app_dir(app, config);
        let fetch_error = |failure: StepFailure| DroneError::Fetch {
            app: app.name.clone(),
            user: app.user.clone(),
            message: failure.message,
            stderr: failure.stderr,
        };

        let fetched = match self {
            Repository::Local { directory } => {
                if !tokio::fs::metadata(directory).await.map(|m| m.is_dir()).unwrap_or(false) {
                    return Err(fetch_error(StepFailure::new(format!(
                        "directory {} does not exist",
                        directory.display()
                    ))));
                }
                true
            }
            _ if is_populated(&dir).await => {
                debug!(app = %app.name, dir = %dir.display(), "Source already materialised");
                false
            }
            _ => {
                info!(app = %app.name, user = %app.user, kind = self.kind(), dir = %dir.display(), "Fetching application source");
                self.fetch(app, config, &dir, http).await.map_err(fetch_error)?;
                true
            }
        };

        let root = package_root(&dir).await;
        if fetched {
            if let Some(ref install) = app.scripts.install {
                run_install(app, install, &root).await?;
            }
        }
        Ok(root)
    }

    async fn fetch(
        &self,
        app: &ApplicationDescriptor,
        config: &RepositoryConfig,
        dir: &Path,
        http: &reqwest::Client,
    ) -> Result<(), StepFailure> {
        if let Some(parent) = dir.parent() {
            create_dir(parent).await?;
        }

        let result = match self {
            Repository::Local { .. } => Ok(()),
            Repository::Git { url, branch } => {
                let mut cmd = Command::new("git");
                cmd.args(["clone", "--depth", "1"]);
                if let Some(branch) = branch {
                    cmd.args(["--branch", branch]);
                }
                cmd.arg(url).arg(dir);
                run(cmd, "git clone").await
            }
            Repository::Tar { url } => {
                let archive = archive_path(app, config, "tar.gz");
                async {
                    download(http, url, &archive).await?;
                    extract_tar(&archive, dir).await
                }
                .await
            }
            Repository::Zip { url } => {
                let archive = archive_path(app, config, "zip");
                async {
                    download(http, url, &archive).await?;
                    extract_zip(&archive, dir).await
                }
                .await
            }
            Repository::Npm { package } => {
                async {
                    create_dir(&config.packages_dir).await?;
                    let mut cmd = Command::new("npm");
                    cmd.arg("pack").arg(package).current_dir(&config.packages_dir);
                    let stdout = run_capture(cmd, "npm pack").await?;
                    let tarball = stdout
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .last()
                        .ok_or_else(|| StepFailure::new("npm pack printed no tarball name"))?;
                    let archive = config.packages_dir.join(tarball);
                    let result = extract_tar(&archive, dir).await;
                    let _ = tokio::fs::remove_file(&archive).await;
                    result
                }
                .await
            }
        };

        if result.is_err() {
            // Never leave a half-fetched tree that would count as materialised
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
        result
    }

    /// Remove the materialised source.
    ///
    /// A local directory is only deleted when it lives under
    /// `packages_dir` (deploy uploads); user-provided directories are kept.
    pub async fn clean(
        &self,
        app: &ApplicationDescriptor,
        config: &RepositoryConfig,
    ) -> Result<(), DroneError> {
        let dir = self.app_dir(app, config);
        if let Repository::Local { directory } = self {
            if !is_within(directory, &config.packages_dir) {
                debug!(app = %app.name, dir = %directory.display(), "Keeping local source directory");
                return Ok(());
            }
        }

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(app = %app.name, user = %app.user, dir = %dir.display(), "Removed application source");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DroneError::Fetch {
                app: app.name.clone(),
                user: app.user.clone(),
                message: format!("failed to remove {}: {}", dir.display(), e),
                stderr: Vec::new(),
            }),
        }
    }
}

/// Directory holding `package.json`: `dir` itself, or its only
/// subdirectory when an archive wrapped everything in one folder
pub async fn package_root(dir: &Path) -> PathBuf {
    if tokio::fs::metadata(dir.join("package.json")).await.is_ok() {
        return dir.to_path_buf();
    }

    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return dir.to_path_buf();
    };
    let mut dirs = Vec::new();
    let mut others = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        match entry.file_type().await {
            Ok(t) if t.is_dir() => dirs.push(entry.path()),
            _ => others += 1,
        }
    }

    if dirs.len() == 1 && others == 0 {
        dirs.remove(0)
    } else {
        dir.to_path_buf()
    }
}

fn is_within(path: &Path, base: &Path) -> bool {
    let canonical = |p: &Path| std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
    canonical(path).starts_with(canonical(base))
}

async fn is_populated(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

fn archive_path(app: &ApplicationDescriptor, config: &RepositoryConfig, ext: &str) -> PathBuf {
    config
        .packages_dir
        .join(format!("{}-{}-{}.{}", app.user, app.name, uuid::Uuid::new_v4(), ext))
}

async fn create_dir(dir: &Path) -> Result<(), StepFailure> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| StepFailure::new(format!("failed to create {}: {}", dir.display(), e)))
}

async fn download(http: &reqwest::Client, url: &str, dest: &Path) -> Result<(), StepFailure> {
    if let Some(parent) = dest.parent() {
        create_dir(parent).await?;
    }
    debug!(url, dest = %dest.display(), "Downloading archive");

    let response = http
        .get(url)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| StepFailure::new(format!("download of {} failed: {}", url, e)))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| StepFailure::new(format!("download of {} failed: {}", url, e)))?;

    tokio::fs::write(dest, &bytes)
        .await
        .map_err(|e| StepFailure::new(format!("failed to write {}: {}", dest.display(), e)))
}

async fn extract_tar(archive: &Path, dest: &Path) -> Result<(), StepFailure> {
    create_dir(dest).await?;
    let mut cmd = Command::new("tar");
    cmd.arg("-xzf").arg(archive).arg("-C").arg(dest);
    let result = run(cmd, "tar").await;
    let _ = tokio::fs::remove_file(archive).await;
    result
}

async fn extract_zip(archive: &Path, dest: &Path) -> Result<(), StepFailure> {
    create_dir(dest).await?;
    let (source, target) = (archive.to_path_buf(), dest.to_path_buf());
    let result = tokio::task::spawn_blocking(move || unpack_zip(&source, &target))
        .await
        .map_err(|e| StepFailure::new(format!("zip extraction task failed: {}", e)))
        .and_then(|unpacked| {
            unpacked.map_err(|e| StepFailure::new(format!("failed to extract {}: {}", archive.display(), e)))
        });
    let _ = tokio::fs::remove_file(archive).await;

    let files = result?;
    debug!(dest = %dest.display(), files, "Zip archive extracted");
    Ok(())
}

/// Unpack every entry under `dest`; entries that would land outside it are skipped
fn unpack_zip(archive: &Path, dest: &Path) -> zip::result::ZipResult<usize> {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(archive)?)?;
    let mut files = 0;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "Skipping zip entry outside the destination");
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode & 0o777))?;
        }
        files += 1;
    }

    Ok(files)
}

async fn run(cmd: Command, what: &str) -> Result<(), StepFailure> {
    run_capture(cmd, what).await.map(|_| ())
}

/// Run to completion; stdout on success, stderr lines on failure
async fn run_capture(mut cmd: Command, what: &str) -> Result<String, StepFailure> {
    cmd.stdin(Stdio::null());
    let output = cmd
        .output()
        .await
        .map_err(|e| StepFailure::new(format!("failed to run {}: {}", what, e)))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr)
        .lines()
        .map(str::to_string)
        .collect();
    Err(StepFailure {
        message: format!("{} exited with {}", what, output.status),
        stderr,
    })
}

async fn run_install(app: &ApplicationDescriptor, script: &str, dir: &Path) -> Result<(), DroneError> {
    info!(app = %app.name, script, dir = %dir.display(), "Running install script");
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(dir).envs(&app.env);

    run(cmd, "install script").await.map_err(|failure| {
        warn!(app = %app.name, error = %failure.message, "Install script failed");
        DroneError::Install {
            app: app.name.clone(),
            user: app.user.clone(),
            message: failure.message,
            stderr: failure.stderr,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{RepositoryInfo, Scripts};

    fn app(kind: &str) -> ApplicationDescriptor {
        ApplicationDescriptor {
            name: "test".to_string(),
            user: "marak".to_string(),
            repository: RepositoryInfo {
                kind: kind.to_string(),
                url: Some("https://github.com/Marak/hellonode.git".to_string()),
                ..Default::default()
            },
            scripts: Scripts {
                start: "server.js".to_string(),
                install: None,
            },
            ..Default::default()
        }
    }

    fn config(root: &Path) -> RepositoryConfig {
        RepositoryConfig {
            apps_dir: root.join("local"),
            packages_dir: root.join("packages"),
        }
    }

    #[test]
    fn test_select_variant() {
        assert_eq!(
            Repository::from_descriptor(&app("git")).unwrap(),
            Repository::Git {
                url: "https://github.com/Marak/hellonode.git".to_string(),
                branch: None
            }
        );
        assert_eq!(Repository::from_descriptor(&app("tar")).unwrap().kind(), "tar");
        assert_eq!(
            Repository::from_descriptor(&app("npm")).unwrap(),
            Repository::Npm {
                package: "test".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_type_is_user_error() {
        let err = Repository::from_descriptor(&app("svn")).unwrap_err();
        assert!(matches!(err, DroneError::UnknownRepository { ref kind, .. } if kind == "svn"));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_missing_locator_is_invalid() {
        let mut desc = app("local");
        desc.repository.directory = None;
        let err = Repository::from_descriptor(&desc).unwrap_err();
        assert!(err.to_string().contains("repository.directory"));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_archive_url_must_be_http() {
        let mut desc = app("zip");
        desc.repository.url = Some("ftp://example.com/app.zip".to_string());
        let err = Repository::from_descriptor(&desc).unwrap_err();
        assert!(err.to_string().contains("http(s) URL"));

        let git = Repository::Git {
            url: "--upload-pack=evil".to_string(),
            branch: None,
        };
        assert!(git.validate().is_err());
    }

    #[test]
    fn test_app_dir() {
        let config = config(Path::new("/srv"));
        let repo = Repository::from_descriptor(&app("git")).unwrap();
        assert_eq!(repo.app_dir(&app("git"), &config), PathBuf::from("/srv/local/marak/test"));

        let local = Repository::Local {
            directory: PathBuf::from("/home/marak/app"),
        };
        assert_eq!(local.app_dir(&app("local"), &config), PathBuf::from("/home/marak/app"));
    }

    #[tokio::test]
    async fn test_local_init_runs_install() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("package.json"), "{}").unwrap();

        let mut desc = app("local");
        desc.repository.directory = Some(src.display().to_string());
        desc.scripts.install = Some("echo ok > installed".to_string());

        let repo = Repository::from_descriptor(&desc).unwrap();
        let dir = repo
            .init(&desc, &config(root.path()), &reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(dir, src);
        assert_eq!(std::fs::read_to_string(src.join("installed")).unwrap().trim(), "ok");
    }

    #[tokio::test]
    async fn test_failed_install_carries_stderr() {
        let root = tempfile::tempdir().unwrap();
        let mut desc = app("local");
        desc.repository.directory = Some(root.path().display().to_string());
        desc.scripts.install = Some("echo broken >&2; exit 2".to_string());

        let repo = Repository::from_descriptor(&desc).unwrap();
        let err = repo
            .init(&desc, &config(root.path()), &reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DroneError::Install { .. }));
        assert_eq!(err.stderr(), &["broken".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_local_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut desc = app("local");
        desc.repository.directory = Some(root.path().join("nope").display().to_string());

        let repo = Repository::from_descriptor(&desc).unwrap();
        let err = repo
            .init(&desc, &config(root.path()), &reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DroneError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_materialised_source_is_not_refetched() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let desc = app("git");
        let repo = Repository::from_descriptor(&desc).unwrap();

        let dir = repo.app_dir(&desc, &config);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("package.json"), "{}").unwrap();

        // Would fail if it tried to clone
        let root_dir = repo.init(&desc, &config, &reqwest::Client::new()).await.unwrap();
        assert_eq!(root_dir, dir);
    }

    #[tokio::test]
    async fn test_clean_only_removes_owned_local_dirs() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());

        let user_dir = root.path().join("mine");
        std::fs::create_dir_all(&user_dir).unwrap();
        let mut desc = app("local");
        desc.repository.directory = Some(user_dir.display().to_string());
        Repository::from_descriptor(&desc)
            .unwrap()
            .clean(&desc, &config)
            .await
            .unwrap();
        assert!(user_dir.exists());

        let upload_dir = config.packages_dir.join("upload-1");
        std::fs::create_dir_all(&upload_dir).unwrap();
        desc.repository.directory = Some(upload_dir.display().to_string());
        Repository::from_descriptor(&desc)
            .unwrap()
            .clean(&desc, &config)
            .await
            .unwrap();
        assert!(!upload_dir.exists());
    }

    #[tokio::test]
    async fn test_package_root_unwraps_single_directory() {
        let root = tempfile::tempdir().unwrap();
        let inner = root.path().join("hellonode-master");
        std::fs::create_dir_all(&inner).unwrap();
        std::fs::write(inner.join("package.json"), "{}").unwrap();
        assert_eq!(package_root(root.path()).await, inner);

        std::fs::write(root.path().join("README"), "").unwrap();
        assert_eq!(package_root(root.path()).await, root.path());
    }

    #[tokio::test]
    async fn test_extract_zip_keeps_layout_and_modes() {
        use std::io::Write;
        use zip::write::SimpleFileOptions;

        let root = tempfile::tempdir().unwrap();
        let archive = root.path().join("app.zip");
        {
            let mut writer = zip::ZipWriter::new(std::fs::File::create(&archive).unwrap());
            let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
            writer.add_directory("hellonode-master/bin/", options).unwrap();
            writer.start_file("hellonode-master/package.json", options).unwrap();
            writer.write_all(br#"{"name":"hellonode"}"#).unwrap();
            writer
                .start_file("hellonode-master/bin/server", options.unix_permissions(0o755))
                .unwrap();
            writer.write_all(b"#!/bin/sh\necho hello\n").unwrap();
            writer.finish().unwrap();
        }

        let dest = root.path().join("out");
        assert!(extract_zip(&archive, &dest).await.is_ok());
        assert!(!archive.exists());
        assert_eq!(package_root(&dest).await, dest.join("hellonode-master"));
        assert_eq!(
            std::fs::read_to_string(dest.join("hellonode-master/package.json")).unwrap(),
            r#"{"name":"hellonode"}"#
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dest.join("hellonode-master/bin/server"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn test_extract_zip_rejects_garbage() {
        let root = tempfile::tempdir().unwrap();
        let archive = root.path().join("app.zip");
        std::fs::write(&archive, b"not a zip file").unwrap();

        let err = extract_zip(&archive, &root.path().join("out")).await.unwrap_err();
        assert!(err.message.contains("failed to extract"));
    }

    #[tokio::test]
    async fn test_extract_tar() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("package");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("package.json"), r#"{"name":"test"}"#).unwrap();

        let archive = root.path().join("app.tar.gz");
        let status = std::process::Command::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(root.path())
            .arg("package")
            .status()
            .unwrap();
        assert!(status.success());

        let dest = root.path().join("out");
        assert!(extract_tar(&archive, &dest).await.is_ok());
        assert!(dest.join("package/package.json").exists());
        assert_eq!(package_root(&dest).await, dest.join("package"));
    }
}
