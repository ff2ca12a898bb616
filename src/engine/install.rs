//! Engine release resolution, download, and installation.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use reqwest::Client;
use thiserror::Error;

use crate::platform::{ArchiveFormat, ReleaseTarget};

const RELEASE_API_URL: &str = "https://api.github.com/repos/MetaCubeX/mihomo/releases/latest";
const DOWNLOAD_BASE_URL: &str = "https://github.com/MetaCubeX/mihomo/releases/download";

/// Last-known-good release used when the release index is unreachable.
/// TODO: revisit whether this pin should hard-fail once it grows stale.
const FALLBACK_VERSION: &str = "v1.19.13";

const LOOKUP_TIMEOUT_SECS: u64 = 10;
const DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const BINARY_NAME: &str = "mihomo";
const VERSION_FILE: &str = "mihomo.version";
const USER_AGENT: &str = concat!("clashman/", env!("CARGO_PKG_VERSION"));

/// Errors from release lookup, download, and installation.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("release lookup failed: {0}")]
    ReleaseLookup(String),

    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("bad archive {}: {reason}", .path.display())]
    BadArchive { path: PathBuf, reason: String },

    #[error("no entry ending in '{suffix}' in archive {}", .path.display())]
    NoMatchingEntry { path: PathBuf, suffix: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, InstallError>;

/// An engine binary present on disk.
///
/// Owned by the installer; the supervisor only ever reads `path`.
#[derive(Debug, Clone)]
pub struct InstalledBinary {
    pub path: PathBuf,
    pub version: Option<String>,
}

/// Downloads, verifies, and installs engine release binaries.
pub struct Installer {
    client: Client,
    bin_dir: PathBuf,
}

impl Installer {
    /// Create an installer targeting the user-local bin directory.
    pub fn new() -> Self {
        let bin_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("bin");
        Self::with_bin_dir(bin_dir)
    }

    /// Create an installer targeting a custom bin directory.
    pub fn with_bin_dir(bin_dir: PathBuf) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { client, bin_dir }
    }

    /// Resolve the release version to install.
    ///
    /// An explicit version is used verbatim. Otherwise the upstream
    /// release index is queried for the latest tag; if that fails, the
    /// pinned fallback is used and the degradation logged, never fatal.
    pub async fn resolve_version(&self, explicit: Option<&str>) -> String {
        if let Some(version) = explicit {
            return version.to_string();
        }

        match self.latest_release_tag().await {
            Ok(tag) => {
                log::info!("latest engine release: {tag}");
                tag
            }
            Err(e) => {
                log::warn!("release lookup failed ({e}); using pinned fallback {FALLBACK_VERSION}");
                FALLBACK_VERSION.to_string()
            }
        }
    }

    async fn latest_release_tag(&self) -> Result<String> {
        let response = self
            .client
            .get(RELEASE_API_URL)
            .timeout(Duration::from_secs(LOOKUP_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| InstallError::ReleaseLookup(e.to_string()))?;

        if !response.status().is_success() {
            return Err(InstallError::ReleaseLookup(format!(
                "server returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| InstallError::ReleaseLookup(e.to_string()))?;

        body.get("tag_name")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| InstallError::ReleaseLookup("response missing tag_name".to_string()))
    }

    /// Compose the download URL for one release asset. Pure string
    /// composition, no network access.
    pub fn asset_url(target: &ReleaseTarget, version: &str) -> String {
        format!(
            "{DOWNLOAD_BASE_URL}/{version}/{BINARY_NAME}-{}-{}-{version}.{}",
            target.os.asset_token(),
            target.arch.asset_token(),
            target.format.extension()
        )
    }

    /// Stream the asset at `url` to a staged temporary file.
    ///
    /// Single attempt; callers decide whether to retry.
    pub async fn fetch(&self, url: &str) -> Result<PathBuf> {
        log::info!("downloading {url}");

        let mut response =
            self.client
                .get(url)
                .send()
                .await
                .map_err(|e| InstallError::Download {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

        if !response.status().is_success() {
            return Err(InstallError::Download {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let mut staged = tempfile::NamedTempFile::new()?;
        while let Some(chunk) = response.chunk().await.map_err(|e| InstallError::Download {
            url: url.to_string(),
            reason: e.to_string(),
        })? {
            staged.write_all(&chunk)?;
        }
        staged.flush()?;

        let (_, path) = staged.keep().map_err(|e| InstallError::Io(e.error))?;
        log::debug!("staged archive at {}", path.display());
        Ok(path)
    }

    /// Extract the engine executable from a staged archive and move it
    /// into place.
    ///
    /// The binary is extracted to a temp file in the destination
    /// directory and renamed over the canonical path, so a crash
    /// mid-install never leaves a truncated executable. Re-running
    /// overwrites the previous binary. The staged archive is removed on
    /// success.
    pub fn install(
        &self,
        archive: &Path,
        target: &ReleaseTarget,
        version: &str,
    ) -> Result<InstalledBinary> {
        fs::create_dir_all(&self.bin_dir)?;

        let dest = self.binary_path(target);
        let mut staged = tempfile::NamedTempFile::new_in(&self.bin_dir)?;

        match target.format {
            ArchiveFormat::GzipRaw => {
                // Raw-gzip assets hold the executable directly.
                let file = File::open(archive)?;
                let mut decoder = GzDecoder::new(file);
                io::copy(&mut decoder, staged.as_file_mut()).map_err(|e| {
                    InstallError::BadArchive {
                        path: archive.to_path_buf(),
                        reason: e.to_string(),
                    }
                })?;
            }
            ArchiveFormat::Zip => {
                let suffix = match target.os.exe_suffix() {
                    "" => BINARY_NAME,
                    suffix => suffix,
                };
                extract_zip_entry(archive, suffix, staged.as_file_mut())?;
            }
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o755))?;
        }

        staged.persist(&dest).map_err(|e| InstallError::Io(e.error))?;

        if let Err(e) = fs::remove_file(archive) {
            log::warn!("failed to remove staged archive {}: {e}", archive.display());
        }
        fs::write(self.bin_dir.join(VERSION_FILE), version)?;

        log::info!("installed engine {version} at {}", dest.display());
        Ok(InstalledBinary {
            path: dest,
            version: Some(version.to_string()),
        })
    }

    /// Resolve, download, and install in one step.
    pub async fn install_release(
        &self,
        target: &ReleaseTarget,
        explicit_version: Option<&str>,
    ) -> Result<InstalledBinary> {
        let version = self.resolve_version(explicit_version).await;
        let url = Self::asset_url(target, &version);
        let archive = self.fetch(&url).await?;
        self.install(&archive, target, &version)
    }

    /// Canonical path the engine binary is installed to.
    pub fn binary_path(&self, target: &ReleaseTarget) -> PathBuf {
        self.bin_dir
            .join(format!("{BINARY_NAME}{}", target.os.exe_suffix()))
    }

    /// Find an existing engine binary by walking the fixed candidate
    /// list. Never invokes the binary.
    pub fn locate(&self) -> Option<InstalledBinary> {
        let mut candidates = vec![
            self.bin_dir.join(with_host_exe_suffix(BINARY_NAME)),
            self.bin_dir.join(with_host_exe_suffix("clash")),
        ];

        #[cfg(unix)]
        candidates.extend([
            PathBuf::from("/usr/local/bin/mihomo"),
            PathBuf::from("/usr/local/bin/clash"),
            PathBuf::from("/usr/bin/mihomo"),
            PathBuf::from("/usr/bin/clash"),
        ]);

        #[cfg(windows)]
        candidates.extend([
            PathBuf::from("C:/Program Files/Clash/clash.exe"),
            PathBuf::from("C:/Program Files (x86)/Clash/clash.exe"),
        ]);

        candidates
            .into_iter()
            .find(|path| path.is_file())
            .map(|path| InstalledBinary {
                path,
                version: self.installed_version(),
            })
    }

    /// Version recorded by the last install, if any.
    pub fn installed_version(&self) -> Option<String> {
        fs::read_to_string(self.bin_dir.join(VERSION_FILE))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Return the latest upstream tag if it differs from the installed
    /// version.
    pub async fn check_for_update(&self) -> Option<String> {
        let installed = self.installed_version()?;
        let latest = self.latest_release_tag().await.ok()?;

        if latest != installed {
            Some(latest)
        } else {
            None
        }
    }
}

impl Default for Installer {
    fn default() -> Self {
        Self::new()
    }
}

fn with_host_exe_suffix(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

fn extract_zip_entry(archive: &Path, suffix: &str, out: &mut File) -> Result<()> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| InstallError::BadArchive {
        path: archive.to_path_buf(),
        reason: e.to_string(),
    })?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(|e| InstallError::BadArchive {
            path: archive.to_path_buf(),
            reason: e.to_string(),
        })?;

        if entry.is_file() && entry.name().ends_with(suffix) {
            io::copy(&mut entry, out).map_err(|e| InstallError::BadArchive {
                path: archive.to_path_buf(),
                reason: e.to_string(),
            })?;
            return Ok(());
        }
    }

    Err(InstallError::NoMatchingEntry {
        path: archive.to_path_buf(),
        suffix: suffix.to_string(),
    })
}
