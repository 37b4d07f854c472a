use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use keepsync_lib::backends::{self, BackendContext};
use keepsync_lib::config::AppConfig;
use keepsync_lib::encryption::ChaChaDataCipher;
use keepsync_lib::fs::{
    normalize_path, BasicCredentials, FileDescriptor, FsAuthority, FsAuthorityConverter, FsType, GitAuth,
    GitCredentials, ServerCredentials,
};
use keepsync_lib::registry::{UsedFile, UsedFileRepository};
use keepsync_lib::settings::JsonFileSettings;
use keepsync_lib::FileSystemResolver;

/// Password for WebDAV and Git remotes
pub const REMOTE_PASSWORD_ENV: &str = "KEEPSYNC_REMOTE_PASSWORD";
const KEYRING_SERVICE: &str = "keepsync";

/// Connection flags shared by every command taking a file reference
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RemoteArgs {
    /// WebDAV server URL or Git repository URL
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Username for WebDAV or Git over HTTPS
    #[arg(long, global = true)]
    pub user: Option<String>,

    /// Private key for Git over SSH
    #[arg(long, global = true)]
    pub ssh_key: Option<String>,
}

/// Shared application state for CLI commands
pub struct App {
    pub config: AppConfig,
    pub context: BackendContext,
    pub resolver: Arc<FileSystemResolver>,
    pub registry: Arc<UsedFileRepository>,
}

impl App {
    pub fn new(config: AppConfig) -> Result<Self> {
        let data_dir = config.data_dir().context("Failed to get data directory")?;
        std::fs::create_dir_all(&data_dir).with_context(|| format!("Failed to create {}", data_dir.display()))?;

        let settings = JsonFileSettings::open(config.settings_path()?).context("Failed to open settings")?;
        let context = BackendContext::from_config(&config, Arc::new(settings))?;
        let resolver = Arc::new(backends::resolver(&context)?);

        let cipher = ChaChaDataCipher::from_keyring(KEYRING_SERVICE).context("Failed to load credential key")?;
        let registry = UsedFileRepository::open(&config.registry_path()?, FsAuthorityConverter::new(Arc::new(cipher)))
            .context("Failed to open file registry")?;

        Ok(Self {
            config,
            context,
            resolver,
            registry: Arc::new(registry),
        })
    }

    pub fn used_files(&self) -> Result<Vec<UsedFile>> {
        self.registry.get_all().context("Failed to read file registry")
    }

    /// Resolve a file reference.
    ///
    /// Accepted forms: an index from `files list`, an absolute local path, or
    /// `<backend>:<path>` with backend one of local, dropbox, webdav, git, fake.
    pub fn file_ref(&self, reference: &str, remote: &RemoteArgs) -> Result<FileDescriptor> {
        if let Ok(index) = reference.parse::<usize>() {
            let files = self.used_files()?;
            return match index.checked_sub(1).and_then(|i| files.get(i)) {
                Some(file) => Ok(file.descriptor()),
                None => bail!("No file #{} (there are {} known files)", index, files.len()),
            };
        }

        let (fs_type, path) = match reference.split_once(':') {
            Some((scheme, path)) if !scheme.contains('/') => (parse_scheme(scheme)?, path),
            _ => (FsType::RegularFs, reference),
        };

        if fs_type == FsType::RegularFs {
            let path = absolute(path)?;
            return Ok(FileDescriptor::file(FsAuthority::local(), path.clone(), path));
        }

        let authority = FsAuthority::new(fs_type, credentials(fs_type, remote)?);
        let path = normalize_path(path);
        let provider = self.resolver.resolve_provider(&authority)?;
        match provider.get_file(&path, Default::default()) {
            Ok(file) => Ok(file),
            Err(e) if e.is_network() => {
                log::warn!("Using {} without remote metadata: {}", path, e);
                Ok(FileDescriptor::file(authority, path.clone(), path))
            }
            Err(e) => Err(e).with_context(|| format!("Failed to resolve {}", reference)),
        }
    }
}

fn parse_scheme(scheme: &str) -> Result<FsType> {
    Ok(match scheme.to_lowercase().as_str() {
        "local" | "file" => FsType::RegularFs,
        "dropbox" => FsType::Dropbox,
        "webdav" | "dav" => FsType::Webdav,
        "git" => FsType::Git,
        "fake" => FsType::Fake,
        other => bail!("Unknown backend '{}'", other),
    })
}

fn absolute(path: &str) -> Result<String> {
    let path = Path::new(path);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(path.to_string_lossy().to_string())
}

fn credentials(fs_type: FsType, remote: &RemoteArgs) -> Result<Option<ServerCredentials>> {
    let password = std::env::var(REMOTE_PASSWORD_ENV).ok();
    match fs_type {
        FsType::Webdav => {
            let server_url = remote.server.clone().context("WebDAV files need --server")?;
            let username = remote.user.clone().context("WebDAV files need --user")?;
            let password = password.with_context(|| format!("Set {} for WebDAV", REMOTE_PASSWORD_ENV))?;
            Ok(Some(ServerCredentials::Basic(BasicCredentials {
                server_url,
                username,
                password,
            })))
        }
        FsType::Git => {
            let url = remote.server.clone().context("Git files need --server <repository url>")?;
            let auth = match (&remote.ssh_key, &remote.user) {
                (Some(key_path), _) => Some(GitAuth::SshKey {
                    key_path: key_path.clone(),
                    passphrase: password,
                }),
                (None, Some(username)) => Some(GitAuth::Password {
                    username: username.clone(),
                    password: password.with_context(|| format!("Set {} for Git", REMOTE_PASSWORD_ENV))?,
                }),
                (None, None) => None,
            };
            Ok(Some(ServerCredentials::Git(GitCredentials { url, auth })))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_parsing() {
        assert_eq!(parse_scheme("Dropbox").unwrap(), FsType::Dropbox);
        assert_eq!(parse_scheme("dav").unwrap(), FsType::Webdav);
        assert!(parse_scheme("ftp").is_err());
    }

    #[test]
    fn test_webdav_requires_server() {
        let remote = RemoteArgs::default();
        assert!(credentials(FsType::Webdav, &remote).is_err());
        assert!(credentials(FsType::Dropbox, &remote).unwrap().is_none());
    }

    #[test]
    fn test_anonymous_git() {
        let remote = RemoteArgs {
            server: Some("/srv/vault.git".to_string()),
            ..Default::default()
        };
        let creds = credentials(FsType::Git, &remote).unwrap().unwrap();
        assert_eq!(creds.server_url(), "/srv/vault.git");
    }
}
