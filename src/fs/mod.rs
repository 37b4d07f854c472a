//! Backend-agnostic file system layer

pub mod atomic;
pub mod auth;
pub mod converter;
pub mod errors;
pub mod model;
pub mod provider;
pub mod remote;
pub mod resolver;

pub use atomic::write_atomic;
pub use auth::{
    AuthState, AuthType, CredentialsAuthenticator, FileSystemAuthenticator, NoAuthAuthenticator,
    PendingAuthorization,
};
pub use converter::FsAuthorityConverter;
pub use errors::{incorrect_use, FileSystemError, Result};
pub use model::{
    file_name, join_path, normalize_path, parent_path, BasicCredentials, FileDescriptor, FsAuthority,
    FsOptions, FsType, GitAuth, GitCredentials, ServerCredentials,
};
pub use provider::{check_authority, FileSystemProvider};
pub use remote::{
    RemoteClient, RemoteFileSystemProvider, RemoteMetadata, RemoteSession, UploadOutcome, WriteMode,
};
pub use resolver::{FileSystemResolver, FileSystemResolverBuilder, ProviderFactory, ResolverConfigError};
