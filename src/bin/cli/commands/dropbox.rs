use anyhow::{bail, Context, Result};

use keepsync_lib::fs::{FsAuthority, FsType};
use keepsync_lib::settings::DROPBOX_PENDING_VERIFIER;

use crate::app::App;

fn authenticator(app: &App) -> Result<std::sync::Arc<dyn keepsync_lib::fs::FileSystemAuthenticator>> {
    let provider = app
        .resolver
        .resolve_provider(&FsAuthority::new(FsType::Dropbox, None))
        .context("Failed to set up Dropbox")?;
    Ok(provider.authenticator())
}

pub fn run_login(app: &App) -> Result<()> {
    let auth = authenticator(app)?;
    if !auth.is_authentication_required() {
        println!("Already signed in to Dropbox");
        return Ok(());
    }

    let pending = auth.start_external_auth()?;
    println!("Open this URL, allow access, then run `dropbox finish <code>`:");
    println!();
    println!("  {}", pending.authorize_url);
    Ok(())
}

pub fn run_finish(app: &App, code: &str) -> Result<()> {
    if app.context.settings.get_string(DROPBOX_PENDING_VERIFIER).is_none() {
        bail!("No sign-in in progress, run `dropbox login` first");
    }
    let auth = authenticator(app)?;
    auth.complete_external_auth(code)
        .context("Dropbox did not accept the authorization code")?;
    println!("Signed in to Dropbox");
    Ok(())
}

pub fn run_logout(app: &App) -> Result<()> {
    authenticator(app)?.on_credentials_rejected();
    app.resolver.forget(&FsAuthority::new(FsType::Dropbox, None));
    println!("Signed out of Dropbox");
    Ok(())
}
