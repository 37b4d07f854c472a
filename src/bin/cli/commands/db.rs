use std::io::BufRead;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use keepsync_lib::database::{DatabaseContent, EncryptedDatabaseRepository};
use keepsync_lib::dispatch::Dispatchers;
use keepsync_lib::encryption::{BiometricKey, EncryptedDatabaseKey, KeyringKeyCipher, PasswordKey};
use keepsync_lib::fs::{FileDescriptor, FsOptions};

use crate::app::App;
use crate::render::terminal::{paint, Color};
use crate::OutputFormat;

/// Master password source when not reading from stdin
pub const PASSWORD_ENV: &str = "KEEPSYNC_PASSWORD";
const KEYRING_SERVICE: &str = "keepsync";
const KEYRING_ACCOUNT: &str = "biometric-key";

fn read_password() -> Result<PasswordKey> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(PasswordKey::new(password));
    }
    eprint!("Master password: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password")?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("No password given (set {} or type it on stdin)", PASSWORD_ENV);
    }
    Ok(PasswordKey::new(password))
}

fn repository(app: &App) -> EncryptedDatabaseRepository {
    EncryptedDatabaseRepository::new(Arc::clone(&app.resolver)).with_registry(Arc::clone(&app.registry))
}

fn key_cipher() -> KeyringKeyCipher {
    KeyringKeyCipher::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
}

pub async fn run_create(app: &App, file: &FileDescriptor, enroll_biometric: bool) -> Result<()> {
    let key = Arc::new(read_password()?);
    let repository = repository(app);
    repository
        .create_async(&Dispatchers::default(), Arc::<PasswordKey>::clone(&key), file.clone(), FsOptions::default())
        .await
        .with_context(|| format!("Failed to create {}", file.path))?;
    repository.close()?;
    println!("Created {}", file.path);

    if enroll_biometric {
        let material = key.key()?;
        BiometricKey::enroll(app.context.settings.as_ref(), &key_cipher(), &material)
            .context("Failed to store the key in the system keyring")?;
        println!("Key stored in the system keyring; use `db show --biometric` to unlock");
    }
    Ok(())
}

pub async fn run_show(
    app: &App,
    file: &FileDescriptor,
    biometric: bool,
    format: &OutputFormat,
    use_color: bool,
) -> Result<()> {
    let key: Arc<dyn EncryptedDatabaseKey> = if biometric {
        Arc::new(BiometricKey::new(Arc::clone(&app.context.settings), Arc::new(key_cipher())))
    } else {
        Arc::new(read_password()?)
    };

    let repository = repository(app);
    let handle = repository
        .open_async(&Dispatchers::default(), key, file.clone(), FsOptions::read_only())
        .await
        .with_context(|| format!("Failed to open {}", file.path))?;
    let content = handle.read(|db| db.content().clone());
    repository.close()?;

    match format {
        OutputFormat::Json => {
            let groups: Vec<_> = content
                .groups
                .iter()
                .map(|g| serde_json::json!({ "uid": g.uid, "parentUid": g.parent_uid, "title": g.title }))
                .collect();
            let notes: Vec<_> = content
                .notes
                .iter()
                .map(|n| {
                    serde_json::json!({
                        "uid": n.uid,
                        "groupUid": n.group_uid,
                        "title": n.title,
                        "username": n.username,
                        "url": n.url,
                        "modified": n.modified,
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "name": content.name,
                    "groups": groups,
                    "notes": notes,
                }))?
            );
        }
        OutputFormat::Plain => {
            println!("{}", paint(&content.name, Color::BOLD, use_color));
            print_group(&content, content.root_group_uid, 1, use_color);
        }
    }
    Ok(())
}

fn print_group(content: &DatabaseContent, uid: Uuid, depth: usize, use_color: bool) {
    let indent = "  ".repeat(depth);
    for note in content.notes_in(uid) {
        let user = if note.username.is_empty() {
            String::new()
        } else {
            format!(" {}", paint(&note.username, Color::DIM, use_color))
        };
        println!("{}{}{}", indent, note.title, user);
    }
    for group in content.child_groups(uid) {
        println!("{}{}/", indent, paint(&group.title, Color::BLUE, use_color));
        print_group(content, group.uid, depth + 1, use_color);
    }
}
