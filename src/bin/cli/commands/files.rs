use anyhow::{bail, Context, Result};

use keepsync_lib::fs::FileDescriptor;
use keepsync_lib::registry::UsedFile;

use crate::app::App;
use crate::render::terminal::{paint, timestamp, Color};
use crate::OutputFormat;

pub fn run_list(app: &App, format: &OutputFormat, use_color: bool) -> Result<()> {
    let files = app.used_files()?;

    match format {
        OutputFormat::Json => {
            let output: Vec<_> = files
                .iter()
                .enumerate()
                .map(|(i, f)| {
                    serde_json::json!({
                        "index": i + 1,
                        "fsType": f.fs_authority.fs_type.as_str(),
                        "server": f.fs_authority.credentials.as_ref().map(|c| c.server_url()),
                        "path": f.file_path,
                        "uid": f.file_uid,
                        "name": f.file_name,
                        "addedTime": f.added_time,
                        "lastAccessTime": f.last_access_time,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            if files.is_empty() {
                println!("(no files, add one with `files add`)");
            }
            for (i, f) in files.iter().enumerate() {
                let location = match &f.fs_authority.credentials {
                    Some(credentials) => format!("{} {}", f.fs_authority.fs_type, credentials.server_url()),
                    None => f.fs_authority.fs_type.to_string(),
                };
                println!(
                    "{:>3}  {}  {}  {}",
                    i + 1,
                    paint(&f.file_name, Color::BOLD, use_color),
                    paint(&location, Color::DIM, use_color),
                    f.file_path
                );
                println!("     last used {}", timestamp(Some(f.last_access_time)));
            }
        }
    }
    Ok(())
}

pub fn run_add(app: &App, file: &FileDescriptor) -> Result<()> {
    if let Some(existing) = app.registry.find(&file.fs_authority, &file.uid)? {
        println!("Already known: {}", existing.file_path);
        return Ok(());
    }
    app.registry
        .insert(&UsedFile::from_descriptor(file))
        .context("Failed to record file")?;
    println!("Added {}", file.path);
    Ok(())
}

pub fn run_remove(app: &App, file: &FileDescriptor) -> Result<()> {
    if !app.registry.remove(&file.fs_authority, &file.uid)? {
        bail!("{} is not in the file list", file.path);
    }
    println!("Removed {}", file.path);
    Ok(())
}
