use anyhow::{Context, Result};

use keepsync_lib::fs::{FileDescriptor, FsOptions, FsType};

use crate::app::App;
use crate::render::terminal;
use crate::OutputFormat;

pub fn run(app: &App, dir: &FileDescriptor, format: &OutputFormat, use_color: bool) -> Result<()> {
    let provider = app.resolver.resolve_provider(&dir.fs_authority)?;

    // References resolve to plain files; ask the backend what is really there
    let dir = if dir.fs_authority.fs_type != FsType::RegularFs && dir.path == "/" {
        provider.root_file()?
    } else {
        let resolved = provider.get_file(&dir.path, FsOptions::default())?;
        if resolved.is_directory {
            resolved
        } else {
            provider.get_parent(&resolved)?
        }
    };

    let files = provider
        .list_files(&dir)
        .with_context(|| format!("Failed to list {}", dir.path))?;

    match format {
        OutputFormat::Json => {
            let output: Vec<_> = files
                .iter()
                .map(|f| {
                    serde_json::json!({
                        "path": f.path,
                        "uid": f.uid,
                        "name": f.name,
                        "isDirectory": f.is_directory,
                        "modified": f.modified,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            println!("{}", dir.path);
            for f in &files {
                println!("  {}", terminal::entry(f, use_color));
            }
        }
    }
    Ok(())
}
