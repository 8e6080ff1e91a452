//! Write a starter `sandboxd.toml` into the current directory.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::config::CONFIG_FILE;
use crate::templates;

/// What happened to the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteResult {
    Created,
    Overwritten,
    /// Already present and `--force` not given.
    Skipped,
}

pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    info!("Initializing sandboxd in {}", cwd.display());

    let result = write_config(&cwd, force)?;
    print!("{}", format_result(result));
    Ok(())
}

/// Writes the template into `dir`, leaving an existing file alone unless
/// `force` is set.
fn write_config(dir: &Path, force: bool) -> Result<WriteResult> {
    let path = dir.join(CONFIG_FILE);
    let existed = path.exists();
    if existed && !force {
        return Ok(WriteResult::Skipped);
    }

    fs::write(&path, templates::SANDBOXD_TOML)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(if existed {
        WriteResult::Overwritten
    } else {
        WriteResult::Created
    })
}

fn format_result(result: WriteResult) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "\n{} sandboxd initialized\n", "✓".green().bold());

    let _ = match result {
        WriteResult::Created => writeln!(&mut out, "  {} created", CONFIG_FILE.cyan()),
        WriteResult::Overwritten => {
            writeln!(&mut out, "  {} {} (overwritten)", "↻".blue(), CONFIG_FILE)
        }
        WriteResult::Skipped => writeln!(
            &mut out,
            "  {} {} (already exists, use --force to overwrite)",
            "⊘".yellow(),
            CONFIG_FILE
        ),
    };

    let _ = writeln!(
        &mut out,
        "\nEdit {} and {}, then run {}",
        "[capacity]".cyan(),
        "[gateway]".cyan(),
        "sandboxd run".green()
    );
    out
}
