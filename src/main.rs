mod config;
mod deploy;
mod download;
mod error;
mod extract;
mod install;
mod layout;
mod library;
mod metadata;
mod pipeline;
mod resolver;

use crate::config::{app_data_dir, AppConfig};
use crate::download::CancelToken;
use crate::install::{AlwaysCopyAsNew, AlwaysOverwrite, CollisionPolicy};
use crate::pipeline::{spawn_batch, FileSelection, Pipeline, PipelineEvent};
use anyhow::{bail, Context, Result};
use std::{fs, io, path::PathBuf, sync::mpsc};

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1).peekable();
    let mut install_urls = Vec::new();
    let mut import_paths = Vec::new();
    let mut batch_file: Option<String> = None;
    let mut remove_names = Vec::new();
    let mut all_files = false;
    let mut do_deploy = false;
    let mut do_list = false;
    let mut do_adopt = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--install" | "-i" => {
                if let Some(url) = args.next() {
                    install_urls.push(url);
                } else {
                    eprintln!("--install requires a mod page URL");
                }
            }
            "--import" => {
                if let Some(path) = args.next() {
                    import_paths.push(path);
                } else {
                    eprintln!("--import requires an archive path");
                }
            }
            "--batch" | "-b" => {
                if let Some(path) = args.next() {
                    batch_file = Some(path);
                } else {
                    eprintln!("--batch requires a file of URLs");
                }
            }
            "--remove" => {
                if let Some(name) = args.next() {
                    remove_names.push(name);
                } else {
                    eprintln!("--remove requires a mod name");
                }
            }
            "--all-files" => all_files = true,
            "--deploy" | "-d" => do_deploy = true,
            "--list" | "-l" => do_list = true,
            "--adopt" => do_adopt = true,
            "--help" | "-h" => {
                println!("paksmith");
                println!("  --install <url>    Resolve a mod page and install its file");
                println!("  --import <path>    Install a local archive");
                println!("  --batch <file>     Install every URL listed in <file>");
                println!("  --all-files        Install every file a page offers, not just the first");
                println!("  --deploy           Rebuild <game root>/~mods from enabled mods");
                println!("  --adopt            Wrap loose .pak files in the library into entries");
                println!("  --remove <name>    Delete a mod from the library");
                println!("  --list             List installed mods");
                return Ok(());
            }
            other => eprintln!("unknown argument: {other}"),
        }
    }

    let config = AppConfig::load_or_create()?;
    let mods_root = library::mods_root(&app_data_dir()?);
    let selection = if all_files {
        FileSelection::All
    } else {
        FileSelection::First
    };

    if let Some(path) = batch_file {
        let raw = fs::read_to_string(&path).with_context(|| format!("read batch file {path}"))?;
        let urls: Vec<String> = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        if urls.is_empty() {
            bail!("batch file {path} has no URLs");
        }
        run_batch(mods_root.clone(), urls, selection, &config)?;
    }

    for url in &install_urls {
        run_batch(mods_root.clone(), vec![url.clone()], selection, &config)?;
    }

    if !import_paths.is_empty() {
        let policy = collision_policy(&config);
        let gate = PromptGate {
            skip: config.skip_install_confirmation,
        };
        let mut pipeline = Pipeline::new(mods_root.clone(), policy.as_ref());
        pipeline.gate = &gate;
        for path in &import_paths {
            let archive = PathBuf::from(path);
            let name = archive
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("Imported Mod");
            let installed = pipeline.install_archive(
                &archive,
                metadata::ModMetadata::named(library::sanitize_mod_name(name)),
                None,
            )?;
            println!("Installed {}", installed.name);
        }
    }

    if !remove_names.is_empty() {
        let mut config = config.clone();
        let entries = library::list_mods(&mods_root)?;
        for name in &remove_names {
            match library::find_mod(&entries, name) {
                Some(entry) => {
                    library::delete_mod(entry)?;
                    config.set_enabled(name, false);
                    println!("Removed {name}");
                }
                None => eprintln!("No mod named {name}"),
            }
        }
        config.save()?;
    }

    if do_adopt {
        let adopted = library::adopt_loose_paks(&mods_root)?;
        println!("Adopted {adopted} loose file(s)");
    }

    if do_deploy {
        let Some(game_root) = config.game_root.as_deref() else {
            bail!("no game root configured; set game_root in config.json");
        };
        let entries = library::list_mods(&mods_root)?;
        let report = deploy::deploy(game_root, &entries, &config)?;
        println!(
            "Deployed {} file(s), cleared {}",
            report.deployed.len(),
            report.cleared
        );
        if let Some(backup) = report.backup {
            println!("Previous deployment saved to {}", backup.display());
        }
    }

    if do_list {
        let entries = library::list_mods(&mods_root)?;
        if entries.is_empty() {
            println!("No mods installed");
        }
        for entry in entries {
            let state = if config.is_enabled(&entry.metadata.name) {
                "enabled"
            } else {
                "disabled"
            };
            println!(
                "{} v{} by {} [{state}] - {} file(s)",
                entry.metadata.name,
                entry.metadata.version,
                entry.metadata.author,
                entry.payload_files().len()
            );
        }
    }

    Ok(())
}

/// Runs the URLs on the pipeline worker and renders its events on stdout.
fn run_batch(
    mods_root: PathBuf,
    urls: Vec<String>,
    selection: FileSelection,
    config: &AppConfig,
) -> Result<()> {
    let (sender, receiver) = mpsc::channel();
    let handle = spawn_batch(
        mods_root,
        urls,
        selection,
        config.suppress_collision_prompt,
        sender,
        CancelToken::new(),
    );

    for event in receiver {
        match event {
            PipelineEvent::Resolving { url } => println!("Resolving {url}"),
            PipelineEvent::Resolved { name, files } => {
                println!("Found \"{name}\" with {files} file(s)")
            }
            PipelineEvent::Downloading { file } => println!("Downloading {file}"),
            PipelineEvent::DownloadProgress { downloaded, total } if total > 0 => {
                print!("\r  {downloaded}/{total} bytes");
                if downloaded >= total {
                    println!();
                }
            }
            PipelineEvent::DownloadProgress { .. } => {}
            PipelineEvent::BatchProgress { fraction } => {
                print!("\r  {:.0}%", fraction * 100.0);
                if fraction >= 1.0 {
                    println!();
                }
            }
            PipelineEvent::Extracting { archive } => {
                println!("Extracting {}", archive.display())
            }
            PipelineEvent::Installing { name } => println!("Installing {name}"),
            PipelineEvent::Installed { name } => println!("Installed {name}"),
            PipelineEvent::Failed { url, error } => eprintln!("Failed {url}: {error}"),
        }
    }

    let report = handle
        .join()
        .map_err(|_| anyhow::anyhow!("install worker panicked"))?;
    println!("{}", report.summary());
    Ok(())
}

fn collision_policy(config: &AppConfig) -> Box<dyn CollisionPolicy> {
    if config.suppress_collision_prompt {
        Box::new(AlwaysOverwrite)
    } else {
        Box::new(AlwaysCopyAsNew)
    }
}

/// Asks before each import unless the config says not to. An empty answer
/// counts as yes.
struct PromptGate {
    skip: bool,
}

impl install::InstallGate for PromptGate {
    fn confirm(&self, metadata: &metadata::ModMetadata) -> bool {
        if self.skip {
            return true;
        }
        print!("Install \"{}\"? [Y/n] ", metadata.name);
        let _ = io::Write::flush(&mut io::stdout());
        let mut answer = String::new();
        if io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        let answer = answer.trim().to_ascii_lowercase();
        answer.is_empty() || answer == "y" || answer == "yes"
    }
}
