//! Command-line front end for barc archives.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use barc::cli::{Command, CreateArgs, ExtractArgs, ListArgs};
use barc::{ByteSource, Cli, EntryId, Reader, Writer};

/// Application entry point.
///
/// Parses command-line arguments, installs the stderr log subscriber and
/// dispatches to the subcommand handler.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level())
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match &cli.command {
        Command::Create(args) => create(args, &cli).await,
        Command::Extract(args) => extract(args, &cli).await,
        Command::List(args) => list(args),
    }
}

/// Build a new archive from files and directories.
///
/// Inputs are queued first; the archive itself is written on a blocking
/// thread since the writer does synchronous I/O.
///
/// # Arguments
///
/// * `args` - Archive path, inputs and writer tunables
/// * `cli` - Global flags controlling output verbosity
///
/// # Returns
///
/// Returns `Ok(())` once the archive is on disk. Unreadable inputs are
/// reported but do not fail the command; an unwritable archive does.
async fn create(args: &CreateArgs, cli: &Cli) -> Result<()> {
    let mut writer = Writer::with_options(args.writer_options());

    for input in &args.inputs {
        let meta = tokio::fs::metadata(input)
            .await
            .with_context(|| format!("cannot access {}", input.display()))?;
        if meta.is_dir() {
            add_dir(&mut writer, input, cli).await?;
        } else {
            add_path(&mut writer, input, cli)?;
        }
    }

    let archive = args.archive.clone();
    let summary = tokio::task::spawn_blocking(move || writer.write_file(&archive))
        .await?
        .with_context(|| format!("cannot write {}", args.archive.display()))?;

    if !cli.is_quiet() {
        println!(
            "{}: {} entries, {}",
            args.archive.display(),
            summary.entries,
            format_size(summary.archive_size)
        );
    }
    if summary.dropped > 0 && !cli.is_very_quiet() {
        eprintln!("warning: {} unreadable files were left out", summary.dropped);
    }
    Ok(())
}

/// Queue every regular file below `root`, in sorted order per directory.
async fn add_dir(writer: &mut Writer, root: &Path, cli: &Cli) -> Result<()> {
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("cannot read directory {}", dir.display()))?;

        let mut children = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            children.push((entry.path(), entry.file_type().await?));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));

        // Reversed so the stack pops subdirectories in name order.
        for (path, file_type) in children.into_iter().rev() {
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                add_path(writer, &path, cli)?;
            } else if file_type.is_symlink() {
                // Linked directories are not followed.
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.is_file() => add_path(writer, &path, cli)?,
                    _ => debug!(path = %path.display(), "skipping symlink"),
                }
            }
        }
    }
    Ok(())
}

/// Queue a single file under its archive name.
///
/// # Arguments
///
/// * `writer` - Writer collecting the entries
/// * `path` - File to add; it is read when the archive is written
/// * `cli` - Global flags controlling output verbosity
///
/// # Returns
///
/// Returns `Ok(())` on success, including when the path has no usable name
/// and is skipped.
fn add_path(writer: &mut Writer, path: &Path, cli: &Cli) -> Result<()> {
    let Some(name) = entry_name(path) else {
        warn!(path = %path.display(), "skipping path without a usable entry name");
        return Ok(());
    };
    if !cli.is_quiet() {
        println!("  adding: {name}");
    }
    writer.add_file(name, path)?;
    Ok(())
}

/// Archive name for a filesystem path: its normal components joined by `/`.
fn entry_name(path: &Path) -> Option<String> {
    let parts: Vec<_> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Extract selected entries to disk or stdout.
///
/// Handles various extraction options:
/// - Pipe mode (`-p`): Write to stdout instead of files
/// - Custom output directory (`-d`): Extract to specified directory
/// - Junk paths (`-j`): Ignore directory structure in entry names
/// - Overwrite control (`-n`, `-o`): Handle existing files
///
/// # Arguments
///
/// * `args` - Archive path, entry selection and output options
/// * `cli` - Global flags controlling output verbosity
///
/// # Returns
///
/// Returns an error if the archive cannot be opened, or after the run if
/// any entry was unmatched, unreadable or unwritable.
async fn extract(args: &ExtractArgs, cli: &Cli) -> Result<()> {
    let mut reader = Reader::open_file(&args.archive)
        .with_context(|| format!("cannot open {}", args.archive.display()))?;

    let mut failures = 0usize;
    let ids = select_entries(&mut reader, &args.names, &mut failures)?;

    let show_names = args.pipe && ids.len() > 1;
    for id in ids {
        let name = String::from_utf8_lossy(reader.entry_name(id)?).into_owned();
        let data = match reader.read_to_vec(id) {
            Ok(data) => data,
            Err(e) => {
                eprintln!("error: cannot extract {name}: {e}");
                failures += 1;
                continue;
            }
        };

        if args.pipe {
            let mut stdout = tokio::io::stdout();
            if show_names {
                stdout.write_all(format!("--- {name} ---\n").as_bytes()).await?;
            }
            stdout.write_all(&data).await?;
            stdout.flush().await?;
            continue;
        }

        let Some(relative) = output_path(&name, args.junk_paths) else {
            eprintln!("skipping: {name} (unsafe path)");
            failures += 1;
            continue;
        };
        let output = match &args.extract_dir {
            Some(dir) => dir.join(relative),
            None => relative,
        };

        if tokio::fs::try_exists(&output).await? {
            if args.never_overwrite {
                if !cli.is_quiet() {
                    eprintln!("Skipping: {name} (file exists)");
                }
                continue;
            }
            if !args.overwrite {
                if !cli.is_quiet() {
                    eprintln!("Skipping: {name} (use -o to overwrite)");
                }
                continue;
            }
        }

        if !cli.is_quiet() {
            println!("  extracting: {name}");
        }
        if let Err(e) = write_output(&output, &data).await {
            eprintln!("error: cannot write {}: {e:#}", output.display());
            failures += 1;
        }
    }

    if failures > 0 {
        bail!("{failures} entries could not be extracted");
    }
    Ok(())
}

/// Resolve the requested names to entry ids.
///
/// Exact names go through [`Reader::find`]; patterns with `*` or `?` are
/// matched against every entry. When names repeat inside the archive only
/// the entry added last is selected, so extraction agrees with lookup.
///
/// # Arguments
///
/// * `reader` - The open archive
/// * `names` - Names or glob patterns from the command line; empty selects everything
/// * `failures` - Incremented once for every name that matched nothing
///
/// # Returns
///
/// Selected ids in request order (storage order for a full extraction),
/// each at most once.
fn select_entries<S: ByteSource>(
    reader: &mut Reader<S>,
    names: &[String],
    failures: &mut usize,
) -> Result<Vec<EntryId>> {
    if names.is_empty() {
        return Ok(newest_entries(reader, |_| true));
    }

    let mut ids = Vec::new();
    for pattern in names {
        if has_glob_chars(pattern) {
            let matched = newest_entries(reader, |name| glob_match(pattern, name));
            if !matched.is_empty() {
                ids.extend(matched);
                continue;
            }
        } else {
            match reader.find(pattern) {
                Ok(id) => {
                    ids.push(id);
                    continue;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        eprintln!("caution: filename not matched:  {pattern}");
        *failures += 1;
    }

    let mut seen = HashSet::new();
    ids.retain(|id| seen.insert(*id));
    Ok(ids)
}

/// Ids of entries whose name passes `filter`, skipping entries shadowed by
/// a later entry of the same name.
fn newest_entries<S: ByteSource>(
    reader: &Reader<S>,
    mut filter: impl FnMut(&str) -> bool,
) -> Vec<EntryId> {
    let mut newest: HashMap<&[u8], EntryId> = HashMap::new();
    for entry in reader.entries() {
        newest.insert(entry.name, entry.id);
    }
    reader
        .entries()
        .filter(|e| newest.get(e.name) == Some(&e.id))
        .filter(|e| filter(&e.name_lossy()))
        .map(|e| e.id)
        .collect()
}

/// Write extracted bytes to `path`, creating missing parent directories.
///
/// # Arguments
///
/// * `path` - Destination file, relative to the working directory or `-d`
/// * `data` - Decompressed entry contents
///
/// # Returns
///
/// Returns `Ok(())` on success, or the filesystem error that stopped the write.
async fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await?;
    Ok(())
}

/// Relative output path for an entry name, or `None` if the name would
/// escape the extraction directory.
fn output_path(name: &str, junk_paths: bool) -> Option<PathBuf> {
    let parts: Vec<&str> = name
        .split(['/', '\\'])
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.contains(&"..") {
        return None;
    }

    let path: PathBuf = if junk_paths {
        PathBuf::from(parts.last()?)
    } else {
        parts.iter().collect()
    };
    let safe = path.components().next().is_some()
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    safe.then_some(path)
}

/// List archive contents.
///
/// Supports two output formats:
/// - Simple format: just entry names, one per line
/// - Verbose format (`-v`): table with sizes and compression ratio
///
/// # Arguments
///
/// * `args` - Archive path and listing format
///
/// # Returns
///
/// Returns `Ok(())` on success, or an error if the archive cannot be opened.
fn list(args: &ListArgs) -> Result<()> {
    let reader = Reader::open_file(&args.archive)
        .with_context(|| format!("cannot open {}", args.archive.display()))?;

    if !args.verbose {
        for entry in reader.entries() {
            println!("{}", entry.name_lossy());
        }
        return Ok(());
    }

    println!("{:>10}  {:>10}  {:>5}  Name", "Length", "Size", "Cmpr");
    println!("{}", "-".repeat(50));

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    for entry in reader.entries() {
        println!(
            "{:>10}  {:>10}  {}  {}",
            entry.size,
            entry.compressed_size,
            ratio(entry.compressed_size, entry.size),
            entry.name_lossy()
        );
        total_uncompressed += entry.size;
        total_compressed += entry.compressed_size;
    }

    println!("{}", "-".repeat(50));
    println!(
        "{:>10}  {:>10}  {}  {} files, {}{}",
        total_uncompressed,
        total_compressed,
        ratio(total_compressed, total_uncompressed),
        reader.len(),
        format_size(reader.catalog().archive_size()),
        if reader.catalog().is_indexed() { ", indexed" } else { "" }
    );
    Ok(())
}

/// Space saved as a right-aligned percentage.
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - compressed * 100 / uncompressed)
    } else {
        format!("{:>4}%", 0)
    }
}

fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Glob matching with `*` (any run) and `?` (one character).
///
/// Single pass with backtracking to the most recent `*` only, so patterns
/// with many stars stay linear in practice.
///
/// # Examples
///
/// ```ignore
/// assert!(glob_match("*.txt", "readme.txt"));
/// assert!(glob_match("file?.dat", "file1.dat"));
/// assert!(!glob_match("*.txt", "readme.md"));
/// ```
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    // (pattern index after the last `*`, text index it was tried at)
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                p += 1;
                star = Some((p, t));
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                // Let the last star swallow one more character.
                Some((after_star, tried)) => {
                    p = after_star;
                    t = tried + 1;
                    star = Some((after_star, tried + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// Format a byte size into a human-readable string.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
