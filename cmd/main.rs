use {
    anyhow::{anyhow, Context, Result},
    clap::{Parser, Subcommand},
    futures::StreamExt,
    futures_lite::io::{self, AsyncRead, AsyncWriteExt},
    smol::{fs, Unblock},
    std::{
        path::{Path, PathBuf},
        pin::pin,
        process::ExitCode,
    },
    tarstream::{EntryOptions, EntryType, TarBuilder, TarEntry, TarReader},
    tracing_subscriber::fmt,
};

#[derive(Parser, Debug)]
#[command(version, about = "Streaming tar archive tool")]
struct App {
    /// Increase logging verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// List archive entries
    #[command(name = "list")]
    List {
        /// Show mode, owner, size and modification time
        #[arg(short = 'l', long = "long", action)]
        long: bool,
        /// Archive to read, standard input if omitted or `-`
        #[arg(value_name = "ARCHIVE")]
        archive: Option<PathBuf>,
    },
    /// Create an archive from files and directories
    #[command(name = "create")]
    Create {
        /// Target file name, standard output if omitted
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        out: Option<PathBuf>,
        /// Files and directories to add, directories recursively
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },
    /// Print the content of a single archive member
    #[command(name = "cat")]
    Cat {
        /// Archive to read
        #[arg(value_name = "ARCHIVE")]
        archive: PathBuf,
        /// Member name
        #[arg(value_name = "NAME")]
        name: String,
    },
}

fn init(cli: &App) -> Result<()> {
    let level = match cli.verbose {
        0 => tracing::level_filters::LevelFilter::WARN,
        1 => tracing::level_filters::LevelFilter::INFO,
        2 => tracing::level_filters::LevelFilter::DEBUG,
        _ => tracing::level_filters::LevelFilter::TRACE,
    };
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let base_format = fmt::format()
        .without_time()
        .with_level(true)
        .with_target(true);

    fmt()
        .with_env_filter(filter)
        .event_format(base_format)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to initialize logging: {}", err))
}

async fn open_archive(path: Option<&Path>) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
    Ok(match path {
        Some(path) if path != Path::new("-") => Box::new(
            fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        _ => Box::new(Unblock::new(std::io::stdin())),
    })
}

fn type_char(entry_type: EntryType) -> char {
    match entry_type {
        EntryType::Directory => 'd',
        EntryType::Symlink => 'l',
        EntryType::Link => 'h',
        EntryType::CharDevice => 'c',
        EntryType::BlockDevice => 'b',
        EntryType::Fifo => 'p',
        _ => '-',
    }
}

fn long_line<R>(entry: &TarEntry<R>) -> String {
    let mut line = format!(
        "{}{:04o} {}/{} {:>10} {:>11} {}",
        type_char(entry.entry_type),
        entry.file_mode.unwrap_or(0),
        entry
            .owner
            .clone()
            .unwrap_or_else(|| entry.uid.unwrap_or(0).to_string()),
        entry
            .group
            .clone()
            .unwrap_or_else(|| entry.gid.unwrap_or(0).to_string()),
        entry.data_len(),
        entry.mtime.unwrap_or(0),
        entry.file_name,
    );
    if let Some(target) = &entry.link_name {
        let arrow = if entry.entry_type == EntryType::Link {
            "link to"
        } else {
            "->"
        };
        line.push_str(&format!(" {} {}", arrow, target));
    }
    line
}

async fn list(archive: Option<&Path>, long: bool) -> Result<()> {
    let mut stream = pin!(TarReader::new(open_archive(archive).await?));
    let mut out = Unblock::new(std::io::stdout());
    while let Some(entry) = stream.next().await {
        let entry = entry?;
        let line = if long {
            long_line(&entry)
        } else {
            entry.file_name.clone()
        };
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
    }
    out.flush().await?;
    Ok(())
}

async fn cat(archive: &Path, name: &str) -> Result<()> {
    let mut stream = pin!(TarReader::new(open_archive(Some(archive)).await?));
    while let Some(entry) = stream.next().await {
        let mut entry = entry?;
        if entry.file_name != name {
            continue;
        }
        if !entry.entry_type.has_data() {
            return Err(anyhow!("{} is a {}, not a file", name, entry.entry_type));
        }
        let mut out = Unblock::new(std::io::stdout());
        io::copy(&mut entry, &mut out).await?;
        out.flush().await?;
        return Ok(());
    }
    Err(anyhow!("{} not found in {}", name, archive.display()))
}

fn archive_name(path: &Path, is_dir: bool) -> String {
    let mut name = path.to_string_lossy().trim_start_matches('/').to_string();
    if is_dir && !name.ends_with('/') {
        name.push('/');
    }
    name
}

async fn collect(builder: &mut TarBuilder<'_>, root: &Path) -> Result<()> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(path) = pending.pop() {
        let md = fs::symlink_metadata(&path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if md.file_type().is_symlink() {
            let target = fs::read_link(&path).await?;
            builder.append(
                archive_name(&path, false),
                EntryOptions::symlink(target.to_string_lossy()),
            )?;
            continue;
        }
        builder.append(archive_name(&path, md.is_dir()), EntryOptions::path(&path))?;
        if md.is_dir() {
            let mut children = Vec::new();
            let mut dir = fs::read_dir(&path).await?;
            while let Some(child) = dir.next().await {
                children.push(child?.path());
            }
            // reversed so that popping yields sorted order
            children.sort_by(|a, b| b.cmp(a));
            pending.extend(children);
        }
    }
    Ok(())
}

async fn create(out: Option<&Path>, paths: &[PathBuf]) -> Result<()> {
    let mut builder = TarBuilder::new();
    for path in paths {
        collect(&mut builder, path).await?;
    }
    tracing::info!(target: "tar", "writing {} entries", builder.len());
    match out {
        Some(out) => {
            let file = fs::File::create(out)
                .await
                .with_context(|| format!("failed to create {}", out.display()))?;
            builder.write_to(file).await?;
        }
        None => {
            builder.write_to(Unblock::new(std::io::stdout())).await?;
        }
    }
    Ok(())
}

async fn cmd(cli: App) -> Result<ExitCode> {
    match cli.cmd {
        Command::List { long, archive } => list(archive.as_deref(), long).await?,
        Command::Create { out, paths } => create(out.as_deref(), &paths).await?,
        Command::Cat { archive, name } => cat(&archive, &name).await?,
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = App::parse();
    if let Err(err) = init(&cli) {
        eprintln!("{}", err);
        return ExitCode::FAILURE;
    }
    match smol::block_on(cmd(cli)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
