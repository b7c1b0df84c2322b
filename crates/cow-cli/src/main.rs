//! # cowblk
//!
//! Command-line interface for the cow-overlay block store.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cow_block::{BlockFlags, BlockId, Store, StoreOptions};
use cow_config::logging::init_logging;
use cow_config::{log_cli_debug, log_cli_error, log_cli_info, BlockSize, Config};

mod gc;

/// Blocks handed to one parallel batch while splitting a file.
const PUT_BATCH: usize = 256;

/// Content-addressed block store for copy-on-write overlays
#[derive(Parser)]
#[command(name = "cowblk")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Load this config file instead of the global and project ones
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Attribute record directory
    #[arg(long, global = true, value_name = "DIR")]
    attribute_dir: Option<PathBuf>,

    /// Block payload directory
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Block size in bytes (accepts 4K, 1M, ...)
    #[arg(long, global = true, value_name = "SIZE")]
    block_size: Option<BlockSize>,

    /// More log output (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store directories and the zero block
    Init,

    /// Split a file into blocks and store them, printing one id per block
    Put {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Fetch blocks and write their concatenated contents
    Get {
        #[arg(value_name = "ID", required = true)]
        ids: Vec<BlockId>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Drop one reference from each block
    Release {
        #[arg(value_name = "ID", required = true)]
        ids: Vec<BlockId>,
    },

    /// Show the attribute record of a block
    Stat {
        #[arg(value_name = "ID")]
        id: BlockId,
    },

    /// Show store occupancy
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Reclaim unreferenced blocks and repair crash leftovers
    Gc(gc::GcArgs),

    /// Re-verify every live block against its identifier
    Scrub,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Show build and format information
    Version,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file locations
    Path,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let mut level = config.log.level;
    for _ in 0..cli.verbose {
        level = level.louder();
    }
    init_logging(level);

    match cli.command {
        Commands::Init => cmd_init(&config),
        Commands::Put { file } => cmd_put(&config, &file),
        Commands::Get { ids, output } => cmd_get(&config, &ids, output),
        Commands::Release { ids } => cmd_release(&config, &ids),
        Commands::Stat { id } => cmd_stat(&config, &id),
        Commands::Stats { json } => cmd_stats(&config, json),
        Commands::Gc(args) => gc::run(&open_store(&config)?, args),
        Commands::Scrub => gc::scrub(&open_store(&config)?),
        Commands::Config { command } => cmd_config(&config, command),
        Commands::Version => {
            println!("cowblk {}", env!("CARGO_PKG_VERSION"));
            println!("store format: v{}", cow_block::layout::FORMAT_VERSION);
            println!("digest: crc64-xz ({} hex chars)", cow_block::ID_HEX_LEN);
            Ok(())
        }
    }
}

/// Config files, then environment, then command-line flags.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => {
            cow_config::reload().context("Failed to load config")?;
            cow_config::config().clone()
        }
    };
    if let Some(dir) = &cli.attribute_dir {
        config.store.attribute_dir = dir.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.store.data_dir = dir.clone();
    }
    if let Some(size) = cli.block_size {
        config.store.block_size = size;
    }
    Ok(config)
}

fn open_store(config: &Config) -> Result<Store> {
    let store = &config.store;
    log_cli_debug!(
        "opening store",
        attribute_dir = display(store.attribute_dir.display()),
        data_dir = display(store.data_dir.display()),
        block_size = store.block_size.get(),
    );
    StoreOptions::new(&store.attribute_dir, &store.data_dir, store.block_size.get())
        .fanout(store.fanout)
        .sync(store.sync)
        .immediate_reclaim(config.reclaim.immediate)
        .open()
        .with_context(|| format!("Failed to open store at {}", store.attribute_dir.display()))
}

fn cmd_init(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    println!("Initialized block store");
    println!("  attributes: {}", store.attribute_dir().display());
    println!("  data:       {}", store.data_dir().display());
    println!("  block size: {}", store.block_size());
    println!("  zero block: {}", store.zero_block_id());
    Ok(())
}

fn cmd_put(config: &Config, file: &Path) -> Result<()> {
    let store = open_store(config)?;
    let input = File::open(file).with_context(|| format!("Failed to open {}", file.display()))?;
    let mut reader = BufReader::new(input);
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let mut total = 0u64;
    let mut blocks = 0u64;
    loop {
        let batch = read_batch(&mut reader, store.block_size(), PUT_BATCH)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        if batch.is_empty() {
            break;
        }
        total += batch.iter().map(|b| b.len() as u64).sum::<u64>();
        blocks += write_ids(&mut out, store.put_batch(&batch), blocks)
            .with_context(|| format!("Failed to store {}", file.display()))?;
    }
    log_cli_info!("file stored", path = display(file.display()), bytes = total, blocks = blocks);
    Ok(())
}

/// Print the id of every block the batch stored, then fail on the first
/// block that was not stored. Stored blocks hold a reference whether or not a
/// sibling failed, so each of their ids is printed.
fn write_ids(
    out: &mut impl Write,
    results: Vec<cow_block::Result<BlockId>>,
    first_index: u64,
) -> Result<u64> {
    let mut written = 0;
    let mut failure = None;
    for (index, result) in (first_index..).zip(results) {
        match result {
            Ok(id) => {
                writeln!(out, "{}", id)?;
                written += 1;
            }
            Err(e) => {
                log_cli_error!("block not stored", index = index, error = display(&e));
                failure.get_or_insert((index, e));
            }
        }
    }
    match failure {
        Some((index, e)) => Err(anyhow::Error::new(e).context(format!("block {} was not stored", index))),
        None => Ok(written),
    }
}

/// Read up to `max` blocks. Only the final block of the input can be short.
fn read_batch(reader: &mut impl Read, block_size: usize, max: usize) -> io::Result<Vec<Vec<u8>>> {
    let mut batch = Vec::new();
    while batch.len() < max {
        let mut block = vec![0u8; block_size];
        let filled = read_full(reader, &mut block)?;
        if filled == 0 {
            break;
        }
        block.truncate(filled);
        batch.push(block);
        if filled < block_size {
            break;
        }
    }
    Ok(batch)
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn cmd_get(config: &Config, ids: &[BlockId], output: Option<PathBuf>) -> Result<()> {
    let store = open_store(config)?;
    let mut out: Box<dyn Write> = match &output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };
    for id in ids {
        let data = store.get(id).with_context(|| format!("Failed to read block {}", id))?;
        out.write_all(&data)?;
    }
    out.flush()?;
    Ok(())
}

fn cmd_release(config: &Config, ids: &[BlockId]) -> Result<()> {
    let store = open_store(config)?;
    for id in ids {
        let remaining = store
            .release(id)
            .with_context(|| format!("Failed to release block {}", id))?;
        println!("{} {}", id, remaining);
    }
    Ok(())
}

fn cmd_stat(config: &Config, id: &BlockId) -> Result<()> {
    let store = open_store(config)?;
    let record = store
        .record(id)?
        .with_context(|| format!("No attribute record for block {}", id))?;

    let mut flags = Vec::new();
    if record.flags.contains(BlockFlags::STANDING) {
        flags.push("standing");
    }
    if record.flags.contains(BlockFlags::SYNCED) {
        flags.push("synced");
    }
    println!("id:         {}", id);
    println!("references: {}", record.reference_count);
    println!("size:       {}", record.size_bytes);
    println!("flags:      {}", if flags.is_empty() { "-".to_string() } else { flags.join(",") });
    if !record.is_live() {
        println!("state:      awaiting reclamation");
    }
    Ok(())
}

fn cmd_stats(config: &Config, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let stats = store.stats()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    gc::print_stats(&stats);
    Ok(())
}

fn cmd_config(config: &Config, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigCommands::Path => {
            match Config::global_config_path() {
                Some(path) => println!("Global:  {}", path.display()),
                None => println!("Global:  (no home directory)"),
            }
            let project = Config::project_config_path();
            let project = fs::canonicalize(&project).unwrap_or(project);
            println!("Project: {}", project.display());
        }
    }
    Ok(())
}
