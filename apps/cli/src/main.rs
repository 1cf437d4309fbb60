use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use rigdfu_core::image::{
    ImageContainer, RegionLocator, SegmentRequest, SparseMemoryImage, load_binary_file,
    load_hex_file,
};
use rigdfu_core::profile::{AddressWindow, DeviceProfile, parse_u32};
use rigdfu_core::session::{SessionConfig, UpdateSession, run_with_retries};
use rigdfu_core::signer::{ConfigRecord, ExternalSigner, parse_hex_bytes, parse_mac};
use rigdfu_core::transport::SerialTransport;
use rigdfu_core::TracingObserver;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "RigDFU image builder and serial updater", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv wire trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build an update image from memory dumps
    Genimage(GenimageArgs),
    /// Upload an update image over a serial port
    Update(UpdateArgs),
    /// Rotate the device key and/or MAC address
    Configure(ConfigureArgs),
    /// Show the header of an update image
    Inspect {
        /// Update image file
        infile: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct GenimageArgs {
    /// Device profile: a TOML file or a built-in name
    #[arg(short, long)]
    profile: String,

    /// Intel HEX dumps to merge
    #[arg(long = "hexfile", num_args = 1..)]
    hexfiles: Vec<PathBuf>,

    /// Raw binary dump loaded at an address (FILE@ADDR)
    #[arg(long = "binfile", value_parser = parse_binfile)]
    binfiles: Vec<(PathBuf, u32)>,

    /// Include the softdevice
    #[arg(short = 's', long)]
    softdevice: bool,

    /// Include the bootloader
    #[arg(short = 'b', long)]
    bootloader: bool,

    /// Include the application
    #[arg(short = 'a', long)]
    application: bool,

    /// Fixed softdevice window (LOW-HIGH)
    #[arg(short = 'S', long)]
    softdevice_addr: Option<AddressWindow>,

    /// Fixed bootloader window (LOW-HIGH)
    #[arg(short = 'B', long)]
    bootloader_addr: Option<AddressWindow>,

    /// Fixed application window (LOW-HIGH)
    #[arg(short = 'A', long)]
    application_addr: Option<AddressWindow>,

    /// Output image file
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(clap::Args, Debug)]
struct SerialArgs {
    /// Serial port, e.g. /dev/ttyUSB0
    #[arg(short = 'p', long)]
    port: Option<String>,

    /// Baud rate
    #[arg(long)]
    baud: Option<usize>,

    /// Session settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct UpdateArgs {
    #[command(flatten)]
    serial: SerialArgs,

    /// Update image file
    #[arg(short, long)]
    infile: PathBuf,

    /// Restart a failed update this many times
    #[arg(long)]
    retries: Option<u32>,
}

#[derive(clap::Args, Debug)]
struct ConfigureArgs {
    #[command(flatten)]
    serial: SerialArgs,

    /// Current device key (hex)
    #[arg(long)]
    oldkey: String,

    /// New device key (hex)
    #[arg(long)]
    newkey: Option<String>,

    /// New MAC address, most significant byte first
    #[arg(long)]
    newmac: Option<String>,

    /// Image signing executable
    #[arg(long)]
    signer: Option<PathBuf>,
}

fn parse_binfile(s: &str) -> Result<(PathBuf, u32), String> {
    let (path, addr) = s
        .rsplit_once('@')
        .ok_or_else(|| format!("expected FILE@ADDR, got '{s}'"))?;
    let addr = parse_u32(addr).ok_or_else(|| format!("invalid address '{addr}'"))?;
    Ok((PathBuf::from(path), addr))
}

fn load_profile(name: &str) -> Result<DeviceProfile> {
    if Path::new(name).exists() {
        DeviceProfile::load_from_file(name).with_context(|| format!("loading profile {name}"))
    } else {
        DeviceProfile::builtin(name)
    }
}

fn session_config(args: &SerialArgs) -> Result<(SessionConfig, String)> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(port) = &args.port {
        config.port = Some(port.clone());
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    let Some(port) = config.port.clone() else {
        bail!("no serial port given");
    };
    Ok((config, port))
}

fn genimage(args: GenimageArgs) -> Result<()> {
    let profile = load_profile(&args.profile)?;

    let mut sources = Vec::new();
    for path in &args.hexfiles {
        sources.push(load_hex_file(path).with_context(|| format!("reading {}", path.display()))?);
    }
    for (path, base) in &args.binfiles {
        sources.push(
            load_binary_file(path, *base).with_context(|| format!("reading {}", path.display()))?,
        );
    }
    if sources.is_empty() {
        bail!("no input files");
    }
    let image = SparseMemoryImage::merge(sources)?;

    let request = SegmentRequest {
        include_softdevice: args.softdevice,
        include_bootloader: args.bootloader,
        include_application: args.application,
        softdevice_window: args.softdevice_addr,
        bootloader_window: args.bootloader_addr,
        application_window: args.application_addr,
    };
    let layout = RegionLocator::new(&image, &profile).resolve(&request)?;

    let container = ImageContainer::build(&layout, &image);
    let written = container
        .save_to_file(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    info!("Wrote {} bytes to {}", written, args.output.display());
    Ok(())
}

fn update(args: UpdateArgs) -> Result<()> {
    let (mut config, port) = session_config(&args.serial)?;
    if let Some(retries) = args.retries {
        config.retries = retries;
    }
    let container = ImageContainer::load_from_file(&args.infile)
        .with_context(|| format!("reading {}", args.infile.display()))?;

    let baud = config.baud_rate;
    run_with_retries(
        || SerialTransport::open(&port, baud),
        &container,
        &config,
        Arc::new(TracingObserver),
    )?;
    info!("Update complete");
    Ok(())
}

fn configure(args: ConfigureArgs) -> Result<()> {
    if args.newkey.is_none() && args.newmac.is_none() {
        bail!("nothing to configure, give --newkey and/or --newmac");
    }
    let (config, port) = session_config(&args.serial)?;

    let record = ConfigRecord {
        old_key: parse_hex_bytes(&args.oldkey)?,
        new_key: args
            .newkey
            .as_deref()
            .map(parse_hex_bytes)
            .transpose()?
            .unwrap_or_default(),
        mac: args.newmac.as_deref().map(parse_mac).transpose()?.unwrap_or_default(),
    };
    let Some(program) = args.signer.or_else(|| config.signer_path.clone()) else {
        bail!("no signer given");
    };
    let signer = ExternalSigner::new(program);

    let transport = SerialTransport::open(&port, config.baud_rate)?;
    UpdateSession::new(transport, config).configure(&record, &signer)?;
    info!("Configuration complete");
    Ok(())
}

fn inspect(infile: &Path) -> Result<()> {
    let container = ImageContainer::load_from_file(infile)
        .with_context(|| format!("reading {}", infile.display()))?;
    print!("{}", describe(&container));
    Ok(())
}

fn describe(container: &ImageContainer) -> String {
    let header = &container.header;
    format!(
        "softdevice:  {} bytes\nbootloader:  {} bytes\napplication: {} bytes\niv:  {}\ntag: {}\n",
        header.softdevice_len,
        header.bootloader_len,
        header.application_len,
        hex::encode_upper(container.iv),
        hex::encode_upper(container.tag),
    )
}

fn log_level(cli: &Cli) -> tracing::Level {
    if cli.quiet {
        return tracing::Level::WARN;
    }
    match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Genimage(args) => genimage(args),
        Command::Update(args) => update(args),
        Command::Configure(args) => configure(args),
        Command::Inspect { infile } => inspect(&infile),
    }
}

fn main() {
    let cli = Cli::parse();

    let level = log_level(&cli);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
