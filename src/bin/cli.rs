//! faderboot - firmware updater for the USB Midi-Fader

use clap::{Parser, Subcommand};
use faderboot::{
    BootloaderSession, Context, DeviceConfig, Discovery, ExitOutcome, HexDecoder, Operation,
    Pager, UsbTransport, PAGE_SIZE,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let value = parse_hex_u32(s)?;
    u16::try_from(value).map_err(|_| format!("Value out of range: {}", s))
}

#[derive(Parser)]
#[command(name = "faderboot")]
#[command(author, version, about = "Firmware updater for the USB Midi-Fader", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Give up if no bootloader shows up within this many seconds (default: wait forever)
    #[arg(short, long, global = true)]
    timeout: Option<u64>,

    /// USB vendor ID of the device
    #[arg(long, value_parser = parse_hex_u16, global = true)]
    vid: Option<u16>,

    /// USB product ID of the device
    #[arg(long, value_parser = parse_hex_u16, global = true)]
    pid: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Program an Intel HEX image and start it
    Program {
        /// Image to program
        file: PathBuf,

        /// Vector table address to start the application from (default: start of the image)
        #[arg(long, value_parser = parse_hex_u32)]
        vector: Option<u32>,

        /// Reject records with wrong checksums
        #[arg(long)]
        strict: bool,
    },

    /// Leave the bootloader without starting the application
    Abort,

    /// List connected devices in either mode
    List,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(error) = run(cli) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = DeviceConfig::default();
    if let Some(vid) = cli.vid {
        config.vendor_id = vid;
    }
    if let Some(pid) = cli.pid {
        config.product_id = pid;
    }
    let timeout = cli.timeout.map(Duration::from_secs);

    match cli.command {
        Commands::Program {
            file,
            vector,
            strict,
        } => {
            // Decode everything up front so a broken image never touches the device
            let pager = load_image(&file, strict)?;
            let vector = vector
                .or_else(|| pager.start_address())
                .ok_or("Image contains no data")?;
            info!("Loaded {} pages from {}", pager.len(), file.display());

            let mut session = connect(config, timeout)?;
            session.reset()?;
            program(&mut session, pager)?;
            finish(session.exit(vector)?, "exit")
        }
        Commands::Abort => {
            let mut session = connect(config, timeout)?;
            session.reset()?;
            finish(session.abort()?, "abort")
        }
        Commands::List => {
            let context = Context::new(config)?;
            let devices = context.find_devices()?;
            if devices.is_empty() {
                println!("No devices found");
            }
            for device in devices {
                println!("{}", device);
            }
            Ok(())
        }
    }
}

fn load_image(path: &Path, strict: bool) -> Result<Pager, Box<dyn Error>> {
    let reader = BufReader::new(File::open(path)?);
    let blocks = HexDecoder::new(reader)
        .strict(strict)
        .collect::<faderboot::Result<Vec<_>>>()?;
    Ok(Pager::new(blocks, PAGE_SIZE)?)
}

fn connect(
    config: DeviceConfig,
    timeout: Option<Duration>,
) -> Result<BootloaderSession<UsbTransport<rusb::Context>>, Box<dyn Error>> {
    info!("Waiting for device");
    let context = Context::new(config)?;
    Ok(Discovery::new(context).timeout(timeout).wait()?)
}

fn program(
    session: &mut BootloaderSession<UsbTransport<rusb::Context>>,
    pager: Pager,
) -> Result<(), Box<dyn Error>> {
    let mut operation = session.program_pages(pager);

    let pb = ProgressBar::new(operation.total() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("#>-"),
    );

    for progress in &mut operation {
        pb.set_position(progress? as u64);
    }

    pb.finish_with_message("Programming complete");
    Ok(())
}

fn finish(outcome: ExitOutcome, what: &str) -> Result<(), Box<dyn Error>> {
    match outcome {
        ExitOutcome::DeviceRebooted => {
            info!("Device left the bootloader");
            Ok(())
        }
        ExitOutcome::UnexpectedResponse(status) => Err(format!(
            "Device did not {} (status {})",
            what, status.flags
        )
        .into()),
    }
}
