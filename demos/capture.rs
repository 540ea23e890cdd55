// Capture example
//
// This example runs one acquisition on a logic analyzer (or replays a saved
// session) and prints the captured samples as a table.

use clap::{Parser, ValueEnum};
use la_capture::{
    session, ChronoVuLa8, ConfigValue, Datastore, DeviceIndex, DirectoryArchive, Driver,
    InfoField, InfoValue, LogicSniffer, Probe, SerialOpener, Session, SessionReplay, SnifferOptions,
};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DriverKind {
    /// ChronoVu LA8 (8 channels)
    La8,
    /// Openbench Logic Sniffer / SUMP (32 channels)
    Sump,
    /// Replay a capture from an unpacked session directory
    Replay,
}

#[derive(Parser)]
#[command(name = "capture")]
#[command(version = "1.0")]
#[command(about = "Capture logic samples from a device")]
#[command(long_about = "Run a single acquisition on a ChronoVu LA8, a SUMP-compatible analyzer or a saved session and print the samples.")]
struct Args {
    /// Driver to use
    #[arg(value_enum)]
    driver: DriverKind,

    /// Serial port (or session directory for replay); scans all ports when omitted
    #[arg(short, long)]
    port: Option<String>,

    /// Sample rate in Hz
    #[arg(short, long)]
    samplerate: Option<u64>,

    /// Number of samples to capture
    #[arg(short, long)]
    limit: Option<u64>,

    /// Pre-trigger capture ratio in percent
    #[arg(short = 'r', long)]
    capture_ratio: Option<u32>,

    /// Trigger as PROBE=LEVELS, e.g. 1=1 or 3=01 (one level per stage)
    #[arg(short, long, value_parser = parse_trigger)]
    trigger: Vec<(u32, String)>,

    /// Enable run-length encoding (SUMP only)
    #[arg(long)]
    rle: bool,

    /// Capture entry inside the session (replay only)
    #[arg(long, default_value = "logic-1")]
    entry: String,

    /// Bytes per sample in the session (replay only)
    #[arg(long, default_value_t = 1)]
    unitsize: u64,

    /// Number of rows to print
    #[arg(long, default_value_t = 10)]
    rows: usize,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn parse_trigger(value: &str) -> Result<(u32, String), String> {
    let (probe, levels) = value
        .split_once('=')
        .ok_or_else(|| format!("expected PROBE=LEVELS, got '{}'", value))?;
    let probe = probe
        .parse()
        .map_err(|e| format!("invalid probe '{}': {}", probe, e))?;
    Ok((probe, levels.to_string()))
}

fn probe_config(num_probes: u32, triggers: &[(u32, String)]) -> Vec<Probe> {
    (1..=num_probes)
        .map(|index| match triggers.iter().find(|(probe, _)| *probe == index) {
            Some((_, levels)) => Probe::with_trigger(index, levels),
            None => Probe::new(index),
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let device = DeviceIndex(0);
    let port = args.port.as_deref();
    let (mut driver, found, unit_size): (Box<dyn Driver>, usize, usize) = match args.driver {
        DriverKind::La8 => {
            let mut la8 = ChronoVuLa8::new(Box::new(SerialOpener));
            let found = la8.init(port)?;
            (Box::new(la8), found, 1)
        }
        DriverKind::Sump => {
            let mut sniffer = LogicSniffer::new(Box::new(SerialOpener));
            let found = sniffer.init(port)?;
            if found > 0 {
                sniffer.set_options(
                    device,
                    SnifferOptions {
                        rle: args.rle,
                        ..SnifferOptions::default()
                    },
                )?;
            }
            (Box::new(sniffer), found, 4)
        }
        DriverKind::Replay => {
            let mut replay = SessionReplay::new(Box::new(DirectoryArchive));
            // Replay instances are created on open.
            replay.init(port)?;
            (Box::new(replay), 1, args.unitsize as usize)
        }
    };
    if found == 0 {
        eprintln!("No {} found", driver.long_name());
        std::process::exit(1);
    }

    driver.open(device)?;
    println!("✓ Opened {}", driver.long_name());

    if args.driver == DriverKind::Replay {
        driver.set_configuration(device, ConfigValue::CaptureFile(args.entry.clone()))?;
        driver.set_configuration(device, ConfigValue::CaptureUnitsize(args.unitsize))?;
    }
    if let Some(samplerate) = args.samplerate {
        driver.set_configuration(device, ConfigValue::Samplerate(samplerate))?;
    }
    if let Some(limit) = args.limit {
        if args.driver != DriverKind::Replay {
            driver.set_configuration(device, ConfigValue::LimitSamples(limit))?;
        }
    }
    if let Some(ratio) = args.capture_ratio {
        driver.set_configuration(device, ConfigValue::CaptureRatio(ratio.to_string()))?;
    }
    let num_probes = match driver.get_info(device, InfoField::NumProbes) {
        Some(InfoValue::Count(count)) => count,
        _ => (unit_size * 8) as u32,
    };
    driver.set_configuration(
        device,
        ConfigValue::ProbeConfig(probe_config(num_probes, &args.trigger)),
    )?;

    let store = Rc::new(RefCell::new(Datastore::new(unit_size)?));
    let mut capture = Session::new(session::shared(&store));
    let id = capture.add_driver(driver);

    let start_time = std::time::Instant::now();
    capture.start(id, device)?;
    capture.run()?;
    let elapsed = start_time.elapsed();

    let store = store.borrow();
    println!(
        "Captured {} samples in {:.2}s",
        store.num_units(),
        elapsed.as_secs_f64()
    );
    for trigger in store.triggers() {
        println!("Trigger at sample {}", trigger);
    }

    let df = store.to_dataframe()?;
    println!("{}", df.head(Some(args.rows)));

    if let Some(driver) = capture.driver_mut(id) {
        driver.close(device)?;
    }
    Ok(())
}
