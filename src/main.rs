use std::{
    fs,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use anyhow::Context;
use args::Args;
use getopts::Occur;
use glob::glob;
use log::{debug, warn};
use mem_hook::{config::DEFAULT_CHANNEL, report::Outcome, Event, Ring, Tracker};

const PROGRAM_DESC: &str = "Drain and analyze mem_hook allocation events";
const PROGRAM_NAME: &str = "mh_drain";
const LOG_VAR: &str = "MH_LOG";
const SHM_DIR: &str = "/dev/shm";

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or(LOG_VAR, "warn")).init();

    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.flag("h", "help", "Print this message");
    args.option(
        "c",
        "channel",
        "Shared-memory name of the event channel",
        "NAME",
        Occur::Optional,
        Some(DEFAULT_CHANNEL.to_string()),
    );
    args.flag("l", "list", "List the channels present in /dev/shm");
    args.flag("f", "follow", "Keep draining until interrupted");
    args.option(
        "i",
        "interval",
        "Polling interval of --follow when the ring is empty",
        "MS",
        Occur::Optional,
        Some("100".to_string()),
    );
    args.flag("e", "events", "Print every drained event");
    args.option(
        "t",
        "threshold",
        "Hide call sites holding fewer than PCT percent of the surviving allocations",
        "PCT",
        Occur::Optional,
        Some("0".to_string()),
    );
    args.option(
        "y",
        "yaml",
        "Write the surviving allocations to FILE",
        "FILE",
        Occur::Optional,
        None,
    );
    args.flag("u", "unlink", "Remove the channel after draining");

    args.parse_from_cli()?;

    if args.value_of("help")? {
        println!("{}", args.full_usage());
        return Ok(());
    }
    if args.value_of("list")? {
        return list_channels();
    }

    let channel: String = args.value_of("channel")?;
    let follow: bool = args.value_of("follow")?;
    let interval = Duration::from_millis(args.value_of("interval")?);
    let print_events: bool = args.value_of("events")?;
    let threshold: f64 = args.value_of("threshold")?;
    let yaml: Option<String> = args.optional_value_of("yaml")?;

    let ring = Ring::open(&channel).with_context(|| format!("attaching to {}", channel))?;
    debug!("{:?}", ring);

    if follow {
        unsafe { libc::signal(libc::SIGINT, on_interrupt as libc::sighandler_t) };
    }

    let mut tracker = Tracker::new();
    loop {
        let drained = drain(&ring, &mut tracker, print_events);
        if !follow || INTERRUPTED.load(Ordering::SeqCst) {
            break;
        }
        if drained == 0 {
            thread::sleep(interval);
        }
    }

    println!("{}", tracker);
    let mut leaks = String::new();
    tracker.leaks().fmt_with_threshold(threshold, &mut leaks)?;
    println!("\nSurviving allocations by call stack:{}", leaks);

    if let Some(path) = yaml {
        let survivors = serde_yaml::to_string(&tracker.survivors())?;
        fs::write(&path, survivors).with_context(|| format!("writing {}", path))?;
        eprintln!("surviving allocations written to {}", path);
    }

    if args.value_of("unlink")? {
        Ring::unlink(&channel)?;
        eprintln!("removed {}", channel);
    }

    Ok(())
}

// Reads everything currently published.  Returns the number of events read.
fn drain(ring: &Ring, tracker: &mut Tracker, print_events: bool) -> usize {
    let mut drained = 0;
    while let Some(event) = ring.read() {
        let outcome = tracker.observe(&event);
        if print_events {
            println!("{}", format_event(&event, outcome));
        }
        drained += 1;
    }
    if ring.overflow() {
        warn!("producer dropped events: the ring was full");
        tracker.note_overflow();
        ring.reset_overflow();
    }
    drained
}

fn format_event(event: &Event, outcome: Outcome) -> String {
    let kind = event
        .kind()
        .map_or("<unknown>", |kind| kind.entry_point());
    let frames: Vec<String> = event.frames().iter().map(|ip| format!("{:#x}", ip)).collect();
    let note = match outcome {
        Outcome::Allocated { replaced: true } => " (address reused without release)".to_string(),
        Outcome::Released {
            allocated_by,
            lifetime,
            mismatched,
        } => format!(
            " (lived {:?}{})",
            lifetime,
            if mismatched {
                format!(", allocated by {}", allocated_by.entry_point())
            } else {
                String::new()
            }
        ),
        Outcome::Unmatched => " (never allocated)".to_string(),
        Outcome::Allocated { replaced: false } | Outcome::Unknown => String::new(),
    };
    format!(
        "{:>16} {:<12} {:#016x} {:>10}B{} [{}]",
        event.timestamp,
        kind,
        event.address,
        event.size,
        note,
        frames.join(" ")
    )
}

// Every region in /dev/shm that parses as a ring.
fn list_channels() -> Result<(), anyhow::Error> {
    let wildcard = format!("{}/*", SHM_DIR);
    for path in glob(wildcard.as_str())? {
        let path = path?;
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(|n| format!("/{}", n))
        else {
            continue;
        };
        match Ring::open(&name) {
            Ok(ring) => println!(
                "{:<32} {:>10} slots {:>10} unread{}",
                name,
                ring.capacity(),
                ring.len(),
                if ring.overflow() { "  overflowed" } else { "" }
            ),
            Err(e) => debug!("{}: {}", path.display(), e),
        }
    }
    Ok(())
}
