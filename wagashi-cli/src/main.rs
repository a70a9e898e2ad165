//! wagashi: run one delivery tracker session from the terminal.
//!
//! Without a fragment in the entry URL this process is the driver and walks
//! the configured route; with `#<delivery id>` it watches that driver.
//! `--loopback` runs against an in-process broker and attaches a customer
//! to the local driver, which is handy for trying things out.
//!
//! Commands on stdin: `start`, `stop`, `status`, `link`, `view`, `quit`.

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::Parser;
use directories::ProjectDirs;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use wagashi_track::{
    Broker, Identity, MemoryBroker, PeerStatus, Role, RouteSimulator, SessionEvent, SessionHandle, SessionManager,
    SessionView, TrackerConfig, WsBroker,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Live delivery tracking over direct peer links")]
struct Args {
    /// Entry URL. A `#<delivery id>` fragment joins that delivery as a customer.
    #[arg(default_value = "")]
    entry_url: String,
    /// Configuration file (TOML). Defaults to the platform config directory.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Connection broker URL, overriding the configuration.
    #[arg(long)]
    broker: Option<String>,
    /// Use an in-process broker and attach a local customer.
    #[arg(long)]
    loopback: bool,
    /// Driver id to claim instead of a random one.
    #[arg(long)]
    id: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(args, config))
}

fn load_config(path: Option<&Path>) -> Result<TrackerConfig, Box<dyn Error>> {
    if let Some(path) = path {
        return Ok(TrackerConfig::load(path)?);
    }
    let Some(dirs) = ProjectDirs::from("dev", "wagashi", "wagashi-track") else {
        return Ok(TrackerConfig::default());
    };
    let path = dirs.config_dir().join("config.toml");
    if path.exists() {
        info!("Using configuration at {}", path.display());
        Ok(TrackerConfig::load(path)?)
    } else {
        Ok(TrackerConfig::default())
    }
}

async fn run(args: Args, mut config: TrackerConfig) -> Result<(), Box<dyn Error>> {
    if let Some(url) = args.broker {
        config.broker_url = url;
    }
    let identity = Identity::resolve(&args.entry_url);

    if args.loopback {
        let broker = MemoryBroker::new();
        let mut session = launch(identity, config.clone(), broker.clone(), args.id);
        let companion = if session.role() == Role::Driver {
            let view = session.wait_for(|v| v.share_link().is_some()).await?;
            let link = view.share_link().unwrap_or_default().to_string();
            Some(launch(Identity::resolve(&link), config, broker, None))
        } else {
            None
        };
        drive(session, companion).await
    } else {
        let broker = WsBroker::new(config.broker_url.clone());
        info!("Using broker at {}", broker.url());
        drive(launch(identity, config, broker, args.id), None).await
    }
}

fn launch<B: Broker>(identity: Identity, config: TrackerConfig, broker: B, id: Option<String>) -> SessionHandle {
    let source = RouteSimulator::new(config.route.clone());
    let manager = SessionManager::new(identity, config, broker, source);
    match id {
        Some(id) => manager.with_endpoint_id(id).spawn(),
        None => manager.spawn(),
    }
}

async fn drive(mut session: SessionHandle, mut companion: Option<SessionHandle>) -> Result<(), Box<dyn Error>> {
    report_events(&mut session, "");
    if let Some(customer) = companion.as_mut() {
        report_events(customer, "[customer] ");
        follow(customer);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "" => {}
            "start" => session.start_delivery()?,
            "stop" => session.stop_delivery()?,
            "status" | "ai" => session.request_status_update()?,
            "link" => match session.view().share_link() {
                Some(link) => println!("{link}"),
                None => println!("No delivery id yet"),
            },
            "view" => print_view(&session.view()),
            "quit" | "exit" => break,
            other => println!("Unknown command {other:?} (start, stop, status, link, view, quit)"),
        }
    }

    if let Some(customer) = companion {
        customer.shutdown().await?;
    }
    session.shutdown().await?;
    Ok(())
}

fn report_events(session: &mut SessionHandle, prefix: &'static str) {
    let Some(mut events) = session.take_events() else {
        return;
    };
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Condition(condition) => warn!("{prefix}{condition}"),
                SessionEvent::DeliveryEnded => println!("{prefix}The delivery has ended."),
                SessionEvent::Disconnected => {
                    println!("{prefix}Lost the connection to the driver (delivery ended or link dropped).")
                }
                other => info!("{prefix}{other:?}"),
            }
        }
    });
}

/// Print the customer's view whenever its position or timeline changes.
fn follow(customer: &SessionHandle) {
    let mut view = customer.subscribe();
    tokio::spawn(async move {
        let mut last = (None, 0);
        while view.changed().await.is_ok() {
            let current = view.borrow_and_update().clone();
            let key = (current.coordinates, current.messages.len());
            if key != last {
                last = key;
                print!("[customer] ");
                print_view(&current);
            }
        }
    });
}

fn print_view(view: &SessionView) {
    let position = view
        .coordinates
        .map(|c| format!("{:.5}, {:.5}", c.latitude, c.longitude))
        .unwrap_or_else(|| "unknown".to_string());
    let activity = if view.is_active() { "active" } else { "inactive" };
    println!("{} | {activity} | position {position} | viewers {}", view.status, view.viewer_count);
    if view.status == PeerStatus::ConnectionError {
        if let Some(condition) = &view.condition {
            println!("  ! {condition}");
        }
    }
    for message in view.messages.iter().take(3) {
        println!("  {} [{:?}] {}", message.timestamp, message.kind, message.text);
    }
}
