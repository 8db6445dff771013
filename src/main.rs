mod audio;
mod cancel;
mod chime;
mod connection;
mod countdown;
mod entity_state;
mod error;
mod media_player;
mod notify;
mod ownership;
mod pipeline;
mod playback;
mod satellite;
mod settings;
mod state;
#[cfg(test)]
mod testing;
mod timer;
mod tts;
mod visibility;

use audio::CpalMicrophone;
use clap::Parser;
use connection::ha::HaConnection;
use connection::Transport;
use entity_state::EntityStates;
use ownership::OwnershipArbiter;
use playback::{MediaAuth, RodioPlayer};
use satellite::{Satellite, SatelliteParts};
use settings::Settings;
use state::{AppEvent, MessageStyle};
use std::process::ExitCode;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Parser)]
#[command(name = "voice-satellite", version, about = "Home Assistant voice satellite")]
struct Cli {
    /// Home Assistant base URL
    #[arg(long)]
    url: Option<String>,
    /// Long-lived access token
    #[arg(long, env = "HA_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// assist_satellite entity to drive
    #[arg(long)]
    entity: Option<String>,
    /// Input device name
    #[arg(long)]
    mic: Option<String>,
    #[arg(long)]
    debug: bool,
    /// Write the merged settings back to the settings file
    #[arg(long)]
    save: bool,
    /// Print input devices and exit
    #[arg(long)]
    list_devices: bool,
}

impl Cli {
    fn apply(self, settings: &mut Settings) {
        if let Some(url) = self.url {
            settings.url = url;
        }
        if let Some(token) = self.token {
            settings.access_token = token;
        }
        if let Some(entity) = self.entity {
            settings.satellite_entity = entity;
        }
        if let Some(mic) = self.mic {
            settings.mic_device = mic;
        }
        if self.debug {
            settings.debug = true;
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if cli.list_devices {
        for name in audio::capture::list_input_devices() {
            println!("{}", name);
        }
        return ExitCode::SUCCESS;
    }

    let save = cli.save;
    let mut settings = settings::load();
    cli.apply(&mut settings);
    if save {
        match settings::save(&settings) {
            Ok(()) => log::info!("[settings] saved"),
            Err(e) => log::error!("[settings] {}", e),
        }
    }
    if let Some(field) = settings.missing_field() {
        eprintln!("[voice-satellite] missing setting: {} (see --help)", field);
        return ExitCode::from(2);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("[voice-satellite] failed to create tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("[voice-satellite] {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> error::Result<()> {
    let connection = HaConnection::connect(&settings.url, &settings.access_token).await?;
    let transport: Arc<dyn Transport> = connection;

    let entities = Arc::new(EntityStates::new(&settings.satellite_entity));
    if let Err(e) = entities.load(transport.as_ref()).await {
        log::warn!("[entities] initial load failed: {}", e);
    }
    entities.clone().track(transport.clone());

    let player = RodioPlayer::spawn(MediaAuth {
        base_url: transport.base_url(),
        token: settings.access_token.clone(),
    })
    .map_err(error::SatelliteError::Config)?;

    let (event_tx, event_rx) = std::sync::mpsc::channel::<AppEvent>();
    std::thread::Builder::new()
        .name("console".into())
        .spawn(move || render_events(event_rx))
        .map_err(|e| error::SatelliteError::Config(format!("Failed to spawn console: {}", e)))?;

    let satellite = Satellite::new(SatelliteParts {
        settings,
        transport,
        player: Arc::new(player),
        microphone: Arc::new(CpalMicrophone::new()),
        entities,
        ownership: OwnershipArbiter::new(),
        events: event_tx,
    });

    println!("[voice-satellite] commands: tap, cancel, hide, show, start, timers, cancel-timer <id>, quit");
    satellite.start_listening().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_command(&satellite, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("[console] stdin: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    satellite.shutdown().await;
    Ok(())
}

/// Returns false when the loop should exit.
async fn handle_command(satellite: &Arc<Satellite>, command: &str) -> bool {
    match command {
        "" => {}
        "tap" => {
            satellite.tap();
        }
        "cancel" | "esc" => {
            if !satellite.cancel_interaction() {
                println!("[console] nothing to cancel");
            }
        }
        "hide" | "pause" => satellite.set_hidden(),
        "show" | "resume" => satellite.set_visible(),
        "start" => satellite.start_listening().await,
        "timers" => {
            let timers = satellite.voice_timers();
            if timers.is_empty() {
                println!("[timers] none");
            }
            for t in timers {
                let label = if t.name.is_empty() { t.id.as_str() } else { t.name.as_str() };
                println!("[timers] {} {} ({})", label, countdown::format_time(t.seconds_left), t.id);
            }
        }
        "quit" | "exit" => return false,
        other => match other.strip_prefix("cancel-timer ") {
            Some(id) => {
                if !satellite.cancel_voice_timer(id.trim()) {
                    println!("[timers] no timer {}", id.trim());
                }
            }
            None => println!("[console] unknown command: {}", other),
        },
    }
    true
}

fn render_events(rx: Receiver<AppEvent>) {
    for event in rx {
        match event {
            AppEvent::Phase(phase) => println!("[state] {}", phase.as_str()),
            AppEvent::ErrorBar(true) => println!("[state] service unavailable"),
            AppEvent::ErrorBar(false) => {}
            AppEvent::StartButton { visible: true, reason } => match reason {
                Some(reason) => println!("[start] microphone unavailable ({}); type `start`", reason),
                None => println!("[start] type `start` to begin listening"),
            },
            AppEvent::StartButton { .. } => {}
            AppEvent::Transcript(text) => println!("you: {}", text),
            AppEvent::Response(text) => println!("assistant: {}", text),
            AppEvent::Message { text, style } => match style {
                MessageStyle::Announcement => println!("announcement: {}", text),
                MessageStyle::Assistant => println!("assistant: {}", text),
            },
            AppEvent::TimerAlert(true) => println!("[timers] timer finished; double tap to dismiss"),
            other => log::debug!("[ui] {:?}", other),
        }
    }
}
