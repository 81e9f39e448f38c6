use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use loqa_voice::{
    create_router, AppState, AudioBackendFactory, AudioSink, AudioSource, Config, ConnectionState,
    NatsConnector, PersonaConfig, PersonaTraits, SessionController, SessionSettings, VoiceId,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "loqa-voice", version, about = "Real-time voice sessions with a remote tutor")]
struct Cli {
    /// Config file (extension optional)
    #[arg(long, default_value = "config/loqa-voice")]
    config: String,

    /// Stream this WAV file instead of the microphone
    #[arg(long, global = true)]
    input_wav: Option<PathBuf>,

    /// Discard incoming speech instead of playing it
    #[arg(long, global = true)]
    no_playback: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP control API
    Serve,
    /// Talk to the tutor until Ctrl-C
    Talk(PersonaArgs),
}

#[derive(Args)]
struct PersonaArgs {
    #[arg(long, value_enum, default_value_t = VoiceId::Puck)]
    voice: VoiceId,

    #[arg(long)]
    name: Option<String>,

    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u8).range(0..=100))]
    strictness: u8,

    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u8).range(0..=100))]
    humor: u8,

    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u8).range(0..=100))]
    verbosity: u8,

    /// Text file with material the tutor should draw on
    #[arg(long)]
    context_file: Option<PathBuf>,
}

impl PersonaArgs {
    fn into_persona(self) -> Result<PersonaConfig> {
        let knowledge_context = match self.context_file {
            Some(path) => Some(
                std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read context file {}", path.display()))?,
            ),
            None => None,
        };

        let traits = PersonaTraits {
            name: self.name,
            strictness: self.strictness,
            humor: self.humor,
            verbosity: self.verbosity,
            knowledge_context,
        };

        Ok(PersonaConfig::from_traits(self.voice, &traits))
    }
}

fn build_controller(cfg: &Config, input_wav: Option<PathBuf>, no_playback: bool) -> Result<SessionController> {
    let source = match input_wav {
        Some(path) => AudioSource::File(path),
        None => AudioSource::Microphone,
    };
    let sink = if no_playback { AudioSink::Null } else { AudioSink::Speakers };

    let capture = AudioBackendFactory::capture(source, cfg.capture_config()).context("Failed to create capture backend")?;
    let output =
        AudioBackendFactory::output(sink, cfg.audio.output_sample_rate).context("Failed to create output backend")?;
    let connector = Arc::new(NatsConnector::new(cfg.transport_config()));

    Ok(SessionController::new(connector, capture, output, SessionSettings::from(cfg)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    info!("Loqa Voice v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);
    info!("Voice service: {} (prefix '{}')", cfg.transport.nats_url, cfg.transport.subject_prefix);

    let controller = build_controller(&cfg, cli.input_wav, cli.no_playback)?;

    match cli.command {
        Command::Serve => serve(&cfg, controller).await,
        Command::Talk(args) => talk(controller, args.into_persona()?).await,
    }
}

async fn serve(cfg: &Config, controller: SessionController) -> Result<()> {
    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("HTTP server listening on {}", addr);

    let app = create_router(AppState::new(controller.clone()));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server failed")?;

    controller.stop().await;
    Ok(())
}

async fn talk(controller: SessionController, persona: PersonaConfig) -> Result<()> {
    controller.start(persona).await.context("Failed to start voice session")?;
    info!("Session running, press Ctrl-C to stop");

    let mut states = controller.subscribe_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if state == ConnectionState::Disconnected {
                    if let Some(error) = controller.last_error() {
                        warn!("Session ended: {}", error);
                    }
                    break;
                }
            }
        }
    }

    controller.stop().await;

    for entry in controller.transcript().await {
        info!("[{:?}] {}", entry.speaker, entry.text);
    }

    Ok(())
}
