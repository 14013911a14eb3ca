use async_trait::async_trait;
use call_lifecycle::calls::{
    CallDependencies, CallHandle, CallService, IncomingCallPayload, Navigator, NotificationRecorder,
    PushNotifier, SignalingEvent, signaling,
};
use call_lifecycle::config::{BackendConfig, CallConfig};
use call_lifecycle::realtime::{
    ChannelGateway, ChannelMessage, InMemoryRealtime, PhoenixConfig, PhoenixTransport,
    RealtimeTransport,
};
use call_lifecycle::store::{MemoryNotificationStore, RestNotificationRecorder};
use call_lifecycle::{CallError, ToneEngine};
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

// Rings for incoming video calls on the terminal.
//
// Usage:
//   cargo run                                        # simulated call from "Alex" after 1s
//   cargo run -- --caller-name Sam --delay-ms 0      # different caller, immediately
//   REALTIME_URL=https://... REALTIME_API_KEY=... cargo run -- --user <id>
//
// While ringing, type `a` to answer or `d` to decline. `q` or Ctrl-C quits.

#[derive(Parser, Debug)]
#[command(name = "call-lifecycle", about = "Incoming video-call ringer")]
struct Args {
    /// Id of the user receiving calls.
    #[arg(short, long, default_value = "me")]
    user: String,

    /// Caller id of the simulated call (in-memory mode only).
    #[arg(long, default_value = "u1")]
    caller_id: String,

    #[arg(long, default_value = "Alex")]
    caller_name: String,

    #[arg(long, default_value = "r1")]
    room: String,

    /// Delay before the simulated call arrives.
    #[arg(long, default_value_t = 1_000)]
    delay_ms: u64,

    /// Do not simulate a call; just listen.
    #[arg(long)]
    no_simulate: bool,
}

struct LogPush;

#[async_trait]
impl PushNotifier for LogPush {
    async fn notify_incoming(
        &self,
        caller_name: &str,
        room_id: &str,
        _caller_id: &str,
    ) -> Result<(), anyhow::Error> {
        info!(target: "Demo/Push", "📞 {caller_name} is calling you (room {room_id})");
        Ok(())
    }

    async fn notify_missed(&self, caller_name: &str, room_id: &str) -> Result<(), anyhow::Error> {
        info!(target: "Demo/Push", "You missed a call from {caller_name} (room {room_id})");
        Ok(())
    }
}

struct LogNavigator;

impl Navigator for LogNavigator {
    fn go_to_room(&self, room_id: &str) {
        info!(target: "Demo/Navigator", "➡️  Joining /room/{room_id}");
    }
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            return;
        }
    };

    if let Err(e) = rt.block_on(run(args)) {
        error!("{e:#}");
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let config = CallConfig::from_env()?;
    let tone = Arc::new(ToneEngine::system());

    let (transport, recorder, simulator): (
        Arc<dyn RealtimeTransport>,
        Arc<dyn NotificationRecorder>,
        Option<Arc<dyn RealtimeTransport>>,
    ) = match BackendConfig::from_env() {
        Some(backend) => {
            info!("Connecting to {}", backend.url);
            let phoenix = PhoenixTransport::connect_or_offline(PhoenixConfig::new(
                &backend.url,
                &backend.api_key,
            ))
            .await;
            (
                phoenix,
                Arc::new(RestNotificationRecorder::new(&backend)) as Arc<dyn NotificationRecorder>,
                None,
            )
        }
        None => {
            info!("No backend configured, using the in-memory hub");
            let hub = InMemoryRealtime::new();
            (
                hub.client() as Arc<dyn RealtimeTransport>,
                Arc::new(MemoryNotificationStore::new()) as Arc<dyn NotificationRecorder>,
                Some(hub.client() as Arc<dyn RealtimeTransport>),
            )
        }
    };

    let deps = CallDependencies {
        gateway: Arc::new(ChannelGateway::new(transport)),
        tone,
        recorder,
        push: Arc::new(LogPush),
        navigator: Arc::new(LogNavigator),
    };
    let service = CallService::start(config, &args.user, deps).await?;
    let handle = service.handle();
    tokio::spawn(log_transitions(handle.clone()));

    if let Some(caller) = simulator.filter(|_| !args.no_simulate) {
        let payload = IncomingCallPayload {
            caller_id: args.caller_id.clone(),
            caller_name: args.caller_name.clone(),
            room_id: args.room.clone(),
        };
        let topic = signaling::user_channel_topic(&args.user);
        let delay = Duration::from_millis(args.delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let message = match serde_json::to_value(&payload) {
                Ok(value) => ChannelMessage::new(SignalingEvent::IncomingCall.event_name(), value),
                Err(e) => {
                    warn!("Could not encode simulated call: {e}");
                    return;
                }
            };
            if let Err(e) = caller.publish(&topic, message).await {
                warn!("Simulated call failed: {e}");
            }
        });
    }

    info!("Type `a` to answer, `d` to decline, `q` to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => {
                        stdin_open = false;
                        continue;
                    }
                };
                let result = match line.trim() {
                    "a" => handle.answer(),
                    "d" => handle.decline(),
                    "q" => break,
                    "" => continue,
                    other => {
                        warn!("Unknown command {other:?}");
                        continue;
                    }
                };
                if let Err(CallError::ControllerStopped) = result {
                    break;
                }
            }
        }
    }

    service.shutdown().await;
    Ok(())
}

async fn log_transitions(handle: CallHandle) {
    let mut transitions = handle.subscribe_transitions();
    while let Ok(transition) = transitions.recv().await {
        info!(
            target: "Demo",
            "{} -> {}{}",
            transition.from,
            transition.to,
            transition
                .room_id
                .map(|room| format!(" (room {room})"))
                .unwrap_or_default()
        );
    }
}
