use clap::Parser;
use client::game::ClientGameState;
use client::input::BotInput;
use client::network::{discover, NetworkClient};
use log::{info, warn};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Matchmaker address used to find a game server
    #[arg(short = 'm', long, default_value = "127.0.0.1:32232")]
    matchmaker: String,

    /// Connect to this game server directly, skipping discovery
    #[arg(short = 's', long)]
    server: Option<String>,

    /// Frames to play before leaving (0 plays until disconnected)
    #[arg(short = 't', long, default_value_t = 600)]
    ticks: u64,

    /// Frames per second
    #[arg(short = 'f', long, default_value_t = 60)]
    fps: u32,

    /// Fire every N frames (0 never fires)
    #[arg(long, default_value_t = 30)]
    shoot_every: u64,

    /// Change direction every N frames
    #[arg(long, default_value_t = 60)]
    turn_every: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let address = match args.server {
        Some(server) => server,
        None => discover(&args.matchmaker).await?.address(),
    };

    let (network, greeting) = NetworkClient::connect(&address).await?;
    let mut game = ClientGameState::from_greeting(&greeting)?;
    let mut input = BotInput::new(args.turn_every, args.shoot_every);

    let fps = args.fps.max(1);
    let dt = 1.0 / fps as f32;
    let mut interval = tokio::time::interval(Duration::from_secs_f32(dt));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!("Playing as {} at {} fps", game.player_id(), fps);

    let mut frame: u64 = 0;
    while args.ticks == 0 || frame < args.ticks {
        interval.tick().await;

        game.process_messages(network.queue());
        if !game.is_alive() || !network.is_alive() {
            info!("Session ended after {} frames", frame);
            break;
        }

        let frame_input = input.update();
        let mut outgoing = Vec::with_capacity(2);
        outgoing.extend(game.step_local_player(frame_input.direction, dt));
        if let Some(aim) = frame_input.shoot {
            outgoing.extend(game.shoot_request(aim));
        }
        for message in &outgoing {
            if let Err(e) = network.send(message) {
                warn!("Failed to send {}: {}", message.kind(), e);
            }
        }

        game.flush_removals();

        if frame % 300 == 0 {
            info!(
                "Frame {}: {} players, {} projectiles, at {:?}",
                frame,
                game.player_ids().len(),
                game.projectile_ids().len(),
                game.local_position()
            );
        }
        frame += 1;
    }

    network.close();
    // Let the writer flush before the runtime shuts down.
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!("Client stopped");
    Ok(())
}
