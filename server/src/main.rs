use clap::Parser;
use log::{info, warn};
use server::config::ServerConfig;
use server::network::Server;
use server::player::PlayerRegistry;
use server::rank::RankGraph;
use server::scheduler::{ScheduledTask, Scheduler};
use server::world::{Map, World, WorldRecord};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Main entry point: loads configuration and ranks, builds the world and
/// its scheduled tasks, then runs the session layer until interrupted.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Path to the JSON configuration file
        #[clap(short, long, default_value = "config.json")]
        config: PathBuf,
        /// Directory holding persisted world metadata
        #[clap(short, long, default_value = ".")]
        data_dir: PathBuf,
    }

    let args = Args::parse();
    let config = ServerConfig::load(&args.config);

    let ranks = load_ranks(&args.data_dir);
    let default_rank = config
        .default_rank
        .as_deref()
        .and_then(|name| ranks.find(name))
        .or_else(|| ranks.lowest())
        .ok_or("no ranks defined")?;
    info!("Default rank for new connections: {}", default_rank.name());

    let build_rank = ranks.lowest().ok_or("no ranks defined")?;
    let registry = Arc::new(PlayerRegistry::new(config.max_players));
    let world = Arc::new(load_world(&args.data_dir, &config, &ranks, build_rank));

    let scheduler = Scheduler::new();

    // The world tick keeps a fixed wall-clock cadence so the drain budget
    // stays aligned with the configured packets-per-second.
    {
        let world = Arc::clone(&world);
        let tick_config = config.clone();
        scheduler.register(
            ScheduledTask::forever("world-tick", config.tick_interval(), move |_| {
                world.tick(&tick_config);
            })
            .drift_corrected(),
        );
    }

    // Periodic metadata save runs off the foreground lane; serialization of
    // a large zone set must not delay the tick.
    {
        let world = Arc::clone(&world);
        let data_dir = args.data_dir.clone();
        scheduler.register(
            ScheduledTask::forever("world-save", Duration::from_secs(60), move |_| {
                save_world(&data_dir, &world);
            })
            .background()
            .with_delay(Duration::from_secs(60)),
        );
    }

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, Arc::clone(&registry), Arc::clone(&world), default_rank).await?;
    let session = server.handle();

    // Idle players are collected on the session loop so the goodbye packet
    // and the roster update happen in one place.
    {
        let session = session.clone();
        scheduler.register(ScheduledTask::forever(
            "idle-kick",
            Duration::from_secs(30),
            move |_| {
                session.kick_idle();
            },
        ));
    }

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            warn!("Session layer failed: {}", e);
        }
    });

    tokio::select! {
        result = server_handle => {
            if let Err(e) = result {
                warn!("Session task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            session.shutdown();
        }
    }

    save_world(&args.data_dir, &world);
    scheduler.shutdown();
    Ok(())
}

fn load_ranks(data_dir: &Path) -> RankGraph {
    let path = data_dir.join("ranks.json");
    match std::fs::read_to_string(&path) {
        Ok(text) => match serde_json::from_str(&text)
            .map_err(|e| e.to_string())
            .and_then(|record| RankGraph::from_record(record).map_err(|e| e.to_string()))
        {
            Ok(graph) if !graph.is_empty() => {
                info!("Loaded {} ranks from {}", graph.len(), path.display());
                graph
            }
            Ok(_) => {
                warn!("Rank file {} defines no ranks; using defaults", path.display());
                RankGraph::with_defaults()
            }
            Err(e) => {
                warn!("Malformed rank file {}: {}; using defaults", path.display(), e);
                RankGraph::with_defaults()
            }
        },
        Err(_) => {
            info!("No rank file at {}; using defaults", path.display());
            RankGraph::with_defaults()
        }
    }
}

fn load_world(
    data_dir: &Path,
    config: &ServerConfig,
    ranks: &RankGraph,
    build_rank: Arc<server::rank::Rank>,
) -> World {
    let ground = config.world_height / 2;
    let map = Map::flat(
        config.world_width,
        config.world_length,
        config.world_height,
        ground,
    );

    let path = data_dir.join(format!("{}.world.json", config.world_name));
    if let Ok(text) = std::fs::read_to_string(&path) {
        match serde_json::from_str::<WorldRecord>(&text) {
            Ok(record) => {
                if let Some(world) = World::from_record(record, map, ranks) {
                    info!("Loaded world metadata from {}", path.display());
                    return world;
                }
            }
            Err(e) => warn!("Malformed world file {}: {}; starting fresh", path.display(), e),
        }
        // The map was consumed only on the success path above.
        let map = Map::flat(
            config.world_width,
            config.world_length,
            config.world_height,
            ground,
        );
        return World::new(&config.world_name, map, build_rank);
    }
    World::new(&config.world_name, map, build_rank)
}

fn save_world(data_dir: &Path, world: &World) {
    let path = data_dir.join(format!("{}.world.json", world.name()));
    let record = world.to_record();
    match serde_json::to_string_pretty(&record) {
        Ok(text) => {
            if let Err(e) = std::fs::write(&path, text) {
                warn!("Failed to save world metadata to {}: {}", path.display(), e);
            }
        }
        Err(e) => warn!("Failed to serialize world metadata: {}", e),
    }
}
