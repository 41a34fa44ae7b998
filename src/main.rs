use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pokedex_sync::config::{self, Config};
use pokedex_sync::context::AppContext;
use pokedex_sync::gateway::{RemoteGateway, RestGateway};
use pokedex_sync::models::Collection;
use pokedex_sync::queue::{CatchArgs, ReleaseArgs};

/// How often the watch loop checks for changes to print
const WATCH_TICK_MS: u64 = 250;

#[derive(Parser, Debug)]
#[command(name = "pokedex")]
#[command(about = "Offline-first Pokedex client with a durable sync queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pokedex-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// User id to act as (overrides user_id from the config file)
  #[arg(short, long)]
  user: Option<String>,

  /// Start offline: reads come from the local store and writes are queued
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List the catalog
  Pokemons,
  /// Show one pokemon with its types and base stats
  Show { id: i64 },
  /// List the pokemon the user has caught
  Pokedex,
  /// Catch a pokemon
  Catch {
    pokemon_id: i64,
    #[arg(short, long)]
    nickname: Option<String>,
  },
  /// Release a caught pokemon
  Release { pokemon_id: i64 },
  /// Show operations waiting to be synced
  Pending,
  /// Replay pending operations now
  Sync,
  /// Drop pending operations without syncing them
  Discard,
  /// Show connection and sync status
  Status,
  /// Probe connectivity and sync on reconnect until interrupted
  Watch,
}

/// Initialize file logging. Stdout is reserved for command output.
///
/// Use RUST_LOG to control the level (e.g. RUST_LOG=pokedex_sync=debug).
fn init_tracing() -> Result<WorkerGuard> {
  let log_dir = config::data_dir()?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "pokedex.log"));
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing()?;

  let config = Config::load(args.config.as_deref())?;

  // Override user if specified on command line
  let config = if let Some(user) = args.user {
    Config {
      user_id: Some(user),
      ..config
    }
  } else {
    config
  };

  let gateway: Arc<dyn RemoteGateway> =
    Arc::new(RestGateway::new(&config.remote, Config::get_api_key()?)?);
  let online = !args.offline && gateway.ping().await.is_ok();

  let ctx = AppContext::from_config(&config, gateway.clone(), online)?;
  let restored = ctx.restore_query_cache();
  info!(online, restored, "pokedex starting");

  let result = run(&ctx, &config, gateway, args.command).await;
  ctx.persist_query_cache();
  result
}

fn require_user(config: &Config) -> Result<&str> {
  config
    .user_id
    .as_deref()
    .filter(|user| !user.is_empty())
    .ok_or_else(|| eyre!("No user id. Pass --user or set user_id in the config file."))
}

async fn run(
  ctx: &AppContext,
  config: &Config,
  gateway: Arc<dyn RemoteGateway>,
  command: Command,
) -> Result<()> {
  match command {
    Command::Pokemons => {
      for pokemon in ctx.pokemons().await? {
        println!(
          "{:>4}  {:<14} {}",
          pokemon.id,
          pokemon.name,
          pokemon.primary_type.as_deref().unwrap_or("-")
        );
      }
    }

    Command::Show { id } => {
      let pokemon = ctx
        .pokemon(id)
        .await?
        .ok_or_else(|| eyre!("Pokemon {} not found", id))?;
      let types = ctx.pokemon_types(id).await?;
      let stats = ctx.pokemon_stats(id).await?;

      println!("#{} {}", pokemon.id, pokemon.name);
      if !types.is_empty() {
        let names: Vec<&str> = types.iter().map(|t| t.type_name.as_str()).collect();
        println!("Types: {}", names.join(", "));
      }
      if let Some(text) = &pokemon.flavor_text {
        println!("{}", text);
      }
      for stat in stats {
        println!("  {:<16} {:>3}", stat.stat_name, stat.base_stat);
      }
    }

    Command::Pokedex => {
      let user = require_user(config)?;
      let entries = ctx.pokedex(user).await?;
      if entries.is_empty() {
        println!("No pokemon caught yet");
      }
      for entry in entries {
        let name = entry
          .pokemon
          .as_ref()
          .map(|p| p.name.as_str())
          .unwrap_or("?");
        let caught = entry
          .caught_at
          .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
          .unwrap_or_default();
        println!(
          "{:>4}  {:<14} {:<14} {}",
          entry.pokemon_id,
          name,
          entry.nickname.as_deref().unwrap_or(""),
          caught
        );
      }
    }

    Command::Catch {
      pokemon_id,
      nickname,
    } => {
      let args = CatchArgs {
        user_id: require_user(config)?.to_string(),
        pokemon_id,
        nickname,
      };
      match ctx.catch_mutation().mutate_async(args).await {
        Ok(entry) => println!("Caught pokemon {}", entry.pokemon_id),
        Err(e) if e.is_queued() => println!("Catch queued for sync ({})", e),
        Err(e) => return Err(e.into()),
      }
    }

    Command::Release { pokemon_id } => {
      let args = ReleaseArgs {
        user_id: require_user(config)?.to_string(),
        pokemon_id,
      };
      match ctx.release_mutation().mutate_async(args).await {
        Ok(()) => println!("Released pokemon {}", pokemon_id),
        Err(e) if e.is_queued() => println!("Release queued for sync ({})", e),
        Err(e) => return Err(e.into()),
      }
    }

    Command::Pending => {
      let operations = ctx.queue().snapshot();
      if operations.is_empty() {
        println!("No pending operations");
      }
      for op in operations {
        println!(
          "{:>4}  {:<16} retries={}  {}  {}",
          op.id,
          op.kind,
          op.retry_count,
          op.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
          op.payload
        );
      }
    }

    Command::Sync => {
      let report = ctx.sync_engine().drain_with_report().await;
      println!(
        "Synced {} of {} operations ({} kept for retry, {} dropped)",
        report.succeeded, report.attempted, report.retried, report.dropped
      );
    }

    Command::Discard => {
      let count = ctx.queue().len();
      if !ctx.queue().clear() {
        return Err(eyre!("Failed to clear pending operations"));
      }
      println!("Discarded {} pending operations", count);
    }

    Command::Status => {
      let status = ctx.connectivity().status();
      println!("{}", status.label);
      println!("Pending operations: {}", ctx.queue().len());
      for collection in Collection::all() {
        match ctx.store().sync_metadata(collection) {
          Some(meta) => println!(
            "  {:<14} last synced {}",
            collection,
            meta.last_synced_at.format("%Y-%m-%d %H:%M:%S")
          ),
          None => println!("  {:<14} never synced", collection),
        }
      }
    }

    Command::Watch => watch(ctx, config, gateway).await?,
  }

  Ok(())
}

async fn watch(ctx: &AppContext, config: &Config, gateway: Arc<dyn RemoteGateway>) -> Result<()> {
  let events = ctx
    .connectivity()
    .take_events()
    .ok_or_else(|| eyre!("Connectivity events already taken"))?;

  if ctx.connectivity().is_online() {
    ctx.sync_engine().drain().await;
  }

  let engine = ctx.sync_engine();
  let sync = tokio::spawn(async move { engine.run(events).await });
  let probe = tokio::spawn(
    ctx
      .connectivity()
      .clone()
      .probe_loop(gateway, ctx.sync_config().probe_interval()),
  );

  let mut query = config.user_id.as_deref().map(|user| ctx.pokedex_query(user));
  if let Some(query) = query.as_mut() {
    query.fetch();
  }

  println!("{}. Watching, press Ctrl-C to stop", ctx.connectivity().status().label);
  let mut last_online = ctx.connectivity().is_online();
  let mut ticker = tokio::time::interval(Duration::from_millis(WATCH_TICK_MS));
  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);

  loop {
    tokio::select! {
      _ = &mut ctrl_c => break,
      _ = ticker.tick() => {
        let status = ctx.connectivity().status();
        if status.is_online != last_online {
          last_online = status.is_online;
          println!("{}", status.label);
        }

        if let Some(query) = query.as_mut() {
          if query.poll() {
            match (query.data(), query.error()) {
              (Some(entries), _) => println!("Pokedex: {} caught", entries.len()),
              (None, Some(e)) => println!("Pokedex unavailable: {}", e),
              _ => {}
            }
          }
        }
      }
    }
  }

  probe.abort();
  sync.abort();
  Ok(())
}
